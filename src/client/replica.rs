//! Snapshot buffering and time-shifted interpolation
//!
//! Snapshots are stored against *adjusted* time: the host's server time plus
//! a clock offset measured once at `welcome`. Rendering samples the buffer at
//! `now - render_delay`, which normally sits between two buffered snapshots.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use glam::{Quat, Vec3};
use tracing::{debug, trace};

use crate::game::vehicle::VehicleTuning;
use crate::ws::protocol::{EntityId, EntityState, Snapshot};

/// Snapshots kept at most (4.5 s at 20 Hz)
pub const BUFFER_CAPACITY: usize = 90;
pub const DEFAULT_RENDER_DELAY: Duration = Duration::from_millis(120);
/// How far past the newest snapshot poses are projected
pub const DEFAULT_EXTRAPOLATION_LIMIT: Duration = Duration::from_millis(100);

/// A snapshot placed on the local timeline
#[derive(Debug, Clone)]
pub struct BufferedSnapshot {
    /// Server time plus clock offset, in local milliseconds
    pub adjusted: f64,
    pub snapshot: Snapshot,
}

/// Bounded buffer, sorted ascending by adjusted time, one entry per tick
#[derive(Debug)]
pub struct SnapshotBuffer {
    entries: VecDeque<BufferedSnapshot>,
    capacity: usize,
}

impl Default for SnapshotBuffer {
    fn default() -> Self {
        Self::new(BUFFER_CAPACITY)
    }
}

impl SnapshotBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(2),
        }
    }

    /// Insert in time order. A tick already buffered is rejected.
    pub fn push(&mut self, snapshot: Snapshot, adjusted: f64) -> bool {
        if self.entries.iter().any(|e| e.snapshot.tick == snapshot.tick) {
            return false;
        }
        let index = self.entries.partition_point(|e| e.adjusted <= adjusted);
        self.entries
            .insert(index, BufferedSnapshot { adjusted, snapshot });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        true
    }

    /// Drop entries the render time has moved past, keeping one past snapshot
    pub fn prune(&mut self, render_time: f64) {
        while self.entries.len() > 2 && self.entries[1].adjusted <= render_time {
            self.entries.pop_front();
        }
    }

    /// `prev` = front, `next` = first entry at or after `render_time`, else the last
    pub fn pair(&self, render_time: f64) -> Option<(&BufferedSnapshot, &BufferedSnapshot)> {
        let prev = self.entries.front()?;
        let next = self
            .entries
            .iter()
            .find(|e| e.adjusted >= render_time)
            .or_else(|| self.entries.back())?;
        Some((prev, next))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferedSnapshot> {
        self.entries.iter()
    }
}

/// `clamp((render - prev) / max(1, next - prev), 0, 1)`
pub fn interpolation_alpha(render_time: f64, prev_time: f64, next_time: f64) -> f32 {
    let span = (next_time - prev_time).max(1.0);
    ((render_time - prev_time) / span).clamp(0.0, 1.0) as f32
}

/// Interpolated kinematic state of one entity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blended {
    pub position: Vec3,
    pub orientation: Quat,
    pub velocity: Vec3,
    pub angular_velocity: Vec3,
}

/// Blend two records of the same entity. A missing side takes the other's value.
pub fn blend_states(
    prev: Option<&EntityState>,
    next: Option<&EntityState>,
    alpha: f32,
) -> Option<Blended> {
    let (a, b) = match (prev, next) {
        (Some(a), Some(b)) => (a, b),
        (Some(a), None) => (a, a),
        (None, Some(b)) => (b, b),
        (None, None) => return None,
    };
    Some(Blended {
        position: a.p.lerp(b.p, alpha),
        // glam's slerp takes the shortest path
        orientation: a.q.normalize().slerp(b.q.normalize(), alpha),
        velocity: a.v.lerp(b.v, alpha),
        angular_velocity: a.w.lerp(b.w, alpha),
    })
}

/// Pose handed to rendering once per frame
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPose {
    pub id: EntityId,
    pub position: Vec3,
    pub orientation: Quat,
    /// Visual only (wheel spin)
    pub speed: f32,
    /// Front wheel angle in radians
    pub steering: f32,
    pub braking: bool,
}

/// Speed drop per second above which brake lights show
const BRAKE_DECEL_THRESHOLD: f32 = 4.0;

impl RenderPose {
    /// Derive the auxiliary scalars from replicated velocities
    fn from_blended(id: &str, blended: Blended, decel: f32, tuning: &VehicleTuning) -> Self {
        // Positive steer yaws negatively about +Y
        let yaw_share = (blended.angular_velocity.y / tuning.max_yaw_rate).clamp(-1.0, 1.0);
        Self {
            id: id.to_string(),
            position: blended.position,
            orientation: blended.orientation,
            speed: blended.velocity.length(),
            steering: -yaw_share * tuning.max_steer_angle,
            braking: decel > BRAKE_DECEL_THRESHOLD,
        }
    }
}

/// Client-side mirror of the host world
#[derive(Debug)]
pub struct ClientReplica {
    buffer: SnapshotBuffer,
    render_delay_ms: f64,
    extrapolation_limit_ms: f64,
    clock_offset: Option<f64>,
    instantiated: HashSet<EntityId>,
    requested: HashSet<EntityId>,
    pending_spawns: VecDeque<EntityId>,
    /// Removed ids still present in buffered snapshots
    departed: HashSet<EntityId>,
    render_state: HashMap<EntityId, RenderPose>,
    tuning: VehicleTuning,
}

impl Default for ClientReplica {
    fn default() -> Self {
        Self::new(DEFAULT_RENDER_DELAY)
    }
}

impl ClientReplica {
    pub fn new(render_delay: Duration) -> Self {
        Self {
            buffer: SnapshotBuffer::default(),
            render_delay_ms: render_delay.as_secs_f64() * 1000.0,
            extrapolation_limit_ms: DEFAULT_EXTRAPOLATION_LIMIT.as_secs_f64() * 1000.0,
            clock_offset: None,
            instantiated: HashSet::new(),
            requested: HashSet::new(),
            pending_spawns: VecDeque::new(),
            departed: HashSet::new(),
            render_state: HashMap::new(),
            tuning: VehicleTuning::default(),
        }
    }

    pub fn with_extrapolation_limit(mut self, limit: Duration) -> Self {
        self.extrapolation_limit_ms = limit.as_secs_f64() * 1000.0;
        self
    }

    /// Start a fresh timeline from a welcome
    pub fn on_welcome(&mut self, server_time: u64, local_now: f64, snapshot: Snapshot) {
        self.reset();
        let offset = local_now - server_time as f64;
        self.clock_offset = Some(offset);
        debug!(offset_ms = offset, "Clock offset measured");
        self.on_snapshot(snapshot);
    }

    /// Buffer a snapshot. Ignored before the clock offset is known.
    pub fn on_snapshot(&mut self, snapshot: Snapshot) -> bool {
        let Some(offset) = self.clock_offset else {
            debug!(tick = snapshot.tick, "Snapshot before welcome, dropping");
            return false;
        };

        self.departed
            .retain(|id| snapshot.e.iter().any(|e| &e.id == id));
        for entity in &snapshot.e {
            if self.instantiated.contains(&entity.id)
                || self.requested.contains(&entity.id)
                || self.departed.contains(&entity.id)
            {
                continue;
            }
            self.requested.insert(entity.id.clone());
            self.pending_spawns.push_back(entity.id.clone());
        }

        let adjusted = snapshot.t as f64 + offset;
        let tick = snapshot.tick;
        let accepted = self.buffer.push(snapshot, adjusted);
        if !accepted {
            trace!(tick, "Duplicate snapshot tick");
        }
        accepted
    }

    /// Ids seen in snapshots that still need a local placeholder
    pub fn take_spawn_requests(&mut self) -> Vec<EntityId> {
        self.pending_spawns.drain(..).collect()
    }

    /// Placeholder for `id` exists; it is interpolated from now on
    pub fn mark_instantiated(&mut self, id: &str) {
        self.requested.remove(id);
        self.instantiated.insert(id.to_string());
    }

    pub fn remove_entity(&mut self, id: &str) {
        self.instantiated.remove(id);
        self.requested.remove(id);
        self.pending_spawns.retain(|pending| pending != id);
        self.render_state.remove(id);
        self.departed.insert(id.to_string());
    }

    pub fn render_time(&self, local_now: f64) -> f64 {
        local_now - self.render_delay_ms
    }

    /// Poses for every instantiated entity at `local_now - render_delay`
    pub fn sample(&mut self, local_now: f64) -> Vec<RenderPose> {
        let render_time = self.render_time(local_now);
        self.buffer.prune(render_time);

        let Some((prev, next)) = self.buffer.pair(render_time) else {
            return Vec::new();
        };
        let alpha = interpolation_alpha(render_time, prev.adjusted, next.adjusted);
        let span_secs = ((next.adjusted - prev.adjusted).max(1.0) / 1000.0) as f32;

        // Past the newest snapshot: project along velocity, bounded
        let overshoot_ms = (render_time - next.adjusted).clamp(0.0, self.extrapolation_limit_ms);
        let overshoot = (overshoot_ms / 1000.0) as f32;

        let mut ids: Vec<&EntityId> = prev
            .snapshot
            .e
            .iter()
            .chain(next.snapshot.e.iter())
            .map(|e| &e.id)
            .filter(|id| self.instantiated.contains(*id))
            .collect();
        ids.sort();
        ids.dedup();

        let mut poses = Vec::with_capacity(ids.len());
        for id in ids {
            let a = prev.snapshot.entity(id);
            let b = next.snapshot.entity(id);
            let Some(mut blended) = blend_states(a, b, alpha) else {
                continue;
            };
            if overshoot > 0.0 {
                blended.position += blended.velocity * overshoot;
                let spin = Quat::from_scaled_axis(blended.angular_velocity * overshoot);
                blended.orientation = (spin * blended.orientation).normalize();
            }
            let decel = match (a, b) {
                (Some(a), Some(b)) => (a.v.length() - b.v.length()) / span_secs,
                _ => 0.0,
            };
            poses.push(RenderPose::from_blended(id, blended, decel, &self.tuning));
        }

        for pose in &poses {
            self.render_state.insert(pose.id.clone(), pose.clone());
        }
        poses
    }

    /// Last pose rendered for `id`
    pub fn render_state(&self, id: &str) -> Option<&RenderPose> {
        self.render_state.get(id)
    }

    pub fn clock_offset(&self) -> Option<f64> {
        self.clock_offset
    }

    pub fn buffer(&self) -> &SnapshotBuffer {
        &self.buffer
    }

    /// Entities currently replicated from the host
    pub fn entity_count(&self) -> usize {
        self.instantiated.len()
    }

    pub fn is_instantiated(&self, id: &str) -> bool {
        self.instantiated.contains(id)
    }

    /// Forget the host timeline and every remote entity
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.clock_offset = None;
        self.instantiated.clear();
        self.requested.clear();
        self.pending_spawns.clear();
        self.departed.clear();
        self.render_state.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(id: &str, x: f32, v: f32) -> EntityState {
        EntityState {
            id: id.to_string(),
            p: Vec3::new(x, 0.0, 0.0),
            q: Quat::IDENTITY,
            v: Vec3::new(v, 0.0, 0.0),
            w: Vec3::ZERO,
        }
    }

    fn snap(tick: u64, t: u64, entities: Vec<EntityState>) -> Snapshot {
        Snapshot { tick, t, e: entities }
    }

    #[test]
    fn buffer_stays_sorted_without_duplicate_ticks() {
        let mut buffer = SnapshotBuffer::new(8);
        for (tick, t) in [(3, 150), (1, 50), (2, 100), (5, 250), (4, 200)] {
            assert!(buffer.push(snap(tick, t, vec![]), t as f64));
        }
        assert!(!buffer.push(snap(2, 100, vec![]), 100.0));

        let times: Vec<f64> = buffer.iter().map(|e| e.adjusted).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn buffer_evicts_oldest_past_capacity() {
        let mut buffer = SnapshotBuffer::new(3);
        for tick in 0..5u64 {
            buffer.push(snap(tick, tick * 50, vec![]), (tick * 50) as f64);
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.iter().next().unwrap().snapshot.tick, 2);
    }

    #[test]
    fn prune_keeps_one_past_snapshot() {
        let mut buffer = SnapshotBuffer::new(8);
        for tick in 0..5u64 {
            buffer.push(snap(tick, tick * 50, vec![]), (tick * 50) as f64);
        }
        buffer.prune(120.0);
        // 0 and 50 dropped; 100 is the past fallback
        let ticks: Vec<u64> = buffer.iter().map(|e| e.snapshot.tick).collect();
        assert_eq!(ticks, vec![2, 3, 4]);

        buffer.prune(10_000.0);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn pair_falls_back_to_last() {
        let mut buffer = SnapshotBuffer::new(8);
        buffer.push(snap(1, 0, vec![]), 0.0);
        buffer.push(snap(2, 50, vec![]), 50.0);
        let (prev, next) = buffer.pair(500.0).unwrap();
        assert_eq!(prev.snapshot.tick, 1);
        assert_eq!(next.snapshot.tick, 2);
    }

    #[test]
    fn alpha_is_clamped() {
        assert_eq!(interpolation_alpha(0.0, 0.0, 50.0), 0.0);
        assert_eq!(interpolation_alpha(25.0, 0.0, 50.0), 0.5);
        assert_eq!(interpolation_alpha(80.0, 0.0, 50.0), 1.0);
        assert_eq!(interpolation_alpha(-5.0, 0.0, 50.0), 0.0);
        // Degenerate span uses a 1 ms floor
        assert_eq!(interpolation_alpha(10.0, 10.0, 10.0), 0.0);
    }

    #[test]
    fn interpolation_hits_endpoints_and_is_monotonic() {
        let a = state("car", 0.0, 0.0);
        let b = state("car", 10.0, 0.0);
        assert_eq!(blend_states(Some(&a), Some(&b), 0.0).unwrap().position.x, 0.0);
        assert_eq!(blend_states(Some(&a), Some(&b), 1.0).unwrap().position.x, 10.0);

        let mut last = f32::MIN;
        for i in 0..=20 {
            let x = blend_states(Some(&a), Some(&b), i as f32 / 20.0)
                .unwrap()
                .position
                .x;
            assert!(x >= last);
            last = x;
        }
    }

    #[test]
    fn slerp_takes_the_short_way() {
        let mut a = state("car", 0.0, 0.0);
        let mut b = state("car", 0.0, 0.0);
        a.q = Quat::from_rotation_y(0.1);
        // Same rotation as 0.3 rad but on the far hemisphere
        b.q = -Quat::from_rotation_y(0.3);
        let mid = blend_states(Some(&a), Some(&b), 0.5).unwrap().orientation;
        assert!(mid.angle_between(Quat::from_rotation_y(0.2)) < 1e-3);
    }

    #[test]
    fn missing_side_defaults_to_the_other() {
        let a = state("car", 4.0, 1.0);
        let only_prev = blend_states(Some(&a), None, 0.7).unwrap();
        assert_eq!(only_prev.position, a.p);
        let only_next = blend_states(None, Some(&a), 0.2).unwrap();
        assert_eq!(only_next.position, a.p);
        assert!(blend_states(None, None, 0.5).is_none());
    }

    #[test]
    fn unknown_entities_wait_for_instantiation() {
        let mut replica = ClientReplica::new(Duration::from_millis(100));
        replica.on_welcome(1_000, 5_000.0, snap(1, 1_000, vec![state("car", 0.0, 0.0)]));
        assert_eq!(replica.clock_offset(), Some(4_000.0));
        replica.on_snapshot(snap(2, 1_050, vec![state("car", 5.0, 0.0)]));

        assert!(replica.sample(5_125.0).is_empty());
        assert_eq!(replica.take_spawn_requests(), vec!["car".to_string()]);
        assert!(replica.take_spawn_requests().is_empty());

        assert!(!replica.is_instantiated("car"));
        replica.mark_instantiated("car");
        assert!(replica.is_instantiated("car"));
        let poses = replica.sample(5_125.0);
        assert_eq!(poses.len(), 1);
        // render time 5025 is halfway between 5000 and 5050
        assert!((poses[0].position.x - 2.5).abs() < 1e-4);
        assert_eq!(replica.render_state("car"), Some(&poses[0]));
    }

    #[test]
    fn extrapolation_is_bounded() {
        let mut replica = ClientReplica::new(Duration::from_millis(100))
            .with_extrapolation_limit(Duration::from_millis(100));
        replica.on_welcome(0, 0.0, snap(1, 0, vec![state("car", 0.0, 10.0)]));
        replica.on_snapshot(snap(2, 50, vec![state("car", 0.5, 10.0)]));
        replica.mark_instantiated("car");
        replica.take_spawn_requests();

        // 50 ms past the newest snapshot: 0.5 + 10 * 0.05
        let near = replica.sample(200.0);
        assert!((near[0].position.x - 1.0).abs() < 1e-4);
        // Far past: capped at 100 ms
        let far = replica.sample(5_000.0);
        assert!((far[0].position.x - 1.5).abs() < 1e-4);
    }

    #[test]
    fn removed_entity_is_not_respawned_from_stale_snapshots() {
        let mut replica = ClientReplica::default();
        replica.on_welcome(0, 0.0, snap(1, 0, vec![state("car", 0.0, 0.0)]));
        replica.mark_instantiated("car");
        replica.remove_entity("car");

        replica.on_snapshot(snap(2, 50, vec![state("car", 0.0, 0.0)]));
        assert!(replica.take_spawn_requests().is_empty());

        // Gone from the host; a later reappearance is a new entity
        replica.on_snapshot(snap(3, 100, vec![]));
        replica.on_snapshot(snap(4, 150, vec![state("car", 0.0, 0.0)]));
        assert_eq!(replica.take_spawn_requests(), vec!["car".to_string()]);
    }

    #[test]
    fn snapshots_before_welcome_are_dropped() {
        let mut replica = ClientReplica::default();
        assert!(!replica.on_snapshot(snap(1, 0, vec![])));
        assert!(replica.buffer().is_empty());
    }
}
