//! Online/offline mode switching
//!
//! The controller is a plain state machine; the runner feeds it probe and
//! transport outcomes and asks it each frame what to render. Offline, a local
//! world is simulated in-process. Online, everything comes from the host.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use glam::{Quat, Vec3};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::game::layout::{scatter_props, spawn_slot, PlayArea};
use crate::game::physics::RapierWorld;
use crate::game::scheduler::{FixedStepScheduler, PoseBlend};
use crate::game::world::SimulationState;
use crate::game::InputSample;
use crate::util::time::SIMULATION_TPS;
use crate::ws::protocol::{ClientMsg, EntityId, PlayerInfo, PropInfo, ServerMsg, Snapshot};

use super::replica::{ClientReplica, RenderPose};

/// Id of the player's vehicle in the offline world
pub const LOCAL_PLAYER_ID: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Probing the host or waiting for its welcome
    Connecting,
    Online,
    Offline,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Connecting => "connecting",
            Mode::Online => "online",
            Mode::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// The only user-visible failure signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeStatus {
    pub mode: Mode,
    pub reason: String,
}

impl fmt::Display for ModeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.mode, self.reason)
    }
}

/// Single-slot reconnect timer. Arming an armed timer does nothing.
#[derive(Debug, Default)]
pub struct ReconnectTimer {
    deadline: Option<Instant>,
}

impl ReconnectTimer {
    pub fn arm(&mut self, now: Instant, backoff: Duration) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(now + backoff);
        true
    }

    /// Fire if due. Firing disarms.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Fully local simulation used while the host is unreachable
pub struct LocalWorld {
    sim: SimulationState<RapierWorld>,
    scheduler: FixedStepScheduler,
    poses: HashMap<EntityId, PoseBlend>,
    seq: u32,
}

impl LocalWorld {
    pub fn new(prop_count: usize, seed: u64) -> Self {
        let world = RapierWorld::new(1.0 / SIMULATION_TPS as f32);
        let mut sim = SimulationState::new(world, PlayArea::default());
        for prop in scatter_props(prop_count, seed) {
            sim.spawn_prop(&prop);
        }
        let (position, orientation) = spawn_slot(LOCAL_PLAYER_ID);
        sim.spawn_vehicle(LOCAL_PLAYER_ID, position, orientation);

        let poses = sim
            .snapshot(0)
            .e
            .into_iter()
            .map(|state| (state.id, PoseBlend::new(state.p, state.q)))
            .collect();

        Self {
            sim,
            scheduler: FixedStepScheduler::new(SIMULATION_TPS),
            poses,
            seq: 0,
        }
    }

    /// Advance by wall-clock `dt` with the player's `(steer, throttle)` and
    /// return blended poses
    pub fn frame(&mut self, dt: Duration, steer: f32, throttle: f32) -> Vec<RenderPose> {
        self.seq = self.seq.wrapping_add(1);
        let input = InputSample::new(steer, throttle, self.seq, 0);
        let inputs = HashMap::from([(LOCAL_PLAYER_ID.to_string(), input)]);

        let mut telemetry = None;
        let sim = &mut self.sim;
        let blends = &mut self.poses;
        self.scheduler.advance_with(dt, || {
            let report = sim.step(&inputs);
            telemetry = report.telemetry.get(LOCAL_PLAYER_ID).copied();
            for state in sim.snapshot(0).e {
                blends
                    .entry(state.id)
                    .and_modify(|blend| blend.push(state.p, state.q))
                    .or_insert_with(|| PoseBlend::new(state.p, state.q));
            }
        });

        let alpha = self.scheduler.alpha();
        let mut poses: Vec<RenderPose> = self
            .poses
            .iter()
            .map(|(id, blend)| {
                let (position, orientation) = blend.blend(alpha);
                let speed = self
                    .sim
                    .entity_state(id)
                    .map_or(0.0, |state| state.v.length());
                RenderPose {
                    id: id.clone(),
                    position,
                    orientation,
                    speed,
                    steering: 0.0,
                    braking: false,
                }
            })
            .collect();
        if let (Some(telemetry), Some(pose)) = (
            telemetry,
            poses.iter_mut().find(|p| p.id == LOCAL_PLAYER_ID),
        ) {
            pose.steering = telemetry.steering;
            pose.braking = telemetry.braking;
        }
        poses.sort_by(|a, b| a.id.cmp(&b.id));
        poses
    }

    pub fn simulation(&self) -> &SimulationState<RapierWorld> {
        &self.sim
    }

    pub fn prop_count(&self) -> usize {
        self.sim.props().len()
    }

    pub fn player_position(&self) -> Option<Vec3> {
        self.sim.entity_state(LOCAL_PLAYER_ID).map(|s| s.p)
    }
}

/// Host-authoritative view while online
#[derive(Debug, Default)]
struct RemoteWorld {
    local_id: Option<EntityId>,
    players: BTreeSet<EntityId>,
    props: Vec<PropInfo>,
}

/// What the runner should do after a controller call
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    None,
    /// Probe the host and open the transport
    Connect,
    /// Send this message to the host
    Reply(ClientMsg),
}

pub struct ModeController {
    mode: Mode,
    reason: String,
    local: Option<LocalWorld>,
    remote: RemoteWorld,
    replica: ClientReplica,
    reconnect: ReconnectTimer,
    backoff: Duration,
    prop_count: usize,
    seed: u64,
    local_worlds_built: u64,
}

impl ModeController {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            mode: Mode::Connecting,
            reason: "starting".to_string(),
            local: None,
            remote: RemoteWorld::default(),
            replica: ClientReplica::new(config.render_delay),
            reconnect: ReconnectTimer::default(),
            backoff: config.reconnect_backoff,
            prop_count: config.offline_prop_count,
            seed: 0x5EED,
            local_worlds_built: 0,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn status(&self) -> ModeStatus {
        ModeStatus {
            mode: self.mode,
            reason: self.reason.clone(),
        }
    }

    pub fn local_world(&self) -> Option<&LocalWorld> {
        self.local.as_ref()
    }

    pub fn replica(&self) -> &ClientReplica {
        &self.replica
    }

    pub fn reconnect_timer(&self) -> &ReconnectTimer {
        &self.reconnect
    }

    /// Local worlds created so far
    pub fn local_worlds_built(&self) -> u64 {
        self.local_worlds_built
    }

    /// Entities replicated from the host (zero while offline)
    pub fn remote_entity_count(&self) -> usize {
        if self.mode == Mode::Online {
            self.replica.entity_count()
        } else {
            0
        }
    }

    pub fn remote_players(&self) -> impl Iterator<Item = &EntityId> {
        self.remote.players.iter()
    }

    pub fn remote_props(&self) -> &[PropInfo] {
        &self.remote.props
    }

    pub fn local_id(&self) -> Option<&str> {
        self.remote.local_id.as_deref()
    }

    /// Fall back to the local world. Re-entering offline keeps the existing
    /// world and the pending timer.
    pub fn enter_offline(&mut self, reason: impl Into<String>, now: Instant) -> bool {
        let reason = reason.into();
        let changed = self.mode != Mode::Offline;
        if changed {
            warn!(reason = %reason, "Switching to offline mode");
            self.replica.reset();
            self.remote = RemoteWorld::default();
            self.mode = Mode::Offline;
        }
        if self.local.is_none() {
            self.local = Some(LocalWorld::new(self.prop_count, self.seed));
            self.local_worlds_built += 1;
            debug!(props = self.prop_count, "Local world spawned");
        }
        self.reason = reason;
        self.reconnect.arm(now, self.backoff);
        changed
    }

    /// A probe/transport attempt is starting. The local world keeps running
    /// until the host's welcome replaces it.
    pub fn begin_connect(&mut self) {
        self.reconnect.cancel();
        if self.mode != Mode::Online {
            self.mode = Mode::Connecting;
            self.reason = "connecting to host".to_string();
        }
    }

    /// Transport closed or failed while connecting or online
    pub fn on_transport_closed(&mut self, reason: impl Into<String>, now: Instant) -> bool {
        // A transport that dies online leaves a stale local world behind
        if self.mode == Mode::Online {
            self.local = None;
        }
        self.enter_offline(reason, now)
    }

    /// Time to try the host again
    pub fn poll_reconnect(&mut self, now: Instant) -> Action {
        if self.mode == Mode::Offline && self.reconnect.fire(now) {
            Action::Connect
        } else {
            Action::None
        }
    }

    fn on_welcome(
        &mut self,
        id: EntityId,
        server_time: u64,
        players: Vec<PlayerInfo>,
        props: Vec<PropInfo>,
        snapshot: Snapshot,
        local_now: f64,
    ) {
        if self.local.take().is_some() {
            debug!("Discarding local world");
        }
        self.reconnect.cancel();
        self.replica.on_welcome(server_time, local_now, snapshot);
        self.remote = RemoteWorld {
            local_id: Some(id.clone()),
            players: players.into_iter().map(|p| p.id).collect(),
            props,
        };
        self.mode = Mode::Online;
        self.reason = format!("connected as {id}");
        info!(
            session_id = %id,
            players = self.remote.players.len(),
            props = self.remote.props.len(),
            "Online"
        );
    }

    /// Apply a host message
    pub fn on_server_msg(&mut self, msg: ServerMsg, local_now: f64) -> Action {
        match msg {
            ServerMsg::Welcome {
                id,
                server_time,
                players,
                props,
                snapshot,
                ..
            } => {
                self.on_welcome(id, server_time, players, props, snapshot, local_now);
            }
            ServerMsg::Snapshot(snapshot) => {
                if self.mode == Mode::Online {
                    self.replica.on_snapshot(snapshot);
                }
            }
            ServerMsg::PlayerJoined { id } => {
                debug!(player_id = %id, "Player joined");
                self.remote.players.insert(id);
            }
            ServerMsg::PlayerLeft { id } => {
                debug!(player_id = %id, "Player left");
                self.remote.players.remove(&id);
                self.replica.remove_entity(&id);
            }
            ServerMsg::Ping { t } => return Action::Reply(ClientMsg::Pong { t }),
            ServerMsg::Pong { t } => {
                // Pings carry local time
                debug!(rtt_ms = local_now - t as f64, "Pong");
            }
        }
        Action::None
    }

    /// Produce this frame's poses.
    ///
    /// Offline the local world steps with the player's input; online the
    /// replica is sampled, instantiating newly seen entities first.
    pub fn frame(
        &mut self,
        dt: Duration,
        steer: f32,
        throttle: f32,
        local_now: f64,
    ) -> Vec<RenderPose> {
        match self.mode {
            Mode::Online => {
                for id in self.replica.take_spawn_requests() {
                    debug!(entity_id = %id, "Instantiating remote entity");
                    self.replica.mark_instantiated(&id);
                }
                self.replica.sample(local_now)
            }
            Mode::Offline | Mode::Connecting => match self.local.as_mut() {
                Some(local) => local.frame(dt, steer, throttle),
                None => Vec::new(),
            },
        }
    }
}

/// Orientation helper for tests and headless logging
pub fn heading(orientation: Quat) -> f32 {
    let forward = orientation * Vec3::Z;
    forward.x.atan2(forward.z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::EntityState;

    fn controller(props: usize) -> ModeController {
        let config = ClientConfig {
            offline_prop_count: props,
            ..ClientConfig::default()
        };
        ModeController::new(&config)
    }

    fn welcome(id: &str) -> ServerMsg {
        ServerMsg::Welcome {
            id: id.to_string(),
            tick_rate: 60,
            snapshot_rate: 20,
            server_time: 10_000,
            players: vec![PlayerInfo { id: "other".into() }],
            props: scatter_props(3, 1),
            snapshot: Snapshot {
                tick: 5,
                t: 10_000,
                e: vec![EntityState {
                    id: id.to_string(),
                    p: Vec3::ZERO,
                    q: Quat::IDENTITY,
                    v: Vec3::ZERO,
                    w: Vec3::ZERO,
                }],
            },
        }
    }

    #[test]
    fn offline_startup_spawns_local_props_only() {
        let mut mode = controller(5);
        let now = Instant::now();
        mode.enter_offline("host unreachable", now);

        assert_eq!(mode.mode(), Mode::Offline);
        assert_eq!(mode.status().reason, "host unreachable");
        let local = mode.local_world().unwrap();
        assert_eq!(local.prop_count(), 5);
        assert!(local.simulation().contains(LOCAL_PLAYER_ID));
        assert_eq!(mode.remote_entity_count(), 0);
        assert_eq!(mode.remote_players().count(), 0);
    }

    #[test]
    fn reentering_offline_does_not_double_spawn_or_rearm() {
        let mut mode = controller(4);
        let now = Instant::now();
        assert!(mode.enter_offline("unreachable", now));
        let deadline = mode.reconnect_timer().deadline();

        assert!(!mode.enter_offline("still unreachable", now + Duration::from_millis(500)));
        assert_eq!(mode.local_worlds_built(), 1);
        assert_eq!(mode.local_world().unwrap().prop_count(), 4);
        assert_eq!(mode.reconnect_timer().deadline(), deadline);
    }

    #[test]
    fn reconnect_timer_is_single_slot() {
        let mut timer = ReconnectTimer::default();
        let now = Instant::now();
        let backoff = Duration::from_millis(2500);
        assert!(timer.arm(now, backoff));
        assert!(!timer.arm(now, backoff));
        assert!(!timer.fire(now + Duration::from_millis(2499)));
        assert!(timer.fire(now + backoff));
        assert!(!timer.is_armed());
        assert!(!timer.fire(now + backoff * 2));
    }

    #[test]
    fn reconnect_fires_once_after_backoff() {
        let mut mode = controller(2);
        let now = Instant::now();
        mode.enter_offline("unreachable", now);
        assert_eq!(mode.poll_reconnect(now), Action::None);
        let later = now + Duration::from_millis(2500);
        assert_eq!(mode.poll_reconnect(later), Action::Connect);
        assert_eq!(mode.poll_reconnect(later), Action::None);

        // Failed attempt re-arms exactly one timer
        mode.begin_connect();
        assert_eq!(mode.mode(), Mode::Connecting);
        mode.enter_offline("probe failed", later);
        assert!(mode.reconnect_timer().is_armed());
        assert_eq!(mode.local_worlds_built(), 1);
    }

    #[test]
    fn welcome_replaces_local_world() {
        let mut mode = controller(6);
        let now = Instant::now();
        mode.enter_offline("unreachable", now);
        mode.begin_connect();

        let action = mode.on_server_msg(welcome("me"), 12_000.0);
        assert_eq!(action, Action::None);
        assert_eq!(mode.mode(), Mode::Online);
        assert!(mode.local_world().is_none());
        assert!(!mode.reconnect_timer().is_armed());
        assert_eq!(mode.remote_props().len(), 3);
        assert_eq!(mode.local_id(), Some("me"));
        assert_eq!(mode.replica().clock_offset(), Some(2_000.0));

        let poses = mode.frame(Duration::from_millis(16), 0.0, 0.0, 12_200.0);
        assert_eq!(poses.len(), 1);
        assert_eq!(mode.remote_entity_count(), 1);
    }

    #[test]
    fn transport_close_brings_back_a_fresh_world() {
        let mut mode = controller(3);
        let now = Instant::now();
        mode.begin_connect();
        mode.on_server_msg(welcome("me"), 12_000.0);
        mode.on_server_msg(ServerMsg::PlayerJoined { id: "late".into() }, 12_010.0);
        assert_eq!(mode.remote_players().count(), 2);

        assert!(mode.on_transport_closed("connection reset", now));
        assert_eq!(mode.mode(), Mode::Offline);
        assert_eq!(mode.remote_players().count(), 0);
        assert_eq!(mode.remote_entity_count(), 0);
        assert_eq!(mode.local_world().unwrap().prop_count(), 3);
        assert!(mode.reconnect_timer().is_armed());
    }

    #[test]
    fn host_ping_gets_a_pong() {
        let mut mode = controller(0);
        assert_eq!(
            mode.on_server_msg(ServerMsg::Ping { t: 42 }, 0.0),
            Action::Reply(ClientMsg::Pong { t: 42 })
        );
    }

    #[test]
    fn offline_player_drives_forward() {
        let mut mode = controller(0);
        mode.enter_offline("unreachable", Instant::now());
        let start = mode.local_world().unwrap().player_position().unwrap();

        let mut poses = Vec::new();
        for _ in 0..120 {
            poses = mode.frame(Duration::from_millis(16), 0.0, 1.0, 0.0);
        }
        let end = mode.local_world().unwrap().player_position().unwrap();
        assert!(end.with_y(0.0).distance(start.with_y(0.0)) > 1.0);

        let player = poses.iter().find(|p| p.id == LOCAL_PLAYER_ID).unwrap();
        assert!(player.speed > 0.0);
        assert!(!player.braking);
    }

    #[test]
    fn heading_of_identity_is_zero() {
        assert_eq!(heading(Quat::IDENTITY), 0.0);
    }
}
