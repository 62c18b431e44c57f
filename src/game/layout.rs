//! World layout: play area, spawn slots, prop placement

use glam::{Quat, Vec3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::ws::protocol::{EntityId, PropInfo, PropKind};

/// Radius around the origin kept free of vehicle spawns
pub const SAFE_ZONE_RADIUS: f32 = 6.0;
/// Ring on which spawn slots sit
pub const SPAWN_RING_RADIUS: f32 = 18.0;
pub const SPAWN_SLOTS: usize = 8;
/// Spawn height above the ground plane
pub const SPAWN_HEIGHT: f32 = 1.0;

/// Axis-aligned play area. Props leaving it are reset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayArea {
    /// Half side length of the ground plane
    pub half_extent: f32,
    /// Extra distance past the ground edge before a reset
    pub margin: f32,
    /// Anything below this height fell off the world
    pub floor_y: f32,
}

impl Default for PlayArea {
    fn default() -> Self {
        Self {
            half_extent: 40.0,
            margin: 5.0,
            floor_y: -10.0,
        }
    }
}

impl PlayArea {
    pub fn contains(&self, position: Vec3) -> bool {
        let limit = self.half_extent + self.margin;
        position.is_finite()
            && position.x.abs() <= limit
            && position.z.abs() <= limit
            && position.y >= self.floor_y
    }
}

/// Deterministic 32-bit string hash (`h = h * 31 + c`)
pub fn id_hash(id: &str) -> u32 {
    id.chars()
        .fold(0u32, |h, c| h.wrapping_mul(31).wrapping_add(c as u32))
}

/// Spawn transform for a vehicle id: one of [`SPAWN_SLOTS`] positions on a ring
/// outside the safe zone, facing the centre.
pub fn spawn_slot(id: &str) -> (Vec3, Quat) {
    let slot = id_hash(id) as usize % SPAWN_SLOTS;
    slot_transform(slot)
}

pub fn slot_transform(slot: usize) -> (Vec3, Quat) {
    let angle = slot as f32 / SPAWN_SLOTS as f32 * std::f32::consts::TAU;
    let position = Vec3::new(
        angle.cos() * SPAWN_RING_RADIUS,
        SPAWN_HEIGHT,
        angle.sin() * SPAWN_RING_RADIUS,
    );
    // Body forward is +Z; yaw it towards the origin
    let to_centre = -position.with_y(0.0);
    let yaw = to_centre.x.atan2(to_centre.z);
    (position, Quat::from_rotation_y(yaw))
}

/// Seeded prop placement inside the spawn ring
pub fn scatter_props(count: usize, seed: u64) -> Vec<PropInfo> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    const KINDS: [PropKind; 3] = [PropKind::Crate, PropKind::Ball, PropKind::Cone];

    (0..count)
        .map(|i| {
            let angle = rng.gen_range(0.0..std::f32::consts::TAU);
            let radius = rng.gen_range(SAFE_ZONE_RADIUS + 1.0..SPAWN_RING_RADIUS - 4.0);
            let yaw = rng.gen_range(0.0..std::f32::consts::TAU);
            PropInfo {
                id: prop_id(i),
                kind: KINDS[i % KINDS.len()],
                p: Vec3::new(angle.cos() * radius, 1.5, angle.sin() * radius),
                q: Quat::from_rotation_y(yaw),
            }
        })
        .collect()
}

pub fn prop_id(index: usize) -> EntityId {
    format!("prop-{index}")
}
