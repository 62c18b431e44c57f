//! Collision side effects
//!
//! Contact-begin events are turned into two things: an extra impulse response
//! for toy props (the engine's response is realistic; these props need an
//! exaggerated bounce) and a scalar impact strength for gameplay feedback.

use glam::Vec3;
use tracing::trace;

use super::physics::{Material, PhysicsWorld};
use crate::ws::protocol::EntityId;

/// Closing speed mapped to full impact strength
pub const IMPACT_FULL_SCALE_SPEED: f32 = 12.0;
/// Impacts weaker than this are not reported
pub const MIN_IMPACT_STRENGTH: f32 = 0.02;

/// Feedback signal for rendering (camera shake, particles)
#[derive(Debug, Clone, PartialEq)]
pub struct ImpactEvent {
    pub a: EntityId,
    /// `None` for static geometry
    pub b: Option<EntityId>,
    /// In `[0, 1]`
    pub strength: f32,
    pub tick: u64,
}

/// One side of a contact as seen by the feedback pass
#[derive(Debug, Clone)]
pub struct ContactParty<B> {
    pub id: Option<EntityId>,
    pub body: Option<B>,
    pub toy: bool,
    pub material: Material,
    /// Linear velocity before the step that produced the contact
    pub velocity: Option<Vec3>,
}

/// Kinematic state of one side, read from the engine
#[derive(Debug, Clone, Copy)]
struct PartyState {
    position: Option<Vec3>,
    velocity: Vec3,
    inv_mass: f32,
}

/// Impulse on body B (A receives the negation) resolving an approaching
/// contact along `normal` (pointing from A to B).
///
/// Uses the greater restitution and the lesser friction of the two surfaces.
/// Returns `None` when the bodies are already separating.
pub fn contact_impulse(
    velocity_a: Vec3,
    velocity_b: Vec3,
    inv_mass_a: f32,
    inv_mass_b: f32,
    normal: Vec3,
    material_a: Material,
    material_b: Material,
) -> Option<Vec3> {
    let inv_mass_sum = inv_mass_a + inv_mass_b;
    if inv_mass_sum <= f32::EPSILON {
        return None;
    }

    let relative = velocity_b - velocity_a;
    let normal_speed = relative.dot(normal);
    if normal_speed >= 0.0 {
        return None;
    }

    let restitution = material_a.restitution.max(material_b.restitution);
    let friction = material_a.friction.min(material_b.friction);

    let j = -(1.0 + restitution) * normal_speed / inv_mass_sum;
    let mut impulse = normal * j;

    let tangential = relative - normal * normal_speed;
    let slide = tangential.length();
    if slide > 1e-4 {
        let jt = (slide / inv_mass_sum).min(friction * j);
        impulse -= tangential / slide * jt;
    }

    Some(impulse)
}

/// Map a closing speed to `[0, 1]`
pub fn impact_strength(closing_speed: f32) -> f32 {
    (closing_speed / IMPACT_FULL_SCALE_SPEED).clamp(0.0, 1.0)
}

#[derive(Debug, Default)]
pub struct CollisionFeedback {
    pending: Vec<ImpactEvent>,
    bounces: usize,
}

impl CollisionFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_party<W: PhysicsWorld>(world: &W, party: &ContactParty<W::Body>) -> PartyState {
        let dynamic_body = party.body.filter(|b| world.is_dynamic(*b));
        match dynamic_body {
            Some(body) => PartyState {
                position: world.translation(body),
                velocity: party
                    .velocity
                    .or_else(|| world.linvel(body))
                    .unwrap_or(Vec3::ZERO),
                inv_mass: world
                    .mass(body)
                    .filter(|m| *m > 0.0)
                    .map_or(0.0, |m| 1.0 / m),
            },
            None => PartyState {
                position: party.body.and_then(|b| world.translation(b)),
                velocity: Vec3::ZERO,
                inv_mass: 0.0,
            },
        }
    }

    /// Handle a contact-begin between two colliders.
    ///
    /// The engine has already resolved the contact when this runs, so the
    /// approach is judged from the parties' pre-step velocities. `normal`
    /// points from A to B; without one the centre-to-centre direction is used.
    pub fn on_contact_begin<W: PhysicsWorld>(
        &mut self,
        world: &mut W,
        a: &ContactParty<W::Body>,
        b: &ContactParty<W::Body>,
        normal: Option<Vec3>,
        tick: u64,
    ) -> Option<ImpactEvent> {
        let state_a = Self::read_party(world, a);
        let state_b = Self::read_party(world, b);
        if state_a.inv_mass == 0.0 && state_b.inv_mass == 0.0 {
            return None;
        }

        let relative = state_b.velocity - state_a.velocity;
        let normal = normal
            .or_else(|| match (state_a.position, state_b.position) {
                (Some(pa), Some(pb)) => Some((pb - pa).normalize_or_zero()),
                _ => None,
            })
            .filter(|n| *n != Vec3::ZERO)
            // Against static geometry only the approach speed matters
            .unwrap_or_else(|| (-relative).normalize_or_zero());

        let both_dynamic = state_a.inv_mass > 0.0 && state_b.inv_mass > 0.0;
        if both_dynamic && (a.toy || b.toy) {
            if let (Some(body_a), Some(body_b)) = (a.body, b.body) {
                if let Some(impulse) = contact_impulse(
                    state_a.velocity,
                    state_b.velocity,
                    state_a.inv_mass,
                    state_b.inv_mass,
                    normal,
                    a.material,
                    b.material,
                ) {
                    world.apply_impulse(body_a, -impulse);
                    world.apply_impulse(body_b, impulse);
                    self.bounces += 1;
                }
            }
        }

        let closing_speed = (-relative.dot(normal)).max(0.0);
        let strength = impact_strength(closing_speed);
        if strength < MIN_IMPACT_STRENGTH {
            return None;
        }

        let (first, second) = match (&a.id, &b.id) {
            (Some(id_a), other) => (id_a.clone(), other.clone()),
            (None, Some(id_b)) => (id_b.clone(), None),
            (None, None) => return None,
        };
        let event = ImpactEvent {
            a: first,
            b: second,
            strength,
            tick,
        };
        trace!(a = %event.a, strength = event.strength, "Impact");
        self.pending.push(event.clone());
        Some(event)
    }

    /// Take the impacts produced since the last drain
    pub fn drain(&mut self) -> Vec<ImpactEvent> {
        std::mem::take(&mut self.pending)
    }

    /// Toy bounces applied since the last call
    pub fn take_bounces(&mut self) -> usize {
        std::mem::take(&mut self.bounces)
    }
}
