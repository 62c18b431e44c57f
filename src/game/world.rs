//! Simulation state
//!
//! Entities live in an arena keyed by stable application id. Engine handles
//! are kept on the record and in a collider side table, so nothing outside
//! this module (and the physics seam) ever sees them. Lifecycle is
//! `new → step… → shutdown`.

use std::collections::{BTreeMap, HashMap};

use glam::{Quat, Vec3};
use tracing::{debug, info};

use super::collision::{CollisionFeedback, ContactParty, ImpactEvent};
use super::layout::PlayArea;
use super::physics::{BodyDesc, Material, PhysicsWorld, Shape};
use super::vehicle::{apply_vehicle_controls, VehicleTelemetry, VehicleTuning};
use super::InputSample;
use crate::ws::protocol::{EntityId, EntityState, PropInfo, PropKind, Snapshot};

pub const VEHICLE_HALF_EXTENTS: Vec3 = Vec3::new(0.9, 0.45, 1.9);
pub const VEHICLE_MASS: f32 = 140.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Vehicle,
    Prop(PropKind),
}

struct EntityRecord<W: PhysicsWorld> {
    kind: EntityKind,
    body: W::Body,
    collider: W::Collider,
    /// Transform a prop resets to
    initial: (Vec3, Quat),
    /// Active contacts on the collider; grounded while non-zero
    contacts: u32,
}

/// What one step produced
#[derive(Debug, Default)]
pub struct StepReport {
    pub tick: u64,
    pub impacts: Vec<ImpactEvent>,
    /// Toy contact responses applied this step
    pub bounces: usize,
    /// Props returned to their initial transform this step
    pub resets: Vec<EntityId>,
    pub telemetry: HashMap<EntityId, VehicleTelemetry>,
}

pub struct SimulationState<W: PhysicsWorld> {
    world: W,
    entities: BTreeMap<EntityId, EntityRecord<W>>,
    by_collider: HashMap<W::Collider, EntityId>,
    area: PlayArea,
    tuning: VehicleTuning,
    feedback: CollisionFeedback,
    tick: u64,
}

impl<W: PhysicsWorld> SimulationState<W> {
    pub fn new(mut world: W, area: PlayArea) -> Self {
        world.create_static_collider(
            Shape::Cuboid(Vec3::new(area.half_extent, 0.5, area.half_extent)),
            Vec3::new(0.0, -0.5, 0.0),
            Material {
                friction: 0.9,
                restitution: 0.1,
            },
        );

        Self {
            world,
            entities: BTreeMap::new(),
            by_collider: HashMap::new(),
            area,
            tuning: VehicleTuning::default(),
            feedback: CollisionFeedback::new(),
            tick: 0,
        }
    }

    pub fn with_tuning(mut self, tuning: VehicleTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn area(&self) -> &PlayArea {
        &self.area
    }

    pub fn world(&self) -> &W {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    fn insert(&mut self, id: EntityId, kind: EntityKind, desc: BodyDesc) -> bool {
        if self.entities.contains_key(&id) {
            return false;
        }
        let (body, collider) = self.world.create_body(&desc);
        self.by_collider.insert(collider, id.clone());
        self.entities.insert(
            id,
            EntityRecord {
                kind,
                body,
                collider,
                initial: (desc.position, desc.orientation),
                contacts: 0,
            },
        );
        true
    }

    /// Create a controlled vehicle. Returns `false` if the id is taken.
    pub fn spawn_vehicle(&mut self, id: &str, position: Vec3, orientation: Quat) -> bool {
        let desc = BodyDesc::dynamic(Shape::Cuboid(VEHICLE_HALF_EXTENTS), VEHICLE_MASS)
            .at(position, orientation)
            .material(Material {
                friction: 0.3,
                restitution: 0.1,
            })
            .damping(0.05, 0.5);
        let spawned = self.insert(id.to_string(), EntityKind::Vehicle, desc);
        if spawned {
            debug!(entity_id = %id, "Vehicle spawned");
        }
        spawned
    }

    pub fn spawn_prop(&mut self, prop: &PropInfo) -> bool {
        let desc = match prop.kind {
            PropKind::Crate => BodyDesc::dynamic(Shape::Cuboid(Vec3::splat(0.6)), 40.0).material(
                Material {
                    friction: 0.7,
                    restitution: 0.15,
                },
            ),
            PropKind::Ball => BodyDesc::dynamic(Shape::Ball(0.5), 4.0)
                .material(Material {
                    friction: 0.4,
                    restitution: 0.85,
                })
                .damping(0.1, 0.2),
            PropKind::Cone => {
                BodyDesc::dynamic(Shape::Cuboid(Vec3::new(0.3, 0.5, 0.3)), 2.0).material(Material {
                    friction: 0.5,
                    restitution: 0.7,
                })
            }
        };
        self.insert(
            prop.id.clone(),
            EntityKind::Prop(prop.kind),
            desc.at(prop.p, prop.q),
        )
    }

    /// Remove an entity and its body. Returns `false` if it was not present.
    pub fn despawn(&mut self, id: &str) -> bool {
        let Some(record) = self.entities.remove(id) else {
            return false;
        };
        self.by_collider.remove(&record.collider);
        self.world.remove_body(record.body);
        debug!(entity_id = %id, "Entity despawned");
        true
    }

    pub fn vehicles(&self) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|(_, e)| e.kind == EntityKind::Vehicle)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Props with the transform they reset to
    pub fn props(&self) -> Vec<PropInfo> {
        self.entities
            .iter()
            .filter_map(|(id, e)| match e.kind {
                EntityKind::Prop(kind) => Some(PropInfo {
                    id: id.clone(),
                    kind,
                    p: e.initial.0,
                    q: e.initial.1,
                }),
                EntityKind::Vehicle => None,
            })
            .collect()
    }

    pub fn is_grounded(&self, id: &str) -> bool {
        self.entities.get(id).is_some_and(|e| e.contacts > 0)
    }

    pub fn entity_state(&self, id: &str) -> Option<EntityState> {
        let record = self.entities.get(id)?;
        Some(EntityState {
            id: id.to_string(),
            p: self.world.translation(record.body)?,
            q: self.world.rotation(record.body)?,
            v: self.world.linvel(record.body)?,
            w: self.world.angvel(record.body)?,
        })
    }

    /// Return an entity to its recorded initial transform at rest
    pub fn reset_entity(&mut self, id: &str) -> bool {
        let Some(record) = self.entities.get(id) else {
            return false;
        };
        let (position, orientation) = record.initial;
        let body = record.body;
        self.world.set_pose(body, position, orientation);
        self.world.set_linvel(body, Vec3::ZERO);
        self.world.set_angvel(body, Vec3::ZERO);
        true
    }

    /// Advance one fixed step: controls, physics, contact bookkeeping, bounds.
    ///
    /// Vehicles without an entry in `inputs` coast with neutral controls.
    pub fn step(&mut self, inputs: &HashMap<EntityId, InputSample>) -> StepReport {
        let mut report = StepReport::default();
        let neutral = InputSample::default();

        for (id, record) in &self.entities {
            if record.kind != EntityKind::Vehicle {
                continue;
            }
            let input = inputs.get(id).unwrap_or(&neutral);
            if let Some(telemetry) = apply_vehicle_controls(
                &mut self.world,
                record.body,
                input,
                record.contacts > 0,
                &self.tuning,
            ) {
                report.telemetry.insert(id.clone(), telemetry);
            }
        }

        // Contacts are resolved inside the engine step; feedback needs the
        // velocities the bodies approached with
        let approach: HashMap<W::Body, Vec3> = self
            .entities
            .values()
            .filter_map(|e| Some((e.body, self.world.linvel(e.body)?)))
            .collect();

        self.world.step();
        self.tick += 1;
        report.tick = self.tick;

        self.process_contacts(&approach);
        report.impacts = self.feedback.drain();
        report.bounces = self.feedback.take_bounces();
        report.resets = self.reset_out_of_bounds();
        report
    }

    fn party(
        &self,
        collider: W::Collider,
        approach: &HashMap<W::Body, Vec3>,
    ) -> ContactParty<W::Body> {
        let id = self.by_collider.get(&collider).cloned();
        let record = id.as_ref().and_then(|id| self.entities.get(id));
        ContactParty {
            velocity: record.and_then(|r| approach.get(&r.body).copied()),
            toy: matches!(record.map(|r| r.kind), Some(EntityKind::Prop(kind)) if kind.is_toy()),
            body: record
                .map(|r| r.body)
                .or_else(|| self.world.collider_body(collider)),
            material: self
                .world
                .collider_material(collider)
                .unwrap_or_default(),
            id,
        }
    }

    fn process_contacts(&mut self, approach: &HashMap<W::Body, Vec3>) {
        for event in self.world.drain_collision_events() {
            for collider in [event.collider_a, event.collider_b] {
                let Some(id) = self.by_collider.get(&collider) else {
                    continue;
                };
                if let Some(record) = self.entities.get_mut(id) {
                    if record.kind != EntityKind::Vehicle {
                        continue;
                    }
                    record.contacts = if event.started {
                        record.contacts + 1
                    } else {
                        record.contacts.saturating_sub(1)
                    };
                }
            }

            if event.started {
                let a = self.party(event.collider_a, approach);
                let b = self.party(event.collider_b, approach);
                self.feedback.on_contact_begin(
                    &mut self.world,
                    &a,
                    &b,
                    event.normal,
                    self.tick,
                );
            }
        }
    }

    fn reset_out_of_bounds(&mut self) -> Vec<EntityId> {
        let escaped: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|(_, e)| matches!(e.kind, EntityKind::Prop(_)))
            .filter(|(_, e)| {
                self.world
                    .translation(e.body)
                    .is_some_and(|p| !self.area.contains(p))
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &escaped {
            self.reset_entity(id);
            debug!(entity_id = %id, "Prop left the play area, reset");
        }
        escaped
    }

    /// Capture every dynamic entity. Bodies the engine lost are skipped.
    pub fn snapshot(&self, server_time: u64) -> Snapshot {
        Snapshot {
            tick: self.tick,
            t: server_time,
            e: self
                .entities
                .iter()
                .filter(|(_, e)| self.world.is_dynamic(e.body))
                .filter_map(|(id, _)| self.entity_state(id))
                .collect(),
        }
    }

    /// Tear down every entity
    pub fn shutdown(mut self) -> W {
        let ids: Vec<EntityId> = self.entities.keys().cloned().collect();
        for id in &ids {
            self.despawn(id);
        }
        info!(entities = ids.len(), tick = self.tick, "Simulation shut down");
        self.world
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::layout::{scatter_props, spawn_slot};
    use crate::game::physics::RapierWorld;

    fn state() -> SimulationState<RapierWorld> {
        SimulationState::new(RapierWorld::new(1.0 / 60.0), PlayArea::default())
            .with_tuning(VehicleTuning::default())
    }

    #[test]
    fn spawn_is_unique_per_id() {
        let mut sim = state();
        let (p, q) = spawn_slot("alpha");
        assert!(sim.spawn_vehicle("alpha", p, q));
        assert!(!sim.spawn_vehicle("alpha", p, q));
        assert_eq!(sim.vehicles(), vec!["alpha".to_string()]);
    }

    #[test]
    fn despawn_is_idempotent() {
        let mut sim = state();
        let (p, q) = spawn_slot("alpha");
        sim.spawn_vehicle("alpha", p, q);
        let bodies = sim.world().body_count();
        assert!(sim.despawn("alpha"));
        assert!(!sim.despawn("alpha"));
        assert_eq!(sim.world().body_count(), bodies - 1);
        assert!(sim.entity_state("alpha").is_none());
    }

    #[test]
    fn vehicle_becomes_grounded_after_landing() {
        let mut sim = state();
        sim.spawn_vehicle("alpha", Vec3::new(0.0, 0.6, 0.0), Quat::IDENTITY);
        let inputs = HashMap::new();
        for _ in 0..60 {
            sim.step(&inputs);
        }
        assert!(sim.is_grounded("alpha"));
    }

    fn contacts(sim: &SimulationState<RapierWorld>, id: &str) -> u32 {
        sim.entities[id].contacts
    }

    /// Step until `done` holds, at most `limit` steps
    fn step_until(
        sim: &mut SimulationState<RapierWorld>,
        limit: usize,
        mut done: impl FnMut(&SimulationState<RapierWorld>) -> bool,
    ) -> bool {
        for _ in 0..limit {
            sim.step(&HashMap::new());
            if done(sim) {
                return true;
            }
        }
        false
    }

    #[test]
    fn grounded_survives_until_last_contact_ends() {
        let mut sim = state();
        sim.spawn_vehicle("alpha", Vec3::new(0.0, 0.6, 0.0), Quat::IDENTITY);
        assert!(step_until(&mut sim, 60, |s| s.is_grounded("alpha")));
        for _ in 0..30 {
            sim.step(&HashMap::new());
        }
        let resting = contacts(&sim, "alpha");
        assert!(resting > 0);

        // A crate overlapping the vehicle's flank adds a second contact
        let flank = PropInfo {
            id: "crate".into(),
            kind: PropKind::Crate,
            p: Vec3::new(1.45, 0.6, 0.0),
            q: Quat::IDENTITY,
        };
        sim.spawn_prop(&flank);
        assert!(step_until(&mut sim, 10, |s| contacts(s, "alpha") > resting));

        // Moving it away ends that contact only
        let body = sim.entities["crate"].body;
        sim.world_mut()
            .set_pose(body, Vec3::new(20.0, 0.6, 20.0), Quat::IDENTITY);
        sim.world_mut().set_linvel(body, Vec3::ZERO);
        let mut stayed_grounded = true;
        assert!(step_until(&mut sim, 10, |s| {
            stayed_grounded &= s.is_grounded("alpha");
            contacts(s, "alpha") == resting
        }));
        assert!(stayed_grounded);

        // Lifting the vehicle ends the last one
        let body = sim.entities["alpha"].body;
        sim.world_mut()
            .set_pose(body, Vec3::new(0.0, 30.0, 0.0), Quat::IDENTITY);
        assert!(step_until(&mut sim, 10, |s| contacts(s, "alpha") == 0));
        assert!(!sim.is_grounded("alpha"));
    }

    #[test]
    fn ball_hitting_crate_bounces_and_reports_impact() {
        let mut sim = SimulationState::new(
            RapierWorld::with_gravity(1.0 / 60.0, Vec3::ZERO),
            PlayArea::default(),
        );
        for (id, kind, x) in [("ball", PropKind::Ball, -3.0), ("crate", PropKind::Crate, 0.0)] {
            sim.spawn_prop(&PropInfo {
                id: id.into(),
                kind,
                p: Vec3::new(x, 5.0, 0.0),
                q: Quat::IDENTITY,
            });
        }
        let ball = sim.entities["ball"].body;
        sim.world_mut().set_linvel(ball, Vec3::new(12.0, 0.0, 0.0));

        let mut bounces = 0;
        let mut impacts = Vec::new();
        for _ in 0..60 {
            let report = sim.step(&HashMap::new());
            bounces += report.bounces;
            impacts.extend(report.impacts);
        }

        assert_eq!(bounces, 1);
        assert_eq!(impacts.len(), 1);
        let impact = &impacts[0];
        let pair = [impact.a.as_str(), impact.b.as_deref().unwrap_or("")];
        assert!(pair.contains(&"ball") && pair.contains(&"crate"));
        assert!(impact.strength > 0.5);
        // The ball is thrown back, the crate pushed on
        assert!(sim.entity_state("ball").unwrap().v.x < 0.0);
        assert!(sim.entity_state("crate").unwrap().v.x > 0.0);
    }

    #[test]
    fn out_of_bounds_prop_is_reset_at_rest() {
        let mut sim = state();
        let props = scatter_props(3, 7);
        for prop in &props {
            sim.spawn_prop(prop);
        }
        let target = &props[1];
        let body = sim.entities[&target.id].body;
        sim.world_mut()
            .set_pose(body, Vec3::new(500.0, 1.0, 0.0), Quat::IDENTITY);
        sim.world_mut().set_linvel(body, Vec3::new(30.0, 0.0, 0.0));

        let report = sim.step(&HashMap::new());

        assert_eq!(report.resets, vec![target.id.clone()]);
        let state = sim.entity_state(&target.id).unwrap();
        assert_eq!(state.p, target.p);
        assert_eq!(state.v, Vec3::ZERO);
        assert_eq!(state.w, Vec3::ZERO);
    }

    #[test]
    fn snapshot_lists_dynamic_entities_in_id_order() {
        let mut sim = state();
        for prop in scatter_props(2, 1) {
            sim.spawn_prop(&prop);
        }
        let (p, q) = spawn_slot("alpha");
        sim.spawn_vehicle("alpha", p, q);
        sim.step(&HashMap::new());

        let snapshot = sim.snapshot(1234);
        let ids: Vec<&str> = snapshot.e.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "prop-0", "prop-1"]);
        assert_eq!(snapshot.tick, 1);
        assert_eq!(snapshot.t, 1234);
    }

    #[test]
    fn lost_body_is_skipped_not_fatal() {
        let mut sim = state();
        let (p, q) = spawn_slot("alpha");
        sim.spawn_vehicle("alpha", p, q);
        let body = sim.entities["alpha"].body;
        sim.world_mut().remove_body(body);

        let mut inputs = HashMap::new();
        inputs.insert("alpha".to_string(), InputSample::new(1.0, 1.0, 1, 0));
        let report = sim.step(&inputs);

        assert!(report.telemetry.is_empty());
        assert!(sim.snapshot(0).e.is_empty());
    }
}
