//! `rapier3d` implementation of the physics boundary

use glam::{Quat, Vec3};
use parking_lot::Mutex;
use rapier3d::prelude::*;

use super::{BodyDesc, ContactEvent, Material, PhysicsWorld, Shape};

/// Collects collision events during a pipeline step
#[derive(Default)]
struct ContactCollector {
    events: Mutex<Vec<ContactEvent<ColliderHandle>>>,
}

impl EventHandler for ContactCollector {
    fn handle_collision_event(
        &self,
        _bodies: &RigidBodySet,
        _colliders: &ColliderSet,
        event: CollisionEvent,
        contact_pair: Option<&ContactPair>,
    ) {
        let normal = contact_pair.and_then(manifold_normal);
        self.events.lock().push(ContactEvent {
            collider_a: event.collider1(),
            collider_b: event.collider2(),
            started: event.started(),
            normal,
        });
    }

    fn handle_contact_force_event(
        &self,
        _dt: Real,
        _bodies: &RigidBodySet,
        _colliders: &ColliderSet,
        _contact_pair: &ContactPair,
        _total_force_magnitude: Real,
    ) {
    }
}

/// Normal of the first manifold that has contact points
fn manifold_normal(pair: &ContactPair) -> Option<Vec3> {
    pair.manifolds
        .iter()
        .filter(|m| !m.points.is_empty())
        .map(|m| Vec3::new(m.data.normal.x, m.data.normal.y, m.data.normal.z))
        .find(|n| n.length_squared() > 1e-6)
        .map(Vec3::normalize)
}

pub struct RapierWorld {
    pipeline: PhysicsPipeline,
    integration_parameters: IntegrationParameters,
    islands: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    bodies: RigidBodySet,
    colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    gravity: Vector,
    collector: ContactCollector,
}

impl RapierWorld {
    pub const GRAVITY: f32 = -9.81;

    pub fn new(dt: f32) -> Self {
        Self::with_gravity(dt, Vec3::new(0.0, Self::GRAVITY, 0.0))
    }

    pub fn with_gravity(dt: f32, gravity: Vec3) -> Self {
        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = dt;
        integration_parameters.min_ccd_dt = dt / 100.0;

        Self {
            pipeline: PhysicsPipeline::new(),
            integration_parameters,
            islands: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            gravity: to_vector(gravity),
            collector: ContactCollector::default(),
        }
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    fn collider_builder(shape: Shape) -> ColliderBuilder {
        match shape {
            Shape::Cuboid(half) => ColliderBuilder::cuboid(half.x, half.y, half.z),
            Shape::Ball(radius) => ColliderBuilder::ball(radius),
        }
    }
}

fn to_vector(v: Vec3) -> Vector {
    Vector::new(v.x, v.y, v.z)
}

fn to_pose(position: Vec3, rotation: Quat) -> Pose {
    let rot = Rotation::from_xyzw(rotation.x, rotation.y, rotation.z, rotation.w).normalize();
    Pose::from_parts(to_vector(position), rot)
}

impl PhysicsWorld for RapierWorld {
    type Body = RigidBodyHandle;
    type Collider = ColliderHandle;

    fn step(&mut self) {
        self.pipeline.step(
            self.gravity,
            &self.integration_parameters,
            &mut self.islands,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            &(),
            &self.collector,
        );
    }

    fn dt(&self) -> f32 {
        self.integration_parameters.dt
    }

    fn create_body(&mut self, desc: &BodyDesc) -> (RigidBodyHandle, ColliderHandle) {
        let builder = if desc.dynamic {
            RigidBodyBuilder::dynamic().ccd_enabled(true)
        } else {
            RigidBodyBuilder::fixed()
        };
        let body = builder
            .translation(to_vector(desc.position))
            .linear_damping(desc.linear_damping)
            .angular_damping(desc.angular_damping)
            .build();
        let handle = self.bodies.insert(body);
        if let Some(body) = self.bodies.get_mut(handle) {
            body.set_position(to_pose(desc.position, desc.orientation), true);
        }

        let collider = Self::collider_builder(desc.shape)
            .mass(desc.mass)
            .friction(desc.material.friction)
            .restitution(desc.material.restitution)
            .active_events(ActiveEvents::COLLISION_EVENTS)
            .build();
        let collider = self
            .colliders
            .insert_with_parent(collider, handle, &mut self.bodies);

        (handle, collider)
    }

    fn create_static_collider(
        &mut self,
        shape: Shape,
        position: Vec3,
        material: Material,
    ) -> ColliderHandle {
        let collider = Self::collider_builder(shape)
            .translation(to_vector(position))
            .friction(material.friction)
            .restitution(material.restitution)
            .build();
        self.colliders.insert(collider)
    }

    fn remove_body(&mut self, body: RigidBodyHandle) -> bool {
        self.bodies
            .remove(
                body,
                &mut self.islands,
                &mut self.colliders,
                &mut self.impulse_joints,
                &mut self.multibody_joints,
                true,
            )
            .is_some()
    }

    fn translation(&self, body: RigidBodyHandle) -> Option<Vec3> {
        self.bodies.get(body).map(|b| {
            let t = b.translation();
            Vec3::new(t.x, t.y, t.z)
        })
    }

    fn rotation(&self, body: RigidBodyHandle) -> Option<Quat> {
        self.bodies.get(body).map(|b| {
            let r = *b.rotation();
            Quat::from_xyzw(r.x, r.y, r.z, r.w)
        })
    }

    fn linvel(&self, body: RigidBodyHandle) -> Option<Vec3> {
        self.bodies.get(body).map(|b| {
            let v = b.linvel();
            Vec3::new(v.x, v.y, v.z)
        })
    }

    fn angvel(&self, body: RigidBodyHandle) -> Option<Vec3> {
        self.bodies.get(body).map(|b| {
            let w = b.angvel();
            Vec3::new(w.x, w.y, w.z)
        })
    }

    fn mass(&self, body: RigidBodyHandle) -> Option<f32> {
        self.bodies.get(body).map(|b| b.mass())
    }

    fn is_dynamic(&self, body: RigidBodyHandle) -> bool {
        self.bodies.get(body).is_some_and(|b| b.is_dynamic())
    }

    fn set_pose(&mut self, body: RigidBodyHandle, position: Vec3, rotation: Quat) {
        if let Some(body) = self.bodies.get_mut(body) {
            body.set_position(to_pose(position, rotation), true);
        }
    }

    fn set_linvel(&mut self, body: RigidBodyHandle, linvel: Vec3) {
        if let Some(body) = self.bodies.get_mut(body) {
            body.set_linvel(to_vector(linvel), true);
        }
    }

    fn set_angvel(&mut self, body: RigidBodyHandle, angvel: Vec3) {
        if let Some(body) = self.bodies.get_mut(body) {
            body.set_angvel(to_vector(angvel), true);
        }
    }

    fn apply_impulse(&mut self, body: RigidBodyHandle, impulse: Vec3) {
        if let Some(body) = self.bodies.get_mut(body) {
            body.apply_impulse(to_vector(impulse), true);
        }
    }

    fn apply_torque_impulse(&mut self, body: RigidBodyHandle, torque: Vec3) {
        if let Some(body) = self.bodies.get_mut(body) {
            body.apply_torque_impulse(to_vector(torque), true);
        }
    }

    fn collider_material(&self, collider: ColliderHandle) -> Option<Material> {
        self.colliders.get(collider).map(|c| Material {
            friction: c.friction(),
            restitution: c.restitution(),
        })
    }

    fn collider_body(&self, collider: ColliderHandle) -> Option<RigidBodyHandle> {
        self.colliders.get(collider).and_then(|c| c.parent())
    }

    fn drain_collision_events(&mut self) -> Vec<ContactEvent<ColliderHandle>> {
        std::mem::take(&mut *self.collector.events.lock())
    }
}
