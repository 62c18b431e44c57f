//! Physics engine boundary
//!
//! The simulation only talks to the rigid-body solver through
//! [`PhysicsWorld`]. Engine handles stay behind this seam; the rest of the
//! crate addresses entities by application id and keeps a side table of
//! handles (see [`crate::game::world`]).

mod rapier;

use std::fmt::Debug;
use std::hash::Hash;

use glam::{Quat, Vec3};

pub use rapier::RapierWorld;

/// Collision shape
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape {
    /// Box given by half extents
    Cuboid(Vec3),
    /// Sphere given by radius
    Ball(f32),
}

/// Contact material of a collider
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    pub friction: f32,
    pub restitution: f32,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            friction: 0.5,
            restitution: 0.2,
        }
    }
}

/// Everything needed to create a body with one attached collider
#[derive(Debug, Clone, Copy)]
pub struct BodyDesc {
    pub position: Vec3,
    pub orientation: Quat,
    /// Participates in integration; `false` creates a fixed body
    pub dynamic: bool,
    pub shape: Shape,
    pub mass: f32,
    pub material: Material,
    pub linear_damping: f32,
    pub angular_damping: f32,
}

impl BodyDesc {
    pub fn dynamic(shape: Shape, mass: f32) -> Self {
        Self {
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            dynamic: true,
            shape,
            mass,
            material: Material::default(),
            linear_damping: 0.0,
            angular_damping: 0.0,
        }
    }

    pub fn at(mut self, position: Vec3, orientation: Quat) -> Self {
        self.position = position;
        self.orientation = orientation;
        self
    }

    pub fn material(mut self, material: Material) -> Self {
        self.material = material;
        self
    }

    pub fn damping(mut self, linear: f32, angular: f32) -> Self {
        self.linear_damping = linear;
        self.angular_damping = angular;
        self
    }
}

/// One entry of the engine's collision queue
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactEvent<C> {
    pub collider_a: C,
    pub collider_b: C,
    /// `true` on contact begin, `false` on contact end
    pub started: bool,
    /// World-space contact normal pointing from A to B, when the engine has one
    pub normal: Option<Vec3>,
}

/// The operations the simulation needs from a rigid-body engine.
///
/// Getters return `None` for handles the engine no longer knows; callers treat
/// that as "entity currently absent".
pub trait PhysicsWorld {
    type Body: Copy + Eq + Hash + Debug;
    type Collider: Copy + Eq + Hash + Debug;

    /// Advance exactly one fixed step
    fn step(&mut self);

    /// Fixed step length in seconds
    fn dt(&self) -> f32;

    fn create_body(&mut self, desc: &BodyDesc) -> (Self::Body, Self::Collider);

    /// Collider without a body (ground, walls)
    fn create_static_collider(
        &mut self,
        shape: Shape,
        position: Vec3,
        material: Material,
    ) -> Self::Collider;

    /// Returns `false` if the body was already gone
    fn remove_body(&mut self, body: Self::Body) -> bool;

    fn translation(&self, body: Self::Body) -> Option<Vec3>;
    fn rotation(&self, body: Self::Body) -> Option<Quat>;
    fn linvel(&self, body: Self::Body) -> Option<Vec3>;
    fn angvel(&self, body: Self::Body) -> Option<Vec3>;
    fn mass(&self, body: Self::Body) -> Option<f32>;
    fn is_dynamic(&self, body: Self::Body) -> bool;

    fn set_pose(&mut self, body: Self::Body, position: Vec3, rotation: Quat);
    fn set_linvel(&mut self, body: Self::Body, linvel: Vec3);
    fn set_angvel(&mut self, body: Self::Body, angvel: Vec3);
    fn apply_impulse(&mut self, body: Self::Body, impulse: Vec3);
    fn apply_torque_impulse(&mut self, body: Self::Body, torque: Vec3);

    fn collider_material(&self, collider: Self::Collider) -> Option<Material>;
    fn collider_body(&self, collider: Self::Collider) -> Option<Self::Body>;

    /// Take every collision event produced since the last drain
    fn drain_collision_events(&mut self) -> Vec<ContactEvent<Self::Collider>>;
}
