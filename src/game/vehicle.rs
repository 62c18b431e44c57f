//! Arcade vehicle dynamics
//!
//! Controls are turned into impulses on the vehicle's rigid body before each
//! physics step. The solver handles everything else (suspension is just the
//! box collider resting on the ground).

use glam::Vec3;

use super::physics::PhysicsWorld;
use super::InputSample;

/// Per-step lateral grip correction is clamped to `side_grip * dt * GRIP_CLAMP_FACTOR`
pub const GRIP_CLAMP_FACTOR: f32 = 8.0;
/// Overspeed tolerated before the soft clamp engages
pub const SPEED_CLAMP_MARGIN: f32 = 0.35;

/// Vehicle forward axis in body space
pub const FORWARD: Vec3 = Vec3::Z;
/// Vehicle right axis in body space (+Y up, +Z forward)
pub const RIGHT: Vec3 = Vec3::NEG_X;

/// Handling constants
#[derive(Debug, Clone, Copy)]
pub struct VehicleTuning {
    /// Forward acceleration at full throttle, m/s²
    pub engine_accel: f32,
    /// Traction multiplier while no ground contact exists
    pub airborne_traction: f32,
    /// Yaw acceleration at full steer and full authority, rad/s²
    pub steer_accel: f32,
    /// Speed at which steering reaches full authority
    pub steer_ramp_speed: f32,
    /// Fraction of authority lost at top speed
    pub steer_high_speed_falloff: f32,
    /// Forward speed below which the vehicle counts as reversing
    pub reverse_threshold: f32,
    /// Fraction of sideways velocity cancelled per second
    pub side_grip: f32,
    pub grip_clamp_factor: f32,
    /// Downward acceleration per m/s of speed while grounded
    pub downforce: f32,
    /// Same, airborne
    pub airborne_downforce: f32,
    /// Angular velocity damping per second
    pub angular_damping: f32,
    /// Hard yaw-rate limit, rad/s
    pub max_yaw_rate: f32,
    pub max_forward_speed: f32,
    pub max_reverse_speed: f32,
    pub speed_margin: f32,
    /// Fraction of the overage removed per step once the clamp engages
    pub speed_clamp_gain: f32,
    /// Displayed steering angle at full steer, radians
    pub max_steer_angle: f32,
}

impl Default for VehicleTuning {
    fn default() -> Self {
        Self {
            engine_accel: 18.0,
            airborne_traction: 0.3,
            steer_accel: 14.0,
            steer_ramp_speed: 3.0,
            steer_high_speed_falloff: 0.55,
            reverse_threshold: 0.5,
            side_grip: 6.0,
            grip_clamp_factor: GRIP_CLAMP_FACTOR,
            downforce: 0.35,
            airborne_downforce: 0.1,
            angular_damping: 2.5,
            max_yaw_rate: 2.6,
            max_forward_speed: 24.0,
            max_reverse_speed: 9.0,
            speed_margin: SPEED_CLAMP_MARGIN,
            speed_clamp_gain: 0.6,
            max_steer_angle: 0.55,
        }
    }
}

impl VehicleTuning {
    /// Steering authority in `[0, 1]`: zero at rest, full around the ramp speed,
    /// tapering off towards top speed.
    pub fn steer_authority(&self, speed: f32) -> f32 {
        let ramp = (speed / self.steer_ramp_speed).clamp(0.0, 1.0);
        let t = (speed / self.max_forward_speed).clamp(0.0, 1.0);
        ramp * (1.0 - self.steer_high_speed_falloff * t)
    }

    /// Signed yaw acceleration for a steer input. Positive steer turns right,
    /// which is a negative rotation about +Y. Reversing flips the sign so the
    /// wheel feels the same in both directions.
    pub fn yaw_accel(&self, steer: f32, forward_speed: f32, speed: f32) -> f32 {
        let direction = if forward_speed < -self.reverse_threshold {
            -1.0
        } else {
            1.0
        };
        -steer * direction * self.steer_accel * self.steer_authority(speed)
    }

    /// Top speed for the current direction of travel
    pub fn max_speed(&self, forward_speed: f32) -> f32 {
        if forward_speed >= 0.0 {
            self.max_forward_speed
        } else {
            self.max_reverse_speed
        }
    }
}

/// Auxiliary scalars for the rendering boundary
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VehicleTelemetry {
    pub speed: f32,
    pub forward_speed: f32,
    /// Displayed front-wheel angle, radians
    pub steering: f32,
    pub braking: bool,
    pub grounded: bool,
}

/// Apply one step of controls to a vehicle body.
///
/// Returns `None` without touching anything if the engine no longer knows the
/// body.
pub fn apply_vehicle_controls<W: PhysicsWorld>(
    world: &mut W,
    body: W::Body,
    input: &InputSample,
    grounded: bool,
    tuning: &VehicleTuning,
) -> Option<VehicleTelemetry> {
    let rotation = world.rotation(body)?;
    let linvel = world.linvel(body)?;
    let mass = world.mass(body)?;
    let dt = world.dt();

    let forward = rotation * FORWARD;
    let right = rotation * RIGHT;
    let traction = if grounded { 1.0 } else { tuning.airborne_traction };

    let speed = linvel.length();
    let forward_speed = linvel.dot(forward);

    // Engine
    let engine = forward * (input.throttle * tuning.engine_accel * traction * mass * dt);
    world.apply_impulse(body, engine);

    // Steering
    let yaw = tuning.yaw_accel(input.steer, forward_speed, speed) * traction;
    world.apply_torque_impulse(body, Vec3::Y * (yaw * mass * dt));

    // Lateral grip
    let lateral = linvel.dot(right);
    let max_correction = tuning.side_grip * dt * tuning.grip_clamp_factor;
    let correction = (-lateral * (tuning.side_grip * dt).min(1.0) * traction)
        .clamp(-max_correction, max_correction);
    world.apply_impulse(body, right * (correction * mass));

    // Downforce
    let downforce = if grounded {
        tuning.downforce
    } else {
        tuning.airborne_downforce
    };
    world.apply_impulse(body, Vec3::NEG_Y * (speed * downforce * mass * dt));

    // Angular damping and yaw clamp
    if let Some(angvel) = world.angvel(body) {
        let mut damped = angvel * (1.0 - tuning.angular_damping * dt).max(0.0);
        damped.y = damped.y.clamp(-tuning.max_yaw_rate, tuning.max_yaw_rate);
        world.set_angvel(body, damped);
    }

    // Soft speed clamp
    if let Some(velocity) = world.linvel(body) {
        let speed = velocity.length();
        let max_speed = tuning.max_speed(velocity.dot(forward));
        if speed > max_speed + tuning.speed_margin {
            let overage = speed - max_speed;
            let brake = -velocity / speed * (overage * tuning.speed_clamp_gain * mass);
            world.apply_impulse(body, brake);
        }
    }

    Some(VehicleTelemetry {
        speed,
        forward_speed,
        steering: input.steer * tuning.max_steer_angle,
        braking: input.brake && forward_speed > tuning.reverse_threshold,
        grounded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::physics::{BodyDesc, RapierWorld, Shape};
    use glam::Quat;

    fn floating_car() -> (RapierWorld, <RapierWorld as PhysicsWorld>::Body) {
        let mut world = RapierWorld::with_gravity(1.0 / 60.0, Vec3::ZERO);
        let desc = BodyDesc::dynamic(Shape::Cuboid(Vec3::new(0.9, 0.4, 1.8)), 120.0)
            .at(Vec3::new(0.0, 5.0, 0.0), Quat::IDENTITY);
        let (body, _) = world.create_body(&desc);
        // Let the engine settle mass properties before impulses are applied
        world.step();
        (world, body)
    }

    #[test]
    fn steering_is_strongest_at_mid_speed() {
        let tuning = VehicleTuning::default();
        let rest = tuning.steer_authority(0.0);
        let mid = tuning.steer_authority(tuning.steer_ramp_speed);
        let top = tuning.steer_authority(tuning.max_forward_speed);
        assert_eq!(rest, 0.0);
        assert!(mid > top);
        assert!(top > 0.0);
    }

    #[test]
    fn steering_flips_in_reverse() {
        let tuning = VehicleTuning::default();
        let forward = tuning.yaw_accel(1.0, 5.0, 5.0);
        let reverse = tuning.yaw_accel(1.0, -5.0, 5.0);
        assert!(forward < 0.0);
        assert_eq!(forward, -reverse);
    }

    #[test]
    fn overspeed_is_reduced_next_step() {
        let (mut world, body) = floating_car();
        let tuning = VehicleTuning::default();
        world.set_linvel(body, Vec3::new(0.0, 0.0, tuning.max_forward_speed + 10.0));
        let before = world.linvel(body).unwrap().length();

        apply_vehicle_controls(&mut world, body, &InputSample::default(), false, &tuning).unwrap();
        world.step();

        let after = world.linvel(body).unwrap().length();
        assert!(after < before, "speed {after} should drop below {before}");
    }

    #[test]
    fn speed_within_margin_is_untouched_by_clamp() {
        let (mut world, body) = floating_car();
        let tuning = VehicleTuning::default();
        let cruise = tuning.max_forward_speed + tuning.speed_margin * 0.5;
        world.set_linvel(body, Vec3::new(0.0, 0.0, cruise));

        apply_vehicle_controls(&mut world, body, &InputSample::default(), false, &tuning).unwrap();

        let after = world.linvel(body).unwrap();
        assert!((after.z - cruise).abs() < 1e-3);
    }

    #[test]
    fn throttle_pushes_along_body_forward() {
        let (mut world, body) = floating_car();
        let tuning = VehicleTuning::default();
        let yaw = Quat::from_rotation_y(std::f32::consts::FRAC_PI_2);
        world.set_pose(body, Vec3::new(0.0, 5.0, 0.0), yaw);

        let input = InputSample::new(0.0, 1.0, 1, 0);
        apply_vehicle_controls(&mut world, body, &input, true, &tuning).unwrap();

        // Forward (+Z) rotated a quarter turn about +Y points along +X
        let v = world.linvel(body).unwrap();
        assert!(v.x > 0.0);
        assert!(v.z.abs() < 1e-3);
    }

    #[test]
    fn yaw_rate_is_clamped() {
        let (mut world, body) = floating_car();
        let tuning = VehicleTuning::default();
        world.set_angvel(body, Vec3::new(0.0, 50.0, 0.0));

        apply_vehicle_controls(&mut world, body, &InputSample::default(), true, &tuning).unwrap();

        assert!(world.angvel(body).unwrap().y <= tuning.max_yaw_rate + 1e-4);
    }

    #[test]
    fn missing_body_is_a_noop() {
        let (mut world, body) = floating_car();
        assert!(world.remove_body(body));
        let tuning = VehicleTuning::default();
        assert!(
            apply_vehicle_controls(&mut world, body, &InputSample::default(), true, &tuning)
                .is_none()
        );
    }
}
