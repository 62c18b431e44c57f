//! Fixed-timestep accumulator
//!
//! Wall-clock frame deltas are accumulated and consumed in constant-size
//! simulation steps. Two caps are applied on every call, not only under load:
//! a single frame contributes at most [`MAX_FRAME_DELTA`] (tab suspension,
//! debugger pauses) and the accumulator never holds more than
//! [`MAX_ACCUMULATED`]. Time above either cap is discarded, never iterated.
//!
//! Accumulation is done on [`Duration`] so step counts are exact integer
//! arithmetic rather than drifting float sums.

use std::time::Duration;

use glam::{Quat, Vec3};

/// Upper bound on one frame's contribution
pub const MAX_FRAME_DELTA: Duration = Duration::from_millis(50);
/// Upper bound on the accumulator ("spiral of death" guard)
pub const MAX_ACCUMULATED: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct FixedStepScheduler {
    step: Duration,
    max_frame: Duration,
    max_accumulated: Duration,
    accumulator: Duration,
    total_steps: u64,
}

impl FixedStepScheduler {
    /// Scheduler stepping `steps_per_second` times per simulated second
    pub fn new(steps_per_second: u32) -> Self {
        let step = Duration::from_nanos(1_000_000_000 / u64::from(steps_per_second.max(1)));
        Self::with_limits(step, MAX_FRAME_DELTA, MAX_ACCUMULATED)
    }

    pub fn with_limits(step: Duration, max_frame: Duration, max_accumulated: Duration) -> Self {
        Self {
            step,
            max_frame,
            max_accumulated: max_accumulated.max(step),
            accumulator: Duration::ZERO,
            total_steps: 0,
        }
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    pub fn step_secs(&self) -> f32 {
        self.step.as_secs_f32()
    }

    /// Accumulate `dt` and return how many fixed steps are due
    pub fn advance(&mut self, dt: Duration) -> u32 {
        let dt = dt.min(self.max_frame);
        self.accumulator = (self.accumulator + dt).min(self.max_accumulated);

        let mut steps = 0;
        while self.accumulator >= self.step {
            self.accumulator -= self.step;
            steps += 1;
        }
        self.total_steps += u64::from(steps);
        steps
    }

    /// Accumulate `dt` and invoke `step_fn` once per due step
    pub fn advance_with<F: FnMut()>(&mut self, dt: Duration, mut step_fn: F) -> u32 {
        let steps = self.advance(dt);
        for _ in 0..steps {
            step_fn();
        }
        steps
    }

    /// Fraction of a step left in the accumulator, in `[0, 1)`
    pub fn alpha(&self) -> f32 {
        (self.accumulator.as_secs_f64() / self.step.as_secs_f64()) as f32
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    pub fn reset(&mut self) {
        self.accumulator = Duration::ZERO;
    }
}

/// Previous and current physics pose of one body, blended by scheduler alpha
/// when rendering at a different rate than stepping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseBlend {
    pub previous: (Vec3, Quat),
    pub current: (Vec3, Quat),
}

impl PoseBlend {
    pub fn new(position: Vec3, orientation: Quat) -> Self {
        Self {
            previous: (position, orientation),
            current: (position, orientation),
        }
    }

    /// Record the pose after a physics step
    pub fn push(&mut self, position: Vec3, orientation: Quat) {
        self.previous = self.current;
        self.current = (position, orientation);
    }

    pub fn blend(&self, alpha: f32) -> (Vec3, Quat) {
        let alpha = alpha.clamp(0.0, 1.0);
        (
            self.previous.0.lerp(self.current.0, alpha),
            self.previous.1.slerp(self.current.1, alpha),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_count_matches_accumulated_time() {
        let mut scheduler = FixedStepScheduler::new(60);
        let step = scheduler.step();
        assert!((scheduler.step_secs() - 1.0 / 60.0).abs() < 1e-6);
        let deltas_ms = [16u64, 17, 3, 40, 33, 16, 1, 49, 25, 8, 16, 16];

        let mut total = Duration::ZERO;
        let mut steps = 0u64;
        for ms in deltas_ms {
            let dt = Duration::from_millis(ms);
            total += dt;
            steps += u64::from(scheduler.advance(dt));
        }

        let expected = (total.as_nanos() / step.as_nanos()) as u64;
        assert_eq!(steps, expected);
        assert_eq!(scheduler.total_steps(), expected);
    }

    #[test]
    fn spike_is_clamped_to_frame_cap() {
        let mut scheduler = FixedStepScheduler::new(60);
        // 50ms / 16.67ms = 3 steps, never 60
        assert_eq!(scheduler.advance(Duration::from_secs(1)), 3);
        assert!(scheduler.alpha() < 1.0);
    }

    #[test]
    fn accumulator_cap_discards_excess() {
        let step = Duration::from_millis(10);
        let mut scheduler =
            FixedStepScheduler::with_limits(step, Duration::from_secs(1), Duration::from_millis(40));
        // 1s of frame time is clipped to 40ms of simulation
        assert_eq!(scheduler.advance(Duration::from_secs(1)), 4);
        assert_eq!(scheduler.alpha(), 0.0);
    }

    #[test]
    fn callback_runs_once_per_step_and_alpha_is_residual() {
        let mut scheduler = FixedStepScheduler::with_limits(
            Duration::from_millis(10),
            MAX_FRAME_DELTA,
            MAX_ACCUMULATED,
        );
        let mut calls = 0;
        let steps = scheduler.advance_with(Duration::from_millis(25), || calls += 1);
        assert_eq!(steps, 2);
        assert_eq!(calls, 2);
        assert!((scheduler.alpha() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn pose_blend_endpoints() {
        let mut blend = PoseBlend::new(Vec3::ZERO, Quat::IDENTITY);
        blend.push(Vec3::new(2.0, 0.0, 0.0), Quat::from_rotation_y(1.0));
        assert_eq!(blend.blend(0.0).0, Vec3::ZERO);
        assert_eq!(blend.blend(1.0).0, Vec3::new(2.0, 0.0, 0.0));
        assert!((blend.blend(0.5).0.x - 1.0).abs() < 1e-6);
    }
}
