//! Simulation modules

pub mod collision;
pub mod host;
pub mod layout;
pub mod physics;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod vehicle;
pub mod world;

pub use host::{HostCommand, HostHandle, HostSimulation};
pub use scheduler::FixedStepScheduler;
pub use world::SimulationState;

/// One control sample from a participant. Last sample wins between steps.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InputSample {
    /// Steering in `[-1, 1]`
    pub steer: f32,
    /// Throttle in `[-1, 1]`
    pub throttle: f32,
    /// Derived from the throttle sign
    pub brake: bool,
    pub seq: u32,
    /// Client timestamp in milliseconds
    pub client_time: u64,
}

impl InputSample {
    pub fn new(steer: f32, throttle: f32, seq: u32, client_time: u64) -> Self {
        let throttle = throttle.clamp(-1.0, 1.0);
        Self {
            steer: steer.clamp(-1.0, 1.0),
            throttle,
            brake: throttle < 0.0,
            seq,
            client_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_axes_are_clamped_and_brake_derived() {
        let sample = InputSample::new(3.0, -7.0, 4, 99);
        assert_eq!(sample.steer, 1.0);
        assert_eq!(sample.throttle, -1.0);
        assert!(sample.brake);
        assert!(!InputSample::new(0.0, 0.2, 5, 100).brake);
    }
}
