//! Replicating client: mode switching, snapshot interpolation, transport

pub mod mode;
pub mod probe;
pub mod replica;
pub mod runner;
pub mod transport;

pub use mode::{Mode, ModeController, ModeStatus};
pub use replica::{ClientReplica, RenderPose, SnapshotBuffer};
pub use runner::{ClientRunner, InputSource, ScriptedInput};
