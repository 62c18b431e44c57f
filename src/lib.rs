//! Vehicle sync - authoritative vehicle physics host and replicating client
//!
//! The host runs the only simulation that matters: a fixed-step rigid-body
//! world of vehicles and props, streamed to clients as snapshots over
//! WebSocket. Clients interpolate those snapshots behind a render delay and
//! fall back to a local offline world when no host is reachable.

pub mod app;
pub mod client;
pub mod config;
pub mod game;
pub mod http;
pub mod util;
pub mod ws;
