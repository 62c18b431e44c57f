//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::HostHandle;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub host: HostHandle,
}

impl AppState {
    pub fn new(config: Config, host: HostHandle) -> Self {
        Self {
            config: Arc::new(config),
            host,
        }
    }
}
