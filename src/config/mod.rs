//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::util::time::{INPUT_TPS, SIMULATION_TPS, SNAPSHOT_TPS};

/// Host configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Physics steps per second
    pub tick_rate: u32,
    /// Snapshots broadcast per second
    pub snapshot_rate: u32,
    /// Liveness sweep interval; sessions silent for two intervals are closed
    pub heartbeat_interval: Duration,

    /// Number of props spawned at world init
    pub prop_count: usize,
    /// Seed for the prop layout
    pub world_seed: u64,
    /// Allowed client origin for CORS (comma-separated, `*` for any)
    pub client_origin: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let config = Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            tick_rate: parse_or("TICK_RATE", SIMULATION_TPS)?,
            snapshot_rate: parse_or("SNAPSHOT_RATE", SNAPSHOT_TPS)?,
            heartbeat_interval: Duration::from_secs(parse_or("HEARTBEAT_SECS", 15u64)?),
            prop_count: parse_or("PROP_COUNT", 8usize)?,
            world_seed: parse_or("WORLD_SEED", 0x5EED_u64)?,
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_else(|_| "*".to_string()),
        };

        if config.tick_rate == 0 {
            return Err(ConfigError::OutOfRange("TICK_RATE"));
        }
        if config.snapshot_rate == 0 || config.snapshot_rate > config.tick_rate {
            return Err(ConfigError::OutOfRange("SNAPSHOT_RATE"));
        }
        if config.heartbeat_interval.is_zero() {
            return Err(ConfigError::OutOfRange("HEARTBEAT_SECS"));
        }

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            tick_rate: SIMULATION_TPS,
            snapshot_rate: SNAPSHOT_TPS,
            heartbeat_interval: Duration::from_secs(15),
            prop_count: 8,
            world_seed: 0x5EED,
            client_origin: "*".to_string(),
        }
    }
}

/// Client configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base HTTP URL of the authoritative host
    pub host_url: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Upper bound on the reachability probe
    pub probe_timeout: Duration,
    /// Delay before a reconnect attempt while offline
    pub reconnect_backoff: Duration,
    /// Look-behind applied to the render timeline
    pub render_delay: Duration,
    /// Input samples sent per second
    pub input_rate: u32,
    /// Props spawned in the offline world
    pub offline_prop_count: usize,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            host_url: env::var("HOST_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            probe_timeout: Duration::from_millis(parse_or("PROBE_TIMEOUT_MS", 1800u64)?),
            reconnect_backoff: Duration::from_millis(parse_or("RECONNECT_BACKOFF_MS", 2500u64)?),
            render_delay: Duration::from_millis(parse_or("RENDER_DELAY_MS", 120u64)?),
            input_rate: parse_or("INPUT_RATE", INPUT_TPS)?,
            offline_prop_count: parse_or("PROP_COUNT", 8usize)?,
        };

        if config.input_rate == 0 {
            return Err(ConfigError::OutOfRange("INPUT_RATE"));
        }
        if !config.host_url.starts_with("http://") && !config.host_url.starts_with("https://") {
            return Err(ConfigError::InvalidUrl(config.host_url));
        }

        Ok(config)
    }

    /// WebSocket endpoint derived from the host URL
    pub fn ws_url(&self) -> String {
        let base = self.host_url.trim_end_matches('/');
        format!(
            "{}/ws",
            base.replacen("https://", "wss://", 1)
                .replacen("http://", "ws://", 1)
        )
    }

    /// Health endpoint derived from the host URL
    pub fn health_url(&self) -> String {
        format!("{}/health", self.host_url.trim_end_matches('/'))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host_url: "http://127.0.0.1:8080".to_string(),
            log_level: "info".to_string(),
            probe_timeout: Duration::from_millis(1800),
            reconnect_backoff: Duration::from_millis(2500),
            render_delay: Duration::from_millis(120),
            input_rate: INPUT_TPS,
            offline_prop_count: 8,
        }
    }
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Value out of range for environment variable: {0}")]
    OutOfRange(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Host URL must be http(s): {0}")]
    InvalidUrl(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_follows_host_scheme() {
        let mut config = ClientConfig::default();
        config.host_url = "https://race.example.org/".to_string();
        assert_eq!(config.ws_url(), "wss://race.example.org/ws");
        assert_eq!(config.health_url(), "https://race.example.org/health");

        config.host_url = "http://127.0.0.1:8080".to_string();
        assert_eq!(config.ws_url(), "ws://127.0.0.1:8080/ws");
    }

    #[test]
    fn defaults_match_protocol_rates() {
        let config = Config::default();
        assert_eq!(config.tick_rate, 60);
        assert_eq!(config.snapshot_rate, 20);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
    }
}
