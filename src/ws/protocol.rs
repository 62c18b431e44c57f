//! WebSocket protocol message definitions
//! These are the wire types for host-client communication. Every frame is a
//! single UTF-8 JSON object tagged by `type`.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Stable application-level entity id (session id for vehicles, `prop-N` for props)
pub type EntityId = String;

/// Prop shapes spawned at world init
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropKind {
    /// Heavy box, realistic response
    Crate,
    /// Light sphere with exaggerated toy bounce
    Ball,
    /// Light box with exaggerated toy bounce
    Cone,
}

impl PropKind {
    /// Props that get the gameplay "toy" contact response on top of the engine's
    pub fn is_toy(self) -> bool {
        matches!(self, Self::Ball | Self::Cone)
    }
}

/// Per-entity state in a snapshot. Short field names keep payloads small.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub id: EntityId,
    /// Position
    pub p: Vec3,
    /// Orientation quaternion `[x, y, z, w]`
    pub q: Quat,
    /// Linear velocity
    pub v: Vec3,
    /// Angular velocity
    pub w: Vec3,
}

/// Point-in-time capture of every dynamic entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Server tick index
    pub tick: u64,
    /// Server wall-clock time in milliseconds
    pub t: u64,
    /// Dynamic entity states
    pub e: Vec<EntityState>,
}

impl Snapshot {
    pub fn entity(&self, id: &str) -> Option<&EntityState> {
        self.e.iter().find(|e| e.id == id)
    }
}

/// Player listing in `welcome`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: EntityId,
}

/// Prop listing in `welcome`, with the transform it resets to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropInfo {
    pub id: EntityId,
    pub kind: PropKind,
    pub p: Vec3,
    pub q: Quat,
}

/// Messages sent from host to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMsg {
    /// First message on a session
    Welcome {
        /// Assigned session id (also the id of the session's vehicle)
        id: EntityId,
        tick_rate: u32,
        snapshot_rate: u32,
        /// Server wall-clock time in milliseconds, for the clock offset
        server_time: u64,
        /// Other players already in the world
        players: Vec<PlayerInfo>,
        /// Authoritative prop set
        props: Vec<PropInfo>,
        /// Full world state at join time
        snapshot: Snapshot,
    },

    /// Periodic world state
    Snapshot(Snapshot),

    /// Another player joined
    PlayerJoined { id: EntityId },

    /// A player left (explicitly or by timeout)
    PlayerLeft { id: EntityId },

    /// Liveness probe for idle sessions
    Ping { t: u64 },

    /// Reply to a client ping
    Pong { t: u64 },
}

impl ServerMsg {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Parse)
    }
}

/// Messages sent from client to host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMsg {
    /// Control input
    Input {
        /// Steering (-1.0 = full left, 1.0 = full right)
        steer: f32,
        /// Throttle (-1.0 = full reverse, 1.0 = full forward)
        throttle: f32,
        /// Informational; the host derives braking from the throttle sign
        #[serde(default)]
        brake: bool,
        /// Monotonic per-session sequence number
        seq: u32,
        /// Client timestamp in milliseconds
        t: u64,
    },

    /// Client-initiated latency probe
    Ping { t: u64 },

    /// Reply to a host ping
    Pong { t: u64 },
}

impl ClientMsg {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Parse and validate a client frame
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let msg: Self = serde_json::from_str(text).map_err(ProtocolError::Parse)?;
        if let Self::Input {
            steer, throttle, ..
        } = &msg
        {
            if !steer.is_finite() || !throttle.is_finite() {
                return Err(ProtocolError::NonFinite);
            }
        }
        Ok(msg)
    }
}

/// Protocol errors. Callers drop the offending frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Non-finite input axis")]
    NonFinite,
}
