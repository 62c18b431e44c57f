//! Per-connection session state on the host
//!
//! The connection handler and the simulation task share exactly one thing per
//! session: an [`InputMailbox`]. The handler overwrites it on every input frame;
//! the simulation reads it once per step. Everything else (phase, outbound
//! channel, entity) is owned by the simulation task.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::InputSample;
use crate::ws::protocol::EntityId;

/// Session lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Connecting,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Default)]
struct MailboxSlot {
    latest: Option<InputSample>,
    last_seq: Option<u32>,
    last_seen_ms: u64,
    closed: bool,
}

/// Single-slot input mailbox. Not a queue: a burst of inputs between two steps
/// collapses to the newest one.
#[derive(Debug, Default)]
pub struct InputMailbox {
    slot: Mutex<MailboxSlot>,
}

impl InputMailbox {
    pub fn new(now_ms: u64) -> Self {
        Self {
            slot: Mutex::new(MailboxSlot {
                last_seen_ms: now_ms,
                ..MailboxSlot::default()
            }),
        }
    }

    /// Store `sample` unless its sequence number is not newer than the last
    /// accepted one. Any frame counts as liveness, accepted or not.
    pub fn offer(&self, sample: InputSample, now_ms: u64) -> bool {
        let mut slot = self.slot.lock();
        slot.last_seen_ms = slot.last_seen_ms.max(now_ms);
        if slot.closed {
            return false;
        }
        if slot.last_seq.is_some_and(|last| sample.seq <= last) {
            return false;
        }
        slot.last_seq = Some(sample.seq);
        slot.latest = Some(sample);
        true
    }

    /// Record liveness without input
    pub fn touch(&self, now_ms: u64) {
        let mut slot = self.slot.lock();
        slot.last_seen_ms = slot.last_seen_ms.max(now_ms);
    }

    /// Current input, `None` once the connection is gone
    pub fn latest(&self) -> Option<InputSample> {
        let slot = self.slot.lock();
        if slot.closed {
            None
        } else {
            slot.latest
        }
    }

    pub fn last_seq(&self) -> Option<u32> {
        self.slot.lock().last_seq
    }

    pub fn last_seen(&self) -> u64 {
        self.slot.lock().last_seen_ms
    }

    /// Stop further input application immediately
    pub fn close(&self) {
        self.slot.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }
}

/// Liveness of a session relative to the heartbeat interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Fresh,
    /// Silent for at least one interval; gets pinged
    Idle,
    /// Silent for more than two intervals; gets closed
    Expired,
}

pub fn liveness(silent_ms: u64, heartbeat_ms: u64) -> Liveness {
    if silent_ms > heartbeat_ms.saturating_mul(2) {
        Liveness::Expired
    } else if silent_ms >= heartbeat_ms {
        Liveness::Idle
    } else {
        Liveness::Fresh
    }
}

/// One connected participant
pub struct Session {
    pub id: EntityId,
    phase: SessionPhase,
    mailbox: Arc<InputMailbox>,
    outbound: mpsc::Sender<String>,
    connected_at: u64,
}

impl Session {
    pub fn new(
        id: EntityId,
        mailbox: Arc<InputMailbox>,
        outbound: mpsc::Sender<String>,
        now_ms: u64,
    ) -> Self {
        Self {
            id,
            phase: SessionPhase::Connecting,
            mailbox,
            outbound,
            connected_at: now_ms,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == SessionPhase::Active
    }

    pub fn mailbox(&self) -> &InputMailbox {
        &self.mailbox
    }

    pub fn connected_at(&self) -> u64 {
        self.connected_at
    }

    pub fn activate(&mut self) -> bool {
        if self.phase != SessionPhase::Connecting {
            return false;
        }
        self.phase = SessionPhase::Active;
        true
    }

    /// Enter `Closing`. Returns `false` if a close already started.
    pub fn begin_close(&mut self) -> bool {
        if self.phase >= SessionPhase::Closing {
            return false;
        }
        self.phase = SessionPhase::Closing;
        self.mailbox.close();
        true
    }

    pub fn finish_close(&mut self) {
        self.phase = SessionPhase::Closed;
    }

    pub fn silent_for(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.mailbox.last_seen())
    }

    /// Queue an encoded frame. A full queue drops the frame (slow reader).
    pub fn send(&self, frame: String) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(session_id = %self.id, "Outbound queue full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %self.id, "Outbound channel closed");
                false
            }
        }
    }
}
