//! Authoritative host simulation and its tick loop
//!
//! One task owns the physics world and every session. Connection handlers
//! talk to it through [`HostCommand`]s and per-session input mailboxes; they
//! never touch the world directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::util::time::{unix_millis, Timer};
use crate::ws::protocol::{EntityId, PlayerInfo, ServerMsg};

use super::layout::{scatter_props, spawn_slot, PlayArea};
use super::physics::RapierWorld;
use super::scheduler::FixedStepScheduler;
use super::session::{liveness, InputMailbox, Liveness, Session, SessionPhase};
use super::snapshot::{SnapshotBuilder, SnapshotStats};
use super::world::{SimulationState, StepReport};

/// Requests from connection handlers to the simulation task
#[derive(Debug)]
pub enum HostCommand {
    /// New connection. The host replies with a welcome on `outbound`.
    Connect {
        id: EntityId,
        mailbox: Arc<InputMailbox>,
        outbound: mpsc::Sender<String>,
    },
    /// Connection is gone
    Disconnect { id: EntityId, reason: &'static str },
}

/// Counters published by the simulation task
#[derive(Debug, Default)]
pub struct HostStats {
    pub sessions: AtomicUsize,
    pub tick: AtomicU64,
}

/// Handle to the running host simulation
#[derive(Clone)]
pub struct HostHandle {
    pub commands: mpsc::Sender<HostCommand>,
    pub stats: Arc<HostStats>,
}

impl HostHandle {
    pub fn session_count(&self) -> usize {
        self.stats.sessions.load(Ordering::Relaxed)
    }

    pub fn tick(&self) -> u64 {
        self.stats.tick.load(Ordering::Relaxed)
    }
}

/// The authoritative simulation
pub struct HostSimulation {
    sim: SimulationState<RapierWorld>,
    sessions: HashMap<EntityId, Session>,
    snapshot_builder: SnapshotBuilder,
    stats: Arc<HostStats>,
    tick_rate: u32,
    snapshot_rate: u32,
    heartbeat: Duration,
}

impl HostSimulation {
    /// Create the world with its seeded props
    pub fn new(config: &Config) -> (Self, HostHandle, mpsc::Receiver<HostCommand>) {
        let (commands_tx, commands_rx) = mpsc::channel(256);
        let stats = Arc::new(HostStats::default());

        let world = RapierWorld::new(1.0 / config.tick_rate as f32);
        let mut sim = SimulationState::new(world, PlayArea::default());
        for prop in scatter_props(config.prop_count, config.world_seed) {
            sim.spawn_prop(&prop);
        }

        let handle = HostHandle {
            commands: commands_tx,
            stats: stats.clone(),
        };

        let host = Self {
            sim,
            sessions: HashMap::new(),
            snapshot_builder: SnapshotBuilder::new(),
            stats,
            tick_rate: config.tick_rate,
            snapshot_rate: config.snapshot_rate,
            heartbeat: config.heartbeat_interval,
        };

        (host, handle, commands_rx)
    }

    pub fn simulation(&self) -> &SimulationState<RapierWorld> {
        &self.sim
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_phase(&self, id: &str) -> Option<SessionPhase> {
        self.sessions.get(id).map(Session::phase)
    }

    pub fn snapshot_stats(&self) -> &SnapshotStats {
        self.snapshot_builder.stats()
    }

    pub fn handle_command(&mut self, command: HostCommand, now_ms: u64) {
        match command {
            HostCommand::Connect {
                id,
                mailbox,
                outbound,
            } => {
                self.connect(id, mailbox, outbound, now_ms);
            }
            HostCommand::Disconnect { id, reason } => {
                self.close_session(&id, reason);
            }
        }
    }

    /// Admit a session: spawn its vehicle, welcome it, announce it to the rest
    pub fn connect(
        &mut self,
        id: EntityId,
        mailbox: Arc<InputMailbox>,
        outbound: mpsc::Sender<String>,
        now_ms: u64,
    ) -> bool {
        if self.sessions.contains_key(&id) {
            warn!(session_id = %id, "Session already connected");
            return false;
        }

        let (position, orientation) = spawn_slot(&id);
        if !self.sim.spawn_vehicle(&id, position, orientation) {
            warn!(session_id = %id, "Entity id already in use");
            return false;
        }

        let mut session = Session::new(id.clone(), mailbox, outbound, now_ms);

        let players: Vec<PlayerInfo> = self
            .sessions
            .values()
            .filter(|s| s.is_active())
            .map(|s| PlayerInfo { id: s.id.clone() })
            .collect();

        let welcome = ServerMsg::Welcome {
            id: id.clone(),
            tick_rate: self.tick_rate,
            snapshot_rate: self.snapshot_rate,
            server_time: now_ms,
            players,
            props: self.sim.props(),
            snapshot: self.sim.snapshot(now_ms),
        };
        match welcome.encode() {
            Ok(frame) => {
                session.send(frame);
            }
            Err(e) => warn!(session_id = %id, error = %e, "Failed to encode welcome"),
        }
        session.activate();

        self.broadcast(&ServerMsg::PlayerJoined { id: id.clone() }, Some(&id));
        self.sessions.insert(id.clone(), session);
        self.publish_stats();

        info!(
            session_id = %id,
            sessions = self.sessions.len(),
            "Session connected"
        );
        true
    }

    /// Close a session. Only the first close of a session has any effect.
    pub fn close_session(&mut self, id: &str, reason: &str) -> bool {
        let Some(session) = self.sessions.get_mut(id) else {
            return false;
        };
        if !session.begin_close() {
            return false;
        }
        let connected_at = session.connected_at();

        self.sim.despawn(id);
        if let Some(mut session) = self.sessions.remove(id) {
            session.finish_close();
        }
        self.publish_stats();

        self.broadcast(&ServerMsg::PlayerLeft { id: id.to_string() }, None);
        info!(
            session_id = %id,
            reason,
            connected_at,
            sessions = self.sessions.len(),
            "Session closed"
        );
        true
    }

    /// Run one fixed step with the latest input of every active session
    pub fn step(&mut self) -> StepReport {
        let inputs: HashMap<EntityId, _> = self
            .sessions
            .values()
            .filter(|s| s.is_active())
            .filter_map(|s| s.mailbox().latest().map(|input| (s.id.clone(), input)))
            .collect();

        let report = self.sim.step(&inputs);
        for impact in &report.impacts {
            trace!(
                tick = impact.tick,
                a = %impact.a,
                b = ?impact.b,
                strength = impact.strength,
                "Impact"
            );
        }
        if report.bounces > 0 {
            trace!(tick = report.tick, bounces = report.bounces, "Toy contacts");
        }
        self.stats.tick.store(report.tick, Ordering::Relaxed);
        report
    }

    /// Send the current snapshot to every active session
    pub fn broadcast_snapshot(&mut self, now_ms: u64) -> usize {
        let frame = match self.snapshot_builder.build(&self.sim, now_ms) {
            Ok(Some(frame)) => frame,
            Ok(None) => return 0,
            Err(e) => {
                warn!(error = %e, "Failed to encode snapshot");
                return 0;
            }
        };

        let stats = self.snapshot_builder.stats();
        if stats.total_snapshots % 100 == 0 {
            debug!(
                snapshots = stats.total_snapshots,
                total_bytes = stats.total_bytes,
                avg_bytes = stats.avg_bytes(),
                avg_entities = stats.avg_entities_per_snapshot,
                "Snapshot stats"
            );
        }

        self.sessions
            .values()
            .filter(|s| s.is_active())
            .filter(|s| s.send(frame.clone()))
            .count()
    }

    /// Ping idle sessions and close the ones that stayed silent too long
    pub fn sweep(&mut self, now_ms: u64) -> Vec<EntityId> {
        let heartbeat_ms = self.heartbeat.as_millis() as u64;
        let mut expired = Vec::new();

        for session in self.sessions.values().filter(|s| s.is_active()) {
            match liveness(session.silent_for(now_ms), heartbeat_ms) {
                Liveness::Fresh => {}
                Liveness::Idle => {
                    debug!(session_id = %session.id, "Pinging idle session");
                    if let Ok(frame) = (ServerMsg::Ping { t: now_ms }).encode() {
                        session.send(frame);
                    }
                }
                Liveness::Expired => expired.push(session.id.clone()),
            }
        }

        expired.retain(|id| self.close_session(id, "timeout"));
        expired
    }

    fn broadcast(&self, msg: &ServerMsg, except: Option<&str>) {
        let frame = match msg.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode broadcast");
                return;
            }
        };
        for session in self.sessions.values() {
            if session.is_active() && Some(session.id.as_str()) != except {
                session.send(frame.clone());
            }
        }
    }

    fn publish_stats(&self) {
        self.stats
            .sessions
            .store(self.sessions.len(), Ordering::Relaxed);
    }

    fn process_commands(&mut self, commands: &mut mpsc::Receiver<HostCommand>) {
        while let Ok(command) = commands.try_recv() {
            self.handle_command(command, unix_millis());
        }
    }

    /// Run the authoritative loop until `shutdown` changes
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<HostCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            tick_rate = self.tick_rate,
            snapshot_rate = self.snapshot_rate,
            props = self.sim.len(),
            "Host simulation started"
        );

        let mut scheduler = FixedStepScheduler::new(self.tick_rate);
        let mut frame_timer = Timer::new();

        let mut physics = interval(scheduler.step());
        physics.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut snapshots = interval(Duration::from_secs_f64(1.0 / self.snapshot_rate as f64));
        snapshots.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = physics.tick() => {
                    // Membership changes land on a step boundary
                    self.process_commands(&mut commands);
                    let dt = frame_timer.lap();
                    let steps = scheduler.advance_with(dt, || {
                        self.step();
                    });
                    if steps > 1 {
                        trace!(steps, "Catch-up steps");
                    }
                }
                _ = snapshots.tick() => {
                    self.broadcast_snapshot(unix_millis());
                }
                _ = heartbeat.tick() => {
                    let expired = self.sweep(unix_millis());
                    if !expired.is_empty() {
                        info!(count = expired.len(), "Closed silent sessions");
                    }
                }
                // Any change, or the sender going away, stops the loop
                _ = shutdown.changed() => break,
            }
        }

        let ids: Vec<EntityId> = self.sessions.keys().cloned().collect();
        for id in &ids {
            self.close_session(id, "shutdown");
        }
        let stats = self.snapshot_builder.stats().clone();
        self.sim.shutdown();
        info!(
            snapshots = stats.total_snapshots,
            avg_bytes = stats.avg_bytes(),
            "Host simulation stopped"
        );
    }
}
