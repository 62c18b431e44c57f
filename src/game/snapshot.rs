//! Snapshot building for network transmission

use crate::ws::protocol::{ProtocolError, ServerMsg};

use super::physics::PhysicsWorld;
use super::world::SimulationState;

/// Builds encoded snapshot frames and tracks their size
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    stats: SnapshotStats,
    last_tick: Option<u64>,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a snapshot of `state` once, for every recipient.
    ///
    /// Returns `None` when nothing advanced since the previous snapshot, so a
    /// stalled simulation does not resend identical frames.
    pub fn build<W: PhysicsWorld>(
        &mut self,
        state: &SimulationState<W>,
        server_time: u64,
    ) -> Result<Option<String>, ProtocolError> {
        if self.last_tick == Some(state.tick()) {
            return Ok(None);
        }

        let snapshot = state.snapshot(server_time);
        let entities = snapshot.e.len();
        let frame = ServerMsg::Snapshot(snapshot).encode()?;

        self.last_tick = Some(state.tick());
        self.stats.record(entities, frame.len());
        Ok(Some(frame))
    }

    pub fn stats(&self) -> &SnapshotStats {
        &self.stats
    }
}

/// Snapshot size stats for debugging
#[derive(Debug, Default, Clone)]
pub struct SnapshotStats {
    pub total_snapshots: u64,
    pub total_bytes: u64,
    pub avg_entities_per_snapshot: f32,
}

impl SnapshotStats {
    pub fn record(&mut self, entity_count: usize, bytes: usize) {
        self.total_snapshots += 1;
        self.total_bytes += bytes as u64;

        // Running average
        let n = self.total_snapshots as f32;
        self.avg_entities_per_snapshot =
            self.avg_entities_per_snapshot * ((n - 1.0) / n) + (entity_count as f32 / n);
    }

    pub fn avg_bytes(&self) -> u64 {
        if self.total_snapshots == 0 {
            0
        } else {
            self.total_bytes / self.total_snapshots
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::layout::PlayArea;
    use crate::game::physics::RapierWorld;
    use glam::{Quat, Vec3};
    use std::collections::HashMap;

    #[test]
    fn skips_unchanged_tick() {
        let mut state = SimulationState::new(RapierWorld::new(1.0 / 60.0), PlayArea::default());
        state.spawn_vehicle("a", Vec3::new(0.0, 1.0, 0.0), Quat::IDENTITY);
        let mut builder = SnapshotBuilder::new();

        let frame = builder.build(&state, 1_000).unwrap().unwrap();
        match ServerMsg::decode(&frame).unwrap() {
            ServerMsg::Snapshot(snapshot) => {
                assert_eq!(snapshot.tick, 0);
                assert_eq!(snapshot.t, 1_000);
                assert!(snapshot.entity("a").is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(builder.build(&state, 1_050).unwrap().is_none());

        state.step(&HashMap::new());
        assert!(builder.build(&state, 1_100).unwrap().is_some());

        assert_eq!(builder.stats().total_snapshots, 2);
        assert!(builder.stats().avg_bytes() > 0);
    }

    #[test]
    fn running_average() {
        let mut stats = SnapshotStats::default();
        stats.record(2, 100);
        stats.record(4, 300);
        assert_eq!(stats.total_bytes, 400);
        assert_eq!(stats.avg_bytes(), 200);
        assert!((stats.avg_entities_per_snapshot - 3.0).abs() < 1e-5);
    }
}
