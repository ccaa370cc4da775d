//! Deletion history for replicated entities, grids and maps
//!
//! Records are appended in tick order and pruned once every in-game session
//! has acknowledged a tick past them. Pruning with anything but the minimum
//! acked tick silently loses deletions for lagging sessions.

use parking_lot::RwLock;
use tracing::trace;

use crate::game::ids::{DeletedId, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionRecord {
    pub tick: Tick,
    pub id: DeletedId,
}

/// Append-only deletion log shared by every session's snapshot builder
#[derive(Debug, Default)]
pub struct DeletionLedger {
    records: RwLock<Vec<DeletionRecord>>,
}

impl DeletionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a deletion. Ticks must be non-decreasing across calls.
    pub fn record_deletion(&self, id: DeletedId, tick: Tick) {
        let mut records = self.records.write();
        debug_assert!(
            records.last().map_or(true, |last| last.tick <= tick),
            "deletions must be recorded in tick order"
        );
        records.push(DeletionRecord { tick, id });
    }

    /// Everything deleted at or after `tick`, `None` when nothing was
    pub fn query_deleted_since(&self, tick: Tick) -> Option<Vec<DeletedId>> {
        let records = self.records.read();
        let start = records.partition_point(|r| r.tick < tick);
        if start == records.len() {
            return None;
        }
        Some(records[start..].iter().map(|r| r.id).collect())
    }

    /// Drop records strictly older than `oldest_unacked`. Returns how many
    /// were dropped.
    pub fn prune_before(&self, oldest_unacked: Tick) -> usize {
        let mut records = self.records.write();
        let cut = records.partition_point(|r| r.tick < oldest_unacked);
        if cut > 0 {
            records.drain(..cut);
            trace!("Pruned {} deletion records before tick {}", cut, oldest_unacked);
        }
        cut
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::ids::{EntityId, GridId, MapId};
    use rand::Rng;

    fn entity(n: u32) -> DeletedId {
        DeletedId::Entity(EntityId(n))
    }

    #[test]
    fn test_empty_ledger_reports_none() {
        let ledger = DeletionLedger::new();
        assert_eq!(ledger.query_deleted_since(Tick::ZERO), None);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_query_is_inclusive_of_tick() {
        let ledger = DeletionLedger::new();
        ledger.record_deletion(entity(1), Tick(5));
        ledger.record_deletion(DeletedId::Grid(GridId(2)), Tick(7));
        ledger.record_deletion(DeletedId::Map(MapId(3)), Tick(7));

        assert_eq!(ledger.query_deleted_since(Tick(5)).unwrap().len(), 3);
        assert_eq!(
            ledger.query_deleted_since(Tick(6)),
            Some(vec![DeletedId::Grid(GridId(2)), DeletedId::Map(MapId(3))])
        );
        assert_eq!(ledger.query_deleted_since(Tick(8)), None);
    }

    #[test]
    fn test_prune_before_is_strict() {
        let ledger = DeletionLedger::new();
        ledger.record_deletion(entity(1), Tick(3));
        ledger.record_deletion(entity(2), Tick(4));
        ledger.record_deletion(entity(3), Tick(6));

        assert_eq!(ledger.prune_before(Tick(4)), 1);
        assert_eq!(ledger.len(), 2);
        assert_eq!(
            ledger.query_deleted_since(Tick::ZERO),
            Some(vec![entity(2), entity(3)])
        );
        assert_eq!(ledger.prune_before(Tick(4)), 0);
        assert_eq!(ledger.prune_before(Tick(100)), 2);
        assert_eq!(ledger.query_deleted_since(Tick::ZERO), None);
    }

    #[test]
    fn test_deletion_durability_randomized() {
        let mut rng = rand::thread_rng();
        let ledger = DeletionLedger::new();
        let mut deleted_at = Vec::new();
        let mut tick = 1u32;
        for n in 0..200 {
            tick += rng.gen_range(0..3);
            ledger.record_deletion(entity(n), Tick(tick));
            deleted_at.push((n, tick));
        }

        for _ in 0..50 {
            let from = Tick(rng.gen_range(0..tick + 2));
            let reported = ledger.query_deleted_since(from).unwrap_or_default();
            for &(n, d) in &deleted_at {
                let present = reported.contains(&entity(n));
                assert_eq!(present, from <= Tick(d), "entity {} deleted at {} queried from {}", n, d, from);
            }
        }
    }
}
