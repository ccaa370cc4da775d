//! Client-side snapshot buffer
//!
//! Snapshots arrive out of order, duplicated or not at all. The buffer
//! keys them by `to_tick` and hands the client exactly one snapshot per
//! local tick: the real one if it arrived and applies on top of what the
//! client already has, otherwise an empty placeholder so the clock keeps
//! moving. A real snapshot arriving later evicts its placeholder.
//!
//! Every received snapshot is acknowledged on the spot through a bounded
//! channel. Acks are fire-and-forget; a full channel drops them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::ReplicationConfig;
use crate::game::ids::Tick;
use crate::metrics::ReplicationMetrics;
use crate::net::protocol::{decode, ClientMessage, DecodeError, ServerMessage, Snapshot};

/// Acks queued toward the server before new ones are dropped
pub const ACK_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    /// No usable full state yet; buffer everything
    WaitingForFull,
    /// Clock running, one snapshot handed out per tick
    Steady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Buffered,
    /// Superseded a placeholder with the same `to_tick`
    ReplacedPlaceholder,
    /// Kept as the newest full state while waiting
    FullRetained,
    /// Ends at or before a tick already applied
    Stale,
    /// A real snapshot with the same `to_tick` is already buffered
    Duplicate,
    /// Buffer is at its limit
    Overflow,
}

/// Snapshot to apply this tick and the one expected next
#[derive(Debug, Clone, PartialEq)]
pub struct TickStates {
    pub current: Snapshot,
    pub next: Snapshot,
}

#[derive(Debug, Clone, Copy)]
pub struct SnapshotBufferConfig {
    /// Maximum buffered snapshots, placeholders included
    pub limit: usize,
    /// Consecutive extrapolated ticks before warning
    pub extrapolation_warn_ticks: u32,
}

impl Default for SnapshotBufferConfig {
    fn default() -> Self {
        Self::from(&ReplicationConfig::default())
    }
}

impl From<&ReplicationConfig> for SnapshotBufferConfig {
    fn from(config: &ReplicationConfig) -> Self {
        Self {
            limit: config.snapshot_buffer_limit,
            extrapolation_warn_ticks: config.extrapolation_warn_ticks,
        }
    }
}

/// Ack channel between the buffer and the client's network task
pub struct AckQueue {
    sender: Sender<ClientMessage>,
    receiver: Receiver<ClientMessage>,
}

impl AckQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self { sender, receiver }
    }

    pub fn sender(&self) -> Sender<ClientMessage> {
        self.sender.clone()
    }

    /// Drain everything queued so far
    pub fn drain(&self) -> Vec<ClientMessage> {
        self.receiver.try_iter().collect()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }
}

impl Default for AckQueue {
    fn default() -> Self {
        Self::new(ACK_QUEUE_CAPACITY)
    }
}

pub struct SnapshotBuffer {
    config: SnapshotBufferConfig,
    mode: BufferMode,
    /// Keyed by `to_tick`
    buffer: BTreeMap<Tick, Snapshot>,
    last_full: Option<Snapshot>,
    /// Local clock: `to_tick` of the last snapshot handed out
    last_applied: Tick,
    /// `to_tick` of the last non-placeholder handed out
    last_real: Tick,
    consecutive_extrapolations: u32,
    outbound: Sender<ClientMessage>,
    metrics: Option<Arc<ReplicationMetrics>>,
}

impl SnapshotBuffer {
    pub fn new(config: SnapshotBufferConfig, outbound: Sender<ClientMessage>) -> Self {
        Self {
            config,
            mode: BufferMode::WaitingForFull,
            buffer: BTreeMap::new(),
            last_full: None,
            last_applied: Tick::ZERO,
            last_real: Tick::ZERO,
            consecutive_extrapolations: 0,
            outbound,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ReplicationMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    pub fn last_applied(&self) -> Tick {
        self.last_applied
    }

    pub fn last_real(&self) -> Tick {
        self.last_real
    }

    pub fn consecutive_extrapolations(&self) -> u32 {
        self.consecutive_extrapolations
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Buffered snapshot ending at `to_tick`
    pub fn get(&self, to_tick: Tick) -> Option<&Snapshot> {
        self.buffer.get(&to_tick)
    }

    pub fn last_full(&self) -> Option<&Snapshot> {
        self.last_full.as_ref()
    }

    /// Forget everything and ask the server for a new full state
    pub fn reset(&mut self) {
        info!("Snapshot buffer reset, requesting full state");
        self.mode = BufferMode::WaitingForFull;
        self.buffer.clear();
        self.last_full = None;
        self.last_applied = Tick::ZERO;
        self.last_real = Tick::ZERO;
        self.consecutive_extrapolations = 0;
        self.send(ClientMessage::RequestFullState);
    }

    fn send(&self, message: ClientMessage) {
        if let Err(TrySendError::Full(_)) = self.outbound.try_send(message) {
            trace!("Ack queue full, dropping message");
        }
    }

    fn count(&self, pick: impl FnOnce(&ReplicationMetrics) -> &AtomicU64) {
        if let Some(metrics) = &self.metrics {
            pick(metrics).fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take in a snapshot from the network. Always acknowledges it first.
    pub fn ingest(&mut self, snapshot: Snapshot) -> IngestOutcome {
        self.send(ClientMessage::SnapshotAck {
            tick: snapshot.to_tick,
        });
        self.count(|m| &m.snapshots_received);

        let outcome = match self.mode {
            BufferMode::WaitingForFull => self.ingest_waiting(snapshot),
            BufferMode::Steady => self.ingest_steady(snapshot),
        };

        match outcome {
            IngestOutcome::Stale => self.count(|m| &m.stale_dropped),
            IngestOutcome::Duplicate => self.count(|m| &m.duplicates_dropped),
            IngestOutcome::ReplacedPlaceholder => self.count(|m| &m.placeholders_replaced),
            _ => {}
        }
        outcome
    }

    fn ingest_waiting(&mut self, snapshot: Snapshot) -> IngestOutcome {
        let full_to = self.last_full.as_ref().map(|f| f.to_tick);

        if snapshot.is_full() {
            if full_to.is_some_and(|to| snapshot.to_tick <= to) {
                return IngestOutcome::Stale;
            }
            debug!("Retaining full state at tick {}", snapshot.to_tick);
            self.buffer.retain(|to, _| *to > snapshot.to_tick);
            self.last_full = Some(snapshot);
            return IngestOutcome::FullRetained;
        }

        if full_to.is_some_and(|to| snapshot.to_tick <= to) {
            return IngestOutcome::Stale;
        }
        self.insert(snapshot)
    }

    fn ingest_steady(&mut self, snapshot: Snapshot) -> IngestOutcome {
        if snapshot.to_tick <= self.last_applied {
            trace!("Dropping stale snapshot ending at {}", snapshot.to_tick);
            return IngestOutcome::Stale;
        }
        self.insert(snapshot)
    }

    /// Buffer by `to_tick`. Real snapshots evict placeholders, never the reverse.
    fn insert(&mut self, snapshot: Snapshot) -> IngestOutcome {
        match self.buffer.get(&snapshot.to_tick) {
            Some(existing) if existing.extrapolated && !snapshot.extrapolated => {
                trace!("Real snapshot for {} replaces placeholder", snapshot.to_tick);
                self.buffer.insert(snapshot.to_tick, snapshot);
                IngestOutcome::ReplacedPlaceholder
            }
            Some(_) => IngestOutcome::Duplicate,
            None if self.buffer.len() >= self.config.limit => {
                warn!(
                    "Snapshot buffer full ({}), dropping snapshot ending at {}",
                    self.config.limit, snapshot.to_tick
                );
                IngestOutcome::Overflow
            }
            None => {
                self.buffer.insert(snapshot.to_tick, snapshot);
                IngestOutcome::Buffered
            }
        }
    }

    /// Advance the local clock by one tick.
    ///
    /// Returns `None` while waiting for a full state. Otherwise returns the
    /// snapshot to apply now and the one expected next, synthesizing
    /// placeholders for whichever has not arrived.
    pub fn tick(&mut self) -> Option<TickStates> {
        match self.mode {
            BufferMode::WaitingForFull => self.try_start(),
            BufferMode::Steady => self.advance(),
        }
    }

    /// Leave `WaitingForFull` once the full state has a buffered successor
    /// based at or before it
    fn try_start(&mut self) -> Option<TickStates> {
        let full_to = self.last_full.as_ref()?.to_tick;
        let has_successor = self
            .buffer
            .values()
            .any(|s| !s.extrapolated && s.from_tick <= full_to && s.to_tick > full_to);
        if !has_successor {
            return None;
        }

        let full = self.last_full.take()?;
        self.buffer.retain(|to, _| *to > full_to);
        self.mode = BufferMode::Steady;
        self.last_applied = full_to;
        self.last_real = full_to;
        self.consecutive_extrapolations = 0;
        info!("Full state at tick {} applied, clock resynchronized", full_to);

        let next = self.expect_next(full_to);
        Some(TickStates { current: full, next })
    }

    fn advance(&mut self) -> Option<TickStates> {
        let previous = self.last_applied;
        let cur = previous.next();

        let current = match self.buffer.remove(&cur) {
            Some(snapshot) if snapshot.extrapolated || snapshot.from_tick <= self.last_real => snapshot,
            Some(snapshot) => {
                // Based on a tick this client never applied
                warn!(
                    "Snapshot {}->{} does not apply on top of tick {}, requesting full state",
                    snapshot.from_tick, snapshot.to_tick, self.last_real
                );
                self.buffer.insert(cur, snapshot);
                self.resync();
                return None;
            }
            None => Snapshot::placeholder(previous, cur),
        };

        self.last_applied = cur;
        if current.extrapolated {
            self.consecutive_extrapolations += 1;
            let threshold = self.config.extrapolation_warn_ticks;
            if threshold > 0 && self.consecutive_extrapolations % threshold == 0 {
                warn!(
                    "Extrapolating for {} consecutive ticks (last real tick {})",
                    self.consecutive_extrapolations, self.last_real
                );
            }
        } else {
            self.last_real = cur;
            self.consecutive_extrapolations = 0;
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_extrapolation(self.consecutive_extrapolations);
        }

        self.buffer.retain(|to, _| *to > cur);
        let next = self.expect_next(cur);
        Some(TickStates { current, next })
    }

    /// Snapshot ending right after `cur`, inserting a placeholder if missing
    fn expect_next(&mut self, cur: Tick) -> Snapshot {
        let to = cur.next();
        self.buffer
            .entry(to)
            .or_insert_with(|| Snapshot::placeholder(cur, to))
            .clone()
    }

    /// Go back to waiting and ask the server for a full state. The local
    /// world is kept until the full state replaces it.
    fn resync(&mut self) {
        self.mode = BufferMode::WaitingForFull;
        self.last_full = None;
        self.buffer.retain(|_, s| !s.extrapolated);
        self.consecutive_extrapolations = 0;
        self.send(ClientMessage::RequestFullState);
    }
}

/// Snapshot buffer shared between the network task and the client tick
#[derive(Clone)]
pub struct SharedSnapshotBuffer {
    inner: Arc<Mutex<SnapshotBuffer>>,
}

impl SharedSnapshotBuffer {
    pub fn new(buffer: SnapshotBuffer) -> Self {
        Self {
            inner: Arc::new(Mutex::new(buffer)),
        }
    }

    pub fn ingest(&self, snapshot: Snapshot) -> IngestOutcome {
        self.inner.lock().ingest(snapshot)
    }

    /// Decode a server message and ingest its snapshot
    pub fn ingest_bytes(&self, data: &[u8]) -> Result<IngestOutcome, DecodeError> {
        let ServerMessage::Snapshot(snapshot) = decode::<ServerMessage>(data)?;
        Ok(self.ingest(snapshot))
    }

    pub fn tick(&self) -> Option<TickStates> {
        self.inner.lock().tick()
    }

    pub fn reset(&self) {
        self.inner.lock().reset();
    }

    pub fn mode(&self) -> BufferMode {
        self.inner.lock().mode()
    }

    pub fn last_applied(&self) -> Tick {
        self.inner.lock().last_applied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::ids::EntityId;
    use crate::net::protocol::encode;

    fn buffer() -> (SnapshotBuffer, AckQueue) {
        let acks = AckQueue::default();
        let config = SnapshotBufferConfig {
            limit: 8,
            extrapolation_warn_ticks: 3,
        };
        (SnapshotBuffer::new(config, acks.sender()), acks)
    }

    fn delta(from: u32, to: u32) -> Snapshot {
        let mut snapshot = Snapshot::new(Tick(from), Tick(to));
        snapshot.entity_deletions = Some(vec![EntityId(to)]);
        snapshot
    }

    fn ticks(states: &TickStates) -> ((u32, u32, bool), (u32, u32, bool)) {
        (
            (states.current.from_tick.0, states.current.to_tick.0, states.current.extrapolated),
            (states.next.from_tick.0, states.next.to_tick.0, states.next.extrapolated),
        )
    }

    /// Steady buffer whose clock stands at `at`
    fn steady_at(at: u32) -> (SnapshotBuffer, AckQueue) {
        let (mut buf, acks) = buffer();
        buf.ingest(delta(0, at));
        buf.ingest(delta(at, at + 1));
        buf.tick().unwrap();
        acks.drain();
        (buf, acks)
    }

    #[test]
    fn test_waits_for_full_with_successor() {
        let (mut buf, _acks) = buffer();
        assert_eq!(buf.mode(), BufferMode::WaitingForFull);

        assert_eq!(buf.ingest(delta(3, 4)), IngestOutcome::Buffered);
        assert!(buf.tick().is_none());
        assert_eq!(buf.ingest(delta(0, 3)), IngestOutcome::FullRetained);

        let states = buf.tick().unwrap();
        assert_eq!(ticks(&states), ((0, 3, false), (3, 4, false)));
        assert_eq!(buf.mode(), BufferMode::Steady);
        assert_eq!(buf.last_applied(), Tick(3));
    }

    #[test]
    fn test_only_newest_full_is_retained() {
        let (mut buf, _acks) = buffer();
        assert_eq!(buf.ingest(delta(0, 5)), IngestOutcome::FullRetained);
        assert_eq!(buf.ingest(delta(0, 4)), IngestOutcome::Stale);
        assert_eq!(buf.ingest(delta(0, 7)), IngestOutcome::FullRetained);
        assert_eq!(buf.last_full().unwrap().to_tick, Tick(7));
        // Deltas ending at or before the full state are useless now
        assert_eq!(buf.ingest(delta(5, 6)), IngestOutcome::Stale);
    }

    #[test]
    fn test_successor_may_be_based_earlier_than_full() {
        // Server switched to deltas from an older acked full state
        let (mut buf, _acks) = buffer();
        buf.ingest(delta(0, 5));
        buf.ingest(delta(0, 6));
        buf.ingest(delta(5, 8));
        let states = buf.tick().unwrap();
        assert_eq!(states.current.to_tick, Tick(6));
        assert!(states.next.extrapolated);
        assert_eq!(buf.tick().unwrap().current.to_tick, Tick(7));
        let states = buf.tick().unwrap();
        assert_eq!(ticks(&states).0, (5, 8, false));
    }

    #[test]
    fn test_every_snapshot_is_acked() {
        let (mut buf, acks) = steady_at(5);
        buf.ingest(delta(5, 7));
        buf.ingest(delta(5, 7));
        buf.ingest(delta(1, 2));

        let acked: Vec<Tick> = acks
            .drain()
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::SnapshotAck { tick } => Some(tick),
                _ => None,
            })
            .collect();
        assert_eq!(acked, vec![Tick(7), Tick(7), Tick(2)]);
    }

    #[test]
    fn test_duplicates_are_idempotent() {
        let (mut buf, _acks) = steady_at(5);
        let original = delta(5, 7);
        let mut copy = original.clone();
        copy.entity_deletions = Some(vec![EntityId(99)]);

        assert_eq!(buf.ingest(original.clone()), IngestOutcome::Buffered);
        let len = buf.len();
        assert_eq!(buf.ingest(copy), IngestOutcome::Duplicate);
        assert_eq!(buf.len(), len);
        assert_eq!(buf.get(Tick(7)), Some(&original));
    }

    #[test]
    fn test_stale_snapshots_dropped() {
        let (mut buf, _acks) = steady_at(5);
        assert_eq!(buf.ingest(delta(4, 5)), IngestOutcome::Stale);
        assert_eq!(buf.ingest(delta(0, 2)), IngestOutcome::Stale);
        assert!(buf.get(Tick(5)).is_none());
    }

    #[test]
    fn test_extrapolation_inserts_placeholder_for_next() {
        let (mut buf, _acks) = steady_at(4);
        // [4->5] already buffered by steady_at, add [5->6]
        buf.ingest(delta(5, 6));
        assert_eq!(ticks(&buf.tick().unwrap()).0, (4, 5, false));

        let states = buf.tick().unwrap();
        assert_eq!(ticks(&states), ((5, 6, false), (6, 7, true)));
        let placeholder = buf.get(Tick(7)).unwrap();
        assert!(placeholder.extrapolated);
        assert!(placeholder.has_no_payload());

        // The real one supersedes it
        assert_eq!(buf.ingest(delta(6, 7)), IngestOutcome::ReplacedPlaceholder);
        assert!(!buf.get(Tick(7)).unwrap().extrapolated);
        let states = buf.tick().unwrap();
        assert_eq!(ticks(&states).0, (6, 7, false));
        assert_eq!(buf.consecutive_extrapolations(), 0);
    }

    #[test]
    fn test_placeholder_never_replaces_real() {
        let (mut buf, _acks) = steady_at(5);
        buf.ingest(delta(5, 7));
        let placeholder = Snapshot::placeholder(Tick(6), Tick(7));
        assert_eq!(buf.ingest(placeholder), IngestOutcome::Duplicate);
        assert!(!buf.get(Tick(7)).unwrap().extrapolated);
    }

    #[test]
    fn test_missing_current_runs_on_placeholder() {
        let metrics = Arc::new(ReplicationMetrics::new());
        let (buf, _acks) = steady_at(5);
        let mut buf = buf.with_metrics(metrics.clone());

        // [5->6] was buffered by steady_at; drain it
        buf.tick().unwrap();
        for expected in 1..=4u32 {
            let states = buf.tick().unwrap();
            assert!(states.current.extrapolated);
            assert_eq!(buf.consecutive_extrapolations(), expected);
        }
        assert_eq!(buf.last_applied(), Tick(10));
        assert_eq!(buf.last_real(), Tick(6));
        assert_eq!(
            metrics.consecutive_extrapolations.load(Ordering::Relaxed),
            4
        );

        // A snapshot based on the last real tick catches the client up
        buf.ingest(delta(6, 11));
        let states = buf.tick().unwrap();
        assert!(!states.current.extrapolated);
        assert_eq!(buf.last_real(), Tick(11));
        assert_eq!(buf.consecutive_extrapolations(), 0);
    }

    #[test]
    fn test_unappliable_snapshot_requests_full_state() {
        let (mut buf, acks) = steady_at(5);
        buf.tick().unwrap(); // applies [5->6]
        buf.tick().unwrap(); // extrapolates 7
        // Based on tick 7, which this client only extrapolated
        buf.ingest(delta(7, 8));
        acks.drain();

        assert!(buf.tick().is_none());
        assert_eq!(buf.mode(), BufferMode::WaitingForFull);
        assert!(acks
            .drain()
            .iter()
            .any(|m| matches!(m, ClientMessage::RequestFullState)));

        buf.ingest(delta(0, 9));
        buf.ingest(delta(9, 10));
        let states = buf.tick().unwrap();
        assert!(states.current.is_full());
        assert_eq!(buf.last_applied(), Tick(9));
    }

    #[test]
    fn test_reset_waits_again() {
        let (mut buf, acks) = steady_at(5);
        acks.drain();
        buf.reset();
        assert_eq!(buf.mode(), BufferMode::WaitingForFull);
        assert!(matches!(acks.drain().as_slice(), [ClientMessage::RequestFullState]));
        assert!(buf.is_empty());
        assert_eq!(buf.last_applied(), Tick::ZERO);
        // Old ticks are accepted again after a reset
        assert_eq!(buf.ingest(delta(0, 2)), IngestOutcome::FullRetained);
    }

    #[test]
    fn test_buffer_limit() {
        let (mut buf, _acks) = steady_at(1);
        // steady_at leaves [1->2] buffered
        for to in 3..10 {
            assert_eq!(buf.ingest(delta(1, to)), IngestOutcome::Buffered);
        }
        assert_eq!(buf.ingest(delta(1, 10)), IngestOutcome::Overflow);
    }

    #[test]
    fn test_shared_buffer_across_threads() {
        let acks = AckQueue::new(1024);
        let shared = SharedSnapshotBuffer::new(SnapshotBuffer::new(
            SnapshotBufferConfig {
                limit: 512,
                extrapolation_warn_ticks: 100,
            },
            acks.sender(),
        ));

        let network = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                let bytes = encode(&ServerMessage::Snapshot(delta(0, 1))).unwrap();
                shared.ingest_bytes(&bytes).unwrap();
                for to in 2..200 {
                    shared.ingest(delta(to - 1, to));
                }
            })
        };
        network.join().unwrap();

        let mut applied = Vec::new();
        while let Some(states) = shared.tick() {
            applied.push(states.current.to_tick);
            if states.current.to_tick == Tick(199) {
                break;
            }
        }
        assert_eq!(applied.first(), Some(&Tick(1)));
        assert_eq!(applied.len(), 199);
        assert_eq!(shared.mode(), BufferMode::Steady);
        assert_eq!(acks.pending_count(), 199);
    }
}
