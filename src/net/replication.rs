//! Server-side replication tick driver
//!
//! Owns the session directory, map state, deletion ledger and view culler,
//! and turns each server tick into one snapshot per in-game session.
//! Per-session work runs in parallel; everything that mutates shared state
//! (acks, session changes, ledger pruning) happens between builds on the
//! tick thread.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::RwLock;
#[cfg(feature = "parallel_cull")]
use rayon::prelude::*;
use tracing::{debug, error, info, trace, warn};

use crate::config::ReplicationConfig;
use crate::game::ids::{DeletedId, EntityId, GridId, MapId, SessionId, Tick};
use crate::game::map::{MapError, MapManager};
use crate::game::spatial::SpatialIndex;
use crate::game::store::EntityStore;
use crate::metrics::ReplicationMetrics;
use crate::net::deletion::DeletionLedger;
use crate::net::map_delta::build_delta;
use crate::net::protocol::{encode, non_empty, ClientMessage, EncodeError, ServerMessage, Snapshot};
use crate::net::pvs::{CullError, CullStats, ViewCuller};
use crate::net::session::{SessionDirectory, SessionError, SessionManager, SessionStatus};

/// Inbound client messages queued between ticks
pub const INBOUND_QUEUE_CAPACITY: usize = 4096;

/// Client message tagged with its sender
pub type ClientEnvelope = (SessionId, ClientMessage);

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ReplicationError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Cull(#[from] CullError),
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Queue a client message for the next tick. Returns false if the queue is
/// full or closed; acks are fire-and-forget so the message is dropped.
pub fn submit(sender: &Sender<ClientEnvelope>, session: SessionId, message: ClientMessage) -> bool {
    match sender.try_send((session, message)) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            trace!("Inbound queue full, dropping message from {}", session);
            false
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

pub struct ReplicationServer {
    tick: Tick,
    sessions: Arc<RwLock<SessionManager>>,
    maps: MapManager,
    ledger: Arc<DeletionLedger>,
    culler: ViewCuller,
    metrics: Arc<ReplicationMetrics>,
    inbound_tx: Sender<ClientEnvelope>,
    inbound_rx: Receiver<ClientEnvelope>,
}

impl ReplicationServer {
    pub fn new(
        config: &ReplicationConfig,
        store: Arc<dyn EntityStore>,
        spatial: Arc<dyn SpatialIndex>,
        metrics: Arc<ReplicationMetrics>,
    ) -> Self {
        let sessions = Arc::new(RwLock::new(SessionManager::new(
            config.session_timeout,
            config.max_sessions,
        )));
        let ledger = Arc::new(DeletionLedger::new());
        let culler = ViewCuller::new(
            config.culling(),
            store,
            spatial,
            sessions.clone(),
            ledger.clone(),
        );
        let (inbound_tx, inbound_rx) = crossbeam_channel::bounded(INBOUND_QUEUE_CAPACITY);

        info!(
            "Replication server ready (culling {}, view size {})",
            if config.culling_enabled { "on" } else { "off" },
            config.view_size
        );

        Self {
            tick: Tick::ZERO,
            sessions,
            maps: MapManager::new(),
            ledger,
            culler,
            metrics,
            inbound_tx,
            inbound_rx,
        }
    }

    /// Current server tick; world changes made now are stamped with it
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Handle for transport tasks to queue client messages
    pub fn inbound(&self) -> Sender<ClientEnvelope> {
        self.inbound_tx.clone()
    }

    pub fn sessions(&self) -> &Arc<RwLock<SessionManager>> {
        &self.sessions
    }

    pub fn maps(&self) -> &MapManager {
        &self.maps
    }

    pub fn maps_mut(&mut self) -> &mut MapManager {
        &mut self.maps
    }

    pub fn ledger(&self) -> &DeletionLedger {
        &self.ledger
    }

    pub fn culler(&self) -> &ViewCuller {
        &self.culler
    }

    pub fn culler_mut(&mut self) -> &mut ViewCuller {
        &mut self.culler
    }

    pub fn metrics(&self) -> &Arc<ReplicationMetrics> {
        &self.metrics
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    pub fn connect(&mut self, session: SessionId, name: String) -> Result<(), ReplicationError> {
        self.sessions.write().create_session(session, name, self.tick)?;
        Ok(())
    }

    /// Start replicating to a session, optionally attached to an entity
    pub fn enter_game(&mut self, session: SessionId, attached: Option<EntityId>) -> Result<(), ReplicationError> {
        {
            let mut sessions = self.sessions.write();
            sessions.set_status(session, SessionStatus::InGame, self.tick)?;
            sessions.attach_entity(session, attached, self.tick)?;
        }
        if !self.culler.has_session(session) {
            self.culler.add_session(session)?;
        }
        info!("Session {} entered game", session);
        Ok(())
    }

    pub fn attach_entity(&mut self, session: SessionId, entity: Option<EntityId>) -> Result<(), ReplicationError> {
        self.sessions.write().attach_entity(session, entity, self.tick)?;
        Ok(())
    }

    /// Stop replicating to a session without dropping it
    pub fn leave_game(&mut self, session: SessionId) -> Result<(), ReplicationError> {
        self.sessions
            .write()
            .set_status(session, SessionStatus::Connected, self.tick)?;
        self.culler.remove_session(session);
        Ok(())
    }

    pub fn disconnect(&mut self, session: SessionId) {
        if self.sessions.write().remove_session(session).is_some() {
            info!("Session {} disconnected", session);
        }
        self.culler.remove_session(session);
    }

    /// Drop sessions idle past the timeout
    pub fn cleanup_expired(&mut self) -> Vec<SessionId> {
        let expired = self.sessions.write().cleanup_expired();
        for session in &expired {
            self.culler.remove_session(*session);
            warn!("Session {} timed out", session);
        }
        expired
    }

    // ========================================================================
    // Deletions
    // ========================================================================

    /// Record entities removed from the store this tick
    pub fn record_entity_deletions(&self, ids: &[EntityId]) {
        for id in ids {
            self.ledger.record_deletion(DeletedId::Entity(*id), self.tick);
        }
    }

    pub fn delete_grid(&mut self, grid: GridId) -> Result<(), ReplicationError> {
        self.maps.delete_grid(grid)?;
        self.ledger.record_deletion(DeletedId::Grid(grid), self.tick);
        Ok(())
    }

    /// Delete a map with its grids. Clients drop the grids with the map.
    pub fn delete_map(&mut self, map: MapId) -> Result<(), ReplicationError> {
        let grids = self.maps.delete_map(map)?;
        self.ledger.record_deletion(DeletedId::Map(map), self.tick);
        debug!("Deleted map {} with {} grids", map, grids.len());
        Ok(())
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Apply queued client messages. Returns how many were processed.
    pub fn process_inbound(&mut self) -> usize {
        let mut processed = 0;
        let mut sessions = self.sessions.write();
        while let Ok((session, message)) = self.inbound_rx.try_recv() {
            processed += 1;
            if !sessions.touch_session(session) {
                trace!("Message from unknown session {}", session);
                continue;
            }
            let result = match message {
                ClientMessage::SnapshotAck { tick } => sessions.acknowledge(session, tick).map(|_| {
                    self.metrics
                        .acks_received
                        .fetch_add(1, Ordering::Relaxed);
                }),
                ClientMessage::RequestFullState => sessions.request_full_state(session, self.tick),
            };
            if let Err(e) = result {
                debug!("Ignoring message: {}", e);
            }
        }
        processed
    }

    /// Move to the next tick, applying client messages received so far
    pub fn advance_tick(&mut self) -> Tick {
        self.process_inbound();
        match self.tick.checked_next() {
            Some(next) => self.tick = next,
            None => error!("Tick counter exhausted at {}, holding", self.tick),
        }
        self.culler.set_tick(self.tick);
        self.tick
    }

    /// Snapshot bringing `session` from `from_tick` to the current tick
    fn build_snapshot(&self, session: SessionId, from_tick: Tick) -> Result<(Snapshot, CullStats), CullError> {
        let states = self.culler.calculate_entity_states(session, from_tick)?;
        let deletions = self.ledger.query_deleted_since(from_tick);

        let entity_deletions = states.deletions.and_then(|ids| {
            non_empty(
                ids.into_iter()
                    .filter_map(|id| match id {
                        DeletedId::Entity(e) => Some(e),
                        _ => None,
                    })
                    .collect(),
            )
        });

        let snapshot = Snapshot {
            entity_states: states.states,
            entity_deletions,
            left_view: states.left_view,
            map_delta: build_delta(&self.maps, deletions.as_deref(), from_tick),
            player_states: self.sessions.player_states_since(from_tick),
            ..Snapshot::new(from_tick, self.tick)
        };
        Ok((snapshot, states.stats))
    }

    /// One snapshot per in-game session for the current tick, sorted by
    /// session. Sessions that fail are logged and skipped. Afterwards the
    /// ledger is pruned to what the slowest session still needs.
    pub fn build_snapshots(&mut self) -> Vec<(SessionId, Snapshot)> {
        let start = Instant::now();

        let targets: Vec<(SessionId, Tick)> = {
            let sessions = self.sessions.read();
            sessions
                .in_game()
                .into_iter()
                .filter_map(|id| sessions.get_session(id).map(|s| (id, s.last_acked)))
                .collect()
        };

        let build = |&(session, from): &(SessionId, Tick)| (session, self.build_snapshot(session, from));
        #[cfg(feature = "parallel_cull")]
        let results: Vec<_> = targets.par_iter().map(build).collect();
        #[cfg(not(feature = "parallel_cull"))]
        let results: Vec<_> = targets.iter().map(build).collect();

        let mut snapshots = Vec::with_capacity(results.len());
        for (session, result) in results {
            match result {
                Ok((snapshot, stats)) => {
                    self.metrics.record_cull_stats(&stats);
                    snapshots.push((session, snapshot));
                }
                Err(e) => {
                    error!("Failed to build snapshot for {}: {}", session, e);
                    self.metrics
                        .cull_errors
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let oldest = self.sessions.read().oldest_acked().unwrap_or(self.tick);
        let pruned = self.ledger.prune_before(oldest);

        let events = self.maps.drain_events();
        if !events.is_empty() {
            trace!("Discarded {} authoring map events", events.len());
        }

        self.metrics.record_cull_time(start.elapsed());
        self.metrics.record_pool_stats(self.culler.pool_stats());
        self.metrics
            .sessions_in_game
            .store(targets.len() as u64, Ordering::Relaxed);
        self.metrics
            .ledger_records
            .store(self.ledger.len() as u64, Ordering::Relaxed);
        self.metrics
            .ledger_pruned
            .fetch_add(pruned as u64, Ordering::Relaxed);

        snapshots
    }

    /// Encode a snapshot for the wire and count it as sent
    pub fn encode_snapshot(&self, snapshot: Snapshot) -> Result<Vec<u8>, EncodeError> {
        let full = snapshot.is_full();
        let bytes = encode(&ServerMessage::Snapshot(snapshot))?;
        self.metrics.record_snapshot_sent(bytes.len(), full);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::map::Tile;
    use crate::game::world::MemoryWorld;
    use crate::net::protocol::decode;
    use crate::util::vec2::Vec2;
    use uuid::Uuid;

    struct Harness {
        world: Arc<MemoryWorld>,
        server: ReplicationServer,
    }

    impl Harness {
        fn new(config: ReplicationConfig) -> Self {
            let world = Arc::new(MemoryWorld::new());
            let server = ReplicationServer::new(
                &config,
                world.clone(),
                world.clone(),
                Arc::new(ReplicationMetrics::new()),
            );
            Self { world, server }
        }

        fn with_map() -> Self {
            let mut harness = Self::new(ReplicationConfig::default());
            harness.server.advance_tick();
            let tick = harness.server.tick();
            harness.world.create_map(MapId(1), tick).unwrap();
            harness.server.maps_mut().create_map(MapId(1), GridId(1), tick).unwrap();
            harness
        }

        fn join(&mut self, x: f32, y: f32) -> (SessionId, EntityId) {
            let eye = self
                .world
                .spawn(MapId(1), None, Vec2::new(x, y), self.server.tick())
                .unwrap();
            let session = Uuid::new_v4();
            self.server.connect(session, "player".into()).unwrap();
            self.server.enter_game(session, Some(eye)).unwrap();
            (session, eye)
        }

        fn ack(&self, session: SessionId, tick: Tick) {
            assert!(submit(&self.server.inbound(), session, ClientMessage::SnapshotAck { tick }));
        }

        fn snapshot_for(&mut self, session: SessionId) -> Snapshot {
            self.server
                .build_snapshots()
                .into_iter()
                .find(|(s, _)| *s == session)
                .map(|(_, snapshot)| snapshot)
                .unwrap()
        }
    }

    #[test]
    fn test_first_snapshot_is_full() {
        let mut h = Harness::with_map();
        let (session, eye) = h.join(0.0, 0.0);
        h.server.advance_tick();

        let snapshot = h.snapshot_for(session);
        assert!(snapshot.is_full());
        assert_eq!(snapshot.to_tick, Tick(2));
        let ids: Vec<EntityId> = snapshot.entity_states.unwrap().iter().map(|d| d.id).collect();
        assert!(ids.contains(&eye));
        let map_delta = snapshot.map_delta.unwrap();
        assert_eq!(map_delta.created_maps.unwrap()[0].map, MapId(1));
        assert_eq!(snapshot.player_states.unwrap().len(), 1);
    }

    #[test]
    fn test_acked_session_gets_deltas() {
        let mut h = Harness::with_map();
        let (session, eye) = h.join(0.0, 0.0);
        h.server.advance_tick();
        h.snapshot_for(session);
        h.ack(session, Tick(2));

        h.server.advance_tick();
        let quiet = h.snapshot_for(session);
        assert_eq!(quiet.from_tick, Tick(2));
        assert_eq!(quiet.to_tick, Tick(3));
        assert!(quiet.has_no_payload(), "heartbeat snapshot carries nothing");

        h.server.advance_tick();
        h.world.set_position(eye, Vec2::new(1.0, 0.0), h.server.tick()).unwrap();
        h.server
            .maps_mut()
            .set_tile(GridId(1), (0, 0), Tile::new(2), Tick(4))
            .unwrap();
        h.ack(session, Tick(3));
        h.server.advance_tick();
        let moved = h.snapshot_for(session);
        assert_eq!(moved.from_tick, Tick(3));
        assert_eq!(moved.entity_states.unwrap()[0].id, eye);
        assert!(moved.map_delta.unwrap().grid_data.is_some());
    }

    #[test]
    fn test_deletions_survive_until_acked() {
        let mut h = Harness::with_map();
        let (fast, _) = h.join(0.0, 0.0);
        let (slow, _) = h.join(1.0, 1.0);
        h.server.advance_tick();
        h.server.build_snapshots();
        h.ack(fast, Tick(2));
        h.ack(slow, Tick(2));

        h.server.advance_tick();
        let doomed = h.world.spawn(MapId(1), None, Vec2::new(0.5, 0.5), Tick(3)).unwrap();
        h.server.build_snapshots();
        h.server.advance_tick();
        let removed = h.world.despawn(doomed);
        h.server.record_entity_deletions(&removed);
        h.server.build_snapshots();

        // Only the fast client acks past the deletion
        h.ack(fast, Tick(4));
        for _ in 0..5 {
            h.server.advance_tick();
            let snapshots = h.server.build_snapshots();
            let slow_snapshot = &snapshots.iter().find(|(s, _)| *s == slow).unwrap().1;
            assert_eq!(slow_snapshot.entity_deletions, Some(vec![doomed]));
            assert_eq!(h.server.ledger().len(), 1);
        }

        h.ack(slow, Tick(6));
        h.ack(fast, Tick(6));
        h.server.advance_tick();
        h.server.build_snapshots();
        assert!(h.server.ledger().is_empty());
    }

    #[test]
    fn test_grid_and_map_deletions_go_to_map_delta() {
        let mut h = Harness::with_map();
        let (session, _) = h.join(0.0, 0.0);
        let tick = h.server.tick();
        h.server.maps_mut().create_map(MapId(2), GridId(20), tick).unwrap();
        h.server.maps_mut().create_grid(GridId(3), MapId(1), None, tick).unwrap();
        h.server.advance_tick();
        h.snapshot_for(session);
        h.ack(session, Tick(2));

        h.server.advance_tick();
        h.server.delete_grid(GridId(3)).unwrap();
        h.server.delete_map(MapId(2)).unwrap();
        let snapshot = h.snapshot_for(session);
        assert_eq!(snapshot.entity_deletions, None);
        let delta = snapshot.map_delta.unwrap();
        assert_eq!(delta.deleted_grids, Some(vec![GridId(3)]));
        assert_eq!(delta.deleted_maps, Some(vec![MapId(2)]));
        assert!(matches!(
            h.server.delete_map(MapId(2)),
            Err(ReplicationError::Map(MapError::UnknownMap(_)))
        ));
    }

    #[test]
    fn test_full_state_request_restarts_from_zero() {
        let mut h = Harness::with_map();
        let (session, _) = h.join(0.0, 0.0);
        h.server.advance_tick();
        h.snapshot_for(session);
        h.ack(session, Tick(2));
        h.server.advance_tick();
        assert_eq!(h.snapshot_for(session).from_tick, Tick(2));

        assert!(submit(&h.server.inbound(), session, ClientMessage::RequestFullState));
        h.ack(session, Tick(3));
        h.server.advance_tick();
        assert!(h.snapshot_for(session).is_full());
    }

    #[test]
    fn test_sessions_outside_game_receive_nothing() {
        let mut h = Harness::with_map();
        let (session, _) = h.join(0.0, 0.0);
        let lobby = Uuid::new_v4();
        h.server.connect(lobby, "lobby".into()).unwrap();
        h.server.advance_tick();

        let snapshots = h.server.build_snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].0, session);

        h.server.leave_game(session).unwrap();
        assert!(h.server.build_snapshots().is_empty());
        assert!(!h.server.culler().has_session(session));

        h.server.disconnect(session);
        assert!(!h.server.sessions().read().has_session(session));
    }

    #[test]
    fn test_culling_disabled_sends_whole_world() {
        let mut h = Harness::new(ReplicationConfig {
            culling_enabled: false,
            ..ReplicationConfig::default()
        });
        h.server.advance_tick();
        h.world.create_map(MapId(1), Tick(1)).unwrap();
        h.server.maps_mut().create_map(MapId(1), GridId(1), Tick(1)).unwrap();
        let (session, _) = h.join(0.0, 0.0);
        let far = h.world.spawn(MapId(1), None, Vec2::new(5000.0, 0.0), Tick(1)).unwrap();
        h.server.advance_tick();

        let snapshot = h.snapshot_for(session);
        assert!(snapshot.entity_states.unwrap().iter().any(|d| d.id == far));
    }

    #[test]
    fn test_encoded_snapshot_counts_bytes() {
        let mut h = Harness::with_map();
        let (session, _) = h.join(0.0, 0.0);
        h.server.advance_tick();
        let snapshot = h.snapshot_for(session);

        let bytes = h.server.encode_snapshot(snapshot.clone()).unwrap();
        let ServerMessage::Snapshot(decoded) = decode::<ServerMessage>(&bytes).unwrap();
        assert_eq!(decoded, snapshot);
        let metrics = h.server.metrics();
        assert_eq!(metrics.full_snapshots_sent.load(Ordering::Relaxed), 1);
        assert_eq!(
            metrics.bytes_sent.load(Ordering::Relaxed),
            bytes.len() as u64
        );
    }

    #[test]
    fn test_client_messages_keep_session_alive() {
        let mut h = Harness::new(ReplicationConfig {
            session_timeout: std::time::Duration::from_millis(80),
            ..ReplicationConfig::default()
        });
        let (active, idle) = (Uuid::new_v4(), Uuid::new_v4());
        h.server.connect(active, "active".into()).unwrap();
        h.server.connect(idle, "idle".into()).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(50));
        h.ack(active, Tick(1));
        h.server.advance_tick();
        std::thread::sleep(std::time::Duration::from_millis(50));

        assert_eq!(h.server.cleanup_expired(), vec![idle]);
        assert!(h.server.sessions().read().has_session(active));
    }

    #[test]
    fn test_unknown_session_ack_is_ignored() {
        let mut h = Harness::with_map();
        h.ack(Uuid::new_v4(), Tick(1));
        assert_eq!(h.server.process_inbound(), 1);
    }
}
