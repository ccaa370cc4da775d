use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::debug;

use crate::game::ids::{EntityId, SessionId, Tick};
use crate::net::protocol::PlayerState;

/// Connection lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Connecting,
    Connected,
    InGame,
    Disconnected,
}

/// Read-only view of the session directory used during culling
pub trait SessionDirectory: Send + Sync {
    fn status(&self, session: SessionId) -> Option<SessionStatus>;

    /// Entity the session currently controls, if any
    fn attached_entity(&self, session: SessionId) -> Option<EntityId>;

    /// Extra viewer entities the session receives data for
    fn view_subscriptions(&self, session: SessionId) -> SmallVec<[EntityId; 4]>;

    /// Player states changed at or after `since`, `None` when nothing changed
    fn player_states_since(&self, since: Tick) -> Option<Vec<PlayerState>>;
}

/// Session data for a connected player
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub status: SessionStatus,
    pub attached_entity: Option<EntityId>,
    pub view_subscriptions: SmallVec<[EntityId; 4]>,
    /// Highest snapshot tick the client acknowledged (`ZERO` = nothing yet)
    pub last_acked: Tick,
    /// Acks at or below this tick predate the last resync and are ignored
    pub ack_floor: Tick,
    /// Tick the replicated player state last changed
    pub state_modified: Tick,
    pub created_at: Instant,
    pub last_activity: Instant,
}

impl Session {
    pub fn new(id: SessionId, name: String, tick: Tick) -> Self {
        let now = Instant::now();
        Self {
            id,
            name,
            status: SessionStatus::Connected,
            attached_entity: None,
            view_subscriptions: SmallVec::new(),
            last_acked: Tick::ZERO,
            ack_floor: Tick::ZERO,
            state_modified: tick,
            created_at: now,
            last_activity: now,
        }
    }

    /// Update last activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Check if session has timed out
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    pub fn player_state(&self) -> PlayerState {
        PlayerState {
            session: self.id,
            name: self.name.clone(),
            status: self.status,
            attached_entity: self.attached_entity,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session {0} not found")]
    NotFound(SessionId),
    #[error("Session {0} already exists")]
    AlreadyExists(SessionId),
    #[error("Too many sessions (max {0})")]
    Full(usize),
}

/// Session manager tracking connected players, their viewers and acks
pub struct SessionManager {
    sessions: HashMap<SessionId, Session>,
    /// Session timeout duration
    timeout: Duration,
    /// Maximum number of sessions
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(timeout: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            timeout,
            max_sessions,
        }
    }

    /// Register a new session in `Connected` state
    pub fn create_session(&mut self, id: SessionId, name: String, tick: Tick) -> Result<&Session, SessionError> {
        if self.sessions.contains_key(&id) {
            return Err(SessionError::AlreadyExists(id));
        }
        if self.sessions.len() >= self.max_sessions {
            // Try to clean up expired sessions first
            self.cleanup_expired();
            if self.sessions.len() >= self.max_sessions {
                return Err(SessionError::Full(self.max_sessions));
            }
        }

        debug!("Creating session {} ({})", id, name);
        Ok(self
            .sessions
            .entry(id)
            .or_insert_with(|| Session::new(id, name, tick)))
    }

    pub fn get_session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn remove_session(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    fn session_mut(&mut self, id: SessionId) -> Result<&mut Session, SessionError> {
        self.sessions.get_mut(&id).ok_or(SessionError::NotFound(id))
    }

    pub fn set_status(&mut self, id: SessionId, status: SessionStatus, tick: Tick) -> Result<(), SessionError> {
        let session = self.session_mut(id)?;
        if session.status != status {
            session.status = status;
            session.state_modified = tick;
            if status != SessionStatus::InGame {
                // a client re-entering the game starts over from a full state
                session.last_acked = Tick::ZERO;
                session.ack_floor = tick;
            }
        }
        Ok(())
    }

    pub fn attach_entity(
        &mut self,
        id: SessionId,
        entity: Option<EntityId>,
        tick: Tick,
    ) -> Result<(), SessionError> {
        let session = self.session_mut(id)?;
        if session.attached_entity != entity {
            session.attached_entity = entity;
            session.state_modified = tick;
        }
        Ok(())
    }

    pub fn add_view_subscription(&mut self, id: SessionId, viewer: EntityId) -> Result<(), SessionError> {
        let session = self.session_mut(id)?;
        if !session.view_subscriptions.contains(&viewer) {
            session.view_subscriptions.push(viewer);
        }
        Ok(())
    }

    pub fn remove_view_subscription(&mut self, id: SessionId, viewer: EntityId) -> Result<bool, SessionError> {
        let session = self.session_mut(id)?;
        let before = session.view_subscriptions.len();
        session.view_subscriptions.retain(|v| *v != viewer);
        Ok(session.view_subscriptions.len() != before)
    }

    /// Record a client acknowledgement. Acks only move forward; late or
    /// duplicate acks are ignored. Returns the session's acked tick.
    pub fn acknowledge(&mut self, id: SessionId, tick: Tick) -> Result<Tick, SessionError> {
        let session = self.session_mut(id)?;
        if tick > session.last_acked && tick > session.ack_floor {
            session.last_acked = tick;
        }
        Ok(session.last_acked)
    }

    /// Send full snapshots again until the client acks one built after `tick`
    pub fn request_full_state(&mut self, id: SessionId, tick: Tick) -> Result<(), SessionError> {
        let session = self.session_mut(id)?;
        session.last_acked = Tick::ZERO;
        session.ack_floor = tick;
        debug!("Session {} requested full state at tick {}", id, tick);
        Ok(())
    }

    /// Minimum acked tick across in-game sessions, the oldest tick anyone
    /// still needs deltas from
    pub fn oldest_acked(&self) -> Option<Tick> {
        self.sessions
            .values()
            .filter(|s| s.status == SessionStatus::InGame)
            .map(|s| s.last_acked)
            .min()
    }

    /// Ids of sessions currently in game, sorted
    pub fn in_game(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::InGame)
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Touch a session (update last activity). Returns false if unknown.
    pub fn touch_session(&mut self, id: SessionId) -> bool {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.touch();
            true
        } else {
            false
        }
    }

    /// Remove sessions idle past the timeout. Returns the removed ids.
    pub fn cleanup_expired(&mut self) -> Vec<SessionId> {
        let expired: Vec<_> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_expired(self.timeout))
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.remove_session(*id);
        }
        expired
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_session(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), 10000)
    }
}

impl SessionDirectory for SessionManager {
    fn status(&self, session: SessionId) -> Option<SessionStatus> {
        self.sessions.get(&session).map(|s| s.status)
    }

    fn attached_entity(&self, session: SessionId) -> Option<EntityId> {
        self.sessions.get(&session).and_then(|s| s.attached_entity)
    }

    fn view_subscriptions(&self, session: SessionId) -> SmallVec<[EntityId; 4]> {
        self.sessions
            .get(&session)
            .map(|s| s.view_subscriptions.clone())
            .unwrap_or_default()
    }

    fn player_states_since(&self, since: Tick) -> Option<Vec<PlayerState>> {
        let mut states: Vec<PlayerState> = self
            .sessions
            .values()
            .filter(|s| s.state_modified >= since)
            .map(Session::player_state)
            .collect();
        if states.is_empty() {
            return None;
        }
        states.sort_unstable_by_key(|p| p.session);
        Some(states)
    }
}

/// Lets the tick driver mutate sessions between ticks while culling threads
/// read through a shared handle
impl<T: SessionDirectory> SessionDirectory for RwLock<T> {
    fn status(&self, session: SessionId) -> Option<SessionStatus> {
        self.read().status(session)
    }

    fn attached_entity(&self, session: SessionId) -> Option<EntityId> {
        self.read().attached_entity(session)
    }

    fn view_subscriptions(&self, session: SessionId) -> SmallVec<[EntityId; 4]> {
        self.read().view_subscriptions(session)
    }

    fn player_states_since(&self, since: Tick) -> Option<Vec<PlayerState>> {
        self.read().player_states_since(since)
    }
}
