//! Potentially-visible-set culling for network replication
//!
//! Computes, per session, which entities that session should receive this
//! tick and the minimal entity-state payload to bring it up to date.
//!
//! The visible set is closed under parentage: an entity is only ever sent
//! together with every ancestor up to its map root. An ancestor whose
//! visibility layer does not intersect the viewer's mask removes itself and
//! its whole subtree from that viewer's contribution.
//!
//! Each session keeps last tick's set plus the tick every visible entity
//! entered view and every departed entity left it. A new set is built from
//! the pool every tick and swapped in, and the old one goes back to the
//! pool. Entries and departures are reported relative to the session's
//! acked tick, not to the last set built, so a lost snapshot is repaired by
//! the next one.

use std::cell::RefCell;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::game::components::{EntityStateDelta, DEFAULT_VISIBILITY_MASK};
use crate::game::ids::{DeletedId, EntityId, MapId, SessionId, Tick};
use crate::game::spatial::SpatialIndex;
use crate::game::store::EntityStore;
use crate::net::deletion::DeletionLedger;
use crate::net::protocol::non_empty;
use crate::net::session::{SessionDirectory, SessionStatus};
use crate::util::pool::{Pool, PoolStats, Pooled};
use crate::util::vec2::{Box2, Vec2};

/// Entities one session should currently receive
pub type VisibleSet = FxHashSet<EntityId>;

// Thread-local reusable buffer, reset for every viewer
thread_local! {
    /// Ancestors known to fail the current viewer's visibility mask
    static EXCLUDED_BUFFER: RefCell<FxHashSet<EntityId>> = RefCell::new(FxHashSet::default());
}

// ============================================================================
// Culling Constants
// ============================================================================

/// Default side length of the square view region (world units)
pub const DEFAULT_VIEW_SIZE: f32 = 32.0;

/// Default number of free visible sets kept for reuse
pub const DEFAULT_VISIBLE_SET_POOL_CAPACITY: usize = 256;

/// Largest accepted view size; the region query walks every cell in the box
pub const MAX_VIEW_SIZE: f32 = 4096.0;

/// Typical parent-chain depth (entity -> grid -> map root)
const CHAIN_INLINE_DEPTH: usize = 8;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CullingConfig {
    /// When false every session receives the whole world
    pub enabled: bool,
    /// Side length of each viewer's square view region
    pub view_size: f32,
    /// Maximum free visible sets retained by the pool
    pub pool_capacity: usize,
}

impl Default for CullingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            view_size: DEFAULT_VIEW_SIZE,
            pool_capacity: DEFAULT_VISIBLE_SET_POOL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum CullError {
    #[error("Session {0} is not in game")]
    SessionNotInGame(SessionId),
    #[error("Session {0} is already registered with the culler")]
    AlreadyRegistered(SessionId),
    #[error("Session {0} is not registered with the culler")]
    UnknownSession(SessionId),
    #[error("View size {0} must be finite and in (0, {max}]", max = MAX_VIEW_SIZE)]
    InvalidViewSize(f32),
}

/// Per-session counters from one `calculate_entity_states` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CullStats {
    pub visible: usize,
    pub entered: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub left: usize,
}

/// Entity payload for one session and tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityStates {
    pub states: Option<Vec<EntityStateDelta>>,
    pub deletions: Option<Vec<DeletedId>>,
    /// Still-existing entities that dropped out of the visible set
    pub left_view: Option<Vec<EntityId>>,
    pub stats: CullStats,
}

// ============================================================================
// View Culler
// ============================================================================

/// What one session has been shown
#[derive(Debug, Default)]
struct SessionView {
    visible: VisibleSet,
    /// Tick each entity in `visible` last entered view
    entered: FxHashMap<EntityId, Tick>,
    /// Tick each still-existing entity left view, until acked past
    departed: FxHashMap<EntityId, Tick>,
}

pub struct ViewCuller {
    config: CullingConfig,
    store: Arc<dyn EntityStore>,
    spatial: Arc<dyn SpatialIndex>,
    sessions: Arc<dyn SessionDirectory>,
    ledger: Arc<DeletionLedger>,
    /// Per-session view state. The map itself only changes through
    /// `&mut self`; each entry is locked by its own session's cull.
    visible_sets: HashMap<SessionId, Mutex<SessionView>>,
    pool: Pool<VisibleSet>,
    /// Tick snapshots are currently being built for
    tick: Tick,
}

impl ViewCuller {
    pub fn new(
        config: CullingConfig,
        store: Arc<dyn EntityStore>,
        spatial: Arc<dyn SpatialIndex>,
        sessions: Arc<dyn SessionDirectory>,
        ledger: Arc<DeletionLedger>,
    ) -> Self {
        Self {
            pool: Pool::new(config.pool_capacity),
            config,
            store,
            spatial,
            sessions,
            ledger,
            visible_sets: HashMap::new(),
            tick: Tick::ZERO,
        }
    }

    pub fn config(&self) -> &CullingConfig {
        &self.config
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.config.enabled != enabled {
            debug!("Culling {}", if enabled { "enabled" } else { "disabled" });
        }
        self.config.enabled = enabled;
    }

    pub fn set_view_size(&mut self, view_size: f32) -> Result<(), CullError> {
        if !(view_size.is_finite() && view_size > 0.0 && view_size <= MAX_VIEW_SIZE) {
            return Err(CullError::InvalidViewSize(view_size));
        }
        self.config.view_size = view_size;
        Ok(())
    }

    /// Tick the next `calculate_entity_states` calls build for. Entries and
    /// departures are stamped with it.
    pub fn set_tick(&mut self, tick: Tick) {
        self.tick = tick;
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Allocate the session's visible set
    pub fn add_session(&mut self, session: SessionId) -> Result<(), CullError> {
        if self.visible_sets.contains_key(&session) {
            return Err(CullError::AlreadyRegistered(session));
        }
        let view = SessionView {
            visible: self.pool.take(),
            ..SessionView::default()
        };
        self.visible_sets.insert(session, Mutex::new(view));
        Ok(())
    }

    /// Release the session's visible set. Returns false if unknown.
    pub fn remove_session(&mut self, session: SessionId) -> bool {
        match self.visible_sets.remove(&session) {
            Some(view) => {
                self.pool.release(view.into_inner().visible);
                true
            }
            None => false,
        }
    }

    pub fn has_session(&self, session: SessionId) -> bool {
        self.visible_sets.contains_key(&session)
    }

    pub fn session_count(&self) -> usize {
        self.visible_sets.len()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Size of the set stored for `session` after the last cull
    pub fn last_visible_count(&self, session: SessionId) -> Option<usize> {
        self.visible_sets.get(&session).map(|v| v.lock().visible.len())
    }

    fn ensure_in_game(&self, session: SessionId) -> Result<(), CullError> {
        match self.sessions.status(session) {
            Some(SessionStatus::InGame) => Ok(()),
            _ => Err(CullError::SessionNotInGame(session)),
        }
    }

    /// Entities the session views the world through: its attached entity
    /// plus any explicit view subscriptions
    pub fn viewers(&self, session: SessionId) -> SmallVec<[EntityId; 4]> {
        let mut viewers = self.sessions.view_subscriptions(session);
        if let Some(attached) = self.sessions.attached_entity(session) {
            if !viewers.contains(&attached) {
                viewers.insert(0, attached);
            }
        }
        viewers
    }

    #[inline]
    fn view_mask(&self, viewer: EntityId) -> u32 {
        self.store
            .eye(viewer)
            .map_or(DEFAULT_VISIBILITY_MASK, |eye| eye.visibility_mask)
    }

    /// Whether `point` on `map` lies inside any of the session's view regions
    pub fn is_point_visible(&self, session: SessionId, map: MapId, point: Vec2) -> Result<bool, CullError> {
        if !self.config.enabled {
            return Ok(true);
        }
        self.ensure_in_game(session)?;

        Ok(self.viewers(session).into_iter().any(|viewer| {
            self.store.transform(viewer).is_some_and(|t| {
                t.map == map && Box2::centered(t.position, self.config.view_size).contains(point)
            })
        }))
    }

    /// Build this tick's visible set.
    ///
    /// `None` when culling is disabled (send the whole world) or the session
    /// has no viewer (send nothing). The returned set goes back to the pool
    /// when dropped unless detached with `into_inner`.
    pub fn compute_visible_set(&self, session: SessionId) -> Result<Option<Pooled<'_, VisibleSet>>, CullError> {
        if !self.config.enabled {
            return Ok(None);
        }
        self.ensure_in_game(session)?;

        let viewers = self.viewers(session);
        if viewers.is_empty() {
            return Ok(None);
        }

        let mut set = self.pool.acquire();
        let mut excluded = EXCLUDED_BUFFER.with(|cell| std::mem::take(&mut *cell.borrow_mut()));

        for viewer in viewers {
            let Some(transform) = self.store.transform(viewer) else {
                trace!("Viewer {} of session {} has no transform", viewer, session);
                continue;
            };
            let mask = self.view_mask(viewer);
            excluded.clear();

            if let Some(root) = self.store.map_root(transform.map) {
                set.insert(root);
            }
            self.include_forced(viewer, &mut set);

            let region = Box2::centered(transform.position, self.config.view_size);
            self.spatial.for_each_in_region(transform.map, region, &mut |candidate| {
                self.include_chain(candidate, mask, &mut set, &mut excluded);
            });
        }

        excluded.clear();
        EXCLUDED_BUFFER.with(|cell| *cell.borrow_mut() = excluded);
        Ok(Some(set))
    }

    /// Viewers always see themselves and their own ancestors
    fn include_forced(&self, viewer: EntityId, set: &mut VisibleSet) {
        let mut cursor = Some(viewer);
        while let Some(id) = cursor {
            if !set.insert(id) {
                break;
            }
            cursor = self.store.parent_of(id);
        }
    }

    /// Walk up from `candidate`, adding it and its ancestors unless one of
    /// them fails `mask`. Stops at the first node already decided.
    fn include_chain(
        &self,
        candidate: EntityId,
        mask: u32,
        set: &mut VisibleSet,
        excluded: &mut FxHashSet<EntityId>,
    ) {
        let mut chain: SmallVec<[EntityId; CHAIN_INLINE_DEPTH]> = SmallVec::new();
        let mut cursor = Some(candidate);

        while let Some(id) = cursor {
            if set.contains(&id) {
                break;
            }
            if excluded.contains(&id) {
                excluded.extend(chain);
                return;
            }
            if let Some(visibility) = self.store.visibility(id) {
                if !visibility.visible_to(mask) {
                    excluded.insert(id);
                    excluded.extend(chain);
                    return;
                }
            }
            chain.push(id);
            cursor = self.store.parent_of(id);
        }

        set.extend(chain);
    }

    /// Entity states and deletions `session` needs to advance from
    /// `from_tick` to now. Safe to call concurrently for distinct sessions.
    pub fn calculate_entity_states(&self, session: SessionId, from_tick: Tick) -> Result<EntityStates, CullError> {
        self.ensure_in_game(session)?;

        if !self.config.enabled {
            let states = non_empty(self.store.full_state_dump(session, from_tick));
            let visible = states.as_ref().map_or(0, Vec::len);
            return Ok(EntityStates {
                states,
                deletions: self.ledger.query_deleted_since(from_tick),
                left_view: None,
                stats: CullStats {
                    visible,
                    updated: visible,
                    ..CullStats::default()
                },
            });
        }

        let entry = self
            .visible_sets
            .get(&session)
            .ok_or(CullError::UnknownSession(session))?;

        let Some(new_set) = self.compute_visible_set(session)? else {
            trace!("Session {} has no viewer, sending nothing", session);
            return Ok(EntityStates::default());
        };

        let mut stats = CullStats {
            visible: new_set.len(),
            ..CullStats::default()
        };
        let now = self.tick;
        let full = from_tick.is_zero();
        let mut guard = entry.lock();
        let view = &mut *guard;

        let mut states = Vec::with_capacity(new_set.len());
        for &id in new_set.iter() {
            let known = match view.entered.get(&id) {
                Some(entered_at) if view.visible.contains(&id) => *entered_at <= from_tick,
                _ => {
                    view.entered.insert(id, now);
                    view.departed.remove(&id);
                    false
                }
            };
            // Visible since before the acked tick, only send changes
            if !full && known {
                let delta = self.store.entity_delta(id, from_tick, session);
                if delta.is_empty() {
                    stats.unchanged += 1;
                } else {
                    stats.updated += 1;
                    states.push(delta);
                }
            } else {
                // Entered after the acked tick, client may not assume any prior knowledge
                let delta = self.store.entity_delta(id, Tick::ZERO, session);
                if !delta.is_empty() {
                    stats.entered += 1;
                    states.push(delta);
                }
            }
        }
        states.sort_unstable_by_key(|d| d.id);

        for id in view.visible.iter() {
            if !new_set.contains(id) {
                view.entered.remove(id);
                if self.store.contains(*id) {
                    view.departed.insert(*id, now);
                }
            }
        }

        // Departures the client has acked past need no repeat. A full
        // snapshot replaces the client's world, so it needs none at all.
        let store = &self.store;
        view.departed
            .retain(|id, left_at| *left_at > from_tick && !new_set.contains(id) && store.contains(*id));
        let mut left: Vec<EntityId> = if full {
            Vec::new()
        } else {
            view.departed.keys().copied().collect()
        };
        left.sort_unstable();
        stats.left = left.len();

        let old = std::mem::replace(&mut view.visible, new_set.into_inner());
        drop(guard);
        self.pool.release(old);

        Ok(EntityStates {
            states: non_empty(states),
            deletions: self.ledger.query_deleted_since(from_tick),
            left_view: non_empty(left),
            stats,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
