//! Client-side replica of the world
//!
//! Applies one snapshot per tick in a fixed order: map creation and tiles
//! first so entities have somewhere to live, then entity states and
//! removals, then player states, and finally grid binding and map/grid
//! deletion once the entities representing grids are known.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::game::components::{ComponentKind, ComponentState, EntityStateDelta, Transform};
use crate::game::ids::{EntityId, GridId, SessionId, Tick};
use crate::game::map::MapManager;
use crate::net::map_delta::{apply_post, apply_pre, GridResolver, MapDeltaError};
use crate::net::protocol::{PlayerState, Snapshot};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientEntity {
    components: BTreeMap<ComponentKind, ComponentState>,
}

impl ClientEntity {
    pub fn get(&self, kind: ComponentKind) -> Option<&ComponentState> {
        self.components.get(&kind)
    }

    pub fn transform(&self) -> Option<&Transform> {
        match self.components.get(&ComponentKind::Transform)? {
            ComponentState::Transform(t) => Some(t),
            _ => None,
        }
    }

    fn grid(&self) -> Option<GridId> {
        match self.components.get(&ComponentKind::Grid)? {
            ComponentState::Grid(marker) => Some(marker.grid),
            _ => None,
        }
    }
}

/// Grid id to the entity carrying its `GridMarker`
#[derive(Debug, Default)]
struct GridIndex(HashMap<GridId, EntityId>);

impl GridResolver for GridIndex {
    fn grid_entity(&self, grid: GridId) -> Option<EntityId> {
        self.0.get(&grid).copied()
    }
}

/// What one `apply` changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub entities_updated: usize,
    pub entities_removed: usize,
    pub players_updated: usize,
    pub grids_bound: usize,
}

#[derive(Debug, Default)]
pub struct ClientWorld {
    maps: MapManager,
    entities: HashMap<EntityId, ClientEntity>,
    grids: GridIndex,
    players: HashMap<SessionId, PlayerState>,
    applied_tick: Tick,
}

impl ClientWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn maps(&self) -> &MapManager {
        &self.maps
    }

    pub fn maps_mut(&mut self) -> &mut MapManager {
        &mut self.maps
    }

    pub fn entity(&self, id: EntityId) -> Option<&ClientEntity> {
        self.entities.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Entity ids, sorted
    pub fn entity_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entities.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn player(&self, session: SessionId) -> Option<&PlayerState> {
        self.players.get(&session)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn applied_tick(&self) -> Tick {
        self.applied_tick
    }

    /// Drop all replicated state
    pub fn clear(&mut self) {
        self.maps = MapManager::new();
        self.entities.clear();
        self.grids.0.clear();
        self.players.clear();
        self.applied_tick = Tick::ZERO;
    }

    /// Apply one snapshot. A full snapshot replaces everything.
    pub fn apply(&mut self, snapshot: &Snapshot) -> Result<ApplySummary, MapDeltaError> {
        let mut summary = ApplySummary::default();
        if snapshot.is_full() {
            debug!("Applying full state at tick {}", snapshot.to_tick);
            self.clear();
        }

        if let Some(delta) = &snapshot.map_delta {
            apply_pre(&mut self.maps, delta, snapshot.to_tick)?;
        }

        for state in snapshot.entity_states.as_deref().unwrap_or_default() {
            self.apply_entity_state(state);
            summary.entities_updated += 1;
        }
        for id in snapshot.entity_deletions.as_deref().unwrap_or_default() {
            summary.entities_removed += usize::from(self.remove_entity(*id));
        }
        for id in snapshot.left_view.as_deref().unwrap_or_default() {
            summary.entities_removed += usize::from(self.remove_entity(*id));
        }

        for player in snapshot.player_states.as_deref().unwrap_or_default() {
            self.players.insert(player.session, player.clone());
            summary.players_updated += 1;
        }

        if let Some(delta) = &snapshot.map_delta {
            summary.grids_bound = apply_post(&mut self.maps, delta, &self.grids)?;
        }

        self.applied_tick = snapshot.to_tick;
        if summary != ApplySummary::default() {
            trace!("Applied {}->{}: {:?}", snapshot.from_tick, snapshot.to_tick, summary);
        }
        Ok(summary)
    }

    fn apply_entity_state(&mut self, state: &EntityStateDelta) {
        let entity = self.entities.entry(state.id).or_default();
        for component in &state.components {
            if let ComponentState::Grid(marker) = component {
                self.grids.0.insert(marker.grid, state.id);
            }
            entity.components.insert(component.kind(), component.clone());
        }
        for kind in &state.removed {
            if let Some(ComponentState::Grid(marker)) = entity.components.remove(kind) {
                self.grids.0.remove(&marker.grid);
            }
        }
    }

    fn remove_entity(&mut self, id: EntityId) -> bool {
        match self.entities.remove(&id) {
            Some(entity) => {
                if let Some(grid) = entity.grid() {
                    self.grids.0.remove(&grid);
                }
                true
            }
            None => false,
        }
    }
}
