//! In-memory entity store with a built-in spatial index
//!
//! Reference implementation of [`EntityStore`] and [`SpatialIndex`] used by
//! the demo server, the benchmarks and the tests. Interior locking lets the
//! tick driver mutate between ticks while culling threads read during one.

use std::cell::RefCell;
use std::collections::BTreeMap;

use hashbrown::HashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::game::components::{
    ComponentKind, ComponentState, EntityStateDelta, Eye, Transform, Visibility,
};
use crate::game::ids::{EntityId, MapId, SessionId, Tick};
use crate::game::spatial::{SpatialGrid, SpatialIndex, ENTITY_GRID_CELL_SIZE};
use crate::game::store::EntityStore;
use crate::util::vec2::{Box2, Vec2};

// Region query results are copied out so visitors run without the world lock held
thread_local! {
    static REGION_QUERY_BUFFER: RefCell<Vec<EntityId>> = RefCell::new(Vec::with_capacity(256));
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WorldError {
    #[error("Map {0} does not exist")]
    UnknownMap(MapId),
    #[error("Map {0} already exists")]
    MapExists(MapId),
    #[error("Entity {0} does not exist")]
    UnknownEntity(EntityId),
    #[error("Entity {0} cannot be parented to itself or a descendant")]
    ParentCycle(EntityId),
    #[error("Transform of entity {0} must be changed through set_position/set_parent")]
    TransformNotSettable(EntityId),
}

#[derive(Debug, Clone)]
struct Stamped {
    state: ComponentState,
    modified: Tick,
}

#[derive(Debug, Clone)]
struct EntityRecord {
    transform: Transform,
    transform_modified: Tick,
    components: BTreeMap<ComponentKind, Stamped>,
    /// Tick each absent component was last removed
    removed: BTreeMap<ComponentKind, Tick>,
    children: SmallVec<[EntityId; 4]>,
}

impl EntityRecord {
    fn delta_since(&self, id: EntityId, since: Tick) -> EntityStateDelta {
        let mut delta = EntityStateDelta::empty(id);
        if self.transform_modified >= since {
            delta.components.push(ComponentState::Transform(self.transform));
        }
        for stamped in self.components.values() {
            if stamped.modified >= since {
                delta.components.push(stamped.state.clone());
            }
        }
        for (kind, removed) in &self.removed {
            if *removed >= since {
                delta.removed.push(*kind);
            }
        }
        delta
    }
}

#[derive(Debug)]
struct WorldInner {
    entities: HashMap<EntityId, EntityRecord>,
    map_roots: HashMap<MapId, EntityId>,
    spatial: SpatialGrid,
    next_id: u32,
}

impl WorldInner {
    fn allocate_id(&mut self) -> EntityId {
        self.next_id += 1;
        EntityId(self.next_id)
    }

    fn is_ancestor(&self, candidate: EntityId, of: EntityId) -> bool {
        let mut cursor = Some(of);
        while let Some(id) = cursor {
            if id == candidate {
                return true;
            }
            cursor = self.entities.get(&id).and_then(|r| r.transform.parent);
        }
        false
    }

    fn detach_from_parent(&mut self, id: EntityId, parent: Option<EntityId>) {
        if let Some(parent) = parent {
            if let Some(record) = self.entities.get_mut(&parent) {
                record.children.retain(|c| *c != id);
            }
        }
    }
}

pub struct MemoryWorld {
    inner: RwLock<WorldInner>,
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self::with_cell_size(ENTITY_GRID_CELL_SIZE)
    }

    pub fn with_cell_size(cell_size: f32) -> Self {
        Self {
            inner: RwLock::new(WorldInner {
                entities: HashMap::new(),
                map_roots: HashMap::new(),
                spatial: SpatialGrid::new(cell_size),
                next_id: 0,
            }),
        }
    }

    /// Create a map and its root entity at the origin
    pub fn create_map(&self, map: MapId, tick: Tick) -> Result<EntityId, WorldError> {
        let mut inner = self.inner.write();
        if inner.map_roots.contains_key(&map) {
            return Err(WorldError::MapExists(map));
        }
        let root = inner.allocate_id();
        inner.entities.insert(
            root,
            EntityRecord {
                transform: Transform {
                    map,
                    parent: None,
                    position: Vec2::ZERO,
                },
                transform_modified: tick,
                components: BTreeMap::new(),
                removed: BTreeMap::new(),
                children: SmallVec::new(),
            },
        );
        inner.map_roots.insert(map, root);
        Ok(root)
    }

    /// Spawn an entity. `parent == None` parents it to the map root.
    pub fn spawn(
        &self,
        map: MapId,
        parent: Option<EntityId>,
        position: Vec2,
        tick: Tick,
    ) -> Result<EntityId, WorldError> {
        let mut inner = self.inner.write();
        let root = *inner.map_roots.get(&map).ok_or(WorldError::UnknownMap(map))?;
        let parent = parent.unwrap_or(root);
        if !inner.entities.contains_key(&parent) {
            return Err(WorldError::UnknownEntity(parent));
        }

        let id = inner.allocate_id();
        inner.entities.insert(
            id,
            EntityRecord {
                transform: Transform {
                    map,
                    parent: Some(parent),
                    position,
                },
                transform_modified: tick,
                components: BTreeMap::new(),
                removed: BTreeMap::new(),
                children: SmallVec::new(),
            },
        );
        if let Some(record) = inner.entities.get_mut(&parent) {
            record.children.push(id);
        }
        inner.spatial.insert(id, map, position);
        Ok(id)
    }

    /// Add or replace a non-transform component
    pub fn set_component(
        &self,
        id: EntityId,
        state: ComponentState,
        tick: Tick,
    ) -> Result<(), WorldError> {
        if matches!(state, ComponentState::Transform(_)) {
            return Err(WorldError::TransformNotSettable(id));
        }
        let mut inner = self.inner.write();
        let record = inner.entities.get_mut(&id).ok_or(WorldError::UnknownEntity(id))?;
        record.removed.remove(&state.kind());
        record.components.insert(
            state.kind(),
            Stamped {
                state,
                modified: tick,
            },
        );
        Ok(())
    }

    /// Remove a component, stamping the removal so deltas carry it
    pub fn remove_component(
        &self,
        id: EntityId,
        kind: ComponentKind,
        tick: Tick,
    ) -> Result<bool, WorldError> {
        let mut inner = self.inner.write();
        let record = inner.entities.get_mut(&id).ok_or(WorldError::UnknownEntity(id))?;
        if record.components.remove(&kind).is_none() {
            return Ok(false);
        }
        record.removed.insert(kind, tick);
        Ok(true)
    }

    pub fn set_position(&self, id: EntityId, position: Vec2, tick: Tick) -> Result<(), WorldError> {
        let mut inner = self.inner.write();
        let record = inner.entities.get_mut(&id).ok_or(WorldError::UnknownEntity(id))?;
        record.transform.position = position;
        record.transform_modified = tick;
        let map = record.transform.map;
        let is_root = record.transform.parent.is_none();
        if !is_root {
            inner.spatial.insert(id, map, position);
        }
        Ok(())
    }

    /// Re-parent within the same map
    pub fn set_parent(&self, id: EntityId, parent: EntityId, tick: Tick) -> Result<(), WorldError> {
        let mut inner = self.inner.write();
        if !inner.entities.contains_key(&parent) {
            return Err(WorldError::UnknownEntity(parent));
        }
        if inner.is_ancestor(id, parent) {
            return Err(WorldError::ParentCycle(id));
        }
        let record = inner.entities.get_mut(&id).ok_or(WorldError::UnknownEntity(id))?;
        let old_parent = record.transform.parent;
        record.transform.parent = Some(parent);
        record.transform_modified = tick;

        inner.detach_from_parent(id, old_parent);
        if let Some(parent_record) = inner.entities.get_mut(&parent) {
            parent_record.children.push(id);
        }
        Ok(())
    }

    /// Remove an entity and all of its descendants.
    /// Returns every removed id, parents before children.
    pub fn despawn(&self, id: EntityId) -> Vec<EntityId> {
        let mut inner = self.inner.write();
        let Some(parent) = inner.entities.get(&id).map(|r| r.transform.parent) else {
            return Vec::new();
        };
        inner.detach_from_parent(id, parent);

        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(record) = inner.entities.remove(&current) {
                inner.spatial.remove(current);
                stack.extend(record.children.iter().copied());
                removed.push(current);
            }
        }
        inner.map_roots.retain(|_, root| *root != id);
        removed
    }

    /// Remove a map, its root and everything on it
    pub fn delete_map(&self, map: MapId) -> Result<Vec<EntityId>, WorldError> {
        let root = self.map_root(map).ok_or(WorldError::UnknownMap(map))?;
        Ok(self.despawn(root))
    }

    pub fn entity_count(&self) -> usize {
        self.inner.read().entities.len()
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.inner.read().entities.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for MemoryWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore for MemoryWorld {
    fn full_state_dump(&self, _session: SessionId, since: Tick) -> Vec<EntityStateDelta> {
        let inner = self.inner.read();
        let mut states: Vec<EntityStateDelta> = inner
            .entities
            .iter()
            .map(|(id, record)| record.delta_since(*id, since))
            .filter(|delta| !delta.is_empty())
            .collect();
        states.sort_unstable_by_key(|d| d.id);
        states
    }

    fn entity_delta(&self, id: EntityId, since: Tick, _session: SessionId) -> EntityStateDelta {
        match self.inner.read().entities.get(&id) {
            Some(record) => record.delta_since(id, since),
            None => EntityStateDelta::empty(id),
        }
    }

    fn contains(&self, id: EntityId) -> bool {
        self.inner.read().entities.contains_key(&id)
    }

    fn parent_of(&self, id: EntityId) -> Option<EntityId> {
        self.inner.read().entities.get(&id).and_then(|r| r.transform.parent)
    }

    fn map_root(&self, map: MapId) -> Option<EntityId> {
        self.inner.read().map_roots.get(&map).copied()
    }

    fn transform(&self, id: EntityId) -> Option<Transform> {
        self.inner.read().entities.get(&id).map(|r| r.transform)
    }

    fn visibility(&self, id: EntityId) -> Option<Visibility> {
        let inner = self.inner.read();
        match inner.entities.get(&id)?.components.get(&ComponentKind::Visibility) {
            Some(Stamped {
                state: ComponentState::Visibility(v),
                ..
            }) => Some(*v),
            _ => None,
        }
    }

    fn eye(&self, id: EntityId) -> Option<Eye> {
        let inner = self.inner.read();
        match inner.entities.get(&id)?.components.get(&ComponentKind::Eye) {
            Some(Stamped {
                state: ComponentState::Eye(eye),
                ..
            }) => Some(*eye),
            _ => None,
        }
    }
}

impl SpatialIndex for MemoryWorld {
    fn for_each_in_region(&self, map: MapId, region: Box2, visit: &mut dyn FnMut(EntityId)) {
        let mut found = REGION_QUERY_BUFFER.with(|cell| std::mem::take(&mut *cell.borrow_mut()));
        found.clear();
        found.extend(self.inner.read().spatial.query_region(map, region));

        for id in found.iter().copied() {
            visit(id);
        }

        REGION_QUERY_BUFFER.with(|cell| *cell.borrow_mut() = found);
    }
}
