//! Spatial hash grid for view-region queries
//!
//! Divides each map into square cells and stores entities in each cell.
//! Region queries only visit the cells the region overlaps.

use hashbrown::HashMap;

use crate::game::ids::{EntityId, MapId};
use crate::util::vec2::{Box2, Vec2};

/// Default cell size for the entity grid (world units)
/// Roughly a quarter of the default view size so a view box touches ~25 cells
pub const ENTITY_GRID_CELL_SIZE: f32 = 8.0;

/// Initial capacity for grid cells (number of expected non-empty cells)
const ENTITY_GRID_INITIAL_CAPACITY: usize = 256;

/// Initial capacity for entity vectors within cells
const ENTITY_CELL_INITIAL_CAPACITY: usize = 8;

/// Read-only range queries over entities on a map.
///
/// Invoked once per viewer per session per tick, possibly from several
/// threads at once.
pub trait SpatialIndex: Send + Sync {
    /// Call `visit` for every entity on `map` whose position lies inside `region`
    fn for_each_in_region(&self, map: MapId, region: Box2, visit: &mut dyn FnMut(EntityId));
}

/// Grid cell key - map plus (x, y) cell coordinates
pub type CellKey = (MapId, i32, i32);

#[derive(Debug, Clone, Copy)]
pub struct SpatialEntry {
    pub id: EntityId,
    pub position: Vec2,
}

/// Spatial hash grid keyed by map
#[derive(Debug, Clone)]
pub struct SpatialGrid {
    /// Cell size in world units (larger = fewer cells, more entities per cell)
    cell_size: f32,
    /// Inverse cell size for fast position-to-cell conversion
    inv_cell_size: f32,
    /// Map from cell key to entities in that cell
    cells: HashMap<CellKey, Vec<SpatialEntry>>,
    /// Current cell of every indexed entity, for moves and removals
    locations: HashMap<EntityId, CellKey>,
}

impl SpatialGrid {
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            cells: HashMap::with_capacity(ENTITY_GRID_INITIAL_CAPACITY),
            locations: HashMap::with_capacity(ENTITY_GRID_INITIAL_CAPACITY),
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    #[inline]
    fn position_to_cell(&self, map: MapId, position: Vec2) -> CellKey {
        (
            map,
            (position.x * self.inv_cell_size).floor() as i32,
            (position.y * self.inv_cell_size).floor() as i32,
        )
    }

    /// Insert or move an entity
    pub fn insert(&mut self, id: EntityId, map: MapId, position: Vec2) {
        self.remove(id);
        let cell_key = self.position_to_cell(map, position);
        self.cells
            .entry(cell_key)
            .or_insert_with(|| Vec::with_capacity(ENTITY_CELL_INITIAL_CAPACITY))
            .push(SpatialEntry { id, position });
        self.locations.insert(id, cell_key);
    }

    /// Remove an entity
    /// Returns true if the entity was found and removed
    pub fn remove(&mut self, id: EntityId) -> bool {
        let Some(cell_key) = self.locations.remove(&id) else {
            return false;
        };
        if let Some(cell) = self.cells.get_mut(&cell_key) {
            if let Some(idx) = cell.iter().position(|e| e.id == id) {
                cell.swap_remove(idx);
                return true;
            }
        }
        false
    }

    /// Iterate entities on `map` inside `region`
    pub fn query_region(&self, map: MapId, region: Box2) -> impl Iterator<Item = EntityId> + '_ {
        let (_, min_x, min_y) = self.position_to_cell(map, region.min);
        let (_, max_x, max_y) = self.position_to_cell(map, region.max);

        (min_x..=max_x).flat_map(move |cx| {
            (min_y..=max_y).flat_map(move |cy| {
                self.cells
                    .get(&(map, cx, cy))
                    .into_iter()
                    .flat_map(|cell| cell.iter())
                    .filter(move |e| region.contains(e.position))
                    .map(|e| e.id)
            })
        })
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

impl Default for SpatialGrid {
    fn default() -> Self {
        Self::new(ENTITY_GRID_CELL_SIZE)
    }
}

impl SpatialIndex for SpatialGrid {
    fn for_each_in_region(&self, map: MapId, region: Box2, visit: &mut dyn FnMut(EntityId)) {
        for id in self.query_region(map, region) {
            visit(id);
        }
    }
}
