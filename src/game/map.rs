//! Maps, grids and tile chunks
//!
//! Every grid belongs to exactly one map and stores tiles in fixed-size
//! square chunks. Grids, maps and chunks carry the tick they were last
//! modified so the delta encoder only re-sends what changed.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::game::ids::{EntityId, GridId, MapId, Tick};
use crate::util::vec2::Vec2;

/// Tiles per chunk edge
pub const CHUNK_SIZE: usize = 16;

/// Tiles per chunk
pub const CHUNK_AREA: usize = CHUNK_SIZE * CHUNK_SIZE;

/// Chunk coordinates within a grid
pub type ChunkIndices = (i32, i32);

/// Tile coordinates within a grid
pub type TileIndices = (i32, i32);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile {
    pub type_id: u16,
    pub flags: u8,
    pub variant: u8,
}

impl Tile {
    pub const EMPTY: Tile = Tile {
        type_id: 0,
        flags: 0,
        variant: 0,
    };

    pub fn new(type_id: u16) -> Self {
        Self {
            type_id,
            ..Self::EMPTY
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.type_id == 0
    }
}

/// Chunk holding the tile at grid-local `indices`, and the tile's offset in it
#[inline]
pub fn chunk_of(indices: TileIndices) -> (ChunkIndices, (usize, usize)) {
    let size = CHUNK_SIZE as i32;
    (
        (indices.0.div_euclid(size), indices.1.div_euclid(size)),
        (indices.0.rem_euclid(size) as usize, indices.1.rem_euclid(size) as usize),
    )
}

/// Grid-local coordinates of flat row-major index `i` inside `chunk`
#[inline]
pub fn tile_in_chunk(chunk: ChunkIndices, i: usize) -> TileIndices {
    let size = CHUNK_SIZE as i32;
    (
        chunk.0 * size + (i % CHUNK_SIZE) as i32,
        chunk.1 * size + (i / CHUNK_SIZE) as i32,
    )
}

#[derive(Debug, Clone)]
pub struct Chunk {
    indices: ChunkIndices,
    /// Indexed `[y][x]`
    tiles: Box<[[Tile; CHUNK_SIZE]; CHUNK_SIZE]>,
    last_modified: Tick,
}

impl Chunk {
    pub fn new(indices: ChunkIndices, tick: Tick) -> Self {
        Self {
            indices,
            tiles: Box::new([[Tile::EMPTY; CHUNK_SIZE]; CHUNK_SIZE]),
            last_modified: tick,
        }
    }

    pub fn indices(&self) -> ChunkIndices {
        self.indices
    }

    pub fn last_modified(&self) -> Tick {
        self.last_modified
    }

    #[inline]
    pub fn tile(&self, x: usize, y: usize) -> Tile {
        self.tiles[y][x]
    }

    /// Returns the previous tile
    #[inline]
    fn replace(&mut self, x: usize, y: usize, tile: Tile, tick: Tick) -> Tile {
        let old = std::mem::replace(&mut self.tiles[y][x], tile);
        if old != tile {
            self.last_modified = tick;
        }
        old
    }

    /// Append all tiles row-major (row `y`, then column `x`)
    pub fn flatten_into(&self, out: &mut Vec<Tile>) {
        out.reserve(CHUNK_AREA);
        for row in self.tiles.iter() {
            out.extend_from_slice(row);
        }
    }

    /// Grid-local coordinates of the tile at flat index `i`
    #[inline]
    pub fn tile_indices(&self, i: usize) -> TileIndices {
        tile_in_chunk(self.indices, i)
    }
}

#[derive(Debug, Clone)]
pub struct Grid {
    id: GridId,
    map: MapId,
    is_default: bool,
    /// Entity representing this grid, once known
    entity: Option<EntityId>,
    position: Vec2,
    chunks: HashMap<ChunkIndices, Chunk>,
    created: Tick,
    last_modified: Tick,
}

impl Grid {
    pub fn id(&self) -> GridId {
        self.id
    }

    pub fn map(&self) -> MapId {
        self.map
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn entity(&self) -> Option<EntityId> {
        self.entity
    }

    /// Created locally without an authoritative grid entity yet
    pub fn is_provisional(&self) -> bool {
        self.entity.is_none()
    }

    pub fn position(&self) -> Vec2 {
        self.position
    }

    pub fn created(&self) -> Tick {
        self.created
    }

    pub fn last_modified(&self) -> Tick {
        self.last_modified
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    pub fn chunk(&self, indices: ChunkIndices) -> Option<&Chunk> {
        self.chunks.get(&indices)
    }

    pub fn tile(&self, indices: TileIndices) -> Tile {
        let (chunk, (x, y)) = chunk_of(indices);
        self.chunks
            .get(&chunk)
            .map_or(Tile::EMPTY, |c| c.tile(x, y))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapData {
    pub id: MapId,
    pub default_grid: GridId,
    pub created: Tick,
}

/// Batched notification listing only the tiles that actually changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridChangedEvent {
    pub grid: GridId,
    pub modified: Vec<(TileIndices, Tile)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapEvent {
    MapCreated(MapId),
    MapDeleted(MapId),
    GridCreated { grid: GridId, map: MapId },
    GridRemoved { grid: GridId, map: MapId },
    TileChanged {
        grid: GridId,
        indices: TileIndices,
        old: Tile,
        new: Tile,
    },
    GridChanged(GridChangedEvent),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MapError {
    #[error("Map {0} does not exist")]
    UnknownMap(MapId),
    #[error("Map {0} already exists")]
    MapExists(MapId),
    #[error("Grid {0} does not exist")]
    UnknownGrid(GridId),
    #[error("Grid {0} already exists")]
    GridExists(GridId),
}

/// Owner of all maps and grids on one side of the connection
#[derive(Debug, Default)]
pub struct MapManager {
    maps: BTreeMap<MapId, MapData>,
    grids: BTreeMap<GridId, Grid>,
    suppress_tile_events: bool,
    events: Vec<MapEvent>,
}

impl MapManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a map together with its default grid
    pub fn create_map(&mut self, map: MapId, default_grid: GridId, tick: Tick) -> Result<(), MapError> {
        if self.maps.contains_key(&map) {
            return Err(MapError::MapExists(map));
        }
        if self.grids.contains_key(&default_grid) {
            return Err(MapError::GridExists(default_grid));
        }
        self.maps.insert(
            map,
            MapData {
                id: map,
                default_grid,
                created: tick,
            },
        );
        self.events.push(MapEvent::MapCreated(map));
        self.insert_grid(default_grid, map, true, None, tick);
        debug!("Created map {} with default grid {}", map, default_grid);
        Ok(())
    }

    /// Create a non-default grid. `entity == None` leaves it provisional.
    pub fn create_grid(
        &mut self,
        grid: GridId,
        map: MapId,
        entity: Option<EntityId>,
        tick: Tick,
    ) -> Result<(), MapError> {
        if !self.maps.contains_key(&map) {
            return Err(MapError::UnknownMap(map));
        }
        if self.grids.contains_key(&grid) {
            return Err(MapError::GridExists(grid));
        }
        self.insert_grid(grid, map, false, entity, tick);
        Ok(())
    }

    fn insert_grid(&mut self, grid: GridId, map: MapId, is_default: bool, entity: Option<EntityId>, tick: Tick) {
        self.grids.insert(
            grid,
            Grid {
                id: grid,
                map,
                is_default,
                entity,
                position: Vec2::ZERO,
                chunks: HashMap::new(),
                created: tick,
                last_modified: tick,
            },
        );
        self.events.push(MapEvent::GridCreated { grid, map });
    }

    /// Attach the authoritative entity to a grid
    pub fn bind_grid_entity(&mut self, grid: GridId, entity: EntityId) -> Result<(), MapError> {
        let g = self.grids.get_mut(&grid).ok_or(MapError::UnknownGrid(grid))?;
        g.entity = Some(entity);
        Ok(())
    }

    pub fn set_grid_position(&mut self, grid: GridId, position: Vec2, tick: Tick) -> Result<(), MapError> {
        let g = self.grids.get_mut(&grid).ok_or(MapError::UnknownGrid(grid))?;
        if g.position != position {
            g.position = position;
            g.last_modified = tick;
        }
        Ok(())
    }

    /// Set one tile. Returns the previous tile.
    pub fn set_tile(
        &mut self,
        grid: GridId,
        indices: TileIndices,
        tile: Tile,
        tick: Tick,
    ) -> Result<Tile, MapError> {
        let g = self.grids.get_mut(&grid).ok_or(MapError::UnknownGrid(grid))?;
        let (chunk_indices, (x, y)) = chunk_of(indices);
        let chunk = g
            .chunks
            .entry(chunk_indices)
            .or_insert_with(|| Chunk::new(chunk_indices, tick));
        let old = chunk.replace(x, y, tile, tick);
        if old != tile {
            g.last_modified = tick;
            if !self.suppress_tile_events {
                self.events.push(MapEvent::TileChanged {
                    grid,
                    indices,
                    old,
                    new: tile,
                });
            }
        }
        Ok(old)
    }

    /// Remove a grid
    pub fn delete_grid(&mut self, grid: GridId) -> Result<(), MapError> {
        let g = self.grids.remove(&grid).ok_or(MapError::UnknownGrid(grid))?;
        self.events.push(MapEvent::GridRemoved { grid, map: g.map });
        Ok(())
    }

    /// Remove a map and every grid on it. Returns the removed grids.
    pub fn delete_map(&mut self, map: MapId) -> Result<Vec<GridId>, MapError> {
        if self.maps.remove(&map).is_none() {
            return Err(MapError::UnknownMap(map));
        }
        let removed: Vec<GridId> = self
            .grids
            .values()
            .filter(|g| g.map == map)
            .map(|g| g.id)
            .collect();
        for grid in &removed {
            self.grids.remove(grid);
            self.events.push(MapEvent::GridRemoved { grid: *grid, map });
        }
        self.events.push(MapEvent::MapDeleted(map));
        Ok(removed)
    }

    /// Run `f` with per-tile events suppressed, restoring the previous
    /// setting afterwards
    pub fn with_tile_events_suppressed<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let previous = std::mem::replace(&mut self.suppress_tile_events, true);
        let result = f(self);
        self.suppress_tile_events = previous;
        result
    }

    pub fn tile_events_suppressed(&self) -> bool {
        self.suppress_tile_events
    }

    pub(crate) fn emit_grid_changed(&mut self, event: GridChangedEvent) {
        self.events.push(MapEvent::GridChanged(event));
    }

    pub fn drain_events(&mut self) -> Vec<MapEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn map(&self, map: MapId) -> Option<&MapData> {
        self.maps.get(&map)
    }

    pub fn maps(&self) -> impl Iterator<Item = &MapData> {
        self.maps.values()
    }

    pub fn grid(&self, grid: GridId) -> Option<&Grid> {
        self.grids.get(&grid)
    }

    pub fn grids(&self) -> impl Iterator<Item = &Grid> {
        self.grids.values()
    }

    pub fn has_map(&self, map: MapId) -> bool {
        self.maps.contains_key(&map)
    }

    pub fn has_grid(&self, grid: GridId) -> bool {
        self.grids.contains_key(&grid)
    }
}
