//! Map and grid delta encoding
//!
//! The server builds one [`MapDelta`] per snapshot covering everything that
//! changed since the session's base tick. The client applies it in two
//! halves around the entity states: [`apply_pre`] creates maps and grids
//! and writes tiles before entities that live on them arrive,
//! [`apply_post`] binds and deletes after entities have been processed.
//!
//! Snapshot windows overlap until the client acks, so application is
//! idempotent: re-announced maps and grids and repeated deletions are
//! skipped.

use tracing::{debug, trace};

use crate::game::ids::{DeletedId, EntityId, GridId, MapId, Tick};
use crate::game::map::{tile_in_chunk, GridChangedEvent, MapError, MapManager, CHUNK_AREA};
use crate::net::protocol::{non_empty, ChunkDatum, GridCreation, GridDatum, MapCreation, MapDelta};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MapDeltaError {
    #[error("Default grid {grid} of map {map} was announced without the default flag")]
    DefaultGridNotFlagged { map: MapId, grid: GridId },
    #[error("Grid {grid} cannot move from map {from} to map {to}")]
    GridReparent { grid: GridId, from: MapId, to: MapId },
    #[error("Chunk {indices:?} of grid {grid} carries {len} tiles instead of a full chunk")]
    MalformedChunk {
        grid: GridId,
        indices: (i32, i32),
        len: usize,
    },
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Looks up the authoritative entity of a grid in the local world
pub trait GridResolver {
    fn grid_entity(&self, grid: GridId) -> Option<EntityId>;
}

// ============================================================================
// Server side
// ============================================================================

/// Collect map changes at or after `from_tick`. Grid and map ids among
/// `deletions` become removals; entity ids are ignored.
///
/// Returns `None` when nothing changed.
pub fn build_delta(maps: &MapManager, deletions: Option<&[DeletedId]>, from_tick: Tick) -> Option<MapDelta> {
    let created_maps: Vec<MapCreation> = maps
        .maps()
        .filter(|m| m.created >= from_tick)
        .map(|m| MapCreation {
            map: m.id,
            default_grid: m.default_grid,
        })
        .collect();

    let mut created_grids = Vec::new();
    let mut grid_data = Vec::new();
    let mut scratch = Vec::with_capacity(CHUNK_AREA);

    for grid in maps.grids() {
        if grid.created() >= from_tick {
            created_grids.push(GridCreation {
                grid: grid.id(),
                map: grid.map(),
                is_default: grid.is_default(),
            });
        }
        if grid.last_modified() < from_tick {
            continue;
        }

        let mut chunks: Vec<ChunkDatum> = grid
            .chunks()
            .filter(|c| c.last_modified() >= from_tick)
            .map(|c| {
                scratch.clear();
                c.flatten_into(&mut scratch);
                ChunkDatum {
                    indices: c.indices(),
                    tiles: scratch.clone(),
                }
            })
            .collect();
        chunks.sort_unstable_by_key(|c| c.indices);

        grid_data.push(GridDatum {
            grid: grid.id(),
            map: grid.map(),
            position: grid.position(),
            chunks: non_empty(chunks),
        });
    }

    let mut deleted_grids = Vec::new();
    let mut deleted_maps = Vec::new();
    for id in deletions.unwrap_or_default() {
        match *id {
            DeletedId::Grid(grid) => deleted_grids.push(grid),
            DeletedId::Map(map) => deleted_maps.push(map),
            DeletedId::Entity(_) => {}
        }
    }

    let delta = MapDelta {
        created_maps: non_empty(created_maps),
        created_grids: non_empty(created_grids),
        grid_data: non_empty(grid_data),
        deleted_grids: non_empty(deleted_grids),
        deleted_maps: non_empty(deleted_maps),
    };

    if delta.is_empty() {
        None
    } else {
        Some(delta)
    }
}

// ============================================================================
// Client side
// ============================================================================

/// Create announced maps and grids, then write grid positions and tiles.
///
/// Tile writes are batched: per-tile events are suppressed and each grid
/// emits a single `GridChanged` listing only the tiles that differed.
pub fn apply_pre(maps: &mut MapManager, delta: &MapDelta, tick: Tick) -> Result<(), MapDeltaError> {
    let created_grids = delta.created_grids.as_deref().unwrap_or_default();

    // Phase 1: maps with their default grids
    for creation in delta.created_maps.as_deref().unwrap_or_default() {
        if maps.has_map(creation.map) {
            continue;
        }
        if let Some(announced) = created_grids.iter().find(|g| g.grid == creation.default_grid) {
            if !announced.is_default {
                return Err(MapDeltaError::DefaultGridNotFlagged {
                    map: creation.map,
                    grid: creation.default_grid,
                });
            }
        }
        maps.create_map(creation.map, creation.default_grid, tick)?;
        trace!("Created map {} from delta", creation.map);
    }

    // Phase 2: remaining grids, provisional until their entity shows up
    for creation in created_grids {
        if let Some(existing) = maps.grid(creation.grid) {
            if existing.map() != creation.map {
                return Err(MapDeltaError::GridReparent {
                    grid: creation.grid,
                    from: existing.map(),
                    to: creation.map,
                });
            }
            continue;
        }
        maps.create_grid(creation.grid, creation.map, None, tick)?;
        trace!("Created provisional grid {} on map {}", creation.grid, creation.map);
    }

    // Phase 3: positions and tiles
    for datum in delta.grid_data.as_deref().unwrap_or_default() {
        apply_grid_datum(maps, datum, tick)?;
    }

    Ok(())
}

fn apply_grid_datum(maps: &mut MapManager, datum: &GridDatum, tick: Tick) -> Result<(), MapDeltaError> {
    let grid = maps.grid(datum.grid).ok_or(MapError::UnknownGrid(datum.grid))?;
    if grid.map() != datum.map {
        return Err(MapDeltaError::GridReparent {
            grid: datum.grid,
            from: grid.map(),
            to: datum.map,
        });
    }
    maps.set_grid_position(datum.grid, datum.position, tick)?;

    let Some(chunks) = datum.chunks.as_deref() else {
        return Ok(());
    };
    if let Some(bad) = chunks.iter().find(|c| c.tiles.len() != CHUNK_AREA) {
        return Err(MapDeltaError::MalformedChunk {
            grid: datum.grid,
            indices: bad.indices,
            len: bad.tiles.len(),
        });
    }

    let modified = maps.with_tile_events_suppressed(|maps| {
        let mut modified = Vec::new();
        for chunk in chunks {
            for (i, tile) in chunk.tiles.iter().enumerate() {
                let indices = tile_in_chunk(chunk.indices, i);
                let old = maps.set_tile(datum.grid, indices, *tile, tick)?;
                if old != *tile {
                    modified.push((indices, *tile));
                }
            }
        }
        Ok::<_, MapError>(modified)
    })?;

    if !modified.is_empty() {
        trace!("Grid {} changed {} tiles", datum.grid, modified.len());
        maps.emit_grid_changed(GridChangedEvent {
            grid: datum.grid,
            modified,
        });
    }
    Ok(())
}

/// Bind provisional grids to their entities, then delete grids and maps.
/// Returns how many grids were bound.
pub fn apply_post(maps: &mut MapManager, delta: &MapDelta, resolver: &dyn GridResolver) -> Result<usize, MapDeltaError> {
    let provisional: Vec<GridId> = maps
        .grids()
        .filter(|g| g.is_provisional())
        .map(|g| g.id())
        .collect();

    let mut bound = 0;
    for grid in provisional {
        if let Some(entity) = resolver.grid_entity(grid) {
            maps.bind_grid_entity(grid, entity)?;
            bound += 1;
        }
    }

    for grid in delta.deleted_grids.as_deref().unwrap_or_default() {
        if maps.has_grid(*grid) {
            maps.delete_grid(*grid)?;
        }
    }
    for map in delta.deleted_maps.as_deref().unwrap_or_default() {
        if maps.has_map(*map) {
            maps.delete_map(*map)?;
        }
    }

    if bound > 0 {
        debug!("Bound {} provisional grids", bound);
    }
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::map::{MapEvent, Tile, CHUNK_SIZE};
    use crate::util::vec2::Vec2;
    use hashbrown::HashMap;

    struct FixedResolver(HashMap<GridId, EntityId>);

    impl GridResolver for FixedResolver {
        fn grid_entity(&self, grid: GridId) -> Option<EntityId> {
            self.0.get(&grid).copied()
        }
    }

    fn no_grids() -> FixedResolver {
        FixedResolver(HashMap::new())
    }

    fn server_world() -> MapManager {
        let mut maps = MapManager::new();
        maps.create_map(MapId(1), GridId(1), Tick(1)).unwrap();
        maps.create_grid(GridId(2), MapId(1), Some(EntityId(20)), Tick(1)).unwrap();
        maps.set_tile(GridId(2), (0, 0), Tile::new(4), Tick(1)).unwrap();
        maps.set_grid_position(GridId(2), Vec2::new(5.0, 6.0), Tick(1)).unwrap();
        maps
    }

    fn sync(server: &MapManager, client: &mut MapManager, from: Tick, tick: Tick) {
        if let Some(delta) = build_delta(server, None, from) {
            apply_pre(client, &delta, tick).unwrap();
            apply_post(client, &delta, &no_grids()).unwrap();
        }
    }

    #[test]
    fn test_no_changes_means_no_delta() {
        let server = server_world();
        assert!(build_delta(&server, None, Tick(2)).is_none());
        // Entity deletions alone are not map changes
        let deletions = [DeletedId::Entity(EntityId(3))];
        assert!(build_delta(&server, Some(&deletions), Tick(2)).is_none());
    }

    #[test]
    fn test_full_delta_announces_everything() {
        let server = server_world();
        let delta = build_delta(&server, None, Tick::ZERO).unwrap();

        assert_eq!(
            delta.created_maps,
            Some(vec![MapCreation {
                map: MapId(1),
                default_grid: GridId(1)
            }])
        );
        let grids = delta.created_grids.as_ref().unwrap();
        assert_eq!(grids.len(), 2);
        assert!(grids.iter().any(|g| g.grid == GridId(1) && g.is_default));
        let data = delta.grid_data.as_ref().unwrap();
        let grid2 = data.iter().find(|d| d.grid == GridId(2)).unwrap();
        assert_eq!(grid2.position, Vec2::new(5.0, 6.0));
        assert_eq!(grid2.chunks.as_ref().unwrap()[0].tiles.len(), CHUNK_AREA);
        // Default grid has no tiles, so no chunk payload
        assert!(data.iter().find(|d| d.grid == GridId(1)).unwrap().chunks.is_none());
    }

    #[test]
    fn test_client_mirrors_server() {
        let server = server_world();
        let mut client = MapManager::new();
        sync(&server, &mut client, Tick::ZERO, Tick(1));

        assert!(client.has_map(MapId(1)));
        assert!(client.grid(GridId(1)).unwrap().is_default());
        let grid = client.grid(GridId(2)).unwrap();
        assert_eq!(grid.tile((0, 0)), Tile::new(4));
        assert_eq!(grid.position(), Vec2::new(5.0, 6.0));
        assert!(grid.is_provisional());
    }

    #[test]
    fn test_three_changed_tiles_in_one_batched_event() {
        let mut server = server_world();
        let mut client = MapManager::new();
        // Fill a whole chunk so every one of its 256 tiles is populated
        for y in 0..CHUNK_SIZE as i32 {
            for x in 0..CHUNK_SIZE as i32 {
                server.set_tile(GridId(2), (x, y), Tile::new(1), Tick(1)).unwrap();
            }
        }
        sync(&server, &mut client, Tick::ZERO, Tick(1));
        client.drain_events();

        server.set_tile(GridId(2), (1, 1), Tile::new(8), Tick(5)).unwrap();
        server.set_tile(GridId(2), (7, 3), Tile::new(8), Tick(5)).unwrap();
        server.set_tile(GridId(2), (15, 15), Tile::EMPTY, Tick(5)).unwrap();

        let delta = build_delta(&server, None, Tick(5)).unwrap();
        let chunks = delta.grid_data.as_ref().unwrap()[0].chunks.as_ref().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].tiles.len(), CHUNK_AREA);

        apply_pre(&mut client, &delta, Tick(5)).unwrap();
        let events = client.drain_events();
        assert_eq!(events.len(), 1, "per-tile events must be suppressed");
        match &events[0] {
            MapEvent::GridChanged(changed) => {
                assert_eq!(changed.grid, GridId(2));
                assert_eq!(changed.modified.len(), 3);
                assert!(changed.modified.contains(&((7, 3), Tile::new(8))));
                assert!(changed.modified.contains(&((15, 15), Tile::EMPTY)));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!client.tile_events_suppressed());
    }

    #[test]
    fn test_negative_chunk_tiles_land_in_place() {
        let mut server = server_world();
        server.set_tile(GridId(2), (-3, -17), Tile::new(9), Tick(2)).unwrap();
        let mut client = MapManager::new();
        sync(&server, &mut client, Tick::ZERO, Tick(2));
        assert_eq!(client.grid(GridId(2)).unwrap().tile((-3, -17)), Tile::new(9));
    }

    #[test]
    fn test_default_grid_must_be_flagged() {
        let delta = MapDelta {
            created_maps: Some(vec![MapCreation {
                map: MapId(3),
                default_grid: GridId(30),
            }]),
            created_grids: Some(vec![GridCreation {
                grid: GridId(30),
                map: MapId(3),
                is_default: false,
            }]),
            ..MapDelta::default()
        };
        let mut client = MapManager::new();
        assert_eq!(
            apply_pre(&mut client, &delta, Tick(1)),
            Err(MapDeltaError::DefaultGridNotFlagged {
                map: MapId(3),
                grid: GridId(30)
            })
        );
        assert!(!client.has_map(MapId(3)));
    }

    #[test]
    fn test_grid_reparent_is_rejected() {
        let server = server_world();
        let mut client = MapManager::new();
        sync(&server, &mut client, Tick::ZERO, Tick(1));
        client.create_map(MapId(2), GridId(50), Tick(1)).unwrap();

        let delta = MapDelta {
            grid_data: Some(vec![GridDatum {
                grid: GridId(2),
                map: MapId(2),
                position: Vec2::ZERO,
                chunks: None,
            }]),
            ..MapDelta::default()
        };
        assert_eq!(
            apply_pre(&mut client, &delta, Tick(2)),
            Err(MapDeltaError::GridReparent {
                grid: GridId(2),
                from: MapId(1),
                to: MapId(2)
            })
        );

        let announced = MapDelta {
            created_grids: Some(vec![GridCreation {
                grid: GridId(2),
                map: MapId(2),
                is_default: false,
            }]),
            ..MapDelta::default()
        };
        assert!(matches!(
            apply_pre(&mut client, &announced, Tick(2)),
            Err(MapDeltaError::GridReparent { .. })
        ));
    }

    #[test]
    fn test_malformed_chunk_is_rejected() {
        let server = server_world();
        let mut client = MapManager::new();
        sync(&server, &mut client, Tick::ZERO, Tick(1));

        let delta = MapDelta {
            grid_data: Some(vec![GridDatum {
                grid: GridId(2),
                map: MapId(1),
                position: Vec2::ZERO,
                chunks: Some(vec![ChunkDatum {
                    indices: (0, 0),
                    tiles: vec![Tile::new(1); 10],
                }]),
            }]),
            ..MapDelta::default()
        };
        assert!(matches!(
            apply_pre(&mut client, &delta, Tick(2)),
            Err(MapDeltaError::MalformedChunk { len: 10, .. })
        ));
    }

    #[test]
    fn test_repeated_window_is_idempotent() {
        let server = server_world();
        let mut client = MapManager::new();
        sync(&server, &mut client, Tick::ZERO, Tick(1));
        client.drain_events();
        // Unacked window is re-sent
        sync(&server, &mut client, Tick::ZERO, Tick(2));
        assert!(client.drain_events().is_empty());
    }

    #[test]
    fn test_post_binds_then_deletes() {
        let mut server = server_world();
        let mut client = MapManager::new();
        sync(&server, &mut client, Tick::ZERO, Tick(1));

        server.create_map(MapId(2), GridId(5), Tick(3)).unwrap();
        server.create_grid(GridId(6), MapId(2), Some(EntityId(60)), Tick(3)).unwrap();
        server.delete_grid(GridId(2)).unwrap();
        let deletions = [DeletedId::Entity(EntityId(20)), DeletedId::Grid(GridId(2))];

        let delta = build_delta(&server, Some(&deletions), Tick(3)).unwrap();
        assert_eq!(delta.deleted_grids, Some(vec![GridId(2)]));
        assert_eq!(delta.deleted_maps, None);

        apply_pre(&mut client, &delta, Tick(3)).unwrap();
        assert!(client.grid(GridId(6)).unwrap().is_provisional());

        let resolver = FixedResolver([(GridId(6), EntityId(60))].into_iter().collect());
        assert_eq!(apply_post(&mut client, &delta, &resolver).unwrap(), 1);
        assert_eq!(client.grid(GridId(6)).unwrap().entity(), Some(EntityId(60)));
        assert!(!client.has_grid(GridId(2)));

        // Deleting the map takes its grids with it
        server.delete_map(MapId(2)).unwrap();
        let deletions = [DeletedId::Map(MapId(2))];
        let delta = build_delta(&server, Some(&deletions), Tick(4)).unwrap();
        apply_pre(&mut client, &delta, Tick(4)).unwrap();
        apply_post(&mut client, &delta, &resolver).unwrap();
        assert!(!client.has_map(MapId(2)));
        assert!(!client.has_grid(GridId(6)));
        // Repeated deletions are ignored
        apply_post(&mut client, &delta, &resolver).unwrap();
    }
}
