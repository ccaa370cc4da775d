use serde::{Deserialize, Serialize};

use crate::game::components::EntityStateDelta;
use crate::game::ids::{EntityId, GridId, MapId, SessionId, Tick};
use crate::game::map::{ChunkIndices, Tile};
use crate::net::session::SessionStatus;
use crate::util::vec2::Vec2;

/// Messages from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Acknowledge receiving a snapshot (fire-and-forget)
    SnapshotAck { tick: Tick },
    /// Client lost its state and needs a full snapshot
    RequestFullState,
}

/// Messages from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    Snapshot(Snapshot),
}

/// Replicated per-player information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub session: SessionId,
    pub name: String,
    pub status: SessionStatus,
    pub attached_entity: Option<EntityId>,
}

/// Map announcement together with its default grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapCreation {
    pub map: MapId,
    pub default_grid: GridId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridCreation {
    pub grid: GridId,
    pub map: MapId,
    pub is_default: bool,
}

/// One chunk's tiles, flattened row-major
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDatum {
    pub indices: ChunkIndices,
    pub tiles: Vec<Tile>,
}

/// Placement and changed chunks of one grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridDatum {
    pub grid: GridId,
    pub map: MapId,
    pub position: Vec2,
    pub chunks: Option<Vec<ChunkDatum>>,
}

/// Map and grid changes over a tick window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapDelta {
    pub created_maps: Option<Vec<MapCreation>>,
    pub created_grids: Option<Vec<GridCreation>>,
    pub grid_data: Option<Vec<GridDatum>>,
    pub deleted_grids: Option<Vec<GridId>>,
    pub deleted_maps: Option<Vec<MapId>>,
}

impl MapDelta {
    pub fn is_empty(&self) -> bool {
        self.created_maps.is_none()
            && self.created_grids.is_none()
            && self.grid_data.is_none()
            && self.deleted_grids.is_none()
            && self.deleted_maps.is_none()
    }
}

/// Tick-scoped bundle of everything a session needs to go from
/// `from_tick` to `to_tick`. `from_tick == ZERO` marks a full snapshot.
///
/// Collection fields are `None` when there is nothing to send, never
/// `Some(vec![])`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub from_tick: Tick,
    pub to_tick: Tick,
    pub entity_states: Option<Vec<EntityStateDelta>>,
    pub entity_deletions: Option<Vec<EntityId>>,
    /// Entities that left the session's view but still exist
    pub left_view: Option<Vec<EntityId>>,
    pub map_delta: Option<MapDelta>,
    pub player_states: Option<Vec<PlayerState>>,
    /// Synthesized locally because the real snapshot had not arrived
    #[serde(default)]
    pub extrapolated: bool,
}

impl Snapshot {
    pub fn new(from_tick: Tick, to_tick: Tick) -> Self {
        Self {
            from_tick,
            to_tick,
            entity_states: None,
            entity_deletions: None,
            left_view: None,
            map_delta: None,
            player_states: None,
            extrapolated: false,
        }
    }

    /// Empty stand-in for a snapshot that has not arrived
    pub fn placeholder(from_tick: Tick, to_tick: Tick) -> Self {
        Self {
            extrapolated: true,
            ..Self::new(from_tick, to_tick)
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.from_tick.is_zero()
    }

    /// True when no payload field is set
    pub fn has_no_payload(&self) -> bool {
        self.entity_states.is_none()
            && self.entity_deletions.is_none()
            && self.left_view.is_none()
            && self.map_delta.is_none()
            && self.player_states.is_none()
    }
}

/// `None` for an empty collection
#[inline]
pub fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// Encode a message using bincode
/// Uses legacy config for fixed-size integers
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy())
        .map_err(|e| EncodeError(e.to_string()))
}

/// Decode a message using bincode
/// Uses legacy config for fixed-size integers
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DecodeError> {
    bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map(|(msg, _)| msg)
        .map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(String);
