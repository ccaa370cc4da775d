//! Replicated component payloads and per-entity state deltas
//!
//! Component state is a closed tagged union. Anything that needs to act on a
//! specific kind matches on [`ComponentState`] rather than probing types at
//! runtime.

use serde::{Deserialize, Serialize};

use crate::game::ids::{EntityId, GridId, MapId};
use crate::util::vec2::Vec2;

/// Visibility mask used by viewers without an eye component
pub const DEFAULT_VISIBILITY_MASK: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    Transform,
    Visibility,
    Eye,
    Appearance,
    Grid,
    MetaData,
}

/// World-space placement. `parent == None` marks a map root.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub map: MapId,
    pub parent: Option<EntityId>,
    pub position: Vec2,
}

/// Visibility layer bits. An entity is only visible to viewers whose mask
/// intersects `layer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visibility {
    pub layer: u32,
}

impl Visibility {
    #[inline]
    pub fn visible_to(&self, mask: u32) -> bool {
        self.layer & mask != 0
    }
}

/// Marks an entity as a viewer (camera) with its own visibility mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eye {
    pub visibility_mask: u32,
}

impl Default for Eye {
    fn default() -> Self {
        Self {
            visibility_mask: DEFAULT_VISIBILITY_MASK,
        }
    }
}

/// Appearance variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Visualizer {
    Sprite {
        sheet: String,
        state: String,
        color: [u8; 4],
    },
    Layered {
        layers: Vec<String>,
    },
    Damage {
        thresholds: Vec<u32>,
        damage: u32,
    },
}

impl Visualizer {
    /// Number of render layers this appearance draws
    pub fn layer_count(&self) -> usize {
        match self {
            Visualizer::Sprite { .. } => 1,
            Visualizer::Layered { layers } => layers.len(),
            // one base layer plus one overlay per crossed threshold
            Visualizer::Damage { thresholds, damage } => {
                1 + thresholds.iter().filter(|&&t| *damage >= t).count()
            }
        }
    }
}

/// Binds an entity to the grid it represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridMarker {
    pub grid: GridId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaData {
    pub name: String,
    pub prototype: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ComponentState {
    Transform(Transform),
    Visibility(Visibility),
    Eye(Eye),
    Appearance(Visualizer),
    Grid(GridMarker),
    MetaData(MetaData),
}

impl ComponentState {
    pub fn kind(&self) -> ComponentKind {
        match self {
            ComponentState::Transform(_) => ComponentKind::Transform,
            ComponentState::Visibility(_) => ComponentKind::Visibility,
            ComponentState::Eye(_) => ComponentKind::Eye,
            ComponentState::Appearance(_) => ComponentKind::Appearance,
            ComponentState::Grid(_) => ComponentKind::Grid,
            ComponentState::MetaData(_) => ComponentKind::MetaData,
        }
    }
}

/// Changed components of one entity since a reference tick.
/// An empty delta means "nothing changed" and is never sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStateDelta {
    pub id: EntityId,
    pub components: Vec<ComponentState>,
    /// Components removed since the reference tick
    pub removed: Vec<ComponentKind>,
}

impl EntityStateDelta {
    pub fn empty(id: EntityId) -> Self {
        Self {
            id,
            components: Vec::new(),
            removed: Vec::new(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty() && self.removed.is_empty()
    }

    pub fn get(&self, kind: ComponentKind) -> Option<&ComponentState> {
        self.components.iter().find(|c| c.kind() == kind)
    }
}
