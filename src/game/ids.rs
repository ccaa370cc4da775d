//! Identifier and tick types shared by server and client

use std::fmt;

use serde::{Deserialize, Serialize};

/// Session identifier (one per connected player)
pub type SessionId = uuid::Uuid;

/// Simulation tick. `Tick::ZERO` means "full state requested/required".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Tick(pub u32);

impl Tick {
    pub const ZERO: Tick = Tick(0);

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// `None` once the counter is exhausted
    #[inline]
    pub fn checked_next(self) -> Option<Tick> {
        self.0.checked_add(1).map(Tick)
    }

    /// Saturates at `u32::MAX`; never wraps back to `ZERO`, which means
    /// "full state" on the wire
    #[inline]
    pub fn next(self) -> Tick {
        Tick(self.0.saturating_add(1))
    }

    /// Saturates at zero
    #[inline]
    pub fn prev(self) -> Tick {
        Tick(self.0.saturating_sub(1))
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GridId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MapId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

impl fmt::Display for GridId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Anything whose destruction is replicated through the deletion ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeletedId {
    Entity(EntityId),
    Grid(GridId),
    Map(MapId),
}
