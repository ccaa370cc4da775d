//! Entity store interface consumed by the view culler

use crate::game::components::{Eye, EntityStateDelta, Transform, Visibility};
use crate::game::ids::{EntityId, MapId, SessionId, Tick};

/// Owner of entity and component lifecycle.
///
/// The culler only reads from the store. Implementations must tolerate
/// concurrent reads from several sessions during a tick.
pub trait EntityStore: Send + Sync {
    /// Every entity's state changed since `since`, for a session that
    /// receives the whole world
    fn full_state_dump(&self, session: SessionId, since: Tick) -> Vec<EntityStateDelta>;

    /// State of `id` changed since `since`, as seen by `session`.
    /// Returns an empty delta when nothing changed.
    fn entity_delta(&self, id: EntityId, since: Tick, session: SessionId) -> EntityStateDelta;

    fn contains(&self, id: EntityId) -> bool;

    fn parent_of(&self, id: EntityId) -> Option<EntityId>;

    /// Root entity of a map (the top of every parent chain on that map)
    fn map_root(&self, map: MapId) -> Option<EntityId>;

    fn transform(&self, id: EntityId) -> Option<Transform>;

    fn visibility(&self, id: EntityId) -> Option<Visibility>;

    fn eye(&self, id: EntityId) -> Option<Eye>;
}
