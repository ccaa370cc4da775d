pub mod components;
pub mod ids;
pub mod map;
pub mod spatial;
pub mod store;
pub mod world;
