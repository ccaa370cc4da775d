pub mod snapshot_buffer;
pub mod world;
