pub mod deletion;
pub mod map_delta;
pub mod protocol;
pub mod pvs;
pub mod replication;
pub mod session;
