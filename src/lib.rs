//! Worldcast replication library
//!
//! Per-tick world-state replication: view culling, deletion tracking, map
//! deltas on the server, and a jitter-tolerant snapshot buffer on the client.
//!
//! # Features
//!
//! - `parallel_cull` - Build per-session snapshots on the rayon pool (enabled by default)
//! - `metrics_extended` - Cull timing percentiles and pool counters (enabled by default)

pub mod client;
pub mod config;
pub mod game;
pub mod metrics;
pub mod net;
pub mod util;
