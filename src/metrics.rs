//! Prometheus-compatible metrics endpoint
//!
//! Exposes replication metrics in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::net::pvs::CullStats;
use crate::util::pool::PoolStats;

/// Samples kept for percentile calculation
const HISTORY_LEN: usize = 1000;

/// Metrics registry for the replication layer
#[derive(Debug)]
pub struct ReplicationMetrics {
    // Server tick
    pub tick_count: AtomicU64,
    pub sessions_in_game: AtomicU64,

    // Culling (microseconds for the whole per-tick snapshot build)
    pub cull_time_us: AtomicU64,
    pub cull_time_p95_us: AtomicU64,
    pub cull_time_p99_us: AtomicU64,
    pub cull_time_max_us: AtomicU64,
    pub visible_entities: AtomicU64,
    pub entities_entered: AtomicU64,
    pub entities_updated: AtomicU64,
    pub entities_left: AtomicU64,
    pub cull_errors: AtomicU64,

    // Visible set pool
    pub pool_reused: AtomicU64,
    pub pool_allocated: AtomicU64,
    pub pool_discarded: AtomicU64,

    // Deletion ledger
    pub ledger_records: AtomicU64,
    pub ledger_pruned: AtomicU64,

    // Snapshots
    pub snapshots_sent: AtomicU64,
    pub full_snapshots_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub acks_received: AtomicU64,

    // Client buffer
    pub snapshots_received: AtomicU64,
    pub stale_dropped: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub placeholders_replaced: AtomicU64,
    pub extrapolated_ticks: AtomicU64,
    pub consecutive_extrapolations: AtomicU64,
    pub max_consecutive_extrapolations: AtomicU64,

    start_time: Instant,

    // Rolling cull times for percentile calculation
    cull_history: RwLock<VecDeque<u64>>,
}

impl ReplicationMetrics {
    pub fn new() -> Self {
        Self {
            tick_count: AtomicU64::new(0),
            sessions_in_game: AtomicU64::new(0),
            cull_time_us: AtomicU64::new(0),
            cull_time_p95_us: AtomicU64::new(0),
            cull_time_p99_us: AtomicU64::new(0),
            cull_time_max_us: AtomicU64::new(0),
            visible_entities: AtomicU64::new(0),
            entities_entered: AtomicU64::new(0),
            entities_updated: AtomicU64::new(0),
            entities_left: AtomicU64::new(0),
            cull_errors: AtomicU64::new(0),
            pool_reused: AtomicU64::new(0),
            pool_allocated: AtomicU64::new(0),
            pool_discarded: AtomicU64::new(0),
            ledger_records: AtomicU64::new(0),
            ledger_pruned: AtomicU64::new(0),
            snapshots_sent: AtomicU64::new(0),
            full_snapshots_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
            snapshots_received: AtomicU64::new(0),
            stale_dropped: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            placeholders_replaced: AtomicU64::new(0),
            extrapolated_ticks: AtomicU64::new(0),
            consecutive_extrapolations: AtomicU64::new(0),
            max_consecutive_extrapolations: AtomicU64::new(0),
            start_time: Instant::now(),
            cull_history: RwLock::new(VecDeque::with_capacity(HISTORY_LEN)),
        }
    }

    /// Record the time spent building one tick's snapshots and update percentiles
    pub fn record_cull_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.cull_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.cull_history.write();
        history.push_back(us);
        while history.len() > HISTORY_LEN {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.cull_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.cull_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.cull_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Fold one session's cull counters into the totals
    pub fn record_cull_stats(&self, stats: &CullStats) {
        self.visible_entities.fetch_add(stats.visible as u64, Ordering::Relaxed);
        self.entities_entered.fetch_add(stats.entered as u64, Ordering::Relaxed);
        self.entities_updated.fetch_add(stats.updated as u64, Ordering::Relaxed);
        self.entities_left.fetch_add(stats.left as u64, Ordering::Relaxed);
    }

    pub fn record_pool_stats(&self, stats: PoolStats) {
        self.pool_reused.store(stats.reused, Ordering::Relaxed);
        self.pool_allocated.store(stats.allocated, Ordering::Relaxed);
        self.pool_discarded.store(stats.discarded, Ordering::Relaxed);
    }

    pub fn record_snapshot_sent(&self, bytes: usize, full: bool) {
        self.snapshots_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        if full {
            self.full_snapshots_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Track the client's extrapolation streak. `streak == 0` ends it.
    pub fn record_extrapolation(&self, streak: u32) {
        if streak > 0 {
            self.extrapolated_ticks.fetch_add(1, Ordering::Relaxed);
        }
        self.consecutive_extrapolations.store(streak as u64, Ordering::Relaxed);
        self.max_consecutive_extrapolations
            .fetch_max(streak as u64, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        // Server tick
        metric!("worldcast_tick_count", "Total ticks replicated", "counter",
            self.tick_count.load(Ordering::Relaxed));
        metric!("worldcast_sessions_in_game", "Sessions receiving snapshots", "gauge",
            self.sessions_in_game.load(Ordering::Relaxed));

        // Culling
        metric!("worldcast_cull_time_microseconds", "Last snapshot build time", "gauge",
            self.cull_time_us.load(Ordering::Relaxed));
        metric!("worldcast_cull_time_p95_microseconds", "95th percentile snapshot build time", "gauge",
            self.cull_time_p95_us.load(Ordering::Relaxed));
        metric!("worldcast_cull_time_p99_microseconds", "99th percentile snapshot build time", "gauge",
            self.cull_time_p99_us.load(Ordering::Relaxed));
        metric!("worldcast_cull_time_max_microseconds", "Maximum snapshot build time", "gauge",
            self.cull_time_max_us.load(Ordering::Relaxed));
        metric!("worldcast_visible_entities_total", "Visible entities summed over sessions and ticks", "counter",
            self.visible_entities.load(Ordering::Relaxed));
        metric!("worldcast_entities_entered_total", "Entities that entered a session's view", "counter",
            self.entities_entered.load(Ordering::Relaxed));
        metric!("worldcast_entities_updated_total", "Visible entities sent as deltas", "counter",
            self.entities_updated.load(Ordering::Relaxed));
        metric!("worldcast_entities_left_total", "Entities that left a session's view", "counter",
            self.entities_left.load(Ordering::Relaxed));
        metric!("worldcast_cull_errors_total", "Sessions skipped due to cull errors", "counter",
            self.cull_errors.load(Ordering::Relaxed));

        #[cfg(feature = "metrics_extended")]
        {
            metric!("worldcast_pool_reused_total", "Visible sets reused from the pool", "counter",
                self.pool_reused.load(Ordering::Relaxed));
            metric!("worldcast_pool_allocated_total", "Visible sets freshly allocated", "counter",
                self.pool_allocated.load(Ordering::Relaxed));
            metric!("worldcast_pool_discarded_total", "Visible sets dropped by a full pool", "counter",
                self.pool_discarded.load(Ordering::Relaxed));
            metric!("worldcast_ledger_records", "Deletion records retained", "gauge",
                self.ledger_records.load(Ordering::Relaxed));
            metric!("worldcast_ledger_pruned_total", "Deletion records pruned", "counter",
                self.ledger_pruned.load(Ordering::Relaxed));
        }

        // Snapshots
        metric!("worldcast_snapshots_sent_total", "Snapshots sent", "counter",
            self.snapshots_sent.load(Ordering::Relaxed));
        metric!("worldcast_full_snapshots_sent_total", "Full snapshots sent", "counter",
            self.full_snapshots_sent.load(Ordering::Relaxed));
        metric!("worldcast_bytes_sent_total", "Encoded snapshot bytes sent", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("worldcast_acks_received_total", "Snapshot acks received", "counter",
            self.acks_received.load(Ordering::Relaxed));

        // Client buffer
        metric!("worldcast_snapshots_received_total", "Snapshots ingested by clients", "counter",
            self.snapshots_received.load(Ordering::Relaxed));
        metric!("worldcast_stale_dropped_total", "Snapshots dropped as stale", "counter",
            self.stale_dropped.load(Ordering::Relaxed));
        metric!("worldcast_duplicates_dropped_total", "Snapshots dropped as duplicates", "counter",
            self.duplicates_dropped.load(Ordering::Relaxed));
        metric!("worldcast_placeholders_replaced_total", "Placeholders superseded by real snapshots", "counter",
            self.placeholders_replaced.load(Ordering::Relaxed));
        metric!("worldcast_extrapolated_ticks_total", "Client ticks run on a placeholder", "counter",
            self.extrapolated_ticks.load(Ordering::Relaxed));
        metric!("worldcast_consecutive_extrapolations", "Current extrapolation streak", "gauge",
            self.consecutive_extrapolations.load(Ordering::Relaxed));
        metric!("worldcast_max_consecutive_extrapolations", "Longest extrapolation streak", "gauge",
            self.max_consecutive_extrapolations.load(Ordering::Relaxed));

        metric!("worldcast_uptime_seconds", "Uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics
    pub fn to_json(&self) -> String {
        format!(r#"{{
  "server": {{
    "tick_count": {},
    "sessions_in_game": {},
    "uptime_seconds": {}
  }},
  "culling": {{
    "cull_time_us": {},
    "cull_time_p95_us": {},
    "cull_time_p99_us": {},
    "cull_time_max_us": {},
    "visible_entities": {},
    "entered": {},
    "updated": {},
    "left": {},
    "errors": {}
  }},
  "snapshots": {{
    "sent": {},
    "full_sent": {},
    "bytes_sent": {},
    "acks_received": {}
  }},
  "client": {{
    "received": {},
    "stale_dropped": {},
    "duplicates_dropped": {},
    "placeholders_replaced": {},
    "extrapolated_ticks": {},
    "consecutive_extrapolations": {}
  }}
}}"#,
            self.tick_count.load(Ordering::Relaxed),
            self.sessions_in_game.load(Ordering::Relaxed),
            self.uptime_seconds(),
            self.cull_time_us.load(Ordering::Relaxed),
            self.cull_time_p95_us.load(Ordering::Relaxed),
            self.cull_time_p99_us.load(Ordering::Relaxed),
            self.cull_time_max_us.load(Ordering::Relaxed),
            self.visible_entities.load(Ordering::Relaxed),
            self.entities_entered.load(Ordering::Relaxed),
            self.entities_updated.load(Ordering::Relaxed),
            self.entities_left.load(Ordering::Relaxed),
            self.cull_errors.load(Ordering::Relaxed),
            self.snapshots_sent.load(Ordering::Relaxed),
            self.full_snapshots_sent.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
            self.acks_received.load(Ordering::Relaxed),
            self.snapshots_received.load(Ordering::Relaxed),
            self.stale_dropped.load(Ordering::Relaxed),
            self.duplicates_dropped.load(Ordering::Relaxed),
            self.placeholders_replaced.load(Ordering::Relaxed),
            self.extrapolated_ticks.load(Ordering::Relaxed),
            self.consecutive_extrapolations.load(Ordering::Relaxed),
        )
    }
}

impl Default for ReplicationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn http_response(content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<ReplicationMetrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);

                    let response = if request.starts_with("GET /metrics/json") || request.starts_with("GET /json") {
                        http_response("application/json", &metrics.to_json())
                    } else if request.starts_with("GET /metrics") {
                        http_response("text/plain; version=0.0.4", &metrics.to_prometheus())
                    } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
                        http_response("text/plain", "OK")
                    } else {
                        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
                    };

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}
