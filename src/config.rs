use std::str::FromStr;
use std::time::Duration;

use crate::net::pvs::{CullingConfig, DEFAULT_VIEW_SIZE, DEFAULT_VISIBLE_SET_POOL_CAPACITY, MAX_VIEW_SIZE};

/// Replication configuration shared by the server tick driver and clients
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Cull per session; when false every session receives the whole world
    pub culling_enabled: bool,
    /// Side length of each viewer's square view region (world units)
    pub view_size: f32,
    /// Server ticks per second
    pub tick_rate: u32,
    /// Free visible sets kept for reuse
    pub visible_set_pool_capacity: usize,
    /// Consecutive extrapolated client ticks before warning
    pub extrapolation_warn_ticks: u32,
    /// Maximum snapshots a client buffers ahead of its clock
    pub snapshot_buffer_limit: usize,
    /// Maximum concurrent sessions
    pub max_sessions: usize,
    /// Idle time before a session is dropped
    pub session_timeout: Duration,
    /// Port for the metrics endpoint, disabled when `None`
    pub metrics_port: Option<u16>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            culling_enabled: true,
            view_size: DEFAULT_VIEW_SIZE,
            tick_rate: 30,
            visible_set_pool_capacity: DEFAULT_VISIBLE_SET_POOL_CAPACITY,
            extrapolation_warn_ticks: 10,
            snapshot_buffer_limit: 64,
            max_sessions: 1024,
            session_timeout: Duration::from_secs(300),
            metrics_port: None,
        }
    }
}

/// Parse `name` from the environment, keeping `current` when unset or invalid
fn env_or<T: FromStr>(name: &str, current: T, valid: impl Fn(&T) -> bool, expected: &str) -> T {
    let Ok(raw) = std::env::var(name) else {
        return current;
    };
    match raw.parse::<T>() {
        Ok(parsed) if valid(&parsed) => parsed,
        Ok(_) => {
            tracing::warn!("{} must be {}, using default", name, expected);
            current
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            current
        }
    }
}

impl ReplicationConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let defaults = Self::default();

        let culling_enabled = env_or("CULLING_ENABLED", defaults.culling_enabled, |_| true, "true or false");
        let view_size = env_or(
            "VIEW_SIZE",
            defaults.view_size,
            |v: &f32| v.is_finite() && *v > 0.0 && *v <= MAX_VIEW_SIZE,
            "a positive number up to 4096",
        );
        let tick_rate = env_or("TICK_RATE", defaults.tick_rate, |r: &u32| (1..=240).contains(r), "1-240");
        let visible_set_pool_capacity = env_or(
            "VISIBLE_SET_POOL_CAPACITY",
            defaults.visible_set_pool_capacity,
            |c: &usize| *c <= 65536,
            "0-65536",
        );
        let extrapolation_warn_ticks = env_or(
            "EXTRAPOLATION_WARN_TICKS",
            defaults.extrapolation_warn_ticks,
            |t: &u32| *t > 0,
            "> 0",
        );
        let snapshot_buffer_limit = env_or(
            "SNAPSHOT_BUFFER_LIMIT",
            defaults.snapshot_buffer_limit,
            |l: &usize| *l >= 2,
            ">= 2",
        );
        let max_sessions = env_or(
            "MAX_SESSIONS",
            defaults.max_sessions,
            |m: &usize| (1..=100_000).contains(m),
            "1-100000",
        );
        let session_timeout = Duration::from_secs(env_or(
            "SESSION_TIMEOUT_SECS",
            defaults.session_timeout.as_secs(),
            |s: &u64| *s > 0,
            "> 0",
        ));
        let metrics_port = std::env::var("METRICS_PORT")
            .ok()
            .and_then(|raw| match raw.parse::<u16>() {
                Ok(port) if port > 0 => Some(port),
                _ => {
                    tracing::warn!("Invalid METRICS_PORT '{}', metrics endpoint disabled", raw);
                    None
                }
            });

        Self {
            culling_enabled,
            view_size,
            tick_rate,
            visible_set_pool_capacity,
            extrapolation_warn_ticks,
            snapshot_buffer_limit,
            max_sessions,
            session_timeout,
            metrics_port,
        }
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if !(self.view_size.is_finite() && self.view_size > 0.0 && self.view_size <= MAX_VIEW_SIZE) {
            return Err(format!("view_size must be a positive number up to {}", MAX_VIEW_SIZE));
        }
        if self.tick_rate == 0 {
            return Err("tick_rate must be at least 1".to_string());
        }
        if self.snapshot_buffer_limit < 2 {
            return Err("snapshot_buffer_limit must hold at least current and next".to_string());
        }
        if self.extrapolation_warn_ticks == 0 {
            return Err("extrapolation_warn_ticks must be at least 1".to_string());
        }
        if self.max_sessions == 0 {
            return Err("max_sessions must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn culling(&self) -> CullingConfig {
        CullingConfig {
            enabled: self.culling_enabled,
            view_size: self.view_size,
            pool_capacity: self.visible_set_pool_capacity,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }
}
