//! Configuration schema: tunables with serde-backed defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Every tunable limit in one place. Values are defaults, not guarantees;
/// hosts override through [`Config`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    // Connection lifecycle.
    pub connect_max_attempts: u32,
    pub connect_backoff_base_ms: u64,
    pub connect_backoff_cap_ms: u64,

    // Quota monitor and degradation.
    pub quota_warn_ratio: f64,
    pub quota_critical_ratio: f64,
    pub large_write_threshold_bytes: u64,
    pub quota_check_interval_ms: u64,
    pub degraded_write_failures: u32,

    // WAL and checkpointing.
    pub wal_checkpoint_max_bytes: u64,
    pub wal_checkpoint_max_age_ms: u64,
    pub max_wal_record_bytes: usize,

    // Retry policy.
    pub retry_base_delay_ms: u64,
    pub retry_delay_cap_ms: u64,
    pub retry_jitter_cap_ms: u64,
    pub max_retries_cap: u32,
    pub retry_base_delay_override_cap_ms: u64,

    // Circuit breaker.
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_ms: u64,

    // Coordinator.
    pub claim_ack_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub stale_connection_threshold_ms: u64,
    pub handoff_quiesce_ms: u64,
    pub watermark_broadcast_interval_ms: u64,
    pub lock_default_ttl_ms: u64,
    pub lock_acquire_timeout_ms: u64,

    // Event log.
    pub event_retention_events: u64,
    pub max_bus_subscribers: usize,

    // Worker pool.
    pub stale_worker_timeout_ms: u64,
    pub worker_init_stale_ms: u64,
    pub pool_backpressure_threshold: usize,

    // Timeouts.
    pub progressive_timeouts_ms: Vec<u64>,

    // Duplicate suppression.
    pub message_hash_cache_capacity: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            connect_max_attempts: 5,
            connect_backoff_base_ms: 500,
            connect_backoff_cap_ms: 5_000,

            quota_warn_ratio: 0.80,
            quota_critical_ratio: 0.95,
            large_write_threshold_bytes: 1024 * 1024,
            quota_check_interval_ms: 30_000,
            degraded_write_failures: 3,

            wal_checkpoint_max_bytes: 8 * 1024 * 1024,
            wal_checkpoint_max_age_ms: 5 * 60 * 1000,
            max_wal_record_bytes: 4 * 1024 * 1024,

            retry_base_delay_ms: 1_000,
            retry_delay_cap_ms: 30_000,
            retry_jitter_cap_ms: 100,
            max_retries_cap: 10,
            retry_base_delay_override_cap_ms: 60_000,

            breaker_failure_threshold: 5,
            breaker_cooldown_ms: 30_000,

            claim_ack_timeout_ms: 3_000,
            heartbeat_interval_ms: 5_000,
            stale_connection_threshold_ms: 30_000,
            handoff_quiesce_ms: 1_000,
            watermark_broadcast_interval_ms: 5_000,
            lock_default_ttl_ms: 10_000,
            lock_acquire_timeout_ms: 5_000,

            event_retention_events: 10_000,
            max_bus_subscribers: 64,

            stale_worker_timeout_ms: 15_000,
            worker_init_stale_ms: 5_000,
            pool_backpressure_threshold: 32,

            progressive_timeouts_ms: vec![5_000, 15_000, 30_000],

            message_hash_cache_capacity: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub verbosity: u8,
    pub format: LogFormat,
    pub file: FileLoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub directory: Option<PathBuf>,
}

/// Top-level configuration, constructed once at startup and threaded
/// through [`crate::context::CoreContext`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database directory name; hosts point this at their data dir.
    pub database: PathBuf,
    /// Storage quota the monitor measures usage against.
    pub quota_bytes: u64,
    pub limits: Limits,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: PathBuf::from("echovault"),
            quota_bytes: 512 * 1024 * 1024,
            limits: Limits::default(),
            logging: LoggingConfig::default(),
        }
    }
}
