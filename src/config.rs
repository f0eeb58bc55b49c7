use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts per booking before giving up with `RetryExhausted`.
    pub max_booking_attempts: u32,
    /// Backoff before the second attempt; doubles each retry.
    pub retry_backoff_base_ms: u64,
    /// Upper bound on one booking attempt, lock waits included.
    pub attempt_timeout_ms: u64,
    /// Upper bound on waiting for a table or tenant lock.
    pub lock_timeout_ms: u64,
    /// Used when neither the request nor the tenant names a duration.
    pub default_duration_minutes: u32,
    pub slot_step_minutes: u32,
    /// Directory for the write-ahead log. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Compact the log once this many appends have accumulated.
    pub compact_threshold: u64,
    /// Port for the Prometheus exporter. The engine never installs it itself;
    /// the embedding binary passes this to `observability::init` once per process.
    pub metrics_port: Option<u16>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_booking_attempts: 3,
            retry_backoff_base_ms: 25,
            attempt_timeout_ms: 2_000,
            lock_timeout_ms: 500,
            default_duration_minutes: 120,
            slot_step_minutes: 30,
            data_dir: None,
            compact_threshold: 1_000,
            metrics_port: None,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Read `SEATLOCK_*` variables. Unset or unparsable values keep their default.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_booking_attempts: env_or("SEATLOCK_MAX_BOOKING_ATTEMPTS", d.max_booking_attempts).max(1),
            retry_backoff_base_ms: env_or("SEATLOCK_RETRY_BACKOFF_BASE_MS", d.retry_backoff_base_ms),
            attempt_timeout_ms: env_or("SEATLOCK_ATTEMPT_TIMEOUT_MS", d.attempt_timeout_ms),
            lock_timeout_ms: env_or("SEATLOCK_LOCK_TIMEOUT_MS", d.lock_timeout_ms),
            default_duration_minutes: env_or("SEATLOCK_DEFAULT_DURATION_MINUTES", d.default_duration_minutes),
            slot_step_minutes: env_or("SEATLOCK_SLOT_STEP_MINUTES", d.slot_step_minutes).max(1),
            data_dir: std::env::var("SEATLOCK_DATA_DIR").ok().map(PathBuf::from),
            compact_threshold: env_or("SEATLOCK_COMPACT_THRESHOLD", d.compact_threshold),
            metrics_port: std::env::var("SEATLOCK_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Sleep before attempt `attempt + 1` (attempts count from 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_base_ms.saturating_mul(factor))
    }

    pub fn wal_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("seatlock.wal"))
    }
}
