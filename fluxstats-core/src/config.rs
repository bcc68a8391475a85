//! Default configuration values and the runtime configuration surface

use crate::uid::Uid;
use crate::{Interval, Result, StatsError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Identifier width in bytes
pub const UID_WIDTH: usize = 4;

/// Accumulator size that triggers a flush
pub const MIN_FLUSH_BATCH_SIZE: usize = 10_000;

/// Longest time between flushes (5s)
pub const MAX_FLUSH_INTERVAL_MS: u64 = 5_000;

/// Source event ids kept per aggregate
pub const MAX_EVENT_IDS: usize = 100;

/// Attempts per key before the source event is routed as bad
pub const FLUSH_RETRY_ATTEMPTS: u32 = 5;

/// First retry delay (50ms)
pub const INITIAL_BACKOFF_MS: u64 = 50;

/// Retry delay ceiling (5s)
pub const MAX_BACKOFF_MS: u64 = 5_000;

/// Entries per dictionary cache direction
pub const DICTIONARY_CACHE_CAPACITY: usize = 100_000;

/// Transport partitions per processor
pub const PARTITIONS: usize = 4;

/// Batches queued per partition before senders wait
pub const PARTITION_QUEUE_CAPACITY: usize = 1_024;

/// Shortest time between retention purges of one interval (1min)
pub const RETENTION_PURGE_INTERVAL_MS: u64 = 60_000;

/// Retry policy with capped exponential backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: FLUSH_RETRY_ATTEMPTS,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1 based), with up to 25% jitter
    /// taken off so the ceiling is never exceeded
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let capped = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        let jitter = if capped >= 4 {
            rand::thread_rng().gen_range(0..=capped / 4)
        } else {
            0
        };
        Duration::from_millis(capped - jitter)
    }
}

/// Aggregation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Identifier width in bytes, fixed for the life of the data
    pub uid_width: usize,
    /// Accumulator size that triggers a flush
    pub min_flush_batch_size: usize,
    /// Longest time between flushes
    pub max_flush_interval_ms: u64,
    /// Source event ids kept per aggregate
    pub max_event_ids: usize,
    /// Per-key retry policy for flushes
    pub flush_retry: RetryConfig,
    /// Entries per dictionary cache direction
    pub dictionary_cache_capacity: usize,
    /// Transport partitions per processor
    pub partitions: usize,
    /// Purge horizon in milliseconds per interval; intervals absent are kept forever
    pub retention: BTreeMap<Interval, u64>,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            uid_width: UID_WIDTH,
            min_flush_batch_size: MIN_FLUSH_BATCH_SIZE,
            max_flush_interval_ms: MAX_FLUSH_INTERVAL_MS,
            max_event_ids: MAX_EVENT_IDS,
            flush_retry: RetryConfig::default(),
            dictionary_cache_capacity: DICTIONARY_CACHE_CAPACITY,
            partitions: PARTITIONS,
            retention: BTreeMap::new(),
        }
    }
}

impl StatsConfig {
    pub fn max_flush_interval(&self) -> Duration {
        Duration::from_millis(self.max_flush_interval_ms)
    }

    /// Retention horizon for an interval
    pub fn retention_for(&self, interval: Interval) -> Option<Duration> {
        self.retention
            .get(&interval)
            .map(|ms| Duration::from_millis(*ms))
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.uid_width == 0 || self.uid_width > Uid::MAX_WIDTH {
            return Err(StatsError::Config(format!(
                "uid_width must be 1..={}, got {}",
                Uid::MAX_WIDTH,
                self.uid_width
            )));
        }
        let sizes = [
            ("min_flush_batch_size", self.min_flush_batch_size),
            ("max_flush_interval_ms", self.max_flush_interval_ms as usize),
            ("dictionary_cache_capacity", self.dictionary_cache_capacity),
            ("partitions", self.partitions),
            ("flush_retry.max_attempts", self.flush_retry.max_attempts as usize),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(StatsError::Config(format!("{} must be greater than zero", name)));
        }
        if self.flush_retry.initial_backoff_ms > self.flush_retry.max_backoff_ms {
            return Err(StatsError::Config(
                "flush_retry.initial_backoff_ms exceeds max_backoff_ms".into(),
            ));
        }
        for (interval, horizon) in &self.retention {
            if (*horizon as i64) < interval.row_key_interval() {
                return Err(StatsError::Config(format!(
                    "Retention of {}ms for {} is shorter than its row bucket",
                    horizon, interval
                )));
            }
        }
        Ok(())
    }
}
