//! Storage precisions
//!
//! Event times are rounded at two levels: the row bucket, which becomes part
//! of the row key, and the finer column bucket, which becomes the column
//! qualifier inside that row. Each column duration divides evenly into the
//! next coarser column duration so a coarser precision can be derived from a
//! finer one without the original event times.

use crate::{Result, StatsError, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

const SECOND_MS: i64 = 1_000;
const MINUTE_MS: i64 = 60 * SECOND_MS;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;
const WEEK_MS: i64 = 7 * DAY_MS;

/// Precision at which a statistic is stored
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Interval {
    /// Hourly rows with 1s columns
    Second,
    /// Daily rows with 1min columns
    Minute,
    /// Four-weekly rows with 1h columns
    Hour,
    /// 52-weekly rows with 1d columns
    Day,
}

impl Interval {
    /// Byte width of the serialized form
    pub const BYTE_LEN: usize = 8;

    /// All intervals, finest first
    pub fn all() -> &'static [Interval] {
        &[
            Interval::Second,
            Interval::Minute,
            Interval::Hour,
            Interval::Day,
        ]
    }

    /// Row bucket duration in milliseconds
    pub fn row_key_interval(&self) -> i64 {
        match self {
            Interval::Second => HOUR_MS,
            Interval::Minute => DAY_MS,
            Interval::Hour => 4 * WEEK_MS,
            Interval::Day => 52 * WEEK_MS,
        }
    }

    /// Column bucket duration in milliseconds
    pub fn column_interval(&self) -> i64 {
        match self {
            Interval::Second => SECOND_MS,
            Interval::Minute => MINUTE_MS,
            Interval::Hour => HOUR_MS,
            Interval::Day => DAY_MS,
        }
    }

    /// Human readable name, e.g. "Second"
    pub fn long_name(&self) -> &'static str {
        match self {
            Interval::Second => "Second",
            Interval::Minute => "Minute",
            Interval::Hour => "Hour",
            Interval::Day => "Day",
        }
    }

    /// Short code, e.g. "s"
    pub fn short_name(&self) -> &'static str {
        match self {
            Interval::Second => "s",
            Interval::Minute => "m",
            Interval::Hour => "h",
            Interval::Day => "d",
        }
    }

    /// Parse from the short code
    pub fn from_short_name(name: &str) -> Result<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|i| i.short_name() == name)
            .ok_or_else(|| StatsError::InvalidFormat(format!("Unknown interval name: {}", name)))
    }

    /// Look up by column duration
    pub fn from_column_interval(millis: i64) -> Result<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|i| i.column_interval() == millis)
            .ok_or_else(|| {
                StatsError::InvalidFormat(format!("{} is not a valid column interval", millis))
            })
    }

    /// Next coarser interval, if any
    pub fn next_coarser(&self) -> Option<Interval> {
        match self {
            Interval::Second => Some(Interval::Minute),
            Interval::Minute => Some(Interval::Hour),
            Interval::Hour => Some(Interval::Day),
            Interval::Day => None,
        }
    }

    /// Serialize as the big-endian column duration
    pub fn to_bytes(&self) -> [u8; Self::BYTE_LEN] {
        self.column_interval().to_be_bytes()
    }

    /// Deserialize from the big-endian column duration
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; Self::BYTE_LEN] = bytes
            .get(..Self::BYTE_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| StatsError::InvalidFormat("Interval needs 8 bytes".into()))?;
        Self::from_column_interval(i64::from_be_bytes(raw))
    }

    /// True when `timestamp` truncates to a bucket start at every interval
    ///
    /// Timestamps in the partial bucket nearest `i64::MIN` have no
    /// representable bucket start.
    pub fn supports_timestamp(timestamp: Timestamp) -> bool {
        Interval::all().iter().all(|interval| {
            let row = interval.row_key_interval();
            timestamp.div_euclid(row).checked_mul(row).is_some()
        })
    }

    /// Truncate a timestamp to the start of its row bucket
    pub fn truncate_to_row(&self, timestamp: Timestamp) -> Timestamp {
        truncate(timestamp, self.row_key_interval())
    }

    /// Truncate a timestamp to the start of its column bucket
    pub fn truncate_to_column(&self, timestamp: Timestamp) -> Timestamp {
        truncate(timestamp, self.column_interval())
    }
}

/// Floor to a multiple of `interval`, saturating at `i64::MIN` so the
/// result never exceeds `timestamp`
fn truncate(timestamp: Timestamp, interval: i64) -> Timestamp {
    timestamp
        .div_euclid(interval)
        .checked_mul(interval)
        .unwrap_or(Timestamp::MIN)
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.long_name())
    }
}
