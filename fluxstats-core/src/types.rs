//! Core types for FluxStats

use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// The kind of statistic, which decides the aggregate it accumulates into
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatisticType {
    /// Events carry a count, e.g. number of logins
    Count,
    /// Events carry a measured value, e.g. cpu percentage
    Value,
}

// Static field names, shared by every statistic of a type
pub const FIELD_NAME_STATISTIC: &str = "Statistic Name";
pub const FIELD_NAME_UUID: &str = "Statistic UUID";
pub const FIELD_NAME_DATE_TIME: &str = "Date Time";
pub const FIELD_NAME_VALUE: &str = "Statistic Value";
pub const FIELD_NAME_COUNT: &str = "Statistic Count";
pub const FIELD_NAME_MIN_VALUE: &str = "Min Statistic Value";
pub const FIELD_NAME_MAX_VALUE: &str = "Max Statistic Value";
pub const FIELD_NAME_PRECISION: &str = "Precision";
pub const FIELD_NAME_PRECISION_MS: &str = "Precision ms";

impl StatisticType {
    /// Static fields available for this type, in display order
    pub fn static_fields(&self) -> &'static [&'static str] {
        match self {
            StatisticType::Count => &[
                FIELD_NAME_STATISTIC,
                FIELD_NAME_UUID,
                FIELD_NAME_DATE_TIME,
                FIELD_NAME_COUNT,
                FIELD_NAME_PRECISION,
                FIELD_NAME_PRECISION_MS,
            ],
            StatisticType::Value => &[
                FIELD_NAME_STATISTIC,
                FIELD_NAME_UUID,
                FIELD_NAME_DATE_TIME,
                FIELD_NAME_VALUE,
                FIELD_NAME_COUNT,
                FIELD_NAME_MIN_VALUE,
                FIELD_NAME_MAX_VALUE,
                FIELD_NAME_PRECISION,
                FIELD_NAME_PRECISION_MS,
            ],
        }
    }

    /// Lower-case name used in processor ids and topic names
    pub fn as_str(&self) -> &'static str {
        match self {
            StatisticType::Count => "count",
            StatisticType::Value => "value",
        }
    }
}

impl fmt::Display for StatisticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tag name/value pair as supplied on a raw event
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    /// Create a new tag
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One part of a compound source-event identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdPart {
    Long(i64),
    Str(String),
}

/// Identifier of a source event, kept on aggregates for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Vec<IdPart>);

impl EventId {
    /// Identifier built from numeric parts
    pub fn from_longs(parts: &[i64]) -> Self {
        Self(parts.iter().copied().map(IdPart::Long).collect())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            match part {
                IdPart::Long(v) => write!(f, "{}", v)?,
                IdPart::Str(s) => f.write_str(s)?,
            }
        }
        Ok(())
    }
}

/// Reported measurement of a raw event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventValue {
    Count(u64),
    Value(f64),
}

impl EventValue {
    /// The statistic type this measurement belongs to
    pub fn statistic_type(&self) -> StatisticType {
        match self {
            EventValue::Count(_) => StatisticType::Count,
            EventValue::Value(_) => StatisticType::Value,
        }
    }
}

/// A raw statistic event as delivered by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticEvent {
    /// Statistic name
    pub name: String,
    /// Event time in milliseconds
    pub timestamp: Timestamp,
    /// Tags in any order
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Count or value
    pub value: EventValue,
    /// Source event identifiers
    #[serde(default)]
    pub event_ids: Vec<EventId>,
}

impl StatisticEvent {
    /// Create a count event
    pub fn count(name: impl Into<String>, timestamp: Timestamp, count: u64) -> Self {
        Self {
            name: name.into(),
            timestamp,
            tags: Vec::new(),
            value: EventValue::Count(count),
            event_ids: Vec::new(),
        }
    }

    /// Create a value event
    pub fn value(name: impl Into<String>, timestamp: Timestamp, value: f64) -> Self {
        Self {
            name: name.into(),
            timestamp,
            tags: Vec::new(),
            value: EventValue::Value(value),
            event_ids: Vec::new(),
        }
    }

    /// Add a tag to the event
    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(Tag::new(name, value));
        self
    }

    /// Add a source event identifier
    pub fn with_event_id(mut self, id: EventId) -> Self {
        self.event_ids.push(id);
        self
    }
}
