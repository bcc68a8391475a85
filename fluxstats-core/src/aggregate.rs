//! Aggregate merge algebra
//!
//! Aggregates are built from single events and merged many-to-one when keys
//! collide. Numeric fields merge associatively and commutatively. Event ids
//! are diagnostic only and capped: the receiver's ids are kept first and
//! ids beyond the cap are dropped while the numbers keep accumulating.

use crate::{EventId, EventValue, Result, StatisticEvent, StatisticType, StatsError};
use serde::{Deserialize, Serialize};

/// Running count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountAggregate {
    pub count: u64,
    pub event_ids: Vec<EventId>,
}

/// Running sum, count, min and max of values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueAggregate {
    pub sum: f64,
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub event_ids: Vec<EventId>,
}

impl ValueAggregate {
    /// Mean of the merged values; derived, never stored
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Aggregate for one cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StatAggregate {
    Count(CountAggregate),
    Value(ValueAggregate),
}

impl StatAggregate {
    /// Aggregate of a single event, keeping at most `max_event_ids` of its ids
    pub fn from_event(event: &StatisticEvent, max_event_ids: usize) -> Self {
        let event_ids: Vec<EventId> = event
            .event_ids
            .iter()
            .take(max_event_ids)
            .cloned()
            .collect();
        match event.value {
            EventValue::Count(count) => StatAggregate::Count(CountAggregate { count, event_ids }),
            EventValue::Value(value) => StatAggregate::Value(ValueAggregate {
                sum: value,
                count: 1,
                min: value,
                max: value,
                event_ids,
            }),
        }
    }

    pub fn statistic_type(&self) -> StatisticType {
        match self {
            StatAggregate::Count(_) => StatisticType::Count,
            StatAggregate::Value(_) => StatisticType::Value,
        }
    }

    /// Number of events merged, or the reported count for counts
    pub fn count(&self) -> u64 {
        match self {
            StatAggregate::Count(a) => a.count,
            StatAggregate::Value(a) => a.count,
        }
    }

    pub fn event_ids(&self) -> &[EventId] {
        match self {
            StatAggregate::Count(a) => &a.event_ids,
            StatAggregate::Value(a) => &a.event_ids,
        }
    }

    /// Merge `other` into `self`
    pub fn merge_from(&mut self, other: StatAggregate, max_event_ids: usize) -> Result<()> {
        match (self, other) {
            (StatAggregate::Count(a), StatAggregate::Count(b)) => {
                a.count = a.count.saturating_add(b.count);
                append_capped(&mut a.event_ids, b.event_ids, max_event_ids);
            }
            (StatAggregate::Value(a), StatAggregate::Value(b)) => {
                a.sum += b.sum;
                a.count = a.count.saturating_add(b.count);
                a.min = a.min.min(b.min);
                a.max = a.max.max(b.max);
                append_capped(&mut a.event_ids, b.event_ids, max_event_ids);
            }
            (a, b) => {
                return Err(StatsError::AggregateMismatch {
                    left: a.statistic_type().as_str(),
                    right: b.statistic_type().as_str(),
                })
            }
        }
        Ok(())
    }
}

/// Merge two aggregates of the same type
pub fn merge(
    mut a: StatAggregate,
    b: StatAggregate,
    max_event_ids: usize,
) -> Result<StatAggregate> {
    a.merge_from(b, max_event_ids)?;
    Ok(a)
}

fn append_capped(ids: &mut Vec<EventId>, more: Vec<EventId>, cap: usize) {
    let room = cap.saturating_sub(ids.len());
    ids.extend(more.into_iter().take(room));
}
