//! Durable aggregate store boundary
//!
//! The engine hands flushed (key, aggregate) pairs to an [`AggregateStore`]
//! which must apply them as order-independent merges, so several writers
//! can target the same cell.

use crate::aggregate::StatAggregate;
use crate::key::StatKey;
use crate::rollup::RollUpBitMask;
use crate::uid::Uid;
use crate::{Interval, Result, StatsError, Timestamp};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Store accepting merge requests for aggregate cells
#[async_trait]
pub trait AggregateStore: Send + Sync + 'static {
    /// Merge one aggregate into its cell
    async fn merge(&self, key: &StatKey, aggregate: &StatAggregate) -> Result<()>;

    /// Merge a batch; one result per entry, in order
    async fn merge_batch(&self, batch: &[(StatKey, StatAggregate)]) -> Vec<Result<()>> {
        let mut results = Vec::with_capacity(batch.len());
        for (key, aggregate) in batch {
            results.push(self.merge(key, aggregate).await);
        }
        results
    }

    /// Remove rows of `interval` whose row time is before `cutoff`;
    /// returns the number of cells removed
    async fn purge(&self, interval: Interval, cutoff: Timestamp) -> Result<usize>;
}

/// Sorted in-memory store keyed by serialized [`StatKey`]
pub struct MemoryAggregateStore {
    width: usize,
    max_event_ids: usize,
    cells: SkipMap<Bytes, Mutex<Option<StatAggregate>>>,
    merges: AtomicU64,
}

impl MemoryAggregateStore {
    pub fn new(width: usize, max_event_ids: usize) -> Self {
        Self {
            width,
            max_event_ids,
            cells: SkipMap::new(),
            merges: AtomicU64::new(0),
        }
    }

    /// Current aggregate of a cell
    pub fn get(&self, key: &StatKey) -> Option<StatAggregate> {
        self.cells
            .get(&key.to_bytes())
            .and_then(|entry| entry.value().lock().clone())
    }

    /// Number of cells
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Merge requests applied so far
    pub fn merge_count(&self) -> u64 {
        self.merges.load(Ordering::Relaxed)
    }

    /// All cells of one statistic and rollup variant, in key order
    pub fn scan(&self, statistic: Uid, mask: RollUpBitMask) -> Result<Vec<(StatKey, StatAggregate)>> {
        let mut prefix = BytesMut::with_capacity(self.width + RollUpBitMask::BYTE_LEN);
        statistic.put(&mut prefix);
        prefix.put_slice(&mask.to_bytes());
        let prefix = prefix.freeze();

        let mut cells = Vec::new();
        for entry in self.cells.range(prefix.clone()..) {
            if !entry.key().starts_with(&prefix) {
                break;
            }
            if let Some(aggregate) = entry.value().lock().clone() {
                cells.push((StatKey::from_bytes(entry.key(), self.width)?, aggregate));
            }
        }
        Ok(cells)
    }
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn merge(&self, key: &StatKey, aggregate: &StatAggregate) -> Result<()> {
        if key.statistic().width() != self.width {
            return Err(StatsError::InvalidFormat(format!(
                "Key uid width {} does not match store width {}",
                key.statistic().width(),
                self.width
            )));
        }

        let entry = self
            .cells
            .get_or_insert_with(key.to_bytes(), || Mutex::new(None));
        let mut cell = entry.value().lock();
        match cell.as_mut() {
            Some(existing) => existing.merge_from(aggregate.clone(), self.max_event_ids)?,
            None => *cell = Some(aggregate.clone()),
        }
        self.merges.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn purge(&self, interval: Interval, cutoff: Timestamp) -> Result<usize> {
        let mut removed = 0;
        for entry in self.cells.iter() {
            let key = match StatKey::from_bytes(entry.key(), self.width) {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable key during purge");
                    continue;
                }
            };
            if key.interval() == interval && key.row_time() < cutoff && entry.remove() {
                removed += 1;
            }
        }
        debug!(interval = %interval, cutoff, removed, "Purged expired cells");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::TagValue;
    use crate::StatisticEvent;

    fn uid(value: u64) -> Uid {
        Uid::new(value, 4).unwrap()
    }

    fn key(interval: Interval, timestamp: Timestamp, value: u64) -> StatKey {
        StatKey::new(
            uid(1),
            RollUpBitMask::ZERO,
            interval,
            timestamp,
            vec![TagValue::new(uid(2), uid(value))],
        )
    }

    fn count(n: u64) -> StatAggregate {
        StatAggregate::from_event(&StatisticEvent::count("orders", 0, n), 10)
    }

    #[tokio::test]
    async fn test_merge_accumulates() {
        let store = MemoryAggregateStore::new(4, 10);
        let k = key(Interval::Second, 1_000, 3);

        store.merge(&k, &count(100)).await.unwrap();
        store.merge(&k, &count(200)).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&k).unwrap().count(), 300);
        assert_eq!(store.merge_count(), 2);
    }

    #[tokio::test]
    async fn test_merge_batch_isolates_failures() {
        let store = MemoryAggregateStore::new(4, 10);
        let good = key(Interval::Second, 1_000, 3);
        let narrow = StatKey::new(
            Uid::new(1, 2).unwrap(),
            RollUpBitMask::ZERO,
            Interval::Second,
            1_000,
            vec![],
        );
        let value = StatAggregate::from_event(&StatisticEvent::value("cpu", 0, 1.0), 10);

        store.merge(&good, &count(1)).await.unwrap();
        let results = store
            .merge_batch(&[
                (good.clone(), value),
                (narrow, count(1)),
                (good.clone(), count(4)),
            ])
            .await;

        assert!(matches!(results[0], Err(StatsError::AggregateMismatch { .. })));
        assert!(matches!(results[1], Err(StatsError::InvalidFormat(_))));
        assert!(results[2].is_ok());
        assert_eq!(store.get(&good).unwrap().count(), 5);
    }

    #[tokio::test]
    async fn test_scan_by_prefix() {
        let store = MemoryAggregateStore::new(4, 10);
        for ts in [3_000, 1_000, 2_000] {
            store
                .merge(&key(Interval::Second, ts, 5), &count(1))
                .await
                .unwrap();
        }
        let other = StatKey::new(uid(9), RollUpBitMask::ZERO, Interval::Second, 0, vec![]);
        store.merge(&other, &count(1)).await.unwrap();

        let cells = store.scan(uid(1), RollUpBitMask::ZERO).unwrap();
        assert_eq!(cells.len(), 3);
        let times: Vec<Timestamp> = cells.iter().map(|(k, _)| k.column_time()).collect();
        assert_eq!(times, vec![1_000, 2_000, 3_000]);
    }

    #[tokio::test]
    async fn test_purge_by_interval() {
        let store = MemoryAggregateStore::new(4, 10);
        let hour = 3_600_000;
        store.merge(&key(Interval::Second, 0, 1), &count(1)).await.unwrap();
        store.merge(&key(Interval::Second, 5 * hour, 1), &count(1)).await.unwrap();
        store.merge(&key(Interval::Minute, 0, 1), &count(1)).await.unwrap();

        let removed = store.purge(Interval::Second, 2 * hour).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 2);
        assert!(store.get(&key(Interval::Minute, 0, 1)).is_some());
        assert!(store.get(&key(Interval::Second, 0, 1)).is_none());
    }
}
