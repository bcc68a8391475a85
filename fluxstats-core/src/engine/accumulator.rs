//! Size-or-time debounced accumulator

use crate::Result;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Merges a new value into the value already held for its key
pub type MergeFn<A> = Arc<dyn Fn(&mut A, A) -> Result<()> + Send + Sync>;

/// Coalesces values by key until a flush is due
///
/// A flush is due when `min_batch_size` distinct keys are held or when
/// `max_interval` has passed since the last drain, whichever comes first.
/// Owned by a single worker, so it needs no internal locking.
pub struct Accumulator<K, A> {
    entries: HashMap<K, A>,
    merge: MergeFn<A>,
    min_batch_size: usize,
    max_interval: Duration,
    last_flush: Instant,
}

impl<K: Hash + Eq, A> Accumulator<K, A> {
    pub fn new(min_batch_size: usize, max_interval: Duration, merge: MergeFn<A>) -> Self {
        Self {
            entries: HashMap::new(),
            merge,
            min_batch_size: min_batch_size.max(1),
            max_interval,
            last_flush: Instant::now(),
        }
    }

    /// Insert a value or merge it into the held one; a failed merge leaves
    /// the held value untouched
    pub fn add(&mut self, key: K, value: A) -> Result<()> {
        match self.entries.entry(key) {
            Entry::Occupied(mut held) => (self.merge)(held.get_mut(), value),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    /// Add every value or none of them
    ///
    /// On a failed merge the entries touched so far are restored.
    pub fn add_all(&mut self, values: Vec<(K, A)>) -> Result<()>
    where
        K: Clone,
        A: Clone,
    {
        let mut undo: Vec<(K, Option<A>)> = Vec::with_capacity(values.len());
        for (key, value) in values {
            let previous = self.entries.get(&key).cloned();
            if let Err(e) = self.add(key.clone(), value) {
                self.restore(undo);
                return Err(e);
            }
            undo.push((key, previous));
        }
        Ok(())
    }

    fn restore(&mut self, undo: Vec<(K, Option<A>)>) {
        for (key, previous) in undo.into_iter().rev() {
            match previous {
                Some(value) => {
                    self.entries.insert(key, value);
                }
                None => {
                    self.entries.remove(&key);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size threshold reached
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.min_batch_size
    }

    /// When the time threshold is reached
    pub fn deadline(&self) -> Instant {
        self.last_flush + self.max_interval
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.is_full() || now >= self.deadline()
    }

    /// Take every held entry and restart the time window
    pub fn drain(&mut self) -> Vec<(K, A)> {
        self.last_flush = Instant::now();
        self.entries.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatsError;

    fn summing() -> Accumulator<&'static str, u64> {
        Accumulator::new(
            3,
            Duration::from_millis(500),
            Arc::new(|held: &mut u64, v: u64| {
                if v == 0 {
                    return Err(StatsError::InvalidEvent("zero".into()));
                }
                *held += v;
                Ok(())
            }),
        )
    }

    #[test]
    fn test_coalesces_by_key() {
        let mut acc = summing();
        acc.add("a", 1).unwrap();
        acc.add("a", 2).unwrap();
        acc.add("b", 5).unwrap();
        assert_eq!(acc.len(), 2);
        assert!(!acc.is_full());

        assert!(acc.add("a", 0).is_err());
        let mut drained = acc.drain();
        drained.sort();
        assert_eq!(drained, vec![("a", 3), ("b", 5)]);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_add_all_is_atomic() {
        let mut acc = summing();
        acc.add("a", 1).unwrap();

        let result = acc.add_all(vec![("a", 2), ("b", 4), ("a", 3), ("a", 0)]);
        assert!(result.is_err());
        assert_eq!(acc.drain(), vec![("a", 1)]);

        acc.add_all(vec![("a", 2), ("b", 4), ("a", 3)]).unwrap();
        let mut drained = acc.drain();
        drained.sort();
        assert_eq!(drained, vec![("a", 5), ("b", 4)]);
    }

    #[test]
    fn test_size_threshold() {
        let mut acc = summing();
        for key in ["a", "b", "c"] {
            acc.add(key, 1).unwrap();
        }
        assert!(acc.is_full());
        assert!(acc.is_due(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_threshold() {
        let mut acc = summing();
        acc.add("a", 1).unwrap();
        assert!(!acc.is_due(Instant::now()));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(acc.is_due(Instant::now()));

        acc.drain();
        assert!(!acc.is_due(Instant::now()));
        assert_eq!(acc.deadline(), Instant::now() + Duration::from_millis(500));
    }
}
