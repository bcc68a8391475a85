//! Writes drained accumulators to the aggregate store

use super::PendingAggregate;
use crate::aggregate::StatAggregate;
use crate::config::RetryConfig;
use crate::key::StatKey;
use crate::store::AggregateStore;
use crate::transport::{BadEvent, BadEventSink};
use crate::{StatisticEvent, StatsError};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Result of one flush
#[derive(Debug, Default)]
pub struct FlushOutcome {
    /// Entries the store acknowledged
    pub written: Vec<(StatKey, PendingAggregate)>,
    /// Keys given up on
    pub failed: usize,
    /// Source events routed to the bad-event sink
    pub rejected: usize,
}

/// Per-key retrying writer
///
/// Keys are retried independently: a key that keeps failing is given up on
/// after the configured attempts and its source event goes to the bad-event
/// sink, while the rest of the batch is written.
pub struct Flusher {
    processor: String,
    store: Arc<dyn AggregateStore>,
    bad_events: Arc<dyn BadEventSink>,
    retry: RetryConfig,
}

impl Flusher {
    pub fn new(
        processor: impl Into<String>,
        store: Arc<dyn AggregateStore>,
        bad_events: Arc<dyn BadEventSink>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            processor: processor.into(),
            store,
            bad_events,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn AggregateStore> {
        &self.store
    }

    /// Merge a batch into the store
    pub async fn flush(&self, batch: Vec<(StatKey, PendingAggregate)>) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        if batch.is_empty() {
            return outcome;
        }

        let (mut requests, mut sources): (Vec<(StatKey, StatAggregate)>, Vec<_>) = batch
            .into_iter()
            .map(|(key, pending)| ((key, pending.aggregate), pending.source))
            .unzip();
        let mut failed: Vec<(Arc<StatisticEvent>, StatsError)> = Vec::new();
        let mut attempt = 1;

        loop {
            let mut results = self.store.merge_batch(&requests).await;
            if results.len() != requests.len() {
                results = (0..requests.len())
                    .map(|_| {
                        Err(StatsError::Store(
                            "Store returned an incomplete batch result".into(),
                        ))
                    })
                    .collect();
            }

            let mut retry_requests = Vec::new();
            let mut retry_sources = Vec::new();
            for (((key, aggregate), source), result) in
                requests.into_iter().zip(sources).zip(results)
            {
                match result {
                    Ok(()) => outcome
                        .written
                        .push((key, PendingAggregate { aggregate, source })),
                    Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                        retry_requests.push((key, aggregate));
                        retry_sources.push(source);
                    }
                    Err(e) => {
                        warn!(
                            processor = %self.processor,
                            key = %key,
                            attempt,
                            error = %e,
                            "Giving up on key"
                        );
                        failed.push((source, e));
                    }
                }
            }

            if retry_requests.is_empty() {
                break;
            }
            let delay = self.retry.backoff(attempt);
            warn!(
                processor = %self.processor,
                keys = retry_requests.len(),
                attempt,
                ?delay,
                "Retrying failed keys"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
            requests = retry_requests;
            sources = retry_sources;
        }

        outcome.failed = failed.len();
        outcome.rejected = self.reject_sources(failed).await;
        debug!(
            processor = %self.processor,
            written = outcome.written.len(),
            failed = outcome.failed,
            "Flushed"
        );
        outcome
    }

    /// Route an event that could not be processed
    pub async fn reject(&self, event: &StatisticEvent, reason: &StatsError) {
        warn!(
            processor = %self.processor,
            statistic = %event.name,
            error = %reason,
            "Routing bad event"
        );
        let bad = BadEvent {
            event: event.clone(),
            reason: reason.to_string(),
            processor: self.processor.clone(),
        };
        if let Err(e) = self.bad_events.send(bad).await {
            error!(processor = %self.processor, error = %e, "Failed to route bad event");
        }
    }

    /// Several keys of one event may fail; route each event once
    async fn reject_sources(&self, failed: Vec<(Arc<StatisticEvent>, StatsError)>) -> usize {
        let mut seen = HashSet::new();
        let mut rejected = 0;
        for (source, e) in failed {
            if seen.insert(Arc::as_ptr(&source) as usize) {
                self.reject(&source, &e).await;
                rejected += 1;
            }
        }
        rejected
    }
}
