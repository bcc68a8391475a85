//! Partition worker: the single owner of one partition's accumulator

use super::accumulator::Accumulator;
use super::flusher::Flusher;
use super::mapper::StatisticMapper;
use super::processor::{AggregationProcessor, ProcessorStats};
use super::PendingAggregate;
use crate::key::StatKey;
use crate::{Interval, StatisticEvent, StatisticType};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Work delivered to a partition
#[derive(Debug)]
pub enum WorkerInput {
    /// Raw events of statistics stored at this processor's precision
    Events(Vec<StatisticEvent>),
    /// Flushed aggregates of the next finer precision, already re-keyed
    Rollups(Vec<(StatKey, PendingAggregate)>),
}

/// Retention settings for the partition that runs purges
pub(super) struct Retention {
    pub horizon: Duration,
    pub every: Duration,
}

pub(super) struct PartitionWorker {
    pub processor: String,
    pub partition: usize,
    pub statistic_type: StatisticType,
    pub interval: Interval,
    pub mapper: Arc<StatisticMapper>,
    pub flusher: Arc<Flusher>,
    pub accumulator: Accumulator<StatKey, PendingAggregate>,
    pub forward: Option<Arc<AggregationProcessor>>,
    pub retention: Option<Retention>,
    pub stats: Arc<ProcessorStats>,
}

impl PartitionWorker {
    /// Consume until cancelled, then drain the queue and flush what is held
    pub async fn run(mut self, mut rx: mpsc::Receiver<WorkerInput>, cancel: CancellationToken) {
        debug!(processor = %self.processor, partition = self.partition, "Worker started");
        let mut last_purge: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                input = rx.recv() => match input {
                    Some(input) => {
                        self.handle(input).await;
                        if self.accumulator.is_full() {
                            self.flush("size").await;
                        }
                    }
                    None => break,
                },

                _ = tokio::time::sleep_until(self.accumulator.deadline()) => {
                    self.flush("time").await;
                    self.purge_if_due(&mut last_purge).await;
                }
            }
        }

        rx.close();
        while let Some(input) = rx.recv().await {
            self.handle(input).await;
        }
        self.flush("stop").await;
        info!(processor = %self.processor, partition = self.partition, "Worker stopped");
    }

    async fn handle(&mut self, input: WorkerInput) {
        match input {
            WorkerInput::Events(events) => {
                self.stats
                    .events_received
                    .fetch_add(events.len() as u64, Ordering::Relaxed);
                for event in events {
                    self.handle_event(event).await;
                }
            }
            WorkerInput::Rollups(pairs) => {
                for (key, pending) in pairs {
                    if let Err(e) = self.accumulator.add(key, pending) {
                        warn!(processor = %self.processor, error = %e, "Dropping rollup");
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: StatisticEvent) {
        let pairs = match self
            .mapper
            .map(&event, self.statistic_type, self.interval)
            .await
        {
            Ok(pairs) => pairs,
            Err(e) => {
                if e.is_fatal() {
                    error!(
                        processor = %self.processor,
                        statistic = %event.name,
                        error = %e,
                        "Fatal error mapping event"
                    );
                    self.stats.fatal_errors.fetch_add(1, Ordering::Relaxed);
                }
                self.stats.events_rejected.fetch_add(1, Ordering::Relaxed);
                self.flusher.reject(&event, &e).await;
                return;
            }
        };

        let source = Arc::new(event);
        let pending = pairs
            .into_iter()
            .map(|(key, aggregate)| {
                (
                    key,
                    PendingAggregate {
                        aggregate,
                        source: source.clone(),
                    },
                )
            })
            .collect();
        // A rejected event must not leave some of its keys accumulated
        if let Err(e) = self.accumulator.add_all(pending) {
            self.stats.events_rejected.fetch_add(1, Ordering::Relaxed);
            self.flusher.reject(&source, &e).await;
        }
    }

    async fn flush(&mut self, trigger: &'static str) {
        let batch = self.accumulator.drain();
        if batch.is_empty() {
            return;
        }
        let keys = batch.len();
        let outcome = self.flusher.flush(batch).await;

        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .keys_flushed
            .fetch_add(outcome.written.len() as u64, Ordering::Relaxed);
        self.stats
            .keys_failed
            .fetch_add(outcome.failed as u64, Ordering::Relaxed);
        self.stats
            .events_rejected
            .fetch_add(outcome.rejected as u64, Ordering::Relaxed);
        debug!(
            processor = %self.processor,
            partition = self.partition,
            trigger,
            keys,
            "Flush complete"
        );

        if let Some(coarser) = &self.forward {
            let rollups: Vec<(StatKey, PendingAggregate)> = outcome
                .written
                .into_iter()
                .map(|(key, pending)| (key.with_interval(coarser.interval()), pending))
                .collect();
            let count = rollups.len() as u64;
            match coarser.submit_rollups(rollups).await {
                Ok(()) => {
                    self.stats
                        .rollups_forwarded
                        .fetch_add(count, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(
                        processor = %self.processor,
                        target = %coarser.id(),
                        error = %e,
                        "Could not forward rollups"
                    );
                }
            }
        }
    }

    async fn purge_if_due(&self, last_purge: &mut Option<Instant>) {
        let Some(retention) = &self.retention else {
            return;
        };
        let now = Instant::now();
        if last_purge.is_some_and(|at| now < at + retention.every) {
            return;
        }
        *last_purge = Some(now);

        let cutoff = chrono::Utc::now().timestamp_millis() - retention.horizon.as_millis() as i64;
        match self.flusher.store().purge(self.interval, cutoff).await {
            Ok(removed) => {
                self.stats
                    .cells_purged
                    .fetch_add(removed as u64, Ordering::Relaxed);
            }
            Err(e) => warn!(processor = %self.processor, error = %e, "Retention purge failed"),
        }
    }
}
