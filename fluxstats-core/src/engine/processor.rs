//! Aggregation processor for one statistic type at one precision

use super::accumulator::{Accumulator, MergeFn};
use super::flusher::Flusher;
use super::mapper::StatisticMapper;
use super::worker::{PartitionWorker, Retention, WorkerInput};
use super::PendingAggregate;
use crate::config::{StatsConfig, PARTITION_QUEUE_CAPACITY, RETENTION_PURGE_INTERVAL_MS};
use crate::key::StatKey;
use crate::store::AggregateStore;
use crate::transport::{BadEventSink, ChannelTransport, Partitioner};
use crate::{Interval, Result, StatisticEvent, StatisticType, StatsError};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Events a processor did not queue, and why
#[derive(Debug)]
pub struct Unsent {
    pub error: StatsError,
    pub events: Vec<StatisticEvent>,
}

/// Lifecycle of a processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Stopped => "STOPPED",
            RunState::Starting => "STARTING",
            RunState::Running => "RUNNING",
            RunState::Stopping => "STOPPING",
        };
        f.write_str(name)
    }
}

/// Counters shared by a processor's workers
#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub events_received: AtomicU64,
    pub events_rejected: AtomicU64,
    pub flushes: AtomicU64,
    pub keys_flushed: AtomicU64,
    pub keys_failed: AtomicU64,
    pub rollups_forwarded: AtomicU64,
    pub cells_purged: AtomicU64,
    pub fatal_errors: AtomicU64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> ProcessorStatsSnapshot {
        ProcessorStatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            keys_flushed: self.keys_flushed.load(Ordering::Relaxed),
            keys_failed: self.keys_failed.load(Ordering::Relaxed),
            rollups_forwarded: self.rollups_forwarded.load(Ordering::Relaxed),
            cells_purged: self.cells_purged.load(Ordering::Relaxed),
            fatal_errors: self.fatal_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ProcessorStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessorStatsSnapshot {
    pub events_received: u64,
    pub events_rejected: u64,
    pub flushes: u64,
    pub keys_flushed: u64,
    pub keys_failed: u64,
    pub rollups_forwarded: u64,
    pub cells_purged: u64,
    pub fatal_errors: u64,
}

struct Workers {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Runs one worker per partition for a (statistic type, interval) pair
///
/// Lifecycle is `STOPPED -> STARTING -> RUNNING -> STOPPING -> STOPPED`.
/// Transitions are serialized by a single async mutex, and `start` on a
/// running processor or `stop` on a stopped one does nothing. Stopping lets
/// every worker finish its in-flight flush, drain its queue and flush what
/// it holds before the processor reports `STOPPED`.
pub struct AggregationProcessor {
    id: String,
    statistic_type: StatisticType,
    interval: Interval,
    config: StatsConfig,
    partitioner: Partitioner,
    mapper: Arc<StatisticMapper>,
    flusher: Arc<Flusher>,
    forward: Option<Arc<AggregationProcessor>>,
    state: RwLock<RunState>,
    transition: tokio::sync::Mutex<Option<Workers>>,
    transport: RwLock<Option<Arc<ChannelTransport<WorkerInput>>>>,
    stats: Arc<ProcessorStats>,
}

impl AggregationProcessor {
    /// Create a stopped processor; flushed aggregates are forwarded to
    /// `forward` when given
    pub fn new(
        statistic_type: StatisticType,
        interval: Interval,
        config: StatsConfig,
        mapper: Arc<StatisticMapper>,
        store: Arc<dyn AggregateStore>,
        bad_events: Arc<dyn BadEventSink>,
        forward: Option<Arc<AggregationProcessor>>,
    ) -> Self {
        let id = processor_id(statistic_type, interval);
        let flusher = Arc::new(Flusher::new(
            id.clone(),
            store,
            bad_events,
            config.flush_retry.clone(),
        ));
        Self {
            partitioner: Partitioner::new(config.partitions),
            id,
            statistic_type,
            interval,
            config,
            mapper,
            flusher,
            forward,
            state: RwLock::new(RunState::Stopped),
            transition: tokio::sync::Mutex::new(None),
            transport: RwLock::new(None),
            stats: Arc::new(ProcessorStats::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn statistic_type(&self) -> StatisticType {
        self.statistic_type
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn state(&self) -> RunState {
        *self.state.read()
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == RunState::Running
    }

    pub fn stats(&self) -> ProcessorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Start the workers; a no-op when already running
    pub async fn start(&self) -> Result<()> {
        let mut workers = self.transition.lock().await;
        if self.state() == RunState::Running {
            return Ok(());
        }
        self.set_state(RunState::Starting);

        let partitions = self.partitioner.partitions();
        let (transport, receivers) =
            ChannelTransport::new(partitions, PARTITION_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let max_event_ids = self.config.max_event_ids;
        let merge: MergeFn<PendingAggregate> =
            Arc::new(move |held: &mut PendingAggregate, next: PendingAggregate| {
                held.aggregate.merge_from(next.aggregate, max_event_ids)
            });

        let tasks = receivers
            .into_iter()
            .enumerate()
            .map(|(partition, rx)| {
                let worker = PartitionWorker {
                    processor: self.id.clone(),
                    partition,
                    statistic_type: self.statistic_type,
                    interval: self.interval,
                    mapper: self.mapper.clone(),
                    flusher: self.flusher.clone(),
                    accumulator: Accumulator::new(
                        self.config.min_flush_batch_size,
                        self.config.max_flush_interval(),
                        merge.clone(),
                    ),
                    forward: self.forward.clone(),
                    retention: self.retention_for(partition),
                    stats: self.stats.clone(),
                };
                tokio::spawn(worker.run(rx, cancel.clone()))
            })
            .collect();

        *self.transport.write() = Some(Arc::new(transport));
        *workers = Some(Workers { cancel, tasks });
        self.set_state(RunState::Running);
        info!(
            processor = %self.id,
            partitions,
            min_flush_batch_size = self.config.min_flush_batch_size,
            max_flush_interval_ms = self.config.max_flush_interval_ms,
            "Processor started"
        );
        Ok(())
    }

    /// Stop the workers after they flush; a no-op when already stopped
    pub async fn stop(&self) -> Result<()> {
        let mut workers = self.transition.lock().await;
        let Some(running) = workers.take() else {
            self.set_state(RunState::Stopped);
            return Ok(());
        };
        self.set_state(RunState::Stopping);

        // Refuse new work, then let workers drain what was queued
        self.transport.write().take();
        running.cancel.cancel();
        let mut failed = 0;
        for task in running.tasks {
            if let Err(e) = task.await {
                error!(processor = %self.id, error = %e, "Worker task failed");
                failed += 1;
            }
        }

        self.set_state(RunState::Stopped);
        info!(processor = %self.id, "Processor stopped");
        if failed > 0 {
            return Err(StatsError::Internal(format!(
                "{} workers of {} ended abnormally",
                failed, self.id
            )));
        }
        Ok(())
    }

    /// Queue raw events, split by statistic name across partitions
    ///
    /// Events that could not be queued are handed back: all of them when
    /// the processor is not running, or those of partitions that closed
    /// while a stop was in progress.
    pub async fn submit(&self, events: Vec<StatisticEvent>) -> std::result::Result<(), Unsent> {
        let transport = match self.transport() {
            Ok(transport) => transport,
            Err(error) => return Err(Unsent { error, events }),
        };
        let mut unsent = Vec::new();
        for batch in self.partitioner.split(events) {
            let partition = batch.partition;
            if let Err(WorkerInput::Events(events)) = transport
                .deliver(partition, WorkerInput::Events(batch.events))
                .await
            {
                warn!(processor = %self.id, partition, "Partition closed while queueing events");
                unsent.extend(events);
            }
        }
        if unsent.is_empty() {
            Ok(())
        } else {
            Err(Unsent {
                error: StatsError::Transport(format!("Processor {} is stopping", self.id)),
                events: unsent,
            })
        }
    }

    /// Queue aggregates flushed by the next finer processor
    pub async fn submit_rollups(&self, rollups: Vec<(StatKey, PendingAggregate)>) -> Result<()> {
        if rollups.is_empty() {
            return Ok(());
        }
        let transport = self.transport()?;
        let mut groups: Vec<Vec<(StatKey, PendingAggregate)>> =
            vec![Vec::new(); self.partitioner.partitions()];
        for (key, pending) in rollups {
            let partition = self.partitioner.partition_for(&key.statistic().to_bytes());
            groups[partition].push((key, pending));
        }
        for (partition, group) in groups.into_iter().enumerate() {
            if !group.is_empty() {
                transport.send(partition, WorkerInput::Rollups(group)).await?;
            }
        }
        Ok(())
    }

    /// Ordered description of the processor for health checks
    pub fn health_summary(&self) -> BTreeMap<String, String> {
        let stats = self.stats();
        let mut summary = BTreeMap::new();
        summary.insert("id".to_string(), self.id.clone());
        summary.insert("statistic_type".to_string(), self.statistic_type.to_string());
        summary.insert("interval".to_string(), self.interval.to_string());
        summary.insert("state".to_string(), self.state().to_string());
        summary.insert(
            "partitions".to_string(),
            self.partitioner.partitions().to_string(),
        );
        summary.insert("events_received".to_string(), stats.events_received.to_string());
        summary.insert("events_rejected".to_string(), stats.events_rejected.to_string());
        summary.insert("flushes".to_string(), stats.flushes.to_string());
        summary.insert("keys_flushed".to_string(), stats.keys_flushed.to_string());
        summary.insert("keys_failed".to_string(), stats.keys_failed.to_string());
        summary.insert("fatal_errors".to_string(), stats.fatal_errors.to_string());
        if let Some(forward) = &self.forward {
            summary.insert("forwards_to".to_string(), forward.id().to_string());
        }
        summary
    }

    fn transport(&self) -> Result<Arc<ChannelTransport<WorkerInput>>> {
        self.transport.read().clone().ok_or_else(|| {
            StatsError::Transport(format!("Processor {} is not running", self.id))
        })
    }

    fn retention_for(&self, partition: usize) -> Option<Retention> {
        // One partition per processor purges
        if partition != 0 {
            return None;
        }
        self.config
            .retention_for(self.interval)
            .map(|horizon| Retention {
                horizon,
                every: Duration::from_millis(RETENTION_PURGE_INTERVAL_MS),
            })
    }

    fn set_state(&self, state: RunState) {
        *self.state.write() = state;
    }
}

/// Processor id, e.g. `count-second`
pub fn processor_id(statistic_type: StatisticType, interval: Interval) -> String {
    format!(
        "{}-{}",
        statistic_type.as_str(),
        interval.long_name().to_lowercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::StatAggregate;
    use crate::config::RetryConfig;
    use crate::key::TagValue;
    use crate::rollup::RollUpBitMask;
    use crate::statistic::{RollUpType, StatisticConfiguration, StatisticRegistry};
    use crate::store::MemoryAggregateStore;
    use crate::transport::MemoryBadEventSink;
    use crate::uid::{MemoryUidStore, Uid, UidDictionary};

    struct Harness {
        processor: AggregationProcessor,
        store: Arc<MemoryAggregateStore>,
        sink: Arc<MemoryBadEventSink>,
        dictionary: Arc<UidDictionary>,
    }

    fn harness(config: StatsConfig, tags: &[&str], rollup: RollUpType) -> Harness {
        let registry = Arc::new(StatisticRegistry::new());
        registry
            .register(
                StatisticConfiguration::new("orders", StatisticType::Count, Interval::Second)
                    .with_tags(tags.iter().copied())
                    .with_rollup(rollup),
            )
            .unwrap();
        let dictionary = Arc::new(UidDictionary::new(
            Arc::new(MemoryUidStore::new(config.uid_width)),
            1_000,
            RetryConfig::default(),
        ));
        let mapper = Arc::new(StatisticMapper::new(
            registry,
            dictionary.clone(),
            config.max_event_ids,
        ));
        let store = Arc::new(MemoryAggregateStore::new(config.uid_width, config.max_event_ids));
        let sink = Arc::new(MemoryBadEventSink::new(100));
        let processor = AggregationProcessor::new(
            StatisticType::Count,
            Interval::Second,
            config,
            mapper,
            store.clone(),
            sink.clone(),
            None,
        );
        Harness {
            processor,
            store,
            sink,
            dictionary,
        }
    }

    fn small_batches() -> StatsConfig {
        StatsConfig {
            min_flush_batch_size: 10,
            max_flush_interval_ms: 500,
            partitions: 2,
            ..Default::default()
        }
    }

    async fn wait_for(store: &MemoryAggregateStore, cells: usize) {
        for _ in 0..1_000 {
            if store.len() >= cells {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_batch_size() {
        let h = harness(small_batches(), &[], RollUpType::None);
        h.processor.start().await.unwrap();

        let events = (0..10)
            .map(|i| StatisticEvent::count("orders", i * 1_000, 1))
            .collect();
        h.processor.submit(events).await.unwrap();

        // No time passes, so only the size threshold can flush
        wait_for(&h.store, 10).await;
        assert_eq!(h.store.len(), 10);
        assert_eq!(h.processor.stats().flushes, 1);
        assert_eq!(h.processor.stats().keys_flushed, 10);

        h.processor.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_interval() {
        let h = harness(small_batches(), &[], RollUpType::None);
        h.processor.start().await.unwrap();

        let events = (0..3)
            .map(|i| StatisticEvent::count("orders", i * 1_000, 1))
            .collect();
        h.processor.submit(events).await.unwrap();

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(h.store.len(), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        wait_for(&h.store, 3).await;
        assert_eq!(h.store.len(), 3);

        h.processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollups_share_cells() {
        let h = harness(StatsConfig::default(), &["env", "system"], RollUpType::All);
        h.processor.start().await.unwrap();

        let ts = 1_700_000_000_000;
        h.processor
            .submit(vec![
                StatisticEvent::count("orders", ts, 100)
                    .with_tag("env", "OPS")
                    .with_tag("system", "ABC"),
                StatisticEvent::count("orders", ts, 200)
                    .with_tag("system", "XYZ")
                    .with_tag("env", "OPS"),
            ])
            .await
            .unwrap();
        h.processor.stop().await.unwrap();

        // Two specific cells, two with env rolled up, one each for the rest
        assert_eq!(h.store.len(), 6);

        let uid = |name: &'static str| {
            let dictionary = h.dictionary.clone();
            async move { dictionary.get(name).await.unwrap().unwrap() }
        };
        let (orders, env, system, ops) =
            (uid("orders").await, uid("env").await, uid("system").await, uid("OPS").await);
        let rolled = Uid::rolled_up(4).unwrap();

        let system_rolled = StatKey::new(
            orders,
            RollUpBitMask::from_bits(0b10).unwrap(),
            Interval::Second,
            ts,
            vec![TagValue::new(env, ops), TagValue::new(system, rolled)],
        );
        assert_eq!(h.store.get(&system_rolled).map(|a| a.count()), Some(300));

        let all_rolled = StatKey::new(
            orders,
            RollUpBitMask::from_bits(0b11).unwrap(),
            Interval::Second,
            ts,
            vec![TagValue::new(env, rolled), TagValue::new(system, rolled)],
        );
        assert_eq!(h.store.get(&all_rolled).map(|a| a.count()), Some(300));

        assert!(h.sink.is_empty());
        assert_eq!(h.processor.stats().events_received, 2);
    }

    #[tokio::test]
    async fn test_bad_event_routed() {
        let h = harness(StatsConfig::default(), &["env"], RollUpType::None);
        h.processor.start().await.unwrap();
        h.processor
            .submit(vec![
                StatisticEvent::count("orders", 0, 1).with_tag("host", "a"),
                StatisticEvent::count("orders", 0, 1).with_tag("env", "OPS"),
            ])
            .await
            .unwrap();
        h.processor.stop().await.unwrap();

        assert_eq!(h.store.len(), 1);
        let bad = h.sink.drain();
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].processor, "count-second");
        assert!(bad[0].reason.contains("host"));
        assert_eq!(h.processor.stats().events_rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_purge() {
        let mut config = small_batches();
        config
            .retention
            .insert(Interval::Second, 2 * 60 * 60 * 1000);
        let h = harness(config, &[], RollUpType::None);

        let statistic = Uid::new(1, 4).unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        let event = StatisticEvent::count("orders", 0, 1);
        for ts in [0, now] {
            let key = StatKey::new(statistic, RollUpBitMask::ZERO, Interval::Second, ts, vec![]);
            h.store
                .merge(&key, &StatAggregate::from_event(&event, 10))
                .await
                .unwrap();
        }

        h.processor.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        for _ in 0..100 {
            if h.store.len() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.processor.stats().cells_purged, 1);
        h.processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let h = harness(StatsConfig::default(), &[], RollUpType::None);
        assert_eq!(h.processor.state(), RunState::Stopped);
        let unsent = h
            .processor
            .submit(vec![
                StatisticEvent::count("orders", 0, 1),
                StatisticEvent::count("orders", 1_000, 1),
            ])
            .await
            .unwrap_err();
        assert!(matches!(unsent.error, StatsError::Transport(_)));
        assert_eq!(unsent.events.len(), 2);

        h.processor.start().await.unwrap();
        h.processor.start().await.unwrap();
        assert_eq!(h.processor.state(), RunState::Running);
        assert!(h.processor.is_healthy());

        let summary = h.processor.health_summary();
        assert_eq!(summary["id"], "count-second");
        assert_eq!(summary["state"], "RUNNING");
        assert_eq!(summary["partitions"], "4");
        assert!(!summary.contains_key("forwards_to"));

        h.processor.stop().await.unwrap();
        h.processor.stop().await.unwrap();
        assert_eq!(h.processor.state(), RunState::Stopped);

        // Restartable after a stop
        h.processor.start().await.unwrap();
        assert!(h.processor.is_healthy());
        h.processor.stop().await.unwrap();
    }

    #[test]
    fn test_processor_id() {
        assert_eq!(processor_id(StatisticType::Value, Interval::Hour), "value-hour");
        assert_eq!(RunState::Stopping.to_string(), "STOPPING");
    }
}
