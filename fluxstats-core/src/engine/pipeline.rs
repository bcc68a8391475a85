//! The full set of processors and the routing of events between them

use super::mapper::StatisticMapper;
use super::processor::AggregationProcessor;
use crate::config::StatsConfig;
use crate::statistic::StatisticRegistry;
use crate::store::AggregateStore;
use crate::transport::{BadEvent, BadEventSink};
use crate::uid::UidDictionary;
use crate::{Interval, Result, StatisticEvent, StatisticType, StatsError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

const PIPELINE: &str = "pipeline";

/// Outcome of one submission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: usize,
}

/// One processor per statistic type and interval
///
/// Processors of a type are chained finest to coarsest: every flushed
/// aggregate is forwarded to the next coarser interval, so a statistic is
/// stored at its own precision and at every coarser one.
pub struct AggregationPipeline {
    mapper: Arc<StatisticMapper>,
    bad_events: Arc<dyn BadEventSink>,
    processors: BTreeMap<(StatisticType, Interval), Arc<AggregationProcessor>>,
}

impl AggregationPipeline {
    pub fn new(
        config: StatsConfig,
        registry: Arc<StatisticRegistry>,
        dictionary: Arc<UidDictionary>,
        store: Arc<dyn AggregateStore>,
        bad_events: Arc<dyn BadEventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let mapper = Arc::new(StatisticMapper::new(
            registry,
            dictionary,
            config.max_event_ids,
        ));

        let mut processors = BTreeMap::new();
        for statistic_type in [StatisticType::Count, StatisticType::Value] {
            let mut coarser: Option<Arc<AggregationProcessor>> = None;
            for interval in Interval::all().iter().rev() {
                let processor = Arc::new(AggregationProcessor::new(
                    statistic_type,
                    *interval,
                    config.clone(),
                    mapper.clone(),
                    store.clone(),
                    bad_events.clone(),
                    coarser.take(),
                ));
                processors.insert((statistic_type, *interval), processor.clone());
                coarser = Some(processor);
            }
        }

        Ok(Self {
            mapper,
            bad_events,
            processors,
        })
    }

    /// Start every processor, coarsest first so forwards always have a target
    pub async fn start(&self) -> Result<()> {
        for processor in self.processors.values().rev() {
            processor.start().await?;
        }
        info!(processors = self.processors.len(), "Pipeline started");
        Ok(())
    }

    /// Stop every processor, finest first so final flushes reach coarser ones
    pub async fn stop(&self) -> Result<()> {
        let mut first_error = None;
        for processor in self.processors.values() {
            if let Err(e) = processor.stop().await {
                error!(processor = %processor.id(), error = %e, "Failed to stop processor");
                first_error.get_or_insert(e);
            }
        }
        info!("Pipeline stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Route events to their processors; events that cannot be routed go to
    /// the bad-event sink
    ///
    /// Fails without queueing anything when a target processor is not running.
    pub async fn submit(&self, events: Vec<StatisticEvent>) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        let mut routed: BTreeMap<(StatisticType, Interval), Vec<StatisticEvent>> = BTreeMap::new();

        for event in events {
            match self.mapper.resolve(&event) {
                Ok(config) => {
                    routed
                        .entry((config.statistic_type(), config.precision()))
                        .or_default()
                        .push(event);
                }
                Err(e) => {
                    warn!(statistic = %event.name, error = %e, "Rejecting event");
                    report.rejected += 1;
                    self.reject(event, &e).await;
                }
            }
        }

        // Refuse the whole submission before queueing any of it
        if let Some(stopped) = routed
            .keys()
            .filter_map(|target| self.processors.get(target))
            .find(|processor| !processor.is_healthy())
        {
            return Err(StatsError::Transport(format!(
                "Processor {} is not running",
                stopped.id()
            )));
        }

        for (target, events) in routed {
            let Some(processor) = self.processors.get(&target) else {
                continue;
            };
            let count = events.len();
            match processor.submit(events).await {
                Ok(()) => report.accepted += count,
                Err(unsent) => {
                    // A stop raced this submission; earlier groups stay queued
                    warn!(
                        processor = %processor.id(),
                        events = unsent.events.len(),
                        error = %unsent.error,
                        "Rejecting events that could not be queued"
                    );
                    report.accepted += count - unsent.events.len();
                    report.rejected += unsent.events.len();
                    for event in unsent.events {
                        self.reject(event, &unsent.error).await;
                    }
                }
            }
        }
        Ok(report)
    }

    async fn reject(&self, event: StatisticEvent, reason: &StatsError) {
        let bad = BadEvent {
            event,
            reason: reason.to_string(),
            processor: PIPELINE.to_string(),
        };
        if let Err(e) = self.bad_events.send(bad).await {
            error!(error = %e, "Failed to route bad event");
        }
    }

    pub fn processor(
        &self,
        statistic_type: StatisticType,
        interval: Interval,
    ) -> Option<&Arc<AggregationProcessor>> {
        self.processors.get(&(statistic_type, interval))
    }

    pub fn processors(&self) -> impl Iterator<Item = &Arc<AggregationProcessor>> {
        self.processors.values()
    }

    /// True when every processor is running
    pub fn is_healthy(&self) -> bool {
        self.processors.values().all(|p| p.is_healthy())
    }

    pub fn health_summary(&self) -> Vec<BTreeMap<String, String>> {
        self.processors.values().map(|p| p.health_summary()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::key::StatKey;
    use crate::rollup::RollUpBitMask;
    use crate::statistic::{RollUpType, StatisticConfiguration};
    use crate::store::MemoryAggregateStore;
    use crate::transport::MemoryBadEventSink;
    use crate::uid::MemoryUidStore;
    use crate::RunState;

    struct Fixture {
        pipeline: AggregationPipeline,
        registry: Arc<StatisticRegistry>,
        store: Arc<MemoryAggregateStore>,
        sink: Arc<MemoryBadEventSink>,
        dictionary: Arc<UidDictionary>,
    }

    fn fixture() -> Fixture {
        let config = StatsConfig {
            partitions: 2,
            ..Default::default()
        };
        let registry = Arc::new(StatisticRegistry::new());
        registry
            .register(
                StatisticConfiguration::new("orders", StatisticType::Count, Interval::Minute)
                    .with_tags(["env"])
                    .with_rollup(RollUpType::All),
            )
            .unwrap();
        let dictionary = Arc::new(UidDictionary::new(
            Arc::new(MemoryUidStore::new(config.uid_width)),
            1_000,
            RetryConfig::default(),
        ));
        let store = Arc::new(MemoryAggregateStore::new(config.uid_width, config.max_event_ids));
        let sink = Arc::new(MemoryBadEventSink::new(100));
        let pipeline = AggregationPipeline::new(
            config,
            registry.clone(),
            dictionary.clone(),
            store.clone(),
            sink.clone(),
        )
        .unwrap();
        Fixture {
            pipeline,
            registry,
            store,
            sink,
            dictionary,
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let f = fixture();
        assert_eq!(f.pipeline.processors().count(), 8);
        assert!(!f.pipeline.is_healthy());

        f.pipeline.start().await.unwrap();
        f.pipeline.start().await.unwrap();
        assert!(f.pipeline.is_healthy());
        let summary = f.pipeline.health_summary();
        assert_eq!(summary[0].get("id").map(String::as_str), Some("count-second"));
        assert_eq!(
            summary[0].get("forwards_to").map(String::as_str),
            Some("count-minute")
        );

        f.pipeline.stop().await.unwrap();
        f.pipeline.stop().await.unwrap();
        assert!(f
            .pipeline
            .processors()
            .all(|p| p.state() == RunState::Stopped));
    }

    #[tokio::test]
    async fn test_events_reach_every_coarser_interval() {
        let f = fixture();
        f.pipeline.start().await.unwrap();

        let ts = 1_700_000_000_000;
        let events = vec![
            StatisticEvent::count("orders", ts, 2).with_tag("env", "OPS"),
            StatisticEvent::count("orders", ts + 1_000, 3).with_tag("env", "OPS"),
            StatisticEvent::count("nope", ts, 1),
        ];
        let report = f.pipeline.submit(events).await.unwrap();
        assert_eq!(report, IngestReport { accepted: 2, rejected: 1 });

        f.pipeline.stop().await.unwrap();

        assert_eq!(f.sink.len(), 1);
        assert_eq!(f.sink.snapshot()[0].processor, "pipeline");

        // Zero mask and env rolled up, at minute, hour and day
        assert_eq!(f.store.len(), 6);

        let orders = f.dictionary.get("orders").await.unwrap().unwrap();
        let env = f.dictionary.get("env").await.unwrap().unwrap();
        let ops = f.dictionary.get("OPS").await.unwrap().unwrap();
        for interval in [Interval::Minute, Interval::Hour, Interval::Day] {
            let key = StatKey::new(
                orders,
                RollUpBitMask::ZERO,
                interval,
                ts,
                vec![crate::key::TagValue::new(env, ops)],
            );
            assert_eq!(f.store.get(&key).map(|a| a.count()), Some(5), "{}", interval);
        }

        let minute = f
            .pipeline
            .processor(StatisticType::Count, Interval::Minute)
            .unwrap();
        assert_eq!(minute.stats().events_received, 2);
        assert_eq!(minute.stats().rollups_forwarded, 2);
    }

    #[tokio::test]
    async fn test_submit_when_stopped_fails() {
        let f = fixture();
        let result = f
            .pipeline
            .submit(vec![StatisticEvent::count("orders", 0, 1).with_tag("env", "OPS")])
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_submit_with_one_stopped_processor_queues_nothing() {
        let f = fixture();
        f.registry
            .register(StatisticConfiguration::new(
                "logins",
                StatisticType::Count,
                Interval::Second,
            ))
            .unwrap();
        f.pipeline.start().await.unwrap();
        f.pipeline
            .processor(StatisticType::Count, Interval::Minute)
            .unwrap()
            .stop()
            .await
            .unwrap();

        let ts = 1_700_000_000_000;
        let result = f
            .pipeline
            .submit(vec![
                StatisticEvent::count("logins", ts, 1),
                StatisticEvent::count("orders", ts, 1).with_tag("env", "OPS"),
            ])
            .await;
        assert!(matches!(result, Err(StatsError::Transport(_))));

        let second = f
            .pipeline
            .processor(StatisticType::Count, Interval::Second)
            .unwrap();
        f.pipeline.stop().await.unwrap();
        assert_eq!(second.stats().events_received, 0);
        assert_eq!(f.store.len(), 0);
    }
}
