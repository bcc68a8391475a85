//! Turns raw events into keyed aggregates

use crate::aggregate::StatAggregate;
use crate::key::{build_keys, check_tags, StatKey, TagValue};
use crate::statistic::{StatisticConfiguration, StatisticRegistry};
use crate::uid::UidDictionary;
use crate::{Interval, Result, StatisticEvent, StatisticType, StatsError};
use std::sync::Arc;
use tracing::trace;

/// Resolves an event's statistic and tags, then builds one aggregate per
/// materialized key
pub struct StatisticMapper {
    registry: Arc<StatisticRegistry>,
    dictionary: Arc<UidDictionary>,
    max_event_ids: usize,
}

impl StatisticMapper {
    pub fn new(
        registry: Arc<StatisticRegistry>,
        dictionary: Arc<UidDictionary>,
        max_event_ids: usize,
    ) -> Self {
        Self {
            registry,
            dictionary,
            max_event_ids,
        }
    }

    pub fn registry(&self) -> &Arc<StatisticRegistry> {
        &self.registry
    }

    /// Configuration the event must be processed under
    ///
    /// Unknown or disabled statistics, events whose value does not match
    /// the statistic's type, tags that do not match the declared ones and
    /// timestamps with no representable bucket are data errors. Nothing is
    /// interned until these checks pass.
    pub fn resolve(&self, event: &StatisticEvent) -> Result<Arc<StatisticConfiguration>> {
        let config = self
            .registry
            .get(&event.name)
            .ok_or_else(|| StatsError::UnknownStatistic(event.name.clone()))?;
        if !config.is_enabled() {
            return Err(StatsError::InvalidEvent(format!(
                "Statistic {} is disabled",
                config.name()
            )));
        }
        let event_type = event.value.statistic_type();
        if event_type != config.statistic_type() {
            return Err(StatsError::InvalidEvent(format!(
                "Statistic {} is {} but event carries a {}",
                config.name(),
                config.statistic_type(),
                event_type
            )));
        }
        if !Interval::supports_timestamp(event.timestamp) {
            return Err(StatsError::InvalidEvent(format!(
                "Timestamp {} is out of range",
                event.timestamp
            )));
        }
        let names: Vec<&str> = event.tags.iter().map(|tag| tag.name.as_str()).collect();
        check_tags(&names, &config)?;
        Ok(config)
    }

    /// Keys and aggregates for an event handled by the processor for
    /// `statistic_type` at `interval`
    pub async fn map(
        &self,
        event: &StatisticEvent,
        statistic_type: StatisticType,
        interval: Interval,
    ) -> Result<Vec<(StatKey, StatAggregate)>> {
        let config = self.resolve(event)?;
        if config.statistic_type() != statistic_type || config.precision() != interval {
            return Err(StatsError::InvalidEvent(format!(
                "Statistic {} belongs to {} at {}, not {} at {}",
                config.name(),
                config.statistic_type(),
                config.precision(),
                statistic_type,
                interval
            )));
        }

        let statistic = self.dictionary.get_or_create(config.name()).await?;
        let mut tags = Vec::with_capacity(event.tags.len());
        for tag in &event.tags {
            let name = self.dictionary.get_or_create(&tag.name).await?;
            let value = self.dictionary.get_or_create(&tag.value).await?;
            tags.push((tag.name.as_str(), TagValue::new(name, value)));
        }

        let keys = build_keys(statistic, event.timestamp, &tags, &config)?;
        trace!(statistic = config.name(), keys = keys.len(), "Mapped event");

        let aggregate = StatAggregate::from_event(event, self.max_event_ids);
        Ok(keys
            .into_iter()
            .map(|key| (key, aggregate.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::statistic::RollUpType;
    use crate::uid::{MemoryUidStore, UidStore};

    fn mapper() -> StatisticMapper {
        let registry = Arc::new(StatisticRegistry::new());
        registry
            .register(
                StatisticConfiguration::new("orders", StatisticType::Count, Interval::Second)
                    .with_tags(["env", "system"])
                    .with_rollup(RollUpType::All),
            )
            .unwrap();
        registry
            .register(
                StatisticConfiguration::new("cpu", StatisticType::Value, Interval::Minute)
                    .with_enabled(false),
            )
            .unwrap();
        let dictionary = Arc::new(UidDictionary::new(
            Arc::new(MemoryUidStore::new(4)),
            64,
            RetryConfig::default(),
        ));
        StatisticMapper::new(registry, dictionary, 10)
    }

    #[tokio::test]
    async fn test_map_event() {
        let mapper = mapper();
        let event = StatisticEvent::count("orders", 1_000, 100)
            .with_tag("system", "ABC")
            .with_tag("env", "OPS");

        let pairs = mapper
            .map(&event, StatisticType::Count, Interval::Second)
            .await
            .unwrap();
        assert_eq!(pairs.len(), 4);
        assert!(pairs.iter().all(|(_, agg)| agg.count() == 100));

        let reordered = StatisticEvent::count("orders", 1_500, 100)
            .with_tag("env", "OPS")
            .with_tag("system", "ABC");
        let again = mapper
            .map(&reordered, StatisticType::Count, Interval::Second)
            .await
            .unwrap();
        let mut a: Vec<StatKey> = pairs.into_iter().map(|(k, _)| k).collect();
        let mut b: Vec<StatKey> = again.into_iter().map(|(k, _)| k).collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_map_rejects() {
        let mapper = mapper();

        let unknown = StatisticEvent::count("missing", 0, 1);
        assert!(matches!(
            mapper.map(&unknown, StatisticType::Count, Interval::Second).await,
            Err(StatsError::UnknownStatistic(_))
        ));

        let disabled = StatisticEvent::value("cpu", 0, 1.0);
        assert!(mapper.resolve(&disabled).is_err());

        let wrong_type = StatisticEvent::value("orders", 0, 1.0)
            .with_tag("env", "OPS")
            .with_tag("system", "ABC");
        assert!(matches!(
            mapper.resolve(&wrong_type),
            Err(StatsError::InvalidEvent(_))
        ));

        let wrong_processor = StatisticEvent::count("orders", 0, 1)
            .with_tag("env", "OPS")
            .with_tag("system", "ABC");
        assert!(mapper
            .map(&wrong_processor, StatisticType::Count, Interval::Minute)
            .await
            .is_err());

        let missing_tag = StatisticEvent::count("orders", 0, 1).with_tag("env", "OPS");
        let err = mapper
            .map(&missing_tag, StatisticType::Count, Interval::Second)
            .await
            .unwrap_err();
        assert!(err.is_data_error());
    }

    #[tokio::test]
    async fn test_rejected_event_interns_nothing() {
        let mapper = mapper();
        let store = Arc::new(MemoryUidStore::new(4));
        let mapper = StatisticMapper::new(
            mapper.registry().clone(),
            Arc::new(UidDictionary::new(store.clone(), 64, RetryConfig::default())),
            10,
        );
        let good = StatisticEvent::count("orders", 0, 1)
            .with_tag("env", "OPS")
            .with_tag("system", "ABC");
        mapper
            .map(&good, StatisticType::Count, Interval::Second)
            .await
            .unwrap();
        let interned = store.forward_len();
        assert_eq!(interned, 5);

        let bad_events = [
            good.clone().with_tag("host", "garbage-1"),
            good.clone().with_tag("env", "DEV"),
            StatisticEvent::count("orders", 0, 1).with_tag("env", "garbage-2"),
            StatisticEvent::count("orders", i64::MIN, 1)
                .with_tag("env", "garbage-3")
                .with_tag("system", "ABC"),
        ];
        for event in &bad_events {
            let err = mapper
                .map(event, StatisticType::Count, Interval::Second)
                .await
                .unwrap_err();
            assert!(matches!(err, StatsError::InvalidEvent(_)), "{}", err);
        }
        assert_eq!(store.forward_len(), interned);
        assert_eq!(store.get_id("garbage-1").await.unwrap(), None);
    }
}
