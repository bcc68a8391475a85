//! Statistic configuration and the registry that resolves it by name

use crate::rollup::{RollUpBitMask, MAX_TAGS};
use crate::{Interval, Result, StatisticType, StatsError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Which rolled-up variants of a statistic are materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollUpType {
    /// Only the fully specific row
    #[default]
    None,
    /// Every combination of rolled-up tags
    All,
    /// An explicit list of combinations
    Custom,
}

/// Definition of a statistic data set: name, type, precision and tags
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "ConfigurationDef")]
pub struct StatisticConfiguration {
    uuid: Uuid,
    name: String,
    description: String,
    statistic_type: StatisticType,
    rollup_type: RollUpType,
    precision: Interval,
    enabled: bool,
    /// Sorted, unique
    tag_names: Vec<String>,
    custom_masks: BTreeSet<RollUpBitMask>,
}

impl StatisticConfiguration {
    /// Create an enabled statistic with no tags and no rollups
    pub fn new(name: impl Into<String>, statistic_type: StatisticType, precision: Interval) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            statistic_type,
            rollup_type: RollUpType::None,
            precision,
            enabled: true,
            tag_names: Vec::new(),
            custom_masks: BTreeSet::new(),
        }
    }

    /// Set the tag names; they are stored sorted so positions are stable
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tag_names = tags.into_iter().map(Into::into).collect();
        self.tag_names.sort();
        self.tag_names.dedup();
        self
    }

    /// Set the rollup policy
    pub fn with_rollup(mut self, rollup_type: RollUpType) -> Self {
        self.rollup_type = rollup_type;
        self
    }

    /// Add a custom mask, given as the tag names it rolls up
    pub fn with_custom_mask<S: AsRef<str>>(mut self, rolled_up: &[S]) -> Result<Self> {
        let positions = rolled_up
            .iter()
            .map(|name| {
                self.position_of(name.as_ref()).ok_or_else(|| {
                    StatsError::Config(format!(
                        "Tag {} is not defined on statistic {}",
                        name.as_ref(),
                        self.name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.custom_masks
            .insert(RollUpBitMask::from_tag_positions(&positions)?);
        Ok(self)
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Enable or disable the statistic
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn statistic_type(&self) -> StatisticType {
        self.statistic_type
    }

    pub fn rollup_type(&self) -> RollUpType {
        self.rollup_type
    }

    pub fn precision(&self) -> Interval {
        self.precision
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Tag names in sorted order
    pub fn tag_names(&self) -> &[String] {
        &self.tag_names
    }

    /// Custom masks as configured, without the implicit zero mask
    pub fn custom_masks(&self) -> &BTreeSet<RollUpBitMask> {
        &self.custom_masks
    }

    /// Zero based position of a tag in the sorted tag list
    pub fn position_of(&self, tag_name: &str) -> Option<usize> {
        self.tag_names
            .binary_search_by(|t| t.as_str().cmp(tag_name))
            .ok()
    }

    pub fn is_tag(&self, name: &str) -> bool {
        self.position_of(name).is_some()
    }

    /// Static fields for the statistic type followed by the tag names
    pub fn all_field_names(&self) -> Vec<String> {
        self.statistic_type
            .static_fields()
            .iter()
            .map(|f| f.to_string())
            .chain(self.tag_names.iter().cloned())
            .collect()
    }

    /// Check the definition is internally consistent
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(StatsError::Config("Statistic name must not be empty".into()));
        }
        if self.tag_names.len() > MAX_TAGS {
            return Err(StatsError::Config(format!(
                "Statistic {} has {} tags, max is {}",
                self.name,
                self.tag_names.len(),
                MAX_TAGS
            )));
        }
        if self.rollup_type != RollUpType::Custom && !self.custom_masks.is_empty() {
            return Err(StatsError::Config(format!(
                "Statistic {} has custom masks but rollup type {:?}",
                self.name, self.rollup_type
            )));
        }
        let tag_count = self.tag_names.len();
        if let Some(mask) = self
            .custom_masks
            .iter()
            .find(|m| m.tag_positions().iter().any(|p| *p >= tag_count))
        {
            return Err(StatsError::Config(format!(
                "Mask {} on statistic {} refers to a tag position beyond {}",
                mask, self.name, tag_count
            )));
        }
        Ok(())
    }
}

/// Serialized shape of a configuration, normalized and validated on load
#[derive(Deserialize)]
struct ConfigurationDef {
    #[serde(default = "Uuid::new_v4")]
    uuid: Uuid,
    name: String,
    #[serde(default)]
    description: String,
    statistic_type: StatisticType,
    #[serde(default)]
    rollup_type: RollUpType,
    precision: Interval,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    tag_names: Vec<String>,
    /// Each entry lists the tag names rolled up by one mask
    #[serde(default)]
    custom_masks: Vec<Vec<String>>,
}

fn default_enabled() -> bool {
    true
}

impl TryFrom<ConfigurationDef> for StatisticConfiguration {
    type Error = StatsError;

    fn try_from(def: ConfigurationDef) -> Result<Self> {
        let mut config = StatisticConfiguration::new(def.name, def.statistic_type, def.precision)
            .with_tags(def.tag_names)
            .with_rollup(def.rollup_type)
            .with_description(def.description)
            .with_enabled(def.enabled);
        config.uuid = def.uuid;
        for mask in &def.custom_masks {
            config = config.with_custom_mask(mask.as_slice())?;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Keys and cells already written for a statistic depend on its type,
/// precision and tag positions, so a redefinition may not change them
fn check_redefinition(
    existing: &StatisticConfiguration,
    replacement: &StatisticConfiguration,
) -> Result<()> {
    let changed = if existing.statistic_type() != replacement.statistic_type() {
        "type"
    } else if existing.precision() != replacement.precision() {
        "precision"
    } else if existing.tag_names() != replacement.tag_names() {
        "tags"
    } else {
        return Ok(());
    };
    Err(StatsError::Config(format!(
        "Statistic {} cannot change its {} once registered",
        existing.name(),
        changed
    )))
}

/// Thread-safe lookup of statistic configurations by name
#[derive(Debug, Default)]
pub struct StatisticRegistry {
    by_name: RwLock<HashMap<String, Arc<StatisticConfiguration>>>,
}

impl StatisticRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a statistic, or replace one of the same type, precision and tags
    pub fn register(&self, config: StatisticConfiguration) -> Result<Arc<StatisticConfiguration>> {
        config.validate()?;
        let config = Arc::new(config);
        let mut by_name = self.by_name.write();
        if let Some(existing) = by_name.get(config.name()) {
            check_redefinition(existing, &config)?;
        }
        let previous = by_name.insert(config.name().to_string(), config.clone());
        drop(by_name);

        info!(
            statistic = config.name(),
            statistic_type = %config.statistic_type(),
            precision = %config.precision(),
            tags = config.tag_names().len(),
            replaced = previous.is_some(),
            "Registered statistic"
        );
        Ok(config)
    }

    /// Get a statistic by name
    pub fn get(&self, name: &str) -> Option<Arc<StatisticConfiguration>> {
        self.by_name.read().get(name).cloned()
    }

    /// Remove a statistic
    pub fn remove(&self, name: &str) -> Option<Arc<StatisticConfiguration>> {
        self.by_name.write().remove(name)
    }

    /// Names of all registered statistics, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.by_name.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_sorted_and_positioned() {
        let config = StatisticConfiguration::new("orders", StatisticType::Count, Interval::Second)
            .with_tags(["system", "env", "user", "env"]);

        assert_eq!(config.tag_names(), &["env", "system", "user"]);
        assert_eq!(config.position_of("env"), Some(0));
        assert_eq!(config.position_of("user"), Some(2));
        assert_eq!(config.position_of("host"), None);
        assert_eq!(
            config.all_field_names().last().map(String::as_str),
            Some("user")
        );
    }

    #[test]
    fn test_validation() {
        let too_many = StatisticConfiguration::new("wide", StatisticType::Count, Interval::Minute)
            .with_tags((0..16).map(|i| format!("tag{:02}", i)));
        assert!(matches!(too_many.validate(), Err(StatsError::Config(_))));

        let misplaced = StatisticConfiguration::new("m", StatisticType::Value, Interval::Minute)
            .with_tags(["a", "b"])
            .with_custom_mask(&["a"])
            .unwrap();
        assert!(misplaced.validate().is_err());
        assert!(misplaced.with_rollup(RollUpType::Custom).validate().is_ok());

        let unknown = StatisticConfiguration::new("u", StatisticType::Value, Interval::Minute)
            .with_tags(["a"])
            .with_custom_mask(&["b"]);
        assert!(unknown.is_err());
    }

    #[test]
    fn test_deserialize() {
        let json = r#"{
            "name": "cpu",
            "statistic_type": "VALUE",
            "rollup_type": "CUSTOM",
            "precision": "MINUTE",
            "tag_names": ["host", "env"],
            "custom_masks": [["host"], ["env", "host"]]
        }"#;
        let config: StatisticConfiguration = serde_json::from_str(json).unwrap();
        assert_eq!(config.tag_names(), &["env", "host"]);
        assert_eq!(config.custom_masks().len(), 2);
        assert!(config.is_enabled());

        let bad = r#"{"name": "x", "statistic_type": "COUNT", "precision": "DAY",
                      "rollup_type": "CUSTOM", "custom_masks": [["nope"]]}"#;
        assert!(serde_json::from_str::<StatisticConfiguration>(bad).is_err());
    }

    #[test]
    fn test_registry() {
        let registry = StatisticRegistry::new();
        registry
            .register(StatisticConfiguration::new(
                "orders",
                StatisticType::Count,
                Interval::Second,
            ))
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.get("orders").is_some());
        assert!(registry.get("missing").is_none());
        assert!(registry
            .register(StatisticConfiguration::new("", StatisticType::Count, Interval::Day))
            .is_err());
        registry.remove("orders");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_rejects_incompatible_redefinition() {
        let registry = StatisticRegistry::new();
        registry
            .register(
                StatisticConfiguration::new("latency", StatisticType::Value, Interval::Minute)
                    .with_tags(["env", "host"]),
            )
            .unwrap();

        let retyped = StatisticConfiguration::new("latency", StatisticType::Count, Interval::Minute)
            .with_tags(["env", "host"]);
        assert!(matches!(registry.register(retyped), Err(StatsError::Config(_))));

        let coarser = StatisticConfiguration::new("latency", StatisticType::Value, Interval::Hour)
            .with_tags(["env", "host"]);
        assert!(matches!(registry.register(coarser), Err(StatsError::Config(_))));

        let retagged = StatisticConfiguration::new("latency", StatisticType::Value, Interval::Minute)
            .with_tags(["env", "region"]);
        assert!(matches!(registry.register(retagged), Err(StatsError::Config(_))));

        let stored = registry.get("latency").unwrap();
        assert_eq!(stored.statistic_type(), StatisticType::Value);
        assert_eq!(stored.tag_names(), ["env".to_string(), "host".to_string()]);

        // Same shape with tags given in another order is accepted
        let disabled = StatisticConfiguration::new("latency", StatisticType::Value, Interval::Minute)
            .with_tags(["host", "env"])
            .with_enabled(false);
        registry.register(disabled).unwrap();
        assert!(!registry.get("latency").unwrap().is_enabled());
    }
}
