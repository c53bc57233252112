//! Scheduler configuration parser (`[scheduler]` TOML table).

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::resource::{DefaultResourceCalculator, DominantResourceCalculator, ResourceCalculator};
use crate::types::Resource;

/// Which [`ResourceCalculator`] the scheduler compares resources with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculatorKind {
    #[default]
    Default,
    Dominant,
}

impl CalculatorKind {
    pub fn build(self) -> Arc<dyn ResourceCalculator> {
        match self {
            CalculatorKind::Default => Arc::new(DefaultResourceCalculator),
            CalculatorKind::Dominant => Arc::new(DominantResourceCalculator),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub resource_calculator: CalculatorKind,
    /// How long a computed aggregate usage report stays valid.
    pub aggregate_usage_refresh_secs: u64,
    /// Smallest container the scheduler hands out; also the unit that
    /// replacement requests for preempted containers are sized in.
    pub minimum_allocation: Resource,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            resource_calculator: CalculatorKind::Default,
            aggregate_usage_refresh_secs: 3,
            minimum_allocation: Resource::new(1024, 1),
        }
    }
}

impl SchedulerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: SchedulerConfig = toml::from_str(content)?;
        if config.minimum_allocation.is_zero() {
            anyhow::bail!("minimum_allocation must be non-zero");
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn calculator(&self) -> Arc<dyn ResourceCalculator> {
        self.resource_calculator.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = SchedulerConfig::from_toml_str("").unwrap();
        assert_eq!(config, SchedulerConfig::default());
        assert_eq!(config.minimum_allocation, Resource::new(1024, 1));
    }

    #[test]
    fn test_parse_dominant() {
        let toml_str = r#"
resource_calculator = "dominant"
aggregate_usage_refresh_secs = 10

[minimum_allocation]
memory_mb = 512
vcores = 1
"#;
        let config = SchedulerConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.resource_calculator, CalculatorKind::Dominant);
        assert_eq!(config.minimum_allocation.memory_mb, 512);
        assert_eq!(config.aggregate_usage_refresh_secs, 10);
    }

    #[test]
    fn test_rejects_zero_minimum_allocation() {
        let toml_str = r#"
[minimum_allocation]
memory_mb = 0
vcores = 0
"#;
        assert!(SchedulerConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = SchedulerConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("minimum_allocation"));
        assert_eq!(SchedulerConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_from_file_round_trip() {
        let config = SchedulerConfig {
            resource_calculator: CalculatorKind::Dominant,
            aggregate_usage_refresh_secs: 7,
            minimum_allocation: Resource::new(512, 2),
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.toml");
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        assert_eq!(SchedulerConfig::from_file(&path).unwrap(), config);
        assert!(SchedulerConfig::from_file(&dir.path().join("absent.toml")).is_err());
    }
}
