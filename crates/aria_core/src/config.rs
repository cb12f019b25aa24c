//! Core configuration: loop intervals, window capacities, and thresholds.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Time-based rule check interval (seconds).
    pub tick_secs: u64,
    /// Condition-based rule check interval (seconds).
    pub condition_tick_secs: u64,
    /// Predictive analysis cycle interval (seconds).
    pub analysis_interval_secs: u64,
    /// Deadline for any single durable-storage call (milliseconds).
    pub storage_timeout_ms: u64,
    /// Deadline for any single provider call (milliseconds).
    pub provider_timeout_ms: u64,
    /// Grace period for in-flight work during shutdown (milliseconds).
    pub shutdown_grace_ms: u64,
    /// Rolling interaction window size.
    pub interaction_capacity: usize,
    /// Rolling environmental reading window size.
    pub reading_capacity: usize,
    /// Below this many interactions, pattern confidence is capped.
    pub min_samples: usize,
    /// The cap applied to confidences derived from sparse data.
    pub sparse_confidence_cap: f64,
    /// Predictions below this confidence never create or update automations.
    pub automation_confidence_threshold: f64,
    /// Bound on concurrent prediction/analysis work items.
    pub max_concurrent_analysis: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            condition_tick_secs: 300,
            analysis_interval_secs: 300,
            storage_timeout_ms: 5_000,
            provider_timeout_ms: 5_000,
            shutdown_grace_ms: 2_000,
            interaction_capacity: 50,
            reading_capacity: 24,
            min_samples: 5,
            sparse_confidence_cap: 0.5,
            automation_confidence_threshold: 0.7,
            max_concurrent_analysis: 2,
        }
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing keys.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: CoreConfig = toml::from_str(&content).context("Failed to parse config")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.tick_secs, 60);
        assert_eq!(config.condition_tick_secs, 300);
        assert_eq!(config.interaction_capacity, 50);
        assert_eq!(config.reading_capacity, 24);
        assert_eq!(config.automation_confidence_threshold, 0.7);
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config: CoreConfig = toml::from_str("tick_secs = 10").unwrap();
        assert_eq!(config.tick_secs, 10);
        assert_eq!(config.condition_tick_secs, 300);
    }
}
