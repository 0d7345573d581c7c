//! Scheduler configuration loading and validation.
//!
//! Defines the config schema and resolves defaults; optionally loaded from TOML.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Numeric weights per classification; higher plays first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    /// Live arrivals (real-time delivery path).
    pub real_time: u32,
    /// Continuations of a same-sender run.
    pub back_to_back: u32,
    /// Members of a multi-message arrival burst.
    pub burst: u32,
    /// Plain unread catch-up.
    pub backlog: u32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            real_time: 100,
            back_to_back: 75,
            burst: 50,
            backlog: 25,
        }
    }
}

/// Immutable scheduler configuration, supplied once at construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on entries a single conversation may own concurrently.
    pub max_concurrent_per_group: usize,
    /// Max gap between same-sender arrivals to group them back-to-back.
    pub back_to_back_threshold_ms: u64,
    /// Window used to detect burst arrivals regardless of sender.
    pub burst_threshold_ms: u64,
    /// Per-classification priority weights.
    pub priority_weights: PriorityWeights,
    /// Priority points a new arrival must exceed the active entry by to preempt it.
    pub interruption_margin: u32,
    /// Allow higher-priority arrivals to cancel in-progress playback.
    pub enable_interruption: bool,
    /// Group consecutive same-sender messages and report completed runs.
    pub enable_back_to_back_detection: bool,
    /// Collect running counters.
    pub enable_metrics: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_group: 2,
            back_to_back_threshold_ms: 5_000,
            burst_threshold_ms: 10_000,
            priority_weights: PriorityWeights::default(),
            interruption_margin: 25,
            enable_interruption: true,
            enable_back_to_back_detection: true,
            enable_metrics: true,
        }
    }
}

/// Rejected configuration values.
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    ZeroGroupConcurrency,
    ZeroBackToBackThreshold,
    ZeroBurstThreshold,
    ZeroWeight(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroGroupConcurrency => f.write_str("max_concurrent_per_group must be at least 1"),
            Self::ZeroBackToBackThreshold => f.write_str("back_to_back_threshold_ms must be positive"),
            Self::ZeroBurstThreshold => f.write_str("burst_threshold_ms must be positive"),
            Self::ZeroWeight(name) => write!(f, "priority weight {name} must be positive"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl SchedulerConfig {
    /// Load configuration from a TOML file, resolving missing fields to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<SchedulerConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        cfg.validate()
            .with_context(|| format!("validate config {:?}", path))?;
        Ok(cfg)
    }

    /// Reject values that would wedge or bypass scheduling.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_per_group == 0 {
            return Err(ConfigError::ZeroGroupConcurrency);
        }
        if self.back_to_back_threshold_ms == 0 {
            return Err(ConfigError::ZeroBackToBackThreshold);
        }
        if self.burst_threshold_ms == 0 {
            return Err(ConfigError::ZeroBurstThreshold);
        }
        let weights = [
            ("real_time", self.priority_weights.real_time),
            ("back_to_back", self.priority_weights.back_to_back),
            ("burst", self.priority_weights.burst),
            ("backlog", self.priority_weights.backlog),
        ];
        for (name, weight) in weights {
            if weight == 0 {
                return Err(ConfigError::ZeroWeight(name));
            }
        }
        Ok(())
    }
}
