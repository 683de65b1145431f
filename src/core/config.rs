//! Configuration - Type-safe, validated config
//!
//! Loaded from `config.toml`. Every section falls back to defaults so a partial
//! file is enough.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::{Error, Result};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application settings
    pub app: AppConfig,

    /// Worker pool, registry and dedup settings
    pub dispatcher: DispatcherConfig,

    /// Admission controller gains and thresholds
    pub balancer: BalancerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Log level used when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Workers in each priority group
    pub workers_per_group: usize,

    /// Number of priority groups
    pub priority_groups: usize,

    /// Bound on query/command/event handler execution
    pub handler_timeout_ms: u64,

    /// Dead-letter ring buffer size
    pub dead_letter_capacity: usize,

    /// How long shutdown waits for workers before aborting them
    pub shutdown_grace_ms: u64,

    /// How long a message id is remembered by the dedup filter
    pub dedup_window_ms: u64,

    /// Max ids remembered by the dedup filter
    pub dedup_capacity: usize,

    /// Per-worker queue bound; producers wait when a queue is full
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers_per_group: 2,
            priority_groups: 3,
            handler_timeout_ms: 15_000,
            dead_letter_capacity: 100,
            shutdown_grace_ms: 5_000,
            dedup_window_ms: 60_000,
            dedup_capacity: 10_000,
            queue_capacity: 1_024,
        }
    }
}

impl DispatcherConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Proportional gain
    pub kp: f64,
    /// Integral gain
    pub ki: f64,
    /// Derivative gain
    pub kd: f64,
    /// Gain adaptation step
    pub learning_rate: f64,
    /// Integral decay applied every update (0.0-1.0)
    pub decay_rate: f64,
    /// Group count above which all counts are halved
    pub event_threshold: f64,
    /// Threshold multiplier applied after every registration
    pub threshold_growth_rate: f64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            kp: 0.3,
            ki: 0.6,
            kd: 0.1,
            learning_rate: 0.001,
            decay_rate: 0.99,
            event_threshold: 1e4,
            threshold_growth_rate: 1.1,
        }
    }
}

impl Config {
    /// Load from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults.
    pub fn load_default() -> Self {
        let candidates = [
            "config.toml",
            concat!(env!("CARGO_MANIFEST_DIR"), "/config.toml"),
        ];

        for path in &candidates {
            match Self::load(Path::new(path)) {
                Ok(cfg) => {
                    tracing::info!("Loaded config from {}", path);
                    return cfg;
                }
                Err(e) => tracing::debug!("Skipping {}: {}", path, e),
            }
        }

        tracing::warn!("No config.toml found, using defaults");
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.dispatcher;
        if d.workers_per_group == 0 {
            return Err(Error::Config("workers_per_group must be > 0".into()));
        }
        if d.priority_groups == 0 {
            return Err(Error::Config("priority_groups must be > 0".into()));
        }
        if d.handler_timeout_ms == 0 {
            return Err(Error::Config("handler_timeout_ms must be > 0".into()));
        }
        if d.dead_letter_capacity == 0 {
            return Err(Error::Config("dead_letter_capacity must be > 0".into()));
        }
        if d.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be > 0".into()));
        }

        let b = &self.balancer;
        if !(0.0..=1.0).contains(&b.decay_rate) {
            return Err(Error::Config(format!(
                "decay_rate {} outside 0.0-1.0",
                b.decay_rate
            )));
        }
        if b.threshold_growth_rate < 1.0 {
            return Err(Error::Config(format!(
                "threshold_growth_rate {} must be >= 1.0",
                b.threshold_growth_rate
            )));
        }
        Ok(())
    }
}
