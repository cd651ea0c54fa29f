//! Configuration management for the cardinality estimator
//!
//! This module provides configuration file support with TOML format,
//! environment variable overrides, and sensible defaults.
//!
//! ```toml
//! [server]
//! listen_addr = "0.0.0.0:8481"
//!
//! [estimator]
//! enabled = true
//! shards = 64
//! fixed_label1 = "region"
//!
//! [reset]
//! interval_secs = 86400
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::estimator::{EstimatorOptions, FixedLabels, MAX_SHARDS};
use crate::services::emitter::{EmitterConfig, Representation};
use crate::services::reset::ResetOperatorConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ApplicationConfig {
    /// HTTP server
    #[serde(default)]
    pub server: ServerConfig,

    /// Node-local estimator
    #[serde(default)]
    pub estimator: EstimatorConfig,

    /// Metric emission
    #[serde(default)]
    pub emitter: EmitterSettings,

    /// Reset operator
    #[serde(default)]
    pub reset: ResetConfig,

    /// Fleet aggregation
    #[serde(default)]
    pub aggregation: AggregationConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Log level used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// CORS allowed origins (empty = allow all)
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
}

/// Node-local estimator configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EstimatorConfig {
    /// Track cardinality of ingested series on this node
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Number of shards (1..=64)
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Ceiling on live sketches (unset = unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_hlls_inuse: Option<u64>,

    /// Keep one in N insert batches
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// First fixed dimension label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_label1: Option<String>,

    /// Second fixed dimension label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_label2: Option<String>,
}

/// Emitter configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmitterSettings {
    /// Publish estimates as Prometheus metrics
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Emission interval in seconds
    #[serde(default = "default_emit_interval_secs")]
    pub interval_secs: u64,

    /// Value of the `namespace` label on every emitted line
    #[serde(default)]
    pub namespace: String,

    /// Emit at most this many per-metric lines (0 = unlimited)
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Suppress per-metric and fixed lines below this cardinality
    #[serde(default)]
    pub min_cardinality: u64,

    /// Emit one line per metric name
    #[serde(default = "default_true")]
    pub emit_by_metric_name: bool,

    /// Emit the number of distinct metric names
    #[serde(default = "default_true")]
    pub emit_metric_count: bool,

    /// Emit one line per fixed-dimension combination
    #[serde(default)]
    pub emit_by_fixed: bool,

    /// Representation of node-local estimates
    #[serde(default)]
    pub representation: Representation,
}

/// Reset operator configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResetConfig {
    /// Autonomous reset interval in seconds (0 = disabled)
    #[serde(default = "default_reset_interval_secs")]
    pub interval_secs: u64,

    /// How often a pushed schedule is dropped unless refreshed
    #[serde(default = "default_janitor_interval_secs")]
    pub schedule_janitor_interval_secs: u64,

    /// How often the pushed schedule is checked
    #[serde(default = "default_check_interval_secs")]
    pub schedule_check_interval_secs: u64,
}

/// Fleet aggregation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregationConfig {
    /// Maintain the gauge view (last merge tick)
    #[serde(default)]
    pub gauge_enabled: bool,

    /// Maintain the counter view (cumulative)
    #[serde(default)]
    pub counter_enabled: bool,

    /// Window across which node resets are staggered, in seconds
    #[serde(default = "default_lookback_window_secs")]
    pub lookback_window_secs: u64,

    /// Peer addresses; `file:<path>` entries name a newline-delimited list
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Peer list refresh interval
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,

    /// Reset schedule push interval
    #[serde(default = "default_schedule_push_interval_secs")]
    pub schedule_push_interval_secs: u64,

    /// Fetch-and-merge interval
    #[serde(default = "default_merge_interval_secs")]
    pub merge_interval_secs: u64,

    /// Concurrent peer fetches per merge tick
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    /// Per-request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

// Default value functions
fn default_listen_addr() -> String { "0.0.0.0:8481".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_shards() -> usize { MAX_SHARDS }
fn default_sample_rate() -> u32 { 1 }
fn default_emit_interval_secs() -> u64 { 10 }
fn default_top_n() -> usize { 1000 }
fn default_reset_interval_secs() -> u64 { 0 }
fn default_janitor_interval_secs() -> u64 { 60 }
fn default_check_interval_secs() -> u64 { 1 }
fn default_lookback_window_secs() -> u64 { 300 }
fn default_discovery_interval_secs() -> u64 { 15 }
fn default_schedule_push_interval_secs() -> u64 { 1 }
fn default_merge_interval_secs() -> u64 { 30 }
fn default_fetch_concurrency() -> usize { 3 }
fn default_request_timeout_secs() -> u64 { 10 }
fn default_true() -> bool { true }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            log_level: default_log_level(),
            cors_allowed_origins: Vec::new(),
        }
    }
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shards: default_shards(),
            max_hlls_inuse: None,
            sample_rate: default_sample_rate(),
            fixed_label1: None,
            fixed_label2: None,
        }
    }
}

impl Default for EmitterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_emit_interval_secs(),
            namespace: String::new(),
            top_n: default_top_n(),
            min_cardinality: 0,
            emit_by_metric_name: true,
            emit_metric_count: true,
            emit_by_fixed: false,
            representation: Representation::default(),
        }
    }
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reset_interval_secs(),
            schedule_janitor_interval_secs: default_janitor_interval_secs(),
            schedule_check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            gauge_enabled: false,
            counter_enabled: false,
            lookback_window_secs: default_lookback_window_secs(),
            nodes: Vec::new(),
            discovery_interval_secs: default_discovery_interval_secs(),
            schedule_push_interval_secs: default_schedule_push_interval_secs(),
            merge_interval_secs: default_merge_interval_secs(),
            fetch_concurrency: default_fetch_concurrency(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl EstimatorConfig {
    /// Estimator construction settings
    pub fn options(&self) -> EstimatorOptions {
        EstimatorOptions {
            shards: self.shards,
            max_hlls_inuse: self.max_hlls_inuse.unwrap_or(u64::MAX),
            sample_rate: self.sample_rate,
            fixed_labels: FixedLabels::new(self.fixed_label1.clone(), self.fixed_label2.clone()),
        }
    }
}

impl EmitterSettings {
    /// Emitter settings for a given metric prefix and representation
    pub fn emitter_config(&self, prefix: &str, representation: Representation) -> EmitterConfig {
        EmitterConfig {
            prefix: prefix.to_string(),
            interval: Duration::from_secs(self.interval_secs),
            namespace: self.namespace.clone(),
            top_n: self.top_n,
            min_cardinality: self.min_cardinality,
            emit_by_metric_name: self.emit_by_metric_name,
            emit_metric_count: self.emit_metric_count,
            emit_by_fixed: self.emit_by_fixed,
            representation,
        }
    }
}

impl ResetConfig {
    /// Reset operator settings
    pub fn operator_config(&self) -> ResetOperatorConfig {
        ResetOperatorConfig {
            reset_interval: (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs)),
            janitor_interval: Duration::from_secs(self.schedule_janitor_interval_secs),
            check_interval: Duration::from_secs(self.schedule_check_interval_secs),
        }
    }
}

impl AggregationConfig {
    /// Whether either aggregate view is enabled
    pub fn is_enabled(&self) -> bool {
        self.gauge_enabled || self.counter_enabled
    }

    /// Lookback window as a duration
    pub fn lookback_window(&self) -> Duration {
        Duration::from_secs(self.lookback_window_secs)
    }
}

impl ApplicationConfig {
    /// Load configuration from a TOML file and apply environment overrides
    pub fn load(path: &str) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {}: {}", path, e))
        })?;

        Self::from_toml(&contents)
            .map_err(|e| Error::Configuration(format!("{} ({})", e, path)))
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| Error::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `CE_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        // Server
        if let Ok(addr) = std::env::var("CE_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Ok(level) = std::env::var("CE_LOG_LEVEL") {
            self.server.log_level = level;
        }

        // Estimator
        if let Some(v) = env_parse("CE_ENABLED")? {
            self.estimator.enabled = v;
        }
        if let Some(v) = env_parse("CE_SHARDS")? {
            self.estimator.shards = v;
        }
        if let Some(v) = env_parse("CE_MAX_HLLS_INUSE")? {
            self.estimator.max_hlls_inuse = Some(v);
        }
        if let Some(v) = env_parse("CE_SAMPLE_RATE")? {
            self.estimator.sample_rate = v;
        }
        if let Ok(label) = std::env::var("CE_FIXED_LABEL1") {
            self.estimator.fixed_label1 = Some(label);
        }
        if let Ok(label) = std::env::var("CE_FIXED_LABEL2") {
            self.estimator.fixed_label2 = Some(label);
        }

        // Emitter
        if let Ok(namespace) = std::env::var("CE_EMIT_NAMESPACE") {
            self.emitter.namespace = namespace;
        }
        if let Some(v) = env_parse("CE_EMIT_MIN_CARDINALITY")? {
            self.emitter.min_cardinality = v;
        }
        if let Some(v) = env_parse("CE_EMIT_TOP_N")? {
            self.emitter.top_n = v;
        }

        // Reset
        if let Some(v) = env_parse("CE_RESET_INTERVAL_SECS")? {
            self.reset.interval_secs = v;
        }

        // Aggregation
        if let Some(v) = env_parse("CE_AGGR_GAUGE_ENABLED")? {
            self.aggregation.gauge_enabled = v;
        }
        if let Some(v) = env_parse("CE_AGGR_COUNTER_ENABLED")? {
            self.aggregation.counter_enabled = v;
        }
        if let Some(v) = env_parse("CE_AGGR_LOOKBACK_WINDOW_SECS")? {
            self.aggregation.lookback_window_secs = v;
        }
        if let Ok(nodes) = std::env::var("CE_AGGR_NODES") {
            self.aggregation.nodes = nodes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let est = &self.estimator;
        if est.shards == 0 || est.shards > MAX_SHARDS {
            return Err(Error::Configuration(format!(
                "estimator.shards must be in 1..={}, got {}",
                MAX_SHARDS, est.shards
            )));
        }
        if est.sample_rate == 0 {
            return Err(Error::Configuration(
                "estimator.sample_rate must be > 0".to_string(),
            ));
        }

        if self.emitter.enabled && self.emitter.interval_secs == 0 {
            return Err(Error::Configuration(
                "emitter.interval_secs must be > 0".to_string(),
            ));
        }

        if self.reset.schedule_janitor_interval_secs == 0 || self.reset.schedule_check_interval_secs == 0 {
            return Err(Error::Configuration(
                "reset schedule intervals must be > 0".to_string(),
            ));
        }

        let aggr = &self.aggregation;
        if aggr.is_enabled() {
            if est.enabled {
                return Err(Error::Configuration(
                    "estimator and aggregation cannot both be enabled".to_string(),
                ));
            }
            if aggr.nodes.is_empty() {
                return Err(Error::Configuration(
                    "aggregation requires at least one node".to_string(),
                ));
            }
            if aggr.lookback_window_secs == 0 {
                return Err(Error::Configuration(
                    "aggregation.lookback_window_secs must be > 0".to_string(),
                ));
            }
            if aggr.fetch_concurrency == 0 {
                return Err(Error::Configuration(
                    "aggregation.fetch_concurrency must be > 0".to_string(),
                ));
            }
            if aggr.discovery_interval_secs == 0
                || aggr.schedule_push_interval_secs == 0
                || aggr.merge_interval_secs == 0
            {
                return Err(Error::Configuration(
                    "aggregation intervals must be > 0".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents)?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Configuration(format!("Invalid {}={:?}: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}
