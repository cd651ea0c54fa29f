//! Cardinality Metric Emitter
//!
//! Periodically reads an estimator and republishes its figures as Prometheus
//! metrics in a registry owned by the emitter. Lines published (with
//! `prefix = ce_cardinality`):
//!
//! ```text
//! ce_cardinality_total{namespace}
//! ce_cardinality_metric_count{namespace}
//! ce_cardinality_by_metric{metric_name, namespace}
//! ce_cardinality_fixed{metric_name, fixed_label1, fixed_label2, namespace}
//! ```
//!
//! The emitter only reads from the estimator.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use prometheus::core::Collector;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::interval;

use super::framework::{Service, ServiceError, ServiceStatus};
use crate::error::Result;
use crate::estimator::{decode_fixed_path, CardinalityEstimator};

/// How emitted values are typed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Representation {
    /// Latest value; stale lines are dropped each tick
    #[default]
    Gauge,
    /// Monotonic value; a decrease restarts the line
    Counter,
}

/// Emitter settings
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Metric name prefix
    pub prefix: String,
    /// Emission period
    pub interval: Duration,
    /// Value of the `namespace` label
    pub namespace: String,
    /// Cap on per-metric lines (0 = unlimited)
    pub top_n: usize,
    /// Floor for per-metric and fixed lines
    pub min_cardinality: u64,
    /// Publish per-metric lines
    pub emit_by_metric_name: bool,
    /// Publish the distinct metric count
    pub emit_metric_count: bool,
    /// Publish fixed-dimension lines
    pub emit_by_fixed: bool,
    /// Gauge or counter
    pub representation: Representation,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            prefix: "ce_cardinality".to_string(),
            interval: Duration::from_secs(10),
            namespace: String::new(),
            top_n: 1000,
            min_cardinality: 0,
            emit_by_metric_name: true,
            emit_metric_count: true,
            emit_by_fixed: false,
            representation: Representation::Gauge,
        }
    }
}

/// One metric family in either representation
enum Family {
    Gauge(IntGaugeVec),
    Counter(IntCounterVec),
}

impl Family {
    fn new(representation: Representation, name: String, help: &str, labels: &[&str]) -> Result<Self> {
        let opts = Opts::new(name, help);
        Ok(match representation {
            Representation::Gauge => Family::Gauge(IntGaugeVec::new(opts, labels)?),
            Representation::Counter => Family::Counter(IntCounterVec::new(opts, labels)?),
        })
    }

    fn collector(&self) -> Box<dyn Collector> {
        match self {
            Family::Gauge(vec) => Box::new(vec.clone()),
            Family::Counter(vec) => Box::new(vec.clone()),
        }
    }

    /// Drop every line (gauges only; counters keep their history)
    fn begin_tick(&self) {
        if let Family::Gauge(vec) = self {
            vec.reset();
        }
    }

    fn set(&self, labels: &[&str], value: u64) {
        match self {
            Family::Gauge(vec) => vec.with_label_values(labels).set(value as i64),
            Family::Counter(vec) => {
                let counter = vec.with_label_values(labels);
                let current = counter.get();
                if value >= current {
                    counter.inc_by(value - current);
                } else {
                    let _ = vec.remove_label_values(labels);
                    vec.with_label_values(labels).inc_by(value);
                }
            },
        }
    }
}

/// Publishes estimator figures into an isolated registry
pub struct CardinalityMetricEmitter {
    name: &'static str,
    estimator: Arc<CardinalityEstimator>,
    config: EmitterConfig,
    registry: Registry,
    total: Family,
    metric_count: Family,
    by_metric: Family,
    fixed: Family,
    status: RwLock<ServiceStatus>,
}

impl CardinalityMetricEmitter {
    /// Create an emitter and register its families
    pub fn new(estimator: Arc<CardinalityEstimator>, config: EmitterConfig) -> Result<Self> {
        Self::with_name("emitter", estimator, config)
    }

    /// Create an emitter registered under a custom service name
    pub fn with_name(
        name: &'static str,
        estimator: Arc<CardinalityEstimator>,
        config: EmitterConfig,
    ) -> Result<Self> {
        let repr = config.representation;
        let prefix = &config.prefix;

        let total = Family::new(
            repr,
            format!("{}_total", prefix),
            "Estimated number of distinct series across all metrics",
            &["namespace"],
        )?;
        let metric_count = Family::new(
            repr,
            format!("{}_metric_count", prefix),
            "Number of distinct metric names",
            &["namespace"],
        )?;
        let by_metric = Family::new(
            repr,
            format!("{}_by_metric", prefix),
            "Estimated number of distinct series per metric name",
            &["metric_name", "namespace"],
        )?;
        let fixed = Family::new(
            repr,
            format!("{}_fixed", prefix),
            "Estimated number of distinct series per fixed label combination",
            &["metric_name", "fixed_label1", "fixed_label2", "namespace"],
        )?;

        let registry = Registry::new();
        for family in [&total, &metric_count, &by_metric, &fixed] {
            registry.register(family.collector())?;
        }

        Ok(Self {
            name,
            estimator,
            config,
            registry,
            total,
            metric_count,
            by_metric,
            fixed,
            status: RwLock::new(ServiceStatus::Starting),
        })
    }

    /// Registry holding this emitter's families
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Read the estimator once and publish
    pub fn emit_once(&self) {
        let estimate = self.estimator.estimate_metrics_cardinality();
        let ns = self.config.namespace.as_str();

        for family in [&self.total, &self.metric_count, &self.by_metric, &self.fixed] {
            family.begin_tick();
        }

        self.total.set(&[ns], estimate.cardinality_total);

        if self.config.emit_metric_count {
            self.metric_count
                .set(&[ns], estimate.cardinality_desc_by_metric_name.len() as u64);
        }

        if self.config.emit_by_metric_name {
            let limit = match self.config.top_n {
                0 => usize::MAX,
                n => n,
            };
            for metric in estimate
                .cardinality_desc_by_metric_name
                .iter()
                .filter(|m| m.cardinality >= self.config.min_cardinality)
                .take(limit)
            {
                self.by_metric
                    .set(&[&metric.metric_name, ns], metric.cardinality);
            }
        }

        if self.config.emit_by_fixed {
            for (path, cardinality) in self.estimator.estimate_fixed_metric_cardinality() {
                if cardinality < self.config.min_cardinality {
                    continue;
                }
                match decode_fixed_path(&path) {
                    Some((metric, v1, v2)) => self.fixed.set(&[metric, v1, v2, ns], cardinality),
                    None => tracing::warn!(path = %path.escape_debug(), "Skipping malformed fixed path"),
                }
            }
        }

        tracing::trace!(
            emitter = self.name,
            total = estimate.cardinality_total,
            metrics = estimate.cardinality_desc_by_metric_name.len(),
            "Cardinality emitted"
        );
    }
}

#[async_trait::async_trait]
impl Service for CardinalityMetricEmitter {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> std::result::Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        tracing::debug!(
            emitter = self.name,
            prefix = %self.config.prefix,
            interval = ?self.config.interval,
            "Cardinality emitter started"
        );

        let mut ticker = interval(self.config.interval);

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            tracing::debug!(emitter = self.name, "Emitter received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(missed = n, "Emitter broadcast receiver lagged");
                        }
                    }
                }

                _ = ticker.tick() => {
                    self.emit_once();
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::debug!(emitter = self.name, "Cardinality emitter stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::{EstimatorOptions, FixedLabels};
    use crate::types::TimeSeries;
    use prometheus::{Encoder, TextEncoder};

    fn render(emitter: &CardinalityMetricEmitter) -> String {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&emitter.registry().gather(), &mut buf)
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn populated() -> Arc<CardinalityEstimator> {
        let ce = Arc::new(CardinalityEstimator::with_options(EstimatorOptions {
            shards: 4,
            fixed_labels: FixedLabels::new(Some("region".to_string()), None),
            ..Default::default()
        }));
        let mut batch = Vec::new();
        for i in 0..5 {
            batch.push(TimeSeries::with_metric(
                "big",
                [("region", "eu".to_string()), ("host", i.to_string())],
            ));
        }
        batch.push(TimeSeries::with_metric("small", [("host", "1")]));
        ce.insert_raw(&batch).unwrap();
        ce
    }

    #[test]
    fn test_gauge_emission() {
        let emitter = CardinalityMetricEmitter::new(
            populated(),
            EmitterConfig {
                namespace: "tenant-a".to_string(),
                emit_by_fixed: true,
                ..Default::default()
            },
        )
        .unwrap();

        emitter.emit_once();
        let text = render(&emitter);

        assert!(text.contains(r#"ce_cardinality_total{namespace="tenant-a"} 6"#));
        assert!(text.contains(r#"ce_cardinality_metric_count{namespace="tenant-a"} 2"#));
        assert!(text.contains(r#"ce_cardinality_by_metric{metric_name="big",namespace="tenant-a"} 5"#));
        assert!(text.contains(
            r#"ce_cardinality_fixed{fixed_label1="eu",fixed_label2="",metric_name="big",namespace="tenant-a"} 5"#
        ));
    }

    #[test]
    fn test_top_n_and_floor() {
        let emitter = CardinalityMetricEmitter::new(
            populated(),
            EmitterConfig {
                top_n: 1,
                min_cardinality: 2,
                ..Default::default()
            },
        )
        .unwrap();

        emitter.emit_once();
        let text = render(&emitter);

        assert!(text.contains(r#"metric_name="big""#));
        assert!(!text.contains(r#"metric_name="small""#));
        assert!(!text.contains("ce_cardinality_fixed"));
    }

    #[test]
    fn test_gauge_drops_stale_lines() {
        let ce = populated();
        let emitter = CardinalityMetricEmitter::new(ce.clone(), EmitterConfig::default()).unwrap();

        emitter.emit_once();
        ce.reset();
        emitter.emit_once();

        let text = render(&emitter);
        assert!(!text.contains("ce_cardinality_by_metric{"));
        assert!(text.contains(r#"ce_cardinality_total{namespace=""} 0"#));
    }

    #[test]
    fn test_counter_representation() {
        let ce = populated();
        let emitter = CardinalityMetricEmitter::new(
            ce.clone(),
            EmitterConfig {
                prefix: "ce_cardinality_count".to_string(),
                representation: Representation::Counter,
                ..Default::default()
            },
        )
        .unwrap();

        emitter.emit_once();
        emitter.emit_once();
        let text = render(&emitter);
        assert!(text.contains("# TYPE ce_cardinality_count_total counter"));
        assert!(text.contains(r#"ce_cardinality_count_total{namespace=""} 6"#));

        // a decrease restarts the line at the new value
        ce.reset();
        emitter.emit_once();
        assert!(render(&emitter).contains(r#"ce_cardinality_count_total{namespace=""} 0"#));
    }

    #[tokio::test]
    async fn test_service_lifecycle() {
        let emitter = Arc::new(
            CardinalityMetricEmitter::new(
                populated(),
                EmitterConfig {
                    interval: Duration::from_millis(10),
                    ..Default::default()
                },
            )
            .unwrap(),
        );

        let (tx, rx) = broadcast::channel(1);
        let task = {
            let emitter = emitter.clone();
            tokio::spawn(async move { emitter.start(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(render(&emitter).contains(r#"ce_cardinality_total{namespace=""} 6"#));

        tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }
}
