//! Kuba Cardinality - sharded HyperLogLog cardinality estimation for
//! time-series ingestion pipelines
//!
//! This library provides:
//! - A sharded estimator of distinct series per metric name, with optional
//!   fixed-dimension breakdowns and a global sketch budget
//! - Staggered fleet-wide resets driven by pushed schedules
//! - Prometheus publication of the estimates
//! - Fleet aggregation that fetches and merges node snapshots
//!
//! ```rust
//! use kuba_cardinality::{CardinalityEstimator, TimeSeries};
//!
//! let estimator = CardinalityEstimator::new();
//! estimator
//!     .insert(&[TimeSeries::with_metric("up", [("instance", "a")])])
//!     .unwrap();
//! assert_eq!(estimator.estimate_metrics_cardinality().cardinality_total, 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod estimator;
pub mod schedule;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Background services: reset operator, metric emitter and fleet aggregation
/// Provides service lifecycle management, graceful shutdown, and dependency ordering
pub mod services;

/// HTTP router and handlers for node and aggregator endpoints
pub mod server;

// Re-export main types
pub use error::{Error, Result};
pub use estimator::{CardinalityEstimator, EstimatorOptions, MetricsCardinality};
pub use schedule::ResetSchedule;
pub use types::{Label, TimeSeries};
