//! Cardinality estimation engine
//!
//! # Architecture
//!
//! ```text
//! CardinalityEstimator
//!   ├── Allocator (bounded sketch admission)
//!   └── Shard[0..N] (FNV-1a(metric) mod N)
//!         └── metric name -> MetricCardinalityEstimator
//!               ├── metric sketch
//!               └── fixed path -> sketch
//! ```
//!
//! Batches visit shards in a random order drawn from [`scheduler`].

pub mod allocator;
pub mod cardinality;
pub mod codec;
pub mod hll;
pub mod metric;
pub mod scheduler;

pub use allocator::{Allocator, AllocatorStats};
pub use cardinality::{CardinalityEstimator, EstimatorOptions, MetricCardinality, MetricsCardinality};
pub use hll::Sketch;
pub use metric::{decode_fixed_path, encode_fixed_path, FixedLabels, MetricCardinalityEstimator};
pub use scheduler::{InsertSequences, RandomShardIterator, ShardMask, MAX_SHARDS};
