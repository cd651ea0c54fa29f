//! Sharded, concurrency-safe cardinality estimator
//!
//! Metric names are partitioned across up to [`MAX_SHARDS`] shards by
//! FNV-1a hash. Each shard owns a map of metric name to
//! [`MetricCardinalityEstimator`] behind its own mutex, so inserts for
//! different metrics proceed in parallel.
//!
//! # Locking
//!
//! ```text
//! allocator: RwLock<Arc<Allocator>>     shared:    insert, estimate, marshal
//!                                       exclusive: reset, unmarshal, merge, replace
//!   └── shard[i].estimators: Mutex      held for one shard at a time
//! ```
//!
//! The estimator-level lock is always taken before any shard lock. Whole
//! estimator operations hold it exclusively, so two of them can never
//! interleave their per-shard lock acquisitions.
//!
//! # Example
//!
//! ```rust
//! use kuba_cardinality::estimator::CardinalityEstimator;
//! use kuba_cardinality::types::TimeSeries;
//!
//! let ce = CardinalityEstimator::new();
//! ce.insert_raw(&[
//!     TimeSeries::with_metric("up", [("instance", "a")]),
//!     TimeSeries::with_metric("up", [("instance", "b")]),
//! ]).unwrap();
//!
//! let estimate = ce.estimate_metrics_cardinality();
//! assert_eq!(estimate.cardinality_total, 2);
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use fnv::FnvHasher;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metrics;
use crate::types::TimeSeries;

use super::allocator::{Allocator, AllocatorStats};
use super::codec;
use super::metric::{FixedLabels, MetricCardinalityEstimator};
use super::scheduler::{InsertSequences, ShardMask, MAX_SHARDS};

// ============================================================================
// Options
// ============================================================================

/// Construction settings for a [`CardinalityEstimator`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstimatorOptions {
    /// Number of shards, in `1..=64`
    pub shards: usize,
    /// Ceiling on live sketches
    pub max_hlls_inuse: u64,
    /// Keep one in `sample_rate` batches
    pub sample_rate: u32,
    /// Fixed dimension label names
    pub fixed_labels: FixedLabels,
}

impl Default for EstimatorOptions {
    fn default() -> Self {
        Self {
            shards: MAX_SHARDS,
            max_hlls_inuse: u64::MAX,
            sample_rate: 1,
            fixed_labels: FixedLabels::default(),
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Cardinality of one metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricCardinality {
    /// Metric name
    pub metric_name: String,
    /// Estimated number of distinct series
    pub cardinality: u64,
}

/// Snapshot returned by [`CardinalityEstimator::estimate_metrics_cardinality`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsCardinality {
    /// Sum of every metric's cardinality
    pub cardinality_total: u64,
    /// Per-metric cardinalities, largest first
    pub cardinality_desc_by_metric_name: Vec<MetricCardinality>,
}

// ============================================================================
// Estimator
// ============================================================================

/// Per-thread buffers reused across insert batches
#[derive(Default)]
struct InsertScratch {
    routes: Vec<usize>,
    identity: Vec<u8>,
    path: String,
}

thread_local! {
    static INSERT_SCRATCH: RefCell<InsertScratch> = RefCell::new(InsertScratch::default());
}

#[derive(Debug)]
struct Shard {
    estimators: Mutex<HashMap<String, MetricCardinalityEstimator>>,
    /// Series inserted into this shard since creation
    inserted: AtomicU64,
    /// Prometheus label value, kept to avoid formatting on every batch
    label: String,
}

impl Shard {
    fn new(idx: usize) -> Self {
        Self {
            estimators: Mutex::new(HashMap::new()),
            inserted: AtomicU64::new(0),
            label: idx.to_string(),
        }
    }
}

/// Concurrency-safe cardinality estimator across all metrics
#[derive(Debug)]
pub struct CardinalityEstimator {
    shards: Vec<Shard>,
    sample_rate: u32,
    fixed_labels: FixedLabels,
    sequences: Arc<InsertSequences>,
    allocator: RwLock<Arc<Allocator>>,
}

impl CardinalityEstimator {
    /// Estimator with 64 shards, no allocation ceiling and no sampling
    pub fn new() -> Self {
        Self::with_options(EstimatorOptions::default())
    }

    /// Estimator with explicit settings
    ///
    /// # Panics
    /// Panics on a shard count outside `1..=64` or a zero sample rate. These
    /// can only come from misconfiguration.
    pub fn with_options(options: EstimatorOptions) -> Self {
        assert!(
            options.sample_rate > 0,
            "BUG: invalid estimator sample rate {}, must be > 0",
            options.sample_rate
        );
        let sequences = Arc::new(InsertSequences::new(options.shards));
        Self::build(&options, sequences)
    }

    fn build(options: &EstimatorOptions, sequences: Arc<InsertSequences>) -> Self {
        Self {
            shards: (0..options.shards).map(Shard::new).collect(),
            sample_rate: options.sample_rate,
            fixed_labels: options.fixed_labels.clone(),
            sequences,
            allocator: RwLock::new(Arc::new(Allocator::new(options.max_hlls_inuse))),
        }
    }

    /// Settings this estimator was built with (ceiling taken from the live allocator)
    pub fn options(&self) -> EstimatorOptions {
        EstimatorOptions {
            shards: self.shards.len(),
            max_hlls_inuse: self.allocator.read().max(),
            sample_rate: self.sample_rate,
            fixed_labels: self.fixed_labels.clone(),
        }
    }

    /// Empty estimator with the same settings, sharing the permutation pool
    ///
    /// Used for scratch estimators that receive peer snapshots.
    pub fn empty_like(&self) -> Self {
        Self::build(&self.options(), self.sequences.clone())
    }

    /// Number of shards
    pub fn shards_count(&self) -> usize {
        self.shards.len()
    }

    /// Snapshot of the current allocator counters
    pub fn allocator_stats(&self) -> AllocatorStats {
        self.allocator.read().stats()
    }

    /// Series inserted per shard
    pub fn shard_insert_counts(&self) -> Vec<u64> {
        self.shards
            .iter()
            .map(|s| s.inserted.load(Ordering::Relaxed))
            .collect()
    }

    /// Shard owning a metric name
    pub fn shard_index(&self, metric_name: &str) -> usize {
        let mut hasher = FnvHasher::default();
        hasher.write(metric_name.as_bytes());
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    // ========================================================================
    // Insertion
    // ========================================================================

    /// Insert a batch, keeping it with probability `1 / sample_rate`
    pub fn insert(&self, batch: &[TimeSeries]) -> Result<()> {
        if self.sample_rate > 1 && rand::rng().random_range(0..self.sample_rate) != 0 {
            return Ok(());
        }
        self.insert_raw(batch)
    }

    /// Insert a batch without sampling
    ///
    /// Shards are visited in a random order drawn per batch. Each touched
    /// shard is locked once and receives all of its series from the batch.
    pub fn insert_raw(&self, batch: &[TimeSeries]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        INSERT_SCRATCH.with_borrow_mut(|scratch| self.insert_with(batch, scratch))
    }

    fn insert_with(&self, batch: &[TimeSeries], scratch: &mut InsertScratch) -> Result<()> {
        let allocator = self.allocator.read();

        let InsertScratch {
            routes,
            identity,
            path,
        } = scratch;

        let mut mask = ShardMask::new();
        routes.clear();
        routes.extend(batch.iter().map(|series| {
            let idx = self.shard_index(series.metric_name());
            mask.set(idx);
            idx
        }));

        let mut total = 0u64;

        for shard_idx in self.sequences.random_iter() {
            if !mask.contains(shard_idx) {
                continue;
            }

            let shard = &self.shards[shard_idx];
            let mut inserted = 0u64;
            {
                let mut estimators = shard.estimators.lock();

                for (series, &route) in batch.iter().zip(routes.iter()) {
                    if route != shard_idx {
                        continue;
                    }

                    let metric_name = series.metric_name();
                    if !estimators.contains_key(metric_name) {
                        match MetricCardinalityEstimator::new(
                            metric_name.to_owned(),
                            Arc::clone(&allocator),
                        ) {
                            Ok(mce) => {
                                estimators.insert(metric_name.to_owned(), mce);
                            },
                            Err(e) if e.is_resource_exhausted() => continue,
                            Err(e) => return Err(e),
                        }
                    }

                    let Some(mce) = estimators.get_mut(metric_name) else {
                        continue;
                    };

                    identity.clear();
                    series.encode_identity(identity);
                    let fixed = self
                        .fixed_labels
                        .path_for(series, metric_name, path)
                        .then_some(path.as_str());

                    mce.insert(identity, fixed);
                    inserted += 1;
                }
            }

            if inserted > 0 {
                shard.inserted.fetch_add(inserted, Ordering::Relaxed);
                metrics::TIMESERIES_INSERTED_BY_SHARD
                    .with_label_values(&[&shard.label])
                    .inc_by(inserted);
                total += inserted;
            }
        }

        metrics::TIMESERIES_INSERTED.inc_by(total);
        Ok(())
    }

    // ========================================================================
    // Estimation
    // ========================================================================

    /// Per-metric cardinalities and their total
    ///
    /// Shards are locked one at a time. Since a metric name always lives in
    /// exactly one shard, no metric is counted twice.
    pub fn estimate_metrics_cardinality(&self) -> MetricsCardinality {
        let _allocator = self.allocator.read();

        let mut result = MetricsCardinality::default();
        for shard in &self.shards {
            let estimators = shard.estimators.lock();
            for mce in estimators.values() {
                let cardinality = mce.estimate_metric_cardinality();
                result.cardinality_total += cardinality;
                result.cardinality_desc_by_metric_name.push(MetricCardinality {
                    metric_name: mce.metric_name().to_owned(),
                    cardinality,
                });
            }
        }

        result.cardinality_desc_by_metric_name.sort_by(|a, b| {
            b.cardinality
                .cmp(&a.cardinality)
                .then_with(|| a.metric_name.cmp(&b.metric_name))
        });
        result
    }

    /// Cardinality of every fixed-dimension path
    pub fn estimate_fixed_metric_cardinality(&self) -> HashMap<String, u64> {
        let _allocator = self.allocator.read();

        let mut result = HashMap::new();
        for shard in &self.shards {
            let estimators = shard.estimators.lock();
            for mce in estimators.values() {
                result.extend(mce.estimate_fixed_metric_cardinality());
            }
        }
        result
    }

    // ========================================================================
    // Whole-estimator operations
    // ========================================================================

    /// Drop every metric and start over with a fresh allocator
    ///
    /// The allocation ceiling survives; `inuse` and `created` restart at zero.
    pub fn reset(&self) {
        let mut allocator = self.allocator.write();
        self.clear_locked(&mut allocator);
        metrics::RESETS.inc();
    }

    fn clear_locked(&self, allocator: &mut Arc<Allocator>) {
        for shard in &self.shards {
            *shard.estimators.lock() = HashMap::new();
        }
        *allocator = Arc::new(Allocator::new(allocator.max()));
    }

    /// Serialize the estimator
    ///
    /// Layout: header, `[shards u32]`, allocator record, then per shard
    /// `[inserted u64][entries u32]` followed by each metric estimator.
    pub fn marshal_binary(&self) -> Vec<u8> {
        let allocator = self.allocator.read();

        let mut buf = BytesMut::with_capacity(64 * 1024);
        codec::put_header(&mut buf);
        buf.put_u32_le(self.shards.len() as u32);
        allocator.stats().encode(&mut buf);

        for shard in &self.shards {
            let estimators = shard.estimators.lock();
            buf.put_u64_le(shard.inserted.load(Ordering::Relaxed));
            buf.put_u32_le(estimators.len() as u32);
            for mce in estimators.values() {
                mce.encode(&mut buf);
            }
        }

        buf.to_vec()
    }

    /// Replace this estimator's state with a serialized snapshot
    ///
    /// The payload is decoded completely before any state is touched, so a
    /// corrupt snapshot leaves the estimator unchanged.
    ///
    /// # Errors
    ///
    /// [`Error::ShardCountMismatch`] when the snapshot was taken with a
    /// different shard count, [`Error::Decode`] on any malformed input.
    pub fn unmarshal_binary(&self, data: &[u8]) -> Result<()> {
        let mut reader = data;

        codec::check_header(&mut reader)?;
        let shards = codec::get_u32(&mut reader, "shard count")? as usize;
        if shards != self.shards.len() {
            return Err(Error::ShardCountMismatch {
                expected: self.shards.len(),
                actual: shards,
            });
        }

        let allocator = Arc::new(Allocator::from_stats(AllocatorStats::decode(&mut reader)?));

        let mut decoded = Vec::with_capacity(shards);
        for shard_idx in 0..shards {
            let inserted = codec::get_u64(&mut reader, "shard insert count")?;
            let entries = codec::get_u32(&mut reader, "shard entries")? as usize;

            let mut estimators = HashMap::with_capacity(entries.min(4096));
            for _ in 0..entries {
                let mce = MetricCardinalityEstimator::decode(&mut reader, Arc::clone(&allocator))?;
                if self.shard_index(mce.metric_name()) != shard_idx {
                    return Err(Error::Decode(format!(
                        "metric {:?} stored in shard {} but belongs to shard {}",
                        mce.metric_name(),
                        shard_idx,
                        self.shard_index(mce.metric_name())
                    )));
                }
                estimators.insert(mce.metric_name().to_owned(), mce);
            }
            decoded.push((inserted, estimators));
        }

        if reader.has_remaining() {
            return Err(Error::Decode(format!(
                "{} trailing bytes after snapshot",
                reader.remaining()
            )));
        }

        let mut current = self.allocator.write();
        *current = allocator;
        for (shard, (inserted, estimators)) in self.shards.iter().zip(decoded) {
            *shard.estimators.lock() = estimators;
            shard.inserted.store(inserted, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Fold another estimator into this one
    ///
    /// Metrics present only in `other` are moved over and bound to this
    /// estimator's allocator. Insert counters are summed.
    ///
    /// # Errors
    ///
    /// [`Error::ShardCountMismatch`] when shard counts differ; a failed
    /// metric merge is reported as-is and leaves this estimator partially
    /// merged.
    pub fn merge(&self, other: CardinalityEstimator) -> Result<()> {
        self.check_shards(&other)?;
        let allocator = self.allocator.write();
        self.merge_locked(&allocator, other)
    }

    /// Clear this estimator and merge `other` into it in one step
    ///
    /// Readers never observe the intermediate empty state.
    pub fn replace(&self, other: CardinalityEstimator) -> Result<()> {
        self.check_shards(&other)?;
        let mut allocator = self.allocator.write();
        self.clear_locked(&mut allocator);
        for shard in &self.shards {
            shard.inserted.store(0, Ordering::Relaxed);
        }
        self.merge_locked(&allocator, other)
    }

    /// Deep copy of the current state
    pub fn snapshot(&self) -> CardinalityEstimator {
        let allocator = self.allocator.read();
        let copy_allocator = Arc::new(Allocator::from_stats(allocator.stats()));
        let copy = Self {
            shards: (0..self.shards.len()).map(Shard::new).collect(),
            sample_rate: self.sample_rate,
            fixed_labels: self.fixed_labels.clone(),
            sequences: Arc::clone(&self.sequences),
            allocator: RwLock::new(Arc::clone(&copy_allocator)),
        };

        for (src, dst) in self.shards.iter().zip(&copy.shards) {
            let estimators = src.estimators.lock();
            let mut cloned = HashMap::with_capacity(estimators.len());
            for (name, mce) in estimators.iter() {
                let mut mce = mce.clone();
                mce.rebind(Arc::clone(&copy_allocator));
                cloned.insert(name.clone(), mce);
            }
            *dst.estimators.lock() = cloned;
            dst.inserted
                .store(src.inserted.load(Ordering::Relaxed), Ordering::Relaxed);
        }

        copy
    }

    fn check_shards(&self, other: &CardinalityEstimator) -> Result<()> {
        if self.shards.len() != other.shards.len() {
            return Err(Error::ShardCountMismatch {
                expected: self.shards.len(),
                actual: other.shards.len(),
            });
        }
        Ok(())
    }

    fn merge_locked(&self, allocator: &Arc<Allocator>, other: CardinalityEstimator) -> Result<()> {
        let other_allocator = other.allocator.into_inner();
        allocator.merge(&other_allocator);

        for (shard, other_shard) in self.shards.iter().zip(other.shards) {
            let other_inserted = other_shard.inserted.into_inner();
            let mut estimators = shard.estimators.lock();

            for (name, mut other_mce) in other_shard.estimators.into_inner() {
                match estimators.get_mut(&name) {
                    Some(mce) => mce.merge(other_mce)?,
                    None => {
                        other_mce.rebind(Arc::clone(allocator));
                        estimators.insert(name, other_mce);
                    },
                }
            }

            shard.inserted.fetch_add(other_inserted, Ordering::Relaxed);
        }

        Ok(())
    }
}

impl Default for CardinalityEstimator {
    fn default() -> Self {
        Self::new()
    }
}
