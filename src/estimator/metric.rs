//! Per-metric cardinality estimator
//!
//! One [`MetricCardinalityEstimator`] exists per distinct metric name. It
//! holds a sketch counting every series of the metric plus one sketch per
//! observed combination of the (up to two) fixed label values.
//!
//! Fixed-dimension sketches are keyed by a path string:
//!
//! ```text
//! metric_name \x00 fixed_value_1 \x00 fixed_value_2
//! ```
//!
//! Nothing here is internally synchronized. The owning shard's mutex guards
//! every access.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};
use crate::types::{TimeSeries, SEPARATOR};

use super::allocator::{Allocator, AllocatorStats};
use super::codec;
use super::hll::Sketch;

const SEP: char = SEPARATOR as char;

/// Write the fixed-dimension path for `(metric, v1, v2)` into `buf`
pub fn write_fixed_path(buf: &mut String, metric_name: &str, value1: &str, value2: &str) {
    buf.clear();
    buf.reserve(metric_name.len() + value1.len() + value2.len() + 2);
    buf.push_str(metric_name);
    buf.push(SEP);
    buf.push_str(value1);
    buf.push(SEP);
    buf.push_str(value2);
}

/// Encode a fixed-dimension path
pub fn encode_fixed_path(metric_name: &str, value1: &str, value2: &str) -> String {
    let mut path = String::new();
    write_fixed_path(&mut path, metric_name, value1, value2);
    path
}

/// Split a fixed-dimension path back into `(metric, v1, v2)`
///
/// Returns `None` when the path does not contain exactly two separators.
pub fn decode_fixed_path(path: &str) -> Option<(&str, &str, &str)> {
    let mut parts = path.split(SEP);
    let metric = parts.next()?;
    let value1 = parts.next()?;
    let value2 = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((metric, value1, value2))
}

/// Names of the labels that define the fixed dimensions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixedLabels {
    /// First fixed label name
    pub label1: Option<String>,
    /// Second fixed label name
    pub label2: Option<String>,
}

impl FixedLabels {
    /// Create from optional label names; empty names count as unset
    pub fn new(label1: Option<String>, label2: Option<String>) -> Self {
        Self {
            label1: label1.filter(|l| !l.is_empty()),
            label2: label2.filter(|l| !l.is_empty()),
        }
    }

    /// Whether any fixed dimension is configured
    pub fn is_enabled(&self) -> bool {
        self.label1.is_some() || self.label2.is_some()
    }

    /// Build the fixed path of `series` into `buf`
    ///
    /// Returns false when no fixed dimension is configured. A configured
    /// label missing from the series contributes an empty value.
    pub fn path_for(&self, series: &TimeSeries, metric_name: &str, buf: &mut String) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let value = |label: &Option<String>| {
            label
                .as_deref()
                .and_then(|name| series.label_value(name))
                .unwrap_or("")
        };
        write_fixed_path(buf, metric_name, value(&self.label1), value(&self.label2));
        true
    }
}

/// Cardinality estimator for a single metric name
#[derive(Debug, Clone)]
pub struct MetricCardinalityEstimator {
    /// Owned copy of the metric name; never borrows from a request buffer
    metric_name: String,
    /// Sketch over every series of this metric
    metric_hll: Sketch,
    /// Fixed-dimension path -> sketch
    hlls: HashMap<String, Sketch>,
    /// Allocator for lazily created fixed-dimension sketches
    allocator: Arc<Allocator>,
}

impl MetricCardinalityEstimator {
    /// Create an estimator, allocating its metric-level sketch
    ///
    /// # Errors
    ///
    /// Propagates [`Error::MaxHllsInUse`]; callers treat it as "do not track
    /// this metric", not as a failure.
    pub fn new(metric_name: String, allocator: Arc<Allocator>) -> Result<Self> {
        let metric_hll = allocator.allocate()?;
        Ok(Self {
            metric_name,
            metric_hll,
            hlls: HashMap::new(),
            allocator,
        })
    }

    /// Metric name this estimator tracks
    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    /// Record one series
    ///
    /// `identity` is the encoded label set of the series. When `fixed_path`
    /// is given the series also lands in that path's sketch, which is
    /// allocated on first use. If the allocator is exhausted the combination
    /// is skipped silently.
    pub fn insert(&mut self, identity: &[u8], fixed_path: Option<&str>) {
        self.metric_hll.insert(identity);

        let Some(path) = fixed_path else {
            return;
        };

        if let Some(sketch) = self.hlls.get_mut(path) {
            sketch.insert(identity);
            return;
        }

        match self.allocator.allocate() {
            Ok(mut sketch) => {
                sketch.insert(identity);
                self.hlls.insert(path.to_owned(), sketch);
            },
            Err(e) => {
                tracing::trace!(metric = %self.metric_name, error = %e, "Fixed-dimension sketch not tracked");
            },
        }
    }

    /// Estimated number of distinct series of this metric
    pub fn estimate_metric_cardinality(&self) -> u64 {
        self.metric_hll.estimate()
    }

    /// Estimated cardinality per fixed-dimension path
    pub fn estimate_fixed_metric_cardinality(&self) -> HashMap<String, u64> {
        self.hlls
            .iter()
            .map(|(path, sketch)| (path.clone(), sketch.estimate()))
            .collect()
    }

    /// Number of sketches owned by this estimator
    pub fn sketch_count(&self) -> usize {
        1 + self.hlls.len()
    }

    /// Point this estimator at a different allocator
    pub(crate) fn rebind(&mut self, allocator: Arc<Allocator>) {
        self.allocator = allocator;
    }

    /// Merge another estimator of the same metric into this one
    ///
    /// Sketches present only on the other side are moved over as-is.
    ///
    /// # Errors
    ///
    /// [`Error::MetricNameMismatch`] when the names differ.
    pub fn merge(&mut self, other: MetricCardinalityEstimator) -> Result<()> {
        if self.metric_name != other.metric_name {
            return Err(Error::MetricNameMismatch {
                expected: self.metric_name.clone(),
                actual: other.metric_name,
            });
        }

        self.metric_hll.merge(&other.metric_hll)?;

        for (path, sketch) in other.hlls {
            match self.hlls.get_mut(&path) {
                Some(existing) => existing.merge(&sketch)?,
                None => {
                    self.hlls.insert(path, sketch);
                },
            }
        }

        Ok(())
    }

    /// Encode as `[name][metric sketch][count]{[path][sketch]}[allocator]`
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        codec::put_str(buf, &self.metric_name);
        self.metric_hll.encode(buf);
        buf.put_u32_le(self.hlls.len() as u32);
        for (path, sketch) in &self.hlls {
            codec::put_str(buf, path);
            sketch.encode(buf);
        }
        self.allocator.stats().encode(buf);
    }

    /// Decode an estimator and bind it to `allocator`
    ///
    /// The embedded allocator record is validated but not used: all metrics
    /// of one estimator share the estimator-level allocator.
    pub fn decode<B: Buf>(buf: &mut B, allocator: Arc<Allocator>) -> Result<Self> {
        let metric_name = codec::get_string(buf, "metric name")?;
        let metric_hll = Sketch::decode(buf)?;

        let count = codec::get_u32(buf, "fixed sketch count")? as usize;
        let mut hlls = HashMap::with_capacity(count.min(1024));
        for _ in 0..count {
            let path = codec::get_string(buf, "fixed path")?;
            let sketch = Sketch::decode(buf)?;
            hlls.insert(path, sketch);
        }

        AllocatorStats::decode(buf)?;

        Ok(Self {
            metric_name,
            metric_hll,
            hlls,
            allocator,
        })
    }
}
