//! Core data types fed into the estimator
//!
//! # Key Types
//!
//! - **`Label`**: A single `name=value` pair attached to a series
//! - **`TimeSeries`**: An ingested series, identified by its full label set
//!
//! The metric name travels as the `__name__` label, the way remote-write
//! payloads carry it. Parsers upstream of the estimator produce these values;
//! the estimator only reads them.
//!
//! # Example
//!
//! ```rust
//! use kuba_cardinality::types::{Label, TimeSeries};
//!
//! let series = TimeSeries::new(vec![
//!     Label::new("__name__", "http_requests_total"),
//!     Label::new("instance", "server1"),
//! ]);
//! assert_eq!(series.metric_name(), "http_requests_total");
//! assert_eq!(series.label_value("instance"), Some("server1"));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the label holding the metric name
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Separator used by every `\x00`-joined encoding in this crate
///
/// Ingestion formats never allow this byte in label names or values, which
/// keeps the encodings unambiguous.
pub const SEPARATOR: u8 = 0;

/// A single label of a time series
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    /// Label name
    pub name: String,
    /// Label value
    pub value: String,
}

impl Label {
    /// Create a new label
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:?}", self.name, self.value)
    }
}

/// An ingested time series
///
/// Samples are irrelevant to cardinality and are not carried here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Full label set, including `__name__`
    pub labels: Vec<Label>,
}

impl TimeSeries {
    /// Create a series from its labels
    pub fn new(labels: Vec<Label>) -> Self {
        Self { labels }
    }

    /// Create a series from a metric name and additional `(name, value)` pairs
    pub fn with_metric<I, K, V>(metric_name: &str, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut all = vec![Label::new(METRIC_NAME_LABEL, metric_name)];
        all.extend(labels.into_iter().map(|(k, v)| Label::new(k, v)));
        Self { labels: all }
    }

    /// Build a series from a label map (used by the JSON ingestion endpoint)
    pub fn from_map(labels: BTreeMap<String, String>) -> Self {
        Self {
            labels: labels
                .into_iter()
                .map(|(name, value)| Label { name, value })
                .collect(),
        }
    }

    /// Value of the `__name__` label, or the empty string when absent
    pub fn metric_name(&self) -> &str {
        self.label_value(METRIC_NAME_LABEL).unwrap_or("")
    }

    /// Value of the first label named `name`
    pub fn label_value(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// Append the series identity to `buf`
    ///
    /// Every label except `__name__` contributes `name \x00 value \x00`. The
    /// metric name is left out since each metric already has its own sketch.
    pub fn encode_identity(&self, buf: &mut Vec<u8>) {
        for label in &self.labels {
            if label.name == METRIC_NAME_LABEL {
                continue;
            }
            buf.extend_from_slice(label.name.as_bytes());
            buf.push(SEPARATOR);
            buf.extend_from_slice(label.value.as_bytes());
            buf.push(SEPARATOR);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_name_missing() {
        let series = TimeSeries::new(vec![Label::new("job", "node")]);
        assert_eq!(series.metric_name(), "");
    }

    #[test]
    fn test_identity_skips_metric_name() {
        let series = TimeSeries::with_metric("up", [("job", "node"), ("instance", "a")]);

        let mut buf = Vec::new();
        series.encode_identity(&mut buf);

        assert_eq!(buf, b"job\x00node\x00instance\x00a\x00".to_vec());
    }

    #[test]
    fn test_identity_distinguishes_label_boundaries() {
        let a = TimeSeries::with_metric("m", [("ab", "c")]);
        let b = TimeSeries::with_metric("m", [("a", "bc")]);

        let (mut buf_a, mut buf_b) = (Vec::new(), Vec::new());
        a.encode_identity(&mut buf_a);
        b.encode_identity(&mut buf_b);

        assert_ne!(buf_a, buf_b);
    }

    #[test]
    fn test_from_map() {
        let mut labels = BTreeMap::new();
        labels.insert("__name__".to_string(), "cpu".to_string());
        labels.insert("host".to_string(), "h1".to_string());

        let series = TimeSeries::from_map(labels);
        assert_eq!(series.metric_name(), "cpu");
        assert_eq!(series.labels.len(), 2);
    }
}
