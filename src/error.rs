//! Error types for the cardinality estimator

use thiserror::Error;

/// Main error type for the estimator and its services
#[derive(Error, Debug)]
pub enum Error {
    /// The allocator refused to hand out another sketch
    ///
    /// This is an expected condition under load. Insertion call sites swallow
    /// it: the new metric or fixed-dimension combination is simply not tracked.
    #[error("max HLLs in use: limit is {max}")]
    MaxHllsInUse {
        /// Configured allocator ceiling
        max: u64,
    },

    /// Attempted to merge estimators of two different metrics
    #[error("metric name mismatch: expected {expected:?}, got {actual:?}")]
    MetricNameMismatch {
        /// Metric name of the receiving estimator
        expected: String,
        /// Metric name of the estimator being merged in
        actual: String,
    },

    /// Shard counts differ between two estimators or between an estimator
    /// and a binary snapshot
    #[error("mismatched shard counts: expected {expected}, got {actual}")]
    ShardCountMismatch {
        /// Shard count of the receiving estimator
        expected: usize,
        /// Shard count of the other side
        actual: usize,
    },

    /// Sketches with different precisions cannot be merged
    #[error("sketch precision mismatch: expected {expected}, got {actual}")]
    PrecisionMismatch {
        /// Precision of the receiving sketch
        expected: u8,
        /// Precision of the other sketch
        actual: u8,
    },

    /// Binary payload could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer request failed
    #[error("HTTP error: {0}")]
    Http(String),

    /// Metric registration or encoding failed
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Whether this error means the allocator is out of sketches
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Error::MaxHllsInUse { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
