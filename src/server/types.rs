//! Request and Response Types for the HTTP API

use std::collections::BTreeMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::TimeSeries;

// =============================================================================
// Health
// =============================================================================

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy` or `degraded`
    pub status: String,
    /// Crate version
    pub version: String,
    /// `node` or `aggregator`
    pub mode: String,
}

// =============================================================================
// Estimator API
// =============================================================================

/// Query parameters of the cardinality endpoints
#[derive(Debug, Default, Deserialize)]
pub struct CardinalityParams {
    /// `fixed` on the node endpoint, `gauge`/`counter` on the aggregator one
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// Convenience ingestion body
///
/// ```json
/// {"series": [{"labels": {"__name__": "up", "instance": "a"}}]}
/// ```
#[derive(Debug, Deserialize)]
pub struct InsertRequest {
    /// Series to insert
    pub series: Vec<InsertSeries>,
}

/// One series of an [`InsertRequest`]
#[derive(Debug, Deserialize)]
pub struct InsertSeries {
    /// Full label set, including `__name__`
    pub labels: BTreeMap<String, String>,
}

impl From<InsertSeries> for TimeSeries {
    fn from(series: InsertSeries) -> Self {
        TimeSeries::from_map(series.labels)
    }
}

/// Ingestion response
#[derive(Debug, Serialize, Deserialize)]
pub struct InsertResponse {
    /// Number of series accepted (before sampling)
    pub inserted: usize,
}

// =============================================================================
// Errors
// =============================================================================

/// JSON error body: `{"error": "..."}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human readable message
    pub error: String,
}

/// Handler error carrying its status code
#[derive(Debug)]
pub struct ApiError {
    /// Response status
    pub status: StatusCode,
    /// Message placed in the body
    pub message: String,
}

impl ApiError {
    /// 400 with `message`
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// 500 with `message`
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Decode(_)
            | Error::Configuration(_)
            | Error::ShardCountMismatch { .. }
            | Error::MetricNameMismatch { .. }
            | Error::PrecisionMismatch { .. } => ApiError::bad_request(e.to_string()),
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}
