//! HTTP Handlers for the Cardinality Estimator Server
//!
//! Node endpoints expose the local estimator; the `aggr` endpoints expose the
//! aggregator's gauge and counter views. A process runs either role, so the
//! endpoints of the other role answer 400.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use prometheus::Registry;
use tracing::{debug, info, warn};

use super::types::*;
use crate::estimator::CardinalityEstimator;
use crate::metrics;
use crate::schedule::ResetSchedule;
use crate::services::{AggregateViews, ResetOperator, SharedServiceManager, ViewKind};
use crate::types::TimeSeries;

// =============================================================================
// Application State
// =============================================================================

/// Shared state behind every handler
pub struct AppState {
    /// Node-local estimator (absent on an aggregator)
    pub estimator: Option<Arc<CardinalityEstimator>>,
    /// Receives pushed reset schedules for the node estimator
    pub reset_operator: Option<Arc<ResetOperator>>,
    /// Aggregator views (both absent on a node)
    pub aggregate: AggregateViews,
    /// Emitter registries appended to `/metrics`
    pub registries: Vec<Registry>,
    /// Background services, consulted by `/health`
    pub services: Option<SharedServiceManager>,
    /// Process start, for the uptime gauge
    pub started_at: Instant,
}

impl AppState {
    /// State of a node serving `estimator`
    pub fn node(estimator: Arc<CardinalityEstimator>, reset_operator: Option<Arc<ResetOperator>>) -> Self {
        Self {
            estimator: Some(estimator),
            reset_operator,
            aggregate: AggregateViews::default(),
            registries: Vec::new(),
            services: None,
            started_at: Instant::now(),
        }
    }

    /// State of an aggregator serving `views`
    pub fn aggregator(views: AggregateViews) -> Self {
        Self {
            estimator: None,
            reset_operator: None,
            aggregate: views,
            registries: Vec::new(),
            services: None,
            started_at: Instant::now(),
        }
    }

    fn estimator(&self) -> Result<&Arc<CardinalityEstimator>, ApiError> {
        self.estimator
            .as_ref()
            .ok_or_else(|| ApiError::bad_request("Cardinality estimator is disabled"))
    }

    fn view(&self, params: &CardinalityParams) -> Result<&Arc<CardinalityEstimator>, ApiError> {
        if !self.aggregate.is_enabled() {
            return Err(ApiError::bad_request(
                "Cardinality estimator aggregation is disabled",
            ));
        }

        let kind: ViewKind = params.kind.as_deref().unwrap_or("").parse()?;
        self.aggregate
            .get(kind)
            .ok_or_else(|| ApiError::bad_request(format!("{} aggregation is disabled", kind)))
    }
}

fn octet_stream(data: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "application/octet-stream")], data).into_response()
}

// =============================================================================
// Health & Metrics
// =============================================================================

/// Health check endpoint
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let healthy = state
        .services
        .as_ref()
        .map_or(true, |services| services.is_healthy());
    let mode = if state.estimator.is_some() {
        "node"
    } else {
        "aggregator"
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            mode: mode.to_string(),
        }),
    )
}

/// Prometheus metrics: process self-metrics followed by emitted cardinalities
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    metrics::update_uptime(state.started_at.elapsed().as_secs_f64());

    let registries: Vec<&Registry> = state.registries.iter().collect();
    match metrics::gather_metrics_with(&registries) {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => ApiError::internal(e).into_response(),
    }
}

// =============================================================================
// Node Estimator
// =============================================================================

/// Binary snapshot of the node estimator
pub async fn binary(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let data = state.estimator()?.marshal_binary();
    debug!(bytes = data.len(), "Serving estimator snapshot");
    Ok(octet_stream(data))
}

/// Install or withdraw (`null`) the pushed reset schedule
pub async fn update_schedule(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let operator = state
        .reset_operator
        .as_ref()
        .ok_or_else(|| ApiError::bad_request("Cardinality estimator is disabled"))?;

    let schedule: Option<ResetSchedule> = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("Invalid reset schedule: {}", e)))?;
    if let Some(schedule) = &schedule {
        schedule.validate()?;
    }

    operator.update_schedule(schedule);
    Ok(StatusCode::OK)
}

/// Per-metric cardinalities, or fixed-dimension ones with `type=fixed`
pub async fn cardinality(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CardinalityParams>,
) -> Result<Response, ApiError> {
    let estimator = state.estimator()?;
    if params.kind.as_deref() == Some("fixed") {
        return Ok(Json(estimator.estimate_fixed_metric_cardinality()).into_response());
    }
    Ok(Json(estimator.estimate_metrics_cardinality()).into_response())
}

/// Reset the node estimator
pub async fn reset(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    state.estimator()?.reset();
    info!("Estimator reset via API");
    Ok(StatusCode::OK)
}

/// Insert a JSON batch of series
pub async fn insert(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<InsertRequest>, JsonRejection>,
) -> Result<Json<InsertResponse>, ApiError> {
    let estimator = state.estimator()?;
    let Json(request) = payload.map_err(|e| {
        warn!(error = %e, "Rejected insert body");
        ApiError::bad_request(e.body_text())
    })?;

    let batch: Vec<TimeSeries> = request.series.into_iter().map(TimeSeries::from).collect();
    estimator.insert(&batch)?;

    Ok(Json(InsertResponse {
        inserted: batch.len(),
    }))
}

// =============================================================================
// Aggregator Views
// =============================================================================

/// Per-metric cardinalities of the `type=gauge|counter` view
pub async fn aggr_cardinality(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CardinalityParams>,
) -> Result<Response, ApiError> {
    let view = state.view(&params)?;
    Ok(Json(view.estimate_metrics_cardinality()).into_response())
}

/// Binary snapshot of the `type=gauge|counter` view
pub async fn aggr_binary(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CardinalityParams>,
) -> Result<Response, ApiError> {
    let view = state.view(&params)?;
    Ok(octet_stream(view.marshal_binary()))
}
