//! HTTP API
//!
//! # Endpoints
//!
//! ## Node
//! - `GET|POST /api/v1/ce/binary` - Binary estimator snapshot
//! - `POST /api/v1/ce/schedule` - Install (`ResetSchedule`) or withdraw (`null`) the reset schedule
//! - `GET /api/v1/ce/cardinality[?type=fixed]` - Cardinality estimates
//! - `POST /api/v1/ce/reset` - Reset the estimator
//! - `POST /api/v1/ce/insert` - Insert a JSON batch of series
//!
//! ## Aggregator
//! - `GET /api/v1/ce/aggr/cardinality?type=gauge|counter`
//! - `GET|POST /api/v1/ce/aggr/binary?type=gauge|counter`
//!
//! ## Admin
//! - `GET /health` - Health check
//! - `GET /metrics` - Prometheus metrics

pub mod handlers;
pub mod types;

use std::sync::Arc;

use axum::{
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

pub use handlers::AppState;

/// Build the application router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health and metrics
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Node estimator
        .route(
            "/api/v1/ce/binary",
            get(handlers::binary).post(handlers::binary),
        )
        .route("/api/v1/ce/schedule", post(handlers::update_schedule))
        .route("/api/v1/ce/cardinality", get(handlers::cardinality))
        .route("/api/v1/ce/reset", post(handlers::reset))
        .route("/api/v1/ce/insert", post(handlers::insert))
        // Aggregator views
        .route(
            "/api/v1/ce/aggr/cardinality",
            get(handlers::aggr_cardinality),
        )
        .route(
            "/api/v1/ce/aggr/binary",
            get(handlers::aggr_binary).post(handlers::aggr_binary),
        )
        .with_state(state)
}

/// Build CORS layer from configuration
pub fn build_cors_layer(cors_origins: &[String]) -> CorsLayer {
    if cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> =
            cors_origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any)
    }
}
