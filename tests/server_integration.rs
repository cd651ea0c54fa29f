//! HTTP Server Integration Tests
//!
//! Drives the router with `tower::ServiceExt::oneshot`, without binding a
//! socket.
//!
//! # Test Coverage
//!
//! 1. **Health / Metrics** - GET /health, GET /metrics
//! 2. **Node Estimator** - insert, cardinality, binary snapshot, reset
//! 3. **Reset Schedule** - install, withdraw, method and body validation
//! 4. **Aggregator Views** - type selection, disabled views
//! 5. **Error Handling** - JSON error bodies

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use kuba_cardinality::{
    estimator::{CardinalityEstimator, EstimatorOptions, FixedLabels},
    schedule::ResetSchedule,
    server::{build_router, AppState},
    services::{
        AggregateViews, CardinalityMetricEmitter, EmitterConfig, ResetOperator,
        ResetOperatorConfig,
    },
    TimeSeries,
};
use serde_json::{json, Value};
use tower::ServiceExt;

// =============================================================================
// Helper Functions
// =============================================================================

struct Node {
    app: Router,
    estimator: Arc<CardinalityEstimator>,
    operator: Arc<ResetOperator>,
}

fn node_with(options: EstimatorOptions) -> Node {
    let estimator = Arc::new(CardinalityEstimator::with_options(options));
    let operator = Arc::new(ResetOperator::new(
        estimator.clone(),
        ResetOperatorConfig::default(),
    ));
    let state = AppState::node(estimator.clone(), Some(operator.clone()));
    Node {
        app: build_router(Arc::new(state)),
        estimator,
        operator,
    }
}

fn node() -> Node {
    node_with(EstimatorOptions {
        shards: 8,
        ..Default::default()
    })
}

fn aggregator(gauge: bool, counter: bool) -> (Router, AggregateViews) {
    let make = || {
        Arc::new(CardinalityEstimator::with_options(EstimatorOptions {
            shards: 8,
            ..Default::default()
        }))
    };
    let views = AggregateViews {
        gauge: gauge.then(make),
        counter: counter.then(make),
    };
    let state = AppState::aggregator(views.clone());
    (build_router(Arc::new(state)), views)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Vec<u8>) {
    send(
        app,
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

async fn post_empty(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    send(app, Request::post(uri).body(Body::empty()).unwrap()).await
}

fn json_body(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

fn insert_body(instances: &[&str]) -> Value {
    let series: Vec<Value> = instances
        .iter()
        .map(|i| {
            json!({"labels": {"__name__": "up", "instance": i, "region": "eu", "env": "prod"}})
        })
        .collect();
    json!({ "series": series })
}

// =============================================================================
// Health & Metrics
// =============================================================================

#[tokio::test]
async fn test_health() {
    let node = node();
    let (status, body) = get(&node.app, "/health").await;
    assert_eq!(status, StatusCode::OK);

    let body = json_body(&body);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["mode"], "node");

    let (app, _) = aggregator(true, false);
    let (_, body) = get(&app, "/health").await;
    assert_eq!(json_body(&body)["mode"], "aggregator");
}

#[tokio::test]
async fn test_metrics_includes_emitter_registry() {
    let estimator = Arc::new(CardinalityEstimator::with_options(EstimatorOptions {
        shards: 4,
        ..Default::default()
    }));
    estimator
        .insert_raw(&[TimeSeries::with_metric("up", [("instance", "a")])])
        .unwrap();

    let emitter = CardinalityMetricEmitter::new(
        estimator.clone(),
        EmitterConfig {
            prefix: "it_cardinality".to_string(),
            interval: Duration::from_secs(10),
            ..Default::default()
        },
    )
    .unwrap();
    emitter.emit_once();

    let mut state = AppState::node(estimator, None);
    state.registries.push(emitter.registry().clone());
    let app = build_router(Arc::new(state));

    let (status, body) = get(&app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("ce_timeseries_inserted_total"));
    assert!(text.contains("it_cardinality_total{namespace=\"\"} 1"));
    assert!(text.contains("it_cardinality_by_metric{metric_name=\"up\",namespace=\"\"} 1"));
}

// =============================================================================
// Node Estimator
// =============================================================================

#[tokio::test]
async fn test_insert_then_cardinality() {
    let node = node();

    let (status, body) = post_json(&node.app, "/api/v1/ce/insert", insert_body(&["a", "b", "c"])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["inserted"], 3);

    let (status, body) = get(&node.app, "/api/v1/ce/cardinality").await;
    assert_eq!(status, StatusCode::OK);

    let body = json_body(&body);
    assert_eq!(body["cardinality_total"], 3);
    assert_eq!(body["cardinality_desc_by_metric_name"][0]["metric_name"], "up");
    assert_eq!(body["cardinality_desc_by_metric_name"][0]["cardinality"], 3);
}

#[tokio::test]
async fn test_insert_rejects_malformed_body() {
    let node = node();
    let (status, body) = post_json(&node.app, "/api/v1/ce/insert", json!({"rows": []})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json_body(&body)["error"].is_string());
}

#[tokio::test]
async fn test_fixed_cardinality() {
    let node = node_with(EstimatorOptions {
        shards: 8,
        fixed_labels: FixedLabels::new(Some("region".to_string()), Some("env".to_string())),
        ..Default::default()
    });
    post_json(&node.app, "/api/v1/ce/insert", insert_body(&["a", "b"])).await;

    let (status, body) = get(&node.app, "/api/v1/ce/cardinality?type=fixed").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body), json!({"up\u{0}eu\u{0}prod": 2}));
}

#[tokio::test]
async fn test_binary_snapshot_round_trip() {
    let node = node();
    post_json(&node.app, "/api/v1/ce/insert", insert_body(&["a", "b"])).await;

    for request in [
        Request::get("/api/v1/ce/binary").body(Body::empty()).unwrap(),
        Request::post("/api/v1/ce/binary").body(Body::empty()).unwrap(),
    ] {
        let response = node.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );

        let data = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let copy = node.estimator.empty_like();
        copy.unmarshal_binary(&data).unwrap();
        assert_eq!(
            copy.estimate_metrics_cardinality(),
            node.estimator.estimate_metrics_cardinality()
        );
    }
}

#[tokio::test]
async fn test_reset() {
    let node = node();
    post_json(&node.app, "/api/v1/ce/insert", insert_body(&["a"])).await;

    let (status, _) = post_empty(&node.app, "/api/v1/ce/reset").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        node.estimator.estimate_metrics_cardinality().cardinality_total,
        0
    );
}

// =============================================================================
// Reset Schedule
// =============================================================================

#[tokio::test]
async fn test_schedule_install_and_withdraw() {
    let node = node();
    let schedule = ResetSchedule::new(Duration::from_secs(300), 4, 1);

    let (status, _) = post_json(
        &node.app,
        "/api/v1/ce/schedule",
        serde_json::to_value(schedule).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(node.operator.schedule(), Some(schedule));

    let (status, _) = post_json(&node.app, "/api/v1/ce/schedule", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(node.operator.schedule(), None);
}

#[tokio::test]
async fn test_schedule_rejects_bad_requests() {
    let node = node();

    let (status, _) = get(&node.app, "/api/v1/ce/schedule").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    let (status, body) = send(
        &node.app,
        Request::post("/api/v1/ce/schedule")
            .body(Body::from("{not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json_body(&body)["error"].is_string());

    // index 4 of 4 falls outside the interval
    let (status, _) = post_json(
        &node.app,
        "/api/v1/ce/schedule",
        json!({"resetInterval": 300_000_000_000u64, "quantum": 75_000_000_000u64, "index": 4}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(node.operator.schedule(), None);
}

// =============================================================================
// Aggregator Views
// =============================================================================

#[tokio::test]
async fn test_aggr_endpoints_disabled_on_node() {
    let node = node();
    for uri in [
        "/api/v1/ce/aggr/cardinality?type=gauge",
        "/api/v1/ce/aggr/binary?type=counter",
    ] {
        let (status, body) = get(&node.app, uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(&body)["error"],
            "Cardinality estimator aggregation is disabled"
        );
    }
}

#[tokio::test]
async fn test_aggr_cardinality_by_type() {
    let (app, views) = aggregator(true, true);
    let tick = views.gauge.as_ref().unwrap().empty_like();
    tick.insert_raw(&[TimeSeries::with_metric("up", [("instance", "a")])])
        .unwrap();
    views.apply(tick).unwrap();

    for kind in ["gauge", "counter"] {
        let (status, body) = get(&app, &format!("/api/v1/ce/aggr/cardinality?type={}", kind)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["cardinality_total"], 1);
    }

    let (status, _) = post_empty(&app, "/api/v1/ce/aggr/binary?type=counter").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_aggr_rejects_unknown_or_disabled_type() {
    let (app, _) = aggregator(true, false);

    let (status, _) = get(&app, "/api/v1/ce/aggr/cardinality?type=fixed").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(&app, "/api/v1/ce/aggr/cardinality").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = get(&app, "/api/v1/ce/aggr/binary?type=counter").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body)["error"], "counter aggregation is disabled");
}

#[tokio::test]
async fn test_node_endpoints_disabled_on_aggregator() {
    let (app, _) = aggregator(true, false);

    let (status, body) = get(&app, "/api/v1/ce/cardinality").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body)["error"], "Cardinality estimator is disabled");

    let (status, _) = post_empty(&app, "/api/v1/ce/reset").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
