//! Integration tests for fleet aggregation
//!
//! Peers are `wiremock` servers standing in for node endpoints:
//! - Schedule push assigns every peer its own slot
//! - Fetch-and-merge unions peer snapshots into the aggregate views
//! - Failing peers are skipped; undecodable snapshots abort the tick

use std::sync::Arc;
use std::time::Duration;

use kuba_cardinality::estimator::{CardinalityEstimator, EstimatorOptions};
use kuba_cardinality::schedule::ResetSchedule;
use kuba_cardinality::services::{
    AggregateViews, MergeReport, MergeService, PeerClient, SchedulePushService,
};
use kuba_cardinality::TimeSeries;
use tokio::sync::watch;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SHARDS: usize = 8;
const WINDOW: Duration = Duration::from_secs(300);

// ============================================================================
// Helper Functions
// ============================================================================

fn estimator() -> CardinalityEstimator {
    CardinalityEstimator::with_options(EstimatorOptions {
        shards: SHARDS,
        ..Default::default()
    })
}

/// Marshalled estimator holding `count` series of `metric`
fn snapshot(metric: &str, prefix: &str, count: usize) -> Vec<u8> {
    let ce = estimator();
    let batch: Vec<TimeSeries> = (0..count)
        .map(|i| TimeSeries::with_metric(metric, [("instance".to_string(), format!("{}-{}", prefix, i))]))
        .collect();
    ce.insert_raw(&batch).unwrap();
    ce.marshal_binary()
}

async fn peer_serving(body: Vec<u8>) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/ce/binary"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(&server)
        .await;
    server
}

async fn failing_peer() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    server
}

fn client() -> PeerClient {
    PeerClient::new(Duration::from_secs(5)).unwrap()
}

fn views(gauge: bool, counter: bool) -> AggregateViews {
    AggregateViews {
        gauge: gauge.then(|| Arc::new(estimator())),
        counter: counter.then(|| Arc::new(estimator())),
    }
}

fn merger(peers: Vec<String>, views: AggregateViews) -> (MergeService, watch::Sender<Vec<String>>) {
    let (tx, rx) = watch::channel(peers);
    let service = MergeService::new(client(), rx, views, 3, Duration::from_secs(30));
    (service, tx)
}

fn cardinality_of(ce: &CardinalityEstimator, metric: &str) -> Option<u64> {
    ce.estimate_metrics_cardinality()
        .cardinality_desc_by_metric_name
        .into_iter()
        .find(|m| m.metric_name == metric)
        .map(|m| m.cardinality)
}

// ============================================================================
// Schedule Push
// ============================================================================

#[tokio::test]
async fn test_push_assigns_each_peer_its_slot() {
    let mut servers = Vec::new();
    for index in 0..3u32 {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/ce/schedule"))
            .and(body_json(ResetSchedule::new(WINDOW, 3, index)))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        servers.push(server);
    }

    let peers: Vec<String> = servers.iter().map(|s| s.uri()).collect();
    let (_tx, rx) = watch::channel(peers);
    let pusher = SchedulePushService::new(client(), rx, WINDOW, Duration::from_secs(1));

    assert_eq!(pusher.push_once().await, 3);
    // expectations are verified when the servers drop
}

#[tokio::test]
async fn test_push_reports_failed_peers() {
    let ok = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/ce/schedule"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&ok)
        .await;
    let broken = failing_peer().await;

    let (_tx, rx) = watch::channel(vec![ok.uri(), broken.uri()]);
    let pusher = SchedulePushService::new(client(), rx, WINDOW, Duration::from_secs(1));

    assert_eq!(pusher.push_once().await, 1);
}

// ============================================================================
// Fetch and Merge
// ============================================================================

#[tokio::test]
async fn test_merge_unions_peers_and_skips_failures() {
    let a = peer_serving(snapshot("http_requests_total", "a", 30)).await;
    let b = peer_serving(snapshot("http_requests_total", "b", 20)).await;
    let c = peer_serving(snapshot("up", "c", 4)).await;
    let broken = failing_peer().await;

    // bare host:port peers are reached over http
    let bare = c.uri().trim_start_matches("http://").to_string();

    let views = views(true, false);
    let (service, _tx) = merger(vec![a.uri(), b.uri(), bare, broken.uri()], views.clone());

    let report = service.merge_once().await.unwrap();
    assert_eq!(
        report,
        MergeReport {
            merged: 3,
            skipped: 1
        }
    );

    let gauge = views.gauge.as_ref().unwrap();
    let requests = cardinality_of(gauge, "http_requests_total").unwrap();
    assert!((47..=53).contains(&requests), "requests = {}", requests);
    assert_eq!(cardinality_of(gauge, "up"), Some(4));
}

#[tokio::test]
async fn test_gauge_replaced_counter_accumulates() {
    let peer = peer_serving(snapshot("first_metric", "x", 5)).await;

    let views = views(true, true);
    let (service, _tx) = merger(vec![peer.uri()], views.clone());
    service.merge_once().await.unwrap();

    peer.reset().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/ce/binary"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(snapshot("second_metric", "y", 6)))
        .mount(&peer)
        .await;
    service.merge_once().await.unwrap();

    let gauge = views.gauge.as_ref().unwrap();
    assert_eq!(cardinality_of(gauge, "first_metric"), None);
    assert_eq!(cardinality_of(gauge, "second_metric"), Some(6));

    let counter = views.counter.as_ref().unwrap();
    assert_eq!(cardinality_of(counter, "first_metric"), Some(5));
    assert_eq!(cardinality_of(counter, "second_metric"), Some(6));
}

#[tokio::test]
async fn test_corrupt_snapshot_aborts_tick() {
    let good = peer_serving(snapshot("up", "a", 3)).await;
    let corrupt = peer_serving(b"not a snapshot".to_vec()).await;

    let views = views(true, false);
    let gauge = views.gauge.clone().unwrap();
    let seed = gauge.empty_like();
    seed.insert_raw(&[TimeSeries::with_metric("previous", [("instance", "z")])])
        .unwrap();
    gauge.replace(seed).unwrap();

    let (service, _tx) = merger(vec![good.uri(), corrupt.uri()], views);
    assert!(service.merge_once().await.is_err());

    // the previous tick's view survives
    assert_eq!(cardinality_of(&gauge, "previous"), Some(1));
    assert_eq!(cardinality_of(&gauge, "up"), None);
}

#[tokio::test]
async fn test_all_peers_failing_keeps_views() {
    let peer = peer_serving(snapshot("up", "a", 7)).await;

    let views = views(true, true);
    let (service, _tx) = merger(vec![peer.uri()], views.clone());
    service.merge_once().await.unwrap();

    peer.reset().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&peer)
        .await;

    let report = service.merge_once().await.unwrap();
    assert_eq!(
        report,
        MergeReport {
            merged: 0,
            skipped: 1
        }
    );

    assert_eq!(cardinality_of(views.gauge.as_ref().unwrap(), "up"), Some(7));
    assert_eq!(cardinality_of(views.counter.as_ref().unwrap(), "up"), Some(7));
}

#[tokio::test]
async fn test_merge_follows_peer_updates() {
    let a = peer_serving(snapshot("from_a", "a", 2)).await;
    let b = peer_serving(snapshot("from_b", "b", 2)).await;

    let views = views(true, false);
    let (service, tx) = merger(vec![a.uri()], views.clone());
    service.merge_once().await.unwrap();

    tx.send_replace(vec![b.uri()]);
    service.merge_once().await.unwrap();

    let gauge = views.gauge.as_ref().unwrap();
    assert_eq!(cardinality_of(gauge, "from_a"), None);
    assert_eq!(cardinality_of(gauge, "from_b"), Some(2));
}
