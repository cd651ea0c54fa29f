//! Fleet Aggregation
//!
//! An aggregator process collects the estimators of a fleet of nodes:
//!
//! ```text
//!                    ┌──────────────┐  watch   ┌────────────────────┐  POST /api/v1/ce/schedule
//! nodes / file: ───▶ │  Discovery   │ ───┬───▶ │ SchedulePusher (1s)│ ─────────────────────────▶ peers
//!                    │    (15s)     │    │     └────────────────────┘
//!                    └──────────────┘    │     ┌────────────────────┐  POST /api/v1/ce/binary
//!                                        └───▶ │   Merger (30s)     │ ◀──────────────────────── peers
//!                                              └─────────┬──────────┘
//!                                                        ▼
//!                                     gauge view (replaced) / counter view (merged)
//! ```
//!
//! Peer failures are logged and skipped; the next tick retries. A snapshot
//! that cannot be decoded or merged locally aborts the whole tick.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tokio::time::interval;

use super::framework::{Service, ServiceError, ServiceStatus};
use crate::error::{Error, Result};
use crate::estimator::CardinalityEstimator;
use crate::metrics;
use crate::schedule::ResetSchedule;

/// Node endpoint receiving reset schedules
pub const SCHEDULE_PATH: &str = "/api/v1/ce/schedule";

/// Node endpoint serving estimator snapshots
pub const BINARY_PATH: &str = "/api/v1/ce/binary";

const DISCOVERY_SERVICE: &str = "ce_discovery";

// ============================================================================
// Address resolution
// ============================================================================

/// Expand configured node entries into peer addresses
///
/// Entries may be comma-separated. A `file:<path>` entry is replaced by the
/// file's lines; unreadable files are logged and skipped.
pub fn resolve_addresses(nodes: &[String]) -> Vec<String> {
    let mut addrs = Vec::new();

    for entry in nodes.iter().flat_map(|n| n.split(',')) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        match entry.strip_prefix("file:") {
            Some(path) => match read_addresses_from_file(path) {
                Ok(from_file) => addrs.extend(from_file),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Failed to read peer addresses");
                },
            },
            None => addrs.push(entry.to_string()),
        }
    }

    addrs
}

/// Read one address per line, skipping blank and `#` lines
pub fn read_addresses_from_file(path: &str) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

/// Absolute URL for `path` on `peer`; bare `host:port` peers get `http://`
pub fn peer_url(peer: &str, path: &str) -> String {
    let peer = peer.trim_end_matches('/');
    if peer.starts_with("http://") || peer.starts_with("https://") {
        format!("{}{}", peer, path)
    } else {
        format!("http://{}{}", peer, path)
    }
}

// ============================================================================
// Peer client
// ============================================================================

/// HTTP client for node endpoints
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
}

impl PeerClient {
    /// Client with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    /// Install `schedule` on `peer`
    pub async fn push_schedule(&self, peer: &str, schedule: &ResetSchedule) -> Result<()> {
        let response = self
            .http
            .post(peer_url(peer, SCHEDULE_PATH))
            .json(schedule)
            .send()
            .await?;
        check_status(peer, &response)?;
        Ok(())
    }

    /// Fetch the binary estimator snapshot of `peer`
    pub async fn fetch_snapshot(&self, peer: &str) -> Result<Bytes> {
        let response = self.http.post(peer_url(peer, BINARY_PATH)).send().await?;
        check_status(peer, &response)?;
        Ok(response.bytes().await?)
    }
}

fn check_status(peer: &str, response: &reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(Error::Http(format!("{} responded {}", peer, status)))
    }
}

// ============================================================================
// Aggregate views
// ============================================================================

/// Which aggregate view a request addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// Snapshot of the last merge tick
    Gauge,
    /// Cumulative since the last counter reset
    Counter,
}

impl FromStr for ViewKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gauge" => Ok(ViewKind::Gauge),
            "counter" => Ok(ViewKind::Counter),
            other => Err(Error::Configuration(format!(
                "type must be either 'counter' or 'gauge', got {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewKind::Gauge => f.write_str("gauge"),
            ViewKind::Counter => f.write_str("counter"),
        }
    }
}

/// The aggregator's estimators; a disabled view is `None`
#[derive(Clone, Default)]
pub struct AggregateViews {
    /// Replaced on every merge tick
    pub gauge: Option<Arc<CardinalityEstimator>>,
    /// Merged into on every merge tick
    pub counter: Option<Arc<CardinalityEstimator>>,
}

impl AggregateViews {
    /// Estimator backing `kind`, if enabled
    pub fn get(&self, kind: ViewKind) -> Option<&Arc<CardinalityEstimator>> {
        match kind {
            ViewKind::Gauge => self.gauge.as_ref(),
            ViewKind::Counter => self.counter.as_ref(),
        }
    }

    /// Whether any view is enabled
    pub fn is_enabled(&self) -> bool {
        self.gauge.is_some() || self.counter.is_some()
    }

    /// Fold a tick's aggregate into the enabled views
    pub fn apply(&self, aggregate: CardinalityEstimator) -> Result<()> {
        match (&self.gauge, &self.counter) {
            (Some(gauge), Some(counter)) => {
                gauge.replace(aggregate.snapshot())?;
                counter.merge(aggregate)
            },
            (Some(gauge), None) => gauge.replace(aggregate),
            (None, Some(counter)) => counter.merge(aggregate),
            (None, None) => Ok(()),
        }
    }

    fn template(&self) -> Option<&Arc<CardinalityEstimator>> {
        self.gauge.as_ref().or(self.counter.as_ref())
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// Periodically resolves peer addresses and publishes them (latest wins)
pub struct DiscoveryService {
    nodes: Vec<String>,
    interval: Duration,
    tx: watch::Sender<Vec<String>>,
    status: RwLock<ServiceStatus>,
}

impl DiscoveryService {
    /// Resolve `nodes` once and publish the result
    pub fn new(nodes: Vec<String>, interval: Duration) -> Self {
        let (tx, _) = watch::channel(resolve_addresses(&nodes));
        Self {
            nodes,
            interval,
            tx,
            status: RwLock::new(ServiceStatus::Starting),
        }
    }

    /// Receiver of the current peer set
    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.tx.subscribe()
    }

    /// Re-resolve and publish if the set changed
    pub fn discover_once(&self) {
        let addrs = resolve_addresses(&self.nodes);
        self.tx.send_if_modified(|current| {
            if *current == addrs {
                return false;
            }
            tracing::info!(peers = addrs.len(), "Peer set changed");
            *current = addrs;
            true
        });
    }
}

#[async_trait::async_trait]
impl Service for DiscoveryService {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> std::result::Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        tracing::debug!(interval = ?self.interval, "Discovery service started");

        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(missed = n, "Discovery broadcast receiver lagged");
                        }
                    }
                }

                _ = ticker.tick() => {
                    self.discover_once();
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::debug!("Discovery service stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        DISCOVERY_SERVICE
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}

// ============================================================================
// Schedule pusher
// ============================================================================

/// Periodically assigns each peer its slot of the lookback window
pub struct SchedulePushService {
    client: PeerClient,
    peers: watch::Receiver<Vec<String>>,
    lookback_window: Duration,
    interval: Duration,
    status: RwLock<ServiceStatus>,
}

impl SchedulePushService {
    /// Create a pusher reading peers from `peers`
    pub fn new(
        client: PeerClient,
        peers: watch::Receiver<Vec<String>>,
        lookback_window: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            peers,
            lookback_window,
            interval,
            status: RwLock::new(ServiceStatus::Starting),
        }
    }

    /// Push to every current peer; returns the number of successful pushes
    pub async fn push_once(&self) -> usize {
        let peers = self.peers.borrow().clone();
        if peers.is_empty() {
            return 0;
        }

        let count = peers.len() as u32;
        let pushes = peers.iter().enumerate().map(|(idx, peer)| {
            let schedule = ResetSchedule::new(self.lookback_window, count, idx as u32);
            async move {
                let result = self.client.push_schedule(peer, &schedule).await;
                metrics::record_schedule_push(result.is_ok());
                match result {
                    Ok(()) => {
                        tracing::debug!(peer = %peer, index = idx, "Reset schedule pushed");
                        true
                    },
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "Failed to push reset schedule");
                        false
                    },
                }
            }
        });

        futures::future::join_all(pushes)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count()
    }
}

#[async_trait::async_trait]
impl Service for SchedulePushService {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> std::result::Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        tracing::debug!(
            lookback_window = ?self.lookback_window,
            "Schedule pusher started"
        );

        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(missed = n, "Schedule pusher broadcast receiver lagged");
                        }
                    }
                }

                _ = ticker.tick() => {
                    self.push_once().await;
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::debug!("Schedule pusher stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ce_schedule_pusher"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![DISCOVERY_SERVICE]
    }
}

// ============================================================================
// Fetch and merge
// ============================================================================

/// Outcome of one merge tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Peers whose snapshot was merged
    pub merged: usize,
    /// Peers skipped because the fetch failed
    pub skipped: usize,
}

/// Periodically fetches every peer's snapshot and folds them into the views
pub struct MergeService {
    client: PeerClient,
    peers: watch::Receiver<Vec<String>>,
    views: AggregateViews,
    concurrency: usize,
    interval: Duration,
    status: RwLock<ServiceStatus>,
}

impl MergeService {
    /// Create a merger reading peers from `peers`
    pub fn new(
        client: PeerClient,
        peers: watch::Receiver<Vec<String>>,
        views: AggregateViews,
        concurrency: usize,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            peers,
            views,
            concurrency: concurrency.max(1),
            interval,
            status: RwLock::new(ServiceStatus::Starting),
        }
    }

    /// Run one fetch-and-merge tick
    ///
    /// # Errors
    ///
    /// Returns the first local decode or merge failure; the views are left
    /// untouched in that case. They are also left untouched when every peer
    /// fetch failed.
    pub async fn merge_once(&self) -> Result<MergeReport> {
        let mut report = MergeReport::default();

        let Some(template) = self.views.template() else {
            return Ok(report);
        };
        let peers = self.peers.borrow().clone();
        if peers.is_empty() {
            tracing::debug!("No peers to merge");
            return Ok(report);
        }

        let client = &self.client;
        let mut fetches = stream::iter(peers)
            .map(|peer| async move {
                let result = client.fetch_snapshot(&peer).await;
                (peer, result)
            })
            .buffer_unordered(self.concurrency);

        let aggregate = template.empty_like();

        while let Some((peer, result)) = fetches.next().await {
            metrics::record_peer_fetch(result.is_ok());
            let data = match result {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "Skipping peer snapshot");
                    report.skipped += 1;
                    continue;
                },
            };

            let scratch = aggregate.empty_like();
            scratch.unmarshal_binary(&data).map_err(|e| {
                tracing::error!(peer = %peer, error = %e, "Failed to decode peer snapshot");
                e
            })?;
            aggregate.merge(scratch).map_err(|e| {
                tracing::error!(peer = %peer, error = %e, "Failed to merge peer snapshot");
                e
            })?;

            tracing::debug!(peer = %peer, bytes = data.len(), "Merged peer snapshot");
            report.merged += 1;
        }

        if report.merged == 0 && report.skipped > 0 {
            tracing::warn!(skipped = report.skipped, "No peer snapshot merged, keeping previous views");
            return Ok(report);
        }

        self.views.apply(aggregate)?;
        Ok(report)
    }
}

#[async_trait::async_trait]
impl Service for MergeService {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> std::result::Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        tracing::debug!(
            concurrency = self.concurrency,
            interval = ?self.interval,
            "Merge service started"
        );

        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(missed = n, "Merge service broadcast receiver lagged");
                        }
                    }
                }

                _ = ticker.tick() => {
                    match self.merge_once().await {
                        Ok(report) => {
                            metrics::record_merge_tick(true);
                            tracing::info!(merged = report.merged, skipped = report.skipped, "Merge tick complete");
                        },
                        Err(e) => {
                            metrics::record_merge_tick(false);
                            tracing::error!(error = %e, "Merge tick aborted");
                        },
                    }
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::debug!("Merge service stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ce_merger"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![DISCOVERY_SERVICE]
    }
}

// ============================================================================
// Tests
// ============================================================================
