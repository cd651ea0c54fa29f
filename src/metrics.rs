//! Prometheus self-metrics for the cardinality estimator
//!
//! These describe the estimator itself (inserts, resets, admission denials,
//! fleet traffic). The cardinality figures the estimator produces are
//! published separately by each emitter into its own registry.

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, Encoder, Gauge, IntCounter,
    IntCounterVec, Registry, TextEncoder,
};

lazy_static! {
    // === Estimator ===

    /// Series inserted across all shards
    pub static ref TIMESERIES_INSERTED: IntCounter = register_int_counter!(
        "ce_timeseries_inserted_total",
        "Total time series inserted into the estimator"
    ).unwrap();

    /// Series inserted per shard
    pub static ref TIMESERIES_INSERTED_BY_SHARD: IntCounterVec = register_int_counter_vec!(
        "ce_timeseries_inserted_by_shard_total",
        "Total time series inserted per estimator shard",
        &["shard"]
    ).unwrap();

    /// Whole-estimator resets
    pub static ref RESETS: IntCounter = register_int_counter!(
        "ce_resets_total",
        "Total estimator resets"
    ).unwrap();

    /// Sketch allocations refused by an allocator
    pub static ref HLL_ALLOCATIONS_DENIED: IntCounter = register_int_counter!(
        "ce_hlls_allocation_denied_total",
        "Total sketch allocations denied because the allocator was full"
    ).unwrap();

    /// Resets fired by the reset operator
    pub static ref SCHEDULED_RESETS: IntCounterVec = register_int_counter_vec!(
        "ce_scheduled_resets_total",
        "Total resets performed by the reset operator",
        &["trigger"]
    ).unwrap();

    // === Fleet aggregation ===

    /// Peer snapshot fetches
    pub static ref AGGR_PEER_FETCH: IntCounterVec = register_int_counter_vec!(
        "ce_aggr_peer_fetch_total",
        "Total peer snapshot fetches by outcome",
        &["status"]
    ).unwrap();

    /// Merge ticks
    pub static ref AGGR_MERGE_TICKS: IntCounterVec = register_int_counter_vec!(
        "ce_aggr_merge_ticks_total",
        "Total aggregation merge ticks by outcome",
        &["status"]
    ).unwrap();

    /// Reset schedule pushes
    pub static ref SCHEDULE_PUSH: IntCounterVec = register_int_counter_vec!(
        "ce_schedule_push_total",
        "Total reset schedule pushes to peers by outcome",
        &["status"]
    ).unwrap();

    // === System Health ===

    /// Process uptime
    pub static ref UPTIME_SECONDS: Gauge = register_gauge!(
        "ce_uptime_seconds",
        "Process uptime in seconds"
    ).unwrap();

    /// Health status (0=unhealthy, 1=healthy)
    pub static ref HEALTH_STATUS: Gauge = register_gauge!(
        "ce_health_status",
        "Process health status (0=unhealthy, 1=healthy)"
    ).unwrap();
}

/// Initialize metrics system
pub fn init() {
    HEALTH_STATUS.set(1.0);
    UPTIME_SECONDS.set(0.0);

    tracing::info!("Metrics system initialized");
}

/// Get the default registry in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    gather_metrics_with(&[])
}

/// Get the default registry followed by `extra` registries
pub fn gather_metrics_with(extra: &[&Registry]) -> Result<String, String> {
    let encoder = TextEncoder::new();
    let mut metric_families = prometheus::gather();
    for registry in extra {
        metric_families.extend(registry.gather());
    }

    let mut buffer = vec![];
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record the outcome of a peer snapshot fetch
#[inline]
pub fn record_peer_fetch(success: bool) {
    let status = if success { "success" } else { "error" };
    AGGR_PEER_FETCH.with_label_values(&[status]).inc();
}

/// Record the outcome of a schedule push
#[inline]
pub fn record_schedule_push(success: bool) {
    let status = if success { "success" } else { "error" };
    SCHEDULE_PUSH.with_label_values(&[status]).inc();
}

/// Record the outcome of a merge tick
#[inline]
pub fn record_merge_tick(success: bool) {
    let status = if success { "success" } else { "error" };
    AGGR_MERGE_TICKS.with_label_values(&[status]).inc();
}

/// Update uptime
#[inline]
pub fn update_uptime(seconds: f64) {
    UPTIME_SECONDS.set(seconds);
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{IntGauge, Opts};

    #[test]
    fn test_metrics_initialization() {
        init();
        assert_eq!(HEALTH_STATUS.get(), 1.0);
    }

    #[test]
    fn test_gather_metrics() {
        init();
        RESETS.inc();
        let metrics = gather_metrics().expect("Failed to gather metrics");
        assert!(metrics.contains("ce_health_status"));
        assert!(metrics.contains("ce_resets_total"));
    }

    #[test]
    fn test_gather_with_extra_registry() {
        let registry = Registry::new();
        let gauge = IntGauge::with_opts(Opts::new("extra_registry_gauge", "test")).unwrap();
        registry.register(Box::new(gauge.clone())).unwrap();
        gauge.set(7);

        let metrics = gather_metrics_with(&[&registry]).unwrap();
        assert!(metrics.contains("extra_registry_gauge 7"));
    }
}
