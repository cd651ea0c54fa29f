//! Reset Operator
//!
//! Resets an estimator on a schedule. Three loops share one task:
//!
//! - **janitor**: drops the pushed schedule every `janitor_interval`; an
//!   aggregator that stops pushing therefore stops driving resets
//! - **watcher**: every `check_interval`, arms once when a new interval of the
//!   pushed schedule begins, then fires once when its reset time has passed
//! - **fixed interval**: when configured, resets on every epoch-aligned
//!   boundary of `reset_interval` regardless of any pushed schedule

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant};

use super::framework::{Service, ServiceError, ServiceStatus};
use crate::estimator::CardinalityEstimator;
use crate::metrics;
use crate::schedule::ResetSchedule;

/// Reset operator settings
#[derive(Debug, Clone)]
pub struct ResetOperatorConfig {
    /// Autonomous epoch-aligned reset period
    pub reset_interval: Option<Duration>,
    /// Period after which a pushed schedule is dropped
    pub janitor_interval: Duration,
    /// Period of pushed-schedule checks
    pub check_interval: Duration,
}

impl Default for ResetOperatorConfig {
    fn default() -> Self {
        Self {
            reset_interval: None,
            janitor_interval: Duration::from_secs(60),
            check_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default)]
struct WatchState {
    /// Interval start observed on the previous check
    last_interval_start: Option<DateTime<Utc>>,
    /// Armed on entry into a new interval, disarmed once fired
    can_reset: bool,
}

/// Drives resets of one estimator
pub struct ResetOperator {
    name: &'static str,
    estimator: Arc<CardinalityEstimator>,
    config: ResetOperatorConfig,
    schedule: Mutex<Option<ResetSchedule>>,
    watch: Mutex<WatchState>,
    last_fixed_reset: Mutex<Option<DateTime<Utc>>>,
    fixed_resets: AtomicU64,
    status: RwLock<ServiceStatus>,
}

impl ResetOperator {
    /// Create an operator for `estimator`
    pub fn new(estimator: Arc<CardinalityEstimator>, config: ResetOperatorConfig) -> Self {
        Self::with_name("reset_operator", estimator, config)
    }

    /// Create an operator registered under a custom service name
    pub fn with_name(
        name: &'static str,
        estimator: Arc<CardinalityEstimator>,
        config: ResetOperatorConfig,
    ) -> Self {
        Self {
            name,
            estimator,
            config,
            schedule: Mutex::new(None),
            watch: Mutex::new(WatchState::default()),
            last_fixed_reset: Mutex::new(None),
            fixed_resets: AtomicU64::new(0),
            status: RwLock::new(ServiceStatus::Starting),
        }
    }

    /// Install or withdraw (`None`) the pushed schedule
    pub fn update_schedule(&self, schedule: Option<ResetSchedule>) {
        *self.schedule.lock() = schedule;
    }

    /// Currently installed schedule
    pub fn schedule(&self) -> Option<ResetSchedule> {
        *self.schedule.lock()
    }

    /// Janitor step: drop the pushed schedule
    pub fn clear_schedule(&self) {
        if self.schedule.lock().take().is_some() {
            tracing::debug!(operator = self.name, "Pushed reset schedule expired");
        }
    }

    /// Watcher step; returns true when it reset the estimator
    pub fn on_watch_tick(&self, now: DateTime<Utc>) -> bool {
        let Some(schedule) = self.schedule() else {
            return false;
        };

        {
            let mut watch = self.watch.lock();
            let start = schedule.reset_interval_start_at(now);
            if watch.last_interval_start != Some(start) {
                watch.last_interval_start = Some(start);
                watch.can_reset = true;
            }

            if !watch.can_reset || now < schedule.reset_time_at(now) {
                return false;
            }
            watch.can_reset = false;
        }

        self.estimator.reset();
        metrics::SCHEDULED_RESETS.with_label_values(&["schedule"]).inc();
        tracing::info!(
            operator = self.name,
            index = schedule.index,
            "Estimator reset by pushed schedule"
        );
        true
    }

    /// Next epoch-aligned boundary at which the fixed-interval reset fires
    ///
    /// Follows the last boundary served, so a boundary that passed while the
    /// loop was busy is returned (already due) rather than skipped. When
    /// several boundaries were missed only the latest one is served.
    pub fn next_fixed_reset(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let period = self.config.reset_interval.filter(|d| !d.is_zero())?;
        let Some(last) = *self.last_fixed_reset.lock() else {
            return Some(next_boundary(now, period));
        };

        let next = next_boundary(last, period);
        if next > now {
            return Some(next);
        }
        Some(boundary_at_or_before(now, period))
    }

    /// Number of fixed-interval resets served since creation
    pub fn fixed_reset_count(&self) -> u64 {
        self.fixed_resets.load(Ordering::Relaxed)
    }

    /// Fixed-interval step: reset and remember the boundary just served
    fn on_fixed_boundary(&self, boundary: DateTime<Utc>) {
        *self.last_fixed_reset.lock() = Some(boundary);
        self.fixed_resets.fetch_add(1, Ordering::Relaxed);
        self.estimator.reset();
        metrics::SCHEDULED_RESETS.with_label_values(&["interval"]).inc();
        tracing::info!(operator = self.name, at = %boundary, "Estimator reset on fixed interval");
    }

    /// Treat the boundary at or before `now` as served so the first one
    /// after start is tracked like any later one
    fn anchor_fixed(&self, now: DateTime<Utc>) {
        let Some(period) = self.config.reset_interval.filter(|d| !d.is_zero()) else {
            return;
        };
        self.last_fixed_reset
            .lock()
            .get_or_insert_with(|| boundary_at_or_before(now, period));
    }

    async fn sleep_until_fixed(&self) -> DateTime<Utc> {
        let Some(boundary) = self.next_fixed_reset(Utc::now()) else {
            return std::future::pending().await;
        };
        let wait = (boundary - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;
        boundary
    }
}

/// Smallest epoch-aligned multiple of `period` strictly after `at`
fn next_boundary(at: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    let period_nanos = period.as_nanos() as i64;
    let floor = boundary_at_or_before(at, period);
    DateTime::from_timestamp_nanos(floor.timestamp_nanos_opt().unwrap_or(0) + period_nanos)
}

/// Largest epoch-aligned multiple of `period` not after `at`
fn boundary_at_or_before(at: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    let period = period.as_nanos() as i64;
    let nanos = at.timestamp_nanos_opt().unwrap_or(i64::MAX - period);
    DateTime::from_timestamp_nanos(nanos - nanos.rem_euclid(period))
}

#[async_trait::async_trait]
impl Service for ResetOperator {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        tracing::debug!(
            operator = self.name,
            reset_interval = ?self.config.reset_interval,
            "Reset operator started"
        );

        let mut janitor = interval_at(
            Instant::now() + self.config.janitor_interval,
            self.config.janitor_interval,
        );
        let mut watcher = interval_at(
            Instant::now() + self.config.check_interval,
            self.config.check_interval,
        );
        self.anchor_fixed(Utc::now());

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            tracing::debug!(operator = self.name, "Reset operator received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(missed = n, "Reset operator broadcast receiver lagged");
                        }
                    }
                }

                _ = janitor.tick() => {
                    self.clear_schedule();
                }

                _ = watcher.tick() => {
                    self.on_watch_tick(Utc::now());
                }

                boundary = self.sleep_until_fixed() => {
                    self.on_fixed_boundary(boundary);
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::debug!(operator = self.name, "Reset operator stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TimeSeries;
    use chrono::TimeZone;

    fn loaded_estimator() -> Arc<CardinalityEstimator> {
        let ce = Arc::new(CardinalityEstimator::new());
        ce.insert_raw(&[TimeSeries::with_metric("up", [("instance", "a")])])
            .unwrap();
        ce
    }

    fn total(ce: &CardinalityEstimator) -> u64 {
        ce.estimate_metrics_cardinality().cardinality_total
    }

    #[test]
    fn test_no_schedule_no_reset() {
        let ce = loaded_estimator();
        let op = ResetOperator::new(ce.clone(), ResetOperatorConfig::default());
        assert!(!op.on_watch_tick(Utc::now()));
        assert_eq!(total(&ce), 1);
    }

    #[test]
    fn test_fires_once_per_interval() {
        let ce = loaded_estimator();
        let op = ResetOperator::new(ce.clone(), ResetOperatorConfig::default());
        // 4 nodes over 5 minutes; node 2 resets at :02:30 of each 5-minute interval
        op.update_schedule(Some(ResetSchedule::new(Duration::from_secs(300), 4, 2)));

        let at = |m, s| Utc.with_ymd_and_hms(2024, 1, 1, 10, m, s).unwrap();

        assert!(!op.on_watch_tick(at(0, 10)));
        assert_eq!(total(&ce), 1);

        assert!(op.on_watch_tick(at(2, 31)));
        assert_eq!(total(&ce), 0);

        ce.insert_raw(&[TimeSeries::with_metric("up", [("instance", "b")])])
            .unwrap();
        assert!(!op.on_watch_tick(at(2, 32)));
        assert!(!op.on_watch_tick(at(4, 59)));
        assert_eq!(total(&ce), 1);

        // next interval
        assert!(!op.on_watch_tick(at(5, 1)));
        assert!(op.on_watch_tick(at(7, 30)));
        assert_eq!(total(&ce), 0);
    }

    #[test]
    fn test_late_start_fires_in_first_interval() {
        let ce = loaded_estimator();
        let op = ResetOperator::new(ce.clone(), ResetOperatorConfig::default());
        op.update_schedule(Some(ResetSchedule::new(Duration::from_secs(300), 4, 0)));

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 3, 0).unwrap();
        assert!(op.on_watch_tick(now));
        assert!(!op.on_watch_tick(now + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_janitor_withdraws_schedule() {
        let op = ResetOperator::new(loaded_estimator(), ResetOperatorConfig::default());
        op.update_schedule(Some(ResetSchedule::new(Duration::from_secs(60), 1, 0)));
        op.clear_schedule();
        assert!(op.schedule().is_none());
    }

    #[test]
    fn test_next_fixed_reset() {
        let op = ResetOperator::new(
            loaded_estimator(),
            ResetOperatorConfig {
                reset_interval: Some(Duration::from_secs(3600)),
                ..Default::default()
            },
        );

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 0).unwrap();
        let boundary = Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap();
        assert_eq!(op.next_fixed_reset(now), Some(boundary));

        // a boundary already served is never served twice
        op.on_fixed_boundary(boundary);
        let just_before = boundary - chrono::Duration::milliseconds(5);
        assert_eq!(
            op.next_fixed_reset(just_before),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_missed_boundary_is_still_due() {
        let op = ResetOperator::new(
            loaded_estimator(),
            ResetOperatorConfig {
                reset_interval: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        );
        let at = |m, s| Utc.with_ymd_and_hms(2024, 1, 1, 10, m, s).unwrap();

        op.anchor_fixed(at(0, 30));
        // the loop was busy when 10:01:00 passed
        assert_eq!(op.next_fixed_reset(at(1, 0) + chrono::Duration::milliseconds(3)), Some(at(1, 0)));

        op.on_fixed_boundary(at(1, 0));
        assert_eq!(op.next_fixed_reset(at(1, 1)), Some(at(2, 0)));

        // several missed boundaries collapse into the latest one
        assert_eq!(op.next_fixed_reset(at(4, 20)), Some(at(4, 0)));
        assert_eq!(op.fixed_reset_count(), 1);
    }

    #[test]
    fn test_fixed_reset_disabled() {
        let op = ResetOperator::new(loaded_estimator(), ResetOperatorConfig::default());
        assert!(op.next_fixed_reset(Utc::now()).is_none());
    }

    #[tokio::test]
    async fn test_service_resets_on_fixed_interval() {
        let ce = loaded_estimator();
        let op = Arc::new(ResetOperator::new(
            ce.clone(),
            ResetOperatorConfig {
                reset_interval: Some(Duration::from_secs(1)),
                ..Default::default()
            },
        ));

        let (tx, rx) = broadcast::channel(1);
        let task = {
            let op = op.clone();
            tokio::spawn(async move { op.start(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(total(&ce), 0);

        tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
        assert_eq!(op.status(), ServiceStatus::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_service_serves_every_boundary_under_busy_ticks() {
        let op = Arc::new(ResetOperator::new(
            loaded_estimator(),
            ResetOperatorConfig {
                reset_interval: Some(Duration::from_millis(100)),
                janitor_interval: Duration::from_millis(1),
                check_interval: Duration::from_millis(1),
            },
        ));

        let (tx, rx) = broadcast::channel(1);
        let task = {
            let op = op.clone();
            tokio::spawn(async move { op.start(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(1050)).await;
        tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());

        let served = op.fixed_reset_count();
        assert!((9..=11).contains(&served), "served {} boundaries", served);
    }
}
