//! Fleet reset schedule
//!
//! A [`ResetSchedule`] tells one node when to reset within each interval.
//! Intervals are aligned to the Unix epoch; node `i` of `n` resets at
//! `interval_start + i * (interval / n)`, so no two nodes of a fleet reset
//! at the same instant.
//!
//! Wire form (durations in nanoseconds):
//!
//! ```json
//! {"resetInterval": 300000000000, "quantum": 75000000000, "index": 2}
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reset timing assigned to one node of a fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetSchedule {
    /// Period between resets
    #[serde(with = "duration_nanos")]
    pub reset_interval: Duration,
    /// Offset slice per node index
    #[serde(with = "duration_nanos")]
    pub quantum: Duration,
    /// Node index within the fleet
    pub index: u32,
}

impl ResetSchedule {
    /// Schedule for node `index` of `node_count` sharing `window`
    ///
    /// # Panics
    /// Panics if `node_count` is zero.
    pub fn new(window: Duration, node_count: u32, index: u32) -> Self {
        assert!(node_count > 0, "BUG: reset schedule needs at least one node");
        Self {
            reset_interval: window,
            quantum: window / node_count,
            index,
        }
    }

    /// Reject schedules that cannot be evaluated
    pub fn validate(&self) -> Result<()> {
        if self.reset_interval.is_zero() {
            return Err(Error::Configuration(
                "resetInterval must be positive".to_string(),
            ));
        }
        if self.offset() >= self.reset_interval {
            return Err(Error::Configuration(format!(
                "index {} with quantum {:?} falls outside resetInterval {:?}",
                self.index, self.quantum, self.reset_interval
            )));
        }
        Ok(())
    }

    /// Offset of this node's reset within an interval
    pub fn offset(&self) -> Duration {
        self.quantum.saturating_mul(self.index)
    }

    /// Start of the interval containing `now`
    pub fn reset_interval_start_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let interval = self.reset_interval.as_nanos() as i64;
        if interval <= 0 {
            return now;
        }
        let nanos = now.timestamp_nanos_opt().unwrap_or(i64::MAX);
        DateTime::from_timestamp_nanos(nanos - nanos.rem_euclid(interval))
    }

    /// Reset instant of this node within the interval containing `now`
    pub fn reset_time_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let offset = chrono::Duration::from_std(self.offset()).unwrap_or(chrono::Duration::zero());
        self.reset_interval_start_at(now) + offset
    }

    /// Start of the current interval
    pub fn reset_interval_start(&self) -> DateTime<Utc> {
        self.reset_interval_start_at(Utc::now())
    }

    /// Reset instant within the current interval
    pub fn reset_time(&self) -> DateTime<Utc> {
        self.reset_time_at(Utc::now())
    }
}

mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const WINDOW: Duration = Duration::from_secs(300);

    #[test]
    fn test_reset_time_inside_interval() {
        let schedule = ResetSchedule::new(WINDOW, 4, 2);
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 7, 31).unwrap();

        let start = schedule.reset_interval_start_at(now);
        let reset = schedule.reset_time_at(now);

        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap());
        assert!(reset > start);
        assert!(reset < start + chrono::Duration::from_std(WINDOW).unwrap());
    }

    #[test]
    fn test_nodes_evenly_spaced() {
        let now = Utc::now();
        let times: Vec<_> = (0..4)
            .map(|i| ResetSchedule::new(WINDOW, 4, i).reset_time_at(now))
            .collect();

        for pair in times.windows(2) {
            assert!(pair[1] > pair[0]);
            assert_eq!(pair[1] - pair[0], chrono::Duration::seconds(75));
        }
    }

    #[test]
    fn test_interval_start_is_epoch_aligned() {
        let schedule = ResetSchedule::new(Duration::from_secs(86_400), 1, 0);
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 23, 59, 59).unwrap();
        assert_eq!(
            schedule.reset_interval_start_at(now),
            Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_json_wire_format() {
        let schedule = ResetSchedule::new(WINDOW, 4, 1);
        let json = serde_json::to_value(schedule).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "resetInterval": 300_000_000_000u64,
                "quantum": 75_000_000_000u64,
                "index": 1
            })
        );

        let back: ResetSchedule = serde_json::from_value(json).unwrap();
        assert_eq!(back, schedule);
    }

    #[test]
    fn test_validate() {
        assert!(ResetSchedule::new(WINDOW, 4, 3).validate().is_ok());
        assert!(ResetSchedule::new(WINDOW, 4, 4).validate().is_err());
        assert!(ResetSchedule::new(Duration::ZERO, 1, 0).validate().is_err());
    }
}
