//! Monthly generation token budget

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Calendar month key in `YYYY-MM` form (UTC)
pub fn month_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// Persisted counter for one month
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub month_key: String,
    pub tokens_used: u64,
    pub limit: u64,
}

impl UsageCounter {
    /// `tokens_used / limit`, 0 for an unbounded (zero) limit
    pub fn ratio(&self) -> f64 {
        if self.limit == 0 {
            0.0
        } else {
            self.tokens_used as f64 / self.limit as f64
        }
    }
}

/// State after a `record` call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    pub month_key: String,
    pub tokens_used: u64,
    pub limit: u64,
    pub ratio: f64,
    /// True only on the call that crossed the alert fraction
    pub alert_fired: bool,
}

#[derive(Debug)]
struct MeterState {
    counter: UsageCounter,
    alerted: bool,
}

/// Additive monthly token meter
///
/// All mutation goes through one mutex. The alert fires once per crossing;
/// a month rollover re-arms it.
#[derive(Debug)]
pub struct UsageMeter {
    state: Mutex<MeterState>,
    alert_fraction: f64,
}

impl UsageMeter {
    pub fn new(limit: u64, alert_fraction: f64) -> Self {
        Self::starting_at(limit, alert_fraction, Utc::now())
    }

    pub fn starting_at(limit: u64, alert_fraction: f64, now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(MeterState {
                counter: UsageCounter {
                    month_key: month_key(now),
                    tokens_used: 0,
                    limit,
                },
                alerted: false,
            }),
            alert_fraction,
        }
    }

    pub fn record(&self, completion_tokens: u64) -> UsageReport {
        self.record_at(completion_tokens, Utc::now())
    }

    pub fn record_at(&self, completion_tokens: u64, now: DateTime<Utc>) -> UsageReport {
        let key = month_key(now);
        let mut state = self.state.lock();

        if state.counter.month_key != key {
            info!(
                "Usage month rolled over from {} to {} ({} tokens used)",
                state.counter.month_key, key, state.counter.tokens_used
            );
            state.counter.month_key = key;
            state.counter.tokens_used = 0;
            state.alerted = false;
        }

        state.counter.tokens_used = state.counter.tokens_used.saturating_add(completion_tokens);
        let ratio = state.counter.ratio();

        let alert_fired =
            !state.alerted && state.counter.limit > 0 && ratio >= self.alert_fraction;
        if alert_fired {
            state.alerted = true;
            warn!(
                "Generation usage for {} reached {:.1}% of the monthly limit ({} / {} tokens)",
                state.counter.month_key,
                ratio * 100.0,
                state.counter.tokens_used,
                state.counter.limit
            );
        }

        UsageReport {
            month_key: state.counter.month_key.clone(),
            tokens_used: state.counter.tokens_used,
            limit: state.counter.limit,
            ratio,
            alert_fired,
        }
    }

    pub fn snapshot(&self) -> UsageCounter {
        self.state.lock().counter.clone()
    }

    /// Resume a persisted month; a counter already past the alert fraction
    /// does not fire again
    pub fn restore(&self, month_key: &str, tokens_used: u64) {
        let mut state = self.state.lock();
        state.counter.month_key = month_key.to_string();
        state.counter.tokens_used = tokens_used;
        state.alerted = state.counter.limit > 0 && state.counter.ratio() >= self.alert_fraction;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_month_key_format() {
        assert_eq!(month_key(at(2024, 5, 31)), "2024-05");
    }

    #[test]
    fn test_rollover_resets_before_recording() {
        let meter = UsageMeter::starting_at(1000, 0.8, at(2024, 5, 1));
        let may = meter.record_at(100, at(2024, 5, 20));
        assert_eq!(may.tokens_used, 100);
        assert_eq!(may.month_key, "2024-05");

        let june = meter.record_at(40, at(2024, 6, 1));
        assert_eq!(june.month_key, "2024-06");
        assert_eq!(june.tokens_used, 40);
    }

    #[test]
    fn test_ratio_and_zero_limit() {
        let meter = UsageMeter::starting_at(200, 0.8, at(2024, 5, 1));
        let report = meter.record_at(50, at(2024, 5, 2));
        assert!((report.ratio - 0.25).abs() < 1e-9);

        let unbounded = UsageMeter::starting_at(0, 0.8, at(2024, 5, 1));
        let report = unbounded.record_at(5_000, at(2024, 5, 2));
        assert_eq!(report.ratio, 0.0);
        assert!(!report.alert_fired);
    }

    #[test]
    fn test_alert_fires_once_per_crossing() {
        let meter = UsageMeter::starting_at(100, 0.8, at(2024, 5, 1));
        assert!(!meter.record_at(70, at(2024, 5, 2)).alert_fired);
        assert!(meter.record_at(10, at(2024, 5, 3)).alert_fired);
        assert!(!meter.record_at(10, at(2024, 5, 4)).alert_fired);
        assert!(!meter.record_at(50, at(2024, 5, 5)).alert_fired);

        // rollover re-arms
        assert!(!meter.record_at(10, at(2024, 6, 1)).alert_fired);
        assert!(meter.record_at(80, at(2024, 6, 2)).alert_fired);
    }

    #[test]
    fn test_restore_does_not_refire() {
        let meter = UsageMeter::starting_at(100, 0.8, at(2024, 5, 1));
        meter.restore("2024-05", 90);
        let report = meter.record_at(1, at(2024, 5, 2));
        assert_eq!(report.tokens_used, 91);
        assert!(!report.alert_fired);
    }

    #[test]
    fn test_concurrent_records_are_not_lost() {
        let meter = std::sync::Arc::new(UsageMeter::starting_at(0, 0.8, at(2024, 5, 1)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let meter = meter.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        meter.record_at(1, at(2024, 5, 2));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(meter.snapshot().tokens_used, 800);
    }
}
