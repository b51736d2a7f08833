//! Rolling 24-hour error histogram.
//!
//! Slots are keyed by absolute hour since the epoch, stored at
//! `hour mod 24`. A slot whose stored hour differs from the incoming hour is
//! a day old and is reset before reuse, which evicts expired counts without
//! a background sweep.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ErrorTrendConfig;
use crate::types::Timestamp;
use crate::{ERROR_SLOTS, TREND_WINDOW_SLOTS};

// ----------------------------------------------------------------------------
// Buckets
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSample {
    pub message: String,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Default)]
struct ErrorBucket {
    /// Absolute hour index; `None` until first use
    hour_slot: Option<i64>,
    count: u64,
    sample_messages: VecDeque<ErrorSample>,
}

impl ErrorBucket {
    fn count_for(&self, hour: i64) -> u64 {
        if self.hour_slot == Some(hour) {
            self.count
        } else {
            0
        }
    }
}

// ----------------------------------------------------------------------------
// Trend Result
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Rising,
    Falling,
    Flat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorTrend {
    pub total_24h: u64,
    /// Hourly counts, oldest first; the last entry is the current hour
    pub per_hour: Vec<u64>,
    pub direction: TrendDirection,
    pub recent_sum: u64,
    pub prior_sum: u64,
    /// Sample messages from the newest hour that has any
    pub samples: Vec<ErrorSample>,
    pub window_start: Timestamp,
    pub computed_at: Timestamp,
}

impl Default for ErrorTrend {
    fn default() -> Self {
        Self {
            total_24h: 0,
            per_hour: vec![0; ERROR_SLOTS],
            direction: TrendDirection::Flat,
            recent_sum: 0,
            prior_sum: 0,
            samples: Vec::new(),
            window_start: Timestamp::EPOCH,
            computed_at: Timestamp::EPOCH,
        }
    }
}

/// Compare the recent window against the prior one. Any error after an
/// error-free prior window counts as rising.
pub fn classify_direction(recent: u64, prior: u64, threshold_pct: f64) -> TrendDirection {
    if prior == 0 {
        return if recent > 0 {
            TrendDirection::Rising
        } else {
            TrendDirection::Flat
        };
    }

    let margin = threshold_pct / 100.0;
    let (recent, prior) = (recent as f64, prior as f64);
    if recent > prior * (1.0 + margin) {
        TrendDirection::Rising
    } else if recent < prior * (1.0 - margin) {
        TrendDirection::Falling
    } else {
        TrendDirection::Flat
    }
}

// ----------------------------------------------------------------------------
// Analyzer
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct ErrorTrendAnalyzer {
    slots: Mutex<Vec<ErrorBucket>>,
    samples_per_slot: usize,
    trend_threshold_pct: f64,
}

impl ErrorTrendAnalyzer {
    pub fn new(config: &ErrorTrendConfig) -> Self {
        Self {
            slots: Mutex::new(vec![ErrorBucket::default(); ERROR_SLOTS]),
            samples_per_slot: config.samples_per_slot,
            trend_threshold_pct: config.trend_threshold_pct,
        }
    }

    fn slot_index(hour: i64) -> usize {
        hour.rem_euclid(ERROR_SLOTS as i64) as usize
    }

    /// Count one error in the hour containing `timestamp`. Returns false when
    /// the event is older than everything the histogram still holds, or dated
    /// after the current hour.
    pub fn record_error(&self, message: impl Into<String>, timestamp: Timestamp) -> bool {
        self.record_error_at(message, timestamp, Timestamp::now())
    }

    pub fn record_error_at(&self, message: impl Into<String>, timestamp: Timestamp, now: Timestamp) -> bool {
        let hour = timestamp.hour_index();
        let current = now.hour_index();
        if hour > current {
            debug!(target: "vigil::errors", hour, current, "Dropping error dated in the future");
            return false;
        }

        let mut slots = self.slots.lock();
        let bucket = &mut slots[Self::slot_index(hour)];

        match bucket.hour_slot {
            Some(stored) if stored > hour => {
                debug!(target: "vigil::errors", hour, stored, "Dropping error older than 24h");
                return false;
            }
            Some(stored) if stored == hour => {}
            _ => {
                bucket.hour_slot = Some(hour);
                bucket.count = 0;
                bucket.sample_messages.clear();
            }
        }

        bucket.count += 1;
        if self.samples_per_slot > 0 {
            if bucket.sample_messages.len() >= self.samples_per_slot {
                bucket.sample_messages.pop_front();
            }
            bucket.sample_messages.push_back(ErrorSample {
                message: message.into(),
                timestamp,
            });
        }
        true
    }

    pub fn trend(&self) -> ErrorTrend {
        self.trend_at(Timestamp::now())
    }

    pub fn trend_at(&self, now: Timestamp) -> ErrorTrend {
        let current = now.hour_index();
        let oldest = current - (ERROR_SLOTS as i64 - 1);

        let (per_hour, samples) = {
            let slots = self.slots.lock();
            let per_hour: Vec<u64> = (oldest..=current)
                .map(|hour| slots[Self::slot_index(hour)].count_for(hour))
                .collect();
            let samples = (oldest..=current)
                .rev()
                .map(|hour| (hour, &slots[Self::slot_index(hour)]))
                .find(|(hour, bucket)| bucket.count_for(*hour) > 0)
                .map(|(_, bucket)| bucket.sample_messages.iter().cloned().collect())
                .unwrap_or_default();
            (per_hour, samples)
        };

        let recent_sum: u64 = per_hour[ERROR_SLOTS - TREND_WINDOW_SLOTS..].iter().sum();
        let prior_sum: u64 = per_hour[ERROR_SLOTS - 2 * TREND_WINDOW_SLOTS..ERROR_SLOTS - TREND_WINDOW_SLOTS]
            .iter()
            .sum();

        ErrorTrend {
            total_24h: per_hour.iter().sum(),
            direction: classify_direction(recent_sum, prior_sum, self.trend_threshold_pct),
            per_hour,
            recent_sum,
            prior_sum,
            samples,
            window_start: Timestamp::from_secs(oldest * 3600),
            computed_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    const HOUR: i64 = 3600;

    fn analyzer(samples_per_slot: usize) -> ErrorTrendAnalyzer {
        ErrorTrendAnalyzer::new(&ErrorTrendConfig {
            samples_per_slot,
            trend_threshold_pct: 20.0,
        })
    }

    fn at_hour(hour: i64) -> Timestamp {
        Timestamp::from_secs(hour * HOUR + 120)
    }

    #[test]
    fn test_empty_trend_is_flat() {
        let trend = analyzer(5).trend_at(at_hour(1_000));
        assert_eq!(trend.per_hour, vec![0; 24]);
        assert_eq!(trend.total_24h, 0);
        assert_eq!(trend.direction, TrendDirection::Flat);
    }

    #[test]
    fn test_increasing_counts_are_rising() {
        let analyzer = analyzer(5);
        let now_hour = 500_000;
        // hours now-11 ..= now carry 1..=12 errors
        for (i, hour) in (now_hour - 11..=now_hour).enumerate() {
            for _ in 0..=i {
                analyzer.record_error_at("boom", at_hour(hour), at_hour(now_hour));
            }
        }

        let trend = analyzer.trend_at(at_hour(now_hour));
        assert_eq!(trend.direction, TrendDirection::Rising);
        assert_eq!(trend.prior_sum, 1 + 2 + 3 + 4 + 5 + 6);
        assert_eq!(trend.recent_sum, 7 + 8 + 9 + 10 + 11 + 12);
        assert_eq!(trend.total_24h, 78);
        assert_eq!(trend.per_hour[23], 12);
        assert_eq!(trend.per_hour[12], 1);
        assert_eq!(trend.per_hour[11], 0);
    }

    #[test]
    fn test_slot_reused_after_a_day() {
        let analyzer = analyzer(5);
        analyzer.record_error("old", at_hour(100));
        analyzer.record_error("old", at_hour(100));
        analyzer.record_error("new", at_hour(124));

        let trend = analyzer.trend_at(at_hour(124));
        assert_eq!(trend.total_24h, 1);
        assert_eq!(trend.samples.len(), 1);
        assert_eq!(trend.samples[0].message, "new");
    }

    #[test]
    fn test_expired_hours_drop_out_without_writes() {
        let analyzer = analyzer(5);
        analyzer.record_error("x", at_hour(100));

        assert_eq!(analyzer.trend_at(at_hour(123)).total_24h, 1);
        assert_eq!(analyzer.trend_at(at_hour(124)).total_24h, 0);
    }

    #[test]
    fn test_rejects_errors_older_than_slot() {
        let analyzer = analyzer(5);
        assert!(analyzer.record_error("new", at_hour(124)));
        assert!(!analyzer.record_error("stale", at_hour(100)));
        assert_eq!(analyzer.trend_at(at_hour(124)).total_24h, 1);
    }

    #[test]
    fn test_future_error_does_not_evict_live_hour() {
        let analyzer = analyzer(5);
        let now_hour = 500_000;
        for _ in 0..10 {
            assert!(analyzer.record_error_at("live", at_hour(now_hour - 19), at_hour(now_hour)));
        }

        // now_hour + 5 shares a slot with now_hour - 19
        assert!(!analyzer.record_error_at("skewed", at_hour(now_hour + 5), at_hour(now_hour)));
        assert!(analyzer.record_error_at("live", at_hour(now_hour - 19), at_hour(now_hour)));

        let trend = analyzer.trend_at(at_hour(now_hour));
        assert_eq!(trend.total_24h, 11);
        assert_eq!(trend.per_hour[4], 11);
    }

    #[test]
    fn test_current_hour_is_accepted() {
        let analyzer = analyzer(5);
        let now = Timestamp::now();
        assert!(analyzer.record_error("now", now));
        assert!(!analyzer.record_error("tomorrow", now.add_duration(Duration::from_secs(2 * 3600))));
        assert_eq!(analyzer.trend().total_24h, 1);
    }

    #[test]
    fn test_sample_messages_are_bounded() {
        let analyzer = analyzer(3);
        for i in 0..10 {
            analyzer.record_error(format!("err {}", i), at_hour(42));
        }

        let trend = analyzer.trend_at(at_hour(42));
        assert_eq!(trend.per_hour[23], 10);
        let messages: Vec<_> = trend.samples.iter().map(|s| s.message.as_str()).collect();
        assert_eq!(messages, vec!["err 7", "err 8", "err 9"]);
    }

    #[rstest]
    #[case(0, 0, TrendDirection::Flat)]
    #[case(3, 0, TrendDirection::Rising)]
    #[case(0, 3, TrendDirection::Falling)]
    #[case(120, 100, TrendDirection::Flat)]
    #[case(121, 100, TrendDirection::Rising)]
    #[case(80, 100, TrendDirection::Flat)]
    #[case(79, 100, TrendDirection::Falling)]
    fn test_direction_margin(#[case] recent: u64, #[case] prior: u64, #[case] expected: TrendDirection) {
        assert_eq!(classify_direction(recent, prior, 20.0), expected);
    }
}
