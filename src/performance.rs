//! Request outcome tracking.
//!
//! A bounded rolling window of outcome events, evicted lazily on insert and
//! on summary. The window is bounded both by event count and by age,
//! whichever is smaller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::PerformanceConfig;
use crate::error::{MonitorError, MonitorResult};
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Outcome Events
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub timestamp: Timestamp,
    pub duration_ms: f64,
    pub outcome: Outcome,
}

/// Aggregate view of the current window.
///
/// Every statistic is `None` when the window is empty so consumers can tell
/// "no traffic" apart from "all failures".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub success_rate: Option<f64>,
    pub error_rate: Option<f64>,
    pub avg_duration_ms: Option<f64>,
    pub p50_duration_ms: Option<f64>,
    pub p95_duration_ms: Option<f64>,
    pub p99_duration_ms: Option<f64>,
    pub min_duration_ms: Option<f64>,
    pub max_duration_ms: Option<f64>,
    pub sample_count: u64,
    /// Events ever accepted, including evicted ones
    pub total_ingested: u64,
    pub window_start: Option<Timestamp>,
    pub computed_at: Timestamp,
}

impl Default for PerformanceSummary {
    fn default() -> Self {
        Self {
            success_rate: None,
            error_rate: None,
            avg_duration_ms: None,
            p50_duration_ms: None,
            p95_duration_ms: None,
            p99_duration_ms: None,
            min_duration_ms: None,
            max_duration_ms: None,
            sample_count: 0,
            total_ingested: 0,
            window_start: None,
            computed_at: Timestamp::EPOCH,
        }
    }
}

/// Nearest-rank percentile over an ascending slice: rank = ceil(p * n).
pub fn nearest_rank(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = ((p * n as f64).ceil() as usize).clamp(1, n);
    Some(sorted[rank - 1])
}

// ----------------------------------------------------------------------------
// Tracker
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct PerformanceTracker {
    window: Mutex<VecDeque<OutcomeEvent>>,
    total_ingested: AtomicU64,
    max_events: usize,
    max_age: Duration,
}

impl PerformanceTracker {
    pub fn new(config: &PerformanceConfig) -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(config.max_events.min(4096))),
            total_ingested: AtomicU64::new(0),
            max_events: config.max_events,
            max_age: config.max_age,
        }
    }

    pub fn record_outcome(&self, duration_ms: f64, outcome: Outcome) -> MonitorResult<()> {
        self.record_outcome_at(Timestamp::now(), duration_ms, outcome)
    }

    /// Append one event. Durations must be finite and non-negative.
    pub fn record_outcome_at(
        &self,
        timestamp: Timestamp,
        duration_ms: f64,
        outcome: Outcome,
    ) -> MonitorResult<()> {
        if !duration_ms.is_finite() || duration_ms < 0.0 {
            return Err(MonitorError::invalid_sample(
                "performance",
                format!("duration_ms must be finite and non-negative, got {}", duration_ms),
            ));
        }

        let mut window = self.window.lock();
        window.push_back(OutcomeEvent {
            timestamp,
            duration_ms,
            outcome,
        });
        self.total_ingested.fetch_add(1, Ordering::Relaxed);
        self.evict_locked(&mut window, timestamp.max(Timestamp::now()));
        Ok(())
    }

    /// Drop expired events without producing a summary
    pub fn maintain(&self, now: Timestamp) -> usize {
        let mut window = self.window.lock();
        self.evict_locked(&mut window, now)
    }

    fn evict_locked(&self, window: &mut VecDeque<OutcomeEvent>, now: Timestamp) -> usize {
        let before = window.len();
        while window.len() > self.max_events {
            window.pop_front();
        }
        let cutoff = now.sub_duration(self.max_age);
        while window.front().map_or(false, |e| e.timestamp < cutoff) {
            window.pop_front();
        }
        before - window.len()
    }

    pub fn len(&self) -> usize {
        self.window.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_ingested(&self) -> u64 {
        self.total_ingested.load(Ordering::Relaxed)
    }

    pub fn summarize(&self) -> PerformanceSummary {
        self.summarize_at(Timestamp::now())
    }

    pub fn summarize_at(&self, now: Timestamp) -> PerformanceSummary {
        let cutoff = now.sub_duration(self.max_age);
        let (mut durations, successes, window_start, total_ingested) = {
            let mut window = self.window.lock();
            self.evict_locked(&mut window, now);
            let retained: Vec<&OutcomeEvent> = window.iter().filter(|e| e.timestamp >= cutoff).collect();
            let durations: Vec<f64> = retained.iter().map(|e| e.duration_ms).collect();
            let successes = retained.iter().filter(|e| e.outcome == Outcome::Success).count();
            let window_start = retained.iter().map(|e| e.timestamp).min();
            (durations, successes, window_start, self.total_ingested())
        };

        let sample_count = durations.len();
        if sample_count == 0 {
            return PerformanceSummary {
                total_ingested,
                computed_at: now,
                ..PerformanceSummary::default()
            };
        }

        durations.sort_by(|a, b| a.total_cmp(b));
        let n = sample_count as f64;
        let success_rate = successes as f64 / n;

        PerformanceSummary {
            success_rate: Some(success_rate),
            error_rate: Some((sample_count - successes) as f64 / n),
            avg_duration_ms: Some(durations.iter().sum::<f64>() / n),
            p50_duration_ms: nearest_rank(&durations, 0.50),
            p95_duration_ms: nearest_rank(&durations, 0.95),
            p99_duration_ms: nearest_rank(&durations, 0.99),
            min_duration_ms: durations.first().copied(),
            max_duration_ms: durations.last().copied(),
            sample_count: sample_count as u64,
            total_ingested,
            window_start,
            computed_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    fn tracker(max_events: usize, max_age: Duration) -> PerformanceTracker {
        PerformanceTracker::new(&PerformanceConfig { max_events, max_age })
    }

    #[test]
    fn test_empty_window_has_undefined_rates() {
        let tracker = tracker(100, Duration::from_secs(900));
        let summary = tracker.summarize();

        assert_eq!(summary.sample_count, 0);
        assert_eq!(summary.success_rate, None);
        assert_eq!(summary.error_rate, None);
        assert_eq!(summary.p95_duration_ms, None);

        let json = serde_json::to_value(&summary).unwrap();
        assert!(json["success_rate"].is_null());
        assert!(json["error_rate"].is_null());
    }

    #[test]
    fn test_summary_statistics() {
        let tracker = tracker(1_000, Duration::from_secs(900));
        let now = Timestamp::now();
        for i in 1..=20 {
            let outcome = if i % 5 == 0 { Outcome::Error } else { Outcome::Success };
            tracker
                .record_outcome_at(now, (i * 10) as f64, outcome)
                .unwrap();
        }

        let summary = tracker.summarize_at(now);
        assert_eq!(summary.sample_count, 20);
        assert_eq!(summary.success_rate, Some(0.8));
        assert_eq!(summary.error_rate, Some(0.2));
        assert_eq!(summary.avg_duration_ms, Some(105.0));
        assert_eq!(summary.p50_duration_ms, Some(100.0));
        assert_eq!(summary.p95_duration_ms, Some(190.0));
        assert_eq!(summary.p99_duration_ms, Some(200.0));
        assert_eq!(summary.min_duration_ms, Some(10.0));
        assert_eq!(summary.max_duration_ms, Some(200.0));
    }

    #[test]
    fn test_all_failures_is_not_undefined() {
        let tracker = tracker(10, Duration::from_secs(900));
        let now = Timestamp::now();
        tracker.record_outcome_at(now, 5.0, Outcome::Error).unwrap();

        let summary = tracker.summarize_at(now);
        assert_eq!(summary.success_rate, Some(0.0));
        assert_eq!(summary.error_rate, Some(1.0));
    }

    #[test]
    fn test_age_eviction() {
        let tracker = tracker(100, Duration::from_secs(60));
        let now = Timestamp::now();
        tracker
            .record_outcome_at(now.sub_duration(Duration::from_secs(120)), 1.0, Outcome::Success)
            .unwrap();
        tracker.record_outcome_at(now, 2.0, Outcome::Success).unwrap();

        let summary = tracker.summarize_at(now);
        assert_eq!(summary.sample_count, 1);
        assert_eq!(summary.min_duration_ms, Some(2.0));
        assert_eq!(summary.total_ingested, 2);
    }

    #[test]
    fn test_rejects_invalid_duration() {
        let tracker = tracker(10, Duration::from_secs(60));
        assert!(tracker.record_outcome(-1.0, Outcome::Success).is_err());
        assert!(tracker.record_outcome(f64::NAN, Outcome::Success).is_err());
        assert_eq!(tracker.total_ingested(), 0);
    }

    #[test]
    fn test_nearest_rank() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(nearest_rank(&sorted, 0.5), Some(2.0));
        assert_eq!(nearest_rank(&sorted, 0.95), Some(4.0));
        assert_eq!(nearest_rank(&sorted, 0.0), Some(1.0));
        assert_eq!(nearest_rank(&[], 0.5), None);
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        let tracker = std::sync::Arc::new(tracker(100_000, Duration::from_secs(900)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        tracker.record_outcome(1.0, Outcome::Success).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.len(), 8_000);
        assert_eq!(tracker.total_ingested(), 8_000);
    }

    proptest! {
        #[test]
        fn prop_retains_most_recent_subset(
            durations in prop::collection::vec(0.0f64..10_000.0, 0..300),
            max_events in 1usize..64,
        ) {
            let tracker = tracker(max_events, Duration::from_secs(3_600));
            let now = Timestamp::now();
            for &d in &durations {
                tracker.record_outcome_at(now, d, Outcome::Success).unwrap();
            }

            let retained: Vec<f64> = tracker.window.lock().iter().map(|e| e.duration_ms).collect();
            let expected_len = durations.len().min(max_events);
            prop_assert_eq!(retained.len(), expected_len);
            prop_assert_eq!(&retained[..], &durations[durations.len() - expected_len..]);
            prop_assert!(tracker.total_ingested() >= retained.len() as u64);
            prop_assert_eq!(tracker.total_ingested(), durations.len() as u64);
        }
    }
}
