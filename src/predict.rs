//! Queue wait prediction from recent completion throughput.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::QueuePredictionConfig;
use crate::types::Timestamp;

const MIN_OBSERVED_SPAN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePrediction {
    pub queue_depth: u64,
    pub estimated_wait_seconds: f64,
    pub throughput_per_minute: f64,
    pub confidence: Confidence,
    pub completions_in_window: u64,
    /// The estimate hit the maximum displayable wait
    pub capped: bool,
    pub computed_at: Timestamp,
}

impl Default for QueuePrediction {
    fn default() -> Self {
        Self {
            queue_depth: 0,
            estimated_wait_seconds: 0.0,
            throughput_per_minute: 0.0,
            confidence: Confidence::Low,
            completions_in_window: 0,
            capped: false,
            computed_at: Timestamp::EPOCH,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueWaitPredictor {
    window: Duration,
    min_samples: usize,
    max_wait: Duration,
    throughput_floor: f64,
}

impl QueueWaitPredictor {
    pub fn new(config: &QueuePredictionConfig) -> Self {
        Self {
            window: config.window,
            min_samples: config.min_samples,
            max_wait: config.max_wait,
            throughput_floor: config.throughput_floor,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Completions per minute inside the trailing window.
    ///
    /// The rate is taken over the span actually observed (now minus the
    /// oldest completion in the window), floored at one minute so a burst
    /// cannot produce an absurd rate, and never longer than the window.
    pub fn throughput_per_minute(&self, completions: &[Timestamp], now: Timestamp) -> (f64, u64) {
        let cutoff = now.sub_duration(self.window);
        let mut count = 0u64;
        let mut oldest: Option<Timestamp> = None;
        for &completed_at in completions {
            if completed_at < cutoff || completed_at > now {
                continue;
            }
            count += 1;
            oldest = Some(oldest.map_or(completed_at, |o| o.min(completed_at)));
        }

        let Some(oldest) = oldest else {
            return (0.0, 0);
        };
        let span = now
            .duration_since(oldest)
            .clamp(MIN_OBSERVED_SPAN, self.window.max(MIN_OBSERVED_SPAN));
        (count as f64 / (span.as_secs_f64() / 60.0), count)
    }

    pub fn predict(&self, queue_depth: u64, recent_completions: &[Timestamp], now: Timestamp) -> QueuePrediction {
        let (throughput_per_minute, count) = self.throughput_per_minute(recent_completions, now);

        let mut confidence = if count as usize >= self.min_samples {
            Confidence::High
        } else if count > 0 {
            Confidence::Medium
        } else {
            Confidence::Low
        };

        let max_wait = self.max_wait.as_secs_f64();
        let (estimated_wait_seconds, capped) = if queue_depth == 0 {
            (0.0, false)
        } else {
            if throughput_per_minute < self.throughput_floor {
                confidence = Confidence::Low;
            }
            let raw = queue_depth as f64 / throughput_per_minute.max(self.throughput_floor) * 60.0;
            if raw > max_wait {
                (max_wait, true)
            } else {
                (raw, false)
            }
        };

        QueuePrediction {
            queue_depth,
            estimated_wait_seconds,
            throughput_per_minute,
            confidence,
            completions_in_window: count,
            capped,
            computed_at: now,
        }
    }
}
