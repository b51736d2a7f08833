//! Stuck job detection.
//!
//! Stateless per cycle: flags are recomputed from current job records, so a
//! job whose heartbeat resumes simply drops out of the next result.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::StuckJobConfig;
use crate::source::{JobRecord, JobState};
use crate::types::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckReason {
    NoHeartbeat,
    ExceededMaxDuration,
}

impl StuckReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StuckReason::NoHeartbeat => "no_heartbeat",
            StuckReason::ExceededMaxDuration => "exceeded_max_duration",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckJobFlag {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_class: Option<String>,
    pub reason: StuckReason,
    pub detected_at: Timestamp,
    /// Time since the last sign of progress (heartbeat) or since start,
    /// depending on the reason
    #[serde(with = "humantime_serde")]
    pub elapsed_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct StuckJobDetector {
    heartbeat_timeout: Duration,
    max_job_duration: Duration,
    class_limits: HashMap<String, Duration>,
}

impl StuckJobDetector {
    pub fn new(config: &StuckJobConfig) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout,
            max_job_duration: config.max_job_duration,
            class_limits: config
                .job_classes
                .iter()
                .map(|limit| (limit.class.clone(), limit.max_duration))
                .collect(),
        }
    }

    /// Maximum run time for a job class, falling back to the global bound
    pub fn max_duration_for(&self, job_class: Option<&str>) -> Duration {
        job_class
            .and_then(|class| self.class_limits.get(class))
            .copied()
            .unwrap_or(self.max_job_duration)
    }

    /// Flag processing jobs that overran their class bound or went silent.
    /// Each job carries at most one flag; an overrun wins over a missing
    /// heartbeat.
    pub fn detect(&self, jobs: &[JobRecord], now: Timestamp) -> Vec<StuckJobFlag> {
        jobs.iter()
            .filter(|job| job.state == JobState::Processing)
            .filter_map(|job| self.inspect(job, now))
            .collect()
    }

    fn inspect(&self, job: &JobRecord, now: Timestamp) -> Option<StuckJobFlag> {
        let started = job.started_at.unwrap_or(job.enqueued_at);
        let running_for = now.duration_since(started);

        let (reason, elapsed_duration) = if running_for > self.max_duration_for(job.job_class.as_deref()) {
            (StuckReason::ExceededMaxDuration, running_for)
        } else {
            let last_progress = job.last_heartbeat_at.unwrap_or(started);
            let silent_for = now.duration_since(last_progress);
            if silent_for <= self.heartbeat_timeout {
                return None;
            }
            (StuckReason::NoHeartbeat, silent_for)
        };

        Some(StuckJobFlag {
            job_id: job.job_id.clone(),
            job_class: job.job_class.clone(),
            reason,
            detected_at: now,
            elapsed_duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::JobClassLimit;

    const MIN: u64 = 60;

    fn detector() -> StuckJobDetector {
        StuckJobDetector::new(&StuckJobConfig {
            heartbeat_timeout: Duration::from_secs(5 * MIN),
            max_job_duration: Duration::from_secs(60 * MIN),
            job_classes: vec![JobClassLimit {
                class: "report".into(),
                max_duration: Duration::from_secs(10 * MIN),
            }],
        })
    }

    fn processing(id: &str, now: Timestamp, started_ago: u64, heartbeat_ago: Option<u64>) -> JobRecord {
        JobRecord {
            job_id: id.to_string(),
            job_class: None,
            state: JobState::Processing,
            enqueued_at: now.sub_duration(Duration::from_secs(started_ago + 30)),
            started_at: Some(now.sub_duration(Duration::from_secs(started_ago))),
            last_heartbeat_at: heartbeat_ago.map(|ago| now.sub_duration(Duration::from_secs(ago))),
            completed_at: None,
        }
    }

    #[test]
    fn test_missed_heartbeat_is_flagged() {
        let now = Timestamp::from_secs(1_000_000);
        let job = processing("j1", now, 20 * MIN, Some(6 * MIN));

        let flags = detector().detect(&[job], now);
        assert_eq!(
            flags,
            vec![StuckJobFlag {
                job_id: "j1".into(),
                job_class: None,
                reason: StuckReason::NoHeartbeat,
                detected_at: now,
                elapsed_duration: Duration::from_secs(6 * MIN),
            }]
        );
    }

    #[test]
    fn test_fresh_heartbeat_is_not_flagged() {
        let now = Timestamp::from_secs(1_000_000);
        let job = processing("j1", now, 20 * MIN, Some(30));
        assert!(detector().detect(&[job], now).is_empty());
    }

    #[test]
    fn test_heartbeat_exactly_at_timeout_is_not_flagged() {
        let now = Timestamp::from_secs(1_000_000);
        let job = processing("j1", now, 20 * MIN, Some(5 * MIN));
        assert!(detector().detect(&[job], now).is_empty());
    }

    #[test]
    fn test_overrun_takes_precedence() {
        let now = Timestamp::from_secs(1_000_000);
        let job = processing("j1", now, 61 * MIN, Some(30 * MIN));

        let flags = detector().detect(&[job], now);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].reason, StuckReason::ExceededMaxDuration);
        assert_eq!(flags[0].elapsed_duration, Duration::from_secs(61 * MIN));
    }

    #[test]
    fn test_class_limit_overrides_global() {
        let now = Timestamp::from_secs(1_000_000);
        let mut report = processing("r1", now, 11 * MIN, Some(10));
        report.job_class = Some("report".into());
        let mut other = processing("o1", now, 11 * MIN, Some(10));
        other.job_class = Some("unlisted".into());

        let flags = detector().detect(&[report, other], now);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].job_id, "r1");
        assert_eq!(flags[0].reason, StuckReason::ExceededMaxDuration);
    }

    #[test]
    fn test_never_heartbeated_measures_from_start() {
        let now = Timestamp::from_secs(1_000_000);
        let job = processing("j1", now, 7 * MIN, None);

        let flags = detector().detect(&[job], now);
        assert_eq!(flags[0].reason, StuckReason::NoHeartbeat);
        assert_eq!(flags[0].elapsed_duration, Duration::from_secs(7 * MIN));
    }

    #[test]
    fn test_only_processing_jobs_are_flagged() {
        let now = Timestamp::from_secs(1_000_000);
        let jobs: Vec<_> = [JobState::Queued, JobState::Completed, JobState::Failed]
            .into_iter()
            .map(|state| JobRecord {
                state,
                ..processing("x", now, 300 * MIN, None)
            })
            .collect();

        assert!(detector().detect(&jobs, now).is_empty());
    }

    #[test]
    fn test_recovered_job_drops_out() {
        let detector = detector();
        let now = Timestamp::from_secs(1_000_000);
        let mut job = processing("j1", now, 20 * MIN, Some(6 * MIN));
        assert_eq!(detector.detect(std::slice::from_ref(&job), now).len(), 1);

        job.last_heartbeat_at = Some(now);
        assert!(detector.detect(std::slice::from_ref(&job), now).is_empty());
    }
}
