//! Health aggregation.
//!
//! Samples every configured metric source concurrently, classifies each
//! reading against its two-level threshold and folds the result into one
//! overall status. A failed or invalid reading never fails the cycle: the
//! subsystem is reported degraded with its last known good value.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ThresholdsConfig;
use crate::source::{MetricSample, MetricSource, ProcessUsage, ResourceSource, SampleStatus, Unit};
use crate::types::{HealthStatus, Timestamp};

// ----------------------------------------------------------------------------
// Subsystems
// ----------------------------------------------------------------------------

/// Every subsystem the engine knows how to sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    Cpu,
    Memory,
    Disk,
    Database,
    Cache,
    ActiveJobs,
    QueuedJobs,
}

impl Subsystem {
    pub const ALL: [Subsystem; 7] = [
        Subsystem::Cpu,
        Subsystem::Memory,
        Subsystem::Disk,
        Subsystem::Database,
        Subsystem::Cache,
        Subsystem::ActiveJobs,
        Subsystem::QueuedJobs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Cpu => "cpu",
            Subsystem::Memory => "memory",
            Subsystem::Disk => "disk",
            Subsystem::Database => "database",
            Subsystem::Cache => "cache",
            Subsystem::ActiveJobs => "active_jobs",
            Subsystem::QueuedJobs => "queued_jobs",
        }
    }

    /// Identifier stamped on samples of this subsystem
    pub fn source_id(&self) -> &'static str {
        match self {
            Subsystem::Cpu => "os.cpu",
            Subsystem::Memory => "os.memory",
            Subsystem::Disk => "os.disk",
            Subsystem::Database => "db.pool",
            Subsystem::Cache => "cache.ping",
            Subsystem::ActiveJobs => "jobs.active",
            Subsystem::QueuedJobs => "jobs.queued",
        }
    }

    pub fn unit(&self) -> Unit {
        match self {
            Subsystem::Cpu | Subsystem::Memory | Subsystem::Disk | Subsystem::Database => Unit::Percent,
            Subsystem::Cache => Unit::Milliseconds,
            Subsystem::ActiveJobs | Subsystem::QueuedJobs => Unit::Count,
        }
    }
}

impl Display for Subsystem {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Thresholds
// ----------------------------------------------------------------------------

/// Warning/critical pair. Boundaries are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
}

impl Threshold {
    pub const fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }

    pub fn classify(&self, value: f64) -> HealthStatus {
        if value >= self.critical {
            HealthStatus::Unhealthy
        } else if value >= self.warning {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

// ----------------------------------------------------------------------------
// Snapshots
// ----------------------------------------------------------------------------

/// Health of a single subsystem within one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsystemHealth {
    pub status: HealthStatus,
    pub latest_value: Option<f64>,
    pub unit: Unit,
    pub threshold_breached: bool,
    pub sample_status: SampleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<Threshold>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubsystemHealth {
    fn from_sample(sample: &MetricSample, threshold: Option<Threshold>) -> Self {
        let (status, threshold_breached) = match (sample.status, sample.value, threshold) {
            (SampleStatus::Ok, Some(value), Some(threshold)) => {
                let status = threshold.classify(value);
                (status, status != HealthStatus::Healthy)
            }
            (SampleStatus::Ok, _, _) => (HealthStatus::Healthy, false),
            _ => (HealthStatus::Degraded, false),
        };

        Self {
            status,
            latest_value: sample.value,
            unit: sample.unit,
            threshold_breached,
            sample_status: sample.status,
            threshold,
            error: sample.error.clone(),
        }
    }
}

/// Point-in-time health of the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub overall_status: HealthStatus,
    pub per_subsystem: BTreeMap<Subsystem, SubsystemHealth>,
    pub computed_at: Timestamp,
}

impl HealthSnapshot {
    pub fn status_of(&self, subsystem: Subsystem) -> Option<HealthStatus> {
        self.per_subsystem.get(&subsystem).map(|h| h.status)
    }
}

/// Served before the first health cycle completes: nothing is known yet, so
/// nothing is claimed healthy.
impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            overall_status: HealthStatus::Degraded,
            per_subsystem: BTreeMap::new(),
            computed_at: Timestamp::EPOCH,
        }
    }
}

/// Raw readings behind a health snapshot, served as the resources view
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceReadings {
    pub samples: BTreeMap<Subsystem, MetricSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessUsage>,
    pub computed_at: Timestamp,
}

/// Output of one health cycle
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub snapshot: HealthSnapshot,
    pub readings: ResourceReadings,
}

// ----------------------------------------------------------------------------
// Aggregator
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct HealthAggregator {
    sources: Vec<Arc<dyn MetricSource>>,
    process: Option<Arc<ResourceSource>>,
    thresholds: ThresholdsConfig,
}

impl HealthAggregator {
    pub fn new(sources: Vec<Arc<dyn MetricSource>>, thresholds: ThresholdsConfig) -> Self {
        Self {
            sources,
            process: None,
            thresholds,
        }
    }

    /// Also report the engine's own process usage alongside the readings
    pub fn with_process_usage(mut self, source: Arc<ResourceSource>) -> Self {
        self.process = Some(source);
        self
    }

    /// Run one health cycle. `previous` supplies last known good values for
    /// subsystems whose source fails this time.
    pub async fn poll_health(&self, previous: Option<&ResourceReadings>) -> HealthReport {
        let sampling = join_all(self.sources.iter().map(|source| source.sample_all()));
        let process = async {
            match &self.process {
                Some(source) => match source.process_usage().await {
                    Ok(usage) => Some(usage),
                    Err(e) => {
                        debug!(target: "vigil::health", error = %e, "Process usage unavailable");
                        None
                    }
                },
                None => None,
            }
        };
        let (results, process) = tokio::join!(sampling, process);
        let now = Timestamp::now();

        let mut readings = ResourceReadings {
            samples: BTreeMap::new(),
            process,
            computed_at: now,
        };
        for (subsystem, result) in results.into_iter().flatten() {
            let last_known_good = previous.and_then(|p| p.samples.get(&subsystem));
            let sample = match result {
                Ok(sample) => match sample.validate() {
                    Ok(()) => sample,
                    Err(e) => {
                        warn!(
                            target: "vigil::health",
                            subsystem = %subsystem,
                            error = %e,
                            "Discarding out-of-range sample"
                        );
                        MetricSample::degraded(subsystem, SampleStatus::Invalid, &e, last_known_good, now)
                    }
                },
                Err(e) => {
                    warn!(
                        target: "vigil::health",
                        subsystem = %subsystem,
                        error = %e,
                        hint = ?e.recovery_hint(),
                        "Metric source unavailable"
                    );
                    MetricSample::degraded(subsystem, SampleStatus::Unavailable, &e, last_known_good, now)
                }
            };
            readings.samples.insert(subsystem, sample);
        }

        let snapshot = self.classify(&readings, now);
        HealthReport { snapshot, readings }
    }

    /// Classify readings against the configured thresholds
    pub fn classify(&self, readings: &ResourceReadings, now: Timestamp) -> HealthSnapshot {
        let per_subsystem: BTreeMap<_, _> = readings
            .samples
            .iter()
            .map(|(&subsystem, sample)| {
                (
                    subsystem,
                    SubsystemHealth::from_sample(sample, self.thresholds.get(subsystem)),
                )
            })
            .collect();

        let overall_status = per_subsystem
            .values()
            .map(|h| h.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        HealthSnapshot {
            overall_status,
            per_subsystem,
            computed_at: now,
        }
    }
}
