//! Metric sources.
//!
//! Thin polling adapters over the external collaborators of the engine (OS
//! resource reader, database introspection, cache/queue introspection, job
//! store). Every adapter wraps exactly one collaborator and bounds each call
//! with its own timeout so one slow backend cannot stall a poll cycle.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, SourceError, SourceResult};
use crate::health::Subsystem;
use crate::log_source;
use crate::types::Timestamp;

pub mod memory;
pub mod system;

pub use memory::InMemoryBackend;
pub use system::SysinfoReader;

// ----------------------------------------------------------------------------
// Metric Sample
// ----------------------------------------------------------------------------

/// Unit of a sampled value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Percent,
    Milliseconds,
    Count,
}

/// Outcome of taking one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    Ok,
    /// The backend could not be read within its timeout
    Unavailable,
    /// The backend answered with a reading outside its valid range
    Invalid,
}

/// One point reading from a metric source. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub source_id: CompactString,
    /// Current reading, or the last known good value when degraded
    pub value: Option<f64>,
    pub unit: Unit,
    pub timestamp: Timestamp,
    pub status: SampleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MetricSample {
    pub fn ok(subsystem: Subsystem, value: f64, timestamp: Timestamp) -> Self {
        Self {
            source_id: CompactString::from(subsystem.source_id()),
            value: Some(value),
            unit: subsystem.unit(),
            timestamp,
            status: SampleStatus::Ok,
            error: None,
        }
    }

    /// Build the degraded stand-in for a failed sample, carrying the last
    /// known good value forward when one exists.
    pub fn degraded(
        subsystem: Subsystem,
        status: SampleStatus,
        error: &(dyn std::error::Error + 'static),
        last_known_good: Option<&MetricSample>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            source_id: CompactString::from(subsystem.source_id()),
            value: last_known_good.and_then(|s| s.value),
            unit: subsystem.unit(),
            timestamp,
            status,
            error: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == SampleStatus::Ok
    }

    /// Range check applied to every fresh reading
    pub fn validate(&self) -> Result<(), MonitorError> {
        let Some(value) = self.value else {
            return Err(MonitorError::invalid_sample(self.source_id.as_str(), "missing value"));
        };
        if !value.is_finite() {
            return Err(MonitorError::invalid_sample(
                self.source_id.as_str(),
                format!("non-finite value {}", value),
            ));
        }
        if value < 0.0 {
            return Err(MonitorError::invalid_sample(
                self.source_id.as_str(),
                format!("negative value {}", value),
            ));
        }
        if self.unit == Unit::Percent && value > 100.0 {
            return Err(MonitorError::invalid_sample(
                self.source_id.as_str(),
                format!("percentage {} above 100", value),
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// External Collaborators
// ----------------------------------------------------------------------------

/// Host resource usage in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

/// Resource usage of the engine's own process
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessUsage {
    pub pid: u32,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

/// Database connection pool introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub active_connections: u32,
    pub pool_size: u32,
}

#[async_trait]
pub trait ResourceReader: Send + Sync + Debug {
    async fn read_resource_usage(&self) -> SourceResult<ResourceUsage>;

    async fn read_process_usage(&self) -> SourceResult<ProcessUsage> {
        Err(SourceError::unavailable("os.process", "process usage not supported"))
    }
}

#[async_trait]
pub trait DatabaseIntrospector: Send + Sync + Debug {
    async fn read_connection_stats(&self) -> SourceResult<ConnectionStats>;
    async fn ping(&self) -> bool;
}

#[async_trait]
pub trait QueueIntrospector: Send + Sync + Debug {
    async fn read_queue_depth(&self, queue_name: &str) -> SourceResult<u64>;
    async fn ping(&self) -> bool;
}

/// Lifecycle state of a job record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// Read-only view of a job owned by the job store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    #[serde(default)]
    pub job_class: Option<String>,
    pub state: JobState,
    pub enqueued_at: Timestamp,
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    #[serde(default)]
    pub last_heartbeat_at: Option<Timestamp>,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
}

#[async_trait]
pub trait JobStore: Send + Sync + Debug {
    /// List jobs, optionally restricted to one state
    async fn list_jobs(&self, state_filter: Option<JobState>) -> SourceResult<Vec<JobRecord>>;
}

// ----------------------------------------------------------------------------
// Metric Source Trait
// ----------------------------------------------------------------------------

/// A polling adapter that turns one collaborator into metric samples.
#[async_trait]
pub trait MetricSource: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Subsystems this source can sample
    fn subsystems(&self) -> &'static [Subsystem];

    async fn sample(&self, subsystem: Subsystem) -> SourceResult<MetricSample>;

    /// Sample every subsystem of this source. Adapters whose collaborator
    /// returns several readings in one call override this.
    async fn sample_all(&self) -> Vec<(Subsystem, SourceResult<MetricSample>)> {
        let mut out = Vec::with_capacity(self.subsystems().len());
        for &subsystem in self.subsystems() {
            out.push((subsystem, self.sample(subsystem).await));
        }
        out
    }
}

/// Bound a collaborator call by `limit`, mapping expiry to a timeout error.
pub async fn with_timeout<T, F>(source_id: &str, limit: Duration, fut: F) -> SourceResult<T>
where
    F: Future<Output = SourceResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            log_source!(source_id, "timeout", timeout_ms = limit.as_millis() as u64);
            Err(SourceError::timeout(source_id, limit.as_millis() as u64))
        }
    }
}

fn unsupported(source: &str, subsystem: Subsystem) -> SourceError {
    SourceError::invalid_response(
        subsystem.source_id(),
        format!("source '{}' does not sample {}", source, subsystem),
    )
}

// ----------------------------------------------------------------------------
// OS Resource Source
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ResourceSource {
    reader: Arc<dyn ResourceReader>,
    timeout: Duration,
}

impl ResourceSource {
    pub fn new(reader: Arc<dyn ResourceReader>, timeout: Duration) -> Self {
        Self { reader, timeout }
    }

    async fn read(&self) -> SourceResult<ResourceUsage> {
        with_timeout("os.resources", self.timeout, self.reader.read_resource_usage()).await
    }

    fn pick(subsystem: Subsystem, usage: &ResourceUsage, now: Timestamp) -> SourceResult<MetricSample> {
        let value = match subsystem {
            Subsystem::Cpu => usage.cpu_percent,
            Subsystem::Memory => usage.memory_percent,
            Subsystem::Disk => usage.disk_percent,
            other => return Err(unsupported("resources", other)),
        };
        Ok(MetricSample::ok(subsystem, value, now))
    }

    /// Usage of the engine process itself, bounded like every other call
    pub async fn process_usage(&self) -> SourceResult<ProcessUsage> {
        with_timeout("os.process", self.timeout, self.reader.read_process_usage()).await
    }
}

#[async_trait]
impl MetricSource for ResourceSource {
    fn name(&self) -> &str {
        "resources"
    }

    fn subsystems(&self) -> &'static [Subsystem] {
        &[Subsystem::Cpu, Subsystem::Memory, Subsystem::Disk]
    }

    async fn sample(&self, subsystem: Subsystem) -> SourceResult<MetricSample> {
        let usage = self.read().await?;
        Self::pick(subsystem, &usage, Timestamp::now())
    }

    async fn sample_all(&self) -> Vec<(Subsystem, SourceResult<MetricSample>)> {
        let result = self.read().await;
        let now = Timestamp::now();
        self.subsystems()
            .iter()
            .map(|&subsystem| {
                let sample = match &result {
                    Ok(usage) => Self::pick(subsystem, usage, now),
                    Err(e) => Err(e.clone()),
                };
                (subsystem, sample)
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Database Source
// ----------------------------------------------------------------------------

/// Samples connection pool utilization; an unanswered ping makes the
/// database unavailable.
#[derive(Debug, Clone)]
pub struct DatabaseSource {
    db: Arc<dyn DatabaseIntrospector>,
    timeout: Duration,
}

impl DatabaseSource {
    pub fn new(db: Arc<dyn DatabaseIntrospector>, timeout: Duration) -> Self {
        Self { db, timeout }
    }
}

#[async_trait]
impl MetricSource for DatabaseSource {
    fn name(&self) -> &str {
        "database"
    }

    fn subsystems(&self) -> &'static [Subsystem] {
        &[Subsystem::Database]
    }

    async fn sample(&self, subsystem: Subsystem) -> SourceResult<MetricSample> {
        if subsystem != Subsystem::Database {
            return Err(unsupported(self.name(), subsystem));
        }
        let source_id = subsystem.source_id();

        let stats = with_timeout(source_id, self.timeout, async {
            if !self.db.ping().await {
                return Err(SourceError::unavailable(source_id, "ping failed"));
            }
            self.db.read_connection_stats().await
        })
        .await?;

        if stats.pool_size == 0 {
            return Err(SourceError::invalid_response(source_id, "connection pool size is zero"));
        }

        let utilization = stats.active_connections as f64 / stats.pool_size as f64 * 100.0;
        Ok(MetricSample::ok(subsystem, utilization, Timestamp::now()))
    }
}

// ----------------------------------------------------------------------------
// Cache / Queue Backend Source
// ----------------------------------------------------------------------------

/// Samples round-trip ping latency of the cache/queue backend.
#[derive(Debug, Clone)]
pub struct CacheSource {
    backend: Arc<dyn QueueIntrospector>,
    timeout: Duration,
}

impl CacheSource {
    pub fn new(backend: Arc<dyn QueueIntrospector>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }
}

#[async_trait]
impl MetricSource for CacheSource {
    fn name(&self) -> &str {
        "cache"
    }

    fn subsystems(&self) -> &'static [Subsystem] {
        &[Subsystem::Cache]
    }

    async fn sample(&self, subsystem: Subsystem) -> SourceResult<MetricSample> {
        if subsystem != Subsystem::Cache {
            return Err(unsupported(self.name(), subsystem));
        }
        let source_id = subsystem.source_id();

        let started = Instant::now();
        with_timeout(source_id, self.timeout, async {
            if self.backend.ping().await {
                Ok(())
            } else {
                Err(SourceError::unavailable(source_id, "ping failed"))
            }
        })
        .await?;

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        Ok(MetricSample::ok(subsystem, latency_ms, Timestamp::now()))
    }
}

// ----------------------------------------------------------------------------
// Job Count Source
// ----------------------------------------------------------------------------

/// Samples processing job count from the job store and waiting job count
/// summed over the monitored queues.
#[derive(Debug, Clone)]
pub struct JobCountSource {
    jobs: Arc<dyn JobStore>,
    queues: Arc<dyn QueueIntrospector>,
    queue_names: Vec<String>,
    timeout: Duration,
}

impl JobCountSource {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queues: Arc<dyn QueueIntrospector>,
        queue_names: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            jobs,
            queues,
            queue_names,
            timeout,
        }
    }
}

/// Sum of the depths of `names`, failing if any queue cannot be read.
pub async fn total_queue_depth(queues: &dyn QueueIntrospector, names: &[String]) -> SourceResult<u64> {
    let mut total = 0u64;
    for name in names {
        total = total.saturating_add(queues.read_queue_depth(name).await?);
    }
    Ok(total)
}

#[async_trait]
impl MetricSource for JobCountSource {
    fn name(&self) -> &str {
        "jobs"
    }

    fn subsystems(&self) -> &'static [Subsystem] {
        &[Subsystem::ActiveJobs, Subsystem::QueuedJobs]
    }

    async fn sample(&self, subsystem: Subsystem) -> SourceResult<MetricSample> {
        let source_id = subsystem.source_id();
        let count = match subsystem {
            Subsystem::ActiveJobs => {
                let jobs = with_timeout(
                    source_id,
                    self.timeout,
                    self.jobs.list_jobs(Some(JobState::Processing)),
                )
                .await?;
                jobs.len() as u64
            }
            Subsystem::QueuedJobs => {
                with_timeout(
                    source_id,
                    self.timeout,
                    total_queue_depth(self.queues.as_ref(), &self.queue_names),
                )
                .await?
            }
            other => return Err(unsupported(self.name(), other)),
        };
        Ok(MetricSample::ok(subsystem, count as f64, Timestamp::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_validation() {
        let now = Timestamp::from_secs(1_000);
        assert!(MetricSample::ok(Subsystem::Cpu, 42.0, now).validate().is_ok());
        assert!(MetricSample::ok(Subsystem::Cpu, 100.5, now).validate().is_err());
        assert!(MetricSample::ok(Subsystem::Memory, f64::NAN, now).validate().is_err());
        assert!(MetricSample::ok(Subsystem::QueuedJobs, -1.0, now).validate().is_err());
        // counts are not capped at 100
        assert!(MetricSample::ok(Subsystem::QueuedJobs, 12_000.0, now).validate().is_ok());
    }

    #[test]
    fn test_degraded_carries_last_known_good() {
        let now = Timestamp::from_secs(2_000);
        let previous = MetricSample::ok(Subsystem::Disk, 61.0, Timestamp::from_secs(1_970));
        let err = SourceError::timeout("os.disk", 2000);

        let sample = MetricSample::degraded(Subsystem::Disk, SampleStatus::Unavailable, &err, Some(&previous), now);
        assert_eq!(sample.value, Some(61.0));
        assert_eq!(sample.status, SampleStatus::Unavailable);
        assert_eq!(sample.timestamp, now);
        assert!(sample.error.as_deref().unwrap().contains("Timeout"));

        let sample = MetricSample::degraded(Subsystem::Disk, SampleStatus::Unavailable, &err, None, now);
        assert_eq!(sample.value, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_maps_expiry() {
        let result: SourceResult<()> = with_timeout("slow", Duration::from_secs(2), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        assert_eq!(result, Err(SourceError::timeout("slow", 2000)));
    }

    #[tokio::test]
    async fn test_resource_source_reads_once_for_all_subsystems() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.set_resource_usage(ResourceUsage {
            cpu_percent: 12.0,
            memory_percent: 34.0,
            disk_percent: 56.0,
        });
        let source = ResourceSource::new(backend.clone(), Duration::from_secs(2));

        let samples = source.sample_all().await;
        let values: Vec<_> = samples
            .iter()
            .map(|(s, r)| (*s, r.as_ref().unwrap().value))
            .collect();
        assert_eq!(
            values,
            vec![
                (Subsystem::Cpu, Some(12.0)),
                (Subsystem::Memory, Some(34.0)),
                (Subsystem::Disk, Some(56.0)),
            ]
        );
        assert_eq!(backend.resource_reads(), 1);
    }

    #[tokio::test]
    async fn test_database_source_ping_failure_is_unavailable() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.set_database_reachable(false);
        let source = DatabaseSource::new(backend, Duration::from_secs(2));

        let err = source.sample(Subsystem::Database).await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_database_source_reports_pool_utilization() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.set_connection_stats(ConnectionStats {
            active_connections: 15,
            pool_size: 20,
        });
        let source = DatabaseSource::new(backend, Duration::from_secs(2));

        let sample = source.sample(Subsystem::Database).await.unwrap();
        assert_eq!(sample.value, Some(75.0));
        assert_eq!(sample.unit, Unit::Percent);
    }

    #[tokio::test]
    async fn test_job_count_source_sums_queues() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.set_queue_depth("default", 7);
        backend.set_queue_depth("mailers", 5);
        let source = JobCountSource::new(
            backend.clone(),
            backend,
            vec!["default".into(), "mailers".into()],
            Duration::from_secs(2),
        );

        let sample = source.sample(Subsystem::QueuedJobs).await.unwrap();
        assert_eq!(sample.value, Some(12.0));
    }
}
