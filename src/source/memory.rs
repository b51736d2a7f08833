//! In-process backend.
//!
//! Implements every collaborator trait over shared in-memory state. The
//! standalone binary uses it as the job/queue store fed by the ingest
//! endpoints; tests use it to script backend behavior.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{
    ConnectionStats, DatabaseIntrospector, JobRecord, JobState, JobStore, QueueIntrospector,
    ResourceReader, ResourceUsage,
};
use crate::error::{SourceError, SourceResult};
use crate::types::Timestamp;

#[derive(Debug)]
pub struct InMemoryBackend {
    resource_usage: RwLock<Option<ResourceUsage>>,
    resource_reads: AtomicU64,
    database_reachable: AtomicBool,
    connection_stats: RwLock<ConnectionStats>,
    cache_reachable: AtomicBool,
    queue_depths: DashMap<String, u64>,
    jobs: DashMap<String, JobRecord>,
    response_delay: RwLock<Duration>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            resource_usage: RwLock::new(Some(ResourceUsage {
                cpu_percent: 10.0,
                memory_percent: 30.0,
                disk_percent: 40.0,
            })),
            resource_reads: AtomicU64::new(0),
            database_reachable: AtomicBool::new(true),
            connection_stats: RwLock::new(ConnectionStats {
                active_connections: 2,
                pool_size: 20,
            }),
            cache_reachable: AtomicBool::new(true),
            queue_depths: DashMap::new(),
            jobs: DashMap::new(),
            response_delay: RwLock::new(Duration::ZERO),
        }
    }

    pub fn set_resource_usage(&self, usage: ResourceUsage) {
        *self.resource_usage.write() = Some(usage);
    }

    /// Make resource reads fail until the next `set_resource_usage`
    pub fn clear_resource_usage(&self) {
        *self.resource_usage.write() = None;
    }

    pub fn resource_reads(&self) -> u64 {
        self.resource_reads.load(Ordering::Relaxed)
    }

    pub fn set_database_reachable(&self, reachable: bool) {
        self.database_reachable.store(reachable, Ordering::Relaxed);
    }

    pub fn set_connection_stats(&self, stats: ConnectionStats) {
        *self.connection_stats.write() = stats;
    }

    pub fn set_cache_reachable(&self, reachable: bool) {
        self.cache_reachable.store(reachable, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, queue_name: impl Into<String>, depth: u64) {
        self.queue_depths.insert(queue_name.into(), depth);
    }

    pub fn upsert_job(&self, job: JobRecord) {
        self.jobs.insert(job.job_id.clone(), job);
    }

    /// Drop completed and failed jobs that finished before `before`.
    /// Returns how many were removed.
    pub fn prune_finished(&self, before: Timestamp) -> usize {
        let mut removed = 0;
        self.jobs.retain(|_, job| {
            let finished = matches!(job.state, JobState::Completed | JobState::Failed);
            let expired = finished && job.completed_at.unwrap_or(job.enqueued_at) < before;
            if expired {
                removed += 1;
            }
            !expired
        });
        removed
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Delay every collaborator call, to exercise source timeouts
    pub fn set_response_delay(&self, delay: Duration) {
        *self.response_delay.write() = delay;
    }

    async fn respond(&self) {
        let delay = *self.response_delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceReader for InMemoryBackend {
    async fn read_resource_usage(&self) -> SourceResult<ResourceUsage> {
        self.respond().await;
        self.resource_reads.fetch_add(1, Ordering::Relaxed);
        let usage = *self.resource_usage.read();
        usage.ok_or_else(|| SourceError::unavailable("os.resources", "no resource usage reported"))
    }
}

#[async_trait]
impl DatabaseIntrospector for InMemoryBackend {
    async fn read_connection_stats(&self) -> SourceResult<ConnectionStats> {
        self.respond().await;
        Ok(*self.connection_stats.read())
    }

    async fn ping(&self) -> bool {
        self.respond().await;
        self.database_reachable.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl QueueIntrospector for InMemoryBackend {
    async fn read_queue_depth(&self, queue_name: &str) -> SourceResult<u64> {
        self.respond().await;
        if !self.cache_reachable.load(Ordering::Relaxed) {
            return Err(SourceError::unavailable("jobs.queued", "queue backend unreachable"));
        }
        Ok(self.queue_depths.get(queue_name).map(|d| *d).unwrap_or(0))
    }

    async fn ping(&self) -> bool {
        self.respond().await;
        self.cache_reachable.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl JobStore for InMemoryBackend {
    async fn list_jobs(&self, state_filter: Option<JobState>) -> SourceResult<Vec<JobRecord>> {
        self.respond().await;
        let mut jobs: Vec<JobRecord> = self
            .jobs
            .iter()
            .filter(|entry| state_filter.map_or(true, |state| entry.state == state))
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then_with(|| a.job_id.cmp(&b.job_id)));
        Ok(jobs)
    }
}
