//! Monitor: the engine facade.
//!
//! Owns every producer, the snapshot cache and the notifier. The scheduler
//! drives [`Monitor::compute`] / [`Monitor::apply`]; the HTTP layer only uses
//! the read methods, which go through the cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{FamilyFreshness, MetricFamily, Served, SnapshotCache};
use crate::config::EngineConfig;
use crate::error::{MonitorError, MonitorResult};
use crate::error_trend::{ErrorTrend, ErrorTrendAnalyzer};
use crate::health::{HealthAggregator, HealthReport, HealthSnapshot, ResourceReadings};
use crate::notify::{NotificationSink, Notifier, NotifierStatsSnapshot, TracingSink};
use crate::performance::{Outcome, PerformanceSummary, PerformanceTracker};
use crate::predict::{QueuePrediction, QueueWaitPredictor};
use crate::scheduler::Scheduler;
use crate::source::{
    self, CacheSource, DatabaseIntrospector, DatabaseSource, InMemoryBackend, JobCountSource, JobState,
    JobStore, MetricSource, QueueIntrospector, ResourceReader, ResourceSource,
};
use crate::stuck::{StuckJobDetector, StuckJobFlag};
use crate::types::Timestamp;
use crate::{api, ENGINE_NAME, ENGINE_VERSION};

// ----------------------------------------------------------------------------
// Collaborators
// ----------------------------------------------------------------------------

/// External systems the engine reads from and notifies
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub resources: Arc<dyn ResourceReader>,
    /// Connection pool to watch; no database subsystem when absent
    pub database: Option<Arc<dyn DatabaseIntrospector>>,
    /// Cache backend whose ping latency is sampled; no cache subsystem when absent
    pub cache: Option<Arc<dyn QueueIntrospector>>,
    /// Queue depths for the queued-jobs count and wait prediction
    pub queues: Arc<dyn QueueIntrospector>,
    pub jobs: Arc<dyn JobStore>,
    pub notifications: Arc<dyn NotificationSink>,
    /// Writable job/queue state behind the ingest endpoints, when the job
    /// store is in-process
    pub feed: Option<Arc<InMemoryBackend>>,
}

impl Collaborators {
    /// Host resources from `resources`, jobs and queue depths from `backend`.
    /// No database or cache is watched until one is attached.
    pub fn standalone(resources: Arc<dyn ResourceReader>, backend: Arc<InMemoryBackend>) -> Self {
        Self {
            resources,
            database: None,
            cache: None,
            queues: backend.clone(),
            jobs: backend.clone(),
            notifications: Arc::new(TracingSink),
            feed: Some(backend),
        }
    }

    /// Every collaborator, database and cache included, from `backend`
    pub fn in_memory(backend: Arc<InMemoryBackend>) -> Self {
        Self::standalone(backend.clone(), backend.clone())
            .with_database(backend.clone())
            .with_cache(backend)
    }

    pub fn with_database(mut self, database: Arc<dyn DatabaseIntrospector>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn QueueIntrospector>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_notifications(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifications = sink;
        self
    }
}

// ----------------------------------------------------------------------------
// Cycle Bookkeeping
// ----------------------------------------------------------------------------

/// Result of one producer cycle, handed to the cache writer
#[derive(Debug)]
pub enum CycleOutput {
    Health(HealthReport),
    Performance(PerformanceSummary),
    Errors(ErrorTrend),
    StuckJobs(Vec<StuckJobFlag>),
    QueuePrediction(QueuePrediction),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleStats {
    pub runs: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
    pub last_duration_ms: u64,
    pub last_run_at: Option<Timestamp>,
    pub last_error: Option<String>,
}

/// Served at `GET /status`
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub name: &'static str,
    pub version: &'static str,
    pub instance: String,
    pub environment: String,
    pub started_at: Timestamp,
    pub uptime: String,
    pub shutting_down: bool,
    pub cycles: BTreeMap<MetricFamily, CycleStats>,
    pub freshness: BTreeMap<MetricFamily, FamilyFreshness>,
    pub notifications: NotifierStatsSnapshot,
    pub outcomes_ingested: u64,
}

/// Everything one synchronous pass produced, for the `check` command
#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub health: Served<HealthSnapshot>,
    pub resources: Served<ResourceReadings>,
    pub performance: Served<PerformanceSummary>,
    pub errors: Served<ErrorTrend>,
    pub stuck_jobs: Served<Vec<StuckJobFlag>>,
    pub queue_prediction: Served<QueuePrediction>,
}

// ----------------------------------------------------------------------------
// Monitor
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct Monitor {
    config: Arc<EngineConfig>,
    cache: SnapshotCache,
    health: HealthAggregator,
    performance: PerformanceTracker,
    errors: ErrorTrendAnalyzer,
    stuck: StuckJobDetector,
    predictor: QueueWaitPredictor,
    jobs: Arc<dyn JobStore>,
    queues: Arc<dyn QueueIntrospector>,
    feed: Option<Arc<InMemoryBackend>>,
    notifier: Notifier,
    cycles: DashMap<MetricFamily, CycleStats>,
    started_at: Timestamp,
    shutdown: CancellationToken,
}

impl Monitor {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> MonitorResult<Self> {
        config.validate()?;
        let timeout = config.sources.timeout;

        let resource_source = Arc::new(ResourceSource::new(collaborators.resources, timeout));
        let mut sources: Vec<Arc<dyn MetricSource>> = vec![resource_source.clone()];
        match collaborators.database {
            Some(db) => sources.push(Arc::new(DatabaseSource::new(db, timeout))),
            None => info!(target: "vigil::engine", "No database configured, database subsystem not monitored"),
        }
        match collaborators.cache {
            Some(cache) => sources.push(Arc::new(CacheSource::new(cache, timeout))),
            None => info!(target: "vigil::engine", "No cache configured, cache subsystem not monitored"),
        }
        sources.push(Arc::new(JobCountSource::new(
            collaborators.jobs.clone(),
            collaborators.queues.clone(),
            config.sources.queues.clone(),
            timeout,
        )));
        let health = HealthAggregator::new(sources, config.thresholds.clone()).with_process_usage(resource_source);

        Ok(Self {
            cache: SnapshotCache::new(),
            health,
            performance: PerformanceTracker::new(&config.performance),
            errors: ErrorTrendAnalyzer::new(&config.errors),
            stuck: StuckJobDetector::new(&config.stuck_jobs),
            predictor: QueueWaitPredictor::new(&config.queue),
            jobs: collaborators.jobs,
            queues: collaborators.queues,
            feed: collaborators.feed,
            notifier: Notifier::new(collaborators.notifications),
            cycles: DashMap::new(),
            started_at: Timestamp::now(),
            shutdown: CancellationToken::new(),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    pub fn feed(&self) -> Option<&Arc<InMemoryBackend>> {
        self.feed.as_ref()
    }

    /// Age beyond which a cached value is stale
    pub fn freshness_window(&self) -> Duration {
        self.config.freshness_window()
    }

    pub fn uptime(&self) -> Duration {
        Timestamp::now().duration_since(self.started_at)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        info!(target: "vigil::engine", "Shutdown requested");
        self.shutdown.cancel();
    }

    // ---- Producers ----

    async fn refresh_health(&self) -> HealthReport {
        let previous = self.cache.resources.load();
        let report = self
            .health
            .poll_health(previous.as_ref().map(|s| s.value.as_ref()))
            .await;
        self.notifier.on_health(&report.snapshot);
        report
    }

    async fn refresh_stuck_jobs(&self) -> MonitorResult<Vec<StuckJobFlag>> {
        let now = Timestamp::now();
        let jobs = source::with_timeout(
            "jobs.store",
            self.config.sources.timeout,
            self.jobs.list_jobs(Some(JobState::Processing)),
        )
        .await?;
        let flags = self.stuck.detect(&jobs, now);
        self.notifier.on_stuck_jobs(&flags);
        Ok(flags)
    }

    async fn refresh_queue_prediction(&self) -> MonitorResult<QueuePrediction> {
        let timeout = self.config.sources.timeout;
        if let Some(feed) = &self.feed {
            let horizon = Timestamp::now().sub_duration(self.config.queue.window);
            let pruned = feed.prune_finished(horizon);
            if pruned > 0 {
                debug!(target: "vigil::engine", pruned, "Dropped finished jobs outside the throughput window");
            }
        }
        let depth = source::with_timeout(
            "jobs.queued",
            timeout,
            source::total_queue_depth(self.queues.as_ref(), &self.config.sources.queues),
        )
        .await?;
        let completed = source::with_timeout("jobs.store", timeout, self.jobs.list_jobs(Some(JobState::Completed))).await?;
        let completions: Vec<Timestamp> = completed.iter().filter_map(|job| job.completed_at).collect();

        Ok(self.predictor.predict(depth, &completions, Timestamp::now()))
    }

    /// Run one producer cycle without touching the cache
    pub async fn compute(&self, family: MetricFamily) -> MonitorResult<CycleOutput> {
        if self.is_shutting_down() {
            return Err(MonitorError::ShuttingDown);
        }
        Ok(match family {
            MetricFamily::Health => CycleOutput::Health(self.refresh_health().await),
            MetricFamily::Performance => CycleOutput::Performance(self.performance.summarize()),
            MetricFamily::Errors => CycleOutput::Errors(self.errors.trend()),
            MetricFamily::StuckJobs => CycleOutput::StuckJobs(self.refresh_stuck_jobs().await?),
            MetricFamily::QueuePrediction => CycleOutput::QueuePrediction(self.refresh_queue_prediction().await?),
        })
    }

    /// Publish a cycle result and record its bookkeeping. Failures leave the
    /// previous snapshot in place, marked with the error.
    pub fn apply(&self, family: MetricFamily, result: MonitorResult<CycleOutput>, elapsed: Duration) {
        let finished_at = Timestamp::now();
        let error = match result {
            Ok(output) => {
                match output {
                    CycleOutput::Health(report) => {
                        let readings_at = report.readings.computed_at;
                        let snapshot_at = report.snapshot.computed_at;
                        self.cache.resources.publish(report.readings, readings_at);
                        self.cache.health.publish(report.snapshot, snapshot_at);
                    }
                    CycleOutput::Performance(summary) => {
                        let computed_at = summary.computed_at;
                        self.cache.performance.publish(summary, computed_at);
                    }
                    CycleOutput::Errors(trend) => {
                        let computed_at = trend.computed_at;
                        self.cache.errors.publish(trend, computed_at);
                    }
                    CycleOutput::StuckJobs(flags) => {
                        self.cache.stuck_jobs.publish(flags, finished_at);
                    }
                    CycleOutput::QueuePrediction(prediction) => {
                        let computed_at = prediction.computed_at;
                        self.cache.queue_prediction.publish(prediction, computed_at);
                    }
                }
                None
            }
            Err(e) => {
                warn!(
                    target: "vigil::engine",
                    family = %family,
                    error = %e,
                    recoverable = e.is_recoverable(),
                    "Cycle failed, keeping previous snapshot"
                );
                let message = e.to_string();
                match family {
                    MetricFamily::Health => self.cache.health.record_failure(message.clone()),
                    MetricFamily::Performance => self.cache.performance.record_failure(message.clone()),
                    MetricFamily::Errors => self.cache.errors.record_failure(message.clone()),
                    MetricFamily::StuckJobs => self.cache.stuck_jobs.record_failure(message.clone()),
                    MetricFamily::QueuePrediction => {
                        self.cache.queue_prediction.record_failure(message.clone())
                    }
                }
                Some(message)
            }
        };

        let mut stats = self.cycles.entry(family).or_default();
        stats.runs += 1;
        stats.last_duration_ms = elapsed.as_millis() as u64;
        stats.last_run_at = Some(finished_at);
        match error {
            Some(message) => {
                stats.failures += 1;
                stats.consecutive_failures += 1;
                stats.last_error = Some(message);
            }
            None => {
                stats.consecutive_failures = 0;
                stats.last_error = None;
            }
        }
    }

    /// One synchronous pass over every family
    pub async fn run_once(&self) -> CheckReport {
        for family in MetricFamily::ALL {
            let started = Instant::now();
            let result = self.compute(family).await;
            self.apply(family, result, started.elapsed());
        }

        let max_age = self.freshness_window();
        CheckReport {
            health: self.cache.health.serve(max_age),
            resources: self.cache.resources.serve(max_age),
            performance: self.cache.performance.serve(max_age),
            errors: self.cache.errors.serve(max_age),
            stuck_jobs: self.cache.stuck_jobs.serve(max_age),
            queue_prediction: self.cache.queue_prediction.serve(max_age),
        }
    }

    // ---- Reads ----

    pub async fn health(self: &Arc<Self>) -> Served<HealthSnapshot> {
        let monitor = Arc::clone(self);
        self.cache
            .health
            .get_or_refresh(self.freshness_window(), move || async move {
                let report = monitor.refresh_health().await;
                let readings_at = report.readings.computed_at;
                monitor.cache.resources.publish(report.readings, readings_at);
                Ok(report.snapshot)
            })
            .await
    }

    pub async fn resources(self: &Arc<Self>) -> Served<ResourceReadings> {
        let monitor = Arc::clone(self);
        self.cache
            .resources
            .get_or_refresh(self.freshness_window(), move || async move {
                let report = monitor.refresh_health().await;
                let computed_at = report.snapshot.computed_at;
                monitor.cache.health.publish(report.snapshot, computed_at);
                Ok(report.readings)
            })
            .await
    }

    pub async fn performance(self: &Arc<Self>) -> Served<PerformanceSummary> {
        let monitor = Arc::clone(self);
        self.cache
            .performance
            .get_or_refresh(self.freshness_window(), move || async move {
                Ok(monitor.performance.summarize())
            })
            .await
    }

    pub async fn error_trend(self: &Arc<Self>) -> Served<ErrorTrend> {
        let monitor = Arc::clone(self);
        self.cache
            .errors
            .get_or_refresh(self.freshness_window(), move || async move { Ok(monitor.errors.trend()) })
            .await
    }

    pub async fn stuck_jobs(self: &Arc<Self>) -> Served<Vec<StuckJobFlag>> {
        let monitor = Arc::clone(self);
        self.cache
            .stuck_jobs
            .get_or_refresh(self.freshness_window(), move || async move {
                monitor.refresh_stuck_jobs().await
            })
            .await
    }

    pub async fn queue_prediction(self: &Arc<Self>) -> Served<QueuePrediction> {
        let monitor = Arc::clone(self);
        self.cache
            .queue_prediction
            .get_or_refresh(self.freshness_window(), move || async move {
                monitor.refresh_queue_prediction().await
            })
            .await
    }

    pub fn status(&self) -> EngineStatus {
        let uptime = Duration::from_secs(self.uptime().as_secs());
        EngineStatus {
            name: ENGINE_NAME,
            version: ENGINE_VERSION,
            instance: self.config.engine.instance_name.clone(),
            environment: self.config.engine.environment.clone(),
            started_at: self.started_at,
            uptime: humantime::format_duration(uptime).to_string(),
            shutting_down: self.is_shutting_down(),
            cycles: self
                .cycles
                .iter()
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect(),
            freshness: self.cache.freshness(),
            notifications: self.notifier.stats(),
            outcomes_ingested: self.performance.total_ingested(),
        }
    }

    // ---- Ingest ----

    pub fn record_outcome(&self, duration_ms: f64, outcome: Outcome) -> MonitorResult<()> {
        if self.is_shutting_down() {
            return Err(MonitorError::ShuttingDown);
        }
        self.performance.record_outcome(duration_ms, outcome)
    }

    /// Count an error; `timestamp` defaults to now. Returns false if the
    /// error is too old for the 24-hour histogram or dated in the future.
    pub fn record_error(&self, message: impl Into<String>, timestamp: Option<Timestamp>) -> MonitorResult<bool> {
        if self.is_shutting_down() {
            return Err(MonitorError::ShuttingDown);
        }
        Ok(self
            .errors
            .record_error(message, timestamp.unwrap_or_else(Timestamp::now)))
    }

    // ---- Lifecycle ----

    /// Run the scheduler and the HTTP API until shutdown is signalled
    pub async fn run(self: Arc<Self>) -> MonitorResult<()> {
        info!(
            target: "vigil::engine",
            version = ENGINE_VERSION,
            instance = %self.config.engine.instance_name,
            environment = %self.config.engine.environment,
            poll_interval = %humantime::format_duration(self.config.engine.poll_interval),
            "Starting monitoring engine"
        );

        spawn_signal_handler(self.shutdown.clone());

        let api = if self.config.api.enabled {
            let listener = tokio::net::TcpListener::bind(self.config.api.address.as_str()).await?;
            info!(target: "vigil::engine", address = %self.config.api.address, "HTTP API listening");
            Some(tokio::spawn(api::serve(
                listener,
                api::router(Arc::clone(&self)),
                self.shutdown.clone(),
            )))
        } else {
            None
        };

        let scheduler = Scheduler::new(Arc::clone(&self)).spawn(self.shutdown.child_token());

        self.shutdown.cancelled().await;
        info!(target: "vigil::engine", "Starting graceful shutdown");
        let shutdown_start = Instant::now();
        let grace = self.config.engine.shutdown_timeout;

        if tokio::time::timeout(grace, scheduler).await.is_err() {
            warn!(target: "vigil::engine", "Scheduler did not stop within the grace period");
        }
        if let Some(api) = api {
            match tokio::time::timeout(grace, api).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(target: "vigil::engine", error = %e, "HTTP API stopped with error"),
                Ok(Err(e)) => warn!(target: "vigil::engine", error = %e, "HTTP API task failed"),
                Err(_) => warn!(target: "vigil::engine", "HTTP API did not drain within the grace period"),
            }
        }
        if !self.notifier.flush(grace).await {
            warn!(target: "vigil::engine", "Pending notifications dropped at shutdown");
        }

        info!(
            target: "vigil::engine",
            duration_ms = shutdown_start.elapsed().as_millis() as u64,
            "Engine shutdown complete"
        );
        Ok(())
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(target: "vigil::engine", error = %e, "Failed to install signal handlers");
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => info!(target: "vigil::engine", "Received SIGTERM"),
                _ = sigint.recv() => info!(target: "vigil::engine", "Received SIGINT"),
                _ = shutdown.cancelled() => return,
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!(target: "vigil::engine", error = %e, "Failed to listen for Ctrl-C");
                        return;
                    }
                    info!(target: "vigil::engine", "Received Ctrl-C");
                }
                _ = shutdown.cancelled() => return,
            }
        }

        debug!(target: "vigil::engine", "Cancelling engine tasks");
        shutdown.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::Subsystem;
    use crate::source::{JobRecord, ResourceUsage};
    use crate::types::HealthStatus;

    fn monitor(backend: &Arc<InMemoryBackend>) -> Arc<Monitor> {
        let mut config = EngineConfig::default();
        config.api.enabled = false;
        Arc::new(Monitor::new(config, Collaborators::in_memory(backend.clone())).unwrap())
    }

    #[tokio::test]
    async fn test_cold_health_read_computes_once() {
        let backend = Arc::new(InMemoryBackend::new());
        let monitor = monitor(&backend);

        let served = monitor.health().await;
        assert!(served.computed_at.is_some());
        assert!(!served.stale);
        assert_eq!(served.data.overall_status, HealthStatus::Healthy);

        // resources were filled by the same cycle
        assert!(monitor.cache().resources.computed_at().is_some());
        let reads = backend.resource_reads();
        monitor.health().await;
        assert_eq!(backend.resource_reads(), reads);
    }

    #[tokio::test]
    async fn test_apply_failure_keeps_previous_snapshot() {
        let backend = Arc::new(InMemoryBackend::new());
        let monitor = monitor(&backend);

        monitor.apply(
            MetricFamily::StuckJobs,
            Ok(CycleOutput::StuckJobs(Vec::new())),
            Duration::from_millis(3),
        );
        monitor.apply(
            MetricFamily::StuckJobs,
            Err(MonitorError::Internal("job store exploded".into())),
            Duration::from_millis(3),
        );

        let served = monitor.stuck_jobs().await;
        assert!(served.computed_at.is_some());
        assert!(served.stale);
        assert!(served.error.unwrap().contains("exploded"));

        let status = monitor.status();
        let stats = &status.cycles[&MetricFamily::StuckJobs];
        assert_eq!(stats.runs, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_run_once_covers_every_family() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.set_resource_usage(ResourceUsage {
            cpu_percent: 96.0,
            memory_percent: 20.0,
            disk_percent: 20.0,
        });
        let now = Timestamp::now();
        backend.upsert_job(JobRecord {
            job_id: "stalled".into(),
            job_class: None,
            state: JobState::Processing,
            enqueued_at: now.sub_duration(Duration::from_secs(900)),
            started_at: Some(now.sub_duration(Duration::from_secs(800))),
            last_heartbeat_at: Some(now.sub_duration(Duration::from_secs(700))),
            completed_at: None,
        });
        backend.set_queue_depth("default", 10);
        let monitor = monitor(&backend);
        monitor.record_outcome(12.0, Outcome::Success).unwrap();
        monitor.record_error("timeout talking to smtp", None).unwrap();

        let report = monitor.run_once().await;
        assert_eq!(report.health.data.overall_status, HealthStatus::Unhealthy);
        assert_eq!(report.performance.data.sample_count, 1);
        assert_eq!(report.errors.data.total_24h, 1);
        assert_eq!(report.stuck_jobs.data.len(), 1);
        assert_eq!(report.queue_prediction.data.queue_depth, 10);

        let status = monitor.status();
        assert_eq!(status.cycles.len(), MetricFamily::ALL.len());
    }

    #[tokio::test]
    async fn test_unconfigured_backends_are_not_reported() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut config = EngineConfig::default();
        config.api.enabled = false;
        let collaborators = Collaborators::standalone(backend.clone(), backend.clone());
        let monitor = Arc::new(Monitor::new(config, collaborators).unwrap());

        let served = monitor.health().await;
        assert_eq!(served.data.status_of(Subsystem::Database), None);
        assert_eq!(served.data.status_of(Subsystem::Cache), None);
        assert_eq!(served.data.status_of(Subsystem::Cpu), Some(HealthStatus::Healthy));

        let resources = monitor.resources().await;
        assert!(!resources.data.samples.contains_key(&Subsystem::Database));
        assert!(!resources.data.samples.contains_key(&Subsystem::Cache));
    }

    #[tokio::test]
    async fn test_prediction_cycle_drops_old_completions() {
        let backend = Arc::new(InMemoryBackend::new());
        let monitor = monitor(&backend);
        let now = Timestamp::now();
        for (i, age_secs) in [3_600u64, 1_800, 60].into_iter().enumerate() {
            let done = now.sub_duration(Duration::from_secs(age_secs));
            backend.upsert_job(JobRecord {
                job_id: format!("job-{}", i),
                job_class: None,
                state: JobState::Completed,
                enqueued_at: done.sub_duration(Duration::from_secs(5)),
                started_at: None,
                last_heartbeat_at: None,
                completed_at: Some(done),
            });
        }

        let prediction = monitor.refresh_queue_prediction().await.unwrap();
        assert_eq!(prediction.completions_in_window, 1);
        assert_eq!(backend.job_count(), 1);
    }

    #[tokio::test]
    async fn test_envelope_time_matches_snapshot_time() {
        let backend = Arc::new(InMemoryBackend::new());
        let monitor = monitor(&backend);
        let report = monitor.run_once().await;

        assert_eq!(report.health.computed_at, Some(report.health.data.computed_at));
        assert_eq!(report.resources.computed_at, Some(report.resources.data.computed_at));
        assert_eq!(report.errors.computed_at, Some(report.errors.data.computed_at));
        assert_eq!(
            report.queue_prediction.computed_at,
            Some(report.queue_prediction.data.computed_at)
        );
    }

    #[tokio::test]
    async fn test_ingest_rejected_after_shutdown() {
        let backend = Arc::new(InMemoryBackend::new());
        let monitor = monitor(&backend);
        monitor.shutdown();

        assert!(matches!(
            monitor.record_outcome(1.0, Outcome::Success),
            Err(MonitorError::ShuttingDown)
        ));
        assert!(matches!(
            monitor.compute(MetricFamily::Errors).await,
            Err(MonitorError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let backend = Arc::new(InMemoryBackend::new());
        let monitor = monitor(&backend);
        let token = monitor.shutdown_token();

        let handle = tokio::spawn(Arc::clone(&monitor).run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
