//! Snapshot cache.
//!
//! One slot per metric family. Each slot holds an immutable snapshot behind
//! an atomic pointer: writers swap a whole new value in, readers clone the
//! `Arc` out and never observe a half-written value.
//!
//! Reads never wait on a scheduled cycle. A stale read is answered with the
//! stale value while at most one refresh runs in the background; only a
//! cold read (nothing ever computed) waits, and concurrent cold reads share
//! the single computation.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::MonitorResult;
use crate::error_trend::ErrorTrend;
use crate::health::{HealthSnapshot, ResourceReadings};
use crate::performance::PerformanceSummary;
use crate::predict::QueuePrediction;
use crate::stuck::StuckJobFlag;
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Metric Families
// ----------------------------------------------------------------------------

/// Independently scheduled producers, one cache writer each
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricFamily {
    Health,
    Performance,
    Errors,
    StuckJobs,
    QueuePrediction,
}

impl MetricFamily {
    pub const ALL: [MetricFamily; 5] = [
        MetricFamily::Health,
        MetricFamily::Performance,
        MetricFamily::Errors,
        MetricFamily::StuckJobs,
        MetricFamily::QueuePrediction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricFamily::Health => "health",
            MetricFamily::Performance => "performance",
            MetricFamily::Errors => "errors",
            MetricFamily::StuckJobs => "stuck_jobs",
            MetricFamily::QueuePrediction => "queue_prediction",
        }
    }
}

impl Display for MetricFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Snapshot Slot
// ----------------------------------------------------------------------------

/// Values that record when they were computed. A refreshed value is
/// published under its own time so the envelope and the body agree.
pub trait Stamped {
    fn stamped_at(&self) -> Option<Timestamp> {
        None
    }
}

impl Stamped for HealthSnapshot {
    fn stamped_at(&self) -> Option<Timestamp> {
        Some(self.computed_at)
    }
}

impl Stamped for ResourceReadings {
    fn stamped_at(&self) -> Option<Timestamp> {
        Some(self.computed_at)
    }
}

impl Stamped for PerformanceSummary {
    fn stamped_at(&self) -> Option<Timestamp> {
        Some(self.computed_at)
    }
}

impl Stamped for ErrorTrend {
    fn stamped_at(&self) -> Option<Timestamp> {
        Some(self.computed_at)
    }
}

impl Stamped for QueuePrediction {
    fn stamped_at(&self) -> Option<Timestamp> {
        Some(self.computed_at)
    }
}

impl Stamped for Vec<StuckJobFlag> {}

#[derive(Debug)]
pub struct Snapshot<T> {
    pub value: Arc<T>,
    pub computed_at: Timestamp,
}

#[derive(Debug, Clone)]
struct FailureNote {
    message: String,
    at: Timestamp,
}

/// A value as served to readers, with its freshness.
#[derive(Debug, Serialize)]
pub struct Served<T> {
    pub data: Arc<T>,
    /// `None` when nothing was ever computed and `data` is a placeholder
    pub computed_at: Option<Timestamp>,
    pub age_ms: Option<u64>,
    pub stale: bool,
    /// Most recent refresh failure newer than `data`
    pub error: Option<String>,
}

/// Proof that the holder is the only refresh in flight for a slot. Dropping
/// it lets the next refresh start.
#[derive(Debug)]
pub struct RefreshPermit {
    _guard: OwnedMutexGuard<()>,
}

pub struct SnapshotSlot<T> {
    family: &'static str,
    current: ArcSwapOption<Snapshot<T>>,
    refresh: Arc<AsyncMutex<()>>,
    last_error: ArcSwapOption<FailureNote>,
}

impl<T> Debug for SnapshotSlot<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotSlot")
            .field("family", &self.family)
            .field("computed_at", &self.current.load().as_ref().map(|s| s.computed_at))
            .finish()
    }
}

impl<T> SnapshotSlot<T>
where
    T: Stamped + Default + Send + Sync + 'static,
{
    pub fn new(family: &'static str) -> Self {
        Self {
            family,
            current: ArcSwapOption::empty(),
            refresh: Arc::new(AsyncMutex::new(())),
            last_error: ArcSwapOption::empty(),
        }
    }

    pub fn family(&self) -> &'static str {
        self.family
    }

    pub fn load(&self) -> Option<Arc<Snapshot<T>>> {
        self.current.load_full()
    }

    pub fn computed_at(&self) -> Option<Timestamp> {
        self.current.load().as_ref().map(|s| s.computed_at)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.load().as_ref().map(|e| e.message.clone())
    }

    /// Swap in a new snapshot. Rejected if an even newer one is already
    /// published, which keeps `computed_at` monotonic.
    pub fn publish(&self, value: T, computed_at: Timestamp) -> bool {
        let candidate = Arc::new(Snapshot {
            value: Arc::new(value),
            computed_at,
        });
        let mut accepted = false;
        self.current.rcu(|current| match current {
            Some(existing) if existing.computed_at > candidate.computed_at => {
                accepted = false;
                Some(Arc::clone(existing))
            }
            _ => {
                accepted = true;
                Some(Arc::clone(&candidate))
            }
        });

        if accepted {
            self.last_error.store(None);
        } else {
            debug!(target: "vigil::cache", family = self.family, "Discarded out-of-order snapshot");
        }
        accepted
    }

    pub fn record_failure(&self, message: impl Into<String>) {
        self.last_error.store(Some(Arc::new(FailureNote {
            message: message.into(),
            at: Timestamp::now(),
        })));
    }

    pub async fn begin_refresh(&self) -> RefreshPermit {
        RefreshPermit {
            _guard: Arc::clone(&self.refresh).lock_owned().await,
        }
    }

    pub fn try_begin_refresh(&self) -> Option<RefreshPermit> {
        Arc::clone(&self.refresh)
            .try_lock_owned()
            .ok()
            .map(|guard| RefreshPermit { _guard: guard })
    }

    /// Serve whatever is cached, or a placeholder, without refreshing
    pub fn serve(&self, max_age: Duration) -> Served<T> {
        let now = Timestamp::now();
        let error = self.last_error.load_full();

        match self.current.load_full() {
            Some(snapshot) => {
                let age = now.duration_since(snapshot.computed_at);
                let error = error
                    .filter(|e| e.at >= snapshot.computed_at)
                    .map(|e| e.message.clone());
                Served {
                    data: Arc::clone(&snapshot.value),
                    computed_at: Some(snapshot.computed_at),
                    age_ms: Some(age.as_millis() as u64),
                    stale: age > max_age || error.is_some(),
                    error,
                }
            }
            None => Served {
                data: Arc::new(T::default()),
                computed_at: None,
                age_ms: None,
                stale: true,
                error: error.map(|e| e.message.clone()),
            },
        }
    }

    fn is_fresh(&self, max_age: Duration) -> bool {
        self.computed_at()
            .map_or(false, |at| Timestamp::now().duration_since(at) <= max_age)
    }

    async fn run_refresh<F, Fut>(&self, refresh: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MonitorResult<T>>,
    {
        match refresh().await {
            Ok(value) => {
                let computed_at = value.stamped_at().unwrap_or_else(Timestamp::now);
                self.publish(value, computed_at);
            }
            Err(e) => {
                warn!(
                    target: "vigil::cache",
                    family = self.family,
                    error = %e,
                    category = e.category(),
                    "Snapshot refresh failed"
                );
                self.record_failure(e.to_string());
            }
        }
    }

    /// Read path used by every endpoint.
    ///
    /// Fresh: served as-is. Stale: served as-is while one background refresh
    /// is started unless one is already running. Cold: the caller waits for
    /// the single in-flight computation.
    pub async fn get_or_refresh<F, Fut>(self: &Arc<Self>, max_age: Duration, refresh: F) -> Served<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = MonitorResult<T>> + Send + 'static,
    {
        if self.computed_at().is_some() {
            if !self.is_fresh(max_age) {
                if let Some(permit) = self.try_begin_refresh() {
                    let slot = Arc::clone(self);
                    tokio::spawn(async move {
                        let _permit = permit;
                        if !slot.is_fresh(max_age) {
                            slot.run_refresh(refresh).await;
                        }
                    });
                }
            }
            return self.serve(max_age);
        }

        let _permit = self.begin_refresh().await;
        if self.computed_at().is_none() {
            debug!(target: "vigil::cache", family = self.family, "Cold read, computing synchronously");
            self.run_refresh(refresh).await;
        }
        self.serve(max_age)
    }
}

// ----------------------------------------------------------------------------
// Snapshot Cache
// ----------------------------------------------------------------------------

/// Freshness of one family, as reported by the status endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyFreshness {
    pub computed_at: Option<Timestamp>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub struct SnapshotCache {
    pub health: Arc<SnapshotSlot<HealthSnapshot>>,
    pub resources: Arc<SnapshotSlot<ResourceReadings>>,
    pub performance: Arc<SnapshotSlot<PerformanceSummary>>,
    pub errors: Arc<SnapshotSlot<ErrorTrend>>,
    pub stuck_jobs: Arc<SnapshotSlot<Vec<StuckJobFlag>>>,
    pub queue_prediction: Arc<SnapshotSlot<QueuePrediction>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self {
            health: Arc::new(SnapshotSlot::new("health")),
            resources: Arc::new(SnapshotSlot::new("resources")),
            performance: Arc::new(SnapshotSlot::new("performance")),
            errors: Arc::new(SnapshotSlot::new("errors")),
            stuck_jobs: Arc::new(SnapshotSlot::new("stuck_jobs")),
            queue_prediction: Arc::new(SnapshotSlot::new("queue_prediction")),
        }
    }

    /// Wait until no other refresh of `family` is in flight
    pub async fn begin_refresh(&self, family: MetricFamily) -> RefreshPermit {
        match family {
            MetricFamily::Health => self.health.begin_refresh().await,
            MetricFamily::Performance => self.performance.begin_refresh().await,
            MetricFamily::Errors => self.errors.begin_refresh().await,
            MetricFamily::StuckJobs => self.stuck_jobs.begin_refresh().await,
            MetricFamily::QueuePrediction => self.queue_prediction.begin_refresh().await,
        }
    }

    pub fn freshness(&self) -> BTreeMap<MetricFamily, FamilyFreshness> {
        MetricFamily::ALL
            .into_iter()
            .map(|family| {
                let (computed_at, last_error) = match family {
                    MetricFamily::Health => (self.health.computed_at(), self.health.last_error()),
                    MetricFamily::Performance => {
                        (self.performance.computed_at(), self.performance.last_error())
                    }
                    MetricFamily::Errors => (self.errors.computed_at(), self.errors.last_error()),
                    MetricFamily::StuckJobs => (self.stuck_jobs.computed_at(), self.stuck_jobs.last_error()),
                    MetricFamily::QueuePrediction => (
                        self.queue_prediction.computed_at(),
                        self.queue_prediction.last_error(),
                    ),
                };
                (family, FamilyFreshness { computed_at, last_error })
            })
            .collect()
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}
