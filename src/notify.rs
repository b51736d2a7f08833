//! Notification fan-out.
//!
//! Edge-triggered: a notification goes out when the overall health status
//! changes or a job becomes stuck, never for a steady state. Delivery runs on
//! tracked background tasks; sink failures are logged and counted, never
//! returned to the producer that raised them.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use compact_str::CompactString;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

use crate::health::HealthSnapshot;
use crate::stuck::{StuckJobFlag, StuckReason};
use crate::types::{HealthStatus, Severity, Timestamp};

// ----------------------------------------------------------------------------
// Sink
// ----------------------------------------------------------------------------

/// Destination for operator notifications (pager, chat, email relay)
#[async_trait]
pub trait NotificationSink: Send + Sync + Debug {
    async fn notify(&self, severity: Severity, message: &str) -> anyhow::Result<()>;
}

/// Sink that writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn notify(&self, severity: Severity, message: &str) -> anyhow::Result<()> {
        match severity {
            Severity::Info => info!(target: "vigil::notify", %severity, "{}", message),
            Severity::Warning | Severity::Critical => {
                warn!(target: "vigil::notify", %severity, "{}", message)
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Notifications
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub timestamp: Timestamp,
    pub severity: Severity,
    pub message: CompactString,
}

impl Notification {
    pub fn new(severity: Severity, message: impl Into<CompactString>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Timestamp::now(),
            severity,
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
struct NotifierStats {
    sent: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifierStatsSnapshot {
    pub sent: u64,
    pub failed: u64,
}

// ----------------------------------------------------------------------------
// Notifier
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    last_status: Mutex<Option<HealthStatus>>,
    stuck: Mutex<HashMap<String, StuckReason>>,
    stats: Arc<NotifierStats>,
    tasks: TaskTracker,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            last_status: Mutex::new(None),
            stuck: Mutex::new(HashMap::new()),
            stats: Arc::new(NotifierStats::default()),
            tasks: TaskTracker::new(),
        }
    }

    /// Notify when the overall status differs from the previous snapshot.
    /// The first snapshot is compared against healthy.
    pub fn on_health(&self, snapshot: &HealthSnapshot) -> Option<Notification> {
        let current = snapshot.overall_status;
        let previous = self
            .last_status
            .lock()
            .replace(current)
            .unwrap_or(HealthStatus::Healthy);
        if previous == current {
            return None;
        }

        let notification = if current > previous {
            let affected: Vec<String> = snapshot
                .per_subsystem
                .iter()
                .filter(|(_, h)| h.status != HealthStatus::Healthy)
                .map(|(subsystem, h)| format!("{} {}", subsystem, h.status))
                .collect();
            Notification::new(
                Severity::from(current),
                format!(
                    "Service health is now {} (was {}): {}",
                    current,
                    previous,
                    affected.join(", ")
                ),
            )
        } else {
            Notification::new(
                Severity::Info,
                format!("Service health recovered to {} (was {})", current, previous),
            )
        };

        self.dispatch(notification.clone());
        Some(notification)
    }

    /// Notify once per job when it first appears in the stuck set, or when
    /// its reason escalates.
    pub fn on_stuck_jobs(&self, flags: &[StuckJobFlag]) -> Vec<Notification> {
        let fresh: Vec<&StuckJobFlag> = {
            let mut known = self.stuck.lock();
            let fresh: Vec<&StuckJobFlag> = flags
                .iter()
                .filter(|flag| known.get(&flag.job_id) != Some(&flag.reason))
                .collect();
            *known = flags.iter().map(|f| (f.job_id.clone(), f.reason)).collect();
            fresh
        };

        fresh
            .into_iter()
            .map(|flag| {
                let severity = match flag.reason {
                    StuckReason::NoHeartbeat => Severity::Warning,
                    StuckReason::ExceededMaxDuration => Severity::Critical,
                };
                let notification = Notification::new(
                    severity,
                    format!(
                        "Job {} looks stuck ({}) after {}",
                        flag.job_id,
                        flag.reason.as_str(),
                        humantime::format_duration(Duration::from_secs(flag.elapsed_duration.as_secs()))
                    ),
                );
                self.dispatch(notification.clone());
                notification
            })
            .collect()
    }

    fn dispatch(&self, notification: Notification) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(
                target: "vigil::notify",
                id = %notification.id,
                "No runtime available, dropping notification"
            );
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let sink = Arc::clone(&self.sink);
        let stats = Arc::clone(&self.stats);
        self.tasks.spawn(async move {
            match sink.notify(notification.severity, &notification.message).await {
                Ok(()) => {
                    stats.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        target: "vigil::notify",
                        id = %notification.id,
                        severity = %notification.severity,
                        error = %e,
                        "Notification delivery failed"
                    );
                }
            }
        });
    }

    /// Wait for in-flight deliveries, up to `timeout`
    pub async fn flush(&self, timeout: Duration) -> bool {
        self.tasks.close();
        let drained = tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok();
        self.tasks.reopen();
        drained
    }

    pub fn stats(&self) -> NotifierStatsSnapshot {
        NotifierStatsSnapshot {
            sent: self.stats.sent.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[derive(Debug, Default)]
    struct RecordingSink {
        received: Mutex<Vec<(Severity, String)>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify(&self, severity: Severity, message: &str) -> anyhow::Result<()> {
            self.received.lock().push((severity, message.to_string()));
            Ok(())
        }
    }

    #[derive(Debug)]
    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn notify(&self, _: Severity, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("relay down")
        }
    }

    fn snapshot(status: HealthStatus) -> HealthSnapshot {
        HealthSnapshot {
            overall_status: status,
            per_subsystem: BTreeMap::new(),
            computed_at: Timestamp::now(),
        }
    }

    fn flag(job_id: &str, reason: StuckReason) -> StuckJobFlag {
        StuckJobFlag {
            job_id: job_id.into(),
            job_class: None,
            reason,
            detected_at: Timestamp::now(),
            elapsed_duration: Duration::from_secs(400),
        }
    }

    #[tokio::test]
    async fn test_health_notifications_are_edge_triggered() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::new(sink.clone());

        assert!(notifier.on_health(&snapshot(HealthStatus::Healthy)).is_none());
        let n = notifier.on_health(&snapshot(HealthStatus::Unhealthy)).unwrap();
        assert_eq!(n.severity, Severity::Critical);
        assert!(notifier.on_health(&snapshot(HealthStatus::Unhealthy)).is_none());
        let n = notifier.on_health(&snapshot(HealthStatus::Healthy)).unwrap();
        assert_eq!(n.severity, Severity::Info);

        assert!(notifier.flush(Duration::from_secs(1)).await);
        let received = sink.received.lock();
        assert_eq!(received.len(), 2);
        assert_eq!(notifier.stats(), NotifierStatsSnapshot { sent: 2, failed: 0 });
    }

    #[tokio::test]
    async fn test_stuck_jobs_notify_once() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::new(sink.clone());

        let first = notifier.on_stuck_jobs(&[flag("a", StuckReason::NoHeartbeat)]);
        assert_eq!(first.len(), 1);
        assert!(notifier
            .on_stuck_jobs(&[flag("a", StuckReason::NoHeartbeat)])
            .is_empty());

        let escalated = notifier.on_stuck_jobs(&[
            flag("a", StuckReason::ExceededMaxDuration),
            flag("b", StuckReason::NoHeartbeat),
        ]);
        assert_eq!(escalated.len(), 2);
        assert_eq!(escalated[0].severity, Severity::Critical);

        // a job that recovered and stalls again is new again
        assert!(notifier.on_stuck_jobs(&[]).is_empty());
        assert_eq!(notifier.on_stuck_jobs(&[flag("b", StuckReason::NoHeartbeat)]).len(), 1);

        notifier.flush(Duration::from_secs(1)).await;
        assert_eq!(sink.received.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_sink_failure_is_not_propagated() {
        let notifier = Notifier::new(Arc::new(FailingSink));

        assert!(notifier.on_health(&snapshot(HealthStatus::Degraded)).is_some());
        notifier.flush(Duration::from_secs(1)).await;
        assert_eq!(notifier.stats(), NotifierStatsSnapshot { sent: 0, failed: 1 });
    }
}
