//! Background scheduler.
//!
//! One interval task per metric family so a slow source in one producer
//! never delays another. Producers hand their results to a single writer
//! task over a channel; the writer is the only place scheduled cycles touch
//! the cache.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cache::{MetricFamily, RefreshPermit};
use crate::engine::{CycleOutput, Monitor};
use crate::error::{MonitorError, MonitorResult};
use crate::logging::PerfTimer;

/// "Cycle complete" message from a producer task to the cache writer
#[derive(Debug)]
pub struct CycleEvent {
    pub family: MetricFamily,
    pub result: MonitorResult<CycleOutput>,
    pub elapsed: Duration,
    /// Held until the result is published, so a read cannot start a
    /// duplicate refresh in between
    permit: RefreshPermit,
}

#[derive(Debug)]
pub struct Scheduler {
    monitor: Arc<Monitor>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(monitor: Arc<Monitor>) -> Self {
        let interval = monitor.config().engine.poll_interval;
        Self { monitor, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Drive every family until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            target: "vigil::scheduler",
            interval = %humantime::format_duration(self.interval),
            families = MetricFamily::ALL.len(),
            "Scheduler started"
        );

        let (tx, rx) = mpsc::channel(MetricFamily::ALL.len() * 2);
        let mut producers = JoinSet::new();
        for family in MetricFamily::ALL {
            producers.spawn(produce(
                Arc::clone(&self.monitor),
                family,
                self.interval,
                tx.clone(),
                shutdown.clone(),
            ));
        }
        drop(tx);

        // returns once every producer has stopped and dropped its sender
        write_cycles(Arc::clone(&self.monitor), rx).await;

        while let Some(joined) = producers.join_next().await {
            if let Err(e) = joined {
                error!(target: "vigil::scheduler", error = %e, "Producer task failed");
            }
        }
        info!(target: "vigil::scheduler", "Scheduler stopped");
    }
}

async fn produce(
    monitor: Arc<Monitor>,
    family: MetricFamily,
    interval: Duration,
    tx: mpsc::Sender<CycleEvent>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            permit = monitor.cache().begin_refresh(family) => permit,
        };

        let timer = PerfTimer::with_threshold(family.as_str(), interval);
        let cycle = AssertUnwindSafe(monitor.compute(family)).catch_unwind();
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            outcome = cycle => outcome.unwrap_or_else(|_| {
                Err(MonitorError::Internal(format!("{} cycle panicked", family)))
            }),
        };
        let elapsed = timer.stop();

        debug!(
            target: "vigil::scheduler",
            family = %family,
            elapsed_ms = elapsed.as_millis() as u64,
            ok = result.is_ok(),
            "Cycle complete"
        );

        let event = CycleEvent {
            family,
            result,
            elapsed,
            permit,
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
}

async fn write_cycles(monitor: Arc<Monitor>, mut rx: mpsc::Receiver<CycleEvent>) {
    while let Some(event) = rx.recv().await {
        let CycleEvent {
            family,
            result,
            elapsed,
            permit,
        } = event;
        monitor.apply(family, result, elapsed);
        drop(permit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Collaborators;
    use crate::source::InMemoryBackend;

    fn monitor(backend: &Arc<InMemoryBackend>) -> Arc<Monitor> {
        Arc::new(Monitor::new(EngineConfig::default(), Collaborators::in_memory(backend.clone())).unwrap())
    }

    #[tokio::test]
    async fn test_every_family_is_published() {
        let backend = Arc::new(InMemoryBackend::new());
        let monitor = monitor(&backend);
        let shutdown = CancellationToken::new();

        let handle = Scheduler::new(Arc::clone(&monitor))
            .with_interval(Duration::from_millis(20))
            .spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let freshness = monitor.cache().freshness();
        assert!(freshness.values().all(|f| f.computed_at.is_some()));
        let status = monitor.status();
        assert!(status.cycles.values().all(|c| c.runs >= 1 && c.failures == 0));
    }

    #[tokio::test]
    async fn test_slow_family_does_not_block_others() {
        let backend = Arc::new(InMemoryBackend::new());
        // every backend call now outlives the 2s source timeout
        backend.set_response_delay(Duration::from_secs(30));
        let monitor = monitor(&backend);
        let shutdown = CancellationToken::new();

        let handle = Scheduler::new(Arc::clone(&monitor))
            .with_interval(Duration::from_millis(20))
            .spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let cache = monitor.cache();
        assert!(cache.errors.computed_at().is_some());
        assert!(cache.performance.computed_at().is_some());
        assert!(cache.health.computed_at().is_none());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
