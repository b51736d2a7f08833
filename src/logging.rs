//! Logging & tracing infrastructure.

use std::time::{Duration, Instant};

use tracing::{info, trace, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{MonitorError, MonitorResult};

// ----------------------------------------------------------------------------
// Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> MonitorResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let result = match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    result.map_err(|e| MonitorError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "vigil::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// Logging Macros for Engine Components
// ----------------------------------------------------------------------------

/// Log a metric source event
#[macro_export]
macro_rules! log_source {
    ($source:expr, $event:expr) => {
        tracing::debug!(
            target: "vigil::sources",
            source = %$source,
            event = $event,
            "Source event"
        )
    };
    ($source:expr, $event:expr, $($field:tt)*) => {
        tracing::debug!(
            target: "vigil::sources",
            source = %$source,
            event = $event,
            $($field)*,
            "Source event"
        )
    };
}

// ----------------------------------------------------------------------------
// Performance Timer
// ----------------------------------------------------------------------------

/// Measures an operation and warns when it runs past its budget.
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold: Option<Duration>,
}

impl PerfTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold: None,
        }
    }

    /// Start a timer with a warning threshold
    pub fn with_threshold(name: &'static str, threshold: Duration) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold: Some(threshold),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> Duration {
        let elapsed = self.elapsed();

        if let Some(threshold) = self.threshold {
            if elapsed > threshold {
                warn!(
                    target: "vigil::perf",
                    operation = self.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    "Operation exceeded threshold"
                );
            }
        }

        trace!(
            target: "vigil::perf",
            operation = self.name,
            elapsed_ms = elapsed.as_millis() as u64,
            "Operation completed"
        );

        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perf_timer_reports_elapsed() {
        let timer = PerfTimer::with_threshold("unit", Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.stop() >= Duration::from_millis(5));
    }
}
