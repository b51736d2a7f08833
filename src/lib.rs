//! # Vigil Engine
//!
//! System-health and performance-monitoring engine behind the administrative
//! dashboard of a background job-processing service.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              VIGIL ENGINE                                │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  METRIC SOURCES → PRODUCERS → SCHEDULER → CYCLE EVENTS → SNAPSHOT CACHE  │
//! │                                                       ↑                  │
//! │                                   DASHBOARD / JSON API (read only)       │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Producers:
//!
//! - [`health::HealthAggregator`] classifies every subsystem against a
//!   two-level threshold and rolls the result into one overall status.
//! - [`performance::PerformanceTracker`] keeps a bounded window of request
//!   outcomes and summarizes rates and latency percentiles.
//! - [`error_trend::ErrorTrendAnalyzer`] buckets errors into a rolling 24-hour
//!   histogram and classifies the trend.
//! - [`stuck::StuckJobDetector`] flags in-flight jobs that stopped
//!   heartbeating or ran past their maximum duration.
//! - [`predict::QueueWaitPredictor`] estimates the wait of a newly queued job
//!   from recent throughput.
//!
//! Reads go through [`cache::SnapshotCache`]: immutable snapshots swapped
//! atomically, a synchronous computation only on the very first cold read.

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod error_trend;
pub mod health;
pub mod logging;
pub mod notify;
pub mod performance;
pub mod predict;
pub mod scheduler;
pub mod source;
pub mod stuck;
pub mod types;

pub use cache::{Served, SnapshotCache};
pub use config::EngineConfig;
pub use engine::Monitor;
pub use error::{MonitorError, MonitorResult, SourceError};
pub use types::{Severity, Timestamp};

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "vigil-engine";
pub const ENGINE_FULL_NAME: &str = "Vigil Job Monitoring Engine";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default poll interval for every producer (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Minimum allowed poll interval (milliseconds)
pub const MIN_POLL_INTERVAL_MS: u64 = 1000;

/// Default timeout applied by each metric source adapter (seconds)
pub const DEFAULT_SOURCE_TIMEOUT_SECS: u64 = 2;

/// Grace period for shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 10;

// ----------------------------------------------------------------------------
// Windows & Retention
// ----------------------------------------------------------------------------

/// Maximum outcome events retained by the performance window
pub const DEFAULT_PERFORMANCE_MAX_EVENTS: usize = 10_000;

/// Maximum age of an outcome event in the performance window (seconds)
pub const DEFAULT_PERFORMANCE_MAX_AGE_SECS: u64 = 15 * 60;

/// Hour slots held by the error histogram
pub const ERROR_SLOTS: usize = 24;

/// Slots compared on each side of the error trend
pub const TREND_WINDOW_SLOTS: usize = 6;

/// Sample messages retained per error slot
pub const DEFAULT_SAMPLES_PER_SLOT: usize = 5;

/// Percentage change that flips the error trend away from flat
pub const DEFAULT_TREND_THRESHOLD_PCT: f64 = 20.0;

// ----------------------------------------------------------------------------
// Jobs & Queues
// ----------------------------------------------------------------------------

/// A processing job without a heartbeat for this long is stuck (seconds)
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 5 * 60;

/// Global maximum job duration when no job class override exists (seconds)
pub const DEFAULT_MAX_JOB_DURATION_SECS: u64 = 60 * 60;

/// Trailing window for throughput estimation (seconds)
pub const DEFAULT_THROUGHPUT_WINDOW_SECS: u64 = 15 * 60;

/// Completions needed in the window for a high-confidence prediction
pub const DEFAULT_MIN_PREDICTION_SAMPLES: usize = 10;

/// Largest wait estimate ever reported (seconds)
pub const DEFAULT_MAX_DISPLAY_WAIT_SECS: u64 = 24 * 60 * 60;

/// Throughput floor (completions per minute) guarding the wait division
pub const DEFAULT_THROUGHPUT_FLOOR: f64 = 0.01;

// ----------------------------------------------------------------------------
// Network
// ----------------------------------------------------------------------------

/// Default HTTP API port
pub const DEFAULT_HTTP_API_PORT: u16 = 8080;
