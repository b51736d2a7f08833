//! Configuration system.
//!
//! TOML file parsing with `VIGIL_`-prefixed environment overrides, validation,
//! and defaults for every threshold, window and horizon the engine uses.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::health::{Subsystem, Threshold};
use crate::{
    DEFAULT_HEARTBEAT_TIMEOUT_SECS, DEFAULT_HTTP_API_PORT, DEFAULT_MAX_DISPLAY_WAIT_SECS,
    DEFAULT_MAX_JOB_DURATION_SECS, DEFAULT_MIN_PREDICTION_SAMPLES, DEFAULT_PERFORMANCE_MAX_AGE_SECS,
    DEFAULT_PERFORMANCE_MAX_EVENTS, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_SAMPLES_PER_SLOT,
    DEFAULT_SOURCE_TIMEOUT_SECS, DEFAULT_THROUGHPUT_FLOOR, DEFAULT_THROUGHPUT_WINDOW_SECS,
    DEFAULT_TREND_THRESHOLD_PCT, MIN_POLL_INTERVAL_MS, SHUTDOWN_GRACE_PERIOD_SECS,
};

// ----------------------------------------------------------------------------
// Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the monitoring engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: GeneralConfig,

    #[serde(default)]
    pub sources: SourcesConfig,

    #[serde(default)]
    pub thresholds: ThresholdsConfig,

    #[serde(default)]
    pub performance: PerformanceConfig,

    #[serde(default)]
    pub errors: ErrorTrendConfig,

    #[serde(default)]
    pub stuck_jobs: StuckJobConfig,

    #[serde(default)]
    pub queue: QueuePredictionConfig,

    #[serde(default)]
    pub api: HttpApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("VIGIL_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.poll_interval < Duration::from_millis(MIN_POLL_INTERVAL_MS) {
            return Err(ConfigError::invalid_value(
                "engine.poll_interval",
                format!("poll interval must be at least {}ms", MIN_POLL_INTERVAL_MS),
            ));
        }

        if self.sources.timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "sources.timeout",
                "source timeout must be greater than zero",
            ));
        }

        for subsystem in Subsystem::ALL {
            if let Some(threshold) = self.thresholds.get(subsystem) {
                if !threshold.warning.is_finite() || !threshold.critical.is_finite() {
                    return Err(ConfigError::invalid_value(
                        format!("thresholds.{}", subsystem.as_str()),
                        "thresholds must be finite numbers",
                    ));
                }
                if threshold.warning > threshold.critical {
                    return Err(ConfigError::invalid_value(
                        format!("thresholds.{}", subsystem.as_str()),
                        format!(
                            "warning ({}) cannot exceed critical ({})",
                            threshold.warning, threshold.critical
                        ),
                    ));
                }
            }
        }

        if self.performance.max_events == 0 || self.performance.max_age.is_zero() {
            return Err(ConfigError::invalid_value(
                "performance",
                "retention horizon must hold at least one event",
            ));
        }

        if self.errors.trend_threshold_pct < 0.0 {
            return Err(ConfigError::invalid_value(
                "errors.trend_threshold_pct",
                "trend percentage cannot be negative",
            ));
        }

        if self.queue.window.is_zero() {
            return Err(ConfigError::invalid_value(
                "queue.window",
                "throughput window must be greater than zero",
            ));
        }

        if !(self.queue.throughput_floor > 0.0) {
            return Err(ConfigError::invalid_value(
                "queue.throughput_floor",
                "throughput floor must be a positive number",
            ));
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Age after which a derived snapshot counts as stale
    pub fn freshness_window(&self) -> Duration {
        self.engine.poll_interval
    }
}

// ----------------------------------------------------------------------------
// General Engine Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Engine instance name (for identification)
    pub instance_name: String,

    /// Interval between producer cycles; also the freshness window
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Environment name (prod, staging, dev)
    pub environment: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: "vigil-engine".into(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            shutdown_timeout: Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS),
            environment: "production".into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Metric Source Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Upper bound on any single backend call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Queues whose depth feeds the queued-jobs subsystem and the predictor
    pub queues: Vec<String>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_SOURCE_TIMEOUT_SECS),
            queues: vec!["default".into()],
        }
    }
}

// ----------------------------------------------------------------------------
// Threshold Configuration
// ----------------------------------------------------------------------------

/// Two-level thresholds per subsystem. A missing entry is never breached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    /// CPU usage percent
    pub cpu: Option<Threshold>,
    /// Memory usage percent
    pub memory: Option<Threshold>,
    /// Fullest disk usage percent
    pub disk: Option<Threshold>,
    /// Database connection pool utilization percent
    pub database: Option<Threshold>,
    /// Cache/queue backend ping latency in milliseconds
    pub cache: Option<Threshold>,
    /// Jobs currently processing
    pub active_jobs: Option<Threshold>,
    /// Jobs waiting across monitored queues
    pub queued_jobs: Option<Threshold>,
}

impl ThresholdsConfig {
    pub fn get(&self, subsystem: Subsystem) -> Option<Threshold> {
        match subsystem {
            Subsystem::Cpu => self.cpu,
            Subsystem::Memory => self.memory,
            Subsystem::Disk => self.disk,
            Subsystem::Database => self.database,
            Subsystem::Cache => self.cache,
            Subsystem::ActiveJobs => self.active_jobs,
            Subsystem::QueuedJobs => self.queued_jobs,
        }
    }
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            cpu: Some(Threshold::new(80.0, 95.0)),
            memory: Some(Threshold::new(85.0, 95.0)),
            disk: Some(Threshold::new(85.0, 95.0)),
            database: Some(Threshold::new(75.0, 90.0)),
            cache: Some(Threshold::new(100.0, 500.0)),
            active_jobs: None,
            queued_jobs: Some(Threshold::new(1_000.0, 5_000.0)),
        }
    }
}

// ----------------------------------------------------------------------------
// Producer Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Most recent N outcome events kept
    pub max_events: usize,

    /// Most recent T of outcome events kept
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_PERFORMANCE_MAX_EVENTS,
            max_age: Duration::from_secs(DEFAULT_PERFORMANCE_MAX_AGE_SECS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorTrendConfig {
    /// Sample messages retained per hour slot
    pub samples_per_slot: usize,

    /// Percentage difference between the recent and prior windows that
    /// classifies the trend as rising or falling
    pub trend_threshold_pct: f64,
}

impl Default for ErrorTrendConfig {
    fn default() -> Self {
        Self {
            samples_per_slot: DEFAULT_SAMPLES_PER_SLOT,
            trend_threshold_pct: DEFAULT_TREND_THRESHOLD_PCT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StuckJobConfig {
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Fallback when the job's class has no override
    #[serde(with = "humantime_serde")]
    pub max_job_duration: Duration,

    pub job_classes: Vec<JobClassLimit>,
}

impl Default for StuckJobConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            max_job_duration: Duration::from_secs(DEFAULT_MAX_JOB_DURATION_SECS),
            job_classes: Vec::new(),
        }
    }
}

/// Maximum duration override for one job class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobClassLimit {
    pub class: String,
    #[serde(with = "humantime_serde")]
    pub max_duration: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePredictionConfig {
    /// Trailing window over which throughput is measured
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Completions in the window needed for high confidence
    pub min_samples: usize,

    /// Largest wait ever reported
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,

    /// Completions per minute below which throughput counts as zero
    pub throughput_floor: f64,
}

impl Default for QueuePredictionConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(DEFAULT_THROUGHPUT_WINDOW_SECS),
            min_samples: DEFAULT_MIN_PREDICTION_SAMPLES,
            max_wait: Duration::from_secs(DEFAULT_MAX_DISPLAY_WAIT_SECS),
            throughput_floor: DEFAULT_THROUGHPUT_FLOOR,
        }
    }
}

// ----------------------------------------------------------------------------
// HTTP API Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpApiConfig {
    pub enabled: bool,

    /// Listen address
    pub address: String,
}

impl Default for HttpApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: format!("0.0.0.0:{}", DEFAULT_HTTP_API_PORT),
        }
    }
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Output format (json, pretty, compact)
    pub format: String,

    /// Enable ANSI colors
    pub colors: bool,

    /// Include source location
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
            colors: true,
            source_location: false,
        }
    }
}
