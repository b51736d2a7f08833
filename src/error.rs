//! Error handling framework.
//!
//! Every producer reports through [`MonitorError`]; metric source adapters use
//! the narrower [`SourceError`], which the health cycle absorbs into a
//! degraded reading instead of propagating.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the engine
pub type MonitorResult<T> = Result<T, MonitorError>;

/// Result alias for metric source adapters
pub type SourceResult<T> = Result<T, SourceError>;

// ----------------------------------------------------------------------------
// Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the monitoring engine.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source unavailable: {0}")]
    Source(#[from] SourceError),

    #[error("Invalid sample from '{source_id}': {reason}")]
    InvalidSample { source_id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl MonitorError {
    /// Check if the next poll cycle may succeed without intervention
    pub fn is_recoverable(&self) -> bool {
        match self {
            MonitorError::Config(_) => false,
            MonitorError::Source(e) => e.is_recoverable(),
            MonitorError::InvalidSample { .. } => true,
            MonitorError::Io(_) => true,
            MonitorError::Internal(_) => false,
            MonitorError::ShuttingDown => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            MonitorError::Config(_) => "config",
            MonitorError::Source(_) => "source",
            MonitorError::InvalidSample { .. } => "invalid_sample",
            MonitorError::Io(_) => "io",
            MonitorError::Internal(_) => "internal",
            MonitorError::ShuttingDown => "shutdown",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            MonitorError::Config(_) => RecoveryHint::FixConfiguration,
            MonitorError::Source(e) => e.recovery_hint(),
            MonitorError::InvalidSample { .. } => RecoveryHint::Skip,
            MonitorError::ShuttingDown => RecoveryHint::None,
            _ => RecoveryHint::RetryNextCycle,
        }
    }

    pub fn invalid_sample(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        MonitorError::InvalidSample {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// The scheduler retries on its next interval
    RetryNextCycle,
    /// Reconnect to the backend
    Reconnect,
    /// Fix configuration and restart
    FixConfiguration,
    /// Drop this reading and continue
    Skip,
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Metric Source Errors
// ----------------------------------------------------------------------------

/// Errors from a single metric source call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("'{source_id}' is unavailable: {message}")]
    Unavailable { source_id: String, message: String },

    #[error("Timeout waiting for '{source_id}' (waited {timeout_ms}ms)")]
    Timeout { source_id: String, timeout_ms: u64 },

    #[error("Invalid response from '{source_id}': {message}")]
    InvalidResponse { source_id: String, message: String },
}

impl SourceError {
    pub fn unavailable(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        SourceError::Unavailable {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    pub fn timeout(source_id: impl Into<String>, timeout_ms: u64) -> Self {
        SourceError::Timeout {
            source_id: source_id.into(),
            timeout_ms,
        }
    }

    pub fn invalid_response(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        SourceError::InvalidResponse {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    pub fn source_id(&self) -> &str {
        match self {
            SourceError::Unavailable { source_id, .. }
            | SourceError::Timeout { source_id, .. }
            | SourceError::InvalidResponse { source_id, .. } => source_id,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        true
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            SourceError::Unavailable { .. } => RecoveryHint::Reconnect,
            SourceError::Timeout { .. } => RecoveryHint::RetryNextCycle,
            SourceError::InvalidResponse { .. } => RecoveryHint::Skip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err: MonitorError = SourceError::timeout("os.cpu", 2000).into();
        assert_eq!(err.category(), "source");
        assert!(err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::RetryNextCycle);

        let err: MonitorError = ConfigError::invalid_value("engine.poll_interval", "too small").into();
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::FixConfiguration);
    }

    #[test]
    fn test_source_error_display() {
        let err = SourceError::timeout("db.pool", 2000);
        assert_eq!(err.to_string(), "Timeout waiting for 'db.pool' (waited 2000ms)");
        assert_eq!(err.source_id(), "db.pool");
    }
}
