//! Core value types shared by every producer: timestamps, health status and
//! notification severity.

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ----------------------------------------------------------------------------
// Timestamp Types - Nanosecond Precision Time Handling
// ----------------------------------------------------------------------------

/// High-precision timestamp in nanoseconds since Unix epoch.
/// Using i64 allows representing times from ~1677 to ~2262.
///
/// Serialized as an RFC 3339 string so dashboard consumers can read it as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    const NANOS_PER_SEC: i64 = 1_000_000_000;
    const SECS_PER_HOUR: i64 = 3600;

    /// Create a new timestamp from nanoseconds since Unix epoch
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Create a new timestamp from milliseconds since Unix epoch
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Create a new timestamp from seconds since Unix epoch
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * Self::NANOS_PER_SEC)
    }

    /// Get the current timestamp with nanosecond precision
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / Self::NANOS_PER_SEC
    }

    /// Absolute hour index since the epoch; floors for pre-epoch values.
    #[inline]
    pub fn hour_index(&self) -> i64 {
        self.0.div_euclid(Self::NANOS_PER_SEC * Self::SECS_PER_HOUR)
    }

    /// Calculate duration between two timestamps (zero if `earlier` is later)
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    /// Add duration to timestamp
    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos() as i64))
    }

    /// Subtract duration from timestamp
    #[inline]
    pub fn sub_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_nanos() as i64))
    }

    /// Convert to chrono DateTime<Utc>
    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(Self::NANOS_PER_SEC);
        let nanos = self.0.rem_euclid(Self::NANOS_PER_SEC) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// Create from chrono DateTime<Utc>, saturating outside ~1677..~2262
    #[inline]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self::try_from_datetime(dt).unwrap_or(if dt.timestamp() >= 0 {
            Self(i64::MAX)
        } else {
            Self(i64::MIN)
        })
    }

    /// `None` when `dt` does not fit in nanoseconds since the epoch
    #[inline]
    pub fn try_from_datetime(dt: DateTime<Utc>) -> Option<Self> {
        dt.timestamp_nanos_opt().map(Self)
    }

    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Default for Timestamp {
    #[inline]
    fn default() -> Self {
        Self::now()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.to_datetime().to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let dt = DateTime::<Utc>::deserialize(deserializer)?;
        Self::try_from_datetime(dt).ok_or_else(|| {
            serde::de::Error::custom(format!("timestamp {} is outside the supported range", dt))
        })
    }
}

/// Atomic timestamp for lock-free last-seen tracking
#[derive(Debug)]
pub struct AtomicTimestamp(AtomicI64);

impl AtomicTimestamp {
    pub fn new(ts: Timestamp) -> Self {
        Self(AtomicI64::new(ts.as_nanos()))
    }

    #[inline]
    pub fn load(&self, order: AtomicOrdering) -> Timestamp {
        Timestamp::from_nanos(self.0.load(order))
    }

    #[inline]
    pub fn store(&self, ts: Timestamp, order: AtomicOrdering) {
        self.0.store(ts.as_nanos(), order);
    }
}

impl Default for AtomicTimestamp {
    fn default() -> Self {
        Self::new(Timestamp::EPOCH)
    }
}

// ----------------------------------------------------------------------------
// Health Status
// ----------------------------------------------------------------------------

/// Health classification of one subsystem or of the whole service.
///
/// Ordered by severity so the overall status is the maximum across subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Get icon for UI display.
    pub fn icon(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "✓",
            HealthStatus::Degraded => "⚠",
            HealthStatus::Unhealthy => "✗",
        }
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus::Healthy
    }
}

impl Display for HealthStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Severity
// ----------------------------------------------------------------------------

/// Severity level attached to notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Severity {
    /// Informational - no action needed
    Info = 0,
    /// Something degraded and should be looked at soon
    Warning = 1,
    /// Immediate action required
    Critical = 2,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl From<HealthStatus> for Severity {
    fn from(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Healthy => Severity::Info,
            HealthStatus::Degraded => Severity::Warning,
            HealthStatus::Unhealthy => Severity::Critical,
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Info
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
