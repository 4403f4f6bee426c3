//! Millisecond-precision UTC timestamps.
//!
//! Timestamps are part of object keys (`.../2000-01-01T01:00:00.000Z`), so
//! the textual form must be fixed-width and lexically sortable.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// UTC timestamp truncated to milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcTime(DateTime<Utc>);

impl UtcTime {
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.trunc_subsecs(3))
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        NaiveDateTime::parse_from_str(value, FORMAT)
            .map(|naive| Self::from_datetime(Utc.from_utc_datetime(&naive)))
            .map_err(|e| ConfigError::InvalidValue {
                key: "timestamp".to_string(),
                value: value.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Nanoseconds since the Unix epoch, used as a deterministic seed.
    pub fn unix_nanos(&self) -> i64 {
        self.0
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.0.timestamp_millis().saturating_mul(1_000_000))
    }

    pub fn unix_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn add(&self, d: Duration) -> Self {
        let delta = chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX);
        Self::from_datetime(self.0 + delta)
    }

    /// Duration elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn since(&self, earlier: UtcTime) -> Duration {
        (self.0 - earlier.0).to_std().unwrap_or(Duration::ZERO)
    }
}

impl fmt::Display for UtcTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(FORMAT))
    }
}

impl FromStr for UtcTime {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<DateTime<Utc>> for UtcTime {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

impl Serialize for UtcTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UtcTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
