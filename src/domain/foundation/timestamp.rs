//! Timestamp value object for immutable points in time.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ValidationError;

/// Immutable point in time, always UTC.
///
/// Store payloads report times as Unix milliseconds (mobile store, app store)
/// or Unix seconds (web gateway); both are accepted here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a timestamp for the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Parses Unix milliseconds, rejecting values chrono cannot represent.
    pub fn from_unix_millis(millis: i64) -> Result<Self, ValidationError> {
        Utc.timestamp_millis_opt(millis)
            .single()
            .map(Self)
            .ok_or_else(|| {
                ValidationError::invalid_format("timestamp", format!("{} ms is out of range", millis))
            })
    }

    /// Parses Unix seconds, rejecting values chrono cannot represent.
    pub fn from_unix_secs(secs: i64) -> Result<Self, ValidationError> {
        Utc.timestamp_opt(secs, 0)
            .single()
            .map(Self)
            .ok_or_else(|| {
                ValidationError::invalid_format("timestamp", format!("{} s is out of range", secs))
            })
    }

    pub fn as_unix_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn as_unix_secs(&self) -> i64 {
        self.0.timestamp()
    }

    pub fn is_before(&self, other: &Timestamp) -> bool {
        self.0 < other.0
    }

    pub fn is_after(&self, other: &Timestamp) -> bool {
        self.0 > other.0
    }

    /// Returns the duration from another timestamp to this one.
    ///
    /// Negative if `other` is after `self`.
    pub fn duration_since(&self, other: &Timestamp) -> Duration {
        self.0.signed_duration_since(other.0)
    }

    /// Negative values subtract days.
    pub fn plus_days(&self, days: i64) -> Self {
        Self(self.0 + Duration::days(days))
    }

    pub fn minus_days(&self, days: i64) -> Self {
        Self(self.0 - Duration::days(days))
    }

    pub fn plus_secs(&self, secs: i64) -> Self {
        Self(self.0 + Duration::seconds(secs))
    }

    pub fn minus_secs(&self, secs: i64) -> Self {
        Self(self.0 - Duration::seconds(secs))
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_unix_millis_preserves_millisecond_precision() {
        let ts = Timestamp::from_unix_millis(1_700_000_000_123).unwrap();
        assert_eq!(ts.as_unix_millis(), 1_700_000_000_123);
        assert_eq!(ts.as_unix_secs(), 1_700_000_000);
    }

    #[test]
    fn from_unix_millis_rejects_out_of_range() {
        assert!(Timestamp::from_unix_millis(i64::MAX).is_err());
    }

    #[test]
    fn from_unix_secs_matches_millis() {
        let a = Timestamp::from_unix_secs(1_700_000_000).unwrap();
        let b = Timestamp::from_unix_millis(1_700_000_000_000).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn ordering_follows_time() {
        let now = Timestamp::now();
        let later = now.plus_days(30);
        assert!(now.is_before(&later));
        assert!(later.is_after(&now));
        assert_eq!(std::cmp::max(now, later), later);
    }

    #[test]
    fn plus_and_minus_are_inverse() {
        let now = Timestamp::now();
        assert_eq!(now.plus_days(3).minus_days(3), now);
        assert_eq!(now.plus_secs(90).minus_secs(90), now);
    }

    #[test]
    fn duration_since_is_signed() {
        let now = Timestamp::now();
        let later = now.plus_secs(60);
        assert_eq!(later.duration_since(&now).num_seconds(), 60);
        assert_eq!(now.duration_since(&later).num_seconds(), -60);
    }

    #[test]
    fn serializes_as_rfc3339_string() {
        let ts = Timestamp::from_unix_secs(0).unwrap();
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"1970-01-01T00:00:00Z\"");
    }
}
