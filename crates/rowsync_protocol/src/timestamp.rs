//! Millisecond-precision UTC timestamps.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use std::fmt;

/// A logical modification timestamp.
///
/// Always UTC, always truncated to millisecond precision so that a value
/// survives a round trip through its ISO-8601 rendering
/// (`YYYY-MM-DDTHH:MM:SS.fffZ`) and through SQLite's
/// `strftime('%Y-%m-%dT%H:%M:%fZ','now')` unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current time, truncated to milliseconds.
    pub fn now() -> Self {
        Self::from_millis(Utc::now().timestamp_millis())
    }

    /// Creates a timestamp from milliseconds since the Unix epoch.
    pub fn from_millis(millis: i64) -> Self {
        Self(Utc.timestamp_millis_opt(millis).single().unwrap_or_default())
    }

    /// Returns milliseconds since the Unix epoch.
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Parses an ISO-8601 UTC timestamp.
    pub fn parse_iso(value: &str) -> ProtocolResult<Self> {
        let parsed = DateTime::parse_from_rfc3339(value)
            .map_err(|e| ProtocolError::InvalidTimestamp(format!("{value}: {e}")))?;
        Ok(Self::from_millis(parsed.with_timezone(&Utc).timestamp_millis()))
    }

    /// Renders as ISO-8601 with millisecond precision and a `Z` suffix.
    pub fn to_iso(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// The epoch; used where "never synced" needs a concrete value.
    pub fn epoch() -> Self {
        Self::from_millis(0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_roundtrip() {
        let ts = Timestamp::from_millis(1_700_000_123_456);
        let iso = ts.to_iso();
        assert!(iso.ends_with('Z'));
        assert_eq!(Timestamp::parse_iso(&iso).unwrap(), ts);
    }

    #[test]
    fn millis_precision() {
        let ts = Timestamp::from_millis(1_700_000_000_001);
        assert_eq!(ts.as_millis(), 1_700_000_000_001);
        assert!(ts.to_iso().contains(".001Z"));
    }

    #[test]
    fn now_is_truncated() {
        let ts = Timestamp::now();
        assert_eq!(ts, Timestamp::from_millis(ts.as_millis()));
    }

    #[test]
    fn ordering_follows_time() {
        let a = Timestamp::from_millis(10);
        let b = Timestamp::from_millis(20);
        assert!(a < b);
        assert_eq!(a.max(b), b);
    }

    #[test]
    fn sqlite_strftime_format_parses() {
        // What strftime('%Y-%m-%dT%H:%M:%fZ','now') produces.
        let ts = Timestamp::parse_iso("2026-08-02T10:15:30.250Z").unwrap();
        assert_eq!(ts.to_iso(), "2026-08-02T10:15:30.250Z");
    }

    #[test]
    fn bad_input_rejected() {
        assert!(Timestamp::parse_iso("not a timestamp").is_err());
        assert!(Timestamp::parse_iso("2026-13-40T99:00:00Z").is_err());
    }
}
