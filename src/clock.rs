//! Conversion between the store's local wall-clock time and UTC.
//!
//! The Schedule Store keeps naive `YYYY-MM-DD HH:MM:SS` timestamps in its own
//! local zone; the scheduler evaluates everything in UTC.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, SecondsFormat, TimeZone, Utc};

pub const STORE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Fixed-width RFC 3339 rendering for instants kept as text, so that SQL
/// string comparison orders them chronologically.
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreClock {
    offset: FixedOffset,
}

impl StoreClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// A clock whose local time is UTC.
    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Interpret a stored local timestamp as an instant.
    pub fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        Utc.from_utc_datetime(&(local - self.offset))
    }

    /// Render an instant as a stored local timestamp.
    pub fn to_local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.with_timezone(&self.offset).naive_local()
    }

    pub fn format_local(&self, instant: DateTime<Utc>) -> String {
        self.to_local(instant).format(STORE_TIME_FORMAT).to_string()
    }

    /// Parse a stored local timestamp string into UTC.
    pub fn parse_local(&self, raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        NaiveDateTime::parse_from_str(raw, STORE_TIME_FORMAT).map(|local| self.to_utc(local))
    }
}
