//! Durable resume points.
//!
//! A [`Watermark`] is either a UTC instant (timestamp sources) or an opaque
//! provider cursor (cursor sources). Timestamp watermarks mark the first
//! instant that has **not** been harvested yet: a record is new when its
//! timestamp is `>=` the watermark. They are stored as decimal UNIX seconds.

use std::fmt;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::error::HarvestError;

/// Which flavour of watermark a source persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkKind {
    Timestamp,
    Cursor,
}

/// A resume point read from and written to the checkpoint store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Watermark {
    /// First instant not yet harvested (second granularity).
    Timestamp(DateTime<Utc>),
    /// Provider cursor to resume from. Empty means "from the beginning".
    Cursor(String),
}

impl Watermark {
    /// Build a timestamp watermark truncated to whole seconds.
    pub fn at(ts: DateTime<Utc>) -> Self {
        Watermark::Timestamp(truncate_to_second(ts))
    }

    /// The watermark that follows a record seen at `latest`: one second past it.
    pub fn after(latest: DateTime<Utc>) -> Self {
        Watermark::Timestamp(truncate_to_second(latest) + Duration::seconds(1))
    }

    /// Decode a stored checkpoint blob.
    ///
    /// Timestamp blobs are decimal UNIX seconds; RFC 3339 strings are
    /// accepted too. Cursor blobs are taken verbatim (trimmed).
    pub fn decode(kind: WatermarkKind, raw: &str) -> Result<Self, HarvestError> {
        let raw = raw.trim();
        match kind {
            WatermarkKind::Cursor => Ok(Watermark::Cursor(raw.to_string())),
            WatermarkKind::Timestamp => parse_instant(raw)
                .map(Watermark::at)
                .ok_or_else(|| {
                    HarvestError::Checkpoint(format!("invalid timestamp watermark: '{}'", raw))
                }),
        }
    }

    /// Encode for the checkpoint store.
    pub fn encode(&self) -> String {
        match self {
            Watermark::Timestamp(ts) => ts.timestamp().to_string(),
            Watermark::Cursor(c) => c.clone(),
        }
    }

    pub fn kind(&self) -> WatermarkKind {
        match self {
            Watermark::Timestamp(_) => WatermarkKind::Timestamp,
            Watermark::Cursor(_) => WatermarkKind::Cursor,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Watermark::Timestamp(ts) => Some(*ts),
            Watermark::Cursor(_) => None,
        }
    }

    pub fn as_cursor(&self) -> Option<&str> {
        match self {
            Watermark::Cursor(c) if !c.is_empty() => Some(c.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%dT%H:%M:%SZ")),
            Watermark::Cursor(c) if c.is_empty() => write!(f, "<beginning>"),
            Watermark::Cursor(c) => write!(f, "cursor:{}", c),
        }
    }
}

/// What a source resumes from when no checkpoint exists yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdStart {
    /// Start at the run's start instant; nothing is emitted retroactively.
    Now,
    /// Start a fixed distance before the run's start instant.
    Lookback(std::time::Duration),
    /// Start from the epoch (timestamp) or the empty cursor.
    Beginning,
}

impl ColdStart {
    /// Resolve the default watermark for a source of the given kind.
    pub fn resolve(&self, kind: WatermarkKind, now: DateTime<Utc>) -> Watermark {
        match (kind, self) {
            (WatermarkKind::Cursor, _) => Watermark::Cursor(String::new()),
            (WatermarkKind::Timestamp, ColdStart::Now) => Watermark::at(now),
            (WatermarkKind::Timestamp, ColdStart::Lookback(d)) => {
                let back = Duration::from_std(*d).unwrap_or_else(|_| Duration::zero());
                Watermark::at(now - back)
            }
            (WatermarkKind::Timestamp, ColdStart::Beginning) => {
                Watermark::Timestamp(DateTime::<Utc>::UNIX_EPOCH)
            }
        }
    }
}

/// Parse a decimal UNIX timestamp or an RFC 3339 instant.
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(secs) = raw.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn truncate_to_second(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.timestamp(), 0).single().unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn decode_accepts_unix_and_rfc3339() {
        let a = Watermark::decode(WatermarkKind::Timestamp, "1704067200").unwrap();
        let b = Watermark::decode(WatermarkKind::Timestamp, "2024-01-01T00:00:00Z").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.encode(), "1704067200");
    }

    #[test]
    fn decode_rejects_garbage_timestamp() {
        let err = Watermark::decode(WatermarkKind::Timestamp, "yesterday").unwrap_err();
        assert!(matches!(err, HarvestError::Checkpoint(_)));
    }

    #[test]
    fn cursor_is_verbatim() {
        let w = Watermark::decode(WatermarkKind::Cursor, " abc==\n").unwrap();
        assert_eq!(w.as_cursor(), Some("abc=="));
        assert_eq!(w.encode(), "abc==");
        assert_eq!(Watermark::Cursor(String::new()).as_cursor(), None);
    }

    #[test]
    fn after_is_one_second_past_latest() {
        let w = Watermark::after(ts("2024-01-01T00:00:10.750Z"));
        assert_eq!(w, Watermark::Timestamp(ts("2024-01-01T00:00:11Z")));
    }

    #[test]
    fn cold_start_policies() {
        let now = ts("2024-06-01T12:00:00.500Z");
        assert_eq!(
            ColdStart::Now.resolve(WatermarkKind::Timestamp, now),
            Watermark::Timestamp(ts("2024-06-01T12:00:00Z"))
        );
        assert_eq!(
            ColdStart::Lookback(std::time::Duration::from_secs(3600))
                .resolve(WatermarkKind::Timestamp, now),
            Watermark::Timestamp(ts("2024-06-01T11:00:00Z"))
        );
        assert_eq!(
            ColdStart::Beginning.resolve(WatermarkKind::Timestamp, now),
            Watermark::Timestamp(DateTime::<Utc>::UNIX_EPOCH)
        );
        assert_eq!(
            ColdStart::Now.resolve(WatermarkKind::Cursor, now),
            Watermark::Cursor(String::new())
        );
    }
}
