//! Normalized records, the unit of emission.
//!
//! A [`NormalizedRecord`] is a flat JSON object. Every record carries two
//! fields set at construction time:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `event_time` | RFC 3339 UTC instant of the event |
//! | `log_source` | source/category discriminant (e.g. `"cloudflare"`) |
//!
//! Everything else is source specific and added through [`RecordBuilder`].
//! Missing optional values are omitted rather than written as `null` or `""`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Field name for the event instant.
pub const EVENT_TIME_FIELD: &str = "event_time";
/// Field name for the source/category discriminant.
pub const LOG_SOURCE_FIELD: &str = "log_source";

/// Capability every raw provider record exposes to the driver.
pub trait Record {
    /// Event instant used for watermark comparisons.
    fn timestamp(&self) -> DateTime<Utc>;

    /// Stable identity used to drop duplicates when a query window is
    /// re-opened at an instant that was already partially emitted.
    fn dedup_key(&self) -> Option<String> {
        None
    }
}

/// A flat, immutable field map.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct NormalizedRecord {
    fields: Map<String, Value>,
}

impl NormalizedRecord {
    /// Start a record for `log_source` at `event_time`.
    pub fn builder(log_source: &str, event_time: DateTime<Utc>) -> RecordBuilder {
        let mut fields = Map::new();
        fields.insert(
            EVENT_TIME_FIELD.to_string(),
            Value::String(event_time.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        fields.insert(
            LOG_SOURCE_FIELD.to_string(),
            Value::String(log_source.to_string()),
        );
        RecordBuilder { fields }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    pub fn log_source(&self) -> &str {
        self.get_str(LOG_SOURCE_FIELD).unwrap_or_default()
    }

    pub fn event_time(&self) -> &str {
        self.get_str(EVENT_TIME_FIELD).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Serialize as a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.fields)
    }
}

/// Accumulates fields before freezing them into a [`NormalizedRecord`].
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    fields: Map<String, Value>,
}

impl RecordBuilder {
    /// Set a field unconditionally.
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Set a string field, omitting it when empty.
    pub fn text(self, key: &str, value: impl AsRef<str>) -> Self {
        let value = value.as_ref();
        if value.is_empty() {
            self
        } else {
            self.field(key, value)
        }
    }

    /// Set a field when present.
    pub fn maybe<T: Into<Value>>(self, key: &str, value: Option<T>) -> Self {
        match value {
            Some(v) => self.field(key, v),
            None => self,
        }
    }

    /// Set a string field when present and non-empty.
    pub fn maybe_text(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.text(key, v),
            None => self,
        }
    }

    /// Set a boolean only when true.
    pub fn flag(self, key: &str, value: bool) -> Self {
        if value {
            self.field(key, true)
        } else {
            self
        }
    }

    /// Set a list field, omitting it when empty.
    pub fn list<T: Into<Value>>(self, key: &str, values: Vec<T>) -> Self {
        if values.is_empty() {
            self
        } else {
            self.field(key, Value::Array(values.into_iter().map(Into::into).collect()))
        }
    }

    /// Set a map field, omitting it when empty.
    pub fn map(self, key: &str, values: Map<String, Value>) -> Self {
        if values.is_empty() {
            self
        } else {
            self.field(key, Value::Object(values))
        }
    }

    pub fn build(self) -> NormalizedRecord {
        NormalizedRecord {
            fields: self.fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn always_carries_time_and_source() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 5).unwrap();
        let rec = NormalizedRecord::builder("slack", t).build();
        assert_eq!(rec.event_time(), "2024-01-01T00:00:05Z");
        assert_eq!(rec.log_source(), "slack");
        assert_eq!(rec.len(), 2);
    }

    #[test]
    fn empty_optionals_are_omitted() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let rec = NormalizedRecord::builder("x", t)
            .text("empty", "")
            .maybe::<i64>("none", None)
            .maybe_text("absent", None)
            .flag("off", false)
            .list::<String>("nothing", vec![])
            .text("user", "alice")
            .flag("on", true)
            .build();
        assert!(rec.get("empty").is_none());
        assert!(rec.get("none").is_none());
        assert!(rec.get("absent").is_none());
        assert!(rec.get("off").is_none());
        assert!(rec.get("nothing").is_none());
        assert_eq!(rec.get_str("user"), Some("alice"));
        assert_eq!(rec.get("on"), Some(&Value::Bool(true)));
    }

    #[test]
    fn json_line_is_flat_object() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let line = NormalizedRecord::builder("gsuite", t)
            .field("count", 3)
            .build()
            .to_json_line()
            .unwrap();
        assert!(!line.contains('\n'));
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["count"], 3);
        assert_eq!(parsed["log_source"], "gsuite");
    }
}
