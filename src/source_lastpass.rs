//! LastPass Enterprise reporting events.
//!
//! One `reporting` command per run covers `[watermark, run start]`. The API
//! speaks wall-clock times in a fixed zone (US Mountain by default) and
//! returns events as an unordered map, so the adapter converts and sorts
//! them before handing them to the driver. A non-zero `next` in the
//! response continues the query.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use audit_harvest_core::{
    HarvestError, NormalizedRecord, PageOrder, PageRequest, PageResult, Pagination,
    RateLimitHint, Record,
};

use crate::adapter::{Normalizer, SourceAdapter};
use crate::config::LastpassConfig;
use crate::credential::{Credential, SecretRef};
use crate::http;

pub const DEFAULT_BASE_URL: &str = "https://lastpass.com";
pub const DEFAULT_CREDENTIAL_NAME: &str = "lastpass";
pub const DEFAULT_CHECKPOINT_KEY: &str = "lastpass-timestamp";
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Denver;

const LOG_SOURCE: &str = "lastpass";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Serialize)]
struct ReportingRequest<'a> {
    cid: &'a str,
    provhash: &'a str,
    cmd: &'static str,
    data: ReportingRange,
    #[serde(skip_serializing_if = "Option::is_none")]
    next: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ReportingRange {
    from: String,
    to: String,
}

#[derive(Debug, Deserialize)]
struct ReportingResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    next: Option<Value>,
    /// An object keyed by event id; PHP renders an empty one as `[]`.
    #[serde(default)]
    data: Value,
}

/// An event as the API sends it.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RawEvent {
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "IP_Address")]
    pub ip_address: String,
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "Data")]
    pub data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastpassEvent {
    /// Key of the event in the response map.
    pub id: String,
    pub at: DateTime<Utc>,
    pub raw: RawEvent,
}

impl Record for LastpassEvent {
    fn timestamp(&self) -> DateTime<Utc> {
        self.at
    }

    fn dedup_key(&self) -> Option<String> {
        Some(self.id.clone())
    }
}

/// Render `t` as the API's wall-clock time in `tz`.
pub fn format_time(t: DateTime<Utc>, tz: Tz) -> String {
    t.with_timezone(&tz).format(TIME_FORMAT).to_string()
}

/// Parse the API's wall-clock time in `tz`. Ambiguous times (the repeated
/// hour when DST ends) resolve to the earlier instant.
pub fn parse_time(raw: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), TIME_FORMAT).ok()?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

pub struct LastpassAdapter {
    http: reqwest::Client,
    endpoint: String,
    account_id: String,
    credential_name: String,
    tz: Tz,
    cooldown: Duration,
}

impl LastpassAdapter {
    pub fn new(http: reqwest::Client, config: &LastpassConfig) -> Result<Self, HarvestError> {
        let common = &config.common;
        let tz = match &config.timezone {
            Some(name) => name.parse::<Tz>().map_err(|e| {
                HarvestError::Config(format!("lastpass timezone '{}': {}", name, e))
            })?,
            None => DEFAULT_TIMEZONE,
        };
        Ok(Self {
            http,
            endpoint: format!("{}/enterpriseapi.php", common.base_url_or(DEFAULT_BASE_URL)),
            account_id: config.account_id.clone(),
            credential_name: common.credential_name_or(DEFAULT_CREDENTIAL_NAME),
            tz,
            cooldown: common.cooldown_or(30),
        })
    }

    /// Turn the response map into events sorted oldest first, counting the
    /// entries whose time cannot be read.
    fn collate(&self, data: Value) -> Result<(Vec<LastpassEvent>, usize), HarvestError> {
        let entries = match data {
            Value::Object(map) => map,
            Value::Null => return Ok((Vec::new(), 0)),
            Value::Array(items) if items.is_empty() => return Ok((Vec::new(), 0)),
            other => {
                return Err(HarvestError::parse(
                    "lastpass reporting: data is not an object",
                    other.to_string(),
                ))
            }
        };

        let mut skipped = 0;
        let mut events = Vec::with_capacity(entries.len());
        for (id, value) in entries {
            let raw: RawEvent = serde_json::from_value(value.clone()).map_err(|e| {
                HarvestError::parse(format!("lastpass event {}: {}", id, e), value.to_string())
            })?;
            match parse_time(&raw.time, self.tz) {
                Some(at) => events.push(LastpassEvent { id, at, raw }),
                None => {
                    tracing::warn!(event = %id, time = %raw.time, "lastpass event has unreadable time, skipping");
                    skipped += 1;
                }
            }
        }
        events.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.id.cmp(&b.id)));
        Ok((events, skipped))
    }
}

fn next_page(next: Option<Value>) -> Option<u64> {
    match next? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|n| *n > 0)
}

#[async_trait]
impl SourceAdapter for LastpassAdapter {
    type Record = LastpassEvent;

    fn name(&self) -> &str {
        LOG_SOURCE
    }

    fn description(&self) -> &str {
        "LastPass Enterprise reporting events"
    }

    fn order(&self) -> PageOrder {
        PageOrder::Ascending
    }

    fn pagination(&self) -> Pagination {
        Pagination::Cursor
    }

    fn rate_limit_hint(&self) -> RateLimitHint {
        RateLimitHint {
            cooldown: self.cooldown,
            min_interval: Duration::ZERO,
        }
    }

    fn secrets(&self) -> Vec<SecretRef> {
        vec![SecretRef::new("provhash", self.credential_name.clone())]
    }

    async fn fetch_page(
        &self,
        request: &PageRequest,
        credential: &Credential,
    ) -> Result<PageResult<LastpassEvent>, HarvestError> {
        let from = request.watermark.as_timestamp().ok_or_else(|| {
            HarvestError::Config("lastpass requires a timestamp watermark".into())
        })?;
        let next = match request.cursor.as_deref() {
            Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
                HarvestError::Config(format!("lastpass: invalid continuation '{}'", raw))
            })?),
            None => None,
        };

        let body = ReportingRequest {
            cid: &self.account_id,
            provhash: credential.get("provhash")?,
            cmd: "reporting",
            data: ReportingRange {
                from: format_time(from, self.tz),
                to: format_time(request.as_of, self.tz),
            },
            next,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::transport("lastpass reporting", e))?;
        let resp = http::check(resp, "lastpass reporting").await?;
        let parsed: ReportingResponse = http::read_json(resp, "lastpass reporting").await?;

        if !parsed.status.eq_ignore_ascii_case("OK") {
            return Err(HarvestError::Transport(format!(
                "lastpass reporting returned status '{}'",
                parsed.status
            )));
        }

        let (events, skipped) = self.collate(parsed.data)?;
        Ok(PageResult::last(events)
            .with_next(next_page(parsed.next).map(|n| n.to_string()))
            .with_skipped(skipped))
    }
}

pub struct LastpassNormalizer;

impl Normalizer<LastpassEvent> for LastpassNormalizer {
    fn normalize(&self, e: &LastpassEvent) -> Vec<NormalizedRecord> {
        vec![NormalizedRecord::builder(LOG_SOURCE, e.at)
            .field("ts", e.at.timestamp())
            .text("username", &e.raw.username)
            .text("src_ip", &e.raw.ip_address)
            .text("event_name", &e.raw.action)
            .text("description", &e.raw.data)
            .build()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> LastpassAdapter {
        LastpassAdapter::new(reqwest::Client::new(), &LastpassConfig::default()).unwrap()
    }

    #[test]
    fn times_are_mountain_wall_clock() {
        let t = Utc.with_ymd_and_hms(2024, 1, 15, 17, 0, 0).unwrap();
        assert_eq!(format_time(t, DEFAULT_TIMEZONE), "2024-01-15 10:00:00");

        // MDT is UTC-6.
        let parsed = parse_time("2024-07-01 12:30:00", DEFAULT_TIMEZONE).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 7, 1, 18, 30, 0).unwrap());
        assert!(parse_time("07/01/2024", DEFAULT_TIMEZONE).is_none());
    }

    #[test]
    fn collate_sorts_and_counts_unreadable() {
        let data = json!({
            "evt2": {"Time": "2024-01-15 10:00:05", "Username": "b@x", "IP_Address": "192.0.2.2", "Action": "Log in", "Data": ""},
            "evt1": {"Time": "2024-01-15 10:00:01", "Username": "a@x", "IP_Address": "192.0.2.1", "Action": "Log in", "Data": "ok"},
            "evt3": {"Time": "not a time", "Username": "c@x"}
        });
        let (events, skipped) = adapter().collate(data).unwrap();
        assert_eq!(skipped, 1);
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["evt1", "evt2"]);
    }

    #[test]
    fn empty_data_renders_as_array() {
        let (events, skipped) = adapter().collate(json!([])).unwrap();
        assert!(events.is_empty());
        assert_eq!(skipped, 0);
        assert!(adapter().collate(json!("oops")).is_err());
    }

    #[test]
    fn next_accepts_numbers_and_strings() {
        assert_eq!(next_page(Some(json!(2))), Some(2));
        assert_eq!(next_page(Some(json!("3"))), Some(3));
        assert_eq!(next_page(Some(json!(0))), None);
        assert_eq!(next_page(None), None);
    }

    #[test]
    fn normalizer_uses_snake_case_names() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 17, 0, 1).unwrap();
        let event = LastpassEvent {
            id: "evt1".into(),
            at,
            raw: RawEvent {
                time: "2024-01-15 10:00:01".into(),
                username: "a@example.com".into(),
                ip_address: "192.0.2.1".into(),
                action: "Log in".into(),
                data: String::new(),
            },
        };
        let out = LastpassNormalizer.normalize(&event);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("ts"), Some(&json!(at.timestamp())));
        assert_eq!(out[0].get_str("event_name"), Some("Log in"));
        assert_eq!(out[0].get_str("src_ip"), Some("192.0.2.1"));
        assert!(out[0].get("description").is_none());
    }
}
