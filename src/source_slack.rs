//! Slack team access logs (`team.accessLogs`).
//!
//! The endpoint pages newest first with `page`/`pages` counters. Every
//! request of a run pins `before` to the run start so the pages stay stable
//! while the walk is in progress. The driver stops at the first login whose
//! `date_last` is older than the watermark.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use audit_harvest_core::{
    HarvestError, NormalizedRecord, PageOrder, PageRequest, PageResult, Pagination,
    RateLimitHint, Record,
};

use crate::adapter::{Normalizer, SourceAdapter};
use crate::config::SlackConfig;
use crate::credential::{Credential, SecretRef};
use crate::http;

pub const DEFAULT_BASE_URL: &str = "https://slack.com/api";
pub const DEFAULT_CREDENTIAL_NAME: &str = "slack";
pub const DEFAULT_CHECKPOINT_KEY: &str = "slack-timestamp";
pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_PAGE_DELAY_MS: u64 = 50;
pub const DEFAULT_COOLDOWN_SECS: u64 = 30;

const LOG_SOURCE: &str = "slack";
/// Slack's `error` for a query with nothing in it.
const NO_RESULTS: &str = "no results";

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AccessLog {
    pub user_id: String,
    pub username: String,
    pub date_first: i64,
    pub date_last: i64,
    pub count: i64,
    pub ip: String,
    pub user_agent: String,
    pub isp: String,
    pub country: String,
    pub region: String,
}

impl AccessLog {
    fn last_seen(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.date_last, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl Record for AccessLog {
    fn timestamp(&self) -> DateTime<Utc> {
        self.last_seen()
    }

    fn dedup_key(&self) -> Option<String> {
        Some(format!(
            "{}|{}|{}|{}",
            self.user_id, self.ip, self.user_agent, self.date_last
        ))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Paging {
    page: u32,
    pages: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AccessLogsResponse {
    ok: bool,
    error: String,
    logins: Vec<AccessLog>,
    paging: Paging,
}

pub struct SlackAdapter {
    http: reqwest::Client,
    endpoint: String,
    credential_name: String,
    page_size: u32,
    page_delay: Duration,
    cooldown: Duration,
}

impl SlackAdapter {
    pub fn new(http: reqwest::Client, config: &SlackConfig) -> Self {
        let common = &config.common;
        Self {
            http,
            endpoint: format!("{}/team.accessLogs", common.base_url_or(DEFAULT_BASE_URL)),
            credential_name: common.credential_name_or(DEFAULT_CREDENTIAL_NAME),
            page_size: config.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 1000),
            page_delay: Duration::from_millis(
                config.page_delay_ms.unwrap_or(DEFAULT_PAGE_DELAY_MS),
            ),
            cooldown: common.cooldown_or(DEFAULT_COOLDOWN_SECS),
        }
    }
}

#[async_trait]
impl SourceAdapter for SlackAdapter {
    type Record = AccessLog;

    fn name(&self) -> &str {
        LOG_SOURCE
    }

    fn description(&self) -> &str {
        "Slack team access logs (newest first)"
    }

    fn order(&self) -> PageOrder {
        PageOrder::Descending
    }

    fn pagination(&self) -> Pagination {
        Pagination::Cursor
    }

    fn rate_limit_hint(&self) -> RateLimitHint {
        RateLimitHint {
            cooldown: self.cooldown,
            min_interval: self.page_delay,
        }
    }

    fn secrets(&self) -> Vec<SecretRef> {
        vec![SecretRef::new("token", self.credential_name.clone())]
    }

    async fn fetch_page(
        &self,
        request: &PageRequest,
        credential: &Credential,
    ) -> Result<PageResult<AccessLog>, HarvestError> {
        let page = match request.cursor.as_deref() {
            Some(raw) => raw.parse::<u32>().map_err(|_| {
                HarvestError::Config(format!("slack: invalid page cursor '{}'", raw))
            })?,
            None => 1,
        };

        let form = [
            ("token", credential.get("token")?.to_string()),
            ("before", request.as_of.timestamp().to_string()),
            ("count", self.page_size.to_string()),
            ("page", page.to_string()),
        ];

        let resp = self
            .http
            .post(&self.endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| http::transport("slack team.accessLogs", e))?;
        let resp = http::check(resp, "slack team.accessLogs").await?;
        let parsed: AccessLogsResponse = http::read_json(resp, "slack team.accessLogs").await?;

        if !parsed.ok {
            if parsed.error == NO_RESULTS {
                return Ok(PageResult::empty());
            }
            return Err(HarvestError::Transport(format!(
                "slack team.accessLogs: {}",
                parsed.error
            )));
        }

        let current = if parsed.paging.page == 0 {
            page
        } else {
            parsed.paging.page
        };
        let next = (current < parsed.paging.pages).then(|| (current + 1).to_string());

        Ok(PageResult::last(parsed.logins)
            .with_next(next)
            .with_total_pages(parsed.paging.pages))
    }
}

pub struct SlackNormalizer;

impl Normalizer<AccessLog> for SlackNormalizer {
    fn normalize(&self, l: &AccessLog) -> Vec<NormalizedRecord> {
        vec![NormalizedRecord::builder(LOG_SOURCE, l.last_seen())
            .text("user_id", &l.user_id)
            .text("username", &l.username)
            .field("date_first", l.date_first)
            .field("date_last", l.date_last)
            .field("count", l.count)
            .text("ip", &l.ip)
            .text("user_agent", &l.user_agent)
            .text("isp", &l.isp)
            .text("country", &l.country)
            .text("region", &l.region)
            .build()]
    }
}
