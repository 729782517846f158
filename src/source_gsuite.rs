//! Google Workspace (G Suite) login activity.
//!
//! Reads the Admin SDK Reports API
//! (`activity/users/all/applications/<application>`). The adapter follows
//! every `nextPageToken` itself and hands the driver one ascending page, so
//! from the driver's point of view each run is a single request.
//! Activities the API returns from before the requested start time are
//! dropped here and reported as adapter skips.
//!
//! # Credentials
//!
//! Two secrets, both JSON:
//!
//! | Secret (default name) | Content |
//! |-----------------------|---------|
//! | `gsuite-logs-token` | OAuth2 token: `access_token`, `refresh_token`, `expiry` |
//! | `gsuite-logs-config` | OAuth2 client: `installed` or `web` block with `client_id`, `client_secret`, `token_uri` |
//!
//! A token that expires within a minute is refreshed with the
//! `refresh_token` grant and written back to the token secret.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use audit_harvest_core::store::SecretStore;
use audit_harvest_core::{
    HarvestError, NormalizedRecord, PageOrder, PageRequest, PageResult, Pagination,
    RateLimitHint, Record,
};

use crate::adapter::{Normalizer, SourceAdapter};
use crate::config::GsuiteConfig;
use crate::credential::{Credential, SecretRef};
use crate::http;

pub const DEFAULT_BASE_URL: &str = "https://admin.googleapis.com";
pub const DEFAULT_TOKEN_SECRET: &str = "gsuite-logs-token";
pub const DEFAULT_CLIENT_CONFIG_SECRET: &str = "gsuite-logs-config";
pub const DEFAULT_CHECKPOINT_KEY: &str = "gsuite-logs/latest.txt";
pub const DEFAULT_APPLICATION: &str = "login";
pub const DEFAULT_MAX_RESULTS: u32 = 1000;

const LOG_SOURCE: &str = "gsuite";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
/// Refresh tokens that expire within this many seconds.
const EXPIRY_SKEW_SECS: i64 = 60;
/// Upper bound on followed `nextPageToken`s in one fetch.
const DEFAULT_MAX_PAGES: usize = 500;

// ═══════════════════════════════════════════════════════════════════════
// API types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Activities {
    #[serde(default)]
    items: Vec<Activity>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(default)]
    pub kind: String,
    pub id: ActivityId,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub actor: Actor,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub events: Vec<ActivityEvent>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityId {
    pub time: String,
    #[serde(default)]
    pub unique_qualifier: String,
    #[serde(default)]
    pub application_name: String,
    #[serde(default)]
    pub customer_id: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub profile_id: String,
    #[serde(default)]
    pub caller_type: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ActivityEvent {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub multi_value: Vec<String>,
    #[serde(default)]
    pub bool_value: Option<bool>,
    /// int64 values arrive as JSON strings.
    #[serde(default)]
    pub int_value: Option<Value>,
}

impl Parameter {
    fn values(&self) -> Vec<String> {
        if !self.multi_value.is_empty() {
            self.multi_value.clone()
        } else {
            self.value
                .iter()
                .filter(|v| !v.is_empty())
                .cloned()
                .collect()
        }
    }

    fn int(&self) -> Option<i64> {
        match &self.int_value {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }
}

/// An activity with its parsed event time.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginActivity {
    pub time: DateTime<Utc>,
    pub activity: Activity,
}

impl Record for LoginActivity {
    fn timestamp(&self) -> DateTime<Utc> {
        self.time
    }

    fn dedup_key(&self) -> Option<String> {
        Some(format!(
            "{}|{}",
            self.activity.id.unique_qualifier, self.activity.id.time
        ))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// OAuth2
// ═══════════════════════════════════════════════════════════════════════

/// Stored token, compatible with the common `oauth2` token JSON layout.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct OauthToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClientSecrets {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientConfigFile {
    #[serde(default)]
    installed: Option<ClientSecrets>,
    #[serde(default)]
    web: Option<ClientSecrets>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

fn parse_token(raw: &str) -> Result<OauthToken, HarvestError> {
    serde_json::from_str(raw)
        .map_err(|e| HarvestError::Config(format!("gsuite token secret is not valid JSON: {}", e)))
}

fn parse_client(raw: &str) -> Result<ClientSecrets, HarvestError> {
    let file: ClientConfigFile = serde_json::from_str(raw).map_err(|e| {
        HarvestError::Config(format!("gsuite client config is not valid JSON: {}", e))
    })?;
    file.installed.or(file.web).ok_or_else(|| {
        HarvestError::Config("gsuite client config has neither 'installed' nor 'web'".into())
    })
}

fn token_is_stale(token: &OauthToken, now: DateTime<Utc>) -> bool {
    match token.expiry {
        // The zero time some tools write means "no expiry recorded".
        Some(expiry) if expiry.timestamp() > 0 => {
            expiry - chrono::Duration::seconds(EXPIRY_SKEW_SECS) <= now
        }
        _ => true,
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Adapter
// ═══════════════════════════════════════════════════════════════════════

pub struct GsuiteAdapter {
    http: reqwest::Client,
    activities_url: String,
    token_uri_override: Option<String>,
    token_secret: String,
    client_config_secret: String,
    max_results: u32,
    max_pages: usize,
    cooldown: Duration,
}

impl GsuiteAdapter {
    pub fn new(http: reqwest::Client, config: &GsuiteConfig) -> Self {
        let common = &config.common;
        let base = common.base_url_or(DEFAULT_BASE_URL);
        let application = config
            .application
            .clone()
            .unwrap_or_else(|| DEFAULT_APPLICATION.to_string());
        Self {
            http,
            activities_url: format!(
                "{}/admin/reports/v1/activity/users/all/applications/{}",
                base, application
            ),
            // A base URL override (proxy or test server) also serves the token endpoint.
            token_uri_override: common.base_url.as_ref().map(|_| format!("{}/token", base)),
            token_secret: common.credential_name_or(DEFAULT_TOKEN_SECRET),
            client_config_secret: config
                .client_config_name
                .clone()
                .unwrap_or_else(|| DEFAULT_CLIENT_CONFIG_SECRET.to_string()),
            max_results: config.max_results.unwrap_or(DEFAULT_MAX_RESULTS),
            max_pages: config.max_pages.unwrap_or(DEFAULT_MAX_PAGES).max(1),
            cooldown: common.cooldown_or(30),
        }
    }

    async fn refresh(&self, token: &OauthToken, client: &ClientSecrets) -> Result<OauthToken, HarvestError> {
        let refresh_token = token.refresh_token.as_deref().ok_or_else(|| {
            HarvestError::Config("gsuite token is stale and has no refresh_token".into())
        })?;
        let token_uri = self
            .token_uri_override
            .clone()
            .or_else(|| client.token_uri.clone())
            .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string());

        let resp = self
            .http
            .post(&token_uri)
            .form(&[
                ("client_id", client.client_id.as_str()),
                ("client_secret", client.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| http::transport("gsuite token refresh", e))?;
        let resp = http::check(resp, "gsuite token refresh").await?;
        let fresh: TokenResponse = http::read_json(resp, "gsuite token refresh").await?;

        Ok(OauthToken {
            access_token: fresh.access_token,
            token_type: fresh.token_type.or_else(|| token.token_type.clone()),
            refresh_token: fresh.refresh_token.or_else(|| token.refresh_token.clone()),
            expiry: fresh
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        })
    }

    async fn list_page(
        &self,
        access_token: &str,
        start: &str,
        page_token: Option<&str>,
    ) -> Result<Activities, HarvestError> {
        let max_results = self.max_results.to_string();
        let mut query: Vec<(&str, &str)> =
            vec![("startTime", start), ("maxResults", max_results.as_str())];
        if let Some(t) = page_token {
            query.push(("pageToken", t));
        }

        let resp = self
            .http
            .get(&self.activities_url)
            .bearer_auth(access_token)
            .query(&query)
            .send()
            .await
            .map_err(|e| http::transport("gsuite activities.list", e))?;
        let resp = http::check(resp, "gsuite activities.list").await?;
        http::read_json(resp, "gsuite activities.list").await
    }
}

#[async_trait]
impl SourceAdapter for GsuiteAdapter {
    type Record = LoginActivity;

    fn name(&self) -> &str {
        LOG_SOURCE
    }

    fn description(&self) -> &str {
        "Google Workspace login activity (Admin SDK Reports API)"
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
        vec![
            SecretRef::new("token", self.token_secret.clone()),
            SecretRef::new("client_config", self.client_config_secret.clone()),
        ]
    }

    async fn refresh_if_stale(
        &self,
        credential: &Credential,
        secrets: &dyn SecretStore,
    ) -> Result<Option<Credential>, HarvestError> {
        let token = parse_token(credential.get("token")?)?;
        if !token_is_stale(&token, Utc::now()) {
            return Ok(None);
        }

        let client = parse_client(credential.get("client_config")?)?;
        let fresh = self.refresh(&token, &client).await?;
        if fresh.access_token == token.access_token {
            return Ok(None);
        }

        let serialized = serde_json::to_string(&fresh)
            .map_err(|e| HarvestError::Secret(format!("failed to encode token: {}", e)))?;
        // The provider may rotate the refresh token; losing it strands the next run.
        secrets
            .put_secret(&self.token_secret, &serialized)
            .await
            .map_err(|e| {
                HarvestError::Secret(format!("failed to persist refreshed gsuite token: {}", e))
            })?;
        info!(secret = %self.token_secret, "saved refreshed gsuite token");

        Ok(Some(
            credential
                .clone()
                .with("token", serialized)
                .with_expiry(fresh.expiry),
        ))
    }

    async fn fetch_page(
        &self,
        request: &PageRequest,
        credential: &Credential,
    ) -> Result<PageResult<LoginActivity>, HarvestError> {
        let token = parse_token(credential.get("token")?)?;
        let start = request.watermark.as_timestamp().ok_or_else(|| {
            HarvestError::Config("gsuite requires a timestamp watermark".into())
        })?;
        let start_param = start.to_rfc3339_opts(SecondsFormat::Secs, true);

        // Pages arrive newest first, so a partial drain would skip the oldest
        // activities once the watermark moves past them.
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0;
        loop {
            if pages == self.max_pages {
                return Err(HarvestError::Transport(format!(
                    "gsuite reports still paging after {} pages, refusing a partial result",
                    self.max_pages
                )));
            }
            let page = self
                .list_page(&token.access_token, &start_param, page_token.as_deref())
                .await?;
            pages += 1;
            items.extend(page.items);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        let (records, skipped) = collate(items, start);
        info!(records = records.len(), skipped, "gsuite activities collected");
        Ok(PageResult::last(records).with_skipped(skipped))
    }
}

/// Parse times, drop activities before `start`, sort ascending.
fn collate(items: Vec<Activity>, start: DateTime<Utc>) -> (Vec<LoginActivity>, usize) {
    let mut skipped = 0;
    let mut records = Vec::with_capacity(items.len());
    for activity in items {
        let time = match DateTime::parse_from_rfc3339(&activity.id.time) {
            Ok(t) => t.with_timezone(&Utc),
            Err(_) => {
                warn!(time = %activity.id.time, "unparseable gsuite activity time");
                skipped += 1;
                continue;
            }
        };
        if time < start {
            skipped += 1;
            continue;
        }
        records.push(LoginActivity { time, activity });
    }
    records.sort_by_key(|r| r.time);
    (records, skipped)
}

// ═══════════════════════════════════════════════════════════════════════
// Normalizer
// ═══════════════════════════════════════════════════════════════════════

/// One record per `events[]` entry; all share the activity's actor fields.
pub struct GsuiteNormalizer;

impl GsuiteNormalizer {
    fn common(&self, r: &LoginActivity) -> audit_harvest_core::RecordBuilder {
        let a = &r.activity;
        NormalizedRecord::builder(LOG_SOURCE, r.time)
            .text("username", &a.actor.email)
            .text("profile_id", &a.actor.profile_id)
            .text("kind", &a.kind)
            .text("src_ip", &a.ip_address)
            .text("e_tag", &a.etag)
            .text("log_type", &a.id.application_name)
            .text("unique_qualifier", &a.id.unique_qualifier)
    }
}

impl Normalizer<LoginActivity> for GsuiteNormalizer {
    fn normalize(&self, r: &LoginActivity) -> Vec<NormalizedRecord> {
        if r.activity.events.is_empty() {
            return vec![self.common(r).build()];
        }

        r.activity
            .events
            .iter()
            .map(|event| {
                let mut b = self
                    .common(r)
                    .text("event_name", &event.name)
                    .text("event_type", &event.kind);
                for p in &event.parameters {
                    b = match p.name.as_str() {
                        "login_type" => b.maybe_text("login_type", p.value.as_deref()),
                        "login_challenge_method" => b.list("login_challenge_method", p.values()),
                        "login_failure_type" => b.list("login_failure_type", p.values()),
                        "login_challenge_status" => {
                            b.maybe_text("login_challenge_status", p.value.as_deref())
                        }
                        "affected_email_address" => {
                            b.maybe_text("affected_email_address", p.value.as_deref())
                        }
                        "is_suspicious" => b.flag("is_suspicious", p.bool_value.unwrap_or(false)),
                        "is_second_factor" => {
                            b.flag("is_second_factor", p.bool_value.unwrap_or(false))
                        }
                        "login_timestamp" => b.maybe("login_time_stamp", p.int()),
                        _ => b,
                    };
                }
                b.build()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const PAGE: &str = r#"{
      "kind": "admin#reports#activities",
      "items": [
        {"kind": "admin#reports#activity",
         "id": {"time": "2024-01-01T00:00:10.000Z", "uniqueQualifier": "-42", "applicationName": "login", "customerId": "C01"},
         "etag": "\"abc\"",
         "actor": {"email": "alice@example.com", "profileId": "1001"},
         "ipAddress": "198.51.100.4",
         "events": [
           {"type": "login", "name": "login_failure", "parameters": [
             {"name": "login_type", "value": "google_password"},
             {"name": "login_failure_type", "value": "login_failure_invalid_password"},
             {"name": "login_challenge_method", "multiValue": ["password", "totp"]},
             {"name": "is_suspicious", "boolValue": true},
             {"name": "login_timestamp", "intValue": "1704067210000000"}
           ]},
           {"type": "login", "name": "login_verification", "parameters": [
             {"name": "is_second_factor", "boolValue": false}
           ]}
         ]},
        {"kind": "admin#reports#activity",
         "id": {"time": "2023-12-31T23:59:59Z", "uniqueQualifier": "-41", "applicationName": "login"},
         "actor": {"email": "bob@example.com"},
         "events": []}
      ]
    }"#;

    #[test]
    fn collate_sorts_and_counts_pre_window_items() {
        let page: Activities = serde_json::from_str(PAGE).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let (records, skipped) = collate(page.items, start);
        assert_eq!(records.len(), 1);
        assert_eq!(skipped, 1);
        assert_eq!(records[0].time, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap());
    }

    #[test]
    fn fans_out_per_event_sharing_actor_fields() {
        let page: Activities = serde_json::from_str(PAGE).unwrap();
        let (records, _) = collate(page.items, Utc.timestamp_opt(0, 0).unwrap());
        let alice = records
            .iter()
            .find(|r| r.activity.actor.email == "alice@example.com")
            .unwrap();

        let out = GsuiteNormalizer.normalize(alice);
        assert_eq!(out.len(), 2);
        for rec in &out {
            assert_eq!(rec.get_str("username"), Some("alice@example.com"));
            assert_eq!(rec.get_str("src_ip"), Some("198.51.100.4"));
            assert_eq!(rec.get_str("log_type"), Some("login"));
            assert_eq!(rec.event_time(), "2024-01-01T00:00:10Z");
        }
        assert_eq!(out[0].get_str("event_name"), Some("login_failure"));
        assert_eq!(out[0].get("is_suspicious"), Some(&Value::Bool(true)));
        assert_eq!(
            out[0].get("login_challenge_method"),
            Some(&serde_json::json!(["password", "totp"]))
        );
        assert_eq!(
            out[0].get("login_failure_type"),
            Some(&serde_json::json!(["login_failure_invalid_password"]))
        );
        assert_eq!(
            out[0].get("login_time_stamp"),
            Some(&serde_json::json!(1704067210000000i64))
        );
        assert_eq!(out[1].get_str("event_name"), Some("login_verification"));
        assert!(out[1].get("is_second_factor").is_none());
        assert!(out[1].get("login_type").is_none());

        let bob = records
            .iter()
            .find(|r| r.activity.actor.email == "bob@example.com")
            .unwrap();
        assert_eq!(GsuiteNormalizer.normalize(bob).len(), 1);
    }

    #[test]
    fn token_staleness() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut token = OauthToken {
            access_token: "a".into(),
            token_type: Some("Bearer".into()),
            refresh_token: Some("r".into()),
            expiry: Some(now + chrono::Duration::hours(1)),
        };
        assert!(!token_is_stale(&token, now));
        token.expiry = Some(now + chrono::Duration::seconds(30));
        assert!(token_is_stale(&token, now));
        token.expiry = None;
        assert!(token_is_stale(&token, now));
    }

    #[test]
    fn client_config_accepts_installed_or_web() {
        let installed = r#"{"installed": {"client_id": "id", "client_secret": "s", "token_uri": "https://t"}}"#;
        assert_eq!(parse_client(installed).unwrap().client_id, "id");
        let web = r#"{"web": {"client_id": "w", "client_secret": "s"}}"#;
        assert_eq!(parse_client(web).unwrap().client_id, "w");
        assert!(matches!(parse_client("{}"), Err(HarvestError::Config(_))));
    }

    #[test]
    fn reads_go_style_token_json() {
        let raw = r#"{"access_token":"ya29","token_type":"Bearer","refresh_token":"1//r","expiry":"2024-01-01T12:00:00.123456789-07:00"}"#;
        let token = parse_token(raw).unwrap();
        assert_eq!(token.access_token, "ya29");
        assert_eq!(
            token.expiry.unwrap().timestamp(),
            Utc.with_ymd_and_hms(2024, 1, 1, 19, 0, 0).unwrap().timestamp()
        );
    }
}
