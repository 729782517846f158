//! Cloudflare firewall events.
//!
//! Queries the GraphQL Analytics API (`firewallEventsAdaptive`) one time
//! window at a time. The API caps a query at one day and returns at most
//! 100 events per request, oldest first; both limits are declared to the
//! driver through [`Pagination::Window`].
//!
//! # Configuration
//!
//! ```toml
//! [sources.cloudflare]
//! credential_name = "/cloudflare"     # reads /cloudflare/email, /key, /zone
//! checkpoint_key = "/cloudflare/last"
//! window_cap_seconds = 86399
//! safety_margin_secs = 60
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use audit_harvest_core::{
    HarvestError, NormalizedRecord, PageOrder, PageRequest, PageResult, Pagination,
    RateLimitHint, Record,
};

use crate::adapter::{Normalizer, SourceAdapter};
use crate::config::CloudflareConfig;
use crate::credential::{Credential, SecretRef};
use crate::http;

pub const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";
pub const DEFAULT_CREDENTIAL_NAME: &str = "/cloudflare";
pub const DEFAULT_CHECKPOINT_KEY: &str = "/cloudflare/last";
/// One second under the API's 24h limit.
pub const DEFAULT_WINDOW_CAP_SECS: u64 = 86_399;
pub const DEFAULT_SAFETY_MARGIN_SECS: u64 = 60;
pub const RECORD_CAP: usize = 100;
/// Largest `limit` the firewall events dataset accepts.
pub const MAX_RECORD_CAP: usize = 10_000;

const LOG_SOURCE: &str = "cloudflare";
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

const QUERY: &str = r#"query ListFirewallEvents($zoneTag: string, $filter: FirewallEventsAdaptiveFilter_InputObject, $limit: uint64!) {
  viewer {
    zones(filter: { zoneTag: $zoneTag }) {
      firewallEventsAdaptive(
        filter: $filter
        limit: $limit
        orderBy: [datetime_ASC]
      ) {
        action
        clientASNDescription
        clientAsn
        clientCountryName
        clientIP
        clientRequestHTTPHost
        clientRequestHTTPMethodName
        clientRequestHTTPProtocol
        clientRequestPath
        clientRequestQuery
        datetime
        rayName
        ruleId
        source
        userAgent
      }
    }
  }
}"#;

/// One firewall event as returned by the API.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FirewallEvent {
    #[serde(default)]
    pub action: String,
    #[serde(rename = "clientASNDescription", default)]
    pub client_asn_description: String,
    #[serde(default)]
    pub client_asn: String,
    #[serde(default)]
    pub client_country_name: String,
    #[serde(rename = "clientIP", default)]
    pub client_ip: String,
    #[serde(rename = "clientRequestHTTPHost", default)]
    pub host: String,
    #[serde(rename = "clientRequestHTTPMethodName", default)]
    pub method: String,
    #[serde(rename = "clientRequestHTTPProtocol", default)]
    pub protocol: String,
    #[serde(rename = "clientRequestPath", default)]
    pub path: String,
    #[serde(rename = "clientRequestQuery", default)]
    pub query: String,
    pub datetime: DateTime<Utc>,
    #[serde(default)]
    pub ray_name: String,
    #[serde(default)]
    pub rule_id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub user_agent: String,
}

impl Record for FirewallEvent {
    fn timestamp(&self) -> DateTime<Utc> {
        self.datetime
    }

    fn dedup_key(&self) -> Option<String> {
        Some(format!(
            "{}|{}|{}|{}",
            self.ray_name, self.rule_id, self.action, self.source
        ))
    }
}

#[derive(Debug, Deserialize)]
struct GraphResponse {
    #[serde(default)]
    data: Option<GraphData>,
    #[serde(default)]
    errors: Option<Vec<GraphError>>,
}

#[derive(Debug, Deserialize)]
struct GraphData {
    viewer: Viewer,
}

#[derive(Debug, Deserialize)]
struct Viewer {
    #[serde(default)]
    zones: Option<Vec<Zone>>,
}

#[derive(Debug, Deserialize)]
struct Zone {
    #[serde(rename = "firewallEventsAdaptive", default)]
    events: Vec<FirewallEvent>,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    #[serde(default)]
    message: String,
}

// ═══════════════════════════════════════════════════════════════════════
// Adapter
// ═══════════════════════════════════════════════════════════════════════

pub struct CloudflareAdapter {
    http: reqwest::Client,
    endpoint: String,
    credential_name: String,
    window_cap: Duration,
    safety_margin: Duration,
    record_cap: usize,
    cooldown: Duration,
}

impl CloudflareAdapter {
    pub fn new(http: reqwest::Client, config: &CloudflareConfig) -> Self {
        let common = &config.common;
        Self {
            http,
            endpoint: format!("{}/graphql/", common.base_url_or(DEFAULT_BASE_URL)),
            credential_name: common
                .credential_name_or(DEFAULT_CREDENTIAL_NAME)
                .trim_end_matches('/')
                .to_string(),
            window_cap: Duration::from_secs(
                common.window_cap_seconds.unwrap_or(DEFAULT_WINDOW_CAP_SECS),
            ),
            safety_margin: Duration::from_secs(
                config
                    .safety_margin_secs
                    .unwrap_or(DEFAULT_SAFETY_MARGIN_SECS),
            ),
            record_cap: config
                .record_cap
                .unwrap_or(RECORD_CAP)
                .clamp(1, MAX_RECORD_CAP),
            cooldown: common.cooldown_or(30),
        }
    }
}

#[async_trait]
impl SourceAdapter for CloudflareAdapter {
    type Record = FirewallEvent;

    fn name(&self) -> &str {
        LOG_SOURCE
    }

    fn description(&self) -> &str {
        "Cloudflare firewall events (GraphQL, windowed)"
    }

    fn order(&self) -> PageOrder {
        PageOrder::Ascending
    }

    fn pagination(&self) -> Pagination {
        Pagination::Window {
            max_span: Some(self.window_cap),
            record_cap: self.record_cap,
            safety_margin: self.safety_margin,
        }
    }

    fn rate_limit_hint(&self) -> RateLimitHint {
        RateLimitHint {
            cooldown: self.cooldown,
            min_interval: Duration::ZERO,
        }
    }

    fn secrets(&self) -> Vec<SecretRef> {
        vec![
            SecretRef::new("email", format!("{}/email", self.credential_name)),
            SecretRef::new("key", format!("{}/key", self.credential_name)),
            SecretRef::new("zone", format!("{}/zone", self.credential_name)),
        ]
    }

    async fn fetch_page(
        &self,
        request: &PageRequest,
        credential: &Credential,
    ) -> Result<PageResult<FirewallEvent>, HarvestError> {
        let window = request.window.ok_or_else(|| {
            HarvestError::Config("cloudflare requires a query window".into())
        })?;

        let body = json!({
            "query": QUERY,
            "variables": {
                "zoneTag": credential.get("zone")?,
                // Must equal the driver's record cap or truncation goes unnoticed.
                "limit": self.record_cap,
                "filter": {
                    "datetime_geq": window.from.format(TIME_FORMAT).to_string(),
                    "datetime_leq": window.to.format(TIME_FORMAT).to_string(),
                }
            }
        });

        let resp = self
            .http
            .post(&self.endpoint)
            .header("X-Auth-Email", credential.get("email")?)
            .header("X-Auth-Key", credential.get("key")?)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::transport("cloudflare graphql", e))?;

        let resp = http::check(resp, "cloudflare graphql").await?;
        let parsed: GraphResponse = http::read_json(resp, "cloudflare graphql").await?;
        events_from_response(parsed)
    }
}

fn events_from_response(parsed: GraphResponse) -> Result<PageResult<FirewallEvent>, HarvestError> {
    let errors = parsed.errors.unwrap_or_default();
    let zones = parsed.data.and_then(|d| d.viewer.zones);

    match zones {
        Some(zones) => {
            let events = zones.into_iter().next().map(|z| z.events).unwrap_or_default();
            Ok(PageResult::last(events))
        }
        None if !errors.is_empty() => {
            let messages: Vec<String> = errors.into_iter().map(|e| e.message).collect();
            Err(HarvestError::Transport(format!(
                "cloudflare graphql: {}",
                messages.join("; ")
            )))
        }
        None => Ok(PageResult::empty()),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Normalizer
// ═══════════════════════════════════════════════════════════════════════

pub struct CloudflareNormalizer;

impl Normalizer<FirewallEvent> for CloudflareNormalizer {
    fn normalize(&self, e: &FirewallEvent) -> Vec<NormalizedRecord> {
        vec![NormalizedRecord::builder(LOG_SOURCE, e.datetime)
            .text("action", &e.action)
            .text("client_asn", &e.client_asn)
            .text("client_asn_description", &e.client_asn_description)
            .text("client_country", &e.client_country_name)
            .text("client_ip", &e.client_ip)
            .text("host", &e.host)
            .text("method", &e.method)
            .text("protocol", &e.protocol)
            .text("path", &e.path)
            .text("query", &e.query)
            .text("ray_name", &e.ray_name)
            .text("rule_id", &e.rule_id)
            .text("source", &e.source)
            .text("user_agent", &e.user_agent)
            .build()]
    }
}
