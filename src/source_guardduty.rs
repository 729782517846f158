//! AWS GuardDuty findings.
//!
//! Polls the GuardDuty REST API with SigV4-signed requests: `ListFindings`
//! filtered on `updatedAt >= watermark` and sorted ascending, then
//! `GetFindings` for each page of IDs. `nextToken` is the page cursor.
//!
//! Findings are shaped through [`FindingAction`], one variant per GuardDuty
//! action type. A port-probe finding fans out into one record per entry of
//! `portProbeDetails`, all sharing the finding's common fields.
//!
//! The same normalizer serves `harvest normalize guardduty`, which reads a
//! single EventBridge event (`{"detail": <finding>}`) instead of polling.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use audit_harvest_core::{
    HarvestError, NormalizedRecord, PageOrder, PageRequest, PageResult, Pagination,
    RateLimitHint, Record, RecordBuilder,
};

use crate::adapter::{Normalizer, SourceAdapter};
use crate::aws::{AwsClient, AwsCredentials, Endpoint};
use crate::config::GuarddutyConfig;
use crate::credential::{Credential, SecretRef};
use crate::http;

pub const DEFAULT_CHECKPOINT_KEY: &str = "guardduty-timestamp";
pub const DEFAULT_PAGE_SIZE: u32 = 50;

const LOG_SOURCE: &str = "guardduty";

// ═══════════════════════════════════════════════════════════════════════
// Finding model
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Finding {
    pub account_id: String,
    pub arn: String,
    pub created_at: String,
    pub description: String,
    pub id: String,
    pub partition: String,
    pub region: String,
    pub severity: f64,
    pub title: String,
    #[serde(rename = "type")]
    pub finding_type: String,
    pub updated_at: String,
    pub resource: Resource,
    pub service: Service,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Resource {
    pub resource_type: String,
    pub instance_details: Option<InstanceDetails>,
    pub access_key_details: Option<AccessKeyDetails>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceDetails {
    pub availability_zone: String,
    pub image_description: String,
    pub image_id: String,
    pub instance_id: String,
    pub instance_state: String,
    pub instance_type: String,
    pub launch_time: String,
    pub network_interfaces: Vec<NetworkInterface>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkInterface {
    pub private_ip_address: String,
    pub private_ip_addresses: Vec<PrivateIp>,
    pub public_ip: String,
    pub subnet_id: String,
    pub vpc_id: String,
    pub security_groups: Vec<SecurityGroup>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PrivateIp {
    pub private_ip_address: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityGroup {
    pub group_id: String,
    pub group_name: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessKeyDetails {
    pub access_key_id: String,
    pub principal_id: String,
    pub user_name: String,
    pub user_type: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Service {
    pub action: RawAction,
    pub archived: bool,
    pub count: i64,
    pub detector_id: String,
    pub event_first_seen: String,
    pub event_last_seen: String,
    pub evidence: Option<Evidence>,
    pub resource_role: String,
    pub service_name: String,
    pub user_feedback: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Evidence {
    pub threat_intelligence_details: Vec<ThreatIntel>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreatIntel {
    pub threat_list_name: String,
    pub threat_names: Vec<String>,
}

/// The action block as GuardDuty sends it: a discriminant plus optional
/// payloads, at most one of which is meaningful.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RawAction {
    pub action_type: String,
    pub aws_api_call_action: Option<AwsApiCallAction>,
    pub dns_request_action: Option<DnsRequestAction>,
    pub network_connection_action: Option<NetworkConnectionAction>,
    pub port_probe_action: Option<PortProbeAction>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AwsApiCallAction {
    pub api: String,
    pub caller_type: String,
    pub domain_details: Option<DomainDetails>,
    pub remote_ip_details: Option<RemoteIpDetails>,
    pub service_name: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct DomainDetails {
    pub domain: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct DnsRequestAction {
    pub domain: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConnectionAction {
    pub blocked: bool,
    pub connection_direction: String,
    pub protocol: String,
    pub local_port_details: Option<PortDetails>,
    pub remote_ip_details: Option<RemoteIpDetails>,
    pub remote_port_details: Option<PortDetails>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PortProbeAction {
    pub blocked: bool,
    pub port_probe_details: Vec<PortProbeDetail>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PortProbeDetail {
    pub local_port_details: Option<PortDetails>,
    pub remote_ip_details: Option<RemoteIpDetails>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PortDetails {
    pub port: i64,
    pub port_name: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteIpDetails {
    pub city: Option<CityName>,
    pub country: Option<CountryName>,
    pub geo_location: Option<GeoLocation>,
    pub ip_address_v4: String,
    pub organization: Option<Organization>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CityName {
    pub city_name: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CountryName {
    pub country_name: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeoLocation {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Organization {
    pub asn: String,
    pub isp: String,
    pub org: String,
}

/// What a finding is about, one variant per GuardDuty action type.
#[derive(Debug, Clone, PartialEq)]
pub enum FindingAction {
    PortProbe(PortProbeAction),
    NetworkConnection(NetworkConnectionAction),
    DnsRequest(DnsRequestAction),
    AwsApiCall(AwsApiCallAction),
    /// Unrecognised type, or a known type whose payload is missing.
    Unknown(String),
}

impl From<&RawAction> for FindingAction {
    fn from(raw: &RawAction) -> Self {
        let payload = match raw.action_type.as_str() {
            "PORT_PROBE" => raw.port_probe_action.clone().map(FindingAction::PortProbe),
            "NETWORK_CONNECTION" => raw
                .network_connection_action
                .clone()
                .map(FindingAction::NetworkConnection),
            "DNS_REQUEST" => raw.dns_request_action.clone().map(FindingAction::DnsRequest),
            "AWS_API_CALL" => raw.aws_api_call_action.clone().map(FindingAction::AwsApiCall),
            _ => None,
        };
        payload.unwrap_or_else(|| FindingAction::Unknown(raw.action_type.clone()))
    }
}

/// A finding with its parsed `updatedAt`.
#[derive(Debug, Clone, PartialEq)]
pub struct GuarddutyFinding {
    pub updated_at: DateTime<Utc>,
    pub finding: Finding,
}

impl GuarddutyFinding {
    pub fn from_finding(finding: Finding) -> Result<Self, HarvestError> {
        let updated_at = DateTime::parse_from_rfc3339(&finding.updated_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                HarvestError::parse(
                    format!("finding {} has invalid updatedAt: {}", finding.id, e),
                    finding.updated_at.clone(),
                )
            })?;
        Ok(Self {
            updated_at,
            finding,
        })
    }
}

impl Record for GuarddutyFinding {
    fn timestamp(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn dedup_key(&self) -> Option<String> {
        Some(format!("{}|{}", self.finding.id, self.finding.updated_at))
    }
}

/// Parse an EventBridge/CloudWatch event carrying a finding in `detail`,
/// or a bare finding.
pub fn parse_event(raw: &str) -> Result<GuarddutyFinding, HarvestError> {
    let value: Value = http::decode_json(raw, "guardduty event")?;
    let finding_value = match value.get("detail") {
        Some(detail) => detail.clone(),
        None => value,
    };
    let finding: Finding = serde_json::from_value(finding_value)
        .map_err(|e| HarvestError::parse(format!("guardduty event: {}", e), raw))?;
    GuarddutyFinding::from_finding(finding)
}

/// Normalize one EventBridge event without polling the API.
pub fn normalize_event(raw: &str) -> Result<Vec<NormalizedRecord>, HarvestError> {
    Ok(GuarddutyNormalizer.normalize(&parse_event(raw)?))
}

// ═══════════════════════════════════════════════════════════════════════
// Adapter
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListFindingsResponse {
    #[serde(default)]
    finding_ids: Vec<String>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetFindingsResponse {
    #[serde(default)]
    findings: Vec<Finding>,
}

pub struct GuarddutyAdapter {
    client: AwsClient,
    detector_id: String,
    page_size: u32,
    cooldown: Duration,
}

impl GuarddutyAdapter {
    pub fn new(
        http: reqwest::Client,
        creds: AwsCredentials,
        config: &GuarddutyConfig,
    ) -> Self {
        let region = config
            .region
            .clone()
            .or_else(|| std::env::var("AWS_REGION").ok())
            .unwrap_or_else(|| "us-east-1".to_string());
        let endpoint = Endpoint::resolve(
            config.common.base_url.as_deref(),
            format!("guardduty.{}.amazonaws.com", region),
        );
        Self {
            client: AwsClient::new(http, creds, "guardduty", region, endpoint),
            detector_id: config.detector_id.clone(),
            page_size: config.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 50),
            cooldown: config.common.cooldown_or(5),
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: Value,
        what: &str,
    ) -> Result<T, HarvestError> {
        let resp = self
            .client
            .send(
                Method::POST,
                path,
                &[],
                &[("content-type", "application/json")],
                body.to_string().into_bytes(),
            )
            .await?;
        let resp = http::check(resp, what).await?;
        http::read_json(resp, what).await
    }
}

#[async_trait]
impl SourceAdapter for GuarddutyAdapter {
    type Record = GuarddutyFinding;

    fn name(&self) -> &str {
        LOG_SOURCE
    }

    fn description(&self) -> &str {
        "AWS GuardDuty findings (ListFindings/GetFindings)"
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
        // Signed with the process's AWS credentials.
        Vec::new()
    }

    async fn fetch_page(
        &self,
        request: &PageRequest,
        _credential: &Credential,
    ) -> Result<PageResult<GuarddutyFinding>, HarvestError> {
        let since = request.watermark.as_timestamp().ok_or_else(|| {
            HarvestError::Config("guardduty requires a timestamp watermark".into())
        })?;

        let mut list_body = json!({
            "findingCriteria": {
                "criterion": {
                    "updatedAt": { "greaterThanOrEqual": since.timestamp_millis() }
                }
            },
            "sortCriteria": { "attributeName": "updatedAt", "orderBy": "ASC" },
            "maxResults": self.page_size,
        });
        if let Some(token) = &request.cursor {
            list_body["nextToken"] = Value::String(token.clone());
        }

        let listed: ListFindingsResponse = self
            .post(
                &format!("/detector/{}/findings", self.detector_id),
                list_body,
                "guardduty ListFindings",
            )
            .await?;
        let next = listed.next_token.filter(|t| !t.is_empty());

        if listed.finding_ids.is_empty() {
            return Ok(PageResult::empty().with_next(next));
        }

        let got: GetFindingsResponse = self
            .post(
                &format!("/detector/{}/findings/get", self.detector_id),
                json!({
                    "findingIds": listed.finding_ids,
                    "sortCriteria": { "attributeName": "updatedAt", "orderBy": "ASC" },
                }),
                "guardduty GetFindings",
            )
            .await?;

        let mut records = got
            .findings
            .into_iter()
            .map(GuarddutyFinding::from_finding)
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|r| r.updated_at);

        Ok(PageResult::last(records).with_next(next))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Normalizer
// ═══════════════════════════════════════════════════════════════════════

pub struct GuarddutyNormalizer;

impl Normalizer<GuarddutyFinding> for GuarddutyNormalizer {
    fn normalize(&self, r: &GuarddutyFinding) -> Vec<NormalizedRecord> {
        let f = &r.finding;
        let common = || common_fields(r);

        match FindingAction::from(&f.service.action) {
            FindingAction::PortProbe(probe) => {
                if probe.port_probe_details.is_empty() {
                    return vec![common().flag("port_probe_blocked", probe.blocked).build()];
                }
                probe
                    .port_probe_details
                    .iter()
                    .map(|detail| {
                        let b = common().flag("port_probe_blocked", probe.blocked);
                        let b = local_port(b, detail.local_port_details.as_ref());
                        remote_ip(b, detail.remote_ip_details.as_ref()).build()
                    })
                    .collect()
            }
            FindingAction::NetworkConnection(conn) => {
                let b = common()
                    .flag("connection_blocked", conn.blocked)
                    .text("connection_direction", &conn.connection_direction)
                    .text("connection_protocol", &conn.protocol);
                let b = local_port(b, conn.local_port_details.as_ref());
                let b = match conn.remote_port_details.as_ref() {
                    Some(p) => b
                        .maybe("src_port", nonzero(p.port))
                        .text("src_port_name", &p.port_name),
                    None => b,
                };
                vec![remote_ip(b, conn.remote_ip_details.as_ref()).build()]
            }
            FindingAction::DnsRequest(dns) => {
                vec![common().text("dns_domain", &dns.domain).build()]
            }
            FindingAction::AwsApiCall(call) => {
                let b = common()
                    .text("api", &call.api)
                    .text("caller_type", &call.caller_type)
                    .maybe_text(
                        "domain",
                        call.domain_details.as_ref().map(|d| d.domain.as_str()),
                    )
                    .text("api_service_name", &call.service_name);
                vec![remote_ip(b, call.remote_ip_details.as_ref()).build()]
            }
            FindingAction::Unknown(_) => vec![common().build()],
        }
    }
}

fn nonzero(n: i64) -> Option<i64> {
    (n != 0).then_some(n)
}

fn common_fields(r: &GuarddutyFinding) -> RecordBuilder {
    let f = &r.finding;
    let s = &f.service;

    let evidence: Vec<String> = s
        .evidence
        .iter()
        .flat_map(|e| e.threat_intelligence_details.iter())
        .map(|ti| format!("{}: {}", ti.threat_list_name, ti.threat_names.join(",")))
        .collect();

    let mut b = NormalizedRecord::builder(LOG_SOURCE, r.updated_at)
        .text("account_id", &f.account_id)
        .text("arn", &f.arn)
        .text("created_at", &f.created_at)
        .text("description", &f.description)
        .text("id", &f.id)
        .text("partition", &f.partition)
        .text("region", &f.region)
        .field("severity", f.severity)
        .text("title", &f.title)
        .text("event_type", &f.finding_type)
        .text("updated_at", &f.updated_at)
        .text("resource_type", &f.resource.resource_type)
        .flag("archived", s.archived)
        .text("detector_id", &s.detector_id)
        .field("count", s.count)
        .text("event_first_seen", &s.event_first_seen)
        .text("event_last_seen", &s.event_last_seen)
        .text("resource_role", &s.resource_role)
        .text("service_name", &s.service_name)
        .text("user_feedback", &s.user_feedback)
        .list("evidence", evidence)
        .text("action_type", &s.action.action_type);

    if let Some(i) = &f.resource.instance_details {
        b = instance(b, i);
    }
    if let Some(k) = &f.resource.access_key_details {
        b = b
            .text("access_key_id", &k.access_key_id)
            .text("principal_id", &k.principal_id)
            .text("username", &k.user_name)
            .text("user_type", &k.user_type);
    }
    b
}

fn instance(b: RecordBuilder, i: &InstanceDetails) -> RecordBuilder {
    let mut private = BTreeSet::new();
    let mut public = BTreeSet::new();
    let mut subnets = BTreeSet::new();
    let mut groups = Map::new();
    let mut vpc = String::new();

    for nic in &i.network_interfaces {
        private.insert(nic.private_ip_address.clone());
        for ip in &nic.private_ip_addresses {
            private.insert(ip.private_ip_address.clone());
        }
        public.insert(nic.public_ip.clone());
        subnets.insert(nic.subnet_id.clone());
        if !nic.vpc_id.is_empty() {
            vpc = nic.vpc_id.clone();
        }
        for sg in &nic.security_groups {
            groups.insert(sg.group_id.clone(), Value::String(sg.group_name.clone()));
        }
    }

    let tags: BTreeMap<&str, &str> = i
        .tags
        .iter()
        .map(|t| (t.key.as_str(), t.value.as_str()))
        .collect();
    let tags: Map<String, Value> = tags
        .into_iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect();

    let non_empty = |set: BTreeSet<String>| -> Vec<String> {
        set.into_iter().filter(|s| !s.is_empty()).collect()
    };

    b.text("instance_az", &i.availability_zone)
        .text("instance_desc", &i.image_description)
        .text("instance_image_id", &i.image_id)
        .text("instance_id", &i.instance_id)
        .text("instance_state", &i.instance_state)
        .text("instance_type", &i.instance_type)
        .text("instance_launch_time", &i.launch_time)
        .list("instance_private_ip", non_empty(private))
        .list("instance_public_ip", non_empty(public))
        .list("instance_subnet", non_empty(subnets))
        .text("instance_vpc", &vpc)
        .map("instance_sg", groups)
        .map("instance_tags", tags)
}

/// The local port is published both as `dest_port*` and as plain `port*`.
fn local_port(b: RecordBuilder, p: Option<&PortDetails>) -> RecordBuilder {
    match p {
        Some(p) => b
            .maybe("dest_port", nonzero(p.port))
            .text("dest_port_name", &p.port_name)
            .maybe("port", nonzero(p.port))
            .text("port_name", &p.port_name),
        None => b,
    }
}

fn remote_ip(b: RecordBuilder, r: Option<&RemoteIpDetails>) -> RecordBuilder {
    let Some(r) = r else {
        return b;
    };
    let mut b = b
        .text("src_ip", &r.ip_address_v4)
        .maybe_text("src_ip_city", r.city.as_ref().map(|c| c.city_name.as_str()))
        .maybe_text(
            "src_ip_country",
            r.country.as_ref().map(|c| c.country_name.as_str()),
        );
    if let Some(geo) = &r.geo_location {
        b = b.field("src_ip_lat", geo.lat).field("src_ip_long", geo.lon);
    }
    if let Some(org) = &r.organization {
        b = b
            .text("src_ip_org_asn", &org.asn)
            .text("src_ip_isp", &org.isp)
            .text("src_ip_org", &org.org);
    }
    b
}
