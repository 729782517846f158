//! Provider adapters against local mock servers.
//!
//! Each test starts an axum router on a free port, points the adapter's
//! `base_url` at it and runs the real driver into a `VecSink`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Form, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use audit_harvest::aws::AwsCredentials;
use audit_harvest::config::{
    CloudflareConfig, GsuiteConfig, GuarddutyConfig, LastpassConfig, SlackConfig, SourceCommon,
};
use audit_harvest::driver::{self, HarvestContext};
use audit_harvest::sink::VecSink;
use audit_harvest::source_cloudflare::{CloudflareAdapter, CloudflareNormalizer};
use audit_harvest::source_gsuite::{GsuiteAdapter, GsuiteNormalizer};
use audit_harvest::source_guardduty::{GuarddutyAdapter, GuarddutyNormalizer};
use audit_harvest::source_lastpass::{LastpassAdapter, LastpassNormalizer};
use audit_harvest::source_slack::{SlackAdapter, SlackNormalizer};
use audit_harvest_core::store::memory::InMemoryStore;
use audit_harvest_core::store::SecretStore;
use audit_harvest_core::HarvestError;

/// 2024-01-15T17:00:00Z (10:00 in Denver).
const W: i64 = 1_705_338_000;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn rfc3339(secs: i64) -> String {
    at(secs).format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn common(base_url: &str) -> SourceCommon {
    SourceCommon {
        base_url: Some(base_url.to_string()),
        rate_limit_cooldown_secs: Some(0),
        ..Default::default()
    }
}

fn http() -> reqwest::Client {
    reqwest::Client::new()
}

// ═══════════════════════════════════════════════════════════════════════
// Cloudflare
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn cloudflare_window_query() {
    let seen: Arc<Mutex<Vec<(HeaderMap, Value)>>> = Arc::default();
    let captured = seen.clone();
    let router = Router::new().route(
        "/graphql/",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let captured = captured.clone();
            async move {
                captured.lock().unwrap().push((headers, body));
                Json(json!({
                    "data": {"viewer": {"zones": [{"firewallEventsAdaptive": [
                        {"action": "block", "clientIP": "198.51.100.1", "datetime": rfc3339(W + 10),
                         "rayName": "r1", "ruleId": "100", "source": "waf"},
                        {"action": "challenge", "clientIP": "198.51.100.2", "datetime": rfc3339(W + 20),
                         "rayName": "r2", "ruleId": "101", "source": "waf"}
                    ]}]}},
                    "errors": null
                }))
            }
        }),
    );
    let base = serve(router).await;

    let store = InMemoryStore::new()
        .with_watermark("/cloudflare/last", &W.to_string())
        .with_secret("/cloudflare/email", "ops@example.com")
        .with_secret("/cloudflare/key", "k3y")
        .with_secret("/cloudflare/zone", "zone-1");
    let adapter = CloudflareAdapter::new(
        http(),
        &CloudflareConfig {
            common: common(&base),
            ..Default::default()
        },
    );
    let mut sink = VecSink::new();
    let ctx = HarvestContext::new("/cloudflare/last").at(at(W + 3600));

    let report = driver::run(&adapter, &CloudflareNormalizer, &store, &store, &mut sink, &ctx)
        .await
        .unwrap();

    assert_eq!(report.emitted, 2);
    assert_eq!(store.watermark("/cloudflare/last"), Some((W + 21).to_string()));
    assert_eq!(sink.records[0].get_str("ray_name"), Some("r1"));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (headers, body) = &seen[0];
    assert_eq!(headers["x-auth-email"], "ops@example.com");
    assert_eq!(headers["x-auth-key"], "k3y");
    assert_eq!(body["variables"]["zoneTag"], "zone-1");
    assert_eq!(body["variables"]["limit"], 100);
    assert_eq!(body["variables"]["filter"]["datetime_geq"], rfc3339(W));
    // Safety margin keeps the last minute out of the query.
    assert_eq!(body["variables"]["filter"]["datetime_leq"], rfc3339(W + 3540));
}

#[tokio::test]
async fn cloudflare_graphql_errors_fail_the_run() {
    let router = Router::new().route(
        "/graphql/",
        post(|| async { Json(json!({"data": null, "errors": [{"message": "zone not found"}]})) }),
    );
    let base = serve(router).await;

    let store = InMemoryStore::new()
        .with_watermark("/cloudflare/last", &W.to_string())
        .with_secret("/cloudflare/email", "e")
        .with_secret("/cloudflare/key", "k")
        .with_secret("/cloudflare/zone", "z");
    let adapter = CloudflareAdapter::new(
        http(),
        &CloudflareConfig {
            common: common(&base),
            ..Default::default()
        },
    );
    let mut sink = VecSink::new();
    let ctx = HarvestContext::new("/cloudflare/last").at(at(W + 3600));

    let err = driver::run(&adapter, &CloudflareNormalizer, &store, &store, &mut sink, &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::Transport(ref m) if m.contains("zone not found")));
    assert_eq!(store.watermark_writes(), 0);
}

/// Serves 150 events, one per second from W, honouring the request limit.
async fn cloudflare_dense_server(limits: Arc<Mutex<Vec<u64>>>) -> String {
    let router = Router::new().route(
        "/graphql/",
        post(move |Json(body): Json<Value>| {
            let limits = limits.clone();
            async move {
                let limit = body["variables"]["limit"].as_u64().unwrap();
                limits.lock().unwrap().push(limit);
                let geq = DateTime::parse_from_rfc3339(
                    body["variables"]["filter"]["datetime_geq"].as_str().unwrap(),
                )
                .unwrap()
                .timestamp();
                let events: Vec<Value> = (W..W + 150)
                    .filter(|t| *t >= geq)
                    .take(limit as usize)
                    .map(|t| {
                        json!({"action": "block", "clientIP": "198.51.100.1", "datetime": rfc3339(t),
                               "rayName": format!("r{}", t - W), "ruleId": "100", "source": "waf"})
                    })
                    .collect();
                Json(json!({"data": {"viewer": {"zones": [{"firewallEventsAdaptive": events}]}}}))
            }
        }),
    );
    serve(router).await
}

async fn cloudflare_dense_run(record_cap: usize) -> (usize, Vec<u64>, Option<String>) {
    let limits: Arc<Mutex<Vec<u64>>> = Arc::default();
    let base = cloudflare_dense_server(limits.clone()).await;

    let store = InMemoryStore::new()
        .with_watermark("/cloudflare/last", &W.to_string())
        .with_secret("/cloudflare/email", "e")
        .with_secret("/cloudflare/key", "k")
        .with_secret("/cloudflare/zone", "z");
    let adapter = CloudflareAdapter::new(
        http(),
        &CloudflareConfig {
            common: common(&base),
            record_cap: Some(record_cap),
            ..Default::default()
        },
    );
    let mut sink = VecSink::new();
    let ctx = HarvestContext::new("/cloudflare/last").at(at(W + 3600));

    let report = driver::run(&adapter, &CloudflareNormalizer, &store, &store, &mut sink, &ctx)
        .await
        .unwrap();
    let limits = limits.lock().unwrap().clone();
    (report.emitted, limits, store.watermark("/cloudflare/last"))
}

#[tokio::test]
async fn cloudflare_full_page_rewindows_from_last_second() {
    let (emitted, limits, watermark) = cloudflare_dense_run(100).await;
    assert_eq!(emitted, 150);
    assert_eq!(limits, vec![100, 100]);
    assert_eq!(watermark, Some((W + 150).to_string()));
}

#[tokio::test]
async fn cloudflare_query_limit_follows_record_cap() {
    let (emitted, limits, watermark) = cloudflare_dense_run(200).await;
    assert_eq!(emitted, 150);
    assert_eq!(limits, vec![200]);
    assert_eq!(watermark, Some((W + 150).to_string()));
}

#[tokio::test]
async fn cloudflare_small_record_cap_walks_every_event() {
    let (emitted, limits, watermark) = cloudflare_dense_run(40).await;
    assert_eq!(emitted, 150);
    assert!(limits.iter().all(|l| *l == 40));
    assert_eq!(watermark, Some((W + 150).to_string()));
}

// ═══════════════════════════════════════════════════════════════════════
// Google Workspace
// ═══════════════════════════════════════════════════════════════════════

fn activity(secs: i64, events: Value) -> Value {
    json!({
        "kind": "admin#reports#activity",
        "id": {"time": rfc3339(secs), "uniqueQualifier": secs.to_string(), "applicationName": "login", "customerId": "C1"},
        "etag": "\"etag\"",
        "actor": {"email": "ada@example.com", "profileId": "42"},
        "ipAddress": "192.0.2.10",
        "events": events
    })
}

#[tokio::test]
async fn gsuite_refreshes_token_and_drains_pages() {
    let queries: Arc<Mutex<Vec<(String, HashMap<String, String>)>>> = Arc::default();
    let captured = queries.clone();
    let router = Router::new()
        .route(
            "/token",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form["grant_type"], "refresh_token");
                assert_eq!(form["refresh_token"], "refresh-1");
                Json(json!({"access_token": "fresh", "expires_in": 3600, "token_type": "Bearer"}))
            }),
        )
        .route(
            "/admin/reports/v1/activity/users/all/applications/login",
            get(move |headers: HeaderMap, Query(q): Query<HashMap<String, String>>| {
                let captured = captured.clone();
                async move {
                    let auth = headers["authorization"].to_str().unwrap().to_string();
                    let page_token = q.get("pageToken").cloned();
                    captured.lock().unwrap().push((auth, q));
                    match page_token.as_deref() {
                        None => Json(json!({
                            "items": [activity(W + 10, json!([]))],
                            "nextPageToken": "p2"
                        })),
                        Some(_) => Json(json!({
                            "items": [
                                activity(W + 5, json!([
                                    {"type": "login", "name": "login_success",
                                     "parameters": [{"name": "login_type", "value": "google_password"}]},
                                    {"type": "login", "name": "login_verification",
                                     "parameters": [{"name": "login_challenge_method", "multiValue": ["password"]}]}
                                ])),
                                activity(W - 100, json!([]))
                            ]
                        })),
                    }
                }
            }),
        );
    let base = serve(router).await;

    let token = json!({"access_token": "stale", "refresh_token": "refresh-1", "expiry": rfc3339(W - 3600)});
    let client = json!({"installed": {"client_id": "cid", "client_secret": "csecret", "token_uri": "https://unused.invalid/token"}});
    let store = InMemoryStore::new()
        .with_watermark("gsuite-logs/latest.txt", &W.to_string())
        .with_secret("gsuite-logs-token", &token.to_string())
        .with_secret("gsuite-logs-config", &client.to_string());
    let adapter = GsuiteAdapter::new(
        http(),
        &GsuiteConfig {
            common: common(&base),
            ..Default::default()
        },
    );
    let mut sink = VecSink::new();
    let ctx = HarvestContext::new("gsuite-logs/latest.txt").at(at(W + 3600));

    let report = driver::run(&adapter, &GsuiteNormalizer, &store, &store, &mut sink, &ctx)
        .await
        .unwrap();

    // Two events at W+5, one event-less activity at W+10; the early one is dropped.
    assert_eq!(report.emitted, 3);
    assert_eq!(report.skipped_by_adapter, 1);
    assert_eq!(store.watermark("gsuite-logs/latest.txt"), Some((W + 11).to_string()));
    assert!(store.secret("gsuite-logs-token").unwrap().contains("fresh"));

    let queries = queries.lock().unwrap();
    assert_eq!(queries.len(), 2);
    assert!(queries.iter().all(|(auth, _)| auth == "Bearer fresh"));
    assert_eq!(queries[0].1["startTime"], rfc3339(W));
    assert_eq!(queries[1].1["pageToken"], "p2");
}

/// Serves secrets from an inner store but rejects every write.
struct ReadOnlySecrets<'a>(&'a InMemoryStore);

#[async_trait::async_trait]
impl SecretStore for ReadOnlySecrets<'_> {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, HarvestError> {
        self.0.get_secret(name).await
    }

    async fn put_secret(&self, name: &str, _value: &str) -> Result<(), HarvestError> {
        Err(HarvestError::Secret(format!("AccessDenied writing {}", name)))
    }
}

#[tokio::test]
async fn gsuite_token_save_failure_fails_the_run() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = fetches.clone();
    let router = Router::new()
        .route(
            "/token",
            post(|| async {
                Json(json!({"access_token": "fresh", "refresh_token": "refresh-2", "expires_in": 3600}))
            }),
        )
        .route(
            "/admin/reports/v1/activity/users/all/applications/login",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(json!({"items": [activity(W + 10, json!([]))]}))
                }
            }),
        );
    let base = serve(router).await;

    let token = json!({"access_token": "stale", "refresh_token": "refresh-1", "expiry": rfc3339(W - 3600)});
    let client = json!({"installed": {"client_id": "cid", "client_secret": "csecret"}});
    let store = InMemoryStore::new()
        .with_watermark("gsuite-logs/latest.txt", &W.to_string())
        .with_secret("gsuite-logs-token", &token.to_string())
        .with_secret("gsuite-logs-config", &client.to_string());
    let adapter = GsuiteAdapter::new(
        http(),
        &GsuiteConfig {
            common: common(&base),
            ..Default::default()
        },
    );
    let mut sink = VecSink::new();
    let ctx = HarvestContext::new("gsuite-logs/latest.txt").at(at(W + 3600));

    let err = driver::run(
        &adapter,
        &GsuiteNormalizer,
        &store,
        &ReadOnlySecrets(&store),
        &mut sink,
        &ctx,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, HarvestError::Secret(ref m) if m.contains("refreshed gsuite token")));
    assert_eq!(fetches.load(Ordering::SeqCst), 0);
    assert!(sink.records.is_empty());
    assert_eq!(store.watermark_writes(), 0);
    assert!(store.secret("gsuite-logs-token").unwrap().contains("stale"));
}

#[tokio::test]
async fn gsuite_page_limit_fails_without_committing() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = fetches.clone();
    let router = Router::new().route(
        "/admin/reports/v1/activity/users/all/applications/login",
        get(move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) as i64;
                // Newest first, and there is always another page.
                Json(json!({
                    "items": [activity(W + 1000 - n, json!([]))],
                    "nextPageToken": format!("p{}", n + 2)
                }))
            }
        }),
    );
    let base = serve(router).await;

    let token = json!({"access_token": "live", "expiry": "2099-01-01T00:00:00Z"});
    let client = json!({"installed": {"client_id": "cid", "client_secret": "csecret"}});
    let store = InMemoryStore::new()
        .with_watermark("gsuite-logs/latest.txt", &W.to_string())
        .with_secret("gsuite-logs-token", &token.to_string())
        .with_secret("gsuite-logs-config", &client.to_string());
    let adapter = GsuiteAdapter::new(
        http(),
        &GsuiteConfig {
            common: common(&base),
            max_pages: Some(3),
            ..Default::default()
        },
    );
    let mut sink = VecSink::new();
    let ctx = HarvestContext::new("gsuite-logs/latest.txt").at(at(W + 3600));

    let err = driver::run(&adapter, &GsuiteNormalizer, &store, &store, &mut sink, &ctx)
        .await
        .unwrap_err();

    assert!(matches!(err, HarvestError::Transport(ref m) if m.contains("after 3 pages")));
    assert_eq!(fetches.load(Ordering::SeqCst), 3);
    assert!(sink.records.is_empty());
    assert_eq!(store.watermark("gsuite-logs/latest.txt"), Some(W.to_string()));
    assert_eq!(store.watermark_writes(), 0);
}

// ═══════════════════════════════════════════════════════════════════════
// GuardDuty
// ═══════════════════════════════════════════════════════════════════════

fn finding(id: &str, updated: i64) -> Value {
    json!({
        "accountId": "111122223333",
        "id": id,
        "region": "us-east-1",
        "severity": 5.0,
        "type": "UnauthorizedAccess:EC2/SSHBruteForce",
        "updatedAt": rfc3339(updated),
        "resource": {"resourceType": "Instance", "instanceDetails": {"instanceId": "i-1"}},
        "service": {"action": {"actionType": "NETWORK_CONNECTION", "networkConnectionAction": {
            "blocked": false, "connectionDirection": "INBOUND", "protocol": "TCP",
            "localPortDetails": {"port": 22, "portName": "SSH"},
            "remoteIpDetails": {"ipAddressV4": "203.0.113.50"}
        }}, "detectorId": "det-1", "count": 1}
    })
}

#[tokio::test]
async fn guardduty_lists_then_gets_findings() {
    let lists: Arc<Mutex<Vec<(String, Value)>>> = Arc::default();
    let captured = lists.clone();
    let router = Router::new()
        .route(
            "/detector/det-1/findings",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let captured = captured.clone();
                async move {
                    let auth = headers["authorization"].to_str().unwrap().to_string();
                    let first = body.get("nextToken").is_none();
                    captured.lock().unwrap().push((auth, body));
                    if first {
                        Json(json!({"findingIds": ["f1", "f2"], "nextToken": "t2"}))
                    } else {
                        Json(json!({"findingIds": [], "nextToken": ""}))
                    }
                }
            }),
        )
        .route(
            "/detector/det-1/findings/get",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["findingIds"], json!(["f1", "f2"]));
                Json(json!({"findings": [finding("f2", W + 20), finding("f1", W + 10)]}))
            }),
        );
    let base = serve(router).await;

    let creds = AwsCredentials {
        access_key_id: "AKIDEXAMPLE".into(),
        secret_access_key: "secret".into(),
        session_token: None,
    };
    let adapter = GuarddutyAdapter::new(
        http(),
        creds,
        &GuarddutyConfig {
            common: common(&base),
            detector_id: "det-1".into(),
            region: Some("us-east-1".into()),
            ..Default::default()
        },
    );
    let store = InMemoryStore::new().with_watermark("guardduty-timestamp", &W.to_string());
    let mut sink = VecSink::new();
    let ctx = HarvestContext::new("guardduty-timestamp").at(at(W + 3600));

    let report = driver::run(&adapter, &GuarddutyNormalizer, &store, &store, &mut sink, &ctx)
        .await
        .unwrap();

    assert_eq!(report.emitted, 2);
    let ids: Vec<&str> = sink.records.iter().map(|r| r.get_str("id").unwrap()).collect();
    assert_eq!(ids, vec!["f1", "f2"]);
    assert_eq!(sink.records[0].get_str("connection_direction"), Some("INBOUND"));
    assert_eq!(store.watermark("guardduty-timestamp"), Some((W + 21).to_string()));

    let lists = lists.lock().unwrap();
    assert_eq!(lists.len(), 2);
    assert!(lists[0]
        .0
        .starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
    assert_eq!(
        lists[0].1["findingCriteria"]["criterion"]["updatedAt"]["greaterThanOrEqual"],
        json!(W * 1000)
    );
    assert_eq!(lists[1].1["nextToken"], "t2");
}

// ═══════════════════════════════════════════════════════════════════════
// LastPass
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn lastpass_reporting_in_mountain_time() {
    let bodies: Arc<Mutex<Vec<Value>>> = Arc::default();
    let captured = bodies.clone();
    let router = Router::new().route(
        "/enterpriseapi.php",
        post(move |Json(body): Json<Value>| {
            let captured = captured.clone();
            async move {
                captured.lock().unwrap().push(body);
                Json(json!({
                    "status": "OK",
                    "next": 0,
                    "data": {
                        "Event2": {"Time": "2024-01-15 10:30:00", "Username": "b@example.com",
                                   "IP_Address": "192.0.2.2", "Action": "Failed Login Attempt", "Data": ""},
                        "Event1": {"Time": "2024-01-15 10:00:05", "Username": "a@example.com",
                                   "IP_Address": "192.0.2.1", "Action": "Log in", "Data": ""}
                    }
                }))
            }
        }),
    );
    let base = serve(router).await;

    let store = InMemoryStore::new()
        .with_watermark("lastpass-timestamp", &W.to_string())
        .with_secret("lastpass", "provhash-1");
    let adapter = LastpassAdapter::new(
        http(),
        &LastpassConfig {
            common: common(&base),
            account_id: "8771312".into(),
            timezone: None,
        },
    )
    .unwrap();
    let mut sink = VecSink::new();
    let ctx = HarvestContext::new("lastpass-timestamp").at(at(W + 7200));

    let report = driver::run(&adapter, &LastpassNormalizer, &store, &store, &mut sink, &ctx)
        .await
        .unwrap();

    assert_eq!(report.emitted, 2);
    assert_eq!(sink.records[0].get_str("username"), Some("a@example.com"));
    assert_eq!(store.watermark("lastpass-timestamp"), Some((W + 1801).to_string()));

    let bodies = bodies.lock().unwrap();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["cid"], "8771312");
    assert_eq!(bodies[0]["provhash"], "provhash-1");
    assert_eq!(bodies[0]["cmd"], "reporting");
    assert_eq!(bodies[0]["data"]["from"], "2024-01-15 10:00:00");
    assert_eq!(bodies[0]["data"]["to"], "2024-01-15 12:00:00");
}

#[tokio::test]
async fn lastpass_failure_status_is_transport() {
    let router = Router::new().route(
        "/enterpriseapi.php",
        post(|| async { Json(json!({"status": "FAIL", "error": ["Authorization Error"]})) }),
    );
    let base = serve(router).await;

    let store = InMemoryStore::new()
        .with_watermark("lastpass-timestamp", &W.to_string())
        .with_secret("lastpass", "bad");
    let adapter = LastpassAdapter::new(
        http(),
        &LastpassConfig {
            common: common(&base),
            account_id: "1".into(),
            timezone: None,
        },
    )
    .unwrap();
    let mut sink = VecSink::new();
    let ctx = HarvestContext::new("lastpass-timestamp").at(at(W + 60));

    let err = driver::run(&adapter, &LastpassNormalizer, &store, &store, &mut sink, &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::Transport(_)));
}

// ═══════════════════════════════════════════════════════════════════════
// Slack
// ═══════════════════════════════════════════════════════════════════════

fn login(user: &str, date_last: i64) -> Value {
    json!({
        "user_id": user, "username": user.to_lowercase(), "date_first": date_last - 60,
        "date_last": date_last, "count": 1, "ip": "192.0.2.30", "user_agent": "SlackWeb",
        "isp": "Example ISP", "country": "US", "region": "CO"
    })
}

fn slack_config(base: &str) -> SlackConfig {
    SlackConfig {
        common: common(base),
        page_size: Some(2),
        page_delay_ms: Some(0),
    }
}

#[tokio::test]
async fn slack_walks_pages_until_seen_records() {
    let forms: Arc<Mutex<Vec<HashMap<String, String>>>> = Arc::default();
    let captured = forms.clone();
    let router = Router::new().route(
        "/team.accessLogs",
        post(move |Form(form): Form<HashMap<String, String>>| {
            let captured = captured.clone();
            async move {
                let page = form.get("page").cloned().unwrap_or_default();
                captured.lock().unwrap().push(form);
                let (logins, n) = match page.as_str() {
                    "1" => (vec![login("U3", W + 300), login("U2", W + 200)], 1),
                    "2" => (vec![login("U1", W + 150), login("U0", W + 50)], 2),
                    _ => (vec![login("U9", W)], 3),
                };
                Json(json!({
                    "ok": true,
                    "logins": logins,
                    "paging": {"count": 2, "total": 6, "page": n, "pages": 3}
                }))
            }
        }),
    );
    let base = serve(router).await;

    let store = InMemoryStore::new()
        .with_watermark("slack-timestamp", &(W + 100).to_string())
        .with_secret("slack", "xoxp-token");
    let adapter = SlackAdapter::new(http(), &slack_config(&base));
    let mut sink = VecSink::new();
    let ctx = HarvestContext::new("slack-timestamp").at(at(W + 600));

    let report = driver::run(&adapter, &SlackNormalizer, &store, &store, &mut sink, &ctx)
        .await
        .unwrap();

    assert_eq!(report.emitted, 3);
    assert_eq!(store.watermark("slack-timestamp"), Some((W + 301).to_string()));

    let forms = forms.lock().unwrap();
    assert_eq!(forms.len(), 2);
    for form in forms.iter() {
        assert_eq!(form["token"], "xoxp-token");
        assert_eq!(form["before"], (W + 600).to_string());
        assert_eq!(form["count"], "2");
    }
    assert_eq!(forms[1]["page"], "2");
}

#[tokio::test]
async fn slack_rate_limit_is_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let router = Router::new().route(
        "/team.accessLogs",
        post(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "0")], "slow down")
                        .into_response();
                }
                Json(json!({
                    "ok": true,
                    "logins": [login("U1", W + 10)],
                    "paging": {"page": 1, "pages": 1}
                }))
                .into_response()
            }
        }),
    );
    let base = serve(router).await;

    let store = InMemoryStore::new()
        .with_watermark("slack-timestamp", &W.to_string())
        .with_secret("slack", "t");
    let adapter = SlackAdapter::new(http(), &slack_config(&base));
    let mut sink = VecSink::new();
    let ctx = HarvestContext::new("slack-timestamp").at(at(W + 60));

    let report = driver::run(&adapter, &SlackNormalizer, &store, &store, &mut sink, &ctx)
        .await
        .unwrap();

    assert_eq!(report.rate_limited, 1);
    assert_eq!(report.emitted, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

async fn slack_error(error: &'static str) -> Result<audit_harvest::RunReport, HarvestError> {
    let router = Router::new().route(
        "/team.accessLogs",
        post(move || async move { Json(json!({"ok": false, "error": error})).into_response() }),
    );
    let base = serve(router).await;

    let store = InMemoryStore::new()
        .with_watermark("slack-timestamp", &W.to_string())
        .with_secret("slack", "t");
    let adapter = SlackAdapter::new(http(), &slack_config(&base));
    let mut sink = VecSink::new();
    let ctx = HarvestContext::new("slack-timestamp").at(at(W + 60));
    driver::run(&adapter, &SlackNormalizer, &store, &store, &mut sink, &ctx).await
}

#[tokio::test]
async fn slack_no_results_is_an_empty_run() {
    let report = slack_error("no results").await.unwrap();
    assert_eq!(report.emitted, 0);
}

#[tokio::test]
async fn slack_api_errors_fail_the_run() {
    let err = slack_error("invalid_auth").await.unwrap_err();
    assert!(matches!(err, HarvestError::Transport(ref m) if m.contains("invalid_auth")));
}
