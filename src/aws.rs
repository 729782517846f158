//! Minimal AWS request signing.
//!
//! Every AWS call this crate makes (S3 objects, SSM parameters, GuardDuty
//! findings) goes through [`AwsClient::send`], which signs the request with
//! [AWS Signature Version 4](https://docs.aws.amazon.com/IAM/latest/UserGuide/reference_aws-signing.html)
//! using only `hmac` + `sha2`. No AWS SDK, no C dependencies.
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional (temporary credentials / IAM roles)
//!
//! Custom endpoints (`http://localhost:4566` for LocalStack, MinIO, or a test
//! server) keep their scheme and port; the signed `host` matches what
//! `reqwest` sends.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Method;
use sha2::{Digest, Sha256};

use audit_harvest_core::HarvestError;

use crate::http;

type HmacSha256 = Hmac<Sha256>;

// ═══════════════════════════════════════════════════════════════════════
// Credentials and endpoints
// ═══════════════════════════════════════════════════════════════════════

/// AWS credentials loaded from environment variables.
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl AwsCredentials {
    pub fn from_env() -> Result<Self, HarvestError> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
            HarvestError::Config("AWS_ACCESS_KEY_ID environment variable not set".into())
        })?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            HarvestError::Config("AWS_SECRET_ACCESS_KEY environment variable not set".into())
        })?;
        let session_token = std::env::var("AWS_SESSION_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// Scheme plus `host[:port]` for one AWS service endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
}

impl Endpoint {
    /// Use `custom` when set, otherwise `https://<default_host>`.
    pub fn resolve(custom: Option<&str>, default_host: String) -> Self {
        match custom {
            Some(url) => {
                let (scheme, rest) = match url.split_once("://") {
                    Some((scheme, rest)) => (scheme.to_string(), rest),
                    None => ("https".to_string(), url),
                };
                Self {
                    scheme,
                    host: rest.trim_end_matches('/').to_string(),
                }
            }
            None => Self {
                scheme: "https".to_string(),
                host: default_host,
            },
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}://{}{}", self.scheme, self.host, path)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Signed client
// ═══════════════════════════════════════════════════════════════════════

/// A signer bound to one service, region and endpoint.
#[derive(Debug, Clone)]
pub struct AwsClient {
    http: reqwest::Client,
    creds: AwsCredentials,
    service: &'static str,
    region: String,
    endpoint: Endpoint,
}

impl AwsClient {
    pub fn new(
        http: reqwest::Client,
        creds: AwsCredentials,
        service: &'static str,
        region: String,
        endpoint: Endpoint,
    ) -> Self {
        Self {
            http,
            creds,
            service,
            region,
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Sign and send one request.
    ///
    /// `path` is the raw (unencoded) path; each segment is URI-encoded.
    /// `headers` are extra headers to send and sign (e.g. `x-amz-target`).
    /// The response is returned as-is; callers decide what a non-2xx means.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        headers: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<reqwest::Response, HarvestError> {
        let canonical_uri = encode_path(path);
        let canonical_query = canonical_query(query);
        let signed = sign(
            &SigningInput {
                method: method.as_str(),
                host: &self.endpoint.host,
                canonical_uri: &canonical_uri,
                canonical_query: &canonical_query,
                headers,
                payload: &body,
                service: self.service,
                region: &self.region,
            },
            &self.creds,
            Utc::now(),
        );

        let mut url = self.endpoint.url(&canonical_uri);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        let mut req = self.http.request(method, &url);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        for (k, v) in &signed {
            req = req.header(k.as_str(), v.as_str());
        }

        let what = format!("{} {}", self.service, path);
        req.body(body)
            .send()
            .await
            .map_err(|e| http::transport(&what, e))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// SigV4
// ═══════════════════════════════════════════════════════════════════════

/// Everything that goes into one canonical request.
pub struct SigningInput<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub canonical_uri: &'a str,
    pub canonical_query: &'a str,
    pub headers: &'a [(&'a str, &'a str)],
    pub payload: &'a [u8],
    pub service: &'a str,
    pub region: &'a str,
}

/// Compute the headers to attach to a request: `Authorization`,
/// `x-amz-date`, `x-amz-content-sha256` and, for temporary credentials,
/// `x-amz-security-token`.
pub fn sign(
    input: &SigningInput<'_>,
    creds: &AwsCredentials,
    now: DateTime<Utc>,
) -> Vec<(String, String)> {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let payload_hash = hex_sha256(input.payload);

    let mut headers: Vec<(String, String)> = vec![
        ("host".to_string(), input.host.to_string()),
        ("x-amz-content-sha256".to_string(), payload_hash.clone()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(ref token) = creds.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    for (k, v) in input.headers {
        headers.push((k.to_ascii_lowercase(), v.trim().to_string()));
    }
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let signed_headers: String = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        input.method,
        input.canonical_uri,
        input.canonical_query,
        canonical_headers,
        signed_headers,
        payload_hash
    );

    let credential_scope = format!(
        "{}/{}/{}/aws4_request",
        date_stamp, input.region, input.service
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(
        &creds.secret_access_key,
        &date_stamp,
        input.region,
        input.service,
    );
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key_id, credential_scope, signed_headers, signature
    );

    let mut out = vec![
        ("authorization".to_string(), authorization),
        ("x-amz-content-sha256".to_string(), payload_hash),
        ("x-amz-date".to_string(), amz_date),
    ];
    if let Some(ref token) = creds.session_token {
        out.push(("x-amz-security-token".to_string(), token.clone()));
    }
    out
}

pub fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Derive the SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
pub fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode per RFC 3986, leaving `A-Z a-z 0-9 - _ . ~` untouched.
pub fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

fn encode_path(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    let encoded = trimmed
        .split('/')
        .map(uri_encode)
        .collect::<Vec<_>>()
        .join("/");
    format!("/{}", encoded)
}

fn canonical_query(params: &[(&str, &str)]) -> String {
    let mut sorted: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (uri_encode(k), uri_encode(v)))
        .collect();
    sorted.sort();
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn creds() -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: None,
        }
    }

    #[test]
    fn signing_key_matches_published_example() {
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn uri_encode_reserved() {
        assert_eq!(uri_encode("a b/c~d"), "a%20b%2Fc~d");
        assert_eq!(encode_path("/cloudflare/last"), "/cloudflare/last");
        assert_eq!(encode_path("/logs/a b.json"), "/logs/a%20b.json");
        assert_eq!(encode_path(""), "/");
    }

    #[test]
    fn canonical_query_is_sorted_and_encoded() {
        assert_eq!(
            canonical_query(&[("prefix", "a/b"), ("list-type", "2")]),
            "list-type=2&prefix=a%2Fb"
        );
    }

    #[test]
    fn signature_covers_extra_headers() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let input = SigningInput {
            method: "POST",
            host: "ssm.us-east-1.amazonaws.com",
            canonical_uri: "/",
            canonical_query: "",
            headers: &[("X-Amz-Target", "AmazonSSM.GetParameter")],
            payload: b"{}",
            service: "ssm",
            region: "us-east-1",
        };
        let headers = sign(&input, &creds(), now);
        let auth = &headers
            .iter()
            .find(|(k, _)| k == "authorization")
            .unwrap()
            .1;
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240101/us-east-1/ssm/aws4_request"
        ));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date;x-amz-target"));

        // Deterministic for identical input.
        assert_eq!(headers, sign(&input, &creds(), now));
    }

    #[test]
    fn custom_endpoint_keeps_scheme_and_port() {
        let ep = Endpoint::resolve(Some("http://127.0.0.1:4566/"), "unused".into());
        assert_eq!(ep.scheme, "http");
        assert_eq!(ep.host, "127.0.0.1:4566");
        assert_eq!(ep.url("/x"), "http://127.0.0.1:4566/x");

        let ep = Endpoint::resolve(None, "ssm.eu-west-1.amazonaws.com".into());
        assert_eq!(ep.url("/"), "https://ssm.eu-west-1.amazonaws.com/");
    }
}
