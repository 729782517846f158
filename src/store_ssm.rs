//! AWS Systems Manager Parameter Store backend.
//!
//! Serves both collaborator roles:
//!
//! | Role | Parameter type | Reads |
//! |------|----------------|-------|
//! | checkpoints | `String` | plain |
//! | secrets | `SecureString` | decrypted |
//!
//! Calls the SSM JSON API (`X-Amz-Target: AmazonSSM.<Action>`) through the
//! shared SigV4 signer. `ParameterNotFound` reads as a missing key.

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;

use audit_harvest_core::store::{CheckpointStore, SecretStore};
use audit_harvest_core::HarvestError;

use crate::aws::{AwsClient, AwsCredentials, Endpoint};
use crate::config::AwsEndpoint;
use crate::http;

const CONTENT_TYPE: &str = "application/x-amz-json-1.1";

pub struct SsmParameterStore {
    client: AwsClient,
}

#[derive(Debug, Deserialize)]
struct GetParameterResponse {
    #[serde(rename = "Parameter")]
    parameter: Parameter,
}

#[derive(Debug, Deserialize)]
struct Parameter {
    #[serde(rename = "Value")]
    value: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(alias = "Message", default)]
    message: String,
}

impl SsmParameterStore {
    pub fn new(http: reqwest::Client, creds: AwsCredentials, aws: &AwsEndpoint) -> Self {
        let region = aws.region();
        let endpoint = Endpoint::resolve(
            aws.endpoint_url.as_deref(),
            format!("ssm.{}.amazonaws.com", region),
        );
        Self {
            client: AwsClient::new(http, creds, "ssm", region, endpoint),
        }
    }

    async fn call(
        &self,
        action: &str,
        body: serde_json::Value,
    ) -> Result<Option<String>, HarvestError> {
        let target = format!("AmazonSSM.{}", action);
        let resp = self
            .client
            .send(
                Method::POST,
                "/",
                &[],
                &[("content-type", CONTENT_TYPE), ("x-amz-target", target.as_str())],
                body.to_string().into_bytes(),
            )
            .await?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| http::transport(&target, e))?;

        if status.is_success() {
            return Ok(Some(text));
        }

        let err: ErrorResponse = serde_json::from_str(&text).unwrap_or(ErrorResponse {
            kind: String::new(),
            message: text.chars().take(200).collect(),
        });
        if err.kind.ends_with("ParameterNotFound") {
            return Ok(None);
        }
        if status.as_u16() == 429 || err.kind.ends_with("ThrottlingException") {
            return Err(HarvestError::RateLimited { retry_after: None });
        }
        Err(HarvestError::Transport(format!(
            "{} failed (HTTP {}): {} {}",
            target, status, err.kind, err.message
        )))
    }

    pub async fn get_parameter(
        &self,
        name: &str,
        decrypt: bool,
    ) -> Result<Option<String>, HarvestError> {
        let body = json!({ "Name": name, "WithDecryption": decrypt });
        match self.call("GetParameter", body).await? {
            Some(text) => {
                let parsed: GetParameterResponse = http::decode_json(&text, "GetParameter")?;
                Ok(Some(parsed.parameter.value))
            }
            None => Ok(None),
        }
    }

    pub async fn put_parameter(
        &self,
        name: &str,
        value: &str,
        secure: bool,
    ) -> Result<(), HarvestError> {
        let body = json!({
            "Name": name,
            "Value": value,
            "Type": if secure { "SecureString" } else { "String" },
            "Overwrite": true,
        });
        match self.call("PutParameter", body).await? {
            Some(_) => Ok(()),
            None => Err(HarvestError::Transport(format!(
                "PutParameter {} reported ParameterNotFound",
                name
            ))),
        }
    }
}

#[async_trait]
impl CheckpointStore for SsmParameterStore {
    async fn get_watermark(&self, name: &str) -> Result<Option<String>, HarvestError> {
        self.get_parameter(name, false)
            .await
            .map_err(|e| HarvestError::Checkpoint(e.to_string()))
    }

    async fn put_watermark(&self, name: &str, value: &str) -> Result<(), HarvestError> {
        self.put_parameter(name, value, false)
            .await
            .map_err(|e| HarvestError::Checkpoint(e.to_string()))
    }
}

#[async_trait]
impl SecretStore for SsmParameterStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, HarvestError> {
        self.get_parameter(name, true)
            .await
            .map_err(|e| HarvestError::Secret(e.to_string()))
    }

    async fn put_secret(&self, name: &str, value: &str) -> Result<(), HarvestError> {
        self.put_parameter(name, value, true)
            .await
            .map_err(|e| HarvestError::Secret(e.to_string()))
    }
}
