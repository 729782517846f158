//! Minimal S3 object access (GET/PUT) over the shared SigV4 signer.
//!
//! Used by the S3 checkpoint backend and the S3 record sink. Standard AWS
//! endpoints use virtual-hosted addressing (`<bucket>.s3.<region>.amazonaws.com`);
//! custom endpoints (MinIO, LocalStack, test servers) use path-style
//! addressing (`<endpoint>/<bucket>/<key>`).

use reqwest::{Method, StatusCode};

use audit_harvest_core::HarvestError;

use crate::aws::{AwsClient, AwsCredentials, Endpoint};
use crate::config::AwsEndpoint;
use crate::http;

#[derive(Debug, Clone)]
pub struct S3Bucket {
    client: AwsClient,
    bucket: String,
    path_style: bool,
}

impl S3Bucket {
    pub fn new(
        http: reqwest::Client,
        creds: AwsCredentials,
        bucket: &str,
        aws: &AwsEndpoint,
    ) -> Self {
        let region = aws.region();
        let path_style = aws.endpoint_url.is_some();
        let endpoint = Endpoint::resolve(
            aws.endpoint_url.as_deref(),
            format!("{}.s3.{}.amazonaws.com", bucket, region),
        );
        Self {
            client: AwsClient::new(http, creds, "s3", region, endpoint),
            bucket: bucket.to_string(),
            path_style,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_path(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        if self.path_style {
            format!("/{}/{}", self.bucket, key)
        } else {
            format!("/{}", key)
        }
    }

    /// Fetch an object body. A missing object (404) is `Ok(None)`.
    pub async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, HarvestError> {
        let resp = self
            .client
            .send(Method::GET, &self.object_path(key), &[], &[], Vec::new())
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let what = format!("S3 GetObject s3://{}/{}", self.bucket, key);
        let resp = http::check(resp, &what).await?;
        let bytes = resp.bytes().await.map_err(|e| http::transport(&what, e))?;
        Ok(Some(bytes.to_vec()))
    }

    /// Upload an object with server-side encryption.
    pub async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), HarvestError> {
        let resp = self
            .client
            .send(
                Method::PUT,
                &self.object_path(key),
                &[],
                &[
                    ("content-type", content_type),
                    ("x-amz-server-side-encryption", "AES256"),
                ],
                body,
            )
            .await?;

        let what = format!("S3 PutObject s3://{}/{}", self.bucket, key);
        http::check(resp, &what).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKID".into(),
            secret_access_key: "secret".into(),
            session_token: None,
        }
    }

    #[test]
    fn addressing_style_follows_endpoint() {
        let hosted = S3Bucket::new(
            reqwest::Client::new(),
            creds(),
            "logs",
            &AwsEndpoint {
                region: Some("eu-west-1".into()),
                endpoint_url: None,
            },
        );
        assert_eq!(hosted.object_path("a/b.json"), "/a/b.json");
        assert_eq!(
            hosted.client.endpoint().host,
            "logs.s3.eu-west-1.amazonaws.com"
        );

        let local = S3Bucket::new(
            reqwest::Client::new(),
            creds(),
            "logs",
            &AwsEndpoint {
                region: None,
                endpoint_url: Some("http://localhost:9000".into()),
            },
        );
        assert_eq!(local.object_path("/a/b.json"), "/logs/a/b.json");
    }
}
