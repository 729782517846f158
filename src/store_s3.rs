//! S3 checkpoint backend: one small object per checkpoint key.
//!
//! ```toml
//! [checkpoints]
//! backend = "s3"
//! bucket = "harvest-state"
//! prefix = "watermarks"
//! # endpoint_url = "http://localhost:4566"
//! ```
//!
//! A missing object reads as "no checkpoint". Objects are written with
//! SSE-S3 (`AES256`).

use async_trait::async_trait;

use audit_harvest_core::store::CheckpointStore;
use audit_harvest_core::HarvestError;

use crate::s3::S3Bucket;

pub struct S3Store {
    bucket: S3Bucket,
    prefix: String,
}

impl S3Store {
    pub fn new(bucket: S3Bucket, prefix: &str) -> Self {
        Self {
            bucket,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn key(&self, name: &str) -> String {
        let name = name.trim_start_matches('/');
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }
}

fn checkpoint_error(err: HarvestError) -> HarvestError {
    match err {
        HarvestError::Checkpoint(_) => err,
        other => HarvestError::Checkpoint(other.to_string()),
    }
}

#[async_trait]
impl CheckpointStore for S3Store {
    async fn get_watermark(&self, name: &str) -> Result<Option<String>, HarvestError> {
        let body = self
            .bucket
            .get_object(&self.key(name))
            .await
            .map_err(checkpoint_error)?;
        Ok(body.map(|b| String::from_utf8_lossy(&b).trim().to_string()))
    }

    async fn put_watermark(&self, name: &str, value: &str) -> Result<(), HarvestError> {
        self.bucket
            .put_object(&self.key(name), value.as_bytes().to_vec(), "text/plain")
            .await
            .map_err(checkpoint_error)
    }
}
