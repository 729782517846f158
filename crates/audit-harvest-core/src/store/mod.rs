//! Collaborator abstractions for persistence.
//!
//! The driver needs two tiny key/value capabilities: somewhere to keep the
//! watermark between runs, and somewhere to read (and occasionally write
//! back) credentials. Both are single-key operations with no cross-key
//! transactions; the driver's emit-then-commit ordering supplies the
//! consistency the pipeline needs.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;

use crate::error::HarvestError;

/// Durable home for watermarks, keyed by checkpoint name.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read the stored blob. A missing key is `Ok(None)`, not an error.
    async fn get_watermark(&self, name: &str) -> Result<Option<String>, HarvestError>;

    /// Overwrite the stored blob.
    async fn put_watermark(&self, name: &str, value: &str) -> Result<(), HarvestError>;
}

/// Source of credentials, keyed by secret name.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read a secret. A missing secret is `Ok(None)`; callers decide whether
    /// that is fatal.
    async fn get_secret(&self, name: &str) -> Result<Option<String>, HarvestError>;

    /// Persist a refreshed secret for the next invocation.
    async fn put_secret(&self, name: &str, value: &str) -> Result<(), HarvestError>;
}
