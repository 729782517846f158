//! The source adapter and normalizer capabilities.
//!
//! The driver is written once against [`SourceAdapter`]; each provider
//! supplies one implementation describing its pagination style, ordering,
//! throttling behaviour and credentials, plus a [`Normalizer`] that flattens
//! its raw records.
//!
//! | Provider | Pagination | Order | Watermark |
//! |----------|------------|-------|-----------|
//! | Cloudflare | window, 100-record cap | ascending | timestamp |
//! | Google Workspace | cursor (drained by the adapter) | ascending | timestamp |
//! | GuardDuty | cursor (`nextToken`) | ascending | timestamp |
//! | LastPass | cursor (`next`) | ascending | timestamp |
//! | Slack | cursor (page numbers) | descending | timestamp |

use async_trait::async_trait;

use audit_harvest_core::store::SecretStore;
use audit_harvest_core::{
    HarvestError, NormalizedRecord, PageOrder, PageRequest, PageResult, Pagination,
    RateLimitHint, Record, WatermarkKind,
};

use crate::credential::{Credential, SecretRef};

/// One provider's view of the harvesting protocol.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    type Record: Record + Send + Sync;

    /// Source name used in logs and reports (e.g. `"cloudflare"`).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn watermark_kind(&self) -> WatermarkKind {
        WatermarkKind::Timestamp
    }

    fn order(&self) -> PageOrder;

    fn pagination(&self) -> Pagination;

    fn rate_limit_hint(&self) -> RateLimitHint {
        RateLimitHint::default()
    }

    /// Secrets to resolve before the first page.
    fn secrets(&self) -> Vec<SecretRef>;

    /// Called before every page fetch. Returns a replacement credential when
    /// it had to be refreshed; refreshed values are written back to
    /// `secrets` so the next invocation reuses them.
    async fn refresh_if_stale(
        &self,
        _credential: &Credential,
        _secrets: &dyn SecretStore,
    ) -> Result<Option<Credential>, HarvestError> {
        Ok(None)
    }

    async fn fetch_page(
        &self,
        request: &PageRequest,
        credential: &Credential,
    ) -> Result<PageResult<Self::Record>, HarvestError>;
}

/// Pure mapping from a raw record to zero or more flat records.
///
/// Never fails: missing optional fields are omitted. One raw record may
/// fan out into several normalized records sharing the common fields.
pub trait Normalizer<R>: Send + Sync {
    fn normalize(&self, record: &R) -> Vec<NormalizedRecord>;
}
