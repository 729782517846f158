//! Live credentials for one run.
//!
//! A source declares which secrets it needs as a list of [`SecretRef`]s
//! (logical field → secret name). [`resolve`] reads them once per run from
//! the configured [`SecretStore`]; a missing or empty secret is a
//! `Config` error and aborts the run before any request is made.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use audit_harvest_core::store::SecretStore;
use audit_harvest_core::HarvestError;

/// One secret a source needs, under the field name the adapter reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub field: &'static str,
    pub name: String,
}

impl SecretRef {
    pub fn new(field: &'static str, name: impl Into<String>) -> Self {
        Self {
            field,
            name: name.into(),
        }
    }
}

/// Token/secret values keyed by field, plus an optional expiry.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential {
    values: BTreeMap<String, String>,
    expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("fields", &self.values.keys().collect::<Vec<_>>())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, value: impl Into<String>) -> Self {
        self.values.insert(field.to_string(), value.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Required field; absence is a configuration error.
    pub fn get(&self, field: &str) -> Result<&str, HarvestError> {
        self.values
            .get(field)
            .map(String::as_str)
            .ok_or_else(|| HarvestError::Config(format!("credential field '{}' not set", field)))
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// True when the credential has no expiry or expires within `skew`.
    pub fn is_stale(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        match self.expires_at {
            Some(at) => at - skew <= now,
            None => true,
        }
    }
}

/// Read every referenced secret from `store`.
pub async fn resolve(
    store: &dyn SecretStore,
    refs: &[SecretRef],
) -> Result<Credential, HarvestError> {
    let mut credential = Credential::new();
    for r in refs {
        let value = store.get_secret(&r.name).await?;
        match value {
            Some(v) if !v.trim().is_empty() => {
                debug!(field = r.field, secret = %r.name, "resolved secret");
                credential = credential.with(r.field, v.trim());
            }
            _ => {
                return Err(HarvestError::Config(format!(
                    "required secret '{}' is missing or empty",
                    r.name
                )));
            }
        }
    }
    Ok(credential)
}
