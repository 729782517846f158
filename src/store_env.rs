//! Secrets from environment variables.
//!
//! A secret name maps to an upper-snake variable: `/cloudflare/email` reads
//! `CLOUDFLARE_EMAIL`, `gsuite-logs-token` reads `GSUITE_LOGS_TOKEN`.
//! Refreshed secrets are kept in-process only; the environment is never
//! modified.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use audit_harvest_core::store::SecretStore;
use audit_harvest_core::HarvestError;

#[derive(Default)]
pub struct EnvSecretStore {
    overrides: RwLock<HashMap<String, String>>,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn var_name(name: &str) -> String {
        let mut out = String::with_capacity(name.len());
        for c in name.chars() {
            if c.is_ascii_alphanumeric() {
                out.push(c.to_ascii_uppercase());
            } else if !out.ends_with('_') {
                out.push('_');
            }
        }
        out.trim_matches('_').to_string()
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, HarvestError> {
        if let Some(v) = self
            .overrides
            .read()
            .ok()
            .and_then(|map| map.get(name).cloned())
        {
            return Ok(Some(v));
        }
        Ok(std::env::var(Self::var_name(name)).ok())
    }

    async fn put_secret(&self, name: &str, value: &str) -> Result<(), HarvestError> {
        let mut map = self
            .overrides
            .write()
            .map_err(|_| HarvestError::Secret("secret cache poisoned".into()))?;
        map.insert(name.to_string(), value.to_string());
        Ok(())
    }
}
