//! In-memory [`CheckpointStore`] and [`SecretStore`] for tests and embedding.
//!
//! Uses `HashMap` behind `std::sync::RwLock` for thread safety.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::HarvestError;

use super::{CheckpointStore, SecretStore};

/// Process-local key/value store implementing both collaborator traits.
#[derive(Default)]
pub struct InMemoryStore {
    watermarks: RwLock<HashMap<String, String>>,
    secrets: RwLock<HashMap<String, String>>,
    watermark_writes: RwLock<u64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a watermark.
    pub fn with_watermark(self, name: &str, value: &str) -> Self {
        if let Ok(mut map) = self.watermarks.write() {
            map.insert(name.to_string(), value.to_string());
        }
        self
    }

    /// Seed a secret.
    pub fn with_secret(self, name: &str, value: &str) -> Self {
        if let Ok(mut map) = self.secrets.write() {
            map.insert(name.to_string(), value.to_string());
        }
        self
    }

    /// Current watermark without going through the async trait.
    pub fn watermark(&self, name: &str) -> Option<String> {
        self.watermarks
            .read()
            .ok()
            .and_then(|map| map.get(name).cloned())
    }

    /// Current secret without going through the async trait.
    pub fn secret(&self, name: &str) -> Option<String> {
        self.secrets.read().ok().and_then(|map| map.get(name).cloned())
    }

    /// How many times a watermark has been written.
    pub fn watermark_writes(&self) -> u64 {
        self.watermark_writes.read().map(|n| *n).unwrap_or(0)
    }
}

fn poisoned() -> HarvestError {
    HarvestError::Checkpoint("in-memory store lock poisoned".to_string())
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn get_watermark(&self, name: &str) -> Result<Option<String>, HarvestError> {
        let map = self.watermarks.read().map_err(|_| poisoned())?;
        Ok(map.get(name).cloned())
    }

    async fn put_watermark(&self, name: &str, value: &str) -> Result<(), HarvestError> {
        let mut map = self.watermarks.write().map_err(|_| poisoned())?;
        map.insert(name.to_string(), value.to_string());
        let mut writes = self.watermark_writes.write().map_err(|_| poisoned())?;
        *writes += 1;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for InMemoryStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, HarvestError> {
        let map = self
            .secrets
            .read()
            .map_err(|_| HarvestError::Secret("in-memory store lock poisoned".to_string()))?;
        Ok(map.get(name).cloned())
    }

    async fn put_secret(&self, name: &str, value: &str) -> Result<(), HarvestError> {
        let mut map = self
            .secrets
            .write()
            .map_err(|_| HarvestError::Secret("in-memory store lock poisoned".to_string()))?;
        map.insert(name.to_string(), value.to_string());
        Ok(())
    }
}
