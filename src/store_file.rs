//! Secrets from a local JSON file (`{"name": "value", ...}`).
//!
//! The file is read on every lookup and rewritten on every write (temp file
//! + rename), so a refreshed token survives to the next invocation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use audit_harvest_core::store::SecretStore;
use audit_harvest_core::HarvestError;

pub struct FileSecretStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSecretStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, String>, HarvestError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(HarvestError::Secret(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            HarvestError::Secret(format!("{} is not a JSON object of strings: {}", self.path.display(), e))
        })
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, HarvestError> {
        Ok(self.load().await?.remove(name))
    }

    async fn put_secret(&self, name: &str, value: &str) -> Result<(), HarvestError> {
        let _guard = self.write_lock.lock().await;
        let mut secrets = self.load().await?;
        secrets.insert(name.to_string(), value.to_string());

        let body = serde_json::to_string_pretty(&secrets)
            .map_err(|e| HarvestError::Secret(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| HarvestError::Secret(format!("failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| HarvestError::Secret(format!("failed to replace {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}
