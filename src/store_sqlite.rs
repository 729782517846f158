//! SQLite checkpoint backend.
//!
//! One row per checkpoint key in `checkpoints(source, cursor, updated_at)`.
//! The database is opened in WAL mode; the table is created on open if
//! `harvest init` has not run yet.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::path::Path;

use audit_harvest_core::store::CheckpointStore;
use audit_harvest_core::HarvestError;

use crate::db;
use crate::migrate;

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::ensure_schema(&pool).await?;
        Ok(Self { pool })
    }
}

fn checkpoint_error(err: sqlx::Error) -> HarvestError {
    HarvestError::Checkpoint(err.to_string())
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn get_watermark(&self, name: &str) -> Result<Option<String>, HarvestError> {
        sqlx::query_scalar("SELECT cursor FROM checkpoints WHERE source = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(checkpoint_error)
    }

    async fn put_watermark(&self, name: &str, value: &str) -> Result<(), HarvestError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO checkpoints (source, cursor, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(checkpoint_error)?;

        Ok(())
    }
}
