//! Record sinks: where normalized records go.
//!
//! Every sink writes newline-delimited JSON, one [`NormalizedRecord`] per
//! line. The driver calls [`Sink::flush`] before it commits a watermark, so
//! a sink must not report a successful flush until the records it has
//! accepted are durable from its point of view.
//!
//! | Sink | Destination |
//! |------|-------------|
//! | [`StdoutSink`] | process stdout |
//! | [`FileSink`] | append-only JSONL file |
//! | [`S3Sink`] | one S3 object per flush |
//! | [`VecSink`] | memory |

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use audit_harvest_core::{HarvestError, NormalizedRecord};

use crate::s3::S3Bucket;

#[async_trait]
pub trait Sink: Send {
    async fn emit(&mut self, record: &NormalizedRecord) -> Result<(), HarvestError>;

    async fn flush(&mut self) -> Result<(), HarvestError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to create parent directories: {0}")]
    CreateDir(std::io::Error),

    #[error("failed to open log file: {0}")]
    OpenFile(std::io::Error),

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write record: {0}")]
    Write(std::io::Error),

    #[error("failed to flush: {0}")]
    Flush(std::io::Error),
}

impl From<SinkError> for HarvestError {
    fn from(err: SinkError) -> Self {
        HarvestError::Emit(err.to_string())
    }
}

fn json_line(record: &NormalizedRecord) -> Result<Vec<u8>, SinkError> {
    let mut line = record.to_json_line()?.into_bytes();
    line.push(b'\n');
    Ok(line)
}

// ═══════════════════════════════════════════════════════════════════════
// Stdout
// ═══════════════════════════════════════════════════════════════════════

pub struct StdoutSink {
    out: tokio::io::Stdout,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            out: tokio::io::stdout(),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for StdoutSink {
    async fn emit(&mut self, record: &NormalizedRecord) -> Result<(), HarvestError> {
        let line = json_line(record)?;
        self.out.write_all(&line).await.map_err(SinkError::Write)?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), HarvestError> {
        self.out.flush().await.map_err(SinkError::Flush)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// JSONL file
// ═══════════════════════════════════════════════════════════════════════

/// Append-only JSONL file. Parent directories are created on open.
pub struct FileSink {
    file: tokio::fs::File,
}

impl FileSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(SinkError::CreateDir)?;
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(SinkError::OpenFile)?;

        Ok(Self { file })
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn emit(&mut self, record: &NormalizedRecord) -> Result<(), HarvestError> {
        let line = json_line(record)?;
        self.file.write_all(&line).await.map_err(SinkError::Write)?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), HarvestError> {
        self.file.flush().await.map_err(SinkError::Flush)?;
        self.file.sync_data().await.map_err(SinkError::Flush)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// S3
// ═══════════════════════════════════════════════════════════════════════

/// Buffers records and uploads them as `<prefix>/<unix>-<uuid>.json` on flush.
///
/// An empty buffer uploads nothing.
pub struct S3Sink {
    bucket: S3Bucket,
    prefix: String,
    buffer: Vec<u8>,
    uploaded: Vec<String>,
}

impl S3Sink {
    pub fn new(bucket: S3Bucket, prefix: &str) -> Self {
        Self {
            bucket,
            prefix: prefix.trim_matches('/').to_string(),
            buffer: Vec::new(),
            uploaded: Vec::new(),
        }
    }

    /// Keys written so far.
    pub fn uploaded(&self) -> &[String] {
        &self.uploaded
    }

    fn next_key(&self) -> String {
        let name = format!("{}-{}.json", Utc::now().timestamp(), Uuid::new_v4());
        if self.prefix.is_empty() {
            name
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }
}

#[async_trait]
impl Sink for S3Sink {
    async fn emit(&mut self, record: &NormalizedRecord) -> Result<(), HarvestError> {
        let line = json_line(record)?;
        self.buffer.extend_from_slice(&line);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), HarvestError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let key = self.next_key();
        let body = std::mem::take(&mut self.buffer);
        if let Err(e) = self
            .bucket
            .put_object(&key, body.clone(), "application/x-ndjson")
            .await
        {
            self.buffer = body;
            return Err(HarvestError::Emit(e.to_string()));
        }
        tracing::info!(bucket = %self.bucket.bucket(), key = %key, "uploaded log object");
        self.uploaded.push(key);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Memory
// ═══════════════════════════════════════════════════════════════════════

/// Collects records in memory. `fail_after` makes emission fail once that
/// many records were accepted.
#[derive(Debug, Default)]
pub struct VecSink {
    pub records: Vec<NormalizedRecord>,
    pub flushes: usize,
    pub fail_after: Option<usize>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Sink for VecSink {
    async fn emit(&mut self, record: &NormalizedRecord) -> Result<(), HarvestError> {
        if let Some(limit) = self.fail_after {
            if self.records.len() >= limit {
                return Err(HarvestError::Emit("sink refused record".into()));
            }
        }
        self.records.push(record.clone());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), HarvestError> {
        self.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(n: i64) -> NormalizedRecord {
        NormalizedRecord::builder("test", Utc.timestamp_opt(1_700_000_000 + n, 0).unwrap())
            .field("n", n)
            .build()
    }

    #[tokio::test]
    async fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.jsonl");

        let mut sink = FileSink::open(&path).await.unwrap();
        sink.emit(&record(1)).await.unwrap();
        sink.emit(&record(2)).await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);

        let mut sink = FileSink::open(&path).await.unwrap();
        sink.emit(&record(3)).await.unwrap();
        sink.flush().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let last: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(last["n"], 3);
        assert_eq!(last["log_source"], "test");
    }

    #[tokio::test]
    async fn vec_sink_can_fail_on_demand() {
        let mut sink = VecSink::failing_after(1);
        sink.emit(&record(1)).await.unwrap();
        let err = sink.emit(&record(2)).await.unwrap_err();
        assert!(matches!(err, HarvestError::Emit(_)));
        assert_eq!(sink.records.len(), 1);
    }
}
