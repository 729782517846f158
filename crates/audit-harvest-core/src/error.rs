//! Error taxonomy shared by the driver, adapters, and stores.
//!
//! Only failure classes live here. Outcomes that are not failures (an empty
//! result set, a stale record that was skipped) are reported through the
//! run report instead.

use std::time::Duration;

use thiserror::Error;

/// Errors that can abort a harvesting run.
///
/// | Variant | Fatal | Watermark |
/// |---------|-------|-----------|
/// | [`Config`](HarvestError::Config) | yes | unchanged |
/// | [`Transport`](HarvestError::Transport) | yes | unchanged |
/// | [`Parse`](HarvestError::Parse) | yes | unchanged |
/// | [`RateLimited`](HarvestError::RateLimited) | no, retried in-run | unchanged |
/// | [`Checkpoint`](HarvestError::Checkpoint) | yes | unchanged |
/// | [`Secret`](HarvestError::Secret) | yes | unchanged |
/// | [`Emit`](HarvestError::Emit) | yes | unchanged |
#[derive(Debug, Error)]
pub enum HarvestError {
    /// A required credential, identifier, or option is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network failure, timeout, or a non-success provider response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The provider answered but the body could not be decoded.
    #[error("parse error: {message}")]
    Parse { message: String, body: String },

    /// The provider asked us to slow down.
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    /// Reading or writing a watermark failed.
    #[error("checkpoint store error: {0}")]
    Checkpoint(String),

    /// Reading or writing a secret failed.
    #[error("secret store error: {0}")]
    Secret(String),

    /// Writing a record to the sink failed.
    #[error("emit error: {0}")]
    Emit(String),
}

impl HarvestError {
    /// Build a [`HarvestError::Parse`] keeping the offending body for diagnosis.
    pub fn parse(message: impl Into<String>, body: impl Into<String>) -> Self {
        HarvestError::Parse {
            message: message.into(),
            body: body.into(),
        }
    }

    /// Whether the driver may retry the same request within the current run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HarvestError::RateLimited { .. })
    }

    /// Short class name used in log fields.
    pub fn class(&self) -> &'static str {
        match self {
            HarvestError::Config(_) => "config",
            HarvestError::Transport(_) => "transport",
            HarvestError::Parse { .. } => "parse",
            HarvestError::RateLimited { .. } => "rate_limited",
            HarvestError::Checkpoint(_) => "checkpoint",
            HarvestError::Secret(_) => "secret",
            HarvestError::Emit(_) => "emit",
        }
    }
}
