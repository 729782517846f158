//! Tracing setup for the `harvest` binary.
//!
//! Logs always go to stderr; stdout carries the emitted record stream.
//! `RUST_LOG` overrides `[logging].level`. Format `auto` picks human
//! readable text when stderr is a terminal and JSON otherwise.

use anyhow::{bail, Result};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn resolve(format: &str) -> Result<Self> {
        match format {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "auto" => Ok(if atty::is(atty::Stream::Stderr) {
                LogFormat::Text
            } else {
                LogFormat::Json
            }),
            other => bail!("unknown log format '{}'", other),
        }
    }
}

pub fn init(config: &LoggingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = match LogFormat::resolve(&config.format)? {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    // A subscriber may already be installed (tests, embedding).
    if let Err(e) = installed {
        tracing::debug!("tracing already initialised: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_formats() {
        assert_eq!(LogFormat::resolve("text").unwrap(), LogFormat::Text);
        assert_eq!(LogFormat::resolve("json").unwrap(), LogFormat::Json);
        assert!(LogFormat::resolve("auto").is_ok());
        assert!(LogFormat::resolve("xml").is_err());
    }
}
