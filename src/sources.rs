//! `harvest sources` and `harvest checkpoint get|set`.

use anyhow::{Context, Result};

use audit_harvest_core::Watermark;

use crate::config::{Config, SOURCE_NAMES};
use crate::harvest;
use crate::http;

fn describe(value: Option<&str>, source: &str) -> String {
    match value {
        None => "-".to_string(),
        Some(raw) => match Watermark::decode(harvest::watermark_kind(source), raw) {
            Ok(w @ Watermark::Timestamp(_)) => format!("{} ({})", raw.trim(), w),
            _ => raw.trim().to_string(),
        },
    }
}

pub async fn list_sources(config: &Config) -> Result<()> {
    let http = http::client(config.harvest.request_timeout())?;
    let checkpoints = harvest::open_checkpoints(config, &http).await?;

    println!("{:<12} {:<10} {:<26} WATERMARK", "SOURCE", "STATUS", "CHECKPOINT");
    for name in SOURCE_NAMES {
        let status = match config.source_common(name) {
            Some(c) if c.enabled => "enabled",
            Some(_) => "disabled",
            None => "-",
        };
        let key = harvest::checkpoint_key(config, name)?;
        let value = if config.source_common(name).is_some() {
            checkpoints.get_watermark(&key).await?
        } else {
            None
        };
        println!(
            "{:<12} {:<10} {:<26} {}",
            name,
            status,
            key,
            describe(value.as_deref(), name)
        );
    }
    Ok(())
}

pub async fn get_checkpoint(config: &Config, source: &str) -> Result<()> {
    let key = harvest::checkpoint_key(config, source)?;
    let http = http::client(config.harvest.request_timeout())?;
    let checkpoints = harvest::open_checkpoints(config, &http).await?;

    match checkpoints.get_watermark(&key).await? {
        Some(value) => println!("{}", describe(Some(&value), source)),
        None => println!("{}: no checkpoint stored under '{}'", source, key),
    }
    Ok(())
}

/// Overwrite a watermark by hand. The value is validated and stored in
/// canonical form.
pub async fn set_checkpoint(config: &Config, source: &str, value: &str) -> Result<()> {
    let key = harvest::checkpoint_key(config, source)?;
    let watermark = harvest::parse_watermark(harvest::watermark_kind(source), value)?;
    let http = http::client(config.harvest.request_timeout())?;
    let checkpoints = harvest::open_checkpoints(config, &http).await?;

    checkpoints
        .put_watermark(&key, &watermark.encode())
        .await
        .with_context(|| format!("failed to write checkpoint '{}'", key))?;
    println!("{} -> {}", key, watermark);
    Ok(())
}
