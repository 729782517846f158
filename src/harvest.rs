//! Run orchestration: wire a configured source to its stores and sink.
//!
//! `harvest run <source>` and `harvest run all` land here. Collaborators
//! are built from config once per invocation; `all` then drives every
//! enabled source in turn, and fails if any of them failed.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};

use audit_harvest_core::store::{CheckpointStore, SecretStore};
use audit_harvest_core::{HarvestError, Watermark, WatermarkKind};

use crate::aws::AwsCredentials;
use crate::config::{AwsEndpoint, Config};
use crate::driver::{self, HarvestContext, RunReport};
use crate::http;
use crate::s3::S3Bucket;
use crate::sink::{FileSink, S3Sink, Sink, StdoutSink};
use crate::source_cloudflare::{self, CloudflareAdapter, CloudflareNormalizer};
use crate::source_gsuite::{self, GsuiteAdapter, GsuiteNormalizer};
use crate::source_guardduty::{self, GuarddutyAdapter, GuarddutyNormalizer};
use crate::source_lastpass::{self, LastpassAdapter, LastpassNormalizer};
use crate::source_slack::{self, SlackAdapter, SlackNormalizer};
use crate::store_env::EnvSecretStore;
use crate::store_file::FileSecretStore;
use crate::store_s3::S3Store;
use crate::store_sqlite::SqliteCheckpointStore;
use crate::store_ssm::SsmParameterStore;

/// Options from the `run` command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    /// Raw `--since` value.
    pub since: Option<String>,
}

/// Watermark key a source reads and writes.
pub fn checkpoint_key(config: &Config, source: &str) -> Result<String> {
    let default = match source {
        "cloudflare" => source_cloudflare::DEFAULT_CHECKPOINT_KEY,
        "gsuite" => source_gsuite::DEFAULT_CHECKPOINT_KEY,
        "guardduty" => source_guardduty::DEFAULT_CHECKPOINT_KEY,
        "lastpass" => source_lastpass::DEFAULT_CHECKPOINT_KEY,
        "slack" => source_slack::DEFAULT_CHECKPOINT_KEY,
        other => bail!(
            "Unknown source: '{}'. Available: {}",
            other,
            crate::config::SOURCE_NAMES.join(", ")
        ),
    };
    Ok(config
        .source_common(source)
        .map(|c| c.checkpoint_key_or(default))
        .unwrap_or_else(|| default.to_string()))
}

/// Every bundled source keeps a timestamp watermark.
pub fn watermark_kind(_source: &str) -> WatermarkKind {
    WatermarkKind::Timestamp
}

/// Parse a `--since` / `checkpoint set` value: UNIX seconds, RFC 3339, or
/// a `YYYY-MM-DD` date (midnight UTC).
pub fn parse_watermark(kind: WatermarkKind, raw: &str) -> Result<Watermark> {
    if kind == WatermarkKind::Timestamp {
        if let Ok(date) = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
            if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                return Ok(Watermark::at(midnight.and_utc()));
            }
        }
    }
    Watermark::decode(kind, raw).with_context(|| format!("invalid watermark '{}'", raw))
}

fn aws_credentials() -> Result<AwsCredentials> {
    AwsCredentials::from_env().context("AWS credentials are required by this configuration")
}

fn s3_bucket(http: &reqwest::Client, bucket: Option<&str>, aws: &AwsEndpoint) -> Result<S3Bucket> {
    let bucket = bucket.context("an S3 bucket is required")?;
    Ok(S3Bucket::new(http.clone(), aws_credentials()?, bucket, aws))
}

pub async fn open_checkpoints(
    config: &Config,
    http: &reqwest::Client,
) -> Result<Box<dyn CheckpointStore>> {
    let cp = &config.checkpoints;
    Ok(match cp.backend.as_str() {
        "sqlite" => Box::new(SqliteCheckpointStore::open(&cp.path).await?),
        "s3" => Box::new(S3Store::new(
            s3_bucket(http, cp.bucket.as_deref(), &cp.aws)?,
            &cp.prefix,
        )),
        "ssm" => Box::new(SsmParameterStore::new(http.clone(), aws_credentials()?, &cp.aws)),
        other => bail!("unknown checkpoint backend '{}'", other),
    })
}

pub fn open_secrets(config: &Config, http: &reqwest::Client) -> Result<Box<dyn SecretStore>> {
    let sc = &config.secrets;
    Ok(match sc.backend.as_str() {
        "env" => Box::new(EnvSecretStore::new()),
        "file" => Box::new(FileSecretStore::new(
            sc.path.as_deref().context("secrets.path is required for the file backend")?,
        )),
        "ssm" => Box::new(SsmParameterStore::new(http.clone(), aws_credentials()?, &sc.aws)),
        other => bail!("unknown secrets backend '{}'", other),
    })
}

/// The configured sink. Dry runs always write to stdout.
pub async fn open_sink(
    config: &Config,
    http: &reqwest::Client,
    dry_run: bool,
) -> Result<Box<dyn Sink>> {
    let out = &config.output;
    if dry_run {
        return Ok(Box::new(StdoutSink::new()));
    }
    Ok(match out.sink.as_str() {
        "stdout" => Box::new(StdoutSink::new()),
        "file" => {
            let path = out
                .path
                .as_deref()
                .context("output.path is required for the file sink")?;
            Box::new(FileSink::open(path).await?)
        }
        "s3" => Box::new(S3Sink::new(
            s3_bucket(http, out.bucket.as_deref(), &out.aws)?,
            &out.prefix,
        )),
        other => bail!("unknown sink '{}'", other),
    })
}

/// Build the per-run context for `source`.
pub fn context(
    config: &Config,
    source: &str,
    now: DateTime<Utc>,
    opts: &RunOptions,
) -> Result<HarvestContext> {
    let common = config
        .source_common(source)
        .with_context(|| format!("source '{}' is not configured", source))?;
    let since = opts
        .since
        .as_deref()
        .map(|raw| parse_watermark(watermark_kind(source), raw))
        .transpose()?;

    Ok(HarvestContext::new(checkpoint_key(config, source)?)
        .at(now)
        .with_budget(config.harvest.run_budget())
        .with_cold_start(common.cold_start())
        .with_commit_per_page(config.harvest.commit_per_page)
        .with_rate_limit_retries(config.harvest.rate_limit_max_retries)
        .with_dry_run(opts.dry_run)
        .with_since(since))
}

/// Drive one source with already-opened collaborators.
pub async fn run_source(
    config: &Config,
    source: &str,
    http: &reqwest::Client,
    checkpoints: &dyn CheckpointStore,
    secrets: &dyn SecretStore,
    sink: &mut dyn Sink,
    ctx: &HarvestContext,
) -> Result<RunReport> {
    let sources = &config.sources;
    let not_configured = || anyhow::anyhow!("source '{}' is not configured", source);

    let report: Result<RunReport, HarvestError> = match source {
        "cloudflare" => {
            let cfg = sources.cloudflare.as_ref().ok_or_else(not_configured)?;
            let adapter = CloudflareAdapter::new(http.clone(), cfg);
            driver::run(&adapter, &CloudflareNormalizer, checkpoints, secrets, sink, ctx).await
        }
        "gsuite" => {
            let cfg = sources.gsuite.as_ref().ok_or_else(not_configured)?;
            let adapter = GsuiteAdapter::new(http.clone(), cfg);
            driver::run(&adapter, &GsuiteNormalizer, checkpoints, secrets, sink, ctx).await
        }
        "guardduty" => {
            let cfg = sources.guardduty.as_ref().ok_or_else(not_configured)?;
            let adapter = GuarddutyAdapter::new(http.clone(), aws_credentials()?, cfg);
            driver::run(&adapter, &GuarddutyNormalizer, checkpoints, secrets, sink, ctx).await
        }
        "lastpass" => {
            let cfg = sources.lastpass.as_ref().ok_or_else(not_configured)?;
            let adapter = LastpassAdapter::new(http.clone(), cfg)?;
            driver::run(&adapter, &LastpassNormalizer, checkpoints, secrets, sink, ctx).await
        }
        "slack" => {
            let cfg = sources.slack.as_ref().ok_or_else(not_configured)?;
            let adapter = SlackAdapter::new(http.clone(), cfg);
            driver::run(&adapter, &SlackNormalizer, checkpoints, secrets, sink, ctx).await
        }
        other => bail!(
            "Unknown source: '{}'. Available: {}",
            other,
            crate::config::SOURCE_NAMES.join(", ")
        ),
    };

    report.with_context(|| format!("harvest of '{}' failed", source))
}

/// `harvest run <target>`: one source, or `all` enabled sources in order.
pub async fn run(config: &Config, target: &str, opts: &RunOptions) -> Result<Vec<RunReport>> {
    let names: Vec<String> = if target == "all" {
        if opts.since.is_some() {
            bail!("--since applies to a single source, not 'all'");
        }
        let enabled = config.enabled_sources();
        if enabled.is_empty() {
            bail!("no sources are enabled in the configuration");
        }
        enabled.into_iter().map(str::to_string).collect()
    } else {
        // Unknown names fail here, before any backend is opened.
        checkpoint_key(config, target)?;
        vec![target.to_string()]
    };

    let http = http::client(config.harvest.request_timeout())?;
    let checkpoints = open_checkpoints(config, &http).await?;
    let secrets = open_secrets(config, &http)?;
    let mut sink = open_sink(config, &http, opts.dry_run).await?;

    let mut reports = Vec::new();
    let mut failed = Vec::new();
    for name in &names {
        let outcome = match context(config, name, Utc::now(), opts) {
            Ok(ctx) => {
                run_source(
                    config,
                    name,
                    &http,
                    checkpoints.as_ref(),
                    secrets.as_ref(),
                    sink.as_mut(),
                    &ctx,
                )
                .await
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(report) => reports.push(report),
            Err(e) if names.len() > 1 => {
                tracing::error!(source = %name, error = %format!("{:#}", e), "harvest failed");
                failed.push(name.clone());
            }
            Err(e) => return Err(e),
        }
    }

    if !failed.is_empty() {
        bail!("{} of {} sources failed: {}", failed.len(), names.len(), failed.join(", "));
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn watermark_values_accept_dates() {
        let w = parse_watermark(WatermarkKind::Timestamp, "2024-03-01").unwrap();
        assert_eq!(
            w,
            Watermark::Timestamp(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
        );
        let w = parse_watermark(WatermarkKind::Timestamp, "1700000000").unwrap();
        assert_eq!(w.encode(), "1700000000");
        assert!(parse_watermark(WatermarkKind::Timestamp, "soon").is_err());
    }

    #[test]
    fn checkpoint_keys_follow_config() {
        let mut config = Config::minimal();
        assert_eq!(checkpoint_key(&config, "slack").unwrap(), "slack-timestamp");
        assert_eq!(
            checkpoint_key(&config, "cloudflare").unwrap(),
            "/cloudflare/last"
        );
        config.sources.slack = Some(crate::config::SlackConfig {
            common: crate::config::SourceCommon {
                checkpoint_key: Some("/team/slack".into()),
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(checkpoint_key(&config, "slack").unwrap(), "/team/slack");
        assert!(checkpoint_key(&config, "jira").is_err());
    }

    #[test]
    fn context_requires_a_configured_source() {
        let config = Config::minimal();
        let err = context(&config, "slack", Utc::now(), &RunOptions::default()).unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }
}
