//! TOML configuration.
//!
//! ```toml
//! [harvest]
//! max_run_secs = 240
//! request_timeout_secs = 10
//!
//! [checkpoints]
//! backend = "sqlite"            # sqlite | s3 | ssm
//! path = "./data/checkpoints.sqlite"
//!
//! [secrets]
//! backend = "ssm"               # env | file | ssm
//! region = "us-east-1"
//!
//! [output]
//! sink = "stdout"               # stdout | file | s3
//!
//! [sources.cloudflare]
//! credential_name = "/cloudflare"
//! checkpoint_key = "/cloudflare/last"
//! window_cap_seconds = 86399
//! ```
//!
//! Every `[sources.<name>]` table shares the options in [`SourceCommon`];
//! the rest are provider specific.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use audit_harvest_core::ColdStart;

use crate::source_cloudflare::MAX_RECORD_CAP;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub checkpoints: CheckpointsConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HarvestConfig {
    /// Wall-clock budget for one run. The driver stops between pages once spent.
    #[serde(default = "default_max_run_secs")]
    pub max_run_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_rate_limit_max_retries")]
    pub rate_limit_max_retries: u32,
    #[serde(default)]
    pub commit_per_page: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            max_run_secs: default_max_run_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            rate_limit_max_retries: default_rate_limit_max_retries(),
            commit_per_page: false,
        }
    }
}

fn default_max_run_secs() -> u64 {
    240
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_rate_limit_max_retries() -> u32 {
    3
}

impl HarvestConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn run_budget(&self) -> Duration {
        Duration::from_secs(self.max_run_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text`, `json`, or `auto` (text on a TTY, JSON otherwise).
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "auto".to_string()
}

/// Connection details for an AWS-backed store.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AwsEndpoint {
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint (LocalStack, MinIO).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl AwsEndpoint {
    pub fn region(&self) -> String {
        self.region
            .clone()
            .or_else(|| std::env::var("AWS_REGION").ok())
            .unwrap_or_else(|| "us-east-1".to_string())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckpointsConfig {
    #[serde(default = "default_checkpoint_backend")]
    pub backend: String,
    /// SQLite database path (`sqlite` backend).
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,
    /// Bucket holding one object per checkpoint key (`s3` backend).
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub prefix: String,
    #[serde(flatten)]
    pub aws: AwsEndpoint,
}

impl Default for CheckpointsConfig {
    fn default() -> Self {
        Self {
            backend: default_checkpoint_backend(),
            path: default_checkpoint_path(),
            bucket: None,
            prefix: String::new(),
            aws: AwsEndpoint::default(),
        }
    }
}

fn default_checkpoint_backend() -> String {
    "sqlite".to_string()
}
fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("./data/checkpoints.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecretsConfig {
    #[serde(default = "default_secrets_backend")]
    pub backend: String,
    /// JSON file of `name -> value` (`file` backend).
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(flatten)]
    pub aws: AwsEndpoint,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            backend: default_secrets_backend(),
            path: None,
            aws: AwsEndpoint::default(),
        }
    }
}

fn default_secrets_backend() -> String {
    "env".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_sink")]
    pub sink: String,
    /// JSONL file (`file` sink).
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Bucket receiving one object per run (`s3` sink).
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_output_prefix")]
    pub prefix: String,
    #[serde(flatten)]
    pub aws: AwsEndpoint,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sink: default_sink(),
            path: None,
            bucket: None,
            prefix: default_output_prefix(),
            aws: AwsEndpoint::default(),
        }
    }
}

fn default_sink() -> String {
    "stdout".to_string()
}
fn default_output_prefix() -> String {
    "harvest-logs".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub cloudflare: Option<CloudflareConfig>,
    #[serde(default)]
    pub gsuite: Option<GsuiteConfig>,
    #[serde(default)]
    pub guardduty: Option<GuarddutyConfig>,
    #[serde(default)]
    pub lastpass: Option<LastpassConfig>,
    #[serde(default)]
    pub slack: Option<SlackConfig>,
}

/// Options every source understands.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceCommon {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Which secret (or secret prefix) to fetch.
    #[serde(default)]
    pub credential_name: Option<String>,
    /// Which watermark to use.
    #[serde(default)]
    pub checkpoint_key: Option<String>,
    /// Maximum query span. Only windowed sources (`cloudflare`) accept it.
    #[serde(default)]
    pub window_cap_seconds: Option<u64>,
    /// Resume this far in the past when no checkpoint exists. `0` means now.
    #[serde(default)]
    pub cold_start_lookback_secs: u64,
    #[serde(default)]
    pub rate_limit_cooldown_secs: Option<u64>,
    /// Override the provider's API base URL (proxies, tests).
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for SourceCommon {
    fn default() -> Self {
        Self {
            enabled: true,
            credential_name: None,
            checkpoint_key: None,
            window_cap_seconds: None,
            cold_start_lookback_secs: 0,
            rate_limit_cooldown_secs: None,
            base_url: None,
        }
    }
}

fn default_true() -> bool {
    true
}

impl SourceCommon {
    pub fn credential_name_or(&self, default: &str) -> String {
        self.credential_name
            .clone()
            .unwrap_or_else(|| default.to_string())
    }

    pub fn checkpoint_key_or(&self, default: &str) -> String {
        self.checkpoint_key
            .clone()
            .unwrap_or_else(|| default.to_string())
    }

    pub fn base_url_or(&self, default: &str) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| default.to_string())
            .trim_end_matches('/')
            .to_string()
    }

    pub fn cooldown_or(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs.unwrap_or(default_secs))
    }

    pub fn cold_start(&self) -> ColdStart {
        if self.cold_start_lookback_secs == 0 {
            ColdStart::Now
        } else {
            ColdStart::Lookback(Duration::from_secs(self.cold_start_lookback_secs))
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CloudflareConfig {
    #[serde(flatten)]
    pub common: SourceCommon,
    #[serde(default)]
    pub safety_margin_secs: Option<u64>,
    #[serde(default)]
    pub record_cap: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GsuiteConfig {
    #[serde(flatten)]
    pub common: SourceCommon,
    /// Secret holding the OAuth client configuration JSON.
    #[serde(default)]
    pub client_config_name: Option<String>,
    #[serde(default)]
    pub application: Option<String>,
    #[serde(default)]
    pub max_results: Option<u32>,
    /// Most report pages one run will drain before failing.
    #[serde(default)]
    pub max_pages: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GuarddutyConfig {
    #[serde(flatten)]
    pub common: SourceCommon,
    #[serde(default)]
    pub detector_id: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LastpassConfig {
    #[serde(flatten)]
    pub common: SourceCommon,
    /// Enterprise account number (`cid`).
    #[serde(default)]
    pub account_id: String,
    /// IANA zone the reporting API expects timestamps in.
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SlackConfig {
    #[serde(flatten)]
    pub common: SourceCommon,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub page_delay_ms: Option<u64>,
}

/// Names accepted by `harvest run <source>`.
pub const SOURCE_NAMES: [&str; 5] = ["cloudflare", "gsuite", "guardduty", "lastpass", "slack"];

/// Sources that query by time window and honour `window_cap_seconds`.
pub const WINDOWED_SOURCES: [&str; 1] = ["cloudflare"];

impl Config {
    /// Defaults only; used by commands that run without a config file.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Names of sources that have a config table, in a stable order.
    pub fn configured_sources(&self) -> Vec<&'static str> {
        SOURCE_NAMES
            .iter()
            .copied()
            .filter(|name| self.source_common(name).is_some())
            .collect()
    }

    /// Names of configured sources with `enabled = true`.
    pub fn enabled_sources(&self) -> Vec<&'static str> {
        self.configured_sources()
            .into_iter()
            .filter(|name| self.source_common(name).map(|c| c.enabled).unwrap_or(false))
            .collect()
    }

    pub fn source_common(&self, name: &str) -> Option<&SourceCommon> {
        match name {
            "cloudflare" => self.sources.cloudflare.as_ref().map(|c| &c.common),
            "gsuite" => self.sources.gsuite.as_ref().map(|c| &c.common),
            "guardduty" => self.sources.guardduty.as_ref().map(|c| &c.common),
            "lastpass" => self.sources.lastpass.as_ref().map(|c| &c.common),
            "slack" => self.sources.slack.as_ref().map(|c| &c.common),
            _ => None,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.harvest.max_run_secs == 0 {
        bail!("harvest.max_run_secs must be > 0");
    }
    if config.harvest.request_timeout_secs == 0 {
        bail!("harvest.request_timeout_secs must be > 0");
    }

    match config.logging.format.as_str() {
        "auto" | "text" | "json" => {}
        other => bail!(
            "Unknown logging.format: '{}'. Must be auto, text, or json.",
            other
        ),
    }

    match config.checkpoints.backend.as_str() {
        "sqlite" | "ssm" => {}
        "s3" => {
            if config.checkpoints.bucket.is_none() {
                bail!("checkpoints.bucket must be set when backend is 's3'");
            }
        }
        other => bail!(
            "Unknown checkpoints.backend: '{}'. Must be sqlite, s3, or ssm.",
            other
        ),
    }

    match config.secrets.backend.as_str() {
        "env" | "ssm" => {}
        "file" => {
            if config.secrets.path.is_none() {
                bail!("secrets.path must be set when backend is 'file'");
            }
        }
        other => bail!(
            "Unknown secrets.backend: '{}'. Must be env, file, or ssm.",
            other
        ),
    }

    match config.output.sink.as_str() {
        "stdout" => {}
        "file" => {
            if config.output.path.is_none() {
                bail!("output.path must be set when sink is 'file'");
            }
        }
        "s3" => {
            if config.output.bucket.is_none() {
                bail!("output.bucket must be set when sink is 's3'");
            }
        }
        other => bail!(
            "Unknown output.sink: '{}'. Must be stdout, file, or s3.",
            other
        ),
    }

    for name in config.configured_sources() {
        if let Some(cap) = config.source_common(name).and_then(|c| c.window_cap_seconds) {
            if !WINDOWED_SOURCES.contains(&name) {
                bail!(
                    "sources.{}.window_cap_seconds is not supported: '{}' does not query by window",
                    name,
                    name
                );
            }
            if cap == 0 {
                bail!("sources.{}.window_cap_seconds must be > 0", name);
            }
        }
    }

    if let Some(cf) = &config.sources.cloudflare {
        match cf.record_cap {
            Some(0) => bail!("sources.cloudflare.record_cap must be > 0"),
            Some(cap) if cap > MAX_RECORD_CAP => bail!(
                "sources.cloudflare.record_cap must be <= {}",
                MAX_RECORD_CAP
            ),
            _ => {}
        }
    }

    if let Some(gs) = &config.sources.gsuite {
        if gs.max_pages == Some(0) {
            bail!("sources.gsuite.max_pages must be > 0");
        }
    }

    if let Some(gd) = &config.sources.guardduty {
        if gd.detector_id.trim().is_empty() {
            bail!("sources.guardduty.detector_id must be set");
        }
    }

    if let Some(lp) = &config.sources.lastpass {
        if lp.account_id.trim().is_empty() {
            bail!("sources.lastpass.account_id must be set");
        }
        if let Some(tz) = &lp.timezone {
            if tz.parse::<chrono_tz::Tz>().is_err() {
                bail!("sources.lastpass.timezone '{}' is not a known IANA zone", tz);
            }
        }
    }

    Ok(())
}
