//! # Audit Harvest CLI (`harvest`)
//!
//! The `harvest` binary pulls new audit-log records from SaaS and cloud
//! providers, writes them as newline-delimited JSON and advances a durable
//! watermark per source once the records are safely out.
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest init` | Create the SQLite checkpoint database |
//! | `harvest sources` | List sources, their status and stored watermarks |
//! | `harvest run <source>` | Harvest one source (`cloudflare`, `gsuite`, `guardduty`, `lastpass`, `slack`) |
//! | `harvest run all` | Harvest every enabled source in turn |
//! | `harvest checkpoint get <source>` | Print a stored watermark |
//! | `harvest checkpoint set <source> <value>` | Overwrite a stored watermark |
//! | `harvest normalize guardduty [--input <file>]` | Normalize one GuardDuty EventBridge event |
//!
//! ## Examples
//!
//! ```bash
//! # Create the checkpoint database
//! harvest init --config ./config/harvest.toml
//!
//! # Pull new Slack access logs to stdout
//! harvest run slack
//!
//! # Re-read the last day of Cloudflare events without moving the watermark
//! harvest run cloudflare --dry-run --since 2024-03-01
//!
//! # Normalize a finding delivered by EventBridge
//! harvest normalize guardduty < event.json
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use audit_harvest::harvest::RunOptions;
use audit_harvest::{config, harvest, logging, migrate, source_guardduty, sources};

/// Audit Harvest: incremental audit-log collection with durable watermarks.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harvest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Audit Harvest: incremental audit-log harvesters with at-least-once delivery",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the checkpoint database. Safe to run repeatedly.
    Init,

    /// List sources with their status and stored watermark.
    Sources,

    /// Harvest new records from a source.
    ///
    /// Records go to the configured sink as JSON lines; the watermark is
    /// written only after the sink accepted them.
    Run {
        /// Source name, or `all` for every enabled source.
        source: String,

        /// Emit to stdout and leave the stored watermark untouched.
        #[arg(long)]
        dry_run: bool,

        /// Start from this point instead of the stored watermark
        /// (UNIX seconds, RFC 3339, or YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,
    },

    /// Inspect or overwrite stored watermarks.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Normalize provider events delivered by other means.
    Normalize {
        #[command(subcommand)]
        source: NormalizeSource,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print the stored watermark of a source.
    Get { source: String },
    /// Overwrite the stored watermark of a source.
    Set { source: String, value: String },
}

#[derive(Subcommand)]
enum NormalizeSource {
    /// Read one EventBridge GuardDuty event and print its normalized lines.
    Guardduty {
        /// Event file; stdin when omitted.
        #[arg(long)]
        input: Option<PathBuf>,
    },
}

/// Read one event from `input` (or stdin) and print its normalized lines.
fn normalize_guardduty(input: Option<&Path>) -> anyhow::Result<()> {
    let raw = match input {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    for record in source_guardduty::normalize_event(&raw)? {
        println!("{}", record.to_json_line()?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Normalizing a single event works without a config file.
    let cfg = match &cli.command {
        Commands::Normalize { .. } => {
            config::load_config(&cli.config).unwrap_or_else(|_| config::Config::minimal())
        }
        _ => config::load_config(&cli.config)?,
    };
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("initialized {}", cfg.checkpoints.path.display());
        }
        Commands::Sources => {
            sources::list_sources(&cfg).await?;
        }
        Commands::Run {
            source,
            dry_run,
            since,
        } => {
            let opts = RunOptions { dry_run, since };
            harvest::run(&cfg, &source, &opts).await?;
        }
        Commands::Checkpoint { action } => match action {
            CheckpointAction::Get { source } => {
                sources::get_checkpoint(&cfg, &source).await?;
            }
            CheckpointAction::Set { source, value } => {
                sources::set_checkpoint(&cfg, &source, &value).await?;
            }
        },
        Commands::Normalize {
            source: NormalizeSource::Guardduty { input },
        } => {
            normalize_guardduty(input.as_deref())?;
        }
    }

    Ok(())
}
