//! # Audit Harvest
//!
//! Incremental audit-log harvesters with durable watermarks and
//! at-least-once delivery.
//!
//! Each run loads a source's watermark, pages through everything the
//! provider recorded since, normalizes the records into flat JSON lines,
//! hands them to a sink and only then advances the watermark. A run that
//! fails anywhere leaves the watermark where it was, so the next run
//! repeats the work instead of losing it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌────────────┐
//! │  Providers   │──▶│    Driver    │──▶│    Sink    │
//! │ CF/GWS/GD/.. │   │ pages+dedup  │   │ stdout/... │
//! └──────────────┘   └──────┬───────┘   └────────────┘
//!                           │ after flush
//!                           ▼
//!                    ┌──────────────┐
//!                    │ Checkpoints  │
//!                    │ SQLite/S3/SSM│
//!                    └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest init                  # create checkpoint database
//! harvest sources               # show sources and watermarks
//! harvest run slack             # pull new Slack access logs
//! harvest run all               # every enabled source
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`driver`] | The generic harvest loop |
//! | [`adapter`] | Source adapter and normalizer traits |
//! | [`harvest`] | Wiring config to stores, sinks and adapters |
//! | [`source_cloudflare`] | Cloudflare firewall events |
//! | [`source_gsuite`] | Google Workspace login activity |
//! | [`source_guardduty`] | AWS GuardDuty findings |
//! | [`source_lastpass`] | LastPass Enterprise reporting |
//! | [`source_slack`] | Slack team access logs |
//! | [`sink`] | Record sinks |
//! | [`store_sqlite`], [`store_s3`], [`store_ssm`] | Checkpoint backends |
//! | [`store_env`], [`store_file`] | Secret backends |
//! | [`aws`] | SigV4 request signing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod adapter;
pub mod aws;
pub mod config;
pub mod credential;
pub mod db;
pub mod driver;
pub mod harvest;
pub mod http;
pub mod logging;
pub mod migrate;
pub mod s3;
pub mod sink;
pub mod source_cloudflare;
pub mod source_gsuite;
pub mod source_guardduty;
pub mod source_lastpass;
pub mod source_slack;
pub mod sources;
pub mod store_env;
pub mod store_file;
pub mod store_s3;
pub mod store_sqlite;
pub mod store_ssm;

pub use adapter::{Normalizer, SourceAdapter};
pub use driver::{run, HarvestContext, RunOutcome, RunReport};
pub use sink::Sink;
