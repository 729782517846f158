//! # Audit Harvest Core
//!
//! Shared, runtime-free logic for Audit Harvest: watermarks, query windows,
//! normalized records, the page model that source adapters speak, the error
//! taxonomy, and the checkpoint/secret store abstractions.
//!
//! This crate contains no tokio, HTTP, or filesystem I/O. Everything that
//! talks to a provider or a persistence backend lives in the `audit-harvest`
//! crate and is written against the types defined here.

pub mod error;
pub mod page;
pub mod record;
pub mod store;
pub mod watermark;
pub mod window;

pub use error::HarvestError;
pub use page::{PageOrder, PageRequest, PageResult, Pagination, RateLimitHint};
pub use record::{NormalizedRecord, Record, RecordBuilder};
pub use watermark::{ColdStart, Watermark, WatermarkKind};
pub use window::QueryWindow;
