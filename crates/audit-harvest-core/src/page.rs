//! The page model spoken between the driver and source adapters.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::watermark::Watermark;
use crate::window::QueryWindow;

/// Order in which a provider returns records across pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOrder {
    /// Oldest first. Stale records are skipped and the walk continues.
    Ascending,
    /// Newest first. The first record older than the watermark ends the walk.
    Descending,
}

/// How a source is paged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    /// One request per bounded time window, at most `record_cap` records each.
    Window {
        max_span: Option<Duration>,
        record_cap: usize,
        safety_margin: Duration,
    },
    /// Provider continuation: page numbers or opaque tokens.
    Cursor,
}

/// Provider-declared throttling behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHint {
    /// Sleep applied after a rate-limit signal before retrying the request.
    pub cooldown: Duration,
    /// Pause between consecutive page requests.
    pub min_interval: Duration,
}

impl Default for RateLimitHint {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(30),
            min_interval: Duration::ZERO,
        }
    }
}

/// One request for the next page.
#[derive(Debug, Clone)]
pub struct PageRequest {
    /// Watermark loaded at run start.
    pub watermark: Watermark,
    /// Instant the run started; providers that need an upper bound use it.
    pub as_of: DateTime<Utc>,
    /// Query range, for windowed sources.
    pub window: Option<QueryWindow>,
    /// Continuation returned by the previous page (or the stored cursor).
    pub cursor: Option<String>,
    /// 1-based page counter within the current run.
    pub page_number: u32,
}

/// Records and pagination metadata for one page.
#[derive(Debug, Clone)]
pub struct PageResult<R> {
    pub records: Vec<R>,
    /// Continuation for the next page; `None` means no more pages.
    pub next_cursor: Option<String>,
    /// Total page count, when the provider reports it.
    pub total_pages: Option<u32>,
    /// Cursor a cursor-watermark source should resume from next run. Such a
    /// source must set it on any page whose records it wants committed; the
    /// driver refuses to commit records no resume cursor covers.
    pub resume_cursor: Option<String>,
    /// Records the adapter dropped itself (out of window, unparseable time).
    pub skipped: usize,
}

impl<R> PageResult<R> {
    /// A final page with the given records.
    pub fn last(records: Vec<R>) -> Self {
        Self {
            records,
            next_cursor: None,
            total_pages: None,
            resume_cursor: None,
            skipped: 0,
        }
    }

    /// An empty final page.
    pub fn empty() -> Self {
        Self::last(Vec::new())
    }

    pub fn with_next(mut self, next: Option<String>) -> Self {
        self.next_cursor = next;
        self
    }

    pub fn with_total_pages(mut self, total: u32) -> Self {
        self.total_pages = Some(total);
        self
    }

    pub fn with_resume_cursor(mut self, cursor: Option<String>) -> Self {
        self.resume_cursor = cursor;
        self
    }

    pub fn with_skipped(mut self, skipped: usize) -> Self {
        self.skipped = skipped;
        self
    }

    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }
}
