//! The harvest driver: one generic control loop for every source.
//!
//! ```text
//! load watermark ──▶ resolve credentials ──▶ ┌─ fetch page (retry on 429) ─┐
//!                                            │  skip stale / duplicates    │
//!                                            │  normalize + emit           │
//!                                            └─ next window / cursor ──────┘
//!                                                        │
//!                                   flush sink ──▶ commit watermark
//! ```
//!
//! # Watermark semantics
//!
//! A timestamp watermark `W` is the first instant not yet harvested. A
//! record is emitted iff its timestamp is `>= W`; older records are stale.
//! Ascending sources skip stale records and continue; descending sources
//! stop at the first stale record. After a drained run the new watermark is
//! one second past the latest emitted record.
//!
//! # Delivery
//!
//! The watermark is written only after every emission of the run (or of the
//! page, with `commit_per_page`) succeeded and the sink was flushed. Any
//! failure returns an error and leaves the stored watermark untouched, so
//! the next run re-fetches and re-emits: at-least-once delivery.
//!
//! # Record caps
//!
//! A windowed page holding `record_cap` records or more is presumed
//! truncated. The next window re-opens *at* the last record's second and
//! drops records at that second whose dedup key was already emitted. A full
//! page that makes no progress (every record shares the window start) is
//! logged as truncated and the window moves forward one second.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use audit_harvest_core::store::{CheckpointStore, SecretStore};
use audit_harvest_core::{
    ColdStart, HarvestError, PageOrder, PageRequest, PageResult, Pagination, QueryWindow, Record,
    Watermark,
};

use crate::adapter::{Normalizer, SourceAdapter};
use crate::credential::{self, Credential};
use crate::sink::Sink;

/// Longest body excerpt logged for a parse failure.
const PARSE_BODY_LOG_LIMIT: usize = 2048;

/// Per-run settings, built once and passed down.
#[derive(Debug, Clone)]
pub struct HarvestContext {
    pub checkpoint_key: String,
    /// Instant the run started. Windows and cold starts are computed from it.
    pub now: DateTime<Utc>,
    pub budget: Duration,
    pub cold_start: ColdStart,
    pub commit_per_page: bool,
    pub dry_run: bool,
    /// Start from this watermark instead of the stored one.
    pub since: Option<Watermark>,
    pub rate_limit_max_retries: u32,
}

impl HarvestContext {
    pub fn new(checkpoint_key: impl Into<String>) -> Self {
        Self {
            checkpoint_key: checkpoint_key.into(),
            now: Utc::now(),
            budget: Duration::from_secs(240),
            cold_start: ColdStart::Now,
            commit_per_page: false,
            dry_run: false,
            since: None,
            rate_limit_max_retries: 3,
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_cold_start(mut self, cold_start: ColdStart) -> Self {
        self.cold_start = cold_start;
        self
    }

    pub fn with_commit_per_page(mut self, on: bool) -> Self {
        self.commit_per_page = on;
        self
    }

    pub fn with_dry_run(mut self, on: bool) -> Self {
        self.dry_run = on;
        self
    }

    pub fn with_since(mut self, since: Option<Watermark>) -> Self {
        self.since = since;
        self
    }

    pub fn with_rate_limit_retries(mut self, n: u32) -> Self {
        self.rate_limit_max_retries = n;
        self
    }
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Pagination finished and at least one record was emitted.
    Completed,
    /// Pagination finished without emitting anything.
    NoData,
    /// The query window was narrower than one second; nothing was fetched.
    DegenerateWindow,
    /// The run budget ran out between pages.
    DeadlineReached,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::NoData => "no_data",
            RunOutcome::DegenerateWindow => "degenerate_window",
            RunOutcome::DeadlineReached => "deadline_reached",
        }
    }
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub source: String,
    /// Normalized records written to the sink.
    pub emitted: usize,
    pub pages: u32,
    pub skipped_stale: usize,
    pub skipped_duplicate: usize,
    pub skipped_by_adapter: usize,
    pub rate_limited: u32,
    /// Stored watermark at run start, if any.
    pub previous: Option<Watermark>,
    /// Watermark after the run (committed or not).
    pub watermark: Watermark,
    pub committed: bool,
    pub outcome: RunOutcome,
}

/// Run one harvest of `adapter` into `sink`.
pub async fn run<A, N>(
    adapter: &A,
    normalizer: &N,
    checkpoints: &dyn CheckpointStore,
    secrets: &dyn SecretStore,
    sink: &mut dyn Sink,
    ctx: &HarvestContext,
) -> Result<RunReport, HarvestError>
where
    A: SourceAdapter,
    N: Normalizer<A::Record>,
{
    let kind = adapter.watermark_kind();
    let previous = match checkpoints.get_watermark(&ctx.checkpoint_key).await? {
        Some(raw) if !raw.trim().is_empty() => Some(Watermark::decode(kind, &raw)?),
        _ => None,
    };

    let start = match (&ctx.since, &previous) {
        (Some(since), _) => {
            if since.kind() != kind {
                return Err(HarvestError::Config(format!(
                    "--since does not match the {:?} watermark of '{}'",
                    kind,
                    adapter.name()
                )));
            }
            since.clone()
        }
        (None, Some(stored)) => stored.clone(),
        (None, None) => {
            let w = ctx.cold_start.resolve(kind, ctx.now);
            info!(source = adapter.name(), watermark = %w, "no checkpoint, cold start");
            w
        }
    };

    let credential = credential::resolve(secrets, &adapter.secrets()).await?;

    let mut walk = Walk {
        adapter,
        normalizer,
        checkpoints,
        secrets,
        sink,
        ctx,
        credential,
        started: Instant::now(),
        last_fetch: None,
        start: start.clone(),
        committed_value: previous.as_ref().map(Watermark::encode),
        emitted: 0,
        pages: 0,
        skipped_stale: 0,
        skipped_duplicate: 0,
        skipped_by_adapter: 0,
        rate_limited: 0,
        committed: false,
    };

    info!(
        source = adapter.name(),
        watermark = %start,
        dry_run = ctx.dry_run,
        "harvest starting"
    );

    let (outcome, watermark, commit) = match (adapter.pagination(), &start) {
        (
            Pagination::Window {
                max_span,
                record_cap,
                safety_margin,
            },
            Watermark::Timestamp(from),
        ) => {
            walk.windowed(*from, max_span, record_cap.max(1), safety_margin)
                .await?
        }
        (Pagination::Window { .. }, Watermark::Cursor(_)) => {
            return Err(HarvestError::Config(format!(
                "source '{}' is windowed but declares a cursor watermark",
                adapter.name()
            )));
        }
        (Pagination::Cursor, _) => walk.paged().await?,
    };

    // A cold start always pins its starting point.
    if commit || previous.is_none() {
        walk.commit(&watermark).await?;
    } else {
        walk.sink.flush().await?;
    }

    let report = RunReport {
        source: adapter.name().to_string(),
        emitted: walk.emitted,
        pages: walk.pages,
        skipped_stale: walk.skipped_stale,
        skipped_duplicate: walk.skipped_duplicate,
        skipped_by_adapter: walk.skipped_by_adapter,
        rate_limited: walk.rate_limited,
        previous,
        watermark,
        committed: walk.committed,
        outcome,
    };

    info!(
        source = %report.source,
        emitted = report.emitted,
        pages = report.pages,
        skipped_stale = report.skipped_stale,
        skipped_duplicate = report.skipped_duplicate,
        skipped_by_adapter = report.skipped_by_adapter,
        rate_limited = report.rate_limited,
        previous = %report
            .previous
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "<none>".to_string()),
        watermark = %report.watermark,
        committed = report.committed,
        outcome = report.outcome.as_str(),
        "harvest finished"
    );

    Ok(report)
}

fn whole_second(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.timestamp(), 0).single().unwrap_or(ts)
}

/// Mutable state of one run.
struct Walk<'a, A: SourceAdapter, N> {
    adapter: &'a A,
    normalizer: &'a N,
    checkpoints: &'a dyn CheckpointStore,
    secrets: &'a dyn SecretStore,
    sink: &'a mut dyn Sink,
    ctx: &'a HarvestContext,
    credential: Credential,
    started: Instant,
    last_fetch: Option<Instant>,
    start: Watermark,
    /// Encoded value currently in the store (as far as this run knows).
    committed_value: Option<String>,
    emitted: usize,
    pages: u32,
    skipped_stale: usize,
    skipped_duplicate: usize,
    skipped_by_adapter: usize,
    rate_limited: u32,
    committed: bool,
}

impl<'a, A, N> Walk<'a, A, N>
where
    A: SourceAdapter,
    N: Normalizer<A::Record>,
{
    fn out_of_time(&self) -> bool {
        self.pages > 0 && self.started.elapsed() >= self.ctx.budget
    }

    // ═══════════════════════════════════════════════════════════════════
    // Windowed sources
    // ═══════════════════════════════════════════════════════════════════

    async fn windowed(
        &mut self,
        mut from: DateTime<Utc>,
        max_span: Option<Duration>,
        record_cap: usize,
        safety_margin: Duration,
    ) -> Result<(RunOutcome, Watermark, bool), HarvestError> {
        // Dedup keys emitted at the second `from` was re-opened at.
        let mut seen_at_from: HashSet<String> = HashSet::new();
        let mut progress = from;

        loop {
            if self.out_of_time() {
                warn!(source = self.adapter.name(), "run budget spent, stopping between windows");
                return Ok((
                    RunOutcome::DeadlineReached,
                    Watermark::at(progress),
                    true,
                ));
            }

            let window = QueryWindow::compute(from, self.ctx.now, max_span, safety_margin);
            if window.is_degenerate() {
                debug!(source = self.adapter.name(), from = %window.from, to = %window.to, "degenerate window");
                let outcome = if self.pages == 0 {
                    RunOutcome::DegenerateWindow
                } else {
                    self.finished_outcome()
                };
                return Ok((outcome, Watermark::at(progress), true));
            }

            let request = PageRequest {
                watermark: Watermark::at(from),
                as_of: self.ctx.now,
                window: Some(window),
                cursor: None,
                page_number: self.pages + 1,
            };
            let page = self.fetch(&request).await?;
            let full = page.records.len() >= record_cap;
            let fetched = page.records.len();

            let mut latest: Option<DateTime<Utc>> = None;
            let mut keys_at_latest: HashSet<String> = HashSet::new();

            for record in &page.records {
                let ts = whole_second(record.timestamp());
                if ts < from {
                    self.skipped_stale += 1;
                    continue;
                }
                let key = record.dedup_key();
                if ts == from {
                    if let Some(ref k) = key {
                        if seen_at_from.contains(k) {
                            self.skipped_duplicate += 1;
                            continue;
                        }
                    }
                }

                self.emit(record).await?;

                match latest {
                    Some(l) if ts < l => {}
                    Some(l) if ts == l => {
                        if let Some(k) = key {
                            keys_at_latest.insert(k);
                        }
                    }
                    _ => {
                        latest = Some(ts);
                        keys_at_latest.clear();
                        if let Some(k) = key {
                            keys_at_latest.insert(k);
                        }
                    }
                }
            }

            if full {
                match latest {
                    Some(last) if last > from => {
                        debug!(
                            source = self.adapter.name(),
                            records = fetched,
                            reopen_at = %last,
                            "record cap reached, re-windowing"
                        );
                        from = last;
                        seen_at_from = keys_at_latest;
                    }
                    _ => {
                        warn!(
                            source = self.adapter.name(),
                            at = %from,
                            records = fetched,
                            "record cap reached within one second, results may be truncated"
                        );
                        from += chrono::Duration::seconds(1);
                        seen_at_from.clear();
                    }
                }
                progress = from;
            } else if window.clamped {
                from = window.next_start();
                seen_at_from.clear();
                progress = from;
            } else {
                // Records at a re-opened `from` were emitted by an earlier window.
                let emitted_through = latest.or_else(|| (!seen_at_from.is_empty()).then_some(from));
                if let Some(last) = emitted_through {
                    progress = progress.max(last + chrono::Duration::seconds(1));
                }
                return Ok((self.finished_outcome(), Watermark::at(progress), true));
            }

            self.commit_progress(&Watermark::at(progress)).await?;
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Cursor-paged sources
    // ═══════════════════════════════════════════════════════════════════

    async fn paged(&mut self) -> Result<(RunOutcome, Watermark, bool), HarvestError> {
        let order = self.adapter.order();
        let floor = self.start.as_timestamp();
        let mut cursor: Option<String> = self.start.as_cursor().map(str::to_string);
        let mut resume: Option<String> = None;
        // Records emitted on pages no resume cursor covers yet.
        let mut uncovered = 0usize;
        let mut latest: Option<DateTime<Utc>> = None;

        loop {
            if self.out_of_time() {
                warn!(source = self.adapter.name(), "run budget spent, stopping between pages");
                return Ok(match (&self.start, order) {
                    (Watermark::Timestamp(start), PageOrder::Ascending) => {
                        let conservative = latest
                            .map(|l| Watermark::at(l.max(*start)))
                            .unwrap_or_else(|| self.start.clone());
                        (RunOutcome::DeadlineReached, conservative, true)
                    }
                    _ => (RunOutcome::DeadlineReached, self.start.clone(), false),
                });
            }

            let page_number = self.pages + 1;
            let request = PageRequest {
                watermark: self.start.clone(),
                as_of: self.ctx.now,
                window: None,
                cursor: cursor.clone(),
                page_number,
            };
            let page = self.fetch(&request).await?;

            let mut reached_seen = false;
            let empty = page.records.is_empty();
            let emitted_before = self.emitted;
            for record in &page.records {
                let ts = record.timestamp();
                if let Some(w) = floor {
                    if ts < w {
                        match order {
                            PageOrder::Descending => {
                                debug!(source = self.adapter.name(), at = %ts, "reached already-harvested records");
                                reached_seen = true;
                                break;
                            }
                            PageOrder::Ascending => {
                                self.skipped_stale += 1;
                                continue;
                            }
                        }
                    }
                }
                self.emit(record).await?;
                latest = Some(latest.map_or(ts, |l| l.max(ts)));
            }

            if page.resume_cursor.is_some() {
                resume = page.resume_cursor.clone();
                uncovered = 0;
            } else {
                uncovered += self.emitted - emitted_before;
            }

            let last_page = page
                .total_pages
                .map(|total| page_number >= total)
                .unwrap_or(false);
            let done = empty || reached_seen || last_page || !page.has_more();

            if done {
                let watermark = match &self.start {
                    Watermark::Timestamp(start) => match latest {
                        Some(l) => Watermark::after(l.max(*start)),
                        None => self.start.clone(),
                    },
                    Watermark::Cursor(_) if uncovered > 0 => {
                        return Err(HarvestError::Config(format!(
                            "source '{}' emitted {} records without returning a resume cursor",
                            self.adapter.name(),
                            uncovered
                        )));
                    }
                    Watermark::Cursor(_) => match resume {
                        Some(c) => Watermark::Cursor(c),
                        None => self.start.clone(),
                    },
                };
                return Ok((self.finished_outcome(), watermark, true));
            }

            cursor = page.next_cursor;

            if order == PageOrder::Ascending {
                if let (Watermark::Timestamp(start), Some(l)) = (&self.start, latest) {
                    self.commit_progress(&Watermark::at(l.max(*start))).await?;
                }
            }
        }
    }

    fn finished_outcome(&self) -> RunOutcome {
        if self.emitted == 0 {
            RunOutcome::NoData
        } else {
            RunOutcome::Completed
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Fetch, emit, commit
    // ═══════════════════════════════════════════════════════════════════

    /// Fetch one page: pace, refresh credentials, retry on rate limits.
    async fn fetch(&mut self, request: &PageRequest) -> Result<PageResult<A::Record>, HarvestError> {
        let hint = self.adapter.rate_limit_hint();
        if let Some(last) = self.last_fetch {
            let elapsed = last.elapsed();
            if elapsed < hint.min_interval {
                tokio::time::sleep(hint.min_interval - elapsed).await;
            }
        }

        let mut attempts: u32 = 0;
        loop {
            if let Some(fresh) = self
                .adapter
                .refresh_if_stale(&self.credential, self.secrets)
                .await?
            {
                self.credential = fresh;
            }

            self.last_fetch = Some(Instant::now());
            match self.adapter.fetch_page(request, &self.credential).await {
                Ok(page) => {
                    self.pages += 1;
                    self.skipped_by_adapter += page.skipped;
                    debug!(
                        source = self.adapter.name(),
                        page = request.page_number,
                        records = page.records.len(),
                        more = page.has_more(),
                        "fetched page"
                    );
                    return Ok(page);
                }
                Err(HarvestError::RateLimited { retry_after }) => {
                    self.rate_limited += 1;
                    attempts += 1;
                    if attempts > self.ctx.rate_limit_max_retries {
                        return Err(HarvestError::Transport(format!(
                            "{}: still rate limited after {} retries",
                            self.adapter.name(),
                            self.ctx.rate_limit_max_retries
                        )));
                    }
                    let wait = retry_after.unwrap_or(Duration::ZERO).max(hint.cooldown);
                    warn!(
                        source = self.adapter.name(),
                        page = request.page_number,
                        attempt = attempts,
                        wait_ms = wait.as_millis() as u64,
                        "rate limited, cooling down"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(HarvestError::Parse { message, body }) => {
                    let excerpt: String = body.chars().take(PARSE_BODY_LOG_LIMIT).collect();
                    error!(
                        source = self.adapter.name(),
                        page = request.page_number,
                        body = %excerpt,
                        "{}",
                        message
                    );
                    return Err(HarvestError::Parse { message, body });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn emit(&mut self, record: &A::Record) -> Result<(), HarvestError> {
        for normalized in self.normalizer.normalize(record) {
            self.sink.emit(&normalized).await?;
            self.emitted += 1;
        }
        Ok(())
    }

    /// Per-page commit of conservative progress, when enabled.
    async fn commit_progress(&mut self, watermark: &Watermark) -> Result<(), HarvestError> {
        if self.ctx.commit_per_page && *watermark != self.start {
            self.commit(watermark).await?;
        }
        Ok(())
    }

    /// Flush the sink, then write the watermark. Dry runs flush only.
    async fn commit(&mut self, watermark: &Watermark) -> Result<(), HarvestError> {
        self.sink.flush().await?;
        if self.ctx.dry_run {
            return Ok(());
        }
        let encoded = watermark.encode();
        if self.committed_value.as_deref() == Some(encoded.as_str()) {
            return Ok(());
        }
        self.checkpoints
            .put_watermark(&self.ctx.checkpoint_key, &encoded)
            .await?;
        debug!(source = self.adapter.name(), watermark = %watermark, "watermark committed");
        self.committed_value = Some(encoded);
        self.committed = true;
        Ok(())
    }
}
