//! Bounded time ranges for timestamp-windowed sources.

use chrono::{DateTime, Duration, Utc};

/// An inclusive `[from, to]` query range.
///
/// `to` is bounded twice: by the provider's maximum query span measured from
/// `from`, and by `now - safety_margin` so we never race events the provider
/// has not indexed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Set when `to` was cut by the span cap rather than by "now".
    pub clamped: bool,
}

impl QueryWindow {
    pub fn compute(
        from: DateTime<Utc>,
        now: DateTime<Utc>,
        max_span: Option<std::time::Duration>,
        safety_margin: std::time::Duration,
    ) -> Self {
        let margin = Duration::from_std(safety_margin).unwrap_or_else(|_| Duration::zero());
        let horizon = now - margin;

        if let Some(span) = max_span.and_then(|s| Duration::from_std(s).ok()) {
            let capped = from + span;
            if capped < horizon {
                return Self {
                    from,
                    to: capped,
                    clamped: true,
                };
            }
        }

        Self {
            from,
            to: horizon,
            clamped: false,
        }
    }

    /// True when `from` is within one second of `to` (or past it).
    pub fn is_degenerate(&self) -> bool {
        self.to - self.from < Duration::seconds(1)
    }

    pub fn span(&self) -> Duration {
        self.to - self.from
    }

    /// First instant after this window (the filter is inclusive of `to`).
    pub fn next_start(&self) -> DateTime<Utc> {
        self.to + Duration::seconds(1)
    }
}
