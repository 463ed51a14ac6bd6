//! Server-driven rate limiting per data category.
//!
//! The ingestion endpoint throttles clients in two ways:
//!   429 + Retry-After            — every category, for N seconds (60 if absent)
//!   X-Rate-Limits header         — "retry_after:cat1;cat2:scope, ..." per category
//!
//! Limits are deadlines. An item whose category (or `default`) has a deadline
//! in the future is dropped before it is ever queued.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use sluice_core::{mark_failed, DataCategory, Envelope, Hint};

/// Fallback when a 429 carries no usable Retry-After.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Upper bound on any single limit. Server values above it are clamped.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Drops or strips envelope items whose category is currently throttled.
pub trait RateLimiter: Send + Sync {
    /// Returns the envelope to send, possibly with fewer items, or `None`
    /// if nothing survives.
    fn filter(&self, envelope: &Envelope, hint: Option<&dyn Hint>) -> Option<Envelope>;
}

/// Rate limiter that never throttles.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn filter(&self, envelope: &Envelope, _hint: Option<&dyn Hint>) -> Option<Envelope> {
        Some(envelope.clone())
    }
}

/// Deadline table keyed by category.
#[derive(Debug, Default)]
pub struct CategoryRateLimiter {
    limits: DashMap<DataCategory, Instant>,
}

impl CategoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Throttle `categories` for `duration`. An empty slice throttles all.
    /// An existing longer deadline is kept. `duration` is capped at
    /// `MAX_RETRY_AFTER`.
    pub fn limit(&self, categories: &[DataCategory], duration: Duration) {
        let duration = duration.min(MAX_RETRY_AFTER);
        let now = Instant::now();
        let Some(deadline) = now.checked_add(duration) else {
            tracing::warn!(secs = duration.as_secs(), "rate limit deadline overflows, ignoring");
            return;
        };
        let categories = if categories.is_empty() {
            &[DataCategory::Default][..]
        } else {
            categories
        };
        for category in categories {
            self.limits
                .entry(*category)
                .and_modify(|d| {
                    if deadline > *d {
                        *d = deadline;
                    }
                })
                .or_insert(deadline);
            tracing::debug!(%category, secs = duration.as_secs_f64(), "rate limit applied");
        }
    }

    /// Apply a 429 response's Retry-After value.
    pub fn apply_retry_after(&self, value: Option<&str>) {
        let duration = value
            .and_then(parse_seconds)
            .unwrap_or(DEFAULT_RETRY_AFTER);
        self.limit(&[], duration);
    }

    /// Apply a rate-limits header: comma-separated `retry_after:categories:scope`
    /// entries. Unparsable entries and unknown categories are skipped.
    pub fn apply_rate_limits_header(&self, value: &str) {
        for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.split(':');
            let Some(duration) = parts.next().and_then(parse_seconds) else {
                tracing::debug!(entry, "skipping malformed rate limit entry");
                continue;
            };

            let categories: Vec<DataCategory> = parts
                .next()
                .unwrap_or("")
                .split(';')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .filter_map(|c| match c.parse() {
                    Ok(category) => Some(category),
                    Err(e) => {
                        tracing::debug!(error = %e, "ignoring rate limit for unknown category");
                        None
                    }
                })
                .collect();

            // Categories were listed but none recognised: nothing of ours is limited.
            let listed_any = entry.split(':').nth(1).is_some_and(|c| !c.trim().is_empty());
            if listed_any && categories.is_empty() {
                continue;
            }

            self.limit(&categories, duration);
        }
    }

    /// True while `category` or `default` is throttled.
    pub fn is_limited(&self, category: DataCategory) -> bool {
        let now = Instant::now();
        let active = |c: DataCategory| self.limits.get(&c).is_some_and(|d| *d > now);
        active(category) || active(DataCategory::Default)
    }

    /// Drop expired deadlines.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.limits.retain(|_, deadline| *deadline > now);
    }
}

impl RateLimiter for CategoryRateLimiter {
    fn filter(&self, envelope: &Envelope, hint: Option<&dyn Hint>) -> Option<Envelope> {
        let mut dropped = 0usize;
        let filtered = envelope.retain_items(|item| {
            if self.is_limited(item.category) {
                dropped += 1;
                tracing::debug!(
                    envelope = %envelope.label(),
                    category = %item.category,
                    "item dropped, category is rate limited"
                );
                false
            } else {
                true
            }
        });

        if dropped == 0 {
            return Some(envelope.clone());
        }

        if filtered.is_empty() {
            tracing::debug!(envelope = %envelope.label(), "envelope dropped, all items rate limited");
            // Nothing will be sent and retrying into an active limit is pointless.
            mark_failed(hint, false);
            return None;
        }

        Some(filtered)
    }
}

/// Parse a non-negative seconds value, clamped to `MAX_RETRY_AFTER`.
/// `inf` clamps; `NaN` and negatives are rejected.
fn parse_seconds(s: &str) -> Option<Duration> {
    let secs: f64 = s.trim().parse().ok()?;
    if secs.is_nan() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(secs.min(MAX_RETRY_AFTER.as_secs_f64())))
}
