//! Hints — optional per-submission context with reporting capabilities.
//!
//! A caller may attach a hint to a submission. The transport never owns
//! the hint's lifecycle; it only asks which capabilities the hint exposes
//! and invokes them from whichever thread ends up handling the envelope:
//!
//!   AlreadyCached          — envelope was read back from disk (`is_cached`)
//!   Retryable              — "re-attempt later" flag
//!   SubmissionResult       — final pass/fail outcome
//!   DiskFlushNotification  — fired once the envelope is in the cache
//!
//! Hints are shared as `Arc<dyn Hint>`, so every capability setter takes
//! `&self` and the implementor provides interior mutability.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Capability query surface. Every capability defaults to "not supported".
pub trait Hint: Send + Sync {
    /// True if the envelope came from the envelope cache.
    fn is_cached(&self) -> bool {
        false
    }

    fn as_retryable(&self) -> Option<&dyn Retryable> {
        None
    }

    fn as_submission_result(&self) -> Option<&dyn SubmissionResult> {
        None
    }

    fn as_disk_flush(&self) -> Option<&dyn DiskFlushNotification> {
        None
    }
}

pub trait Retryable: Send + Sync {
    fn set_retry(&self, retry: bool);
    fn is_retry(&self) -> bool;
}

pub trait SubmissionResult: Send + Sync {
    fn set_result(&self, success: bool);
    fn is_success(&self) -> bool;
}

pub trait DiskFlushNotification: Send + Sync {
    fn mark_flushed(&self);
}

// ── Capability helpers ───────────────────────────────────────────────────────

/// Set the retry flag if the hint supports it, otherwise note that the
/// caller has no retry path for this envelope.
pub fn mark_retry(hint: Option<&dyn Hint>, retry: bool) {
    match hint.and_then(|h| h.as_retryable()) {
        Some(r) => r.set_retry(retry),
        None => tracing::debug!(retry, "hint is not retryable, no retry signal delivered"),
    }
}

/// Report a failed submission: result `false`, then the retry flag.
pub fn mark_failed(hint: Option<&dyn Hint>, retry: bool) {
    if let Some(result) = hint.and_then(|h| h.as_submission_result()) {
        result.set_result(false);
    }
    mark_retry(hint, retry);
}

// ── OnceFlag ─────────────────────────────────────────────────────────────────

/// A boolean that can be set once and waited on.
#[derive(Debug, Default)]
pub struct OnceFlag {
    value: Mutex<Option<bool>>,
    cond: Condvar,
}

impl OnceFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `v` if nothing was stored yet. Returns false if already set.
    pub fn set(&self, v: bool) -> bool {
        let mut slot = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(v);
        self.cond.notify_all();
        true
    }

    pub fn get(&self) -> Option<bool> {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the flag is set or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Option<bool> {
        let slot = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        let (slot, _) = self
            .cond
            .wait_timeout_while(slot, timeout, |v| v.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        *slot
    }
}

// ── Stock hints ──────────────────────────────────────────────────────────────

/// Hint for an envelope re-submitted from the envelope cache.
#[derive(Debug, Default)]
pub struct CachedHint {
    retry: OnceFlag,
    result: OnceFlag,
}

impl CachedHint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait_result(&self, timeout: Duration) -> Option<bool> {
        self.result.wait(timeout)
    }
}

impl Hint for CachedHint {
    fn is_cached(&self) -> bool {
        true
    }

    fn as_retryable(&self) -> Option<&dyn Retryable> {
        Some(self)
    }

    fn as_submission_result(&self) -> Option<&dyn SubmissionResult> {
        Some(self)
    }
}

impl Retryable for CachedHint {
    fn set_retry(&self, retry: bool) {
        if !self.retry.set(retry) {
            tracing::debug!(retry, "retry flag already set, ignoring");
        }
    }

    fn is_retry(&self) -> bool {
        self.retry.get().unwrap_or(false)
    }
}

impl SubmissionResult for CachedHint {
    fn set_result(&self, success: bool) {
        if !self.result.set(success) {
            tracing::debug!(success, "submission result already set, ignoring");
        }
    }

    fn is_success(&self) -> bool {
        self.result.get().unwrap_or(false)
    }
}

/// Hint for callers that need to block on durability or on the outcome.
///
/// Typical use: a crash handler submits the final envelope with a
/// `FlushHint` and waits on `wait_flushed` so the process does not exit
/// before the envelope is on disk.
#[derive(Debug, Default)]
pub struct FlushHint {
    flushed: OnceFlag,
    retry: OnceFlag,
    result: OnceFlag,
}

impl FlushHint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the envelope is written to the cache. Returns false on
    /// timeout.
    pub fn wait_flushed(&self, timeout: Duration) -> bool {
        self.flushed.wait(timeout).is_some()
    }

    /// Block until the submission outcome is known.
    pub fn wait_result(&self, timeout: Duration) -> Option<bool> {
        self.result.wait(timeout)
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed.get().is_some()
    }

    /// The outcome, if reported yet.
    pub fn result(&self) -> Option<bool> {
        self.result.get()
    }

    /// The retry flag, if set yet.
    pub fn retry(&self) -> Option<bool> {
        self.retry.get()
    }
}

impl Hint for FlushHint {
    fn as_retryable(&self) -> Option<&dyn Retryable> {
        Some(self)
    }

    fn as_submission_result(&self) -> Option<&dyn SubmissionResult> {
        Some(self)
    }

    fn as_disk_flush(&self) -> Option<&dyn DiskFlushNotification> {
        Some(self)
    }
}

impl Retryable for FlushHint {
    fn set_retry(&self, retry: bool) {
        if !self.retry.set(retry) {
            tracing::debug!(retry, "retry flag already set, ignoring");
        }
    }

    fn is_retry(&self) -> bool {
        self.retry.get().unwrap_or(false)
    }
}

impl SubmissionResult for FlushHint {
    fn set_result(&self, success: bool) {
        if !self.result.set(success) {
            tracing::debug!(success, "submission result already set, ignoring");
        }
    }

    fn is_success(&self) -> bool {
        self.result.get().unwrap_or(false)
    }
}

impl DiskFlushNotification for FlushHint {
    fn mark_flushed(&self) {
        self.flushed.set(true);
    }
}
