//! Transport facade — `send`, `flush`, `close`.
//!
//! `send` never blocks on the network and never returns an error: the
//! envelope is filtered, then handed to the dispatch queue, and every
//! outcome from there on reaches the caller only through its hint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sluice_core::{mark_failed, Envelope, Hint, SluiceConfig, TransportConfig};

use crate::cache::{DiskEnvelopeCache, EnvelopeCache, NoOpEnvelopeCache};
use crate::connection::Connection;
use crate::error::TransportError;
use crate::gate::TransportGate;
use crate::queue::{DispatchQueue, QueueState, RejectReason, RejectionPolicy};
use crate::rate_limit::RateLimiter;
use crate::task::{SendContext, SendTask};

pub trait Transport: Send + Sync {
    /// Submit an envelope for delivery. Returns immediately.
    fn send(&self, envelope: Envelope, hint: Option<Arc<dyn Hint>>);

    /// Wait up to `timeout` for queued and in-flight sends to finish.
    /// Returns true if the queue went idle in time.
    fn flush(&self, timeout: Duration) -> bool;

    /// Stop accepting envelopes and drain what is queued. Only the first
    /// call does anything; later calls return `Ok(())`.
    fn close(&self) -> Result<(), TransportError>;
}

/// Everything a transport talks to besides its own queue.
pub struct Collaborators {
    pub cache: Arc<dyn EnvelopeCache>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub gate: Arc<dyn TransportGate>,
    pub connection: Arc<dyn Connection>,
}

// ── AsyncTransport ───────────────────────────────────────────────────────────

pub struct AsyncTransport {
    queue: DispatchQueue<SendTask>,
    cache: Arc<dyn EnvelopeCache>,
    rate_limiter: Arc<dyn RateLimiter>,
    context: Arc<SendContext>,
    close_grace: Duration,
    flush_timeout: Duration,
    closed: AtomicBool,
}

impl AsyncTransport {
    pub fn new(
        config: &TransportConfig,
        collaborators: Collaborators,
    ) -> Result<Self, TransportError> {
        config.validate()?;

        let Collaborators {
            cache,
            rate_limiter,
            gate,
            connection,
        } = collaborators;

        let queue = DispatchQueue::new(config.max_queue_size, reject_send(cache.clone()))?;

        tracing::debug!(
            max_queue_size = config.max_queue_size,
            close_grace_secs = config.close_grace_secs,
            "transport started"
        );

        Ok(Self {
            queue,
            cache,
            rate_limiter,
            context: Arc::new(SendContext { gate, connection }),
            close_grace: config.close_grace(),
            flush_timeout: config.flush_timeout(),
            closed: AtomicBool::new(false),
        })
    }

    /// Build a transport backed by the on-disk envelope cache described in
    /// `config`.
    pub fn from_config(
        config: &SluiceConfig,
        rate_limiter: Arc<dyn RateLimiter>,
        gate: Arc<dyn TransportGate>,
        connection: Arc<dyn Connection>,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let cache = DiskEnvelopeCache::from_config(&config.cache).map_err(TransportError::Cache)?;
        Self::new(
            &config.transport,
            Collaborators {
                cache: Arc::new(cache),
                rate_limiter,
                gate,
                connection,
            },
        )
    }

    /// Flush with the configured default timeout.
    pub fn flush_default(&self) -> bool {
        self.flush(self.flush_timeout)
    }

    /// Envelopes queued or being sent.
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    pub fn queue_state(&self) -> QueueState {
        self.queue.state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Transport for AsyncTransport {
    fn send(&self, envelope: Envelope, hint: Option<Arc<dyn Hint>>) {
        let cached = hint.as_deref().is_some_and(|h| h.is_cached());

        // Envelopes read back from disk are already stored.
        let task_cache = if cached {
            tracing::debug!(envelope = %envelope.label(), "envelope already cached, skipping store");
            NoOpEnvelopeCache::shared()
        } else {
            self.cache.clone()
        };

        let Some(filtered) = self.rate_limiter.filter(&envelope, hint.as_deref()) else {
            if cached {
                // Throttled away for good; drop the stored copy too.
                self.cache.discard(&envelope);
            }
            return;
        };

        self.queue.submit(SendTask::new(
            filtered,
            hint,
            task_cache,
            self.context.clone(),
        ));
    }

    fn flush(&self, timeout: Duration) -> bool {
        tracing::debug!(
            timeout_ms = timeout.as_millis() as u64,
            pending = self.queue.pending(),
            "flushing transport"
        );
        let idle = self.queue.wait_till_idle(timeout);
        if !idle {
            tracing::debug!(pending = self.queue.pending(), "flush timed out");
        }
        idle
    }

    fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        tracing::debug!(pending = self.queue.pending(), "shutting down transport");
        self.queue.shutdown();

        match self.queue.await_termination(self.close_grace) {
            Ok(true) => {
                tracing::debug!("transport shut down");
                Ok(())
            }
            Ok(false) => {
                tracing::warn!(
                    grace_secs = self.close_grace.as_secs(),
                    pending = self.queue.pending(),
                    "failed to shut down the send worker in time, cancelling queued envelopes"
                );
                self.queue.shutdown_now();
                Ok(())
            }
            // Unreachable unless the queue's state lock was poisoned.
            Err(e) => {
                tracing::debug!(error = %e, "close interrupted, cancelling queued envelopes");
                self.queue.shutdown_now();
                Err(e)
            }
        }
    }
}

/// Rejection policy for send tasks: keep the envelope on disk for a later
/// attempt and tell the caller it can retry.
fn reject_send(cache: Arc<dyn EnvelopeCache>) -> RejectionPolicy<SendTask> {
    Box::new(move |task: SendTask, reason: RejectReason| {
        let hint = task.hint();
        if !hint.is_some_and(|h| h.is_cached()) {
            cache.store(task.envelope(), hint);
        }
        mark_failed(hint, true);
        tracing::warn!(
            envelope = %task.envelope().label(),
            ?reason,
            "envelope rejected"
        );
    })
}

// ── NoOpTransport ────────────────────────────────────────────────────────────

/// Transport used when delivery is disabled. Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTransport;

impl Transport for NoOpTransport {
    fn send(&self, envelope: Envelope, _hint: Option<Arc<dyn Hint>>) {
        tracing::trace!(envelope = %envelope.label(), "delivery disabled, dropping envelope");
    }

    fn flush(&self, _timeout: Duration) -> bool {
        true
    }

    fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
