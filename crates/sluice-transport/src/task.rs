//! Send task — one accepted submission, start to finish.
//!
//!   1. store the envelope in the cache (write-ahead)
//!   2. fire the hint's disk-flush notification
//!   3. consult the transport gate; if closed, stop here
//!   4. send; on success discard the cached copy
//!   5. on failure, set the retry flag if `SendError::is_retryable`
//!   6. report the outcome through the hint, exactly once
//!
//! Step 6 runs from a drop guard so it also fires while a panic unwinds
//! out of steps 1-5. The panic then continues to the worker's fault
//! boundary.

use std::sync::Arc;
use std::thread;

use sluice_core::{mark_retry, Envelope, Hint};

use crate::cache::EnvelopeCache;
use crate::connection::{Connection, DeliveryOutcome};
use crate::error::SendError;
use crate::gate::TransportGate;
use crate::queue::Job;

/// Collaborators shared by every task of one transport.
pub struct SendContext {
    pub gate: Arc<dyn TransportGate>,
    pub connection: Arc<dyn Connection>,
}

pub struct SendTask {
    envelope: Envelope,
    hint: Option<Arc<dyn Hint>>,
    cache: Arc<dyn EnvelopeCache>,
    context: Arc<SendContext>,
}

impl SendTask {
    pub fn new(
        envelope: Envelope,
        hint: Option<Arc<dyn Hint>>,
        cache: Arc<dyn EnvelopeCache>,
        context: Arc<SendContext>,
    ) -> Self {
        Self {
            envelope,
            hint,
            cache,
            context,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn hint(&self) -> Option<&dyn Hint> {
        self.hint.as_deref()
    }

    fn deliver(&self) -> Result<DeliveryOutcome, SendError> {
        let hint = self.hint();

        self.cache.store(&self.envelope, hint);

        if let Some(flush) = hint.and_then(|h| h.as_disk_flush()) {
            flush.mark_flushed();
            tracing::debug!(envelope = %self.envelope.label(), "disk flush notification fired");
        }

        if !self.context.gate.is_connected() {
            return Err(SendError::Disconnected);
        }

        match self.context.connection.send(&self.envelope) {
            Ok(outcome) if outcome.success => {
                self.cache.discard(&self.envelope);
                Ok(outcome)
            }
            // The cached copy stays for a later recovery pass.
            Ok(outcome) => Err(SendError::Rejected {
                code: outcome.response_code,
            }),
            Err(e) => Err(SendError::Io(e)),
        }
    }
}

impl Job for SendTask {
    fn run(self) {
        let label = self.envelope.label();
        let mut report = ReportOnDrop {
            hint: self.hint(),
            envelope: &label,
            success: false,
        };

        let error = match self.deliver() {
            Ok(outcome) => {
                report.success = true;
                tracing::debug!(
                    envelope = %label,
                    response_code = ?outcome.response_code,
                    "envelope flushed"
                );
                return;
            }
            Err(e) => e,
        };

        match &error {
            SendError::Disconnected => {
                tracing::warn!(envelope = %label, "transport gate closed, envelope kept for retry");
            }
            SendError::Rejected { code } => {
                tracing::error!(
                    envelope = %label,
                    response_code = ?code,
                    "the transport failed to send the envelope"
                );
            }
            SendError::Io(_) => {
                tracing::error!(envelope = %label, error = %error, "sending the envelope failed");
            }
        }
        if error.is_retryable() {
            mark_retry(self.hint(), true);
        }
    }
}

/// Reports the submission outcome when dropped, including during unwinding.
struct ReportOnDrop<'a> {
    hint: Option<&'a dyn Hint>,
    envelope: &'a str,
    success: bool,
}

impl Drop for ReportOnDrop<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!(envelope = %self.envelope, "envelope submission failed");
        }
        if let Some(result) = self.hint.and_then(|h| h.as_submission_result()) {
            tracing::debug!(
                envelope = %self.envelope,
                success = self.success,
                "marking envelope submission result"
            );
            result.set_result(self.success);
        }
    }
}
