//! Dispatch queue — bounded, single-worker job execution.
//!
//! Producers hand jobs to `submit` from any thread; one dedicated worker
//! thread runs them one at a time in submission order. Capacity counts
//! queued AND running jobs. When no slot is free the job is handed to the
//! rejection policy on the submitting thread instead of blocking it.
//!
//! Lifecycle:
//!   Running      — accepting jobs
//!   ShuttingDown — no new jobs; queued jobs still run (or are cancelled
//!                  after `shutdown_now`)
//!   Terminated   — worker has exited
//!
//! The worker thread is detached, never joined on drop, so it never holds
//! the process open by itself.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::TransportError;

/// A unit of work run on the worker thread.
pub trait Job: Send + 'static {
    fn run(self);
}

/// Why a job did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Every slot was taken.
    QueueFull,
    /// Submitted after `shutdown`.
    ShutDown,
    /// Was queued, then dropped by `shutdown_now` before it started.
    Cancelled,
}

/// Called with every job that will not run. Runs on the submitting thread
/// for `QueueFull`/`ShutDown`, and on the worker thread for `Cancelled`.
pub type RejectionPolicy<J> = Box<dyn Fn(J, RejectReason) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Running,
    ShuttingDown,
    Terminated,
}

static WORKER_SEQ: AtomicUsize = AtomicUsize::new(0);

// ── Slots ────────────────────────────────────────────────────────────────────

/// Occupied-slot counter with an idle signal.
struct Slots {
    capacity: usize,
    count: Mutex<usize>,
    idle: Condvar,
}

impl Slots {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            count: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    fn try_acquire(&self) -> bool {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if *count >= self.capacity {
            return false;
        }
        *count += 1;
        true
    }

    fn release(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn occupied(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let (count, _) = self
            .idle
            .wait_timeout_while(count, timeout, |c| *c > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *count == 0
    }
}

// ── Shared state ─────────────────────────────────────────────────────────────

struct Shared<J> {
    slots: Slots,
    state: Mutex<QueueState>,
    terminated: Condvar,
    cancelled: AtomicBool,
    on_reject: RejectionPolicy<J>,
}

impl<J> Shared<J> {
    fn reject(&self, job: J, reason: RejectReason) {
        (self.on_reject)(job, reason);
    }

    fn mark_terminated(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = QueueState::Terminated;
        self.terminated.notify_all();
    }
}

// ── DispatchQueue ────────────────────────────────────────────────────────────

pub struct DispatchQueue<J: Job> {
    shared: Arc<Shared<J>>,
    tx: Mutex<Option<mpsc::UnboundedSender<J>>>,
}

impl<J: Job> DispatchQueue<J> {
    /// Start a queue with `capacity` slots and its worker thread.
    pub fn new(capacity: usize, on_reject: RejectionPolicy<J>) -> Result<Self, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            slots: Slots::new(capacity.max(1)),
            state: Mutex::new(QueueState::Running),
            terminated: Condvar::new(),
            cancelled: AtomicBool::new(false),
            on_reject,
        });

        let worker_shared = shared.clone();
        let seq = WORKER_SEQ.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("sluice-sender-{seq}"))
            .spawn(move || worker_loop(rx, worker_shared))
            .map_err(TransportError::WorkerSpawn)?;

        Ok(Self {
            shared,
            tx: Mutex::new(Some(tx)),
        })
    }

    /// Queue `job` for the worker. Never blocks on the worker; a job that
    /// can't be queued goes to the rejection policy before this returns.
    /// Returns whether the job was queued.
    pub fn submit(&self, job: J) -> bool {
        match self.enqueue(job) {
            Ok(()) => true,
            Err((job, reason)) => {
                tracing::debug!(?reason, pending = self.pending(), "job rejected by dispatch queue");
                self.shared.reject(job, reason);
                false
            }
        }
    }

    fn enqueue(&self, job: J) -> Result<(), (J, RejectReason)> {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = tx.as_ref() else {
            return Err((job, RejectReason::ShutDown));
        };
        if !self.shared.slots.try_acquire() {
            return Err((job, RejectReason::QueueFull));
        }
        sender.send(job).map_err(|mpsc::error::SendError(job)| {
            self.shared.slots.release();
            (job, RejectReason::ShutDown)
        })
    }

    /// Block until nothing is queued or running, or `timeout` elapses.
    /// Returns true if the queue went idle.
    pub fn wait_till_idle(&self, timeout: Duration) -> bool {
        self.shared.slots.wait_idle(timeout)
    }

    /// Stop accepting jobs. Already queued jobs still run.
    pub fn shutdown(&self) {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == QueueState::Running {
            *state = QueueState::ShuttingDown;
        }
        tracing::debug!(pending = self.shared.slots.occupied(), "dispatch queue shutting down");
    }

    /// Stop accepting jobs and cancel queued ones. A running job finishes.
    pub fn shutdown_now(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.shutdown();
    }

    /// Wait for the worker to exit. `Ok(false)` on timeout.
    ///
    /// `Err(Interrupted)` only if the state lock is poisoned. Every holder in
    /// this module recovers from poisoning and none can panic while holding
    /// it, so with this queue alone the error never occurs; it is kept so a
    /// poisoned lock surfaces to `close` instead of being waited on.
    pub fn await_termination(&self, timeout: Duration) -> Result<bool, TransportError> {
        let state = self
            .shared
            .state
            .lock()
            .map_err(|_| TransportError::Interrupted("awaiting worker termination"))?;
        let (state, _) = self
            .shared
            .terminated
            .wait_timeout_while(state, timeout, |s| *s != QueueState::Terminated)
            .map_err(|_| TransportError::Interrupted("awaiting worker termination"))?;
        Ok(*state == QueueState::Terminated)
    }

    pub fn state(&self) -> QueueState {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Occupied slots: queued plus running.
    pub fn pending(&self) -> usize {
        self.shared.slots.occupied()
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.capacity
    }
}

// ── Worker ───────────────────────────────────────────────────────────────────

fn worker_loop<J: Job>(mut rx: mpsc::UnboundedReceiver<J>, shared: Arc<Shared<J>>) {
    tracing::debug!("send worker started");

    while let Some(job) = rx.blocking_recv() {
        if shared.cancelled.load(Ordering::Acquire) {
            shared.slots.release();
            shared.reject(job, RejectReason::Cancelled);
            continue;
        }

        // Fault boundary: a panicking job is logged and the worker moves on.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.run()));
        shared.slots.release();
        if let Err(payload) = outcome {
            tracing::error!(panic = %panic_message(payload.as_ref()), "send job panicked");
        }
    }

    shared.mark_terminated();
    tracing::debug!("send worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
