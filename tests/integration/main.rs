//! Sluice integration test harness.
//!
//! Every test drives a real `AsyncTransport` (real dispatch queue, real
//! worker thread) against scripted collaborators:
//!
//!   RecordingCache       — counts store/discard per envelope
//!   ScriptedConnection   — replies from a script, can block on a latch
//!   SwitchGate           — connectivity flipped by the test
//!
//!   cargo test --test integration
//!
//! Set RUST_LOG=sluice_transport=debug to see the pipeline's log lines.

mod recovery;

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Once};
use std::time::Duration;

use sluice_core::{DataCategory, Envelope, EnvelopeItem, Hint, TransportConfig};
use sluice_transport::{
    AsyncTransport, CategoryRateLimiter, Collaborators, Connection, DeliveryOutcome,
    EnvelopeCache, RateLimiter, SwitchGate, Unlimited,
};

/// Generous upper bound for anything that should happen "soon".
pub const WAIT: Duration = Duration::from_secs(5);

// ── Logging ───────────────────────────────────────────────────────────────────

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

// ── Latch ─────────────────────────────────────────────────────────────────────

/// One-shot gate a scripted reply can block on until the test opens it.
#[derive(Default)]
pub struct Latch {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let open = self.open.lock().unwrap();
        let _open = self.cond.wait_while(open, |o| !*o).unwrap();
    }
}

/// Opens the latch when dropped, so a failing test never leaves the
/// worker blocked forever.
pub struct OpenOnDrop(pub Arc<Latch>);

impl Drop for OpenOnDrop {
    fn drop(&mut self) {
        self.0.open();
    }
}

// ── RecordingCache ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingCache {
    stored: Mutex<HashMap<String, usize>>,
    discarded: Mutex<HashMap<String, usize>>,
}

impl RecordingCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stores(&self, label: &str) -> usize {
        self.stored.lock().unwrap().get(label).copied().unwrap_or(0)
    }

    pub fn discards(&self, label: &str) -> usize {
        self.discarded.lock().unwrap().get(label).copied().unwrap_or(0)
    }

    /// Total store + discard calls across all envelopes.
    pub fn mutations(&self) -> usize {
        self.stored.lock().unwrap().values().sum::<usize>()
            + self.discarded.lock().unwrap().values().sum::<usize>()
    }
}

impl EnvelopeCache for RecordingCache {
    fn store(&self, envelope: &Envelope, _hint: Option<&dyn Hint>) {
        *self.stored.lock().unwrap().entry(envelope.label()).or_default() += 1;
    }

    fn discard(&self, envelope: &Envelope) {
        *self.discarded.lock().unwrap().entry(envelope.label()).or_default() += 1;
    }
}

// ── ScriptedConnection ────────────────────────────────────────────────────────

#[derive(Clone)]
pub enum Reply {
    Status(u16),
    IoError,
    Panic,
    /// Block until the latch opens, then answer 200.
    Hold(Arc<Latch>),
}

/// Connection that answers from a script, falling back to a fixed reply
/// once the script runs out. Records every envelope it was asked to send.
pub struct ScriptedConnection {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    sent: Mutex<Vec<String>>,
}

impl ScriptedConnection {
    pub fn new(fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn ok() -> Arc<Self> {
        Self::new(Reply::Status(200))
    }

    pub fn then(&self, reply: Reply) -> &Self {
        self.script.lock().unwrap().push_back(reply);
        self
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Connection for ScriptedConnection {
    fn send(&self, envelope: &Envelope) -> io::Result<DeliveryOutcome> {
        self.sent.lock().unwrap().push(envelope.label());
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match reply {
            Reply::Status(code) => Ok(DeliveryOutcome::from_status(code)),
            Reply::IoError => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "scripted connection refused",
            )),
            Reply::Panic => panic!("scripted connection panic"),
            Reply::Hold(latch) => {
                latch.wait();
                Ok(DeliveryOutcome::success(200))
            }
        }
    }
}

// ── Rig ───────────────────────────────────────────────────────────────────────

/// A transport wired to scripted collaborators the test can inspect.
pub struct Rig {
    pub transport: AsyncTransport,
    pub cache: Arc<RecordingCache>,
    pub connection: Arc<ScriptedConnection>,
    pub gate: Arc<SwitchGate>,
    pub limiter: Arc<CategoryRateLimiter>,
}

pub struct RigBuilder {
    max_queue_size: usize,
    close_grace_secs: u64,
    connection: Arc<ScriptedConnection>,
    rate_limited: bool,
}

impl RigBuilder {
    pub fn capacity(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn close_grace_secs(mut self, secs: u64) -> Self {
        self.close_grace_secs = secs;
        self
    }

    pub fn connection(mut self, connection: Arc<ScriptedConnection>) -> Self {
        self.connection = connection;
        self
    }

    /// Route sends through the rig's `CategoryRateLimiter` instead of
    /// `Unlimited`.
    pub fn rate_limited(mut self) -> Self {
        self.rate_limited = true;
        self
    }

    pub fn build(self) -> Rig {
        init_tracing();

        let cache = RecordingCache::new();
        let gate = Arc::new(SwitchGate::new(true));
        let limiter = Arc::new(CategoryRateLimiter::new());
        let rate_limiter: Arc<dyn RateLimiter> = if self.rate_limited {
            limiter.clone()
        } else {
            Arc::new(Unlimited)
        };

        let config = TransportConfig {
            max_queue_size: self.max_queue_size,
            close_grace_secs: self.close_grace_secs,
            ..TransportConfig::default()
        };
        let transport = AsyncTransport::new(
            &config,
            Collaborators {
                cache: cache.clone(),
                rate_limiter,
                gate: gate.clone(),
                connection: self.connection.clone(),
            },
        )
        .expect("transport should start");

        Rig {
            transport,
            cache,
            connection: self.connection,
            gate,
            limiter,
        }
    }
}

pub fn rig() -> RigBuilder {
    RigBuilder {
        max_queue_size: 30,
        close_grace_secs: 5,
        connection: ScriptedConnection::ok(),
        rate_limited: false,
    }
}

// ── Fixtures ──────────────────────────────────────────────────────────────────

pub fn envelope(id: &str) -> Envelope {
    envelope_in(id, DataCategory::Error)
}

pub fn envelope_in(id: &str, category: DataCategory) -> Envelope {
    Envelope::single(id, EnvelopeItem::new(category, id.as_bytes().to_vec()))
}

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn temp_dir(tag: &str) -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "sluice-it-{tag}-{}-{}",
        std::process::id(),
        id
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}
