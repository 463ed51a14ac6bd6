//! sluice-transport — asynchronous envelope delivery.
//!
//! Caller → `Transport::send` → rate limiter → dispatch queue → send task
//! (cache write-ahead, gate check, connection) → hint.

pub mod cache;
pub mod connection;
pub mod error;
pub mod gate;
pub mod queue;
pub mod rate_limit;
pub mod task;
pub mod transport;

pub use cache::{DiskEnvelopeCache, EnvelopeCache, NoOpEnvelopeCache};
pub use connection::{Connection, DeliveryOutcome};
pub use error::{SendError, TransportError};
pub use gate::{AlwaysConnected, SwitchGate, TransportGate};
pub use queue::{DispatchQueue, Job, QueueState, RejectReason, RejectionPolicy};
pub use rate_limit::{
    CategoryRateLimiter, RateLimiter, Unlimited, DEFAULT_RETRY_AFTER, MAX_RETRY_AFTER,
};
pub use task::{SendContext, SendTask};
pub use transport::{AsyncTransport, Collaborators, NoOpTransport, Transport};
