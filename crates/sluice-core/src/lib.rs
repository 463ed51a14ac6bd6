//! sluice-core — shared types for the delivery pipeline: envelopes, the
//! hint capability protocol, and configuration.

pub mod config;
pub mod envelope;
pub mod hint;

pub use config::{CacheConfig, ConfigError, SluiceConfig, TransportConfig};
pub use envelope::{DataCategory, Envelope, EnvelopeHeader, EnvelopeItem, UnknownCategory};
pub use hint::{
    mark_failed, mark_retry, CachedHint, DiskFlushNotification, FlushHint, Hint, OnceFlag,
    Retryable, SubmissionResult,
};
