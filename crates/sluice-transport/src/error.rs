//! Transport error types.

use std::io;

use sluice_core::ConfigError;
use thiserror::Error;

/// Errors surfaced to the owner of a transport. Delivery failures never
/// appear here; they reach callers only through hints and logs.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The send worker thread could not be started.
    #[error("failed to spawn send worker: {0}")]
    WorkerSpawn(#[source] io::Error),

    /// Construction-time configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The on-disk envelope cache could not be opened.
    #[error("failed to open envelope cache: {0:#}")]
    Cache(anyhow::Error),

    /// A lifecycle wait was abandoned before it completed.
    #[error("interrupted while {0}")]
    Interrupted(&'static str),
}

/// Why a single send attempt did not succeed.
#[derive(Error, Debug)]
pub enum SendError {
    /// The transport gate reported no connectivity; nothing was sent.
    #[error("transport gate reports disconnected")]
    Disconnected,

    /// The server answered, but not with success.
    #[error("server rejected envelope (response code {code:?})")]
    Rejected { code: Option<u16> },

    /// The connection failed before a response was read.
    #[error("transport I/O failure: {0}")]
    Io(#[from] io::Error),
}

impl SendError {
    /// Whether the envelope should be re-attempted later. A server rejection
    /// is final for this process; connectivity and I/O failures are not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SendError::Rejected { .. })
    }
}
