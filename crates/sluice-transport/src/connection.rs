//! Connection — the wire transport boundary.
//!
//! Opening sockets, writing bytes and reading a response code all happen
//! behind this trait. The pipeline only needs to tell three outcomes apart:
//! accepted, answered-but-refused, and never answered (I/O error).

use std::io;

use sluice_core::Envelope;

/// What the server said about one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub response_code: Option<u16>,
}

impl DeliveryOutcome {
    pub fn success(response_code: u16) -> Self {
        Self {
            success: true,
            response_code: Some(response_code),
        }
    }

    pub fn failure(response_code: Option<u16>) -> Self {
        Self {
            success: false,
            response_code,
        }
    }

    /// Map an HTTP-style status code: 2xx is success.
    pub fn from_status(code: u16) -> Self {
        Self {
            success: (200..300).contains(&code),
            response_code: Some(code),
        }
    }
}

/// Sends one envelope and reports the server's answer. May block for the
/// whole network round-trip; only the send worker calls it.
pub trait Connection: Send + Sync {
    /// `Err` means the exchange failed at the transport level (reset,
    /// timeout, refused). A non-success answer is `Ok` with `success: false`.
    fn send(&self, envelope: &Envelope) -> io::Result<DeliveryOutcome>;
}
