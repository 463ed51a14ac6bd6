//! Transport gate — a cheap connectivity pre-check before each send.

use std::sync::atomic::{AtomicBool, Ordering};

pub trait TransportGate: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Gate for platforms without a reachability signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysConnected;

impl TransportGate for AlwaysConnected {
    fn is_connected(&self) -> bool {
        true
    }
}

/// Gate flipped by an external reachability watcher.
#[derive(Debug)]
pub struct SwitchGate {
    connected: AtomicBool,
}

impl SwitchGate {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::Release);
        if was != connected {
            tracing::debug!(connected, "transport gate changed");
        }
    }
}

impl Default for SwitchGate {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TransportGate for SwitchGate {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
