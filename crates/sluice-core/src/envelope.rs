//! Envelope — the unit of delivery.
//!
//! An envelope is a header plus an ordered list of items. Item payloads are
//! opaque bytes; this crate never looks inside them. Envelopes are immutable
//! once built: filtering produces a new envelope rather than editing one in
//! place, so an envelope shared between a producer and the send worker can
//! never change under either of them.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Rate-limit category of an envelope item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataCategory {
    /// Catch-all. A limit on `Default` applies to every category.
    Default,
    Error,
    Session,
    Transaction,
    Attachment,
    Profile,
    Monitor,
}

impl DataCategory {
    pub const ALL: [DataCategory; 7] = [
        DataCategory::Default,
        DataCategory::Error,
        DataCategory::Session,
        DataCategory::Transaction,
        DataCategory::Attachment,
        DataCategory::Profile,
        DataCategory::Monitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataCategory::Default => "default",
            DataCategory::Error => "error",
            DataCategory::Session => "session",
            DataCategory::Transaction => "transaction",
            DataCategory::Attachment => "attachment",
            DataCategory::Profile => "profile",
            DataCategory::Monitor => "monitor",
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a category name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown data category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for DataCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// Envelope header. Lightweight identifiers only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    /// Hex event identifier, if the envelope carries an event.
    pub event_id: Option<String>,
    /// Time the envelope was handed to the transport.
    pub sent_at: Option<SystemTime>,
}

/// One opaque item inside an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeItem {
    pub category: DataCategory,
    pub payload: Bytes,
}

impl EnvelopeItem {
    pub fn new(category: DataCategory, payload: impl Into<Bytes>) -> Self {
        Self {
            category,
            payload: payload.into(),
        }
    }
}

/// An immutable, ordered batch of items delivered as one network unit.
///
/// Every envelope gets a `key` when it is built. Clones and filtered copies
/// keep it, so the key names one submission even when two submissions carry
/// identical content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "fresh_key")]
    key: String,
    header: EnvelopeHeader,
    items: Vec<EnvelopeItem>,
}

static KEY_SEQ: AtomicU64 = AtomicU64::new(0);

/// 128-bit hex id, unique per process run: BLAKE3 over pid, wall clock and
/// a sequence number.
fn fresh_key() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut hasher = blake3::Hasher::new();
    hasher.update(&std::process::id().to_le_bytes());
    hasher.update(&now.as_nanos().to_le_bytes());
    hasher.update(&KEY_SEQ.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    hex::encode(&hasher.finalize().as_bytes()[..16])
}

impl Envelope {
    pub fn new(header: EnvelopeHeader, items: Vec<EnvelopeItem>) -> Self {
        Self {
            key: fresh_key(),
            header,
            items,
        }
    }

    /// Convenience constructor for a single-item envelope.
    pub fn single(event_id: impl Into<String>, item: EnvelopeItem) -> Self {
        Self::new(
            EnvelopeHeader {
                event_id: Some(event_id.into()),
                sent_at: Some(SystemTime::now()),
            },
            vec![item],
        )
    }

    /// Per-submission identity. Names the envelope's cache entry.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    pub fn event_id(&self) -> Option<&str> {
        self.header.event_id.as_deref()
    }

    pub fn items(&self) -> &[EnvelopeItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Build a new envelope keeping only the items for which `keep` holds.
    /// The key and header are carried over unchanged.
    pub fn retain_items<F>(&self, mut keep: F) -> Envelope
    where
        F: FnMut(&EnvelopeItem) -> bool,
    {
        Envelope {
            key: self.key.clone(),
            header: self.header.clone(),
            items: self.items.iter().filter(|i| keep(i)).cloned().collect(),
        }
    }

    /// Stable BLAKE3 content digest, hex-encoded.
    ///
    /// Covers the event id and every item (category, length, payload).
    /// `sent_at` and the key are excluded: two submissions of the same
    /// content share a digest but not a key.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        match &self.header.event_id {
            Some(id) => {
                hasher.update(&[1]);
                hasher.update(&(id.len() as u64).to_le_bytes());
                hasher.update(id.as_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
        for item in &self.items {
            hasher.update(item.category.as_str().as_bytes());
            hasher.update(&(item.payload.len() as u64).to_le_bytes());
            hasher.update(&item.payload);
        }
        hex::encode(hasher.finalize().as_bytes())
    }

    /// Short label for log lines: the event id, or a digest prefix.
    pub fn label(&self) -> String {
        match self.event_id() {
            Some(id) => id.to_string(),
            None => self.digest()[..16].to_string(),
        }
    }
}
