//! Write-ahead envelope cache.
//!
//! Every accepted envelope is written here before the network is touched
//! and removed once the server confirms delivery. Whatever is left on disk
//! at process start is what a recovery pass can re-submit.
//!
//! Disk layout: one JSON file per envelope,
//!   {root}/{key}.envelope
//! where `key` is the envelope's per-submission key. Storing the same
//! submission twice is a no-op; two submissions with identical content get
//! separate files, so discarding one never drops the other.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use anyhow::{Context, Result};
use sluice_core::{CacheConfig, Envelope, Hint};

const ENTRY_EXT: &str = "envelope";

/// Durable scratch storage for envelopes. Implementations must be safe to
/// call from producer threads and the send worker at the same time.
///
/// Neither method reports failure: a cache that cannot write logs and
/// carries on, and delivery proceeds without the write-ahead copy.
pub trait EnvelopeCache: Send + Sync {
    fn store(&self, envelope: &Envelope, hint: Option<&dyn Hint>);
    fn discard(&self, envelope: &Envelope);
}

/// Cache that keeps nothing. Used for envelopes that are already on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEnvelopeCache;

impl NoOpEnvelopeCache {
    pub fn shared() -> Arc<dyn EnvelopeCache> {
        Arc::new(NoOpEnvelopeCache)
    }
}

impl EnvelopeCache for NoOpEnvelopeCache {
    fn store(&self, _envelope: &Envelope, _hint: Option<&dyn Hint>) {}

    fn discard(&self, _envelope: &Envelope) {}
}

/// File-backed envelope cache bounded to `max_items` entries.
pub struct DiskEnvelopeCache {
    root: PathBuf,
    max_items: usize,
    // Serializes evict-then-write so two stores can't both overshoot the bound.
    write_lock: Mutex<()>,
}

impl DiskEnvelopeCache {
    /// Create a cache rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>, max_items: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create cache root: {}", root.display()))?;
        Ok(Self {
            root,
            max_items: max_items.max(1),
            write_lock: Mutex::new(()),
        })
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        Self::new(&config.dir, config.max_items)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check if an envelope is currently cached.
    pub fn contains(&self, envelope: &Envelope) -> bool {
        self.entry_path(envelope.key()).exists()
    }

    /// Read every cached envelope back. Unreadable entries are skipped.
    pub fn load_all(&self) -> Vec<Envelope> {
        let mut entries = self.entries();
        entries.sort();
        entries
            .into_iter()
            .filter_map(|(_, path)| match Self::read_entry(&path) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "skipping unreadable cache entry");
                    None
                }
            })
            .collect()
    }

    /// Count cached envelopes.
    pub fn count(&self) -> usize {
        self.entries().len()
    }

    pub fn clear(&self) {
        for (_, path) in self.entries() {
            let _ = fs::remove_file(path);
        }
    }

    fn try_store(&self, envelope: &Envelope) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let path = self.entry_path(envelope.key());
        if path.exists() {
            return Ok(false);
        }

        self.evict_down_to(self.max_items - 1)?;

        let data = serde_json::to_vec(envelope).context("failed to serialize envelope")?;

        // Atomic write: tmp file → rename
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
            file.write_all(&data)
                .context("failed to write envelope data")?;
            file.sync_all().context("failed to sync envelope to disk")?;
        }

        fs::rename(&tmp_path, &path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(true)
    }

    /// Remove oldest entries until at most `keep` remain.
    fn evict_down_to(&self, keep: usize) -> Result<()> {
        let mut entries = self.entries();
        if entries.len() <= keep {
            return Ok(());
        }
        entries.sort();
        let excess = entries.len() - keep;
        for (_, path) in entries.into_iter().take(excess) {
            fs::remove_file(&path)
                .with_context(|| format!("failed to evict {}", path.display()))?;
            tracing::debug!(path = %path.display(), "cache full, evicted oldest envelope");
        }
        Ok(())
    }

    fn read_entry(path: &Path) -> Result<Envelope> {
        let data =
            fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// All entry files with their modification time.
    fn entries(&self) -> Vec<(SystemTime, PathBuf)> {
        let Ok(dir) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        dir.flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == ENTRY_EXT))
            .map(|p| {
                let modified = fs::metadata(&p)
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (modified, p)
            })
            .collect()
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.{ENTRY_EXT}"))
    }
}

impl EnvelopeCache for DiskEnvelopeCache {
    fn store(&self, envelope: &Envelope, _hint: Option<&dyn Hint>) {
        match self.try_store(envelope) {
            Ok(true) => tracing::debug!(envelope = %envelope.label(), "envelope cached"),
            Ok(false) => tracing::debug!(envelope = %envelope.label(), "envelope already cached"),
            Err(e) => tracing::error!(
                envelope = %envelope.label(),
                error = %format!("{e:#}"),
                "failed to cache envelope"
            ),
        }
    }

    fn discard(&self, envelope: &Envelope) {
        let path = self.entry_path(envelope.key());
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!(envelope = %envelope.label(), "envelope discarded from cache"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(
                envelope = %envelope.label(),
                path = %path.display(),
                error = %e,
                "failed to discard envelope"
            ),
        }
    }
}
