//! On-disk attestation bundle cache.
//!
//! One pretty-printed JSON file mapping base64url key identifiers to
//! cached bundle entries. Writes go through a temp file and an atomic
//! rename. A corrupt or unreadable file is deleted and the cache starts
//! empty; partial recovery is never attempted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use meshd_core::key::{AttestedKey, NodeKeyId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Errors from cache persistence. Callers treat these as local to the
/// cache; a failed write never takes the key set down with it.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CacheError {
    /// Filesystem failure.
    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding failure.
    #[error("cache encode: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedEntry {
    /// Standard base64 of the attestation bundle.
    bundle: String,
    /// Expiry as seconds since the Unix epoch.
    expiry_unix_secs: u64,
    /// Hex digest of the release the key is scoped to.
    release_digest: String,
    /// Revoked for external advertisement.
    node_only: bool,
}

/// The attestation cache file.
#[derive(Debug, Clone)]
pub struct AttestationCache {
    path: PathBuf,
}

impl AttestationCache {
    /// Opens a cache at `path`. Nothing is read until [`Self::load`].
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every cached key. A missing file yields an empty list; a
    /// corrupt file is deleted and also yields an empty list. Entries
    /// whose stored identifier does not match their bundle digest are
    /// skipped.
    #[must_use]
    pub fn load(&self) -> Vec<AttestedKey> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "unreadable attestation cache; resetting");
                self.reset();
                return Vec::new();
            },
        };

        let entries: BTreeMap<String, CachedEntry> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "corrupt attestation cache; resetting");
                self.reset();
                return Vec::new();
            },
        };

        let mut keys = Vec::new();
        for (id, entry) in entries {
            match Self::decode_entry(&id, &entry) {
                Some(key) => keys.push(key),
                None => warn!(id, "skipping inconsistent cache entry"),
            }
        }
        debug!(count = keys.len(), "loaded attestation cache");
        keys
    }

    /// Writes the full key set, replacing the previous contents
    /// atomically (temp file then rename).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the file could not be written.
    pub fn store<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a AttestedKey>,
    ) -> Result<(), CacheError> {
        let entries: BTreeMap<String, CachedEntry> = keys
            .into_iter()
            .map(|key| (key.key_id.to_base64url(), Self::encode_entry(key)))
            .collect();
        let json = serde_json::to_vec_pretty(&entries)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn reset(&self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), %err, "failed to delete corrupt cache");
            }
        }
    }

    fn encode_entry(key: &AttestedKey) -> CachedEntry {
        let expiry_unix_secs = key
            .expiry
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        CachedEntry {
            bundle: BASE64.encode(&key.bundle),
            expiry_unix_secs,
            release_digest: hex::encode(key.release_digest),
            node_only: key.node_only,
        }
    }

    fn decode_entry(id: &str, entry: &CachedEntry) -> Option<AttestedKey> {
        let stored_id = NodeKeyId::from_base64url(id)?;
        let bundle = BASE64.decode(&entry.bundle).ok()?;
        if NodeKeyId::from_bundle(&bundle) != stored_id {
            return None;
        }
        let digest: [u8; 32] = hex::decode(&entry.release_digest).ok()?.try_into().ok()?;
        let expiry = UNIX_EPOCH + Duration::from_secs(entry.expiry_unix_secs);
        let mut key = AttestedKey::new(bundle, expiry, digest);
        key.node_only = entry.node_only;
        Some(key)
    }
}
