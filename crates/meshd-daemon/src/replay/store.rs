//! The crash-safe session store.
//!
//! One file per node key, named `<base64url(key_id)>.<status>` with
//! status in {`active`, `validating`, `corrupt`}. A file is a flat
//! concatenation of 16-byte session-key records; no header, no length
//! prefix. A trailing partial record invalidates the whole file.
//!
//! Startup restore renames each still-valid `active` file to
//! `validating` before reading it and back to `active` on success. A
//! crash mid-read leaves the `validating` suffix behind, which the
//! next boot treats as corrupt: the key is blocked and the caller must
//! force a revocation of that node key. Fail closed, never a silent
//! retry with partial data.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use meshd_core::key::NodeKeyId;
use meshd_core::session::{SESSION_KEY_LEN, SessionKey, SessionKeyError};
use tracing::{debug, info, warn};

const SUFFIX_ACTIVE: &str = "active";
const SUFFIX_VALIDATING: &str = "validating";
const SUFFIX_CORRUPT: &str = "corrupt";

/// Errors surfaced by [`SessionStore::add_session`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The key is not in the currently valid set.
    #[error("unknown node key {key_id}")]
    UnknownKeyId {
        /// The rejected key identifier.
        key_id: NodeKeyId,
    },

    /// The key was blocked by a restore failure; sessions for it are
    /// refused until it is revoked and replaced.
    #[error("node key {key_id} is blocked")]
    KeyIdBlocked {
        /// The blocked key identifier.
        key_id: NodeKeyId,
    },

    /// The (key, session) pair was seen before.
    #[error("session replayed")]
    SessionReplayed,

    /// The payload failed session-key derivation.
    #[error(transparent)]
    InvalidPayload(#[from] SessionKeyError),

    /// The durable append failed. The key is blocked as a consequence.
    #[error("session persistence failed: {0}")]
    Io(#[from] std::io::Error),
}

struct Inner {
    base: PathBuf,
    valid: HashSet<NodeKeyId>,
    blocked: HashSet<NodeKeyId>,
    sessions: HashMap<NodeKeyId, HashSet<SessionKey>>,
    /// Open append handles for the hot path.
    handles: HashMap<NodeKeyId, File>,
}

/// The session replay store. One mutex guards the in-memory maps and
/// the per-key file handles; appends to a key's file are never
/// concurrent with that key's removal.
pub struct SessionStore {
    inner: Mutex<Inner>,
}

impl SessionStore {
    /// Opens the store at `base`, restoring every still-valid key's
    /// session file. Returns the store and the keys that had to be
    /// blocked; the caller must turn those into forced revocations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] only if the base directory itself is
    /// unusable. Per-file failures block the affected key instead.
    pub fn open(
        base: impl Into<PathBuf>,
        valid_keys: &[NodeKeyId],
    ) -> Result<(Self, Vec<NodeKeyId>), StoreError> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;

        let mut inner = Inner {
            base,
            valid: valid_keys.iter().copied().collect(),
            blocked: HashSet::new(),
            sessions: HashMap::new(),
            handles: HashMap::new(),
        };
        restore(&mut inner)?;

        let blocked: Vec<NodeKeyId> = inner.blocked.iter().copied().collect();
        if !blocked.is_empty() {
            warn!(count = blocked.len(), "blocked node keys during restore");
        }
        Ok((
            Self {
                inner: Mutex::new(inner),
            },
            blocked,
        ))
    }

    /// Records one session, derived from `payload`, under `key_id`.
    /// The record is durable on disk before the call returns.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownKeyId`] for keys outside the valid set,
    /// [`StoreError::KeyIdBlocked`] for blocked keys,
    /// [`StoreError::SessionReplayed`] for a repeated pair,
    /// [`StoreError::InvalidPayload`] for malformed payloads, and
    /// [`StoreError::Io`] when the append fails (which also blocks the
    /// key).
    pub fn add_session(&self, payload: &[u8], key_id: NodeKeyId) -> Result<(), StoreError> {
        let session = SessionKey::from_payload(payload)?;
        let mut inner = self.inner.lock().expect("session store lock");

        // Membership checks on attacker-influenced identifiers run in
        // constant time over the set.
        if !inner.valid.iter().any(|v| v.ct_eq(&key_id)) {
            return Err(StoreError::UnknownKeyId { key_id });
        }
        if inner.blocked.iter().any(|b| b.ct_eq(&key_id)) {
            return Err(StoreError::KeyIdBlocked { key_id });
        }
        if inner
            .sessions
            .get(&key_id)
            .is_some_and(|set| set.contains(&session))
        {
            return Err(StoreError::SessionReplayed);
        }

        if let Err(err) = append_record(&mut inner, key_id, &session) {
            // A key whose file cannot be trusted takes no more
            // sessions; the caller revokes it.
            warn!(%key_id, %err, "session append failed; blocking key");
            inner.handles.remove(&key_id);
            inner.blocked.insert(key_id);
            return Err(err.into());
        }
        inner.sessions.entry(key_id).or_default().insert(session);
        Ok(())
    }

    /// Replaces the valid key set. Files of keys that dropped out are
    /// removed best-effort; a failed removal is logged and retried on
    /// the next call, never escalated.
    pub fn set_valid_keys(&self, keys: &[NodeKeyId]) {
        let mut inner = self.inner.lock().expect("session store lock");
        let next: HashSet<NodeKeyId> = keys.iter().copied().collect();
        let dropped: Vec<NodeKeyId> = inner.valid.difference(&next).copied().collect();
        inner.valid = next;

        for key_id in dropped {
            debug!(%key_id, "node key left the valid set; dropping its sessions");
            inner.handles.remove(&key_id);
            inner.sessions.remove(&key_id);
            for suffix in [SUFFIX_ACTIVE, SUFFIX_VALIDATING, SUFFIX_CORRUPT] {
                let path = key_path(&inner.base, key_id, suffix);
                if let Err(err) = std::fs::remove_file(&path) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), %err, "failed to remove stale session file");
                    }
                }
            }
        }
    }

    /// Keys refused by the store until they are revoked.
    #[must_use]
    pub fn blocked_keys(&self) -> Vec<NodeKeyId> {
        let inner = self.inner.lock().expect("session store lock");
        inner.blocked.iter().copied().collect()
    }

    /// Number of sessions held for `key_id`.
    #[must_use]
    pub fn session_count(&self, key_id: NodeKeyId) -> usize {
        let inner = self.inner.lock().expect("session store lock");
        inner.sessions.get(&key_id).map_or(0, HashSet::len)
    }
}

fn key_path(base: &Path, key_id: NodeKeyId, suffix: &str) -> PathBuf {
    base.join(format!("{}.{suffix}", key_id.to_base64url()))
}

fn append_record(
    inner: &mut Inner,
    key_id: NodeKeyId,
    session: &SessionKey,
) -> std::io::Result<()> {
    if !inner.handles.contains_key(&key_id) {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(key_path(&inner.base, key_id, SUFFIX_ACTIVE))?;
        inner.handles.insert(key_id, file);
    }
    let file = inner.handles.get_mut(&key_id).expect("handle just inserted");
    file.write_all(session.as_bytes())?;
    file.flush()?;
    file.sync_data()
}

/// Classifies every file in the store directory and loads the sessions
/// of still-valid keys through the rename protocol.
fn restore(inner: &mut Inner) -> Result<(), StoreError> {
    let mut seen: HashMap<NodeKeyId, Vec<(String, PathBuf)>> = HashMap::new();
    for entry in std::fs::read_dir(&inner.base)? {
        let entry = entry?;
        let path = entry.path();
        let Some((key_id, suffix)) = parse_file_name(&path) else {
            warn!(path = %path.display(), "unrecognized file in session store");
            continue;
        };
        seen.entry(key_id).or_default().push((suffix, path));
    }

    for (key_id, files) in seen {
        if !inner.valid.contains(&key_id) {
            // Stale files for keys no longer in the set.
            for (_, path) in &files {
                if let Err(err) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), %err, "failed to remove stale session file");
                }
            }
            continue;
        }

        if files.len() > 1 {
            warn!(%key_id, count = files.len(), "duplicate session files; blocking key");
            inner.blocked.insert(key_id);
            continue;
        }
        let (suffix, path) = &files[0];
        match suffix.as_str() {
            SUFFIX_ACTIVE => {
                if let Err(err) = load_sessions(inner, key_id, path) {
                    warn!(%key_id, %err, "session file failed validation; blocking key");
                    inner.blocked.insert(key_id);
                }
            },
            // A validating file at boot means a crash mid-restore;
            // a corrupt file was condemned by an earlier boot.
            SUFFIX_VALIDATING | SUFFIX_CORRUPT => {
                warn!(%key_id, suffix, "unreadable session file state; blocking key");
                inner.blocked.insert(key_id);
            },
            _ => unreachable!("parse_file_name only yields known suffixes"),
        }
    }
    Ok(())
}

/// Active file restore: rename to validating, parse, rename back.
/// Any failure leaves the file condemned as `corrupt`.
fn load_sessions(inner: &mut Inner, key_id: NodeKeyId, active: &Path) -> std::io::Result<()> {
    let validating = key_path(&inner.base, key_id, SUFFIX_VALIDATING);
    std::fs::rename(active, &validating)?;

    let bytes = std::fs::read(&validating)?;
    match parse_records(&bytes) {
        Ok(sessions) => {
            std::fs::rename(&validating, active)?;
            info!(%key_id, count = sessions.len(), "restored session file");
            inner.sessions.insert(key_id, sessions);
            Ok(())
        },
        Err(err) => {
            let corrupt = key_path(&inner.base, key_id, SUFFIX_CORRUPT);
            if let Err(rename_err) = std::fs::rename(&validating, &corrupt) {
                warn!(%key_id, %rename_err, "failed to condemn corrupt session file");
            }
            Err(err)
        },
    }
}

fn parse_records(bytes: &[u8]) -> std::io::Result<HashSet<SessionKey>> {
    if bytes.len() % SESSION_KEY_LEN != 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "trailing partial session record",
        ));
    }
    let mut sessions = HashSet::with_capacity(bytes.len() / SESSION_KEY_LEN);
    for chunk in bytes.chunks_exact(SESSION_KEY_LEN) {
        let record: [u8; SESSION_KEY_LEN] = chunk.try_into().expect("exact chunk");
        let session = SessionKey::from_bytes(record).map_err(|err| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
        })?;
        sessions.insert(session);
    }
    Ok(sessions)
}

fn parse_file_name(path: &Path) -> Option<(NodeKeyId, String)> {
    let name = path.file_name()?.to_str()?;
    let (id_part, suffix) = name.rsplit_once('.')?;
    if !matches!(suffix, SUFFIX_ACTIVE | SUFFIX_VALIDATING | SUFFIX_CORRUPT) {
        return None;
    }
    let key_id = NodeKeyId::from_base64url(id_part)?;
    Some((key_id, suffix.to_string()))
}

#[cfg(test)]
#[allow(missing_docs)]
mod tests {
    use meshd_core::session::{KEY_MATERIAL_OFFSET, MIN_PAYLOAD_LEN, PAYLOAD_SENTINEL};

    use super::*;

    fn make_key_id(seed: u8) -> NodeKeyId {
        NodeKeyId::from_bundle(&[seed; 8])
    }

    fn make_payload(seed: u8) -> Vec<u8> {
        let mut payload = vec![0u8; MIN_PAYLOAD_LEN];
        payload[0] = PAYLOAD_SENTINEL;
        for (i, byte) in payload.iter_mut().enumerate().skip(1) {
            *byte = seed.wrapping_add(i as u8) | 1;
        }
        payload
    }

    fn open_store(dir: &Path, keys: &[NodeKeyId]) -> (SessionStore, Vec<NodeKeyId>) {
        SessionStore::open(dir, keys).unwrap()
    }

    // ========================================================================
    // Insertion
    // ========================================================================

    #[test]
    fn test_first_insert_succeeds_second_is_replay() {
        let dir = tempfile::tempdir().unwrap();
        let key_id = make_key_id(1);
        let (store, _) = open_store(dir.path(), &[key_id]);

        store.add_session(&make_payload(7), key_id).unwrap();
        assert!(matches!(
            store.add_session(&make_payload(7), key_id),
            Err(StoreError::SessionReplayed)
        ));
        // A different payload is a different session.
        store.add_session(&make_payload(8), key_id).unwrap();
        assert_eq!(store.session_count(key_id), 2);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open_store(dir.path(), &[make_key_id(1)]);
        let stranger = make_key_id(9);
        assert!(matches!(
            store.add_session(&make_payload(1), stranger),
            Err(StoreError::UnknownKeyId { key_id }) if key_id == stranger
        ));
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let key_id = make_key_id(1);
        let (store, _) = open_store(dir.path(), &[key_id]);
        assert!(matches!(
            store.add_session(&[0x01, 0x02], key_id),
            Err(StoreError::InvalidPayload(SessionKeyError::BadSentinel))
        ));
    }

    // ========================================================================
    // Durability and restore
    // ========================================================================

    #[test]
    fn test_replay_rejected_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let key_id = make_key_id(1);
        {
            let (store, _) = open_store(dir.path(), &[key_id]);
            store.add_session(&make_payload(7), key_id).unwrap();
        }
        let (store, blocked) = open_store(dir.path(), &[key_id]);
        assert!(blocked.is_empty());
        assert!(matches!(
            store.add_session(&make_payload(7), key_id),
            Err(StoreError::SessionReplayed)
        ));
    }

    #[test]
    fn test_restore_renames_back_to_active() {
        let dir = tempfile::tempdir().unwrap();
        let key_id = make_key_id(1);
        {
            let (store, _) = open_store(dir.path(), &[key_id]);
            store.add_session(&make_payload(7), key_id).unwrap();
        }
        let _ = open_store(dir.path(), &[key_id]);
        assert!(key_path(dir.path(), key_id, SUFFIX_ACTIVE).exists());
        assert!(!key_path(dir.path(), key_id, SUFFIX_VALIDATING).exists());
    }

    #[test]
    fn test_validating_file_at_boot_blocks_key() {
        let dir = tempfile::tempdir().unwrap();
        let key_id = make_key_id(1);
        // Simulates a crash mid-restore: well-formed contents, wrong
        // suffix.
        std::fs::write(
            key_path(dir.path(), key_id, SUFFIX_VALIDATING),
            [0xAA; SESSION_KEY_LEN],
        )
        .unwrap();

        let (store, blocked) = open_store(dir.path(), &[key_id]);
        assert_eq!(blocked, vec![key_id]);
        assert!(matches!(
            store.add_session(&make_payload(1), key_id),
            Err(StoreError::KeyIdBlocked { .. })
        ));
    }

    #[test]
    fn test_trailing_partial_record_blocks_key_and_condemns_file() {
        let dir = tempfile::tempdir().unwrap();
        let key_id = make_key_id(1);
        let mut contents = vec![0xAA; SESSION_KEY_LEN];
        contents.extend_from_slice(&[0xBB; 5]);
        std::fs::write(key_path(dir.path(), key_id, SUFFIX_ACTIVE), contents).unwrap();

        let (_, blocked) = open_store(dir.path(), &[key_id]);
        assert_eq!(blocked, vec![key_id]);
        assert!(key_path(dir.path(), key_id, SUFFIX_CORRUPT).exists());
        assert!(!key_path(dir.path(), key_id, SUFFIX_ACTIVE).exists());
    }

    #[test]
    fn test_all_zero_record_blocks_key() {
        let dir = tempfile::tempdir().unwrap();
        let key_id = make_key_id(1);
        std::fs::write(
            key_path(dir.path(), key_id, SUFFIX_ACTIVE),
            [0u8; SESSION_KEY_LEN],
        )
        .unwrap();

        let (_, blocked) = open_store(dir.path(), &[key_id]);
        assert_eq!(blocked, vec![key_id]);
    }

    #[test]
    fn test_duplicate_files_for_one_key_block_it() {
        let dir = tempfile::tempdir().unwrap();
        let key_id = make_key_id(1);
        std::fs::write(
            key_path(dir.path(), key_id, SUFFIX_ACTIVE),
            [0xAA; SESSION_KEY_LEN],
        )
        .unwrap();
        std::fs::write(key_path(dir.path(), key_id, SUFFIX_CORRUPT), []).unwrap();

        let (_, blocked) = open_store(dir.path(), &[key_id]);
        assert_eq!(blocked, vec![key_id]);
    }

    #[test]
    fn test_stale_key_files_removed_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let stale = make_key_id(9);
        std::fs::write(
            key_path(dir.path(), stale, SUFFIX_ACTIVE),
            [0xAA; SESSION_KEY_LEN],
        )
        .unwrap();

        let (_, blocked) = open_store(dir.path(), &[make_key_id(1)]);
        assert!(blocked.is_empty());
        assert!(!key_path(dir.path(), stale, SUFFIX_ACTIVE).exists());
    }

    // ========================================================================
    // Valid-set maintenance
    // ========================================================================

    #[test]
    fn test_set_valid_keys_drops_sessions_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = make_key_id(1);
        let new = make_key_id(2);
        let (store, _) = open_store(dir.path(), &[old]);
        store.add_session(&make_payload(7), old).unwrap();

        store.set_valid_keys(&[new]);
        assert!(!key_path(dir.path(), old, SUFFIX_ACTIVE).exists());
        assert!(matches!(
            store.add_session(&make_payload(7), old),
            Err(StoreError::UnknownKeyId { .. })
        ));
        store.add_session(&make_payload(7), new).unwrap();
    }
}
