//! In-process daemon service surface.
//!
//! The request-serving front end and worker helper processes talk to
//! the daemon through [`DaemonService`]: key-set queries, attestation
//! queries, revocation, worker attestation validation, and session
//! admission. The service also runs the glue task that keeps the
//! replay store's valid-key set in step with key rotations.
//!
//! Outer RPC plumbing stays out of this crate; everything here is a
//! plain async API.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use meshd_core::key::{AttestedKey, AttestedKeySet, NodeKeyId};
use subtle::ConstantTimeEq as _;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::attestation::{AttestationError, KeyLifecycleHandle};
use crate::replay::{SessionStore, StoreError};

/// Errors surfaced by the service API.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ServiceError {
    /// The key lifecycle could not produce a key set.
    #[error(transparent)]
    Attestation(#[from] AttestationError),

    /// Session admission failed.
    #[error(transparent)]
    Replay(#[from] StoreError),

    /// The presented bundle does not hash to the claimed key.
    #[error("attestation bundle does not match the claimed key")]
    BundleMismatch,

    /// The claimed key is not in the current attested key set.
    #[error("unknown proxy key {key_id}")]
    UnknownProxyKey {
        /// The claimed identifier.
        key_id: NodeKeyId,
    },

    /// The worker's key is scoped to a different software release.
    #[error("worker attestation release digest mismatch")]
    ReleaseMismatch,
}

/// The daemon's in-process API.
pub struct DaemonService {
    lifecycle: KeyLifecycleHandle,
    store: Arc<SessionStore>,
    grace: Duration,
}

impl DaemonService {
    /// Builds the service and spawns the rotation-to-store sync task.
    /// Keys the store blocked during restore are revoked immediately.
    pub fn start(
        lifecycle: KeyLifecycleHandle,
        store: Arc<SessionStore>,
        blocked_at_restore: Vec<NodeKeyId>,
        grace: Duration,
    ) -> (Self, JoinHandle<()>) {
        if !blocked_at_restore.is_empty() {
            warn!(
                count = blocked_at_restore.len(),
                "revoking keys blocked by session-store restore"
            );
            lifecycle.force_revocation(blocked_at_restore);
        }

        let sync = tokio::spawn(sync_valid_keys(
            lifecycle.set_watch(),
            Arc::clone(&store),
            grace,
        ));
        (
            Self {
                lifecycle,
                store,
                grace,
            },
            sync,
        )
    }

    /// The current attested key set, creating the first key if none
    /// exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Attestation`] if no key can be produced.
    pub async fn request_attested_key_set(&self) -> Result<AttestedKeySet, ServiceError> {
        let key = self.lifecycle.obtain_attested_key().await?;
        // The watch lags the obtain by at most the publish in the same
        // actor turn; fall back to a set of just the obtained key.
        Ok(self
            .lifecycle
            .key_set()
            .unwrap_or_else(|| AttestedKeySet::new(key)))
    }

    /// The attestation bundles currently advertised off-node: valid,
    /// not revoked.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Attestation`] if no key can be produced.
    pub async fn request_attestation_set(&self) -> Result<Vec<AttestedKey>, ServiceError> {
        let set = self.request_attested_key_set().await?;
        Ok(set
            .advertised(SystemTime::now(), self.grace)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Revokes the given keys: they stop being advertised, and if the
    /// current key is among them an early rotation starts.
    pub fn force_revocation(&self, key_ids: Vec<NodeKeyId>) {
        info!(count = key_ids.len(), "revocation requested");
        self.lifecycle.force_revocation(key_ids);
    }

    /// Validates a worker's attestation against the claimed proxy key:
    /// the bundle must hash to `proxy_key_id`, the key must be in the
    /// current set, and its release digest must match the set's
    /// current release.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::BundleMismatch`],
    /// [`ServiceError::UnknownProxyKey`], or
    /// [`ServiceError::ReleaseMismatch`].
    pub fn validate_worker_attestation(
        &self,
        proxy_key_id: NodeKeyId,
        bundle: &[u8],
    ) -> Result<(), ServiceError> {
        if !NodeKeyId::from_bundle(bundle).ct_eq(&proxy_key_id) {
            return Err(ServiceError::BundleMismatch);
        }
        let set = self
            .lifecycle
            .key_set()
            .ok_or(ServiceError::UnknownProxyKey {
                key_id: proxy_key_id,
            })?;
        let matched = set
            .iter()
            .find(|key| key.key_id.ct_eq(&proxy_key_id))
            .ok_or(ServiceError::UnknownProxyKey {
                key_id: proxy_key_id,
            })?;
        if !bool::from(
            matched
                .release_digest
                .ct_eq(&set.current.release_digest),
        ) {
            return Err(ServiceError::ReleaseMismatch);
        }
        Ok(())
    }

    /// Admits one session under `key_id`, durable before returning.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Replay`] with the store's verdict.
    pub fn add_session(&self, payload: &[u8], key_id: NodeKeyId) -> Result<(), ServiceError> {
        self.store.add_session(payload, key_id)?;
        Ok(())
    }

    /// A watch over key-set rotations, for push-style dependents.
    #[must_use]
    pub fn key_rotated(&self) -> watch::Receiver<Option<AttestedKeySet>> {
        self.lifecycle.set_watch()
    }

    /// A watch for dependents that re-advertise attestation bundles.
    /// Fires on the same rotations as [`Self::key_rotated`]; consumers
    /// re-query [`Self::request_attestation_set`] on each change so
    /// revocations propagate too.
    #[must_use]
    pub fn attestation_rotated(&self) -> watch::Receiver<Option<AttestedKeySet>> {
        self.lifecycle.set_watch()
    }
}

/// Mirrors every key-set change into the replay store's valid set and
/// revokes any key the store blocks.
async fn sync_valid_keys(
    mut set_rx: watch::Receiver<Option<AttestedKeySet>>,
    store: Arc<SessionStore>,
    grace: Duration,
) {
    loop {
        {
            let set = set_rx.borrow_and_update().clone();
            if let Some(set) = set {
                store.set_valid_keys(&set.valid_key_ids(SystemTime::now(), grace));
            }
        }
        if set_rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
#[allow(missing_docs)]
mod tests {
    use meshd_core::session::{MIN_PAYLOAD_LEN, PAYLOAD_SENTINEL};

    use super::*;
    use crate::attestation::{AttestationCache, BackoffPolicy, KeyLifecycleManager, SoftwareAttestor};

    const GRACE: Duration = Duration::from_secs(300);

    fn make_payload(seed: u8) -> Vec<u8> {
        let mut payload = vec![0u8; MIN_PAYLOAD_LEN];
        payload[0] = PAYLOAD_SENTINEL;
        for (i, byte) in payload.iter_mut().enumerate().skip(1) {
            *byte = seed.wrapping_add(i as u8) | 1;
        }
        payload
    }

    fn start_service(dir: &tempfile::TempDir) -> (DaemonService, KeyLifecycleHandle) {
        let (lifecycle, _join) = KeyLifecycleManager::spawn(
            Arc::new(SoftwareAttestor::new(Duration::from_secs(3600))),
            AttestationCache::new(dir.path().join("cache.json")),
            [0x42; 32],
            GRACE,
            BackoffPolicy::default(),
        );
        let (store, blocked) = SessionStore::open(dir.path().join("sessions"), &[]).unwrap();
        let (service, _sync) = DaemonService::start(
            lifecycle.clone(),
            Arc::new(store),
            blocked,
            GRACE,
        );
        (service, lifecycle)
    }

    #[tokio::test]
    async fn test_key_set_request_creates_first_key() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = start_service(&dir);
        let set = service.request_attested_key_set().await.unwrap();
        assert!(set.unpublished.is_empty());
        assert!(!set.current.bundle.is_empty());
    }

    #[tokio::test]
    async fn test_attestation_set_excludes_revoked_keys() {
        let dir = tempfile::tempdir().unwrap();
        let (service, lifecycle) = start_service(&dir);
        let set = service.request_attested_key_set().await.unwrap();
        let first = set.current.key_id;

        let mut watch = lifecycle.set_watch();
        watch.mark_unchanged();
        service.force_revocation(vec![first]);
        // Wait until the revocation-driven rotation lands.
        loop {
            watch.changed().await.unwrap();
            let set = watch.borrow().clone().unwrap();
            if set.current.key_id != first {
                break;
            }
        }

        let advertised = service.request_attestation_set().await.unwrap();
        assert!(advertised.iter().all(|k| k.key_id != first));
        assert!(!advertised.is_empty());
    }

    #[tokio::test]
    async fn test_worker_validation_accepts_current_release() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = start_service(&dir);
        let set = service.request_attested_key_set().await.unwrap();

        service
            .validate_worker_attestation(set.current.key_id, &set.current.bundle)
            .unwrap();
    }

    #[tokio::test]
    async fn test_worker_validation_rejects_forged_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = start_service(&dir);
        let set = service.request_attested_key_set().await.unwrap();

        let err = service
            .validate_worker_attestation(set.current.key_id, b"forged")
            .unwrap_err();
        assert!(matches!(err, ServiceError::BundleMismatch));
    }

    #[tokio::test]
    async fn test_worker_validation_rejects_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = start_service(&dir);
        service.request_attested_key_set().await.unwrap();

        let bundle = b"someone else's bundle";
        let err = service
            .validate_worker_attestation(NodeKeyId::from_bundle(bundle), bundle)
            .unwrap_err();
        assert!(matches!(err, ServiceError::UnknownProxyKey { .. }));
    }

    #[tokio::test]
    async fn test_sessions_follow_the_rotated_key_set() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = start_service(&dir);
        let set = service.request_attested_key_set().await.unwrap();
        let key_id = set.current.key_id;

        // Give the sync task its turn to admit the new key.
        tokio::time::sleep(Duration::from_millis(20)).await;

        service.add_session(&make_payload(7), key_id).unwrap();
        assert!(matches!(
            service.add_session(&make_payload(7), key_id),
            Err(ServiceError::Replay(StoreError::SessionReplayed))
        ));
    }
}
