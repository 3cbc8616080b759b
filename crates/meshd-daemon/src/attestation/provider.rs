//! The attestor seam and its retry policy.
//!
//! Key creation is opaque here: whatever hardware or service vouches
//! for the node key lives behind [`Attestor`]. The lifecycle manager
//! only sees a fallible async call, retried with bounded exponential
//! backoff.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use meshd_core::key::AttestedKey;
use rand::RngCore;
use tracing::warn;

/// Errors from attested-key creation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum AttestorError {
    /// Transient creation failure; retried under the backoff policy.
    #[error("attestation provider failed: {0}")]
    Provider(String),

    /// The provider is permanently unavailable. Not retried.
    #[error("attestation provider unavailable: {0}")]
    Unavailable(String),
}

/// Produces fresh attested node keys scoped to a release digest.
#[async_trait]
pub trait Attestor: Send + Sync {
    /// Creates one fresh attested key.
    ///
    /// # Errors
    ///
    /// Returns [`AttestorError`] if the key could not be created.
    async fn create_key(&self, release_digest: [u8; 32]) -> Result<AttestedKey, AttestorError>;
}

/// Bounded exponential backoff for key creation retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Ceiling on the per-retry delay.
    pub max: Duration,
    /// Total attempts before the last error is surfaced.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            max_attempts: 6,
        }
    }
}

/// Calls `attestor.create_key` under `policy`, sleeping between
/// transient failures. Permanent failures and exhausted attempts
/// surface the last provider error.
///
/// # Errors
///
/// Returns the final [`AttestorError`] once retries are exhausted or a
/// permanent failure is reported.
pub async fn create_with_backoff(
    attestor: &dyn Attestor,
    policy: BackoffPolicy,
    release_digest: [u8; 32],
) -> Result<AttestedKey, AttestorError> {
    let mut delay = policy.initial;
    for attempt in 1..=policy.max_attempts {
        match attestor.create_key(release_digest).await {
            Ok(key) => return Ok(key),
            Err(err @ AttestorError::Unavailable(_)) => return Err(err),
            Err(err) if attempt == policy.max_attempts => return Err(err),
            Err(err) => {
                warn!(attempt, %err, ?delay, "key creation failed; backing off");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max);
            },
        }
    }
    unreachable!("loop returns on the final attempt")
}

/// Software attestor: random bundles with a fixed time to live. Stands
/// in wherever no hardware attestation root is present.
#[derive(Debug, Clone, Copy)]
pub struct SoftwareAttestor {
    ttl: Duration,
}

impl SoftwareAttestor {
    /// Creates an attestor issuing keys valid for `ttl`.
    #[must_use]
    pub const fn new(ttl: Duration) -> Self {
        Self { ttl }
    }
}

#[async_trait]
impl Attestor for SoftwareAttestor {
    async fn create_key(&self, release_digest: [u8; 32]) -> Result<AttestedKey, AttestorError> {
        let mut bundle = vec![0u8; 64];
        rand::rngs::OsRng.fill_bytes(&mut bundle);
        Ok(AttestedKey::new(
            bundle,
            SystemTime::now() + self.ttl,
            release_digest,
        ))
    }
}

#[cfg(test)]
#[allow(missing_docs)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct FlakyAttestor {
        calls: AtomicU32,
        failures_before_success: u32,
        inner: SoftwareAttestor,
    }

    #[async_trait]
    impl Attestor for FlakyAttestor {
        async fn create_key(&self, release_digest: [u8; 32]) -> Result<AttestedKey, AttestorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(AttestorError::Provider("transient".to_string()))
            } else {
                self.inner.create_key(release_digest).await
            }
        }
    }

    struct DeadAttestor {
        error: Mutex<AttestorError>,
    }

    #[async_trait]
    impl Attestor for DeadAttestor {
        async fn create_key(&self, _release_digest: [u8; 32]) -> Result<AttestedKey, AttestorError> {
            Err(self.error.lock().unwrap().clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_retries_transient_failures() {
        let attestor = FlakyAttestor {
            calls: AtomicU32::new(0),
            failures_before_success: 3,
            inner: SoftwareAttestor::new(Duration::from_secs(3600)),
        };
        let key = create_with_backoff(&attestor, BackoffPolicy::default(), [7; 32])
            .await
            .unwrap();
        assert_eq!(attestor.calls.load(Ordering::SeqCst), 4);
        assert_eq!(key.release_digest, [7; 32]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_exhausts_attempts() {
        let attestor = DeadAttestor {
            error: Mutex::new(AttestorError::Provider("down".to_string())),
        };
        let policy = BackoffPolicy {
            max_attempts: 3,
            ..BackoffPolicy::default()
        };
        let err = create_with_backoff(&attestor, policy, [0; 32])
            .await
            .unwrap_err();
        assert_eq!(err, AttestorError::Provider("down".to_string()));
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let attestor = DeadAttestor {
            error: Mutex::new(AttestorError::Unavailable("no root".to_string())),
        };
        let err = create_with_backoff(&attestor, BackoffPolicy::default(), [0; 32])
            .await
            .unwrap_err();
        assert_eq!(err, AttestorError::Unavailable("no root".to_string()));
    }

    #[tokio::test]
    async fn test_software_attestor_keys_are_unique() {
        let attestor = SoftwareAttestor::new(Duration::from_secs(3600));
        let a = attestor.create_key([1; 32]).await.unwrap();
        let b = attestor.create_key([1; 32]).await.unwrap();
        assert_ne!(a.key_id, b.key_id);
    }
}
