//! Key material for the ensemble mesh and attested node keys.
//!
//! # Shared secret handling
//!
//! [`SharedSecret`] is the symmetric key the leader generates once per
//! formation pass and distributes to every follower. It is deliberately
//! not `Clone`: exactly one current copy exists per node, it is wiped
//! on drop, and sub-key derivation consumes it so the raw secret cannot
//! outlive its use. It never appears in logs (`Debug` is redacted) and
//! is only serialized into the point-to-point channel via
//! [`KeyEnvelope`].
//!
//! # Attested keys
//!
//! [`AttestedKey`] couples a key identifier (the SHA-256 of the opaque
//! attestation bundle) with an expiry and the release digest the bundle
//! vouches for. The lifecycle manager in `meshd-daemon` keeps one
//! current key plus a bounded list of unpublished predecessors.

use std::time::{Duration, SystemTime};

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Width of the shared secret and all derived sub-keys, in bytes.
pub const SHARED_SECRET_LEN: usize = 32;

const MESH_KEY_LABEL: &[u8] = b"meshd.derive.mesh-encryption.v1";
const TRANSPORT_PSK_LABEL: &[u8] = b"meshd.derive.transport-psk.v1";

/// Error returned when decoding key material from the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum KeyError {
    /// The envelope payload has the wrong length.
    #[error("key envelope has invalid length {actual}, expected {expected}")]
    InvalidLength {
        /// Length observed on the wire.
        actual: usize,
        /// Required length.
        expected: usize,
    },
}

/// The ensemble's shared symmetric key. Not `Clone`; zeroed on drop.
#[derive(PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_LEN]);

impl SharedSecret {
    /// Generates a fresh secret from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; SHARED_SECRET_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Reconstructs a secret received through the control channel.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidLength`] if the envelope payload is
    /// not exactly [`SHARED_SECRET_LEN`] bytes.
    pub fn from_envelope(envelope: &KeyEnvelope) -> Result<Self, KeyError> {
        let bytes: [u8; SHARED_SECRET_LEN] =
            envelope.0.as_slice().try_into().map_err(|_| KeyError::InvalidLength {
                actual: envelope.0.len(),
                expected: SHARED_SECRET_LEN,
            })?;
        Ok(Self(bytes))
    }

    /// Wraps the secret for point-to-point distribution.
    #[must_use]
    pub fn to_envelope(&self) -> KeyEnvelope {
        KeyEnvelope(self.0.to_vec())
    }

    /// Derives the mesh-encryption key and the transport PSK, consuming
    /// the secret. The raw secret is wiped when `self` drops at the end
    /// of this call, on the error-free and the panicking path alike.
    #[must_use]
    pub fn derive_subkeys(self) -> (MeshKey, TransportPsk) {
        let mesh = MeshKey(self.derive(MESH_KEY_LABEL));
        let psk = TransportPsk(self.derive(TRANSPORT_PSK_LABEL));
        (mesh, psk)
    }

    fn derive(&self, label: &[u8]) -> [u8; SHARED_SECRET_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.0)
            .expect("HMAC accepts any key length");
        mac.update(label);
        let out = mac.finalize().into_bytes();
        let mut key = [0u8; SHARED_SECRET_LEN];
        key.copy_from_slice(&out);
        key
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// Key bytes in transit inside a control message. Zeroed on drop,
/// redacted in `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyEnvelope(Vec<u8>);

impl KeyEnvelope {
    /// Wraps raw key bytes (for ad hoc data-key distribution).
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Length of the enclosed key material.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the envelope is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for KeyEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyEnvelope([REDACTED; {}])", self.0.len())
    }
}

/// The mesh-encryption key handed to the hardware backend. Not `Clone`;
/// zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MeshKey([u8; SHARED_SECRET_LEN]);

impl MeshKey {
    /// Raw key bytes, for the backend's consumption only.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for MeshKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MeshKey([REDACTED])")
    }
}

/// The pre-shared key for transport authentication. Not `Clone`; zeroed
/// on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TransportPsk([u8; SHARED_SECRET_LEN]);

impl TransportPsk {
    /// Raw key bytes, for the transport layer's consumption only.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for TransportPsk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransportPsk([REDACTED])")
    }
}

/// Identifier of an attested node key: the SHA-256 of its attestation
/// bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeKeyId([u8; 32]);

impl NodeKeyId {
    /// Computes the identifier of an attestation bundle.
    #[must_use]
    pub fn from_bundle(bundle: &[u8]) -> Self {
        let digest = Sha256::digest(bundle);
        let mut id = [0u8; 32];
        id.copy_from_slice(&digest);
        Self(id)
    }

    /// Builds an identifier from raw bytes (tests, wire decode).
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw identifier bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Constant-time equality, for checks on attacker-influenced input.
    #[must_use]
    pub fn ct_eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }

    /// URL-safe base64 form without padding, used for on-disk
    /// session-file names.
    #[must_use]
    pub fn to_base64url(&self) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Parses the base64url form produced by [`Self::to_base64url`].
    #[must_use]
    pub fn from_base64url(encoded: &str) -> Option<Self> {
        use base64::Engine as _;
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .ok()?;
        let id: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(id))
    }
}

impl std::fmt::Display for NodeKeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A short-lived node key vouched for by a hardware-rooted attestation
/// bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestedKey {
    /// Identifier: SHA-256 of `bundle`.
    pub key_id: NodeKeyId,

    /// The opaque attestation bundle.
    pub bundle: Vec<u8>,

    /// When the key expires.
    pub expiry: SystemTime,

    /// Digest of the software release this attestation is scoped to.
    pub release_digest: [u8; 32],

    /// When set, the key is no longer advertised off-node (revoked for
    /// external use) but sessions already bound to it stay valid.
    pub node_only: bool,
}

impl AttestedKey {
    /// Creates a key, deriving `key_id` from the bundle.
    #[must_use]
    pub fn new(bundle: Vec<u8>, expiry: SystemTime, release_digest: [u8; 32]) -> Self {
        Self {
            key_id: NodeKeyId::from_bundle(&bundle),
            bundle,
            expiry,
            release_digest,
            node_only: false,
        }
    }

    /// Returns `true` once `now` has passed the expiry.
    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expiry
    }

    /// The instant the key may be removed from memory and caches:
    /// expiry plus the grace period.
    #[must_use]
    pub fn retire_at(&self, grace: Duration) -> SystemTime {
        self.expiry + grace
    }
}

/// The current attested key plus its not-yet-expired predecessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestedKeySet {
    /// The key currently advertised for new sessions.
    pub current: AttestedKey,

    /// Previously current keys that have rotated out but not yet
    /// retired. Ordered oldest first.
    pub unpublished: Vec<AttestedKey>,
}

impl AttestedKeySet {
    /// A set holding only `current`.
    #[must_use]
    pub const fn new(current: AttestedKey) -> Self {
        Self {
            current,
            unpublished: Vec::new(),
        }
    }

    /// All keys, current first.
    pub fn iter(&self) -> impl Iterator<Item = &AttestedKey> {
        std::iter::once(&self.current).chain(self.unpublished.iter())
    }

    /// All key identifiers considered valid for session admission at
    /// `now`: every non-retired key in the set.
    #[must_use]
    pub fn valid_key_ids(&self, now: SystemTime, grace: Duration) -> Vec<NodeKeyId> {
        self.iter()
            .filter(|k| now < k.retire_at(grace))
            .map(|k| k.key_id)
            .collect()
    }

    /// Keys advertised to external callers: valid and not `node_only`.
    #[must_use]
    pub fn advertised(&self, now: SystemTime, grace: Duration) -> Vec<&AttestedKey> {
        self.iter()
            .filter(|k| !k.node_only && now < k.retire_at(grace))
            .collect()
    }

    /// Looks up a key by identifier.
    #[must_use]
    pub fn find(&self, key_id: &NodeKeyId) -> Option<&AttestedKey> {
        self.iter().find(|k| k.key_id == *key_id)
    }
}

#[cfg(test)]
#[allow(missing_docs)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;

    fn make_key(bundle: &[u8], ttl: Duration) -> AttestedKey {
        AttestedKey::new(bundle.to_vec(), SystemTime::now() + ttl, [0x11; 32])
    }

    // ========================================================================
    // SharedSecret
    // ========================================================================

    #[test]
    fn test_envelope_round_trip() {
        let secret = SharedSecret::generate();
        let envelope = secret.to_envelope();
        let restored = SharedSecret::from_envelope(&envelope).unwrap();
        assert_eq!(secret.0, restored.0);
    }

    #[test]
    fn test_envelope_wrong_length_rejected() {
        let envelope = KeyEnvelope::new(vec![0xAA; 16]);
        assert_eq!(
            SharedSecret::from_envelope(&envelope),
            Err(KeyError::InvalidLength {
                actual: 16,
                expected: SHARED_SECRET_LEN,
            })
        );
    }

    #[test]
    fn test_subkeys_differ_from_secret_and_each_other() {
        let secret = SharedSecret::generate();
        let raw = secret.0;
        let (mesh, psk) = secret.derive_subkeys();
        assert_ne!(mesh.as_bytes(), &raw);
        assert_ne!(psk.as_bytes(), &raw);
        assert_ne!(mesh.as_bytes(), psk.as_bytes());
    }

    #[test]
    fn test_subkey_derivation_is_deterministic() {
        let secret = SharedSecret::generate();
        let copy = SharedSecret(secret.0);
        let (mesh_a, _) = secret.derive_subkeys();
        let (mesh_b, _) = copy.derive_subkeys();
        assert_eq!(mesh_a.as_bytes(), mesh_b.as_bytes());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = SharedSecret::generate();
        assert_eq!(format!("{secret:?}"), "SharedSecret([REDACTED])");
        let envelope = secret.to_envelope();
        assert!(!format!("{envelope:?}").contains("["));
        assert!(format!("{envelope:?}").contains("REDACTED"));
    }

    // ========================================================================
    // NodeKeyId
    // ========================================================================

    #[test]
    fn test_key_id_base64url_round_trip() {
        let id = NodeKeyId::from_bundle(b"test bundle");
        let encoded = id.to_base64url();
        assert!(!encoded.contains('='));
        assert_eq!(NodeKeyId::from_base64url(&encoded), Some(id));
    }

    #[test]
    fn test_key_id_from_base64url_rejects_garbage() {
        assert!(NodeKeyId::from_base64url("not base64!").is_none());
        assert!(NodeKeyId::from_base64url("c2hvcnQ").is_none());
    }

    #[test]
    fn test_key_id_ct_eq() {
        let a = NodeKeyId::from_bundle(b"a");
        let b = NodeKeyId::from_bundle(b"b");
        assert!(a.ct_eq(&a));
        assert!(!a.ct_eq(&b));
    }

    // ========================================================================
    // AttestedKeySet
    // ========================================================================

    #[test]
    fn test_key_set_valid_ids_include_unpublished_until_retired() {
        let grace = Duration::from_secs(300);
        let current = make_key(b"current", Duration::from_secs(3600));
        let old = make_key(b"old", Duration::from_secs(60));
        let mut set = AttestedKeySet::new(current.clone());
        set.unpublished.push(old.clone());

        let now = SystemTime::now();
        let valid = set.valid_key_ids(now, grace);
        assert!(valid.contains(&current.key_id));
        assert!(valid.contains(&old.key_id));

        // Past old's expiry + grace, only the current key remains.
        let later = now + Duration::from_secs(60 + 301);
        let valid = set.valid_key_ids(later, grace);
        assert_eq!(valid, vec![current.key_id]);
    }

    #[test]
    fn test_advertised_excludes_node_only_keys() {
        let grace = Duration::from_secs(300);
        let mut current = make_key(b"current", Duration::from_secs(3600));
        current.node_only = true;
        let set = AttestedKeySet::new(current);
        assert!(set.advertised(SystemTime::now(), grace).is_empty());
        // Still valid for sessions already bound to it.
        assert_eq!(set.valid_key_ids(SystemTime::now(), grace).len(), 1);
    }
}
