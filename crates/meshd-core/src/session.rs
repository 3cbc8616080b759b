//! Session-key derivation for replay detection.
//!
//! A [`SessionKey`] is a fixed-width slice of the high-entropy key
//! exchange material at the front of an encrypted request payload. It
//! is used purely to detect replays, never for encryption, so only
//! [`SESSION_KEY_LEN`] bytes are taken: at 16 bytes the birthday-bound
//! collision probability over a node key's lifetime is negligible.
//!
//! The all-zero value is illegal and rejected at construction; the
//! replay store uses it as a corruption sentinel when validating
//! on-disk records.

use subtle::ConstantTimeEq;

/// Width of a session key in bytes.
pub const SESSION_KEY_LEN: usize = 16;

/// Required first byte of an encrypted session payload.
pub const PAYLOAD_SENTINEL: u8 = 0x04;

/// Minimum total payload length. Anything shorter cannot contain the
/// key-exchange material.
pub const MIN_PAYLOAD_LEN: usize = 56;

/// Offset of the key-exchange material within the payload.
pub const KEY_MATERIAL_OFFSET: usize = 8;

/// Errors produced while deriving a session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SessionKeyError {
    /// The payload's first byte is not [`PAYLOAD_SENTINEL`].
    #[error("payload does not start with the session sentinel byte")]
    BadSentinel,

    /// The payload is shorter than [`MIN_PAYLOAD_LEN`].
    #[error("payload too short: {actual} < {min} bytes", min = MIN_PAYLOAD_LEN)]
    TooShort {
        /// Observed payload length.
        actual: usize,
    },

    /// The derived key is all zeroes, which is reserved as a
    /// corruption sentinel and never valid.
    #[error("session key material is all zeroes")]
    AllZero,
}

/// A fixed-width replay-detection key scoped to one node key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Builds a key from raw bytes, rejecting the all-zero value.
    ///
    /// # Errors
    ///
    /// Returns [`SessionKeyError::AllZero`] for the reserved all-zero
    /// value.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Result<Self, SessionKeyError> {
        let zero = [0u8; SESSION_KEY_LEN];
        if bool::from(bytes.ct_eq(&zero)) {
            return Err(SessionKeyError::AllZero);
        }
        Ok(Self(bytes))
    }

    /// Derives the key from an encrypted session payload.
    ///
    /// Validates the minimum header format (sentinel first byte,
    /// length threshold) and slices the fixed-offset key-exchange
    /// region.
    ///
    /// # Errors
    ///
    /// Returns [`SessionKeyError::BadSentinel`], [`SessionKeyError::TooShort`],
    /// or [`SessionKeyError::AllZero`].
    pub fn from_payload(payload: &[u8]) -> Result<Self, SessionKeyError> {
        if payload.first() != Some(&PAYLOAD_SENTINEL) {
            return Err(SessionKeyError::BadSentinel);
        }
        if payload.len() < MIN_PAYLOAD_LEN {
            return Err(SessionKeyError::TooShort {
                actual: payload.len(),
            });
        }
        let mut bytes = [0u8; SESSION_KEY_LEN];
        bytes.copy_from_slice(&payload[KEY_MATERIAL_OFFSET..KEY_MATERIAL_OFFSET + SESSION_KEY_LEN]);
        Self::from_bytes(bytes)
    }

    /// Raw key bytes, used for the on-disk record format.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

#[cfg(test)]
#[allow(missing_docs)]
mod tests {
    use super::*;

    fn make_payload(len: usize) -> Vec<u8> {
        let mut payload = vec![0u8; len];
        payload[0] = PAYLOAD_SENTINEL;
        for (i, byte) in payload.iter_mut().enumerate().skip(1) {
            *byte = (i % 251 + 1) as u8;
        }
        payload
    }

    #[test]
    fn test_derives_fixed_slice() {
        let payload = make_payload(MIN_PAYLOAD_LEN);
        let key = SessionKey::from_payload(&payload).unwrap();
        assert_eq!(
            key.as_bytes(),
            &payload[KEY_MATERIAL_OFFSET..KEY_MATERIAL_OFFSET + SESSION_KEY_LEN]
        );
    }

    #[test]
    fn test_rejects_bad_sentinel() {
        let mut payload = make_payload(MIN_PAYLOAD_LEN);
        payload[0] = 0x05;
        assert_eq!(
            SessionKey::from_payload(&payload),
            Err(SessionKeyError::BadSentinel)
        );
        assert_eq!(
            SessionKey::from_payload(&[]),
            Err(SessionKeyError::BadSentinel)
        );
    }

    #[test]
    fn test_rejects_short_payload() {
        let payload = make_payload(MIN_PAYLOAD_LEN - 1);
        assert_eq!(
            SessionKey::from_payload(&payload),
            Err(SessionKeyError::TooShort {
                actual: MIN_PAYLOAD_LEN - 1,
            })
        );
    }

    #[test]
    fn test_rejects_all_zero_key() {
        assert_eq!(
            SessionKey::from_bytes([0u8; SESSION_KEY_LEN]),
            Err(SessionKeyError::AllZero)
        );

        let mut payload = make_payload(MIN_PAYLOAD_LEN);
        payload[KEY_MATERIAL_OFFSET..KEY_MATERIAL_OFFSET + SESSION_KEY_LEN].fill(0);
        assert_eq!(
            SessionKey::from_payload(&payload),
            Err(SessionKeyError::AllZero)
        );
    }

    #[test]
    fn test_non_zero_key_accepted() {
        let mut bytes = [0u8; SESSION_KEY_LEN];
        bytes[15] = 1;
        let key = SessionKey::from_bytes(bytes).unwrap();
        assert_eq!(key.as_bytes(), &bytes);
    }
}
