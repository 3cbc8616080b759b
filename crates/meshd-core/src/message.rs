//! The control-message codec for the ensemble formation protocol.
//!
//! Messages travel point-to-point over the external control channel;
//! sender identity (rank) is supplied by the channel, not the payload.
//! The encoding is self-describing JSON with a `kind` tag and a `body`
//! payload, so future cases can be added without breaking old nodes:
//! an unknown `kind` decodes to [`CodecError::UnknownKind`], which
//! receivers log and drop rather than treating as fatal.

use serde::{Deserialize, Serialize};

use crate::key::KeyEnvelope;

/// Errors produced by the control-message codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CodecError {
    /// Serialization failed.
    #[error("failed to encode control message: {0}")]
    Encode(String),

    /// The payload is not valid JSON or lacks the `kind` tag.
    #[error("malformed control message: {0}")]
    Malformed(String),

    /// The `kind` tag names a case this build does not know.
    /// Receivers log and drop these; they are not fatal.
    #[error("unknown control message kind {kind:?}")]
    UnknownKind {
        /// The unrecognized tag value.
        kind: String,
    },
}

/// One logical control message of the formation protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ControlMessage {
    /// Follower announces itself in its configured slot.
    FollowerAnnounceNode {
        /// The announcing node's rank.
        slot: u32,
    },
    /// Follower accepted the shared mesh key.
    FollowerKeyAccepted,
    /// Follower finished activating its mesh backend.
    FollowerActivationComplete,
    /// Follower finished all local setup.
    FollowerNodeReady,
    /// Follower obtained the ad hoc data key.
    FollowerDataKeyObtained,
    /// Leader distributes the shared mesh key.
    EnsembleAcceptAndShareKey {
        /// The shared secret in transit.
        key: KeyEnvelope,
    },
    /// Leader confirms every node holds the mesh key.
    EnsembleKeyShared,
    /// Leader confirms every node activated the mesh.
    EnsembleActivationComplete,
    /// Leader declares the formation pass complete.
    EnsembleReady,
    /// Leader distributes an ad hoc data key.
    EnsembleShareDataKey {
        /// The data key in transit.
        key: KeyEnvelope,
        /// Caller-supplied correlation token.
        token: String,
    },
    /// A peer reports terminal failure. Receivers fail locally without
    /// re-broadcasting.
    EnsembleFailed {
        /// Human-readable failure reason.
        reason: String,
    },
    /// The sender has begun draining.
    EnsembleDraining,
    /// Generic pass-through payload for upper layers.
    ForwardMessage {
        /// Opaque payload bytes.
        payload: Vec<u8>,
    },
    /// Connectivity test payload.
    TestMessage {
        /// Opaque payload bytes.
        payload: Vec<u8>,
    },
}

/// Every `kind` tag this build understands, in declaration order.
const KNOWN_KINDS: &[&str] = &[
    "follower_announce_node",
    "follower_key_accepted",
    "follower_activation_complete",
    "follower_node_ready",
    "follower_data_key_obtained",
    "ensemble_accept_and_share_key",
    "ensemble_key_shared",
    "ensemble_activation_complete",
    "ensemble_ready",
    "ensemble_share_data_key",
    "ensemble_failed",
    "ensemble_draining",
    "forward_message",
    "test_message",
];

impl ControlMessage {
    /// The `kind` tag this message encodes with.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::FollowerAnnounceNode { .. } => "follower_announce_node",
            Self::FollowerKeyAccepted => "follower_key_accepted",
            Self::FollowerActivationComplete => "follower_activation_complete",
            Self::FollowerNodeReady => "follower_node_ready",
            Self::FollowerDataKeyObtained => "follower_data_key_obtained",
            Self::EnsembleAcceptAndShareKey { .. } => "ensemble_accept_and_share_key",
            Self::EnsembleKeyShared => "ensemble_key_shared",
            Self::EnsembleActivationComplete => "ensemble_activation_complete",
            Self::EnsembleReady => "ensemble_ready",
            Self::EnsembleShareDataKey { .. } => "ensemble_share_data_key",
            Self::EnsembleFailed { .. } => "ensemble_failed",
            Self::EnsembleDraining => "ensemble_draining",
            Self::ForwardMessage { .. } => "forward_message",
            Self::TestMessage { .. } => "test_message",
        }
    }

    /// Encodes the message for the control channel.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Decodes a message delivered by the control channel.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] for invalid JSON or a missing
    /// tag, and [`CodecError::UnknownKind`] for a tag this build does
    /// not recognize (log and drop, never fatal).
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;

        let kind = value
            .get("kind")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| CodecError::Malformed("missing kind tag".to_string()))?;

        if !KNOWN_KINDS.contains(&kind) {
            return Err(CodecError::UnknownKind {
                kind: kind.to_string(),
            });
        }

        serde_json::from_value(value).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
#[allow(missing_docs)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<ControlMessage> {
        vec![
            ControlMessage::FollowerAnnounceNode { slot: 3 },
            ControlMessage::FollowerKeyAccepted,
            ControlMessage::FollowerActivationComplete,
            ControlMessage::FollowerNodeReady,
            ControlMessage::FollowerDataKeyObtained,
            ControlMessage::EnsembleAcceptAndShareKey {
                key: KeyEnvelope::new(vec![0x42; 32]),
            },
            ControlMessage::EnsembleKeyShared,
            ControlMessage::EnsembleActivationComplete,
            ControlMessage::EnsembleReady,
            ControlMessage::EnsembleShareDataKey {
                key: KeyEnvelope::new(vec![0x17; 32]),
                token: "token-1".to_string(),
            },
            ControlMessage::EnsembleFailed {
                reason: "watchdog expired".to_string(),
            },
            ControlMessage::EnsembleDraining,
            ControlMessage::ForwardMessage {
                payload: vec![1, 2, 3],
            },
            ControlMessage::TestMessage { payload: vec![] },
        ]
    }

    #[test]
    fn test_encode_decode_all_variants() {
        for message in all_variants() {
            let bytes = message.encode().unwrap();
            let decoded = ControlMessage::decode(&bytes).unwrap();
            assert_eq!(message, decoded);
        }
    }

    #[test]
    fn test_kind_matches_wire_tag() {
        for message in all_variants() {
            let bytes = message.encode().unwrap();
            let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(value["kind"].as_str().unwrap(), message.kind());
            assert!(KNOWN_KINDS.contains(&message.kind()));
        }
    }

    #[test]
    fn test_unknown_kind_rejected_distinctly() {
        let bytes = br#"{"kind":"ensemble_quiesce","body":null}"#;
        let err = ControlMessage::decode(bytes).unwrap_err();
        assert_eq!(
            err,
            CodecError::UnknownKind {
                kind: "ensemble_quiesce".to_string(),
            }
        );
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        assert!(matches!(
            ControlMessage::decode(b"not json"),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            ControlMessage::decode(br#"{"body":{}}"#),
            Err(CodecError::Malformed(_))
        ));
        // Known kind, wrong body shape.
        assert!(matches!(
            ControlMessage::decode(br#"{"kind":"follower_announce_node","body":{"slot":"x"}}"#),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_key_bearing_messages_redact_debug() {
        let message = ControlMessage::EnsembleAcceptAndShareKey {
            key: KeyEnvelope::new(vec![0xAB; 32]),
        };
        let debug = format!("{message:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("171"));
    }
}
