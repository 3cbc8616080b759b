//! Core domain logic for the meshd ensemble daemon.
//!
//! This crate holds the pure, runtime-independent parts of meshd:
//!
//! - [`ensemble`]: the formation state machine and per-peer progress
//!   tracking that the coordinator in `meshd-daemon` drives
//! - [`message`]: the self-describing control-message codec exchanged
//!   between ranked nodes
//! - [`key`]: shared-secret and attested-key material types, including
//!   domain-separated sub-key derivation
//! - [`session`]: fixed-width session-key derivation used for replay
//!   detection
//! - [`node`]: validated node and ensemble configuration
//! - [`health`]: the user-visible health surface
//!
//! Nothing in this crate performs I/O or spawns tasks; the daemon crate
//! owns all concurrency and persistence.

pub mod ensemble;
pub mod health;
pub mod key;
pub mod message;
pub mod node;
pub mod session;

pub use ensemble::peer::{PeerProgress, PeerTable, ProgressFlag};
pub use ensemble::status::{EnsembleStatus, Role, StateMachine, TransitionError};
pub use health::{HealthReport, HealthStatus};
pub use key::{AttestedKey, AttestedKeySet, KeyEnvelope, KeyError, MeshKey, NodeKeyId, SharedSecret, TransportPsk};
pub use message::{CodecError, ControlMessage};
pub use node::{ConfigError, EnsembleConfig, NodeConfiguration};
pub use session::{SessionKey, SessionKeyError};
