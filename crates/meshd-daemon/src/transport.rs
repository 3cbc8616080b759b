//! Seams to the external collaborators: the control channel, the
//! hardware mesh backend, and the follower client pool.
//!
//! All three are thin interfaces by design. The daemon only needs
//! send-to-rank delivery of opaque bytes, activate/deactivate of the
//! mesh, and a readiness view over follower connections; the real
//! implementations live outside this crate. In-memory implementations
//! are provided for tests and for the single-node shortcut.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use meshd_core::key::MeshKey;
use tokio::sync::mpsc;

/// Errors surfaced by the control channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// No route to the given rank.
    #[error("no channel to rank {rank}")]
    NoRoute {
        /// The unreachable rank.
        rank: u32,
    },

    /// The peer's receive side is gone.
    #[error("send to rank {rank} failed: {reason}")]
    SendFailed {
        /// The destination rank.
        rank: u32,
        /// Transport-level reason.
        reason: String,
    },
}

/// Errors surfaced by the mesh backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum MeshError {
    /// Activation failed.
    #[error("mesh activation failed: {0}")]
    Activation(String),

    /// Deactivation failed. Best-effort callers log this and move on.
    #[error("mesh deactivation failed: {0}")]
    Deactivation(String),
}

/// Reliable point-to-point delivery of encoded control messages
/// between ranked nodes.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Sends one encoded message to `rank`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the message could not be handed to
    /// the transport.
    async fn send_to_rank(&self, rank: u32, bytes: Vec<u8>) -> Result<(), ChannelError>;
}

/// The hardware interconnect the ensemble activates. Opaque here.
#[async_trait]
pub trait MeshBackend: Send + Sync {
    /// Installs the derived mesh key and brings the interconnect up.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Activation`] on failure.
    async fn activate(&self, mesh_key: MeshKey) -> Result<(), MeshError>;

    /// Installs a rotated mesh key without bouncing the interconnect.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Activation`] on failure.
    async fn install_key(&self, mesh_key: MeshKey) -> Result<(), MeshError>;

    /// Tears the interconnect down. Called best-effort on failure
    /// paths.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Deactivation`] on failure.
    async fn deactivate(&self) -> Result<(), MeshError>;
}

/// Leader-side view of the client connections to each follower.
pub trait FollowerClients: Send + Sync {
    /// Starts dialing every follower. Idempotent.
    fn start(&self);

    /// Ranks whose connection is established and ready.
    fn ready_ranks(&self) -> Vec<u32>;
}

// ============================================================================
// In-memory / stub implementations
// ============================================================================

/// Mesh backend for single-node ensembles and tests: activation is a
/// no-op that only records the call.
#[derive(Debug, Default)]
pub struct StubMeshBackend {
    activated: Mutex<bool>,
}

impl StubMeshBackend {
    /// Creates an inactive stub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `activate` has been called more recently than
    /// `deactivate`.
    #[must_use]
    pub fn is_activated(&self) -> bool {
        *self.activated.lock().expect("stub mesh lock")
    }
}

#[async_trait]
impl MeshBackend for StubMeshBackend {
    async fn activate(&self, _mesh_key: MeshKey) -> Result<(), MeshError> {
        *self.activated.lock().expect("stub mesh lock") = true;
        Ok(())
    }

    async fn install_key(&self, _mesh_key: MeshKey) -> Result<(), MeshError> {
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), MeshError> {
        *self.activated.lock().expect("stub mesh lock") = false;
        Ok(())
    }
}

/// An in-memory control channel backed by per-rank mpsc queues.
///
/// Ranks without a registered queue produce [`ChannelError::NoRoute`],
/// which exercises the coordinator's partial-failure broadcast path.
#[derive(Debug, Default)]
pub struct InMemoryControlChannel {
    routes: Mutex<HashMap<u32, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl InMemoryControlChannel {
    /// Creates a channel with no routes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a delivery queue for `rank`, returning its receiver.
    pub fn register(&self, rank: u32) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().expect("route lock").insert(rank, tx);
        rx
    }

    /// Drops the route to `rank`, simulating a vanished peer.
    pub fn disconnect(&self, rank: u32) {
        self.routes.lock().expect("route lock").remove(&rank);
    }
}

#[async_trait]
impl ControlChannel for InMemoryControlChannel {
    async fn send_to_rank(&self, rank: u32, bytes: Vec<u8>) -> Result<(), ChannelError> {
        let sender = {
            let routes = self.routes.lock().expect("route lock");
            routes.get(&rank).cloned()
        };
        let sender = sender.ok_or(ChannelError::NoRoute { rank })?;
        sender.send(bytes).map_err(|e| ChannelError::SendFailed {
            rank,
            reason: e.to_string(),
        })
    }
}

/// Follower client pool whose readiness is driven externally. Used in
/// tests and by transports that manage their own dialing.
#[derive(Debug, Default)]
pub struct StaticFollowerClients {
    ready: Mutex<Vec<u32>>,
}

impl StaticFollowerClients {
    /// Creates a pool with no ready ranks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pool that reports every rank in `ranks` ready.
    #[must_use]
    pub fn with_ready(ranks: Vec<u32>) -> Self {
        Self {
            ready: Mutex::new(ranks),
        }
    }

    /// Marks `rank` ready.
    pub fn mark_ready(&self, rank: u32) {
        let mut ready = self.ready.lock().expect("ready lock");
        if !ready.contains(&rank) {
            ready.push(rank);
        }
    }
}

impl FollowerClients for StaticFollowerClients {
    fn start(&self) {}

    fn ready_ranks(&self) -> Vec<u32> {
        self.ready.lock().expect("ready lock").clone()
    }
}

#[cfg(test)]
#[allow(missing_docs)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_channel_delivers_to_registered_rank() {
        let channel = InMemoryControlChannel::new();
        let mut rx = channel.register(2);
        channel.send_to_rank(2, vec![1, 2, 3]).await.unwrap();
        assert_eq!(rx.recv().await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_in_memory_channel_no_route() {
        let channel = InMemoryControlChannel::new();
        assert_eq!(
            channel.send_to_rank(7, vec![]).await,
            Err(ChannelError::NoRoute { rank: 7 })
        );
    }

    #[tokio::test]
    async fn test_disconnect_removes_route() {
        let channel = InMemoryControlChannel::new();
        let _rx = channel.register(1);
        channel.disconnect(1);
        assert!(channel.send_to_rank(1, vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_stub_backend_tracks_activation() {
        let backend = StubMeshBackend::new();
        assert!(!backend.is_activated());
        let (mesh_key, _psk) = meshd_core::key::SharedSecret::generate().derive_subkeys();
        backend.activate(mesh_key).await.unwrap();
        assert!(backend.is_activated());
        backend.deactivate().await.unwrap();
        assert!(!backend.is_activated());
    }
}
