//! The ensemble formation coordinator.
//!
//! One [`Coordinator`] runs per node as a single-writer actor: every
//! state-changing event (inbound control messages, operator requests,
//! watchdog expiry) is linearized through one `mpsc` event loop, so the
//! flag-aggregation predicates never race. Broadcasts, the connection
//! poller, and the watchdog run as separate tasks but only read state
//! or enqueue events; they never mutate the [`StateMachine`] or the
//! [`PeerTable`] directly.
//!
//! The leader (rank 0) drives the formation rounds: it aggregates
//! per-follower progress flags and broadcasts the next round's message
//! once each monotone all-flags-true predicate holds. Followers react
//! to each inbound leader message with exactly one reply, guarded by an
//! idempotency check that drops duplicate or late messages without
//! re-emitting anything.

pub mod monitor;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use meshd_core::ensemble::peer::{PeerTable, ProgressFlag};
use meshd_core::ensemble::status::{EnsembleStatus, Role, StateMachine, TransitionError};
use meshd_core::key::{KeyEnvelope, SharedSecret, TransportPsk};
use meshd_core::message::{CodecError, ControlMessage};
use meshd_core::node::EnsembleConfig;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TimeoutConfig;
use crate::transport::{ControlChannel, FollowerClients, MeshBackend};

/// Duplicate data-key distributions are detected within a sliding
/// window of this many tokens; re-sends always land well inside it.
const DATA_KEY_TOKEN_WINDOW: usize = 64;

/// Errors surfaced by coordinator operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CoordinatorError {
    /// The state machine rejected a transition; fatal for the attempt.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The formation attempt reached a terminal failure state.
    #[error("ensemble failed: {reason}")]
    EnsembleFailed {
        /// Human-readable failure reason.
        reason: String,
    },

    /// The operation is only valid on the other role.
    #[error("operation not valid for role {role}", role = role.as_str())]
    WrongRole {
        /// This node's role.
        role: Role,
    },

    /// The operation is not valid in the current status.
    #[error("operation not valid in status {status}")]
    WrongStatus {
        /// The status at the time of the request.
        status: EnsembleStatus,
    },

    /// The coordinator task has shut down.
    #[error("coordinator is shut down")]
    Shutdown,
}

type Responder = oneshot::Sender<Result<(), CoordinatorError>>;

/// Events linearized through the coordinator loop.
pub(crate) enum CoordinatorEvent {
    /// An encoded control message delivered by the channel.
    Inbound {
        /// Rank the channel attributes the message to.
        from_rank: u32,
        /// Encoded message bytes.
        bytes: Vec<u8>,
    },
    /// Start the formation attempt.
    Activate {
        /// Resolved when the node reaches `Ready` or fails.
        respond: Responder,
    },
    /// Leader only: start a key-rotation pass.
    RotateKey {
        /// Resolved when the rotation pass completes or fails.
        respond: Responder,
    },
    /// Leader only: distribute an ad hoc data key.
    DistributeDataKey {
        /// The data key to distribute.
        key: KeyEnvelope,
        /// Correlation token for this distribution.
        token: String,
        /// Resolved once all followers confirm or the wait expires.
        respond: Responder,
    },
    /// The node has begun draining.
    Drain,
    /// All follower client connections are ready.
    ConnectionsReady,
    /// The bounded data-key confirmation wait expired.
    DataKeyWaitExpired,
    /// The formation watchdog expired. Terminal.
    WatchdogExpired,
    /// Stop the loop.
    Shutdown,
}

/// Cloneable handle to a running [`Coordinator`].
#[derive(Clone)]
pub struct CoordinatorHandle {
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    status_rx: watch::Receiver<EnsembleStatus>,
    psk_rx: watch::Receiver<Option<Arc<TransportPsk>>>,
}

impl CoordinatorHandle {
    /// The current committed status.
    #[must_use]
    pub fn status(&self) -> EnsembleStatus {
        *self.status_rx.borrow()
    }

    /// A watch over status changes.
    #[must_use]
    pub fn status_watch(&self) -> watch::Receiver<EnsembleStatus> {
        self.status_rx.clone()
    }

    /// A watch over the transport PSK derived from the shared key.
    #[must_use]
    pub fn psk_watch(&self) -> watch::Receiver<Option<Arc<TransportPsk>>> {
        self.psk_rx.clone()
    }

    /// Feeds one channel-delivered message into the loop. Called by
    /// the transport receive pump.
    pub fn inject(&self, from_rank: u32, bytes: Vec<u8>) {
        let _ = self.events.send(CoordinatorEvent::Inbound { from_rank, bytes });
    }

    /// Starts the formation attempt and waits for `Ready`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError`] if formation fails or the
    /// coordinator shut down.
    pub async fn activate(&self) -> Result<(), CoordinatorError> {
        self.request(|respond| CoordinatorEvent::Activate { respond })
            .await
    }

    /// Starts a key-rotation pass (leader only) and waits for it to
    /// complete.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::WrongRole`] on a follower,
    /// [`CoordinatorError::WrongStatus`] unless the ensemble is
    /// `Ready`, or a failure/shutdown error.
    pub async fn rotate_key(&self) -> Result<(), CoordinatorError> {
        self.request(|respond| CoordinatorEvent::RotateKey { respond })
            .await
    }

    /// Distributes an ad hoc data key to all followers (leader only)
    /// and waits, bounded by the configured data-key wait, for their
    /// confirmations. The wait is tolerant of a miss: expiry logs the
    /// lagging ranks and still resolves successfully.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError`] if the request is invalid for this
    /// role/status or the coordinator shut down.
    pub async fn distribute_data_key(
        &self,
        key: KeyEnvelope,
        token: String,
    ) -> Result<(), CoordinatorError> {
        self.request(|respond| CoordinatorEvent::DistributeDataKey { key, token, respond })
            .await
    }

    /// Marks the node as draining and notifies peers.
    pub fn drain(&self) {
        let _ = self.events.send(CoordinatorEvent::Drain);
    }

    /// Stops the coordinator loop.
    pub fn shutdown(&self) {
        let _ = self.events.send(CoordinatorEvent::Shutdown);
    }

    async fn request(
        &self,
        make: impl FnOnce(Responder) -> CoordinatorEvent,
    ) -> Result<(), CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(make(tx))
            .map_err(|_| CoordinatorError::Shutdown)?;
        rx.await.map_err(|_| CoordinatorError::Shutdown)?
    }
}

/// The ensemble formation actor. Owns all mutable formation state.
pub struct Coordinator {
    ensemble: EnsembleConfig,
    local_rank: u32,
    timeouts: TimeoutConfig,
    channel: Arc<dyn ControlChannel>,
    backend: Arc<dyn MeshBackend>,
    clients: Arc<dyn FollowerClients>,

    machine: StateMachine,
    peers: PeerTable,
    shared_secret: Option<SharedSecret>,
    rotation_pass: bool,
    connection_wait_started: bool,
    draining: bool,
    seen_data_key_tokens: HashSet<String>,
    data_key_token_order: VecDeque<String>,

    pending_formation: Option<Responder>,
    pending_data_key: Option<Responder>,

    events_tx: mpsc::UnboundedSender<CoordinatorEvent>,
    events_rx: mpsc::UnboundedReceiver<CoordinatorEvent>,
    status_tx: watch::Sender<EnsembleStatus>,
    psk_tx: watch::Sender<Option<Arc<TransportPsk>>>,
}

impl Coordinator {
    /// Spawns a coordinator for the local node.
    ///
    /// `local_rank` must name a node in `ensemble`; rank 0 takes the
    /// leader role.
    #[must_use]
    pub fn spawn(
        ensemble: EnsembleConfig,
        local_rank: u32,
        timeouts: TimeoutConfig,
        channel: Arc<dyn ControlChannel>,
        backend: Arc<dyn MeshBackend>,
        clients: Arc<dyn FollowerClients>,
    ) -> (CoordinatorHandle, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(EnsembleStatus::Initializing);
        let (psk_tx, psk_rx) = watch::channel(None);

        let peers = PeerTable::from_config(&ensemble);
        let coordinator = Self {
            ensemble,
            local_rank,
            timeouts,
            channel,
            backend,
            clients,
            machine: StateMachine::new(Role::from_rank(local_rank)),
            peers,
            shared_secret: None,
            rotation_pass: false,
            connection_wait_started: false,
            draining: false,
            seen_data_key_tokens: HashSet::new(),
            data_key_token_order: VecDeque::new(),
            pending_formation: None,
            pending_data_key: None,
            events_tx: events_tx.clone(),
            events_rx,
            status_tx,
            psk_tx,
        };

        let handle = CoordinatorHandle {
            events: events_tx,
            status_rx,
            psk_rx,
        };
        let join = tokio::spawn(coordinator.run());
        (handle, join)
    }

    const fn role(&self) -> Role {
        self.machine.role()
    }

    async fn run(mut self) {
        while let Some(event) = self.events_rx.recv().await {
            match event {
                CoordinatorEvent::Inbound { from_rank, bytes } => {
                    self.handle_inbound(from_rank, &bytes).await;
                },
                CoordinatorEvent::Activate { respond } => {
                    self.handle_activate(respond).await;
                },
                CoordinatorEvent::RotateKey { respond } => {
                    self.handle_rotate(respond).await;
                },
                CoordinatorEvent::DistributeDataKey { key, token, respond } => {
                    self.handle_distribute_data_key(key, token, respond).await;
                },
                CoordinatorEvent::Drain => {
                    self.handle_drain().await;
                },
                CoordinatorEvent::ConnectionsReady => {
                    self.handle_connections_ready().await;
                },
                CoordinatorEvent::DataKeyWaitExpired => {
                    self.handle_data_key_wait_expired();
                },
                CoordinatorEvent::WatchdogExpired => {
                    self.handle_watchdog_expired().await;
                },
                CoordinatorEvent::Shutdown => {
                    break;
                },
            }
        }
        debug!(rank = self.local_rank, "coordinator loop stopped");
    }

    // ========================================================================
    // Event entry points
    // ========================================================================

    async fn handle_inbound(&mut self, from_rank: u32, bytes: &[u8]) {
        let message = match ControlMessage::decode(bytes) {
            Ok(message) => message,
            Err(CodecError::UnknownKind { kind }) => {
                warn!(from_rank, kind, "dropping control message of unknown kind");
                return;
            },
            Err(err) => {
                warn!(from_rank, %err, "dropping malformed control message");
                return;
            },
        };

        if self.ensemble.node_at_rank(from_rank).is_none() {
            warn!(from_rank, kind = message.kind(), "dropping message from unconfigured rank");
            return;
        }

        match self.role() {
            Role::Leader => self.leader_handle(from_rank, message).await,
            Role::Follower => self.follower_handle(from_rank, message).await,
        }
    }

    async fn handle_activate(&mut self, respond: Responder) {
        let status = self.machine.status();
        if status != EnsembleStatus::Initializing {
            let _ = respond.send(Err(CoordinatorError::WrongStatus { status }));
            return;
        }

        if let Err(err) = self.run_init_checks() {
            let _ = respond.send(Err(err));
            return;
        }

        // Single-node ensembles skip key distribution and mesh
        // activation entirely; the stub backend never gets called.
        if self.ensemble.is_single_node() {
            info!("single-node ensemble: taking the shortcut to ready");
            if let Err(err) = self.goto(EnsembleStatus::Ready) {
                let _ = respond.send(Err(err.into()));
                return;
            }
            let _ = respond.send(Ok(()));
            return;
        }

        self.pending_formation = Some(respond);
        self.rotation_pass = false;
        monitor::arm(
            self.timeouts.formation_timeout(),
            self.status_tx.subscribe(),
            self.events_tx.clone(),
        );

        match self.role() {
            Role::Leader => {
                if self.try_goto(EnsembleStatus::Coordinating).await.is_ok() {
                    self.clients.start();
                }
            },
            Role::Follower => {
                if self.try_goto(EnsembleStatus::Coordinating).await.is_ok() {
                    // Announce immediately, then keep re-announcing at
                    // the poll interval until the leader moves us past
                    // coordination. The leader's idempotent flag check
                    // absorbs duplicates, and re-sending covers an
                    // announce that raced ahead of the leader's own
                    // transition into Coordinating.
                    let announce = ControlMessage::FollowerAnnounceNode {
                        slot: self.local_rank,
                    };
                    self.send_to_leader(&announce).await;
                    if let Ok(bytes) = announce.encode() {
                        let channel = Arc::clone(&self.channel);
                        let mut status_rx = self.status_tx.subscribe();
                        let poll = self.timeouts.connection_poll();
                        tokio::spawn(async move {
                            loop {
                                tokio::time::sleep(poll).await;
                                if *status_rx.borrow_and_update()
                                    != EnsembleStatus::Coordinating
                                {
                                    return;
                                }
                                if let Err(err) = channel.send_to_rank(0, bytes.clone()).await {
                                    warn!(%err, "re-announce to leader failed");
                                }
                            }
                        });
                    }
                }
            },
        }
    }

    async fn handle_rotate(&mut self, respond: Responder) {
        if self.role() != Role::Leader {
            let _ = respond.send(Err(CoordinatorError::WrongRole { role: self.role() }));
            return;
        }
        let status = self.machine.status();
        if status != EnsembleStatus::Ready {
            let _ = respond.send(Err(CoordinatorError::WrongStatus { status }));
            return;
        }

        info!("starting mesh key rotation pass");
        self.pending_formation = Some(respond);
        self.rotation_pass = true;
        // A new pass: progress flags reset, activation state survives.
        self.peers.reset_for_new_pass();
        monitor::arm(
            self.timeouts.formation_timeout(),
            self.status_tx.subscribe(),
            self.events_tx.clone(),
        );

        if self.try_goto(EnsembleStatus::RedistributingMeshKey).await.is_err() {
            return;
        }
        let secret = SharedSecret::generate();
        let envelope = secret.to_envelope();
        self.shared_secret = Some(secret);
        self.broadcast(&ControlMessage::EnsembleAcceptAndShareKey { key: envelope })
            .await;
    }

    async fn handle_distribute_data_key(
        &mut self,
        key: KeyEnvelope,
        token: String,
        respond: Responder,
    ) {
        if self.role() != Role::Leader {
            let _ = respond.send(Err(CoordinatorError::WrongRole { role: self.role() }));
            return;
        }
        let status = self.machine.status();
        if status.is_terminal() {
            let _ = respond.send(Err(CoordinatorError::WrongStatus { status }));
            return;
        }

        self.peers.start_data_key_pass();

        self.broadcast(&ControlMessage::EnsembleShareDataKey { key, token })
            .await;

        if self.peers.all_marked(ProgressFlag::DataKeyShared) {
            // Single-node: trivially confirmed.
            let _ = respond.send(Ok(()));
            return;
        }

        self.pending_data_key = Some(respond);
        let events = self.events_tx.clone();
        let wait = self.timeouts.data_key_wait();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = events.send(CoordinatorEvent::DataKeyWaitExpired);
        });
    }

    async fn handle_drain(&mut self) {
        if self.draining || self.machine.status().is_terminal() {
            return;
        }
        self.draining = true;
        info!("node is draining");
        match self.role() {
            Role::Leader => self.broadcast(&ControlMessage::EnsembleDraining).await,
            Role::Follower => self.send_to_leader(&ControlMessage::EnsembleDraining).await,
        }
    }

    async fn handle_connections_ready(&mut self) {
        // Late event from a superseded pass.
        if self.machine.status() != EnsembleStatus::Coordinating {
            return;
        }
        if self.try_goto(EnsembleStatus::DistributingMeshKey).await.is_err() {
            return;
        }
        let secret = SharedSecret::generate();
        let envelope = secret.to_envelope();
        self.shared_secret = Some(secret);
        self.broadcast(&ControlMessage::EnsembleAcceptAndShareKey { key: envelope })
            .await;
    }

    fn handle_data_key_wait_expired(&mut self) {
        if let Some(respond) = self.pending_data_key.take() {
            let lagging = self.peers.lagging_ranks(ProgressFlag::DataKeyShared);
            warn!(
                ?lagging,
                "data key confirmation wait expired; continuing without laggards"
            );
            let _ = respond.send(Ok(()));
        }
    }

    async fn handle_watchdog_expired(&mut self) {
        let status = self.machine.status();
        if status == EnsembleStatus::Ready || status.is_terminal() {
            return;
        }
        let diagnosis = monitor::diagnose(status, &self.peers, self.ensemble.node_count());
        self.ensemble_failed(&diagnosis, true).await;
    }

    // ========================================================================
    // Leader handlers
    // ========================================================================

    async fn leader_handle(&mut self, from_rank: u32, message: ControlMessage) {
        let Some(udid) = self
            .ensemble
            .node_at_rank(from_rank)
            .map(|n| n.udid.clone())
        else {
            return;
        };

        match message {
            ControlMessage::FollowerAnnounceNode { slot } => {
                if slot != from_rank {
                    warn!(from_rank, slot, "announce slot does not match channel rank; dropping");
                    return;
                }
                self.leader_mark_and_check_found(&udid).await;
            },
            ControlMessage::FollowerKeyAccepted => {
                self.leader_mark_and_check_key_shared(&udid).await;
            },
            ControlMessage::FollowerActivationComplete => {
                self.leader_mark_and_check_activated(&udid).await;
            },
            ControlMessage::FollowerNodeReady => {
                self.leader_mark_and_check_node_ready(&udid).await;
            },
            ControlMessage::FollowerDataKeyObtained => {
                self.leader_mark_and_check_data_key(&udid);
            },
            ControlMessage::EnsembleFailed { reason } => {
                self.peer_reported_failure(from_rank, &reason).await;
            },
            ControlMessage::EnsembleDraining => {
                debug!(from_rank, "peer is draining");
            },
            ControlMessage::ForwardMessage { payload } | ControlMessage::TestMessage { payload } => {
                debug!(from_rank, len = payload.len(), "pass-through message ignored");
            },
            other => {
                // A leader-originated case echoed back at us.
                debug!(from_rank, kind = other.kind(), "extraneous message for leader; dropping");
            },
        }
    }

    async fn leader_mark_and_check_found(&mut self, udid: &str) {
        if self.machine.status() != EnsembleStatus::Coordinating {
            debug!(udid, "extraneous announce; dropping");
            return;
        }
        self.peers.mark(udid, ProgressFlag::Found);
        if !self.peers.all_marked(ProgressFlag::Found) || self.connection_wait_started {
            return;
        }
        self.connection_wait_started = true;
        info!("all nodes found; waiting for follower connections");

        // Poll connection readiness at a fixed interval off the loop;
        // the watchdog bounds the overall wait.
        let clients = Arc::clone(&self.clients);
        let events = self.events_tx.clone();
        let mut status_rx = self.status_tx.subscribe();
        let poll = self.timeouts.connection_poll();
        let follower_ranks: Vec<u32> = self
            .ensemble
            .nodes
            .iter()
            .map(|n| n.rank)
            .filter(|r| *r != 0)
            .collect();
        tokio::spawn(async move {
            loop {
                if *status_rx.borrow_and_update() != EnsembleStatus::Coordinating {
                    return;
                }
                let ready = clients.ready_ranks();
                if follower_ranks.iter().all(|r| ready.contains(r)) {
                    let _ = events.send(CoordinatorEvent::ConnectionsReady);
                    return;
                }
                tokio::time::sleep(poll).await;
            }
        });
    }

    async fn leader_mark_and_check_key_shared(&mut self, udid: &str) {
        let status = self.machine.status();
        if status != EnsembleStatus::DistributingMeshKey
            && status != EnsembleStatus::RedistributingMeshKey
        {
            debug!(udid, "extraneous key-accepted; dropping");
            return;
        }
        self.peers.mark(udid, ProgressFlag::KeyShared);
        if !self.peers.all_marked(ProgressFlag::KeyShared) {
            return;
        }

        if self.try_goto(EnsembleStatus::DistributedMeshKey).await.is_err() {
            return;
        }
        self.broadcast(&ControlMessage::EnsembleKeyShared).await;

        // Install the derived mesh key locally. The raw shared secret
        // is consumed and wiped here, success or failure.
        let Some(secret) = self.shared_secret.take() else {
            self.ensemble_failed("shared key missing at distribution completion", true)
                .await;
            return;
        };
        let (mesh_key, psk) = secret.derive_subkeys();
        let _ = self.psk_tx.send(Some(Arc::new(psk)));

        if self.rotation_pass {
            if let Err(err) = self.backend.install_key(mesh_key).await {
                self.ensemble_failed(&format!("mesh key install failed: {err}"), true)
                    .await;
                return;
            }
            if self.try_goto(EnsembleStatus::Ready).await.is_ok() {
                self.broadcast(&ControlMessage::EnsembleReady).await;
                self.resolve_formation(Ok(()));
            }
        } else {
            if self.try_goto(EnsembleStatus::Activating).await.is_err() {
                return;
            }
            if let Err(err) = self.backend.activate(mesh_key).await {
                self.ensemble_failed(&format!("mesh activation failed: {err}"), true)
                    .await;
            }
        }
    }

    async fn leader_mark_and_check_activated(&mut self, udid: &str) {
        if self.machine.status() != EnsembleStatus::Activating {
            debug!(udid, "extraneous activation-complete; dropping");
            return;
        }
        self.peers.mark(udid, ProgressFlag::Activated);
        if !self.peers.all_marked(ProgressFlag::Activated) {
            return;
        }
        if self.try_goto(EnsembleStatus::Activated).await.is_ok() {
            self.broadcast(&ControlMessage::EnsembleActivationComplete)
                .await;
        }
    }

    async fn leader_mark_and_check_node_ready(&mut self, udid: &str) {
        if self.machine.status() != EnsembleStatus::Activated {
            debug!(udid, "extraneous node-ready; dropping");
            return;
        }
        self.peers.mark(udid, ProgressFlag::NodeReady);
        if !self.peers.all_marked(ProgressFlag::NodeReady) {
            return;
        }
        if self.try_goto(EnsembleStatus::Ready).await.is_ok() {
            info!("ensemble formation complete");
            self.broadcast(&ControlMessage::EnsembleReady).await;
            self.resolve_formation(Ok(()));
        }
    }

    fn leader_mark_and_check_data_key(&mut self, udid: &str) {
        self.peers.mark(udid, ProgressFlag::DataKeyShared);
        if self.peers.all_marked(ProgressFlag::DataKeyShared) {
            if let Some(respond) = self.pending_data_key.take() {
                let _ = respond.send(Ok(()));
            }
        }
    }

    // ========================================================================
    // Follower handlers
    // ========================================================================

    async fn follower_handle(&mut self, from_rank: u32, message: ControlMessage) {
        if from_rank != 0
            && !matches!(
                message,
                ControlMessage::EnsembleFailed { .. } | ControlMessage::EnsembleDraining
            )
        {
            warn!(from_rank, kind = message.kind(), "driver message from non-leader; dropping");
            return;
        }

        match message {
            ControlMessage::EnsembleAcceptAndShareKey { key } => {
                self.follower_accept_key(&key).await;
            },
            ControlMessage::EnsembleKeyShared => {
                self.follower_key_shared().await;
            },
            ControlMessage::EnsembleActivationComplete => {
                self.follower_activation_complete().await;
            },
            ControlMessage::EnsembleReady => {
                self.follower_ensemble_ready().await;
            },
            ControlMessage::EnsembleShareDataKey { key, token } => {
                self.follower_data_key(key, token).await;
            },
            ControlMessage::EnsembleFailed { reason } => {
                self.peer_reported_failure(from_rank, &reason).await;
            },
            ControlMessage::EnsembleDraining => {
                debug!(from_rank, "peer is draining");
            },
            ControlMessage::ForwardMessage { payload } | ControlMessage::TestMessage { payload } => {
                debug!(from_rank, len = payload.len(), "pass-through message ignored");
            },
            other => {
                debug!(kind = other.kind(), "extraneous message for follower; dropping");
            },
        }
    }

    async fn follower_accept_key(&mut self, envelope: &KeyEnvelope) {
        match self.machine.status() {
            EnsembleStatus::Coordinating => {},
            EnsembleStatus::Ready => {
                // A rotation pass begins.
                self.rotation_pass = true;
                self.peers.reset_for_new_pass();
                monitor::arm(
                    self.timeouts.formation_timeout(),
                    self.status_tx.subscribe(),
                    self.events_tx.clone(),
                );
                if self
                    .try_goto(EnsembleStatus::RedistributingMeshKey)
                    .await
                    .is_err()
                {
                    return;
                }
            },
            status => {
                debug!(%status, "extraneous key share; dropping");
                return;
            },
        }

        let secret = match SharedSecret::from_envelope(envelope) {
            Ok(secret) => secret,
            Err(err) => {
                self.ensemble_failed(&format!("received malformed shared key: {err}"), true)
                    .await;
                return;
            },
        };
        self.shared_secret = Some(secret);
        if self.try_goto(EnsembleStatus::KeyAccepted).await.is_ok() {
            self.send_to_leader(&ControlMessage::FollowerKeyAccepted).await;
        }
    }

    async fn follower_key_shared(&mut self) {
        if self.machine.status() != EnsembleStatus::KeyAccepted {
            debug!("extraneous key-shared; dropping");
            return;
        }
        if self.try_goto(EnsembleStatus::DistributedMeshKey).await.is_err() {
            return;
        }

        let Some(secret) = self.shared_secret.take() else {
            self.ensemble_failed("shared key missing at key-shared", true).await;
            return;
        };
        let (mesh_key, psk) = secret.derive_subkeys();
        let _ = self.psk_tx.send(Some(Arc::new(psk)));

        if self.rotation_pass {
            if let Err(err) = self.backend.install_key(mesh_key).await {
                self.ensemble_failed(&format!("mesh key install failed: {err}"), true)
                    .await;
            }
            // Wait at DistributedMeshKey for the leader's EnsembleReady.
            return;
        }

        if self.try_goto(EnsembleStatus::Activating).await.is_err() {
            return;
        }
        if let Err(err) = self.backend.activate(mesh_key).await {
            self.ensemble_failed(&format!("mesh activation failed: {err}"), true)
                .await;
            return;
        }
        if self.try_goto(EnsembleStatus::Activated).await.is_ok() {
            self.send_to_leader(&ControlMessage::FollowerActivationComplete)
                .await;
        }
    }

    async fn follower_activation_complete(&mut self) {
        if self.machine.status() != EnsembleStatus::Activated {
            debug!("extraneous ensemble-activation-complete; dropping");
            return;
        }
        if self.try_goto(EnsembleStatus::NodeReady).await.is_ok() {
            self.send_to_leader(&ControlMessage::FollowerNodeReady).await;
        }
    }

    async fn follower_ensemble_ready(&mut self) {
        let status = self.machine.status();
        let expected = status == EnsembleStatus::NodeReady
            || (self.rotation_pass && status == EnsembleStatus::DistributedMeshKey);
        if !expected {
            debug!(%status, "extraneous ensemble-ready; dropping");
            return;
        }
        if self.try_goto(EnsembleStatus::Ready).await.is_ok() {
            info!("node reached ready");
            self.resolve_formation(Ok(()));
        }
    }

    async fn follower_data_key(&mut self, key: KeyEnvelope, token: String) {
        if self.seen_data_key_tokens.contains(&token) {
            debug!(token, "duplicate data key distribution; dropping");
            return;
        }
        self.seen_data_key_tokens.insert(token.clone());
        self.data_key_token_order.push_back(token.clone());
        if self.data_key_token_order.len() > DATA_KEY_TOKEN_WINDOW {
            if let Some(evicted) = self.data_key_token_order.pop_front() {
                self.seen_data_key_tokens.remove(&evicted);
            }
        }
        debug!(token, len = key.len(), "data key obtained");
        self.send_to_leader(&ControlMessage::FollowerDataKeyObtained)
            .await;
    }

    // ========================================================================
    // Failure escalation
    // ========================================================================

    /// A peer told us it failed: fail locally without re-broadcasting,
    /// so a failing ensemble does not storm itself.
    async fn peer_reported_failure(&mut self, from_rank: u32, reason: &str) {
        warn!(from_rank, reason, "peer reported ensemble failure");
        self.ensemble_failed(&format!("peer rank {from_rank} failed: {reason}"), false)
            .await;
    }

    /// Escalates to the terminal failure state. Idempotent: a second
    /// call while already failed is a no-op.
    async fn ensemble_failed(&mut self, reason: &str, notify_peers: bool) {
        if self.machine.status().is_failed() {
            return;
        }
        let target = if self.draining {
            EnsembleStatus::FailedWhileDraining
        } else {
            EnsembleStatus::Failed
        };
        warn!(reason, target = target.as_str(), "ensemble failed");

        // A failure sink is legal from every non-terminal state.
        if let Err(err) = self.machine.goto(target) {
            warn!(%err, "failure-state transition rejected");
        }
        let _ = self.status_tx.send(self.machine.status());

        // Wipe any half-distributed secret.
        self.shared_secret = None;

        if notify_peers {
            let message = ControlMessage::EnsembleFailed {
                reason: reason.to_string(),
            };
            match self.role() {
                Role::Leader => self.broadcast(&message).await,
                Role::Follower => self.send_to_leader(&message).await,
            }
        }

        // Terminal state is already committed; deactivation is
        // best-effort and its failure only gets logged.
        if let Err(err) = self.backend.deactivate().await {
            warn!(%err, "best-effort mesh deactivation failed");
        }

        let error = CoordinatorError::EnsembleFailed {
            reason: reason.to_string(),
        };
        self.resolve_formation(Err(error.clone()));
        if let Some(respond) = self.pending_data_key.take() {
            let _ = respond.send(Err(error));
        }
    }

    // ========================================================================
    // Shared plumbing
    // ========================================================================

    fn run_init_checks(&mut self) -> Result<(), CoordinatorError> {
        // The platform init check itself belongs to the supervisor;
        // this drives the observable state progression.
        self.goto(EnsembleStatus::InitCheckInProgress)?;
        self.goto(EnsembleStatus::ActivationChecksOk)?;
        Ok(())
    }

    fn goto(&mut self, target: EnsembleStatus) -> Result<(), TransitionError> {
        self.machine.goto(target)?;
        let _ = self.status_tx.send(target);
        debug!(status = target.as_str(), "state committed");
        Ok(())
    }

    /// `goto` that escalates an illegal transition to ensemble failure.
    async fn try_goto(&mut self, target: EnsembleStatus) -> Result<(), ()> {
        if let Err(err) = self.goto(target) {
            self.ensemble_failed(&format!("illegal transition: {err}"), true)
                .await;
            return Err(());
        }
        Ok(())
    }

    fn resolve_formation(&mut self, result: Result<(), CoordinatorError>) {
        if let Some(respond) = self.pending_formation.take() {
            let _ = respond.send(result);
        }
    }

    /// Encodes once and sends point-to-point to every other node.
    /// Per-node failure is logged and does not abort the remaining
    /// sends; laggards surface through the watchdog, not here.
    async fn broadcast(&self, message: &ControlMessage) {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, kind = message.kind(), "failed to encode broadcast");
                return;
            },
        };
        for node in &self.ensemble.nodes {
            if node.rank == self.local_rank {
                continue;
            }
            if let Err(err) = self.channel.send_to_rank(node.rank, bytes.clone()).await {
                warn!(rank = node.rank, %err, kind = message.kind(), "broadcast send failed");
            }
        }
    }

    async fn send_to_leader(&self, message: &ControlMessage) {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, kind = message.kind(), "failed to encode message");
                return;
            },
        };
        if let Err(err) = self.channel.send_to_rank(0, bytes).await {
            warn!(%err, kind = message.kind(), "send to leader failed");
        }
    }
}
