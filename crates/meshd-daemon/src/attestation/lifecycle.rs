//! Attested node key lifecycle.
//!
//! A single long-lived actor owns the [`AttestedKeySet`]: it loads the
//! on-disk cache at startup, serves coalesced `obtain` requests,
//! rotates the current key at its half-life, applies revocations, and
//! prunes retired keys. Dependents observe the set over a `watch`
//! channel; nothing outside the actor mutates it.
//!
//! Key creation runs as a spawned task so the actor keeps serving
//! requests during provider backoff. Outcomes carry a generation
//! number; a stale outcome (superseded by a newer creation) is
//! discarded, so a late failure never clobbers a newer success.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use meshd_core::key::{AttestedKey, AttestedKeySet, NodeKeyId};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::AttestationCache;
use super::provider::{Attestor, AttestorError, BackoffPolicy, create_with_backoff};

/// Errors surfaced to [`KeyLifecycleHandle::obtain_attested_key`]
/// callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum AttestationError {
    /// Key creation failed after exhausting retries.
    #[error(transparent)]
    Attestor(#[from] AttestorError),

    /// The lifecycle manager shut down while the request was pending.
    #[error("key lifecycle manager shut down")]
    Cancelled,
}

type KeyResult = Result<AttestedKey, AttestationError>;
type Waiter = oneshot::Sender<KeyResult>;

/// The obtain-side state machine. Waiters pile up on the pending
/// variants and are all resolved by the same creation outcome.
enum LifecycleState {
    /// Cache load has not finished.
    Initializing { waiters: Vec<Waiter> },
    /// Cache loaded, no usable key, no creation in flight.
    Initialized,
    /// A creation is in flight; callers coalesce onto it.
    AwaitingKey { waiters: Vec<Waiter> },
    /// The current key in the set is servable.
    KeyAvailable,
    /// The last creation failed and no usable key remains.
    KeyUnavailable { error: AttestationError },
}

impl LifecycleState {
    fn take_waiters(&mut self) -> Vec<Waiter> {
        match self {
            Self::Initializing { waiters } | Self::AwaitingKey { waiters } => {
                std::mem::take(waiters)
            },
            _ => Vec::new(),
        }
    }
}

enum LifecycleCommand {
    Obtain { respond: Waiter },
    ForceRevocation { key_ids: Vec<NodeKeyId> },
    ReleaseSetChanged { digest: [u8; 32] },
    Shutdown,
}

struct CreationOutcome {
    generation: u64,
    result: Result<AttestedKey, AttestorError>,
}

/// Cloneable handle to the lifecycle actor.
#[derive(Clone)]
pub struct KeyLifecycleHandle {
    commands: mpsc::UnboundedSender<LifecycleCommand>,
    set_rx: watch::Receiver<Option<AttestedKeySet>>,
}

impl KeyLifecycleHandle {
    /// Returns the current attested key, creating one if necessary.
    /// Concurrent callers share a single in-flight creation.
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError`] if creation failed or the manager
    /// shut down.
    pub async fn obtain_attested_key(&self) -> KeyResult {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(LifecycleCommand::Obtain { respond: tx })
            .map_err(|_| AttestationError::Cancelled)?;
        rx.await.map_err(|_| AttestationError::Cancelled)?
    }

    /// A snapshot of the current key set, if one exists yet.
    #[must_use]
    pub fn key_set(&self) -> Option<AttestedKeySet> {
        self.set_rx.borrow().clone()
    }

    /// A watch over key-set changes (rotation pushes).
    #[must_use]
    pub fn set_watch(&self) -> watch::Receiver<Option<AttestedKeySet>> {
        self.set_rx.clone()
    }

    /// Revokes the given keys: they stop being advertised but sessions
    /// already bound to them stay valid. Revoking the current key
    /// forces an early rotation.
    pub fn force_revocation(&self, key_ids: Vec<NodeKeyId>) {
        let _ = self
            .commands
            .send(LifecycleCommand::ForceRevocation { key_ids });
    }

    /// Notifies the manager that the release set changed; the next key
    /// is scoped to `digest` and a rotation starts immediately.
    pub fn notify_release_change(&self, digest: [u8; 32]) {
        let _ = self
            .commands
            .send(LifecycleCommand::ReleaseSetChanged { digest });
    }

    /// Stops the actor. Pending obtain calls fail with
    /// [`AttestationError::Cancelled`].
    pub fn shutdown(&self) {
        let _ = self.commands.send(LifecycleCommand::Shutdown);
    }
}

/// The lifecycle actor.
pub struct KeyLifecycleManager {
    attestor: Arc<dyn Attestor>,
    cache: AttestationCache,
    grace: Duration,
    backoff: BackoffPolicy,
    release_digest: [u8; 32],

    state: LifecycleState,
    set: Option<AttestedKeySet>,
    generation: u64,
    creation_inflight: bool,

    commands_rx: mpsc::UnboundedReceiver<LifecycleCommand>,
    outcomes_tx: mpsc::UnboundedSender<CreationOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<CreationOutcome>,
    set_tx: watch::Sender<Option<AttestedKeySet>>,
}

impl KeyLifecycleManager {
    /// Spawns the actor.
    #[must_use]
    pub fn spawn(
        attestor: Arc<dyn Attestor>,
        cache: AttestationCache,
        release_digest: [u8; 32],
        grace: Duration,
        backoff: BackoffPolicy,
    ) -> (KeyLifecycleHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let (set_tx, set_rx) = watch::channel(None);

        let manager = Self {
            attestor,
            cache,
            grace,
            backoff,
            release_digest,
            state: LifecycleState::Initializing {
                waiters: Vec::new(),
            },
            set: None,
            generation: 0,
            creation_inflight: false,
            commands_rx,
            outcomes_tx,
            outcomes_rx,
            set_tx,
        };

        let handle = KeyLifecycleHandle {
            commands: commands_tx,
            set_rx,
        };
        let join = tokio::spawn(manager.run());
        (handle, join)
    }

    async fn run(mut self) {
        self.initialize();

        loop {
            let rotation = self.rotation_delay();
            let rotation_timer = async {
                match rotation {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = self.commands_rx.recv() => {
                    let Some(command) = command else { break };
                    if self.handle_command(command) {
                        break;
                    }
                    // Consume everything that arrived in the same
                    // wakeup; revocations and release changes are not
                    // mutually exclusive with rotation in one tick.
                    loop {
                        match self.commands_rx.try_recv() {
                            Ok(command) => {
                                if self.handle_command(command) {
                                    self.fail_waiters(AttestationError::Cancelled);
                                    return;
                                }
                            },
                            Err(_) => break,
                        }
                    }
                },
                Some(outcome) = self.outcomes_rx.recv() => {
                    self.handle_outcome(outcome);
                },
                () = rotation_timer => {
                    info!("rotation half-life reached");
                    self.start_creation();
                },
            }

            self.prune();
        }

        self.fail_waiters(AttestationError::Cancelled);
        debug!("key lifecycle actor stopped");
    }

    fn initialize(&mut self) {
        let mut cached = self.cache.load();
        let now = SystemTime::now();
        cached.retain(|key| now < key.retire_at(self.grace));
        // The freshest key becomes current; the rest are its
        // not-yet-retired predecessors.
        cached.sort_by_key(|key| key.expiry);

        if let Some(current) = cached.pop() {
            info!(key_id = %current.key_id, "restored attested key set from cache");
            let mut set = AttestedKeySet::new(current);
            set.unpublished = cached;
            self.set = Some(set);
            self.state = LifecycleState::KeyAvailable;
            self.publish();
        } else {
            self.state = LifecycleState::Initialized;
        }
    }

    /// Returns `true` when the loop must stop.
    fn handle_command(&mut self, command: LifecycleCommand) -> bool {
        match command {
            LifecycleCommand::Obtain { respond } => self.handle_obtain(respond),
            LifecycleCommand::ForceRevocation { key_ids } => self.handle_revocation(&key_ids),
            LifecycleCommand::ReleaseSetChanged { digest } => {
                if digest != self.release_digest {
                    info!("release set changed; rotating attested key");
                    self.release_digest = digest;
                    self.start_creation();
                }
            },
            LifecycleCommand::Shutdown => return true,
        }
        false
    }

    fn handle_obtain(&mut self, respond: Waiter) {
        match &mut self.state {
            LifecycleState::KeyAvailable => {
                let usable = self
                    .set
                    .as_ref()
                    .is_some_and(|set| !set.current.is_expired(SystemTime::now()));
                if usable {
                    let key = self.set.as_ref().map(|set| set.current.clone());
                    if let Some(key) = key {
                        let _ = respond.send(Ok(key));
                        return;
                    }
                }
                // Current key aged out before the timer caught it.
                self.state = LifecycleState::AwaitingKey {
                    waiters: vec![respond],
                };
                self.start_creation();
            },
            LifecycleState::AwaitingKey { waiters } | LifecycleState::Initializing { waiters } => {
                waiters.push(respond);
            },
            LifecycleState::Initialized => {
                self.state = LifecycleState::AwaitingKey {
                    waiters: vec![respond],
                };
                self.start_creation();
            },
            LifecycleState::KeyUnavailable { error } => {
                let _ = respond.send(Err(error.clone()));
            },
        }
    }

    fn handle_revocation(&mut self, key_ids: &[NodeKeyId]) {
        let Some(set) = self.set.as_mut() else {
            return;
        };
        let mut current_revoked = false;
        let mut changed = false;
        for key_id in key_ids {
            if set.current.key_id.ct_eq(key_id) && !set.current.node_only {
                set.current.node_only = true;
                current_revoked = true;
                changed = true;
            }
            for key in &mut set.unpublished {
                if key.key_id.ct_eq(key_id) && !key.node_only {
                    key.node_only = true;
                    changed = true;
                }
            }
        }
        if !changed {
            return;
        }
        warn!(count = key_ids.len(), "attested keys revoked");
        self.publish();
        self.persist();
        if current_revoked {
            info!("current key revoked; forcing early rotation");
            self.start_creation();
        }
    }

    fn start_creation(&mut self) {
        if self.creation_inflight {
            return;
        }
        self.creation_inflight = true;
        self.generation += 1;

        let attestor = Arc::clone(&self.attestor);
        let policy = self.backoff;
        let digest = self.release_digest;
        let generation = self.generation;
        let outcomes = self.outcomes_tx.clone();
        tokio::spawn(async move {
            let result = create_with_backoff(attestor.as_ref(), policy, digest).await;
            let _ = outcomes.send(CreationOutcome { generation, result });
        });
    }

    fn handle_outcome(&mut self, outcome: CreationOutcome) {
        if outcome.generation != self.generation {
            debug!(
                generation = outcome.generation,
                "discarding stale creation outcome"
            );
            return;
        }
        self.creation_inflight = false;

        match outcome.result {
            Ok(key) => {
                info!(key_id = %key.key_id, "attested key rotated in");
                match self.set.take() {
                    Some(mut set) => {
                        let outgoing = std::mem::replace(&mut set.current, key.clone());
                        set.unpublished.push(outgoing);
                        self.set = Some(set);
                    },
                    None => {
                        self.set = Some(AttestedKeySet::new(key.clone()));
                    },
                }
                let waiters = self.state.take_waiters();
                self.state = LifecycleState::KeyAvailable;
                for waiter in waiters {
                    let _ = waiter.send(Ok(key.clone()));
                }
                self.publish();
                self.persist();
            },
            Err(err) => {
                // Last-success-wins: with a servable key still in the
                // set, an in-flight failure is discarded.
                let usable = self
                    .set
                    .as_ref()
                    .is_some_and(|set| !set.current.is_expired(SystemTime::now()));
                if usable {
                    warn!(%err, "key creation failed; keeping the current key");
                    let waiters = self.state.take_waiters();
                    self.state = LifecycleState::KeyAvailable;
                    if let Some(current) = self.set.as_ref().map(|set| set.current.clone()) {
                        for waiter in waiters {
                            let _ = waiter.send(Ok(current.clone()));
                        }
                    }
                } else {
                    warn!(%err, "key creation failed with no usable key");
                    let error = AttestationError::from(err);
                    let waiters = self.state.take_waiters();
                    self.state = LifecycleState::KeyUnavailable {
                        error: error.clone(),
                    };
                    for waiter in waiters {
                        let _ = waiter.send(Err(error.clone()));
                    }
                }
            },
        }
    }

    /// Drops unpublished keys past expiry plus grace and mirrors the
    /// removal to the cache.
    fn prune(&mut self) {
        let Some(set) = self.set.as_mut() else {
            return;
        };
        let now = SystemTime::now();
        let grace = self.grace;
        let before = set.unpublished.len();
        set.unpublished.retain(|key| now < key.retire_at(grace));
        if set.unpublished.len() != before {
            debug!(
                removed = before - set.unpublished.len(),
                "pruned retired attested keys"
            );
            self.publish();
            self.persist();
        }
    }

    /// Sleep until the current key's half-life, or `None` when there is
    /// nothing to rotate or a creation already runs.
    fn rotation_delay(&self) -> Option<Duration> {
        if self.creation_inflight {
            return None;
        }
        let set = self.set.as_ref()?;
        if !matches!(self.state, LifecycleState::KeyAvailable) {
            return None;
        }
        let now = SystemTime::now();
        let remaining = set
            .current
            .expiry
            .duration_since(now)
            .unwrap_or(Duration::ZERO);
        Some(half_life(remaining, self.grace))
    }

    fn publish(&self) {
        let _ = self.set_tx.send(self.set.clone());
    }

    fn persist(&self) {
        let Some(set) = self.set.as_ref() else {
            return;
        };
        if let Err(err) = self.cache.store(set.iter()) {
            // Cache loss is contained; the key set stays authoritative
            // in memory.
            warn!(%err, "failed to persist attestation cache");
        }
    }

    fn fail_waiters(&mut self, error: AttestationError) {
        for waiter in self.state.take_waiters() {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

/// Rotation deadline: half of the current key's usable lifetime, where
/// usable means the time remaining before expiry minus the grace
/// window. Saturates to zero when the key is already inside grace.
fn half_life(remaining: Duration, grace: Duration) -> Duration {
    remaining.saturating_sub(grace) / 2
}
