//! The ensemble formation state machine.
//!
//! One node's formation progress is modeled as an [`EnsembleStatus`]
//! value owned by a [`StateMachine`]. [`StateMachine::goto`] is the only
//! mutator: every observable status reflects a committed, validated
//! transition. Leader and follower share the status enum but have
//! distinct legal-transition tables; an illegal transition leaves the
//! state unchanged and must be treated by the caller as fatal for the
//! formation attempt.

use serde::{Deserialize, Serialize};

/// Role of a node within the ensemble. Rank 0 is always the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// The rank-0 node that drives key distribution and aggregation.
    Leader,
    /// Every other rank; reacts to leader messages.
    Follower,
}

impl Role {
    /// Returns the role implied by a rank.
    #[must_use]
    pub const fn from_rank(rank: u32) -> Self {
        if rank == 0 { Self::Leader } else { Self::Follower }
    }

    /// Returns the string representation of this role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Leader => "LEADER",
            Self::Follower => "FOLLOWER",
        }
    }
}

/// Formation progress of one node.
///
/// The bootstrap progression is
/// `Initializing → InitCheckInProgress → ActivationChecksOk →
/// Coordinating → DistributingMeshKey / KeyAccepted →
/// DistributedMeshKey → Activating → Activated → NodeReady → Ready`,
/// with a parallel rotation path
/// `Ready → RedistributingMeshKey → DistributedMeshKey → Ready` and
/// terminal failure states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EnsembleStatus {
    /// Initial state at process start.
    Initializing,
    /// Platform init health check running.
    InitCheckInProgress,
    /// Activation preconditions verified.
    ActivationChecksOk,
    /// Waiting for all peers to announce themselves.
    Coordinating,
    /// Leader is distributing the shared mesh key (leader driver state).
    DistributingMeshKey,
    /// Follower accepted the shared mesh key.
    KeyAccepted,
    /// The mesh key has been distributed to every node.
    DistributedMeshKey,
    /// Mesh activation in progress.
    Activating,
    /// Mesh activated on this node.
    Activated,
    /// This node finished all local setup (follower-side).
    NodeReady,
    /// Terminal success for this formation pass.
    Ready,
    /// A new mesh key is being distributed while the mesh stays up.
    RedistributingMeshKey,
    /// Terminal: the formation attempt failed.
    Failed,
    /// Terminal: activation precondition checks failed.
    FailedActivationChecks,
    /// Terminal: failure arrived while the node was draining.
    FailedWhileDraining,
}

impl EnsembleStatus {
    /// Returns `true` for terminal failure states.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::FailedActivationChecks | Self::FailedWhileDraining
        )
    }

    /// Returns `true` for states with no outgoing transitions.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.is_failed()
    }

    /// Returns the string representation of this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::InitCheckInProgress => "INIT_CHECK_IN_PROGRESS",
            Self::ActivationChecksOk => "ACTIVATION_CHECKS_OK",
            Self::Coordinating => "COORDINATING",
            Self::DistributingMeshKey => "DISTRIBUTING_MESH_KEY",
            Self::KeyAccepted => "KEY_ACCEPTED",
            Self::DistributedMeshKey => "DISTRIBUTED_MESH_KEY",
            Self::Activating => "ACTIVATING",
            Self::Activated => "ACTIVATED",
            Self::NodeReady => "NODE_READY",
            Self::Ready => "READY",
            Self::RedistributingMeshKey => "REDISTRIBUTING_MESH_KEY",
            Self::Failed => "FAILED",
            Self::FailedActivationChecks => "FAILED_ACTIVATION_CHECKS",
            Self::FailedWhileDraining => "FAILED_WHILE_DRAINING",
        }
    }
}

impl std::fmt::Display for EnsembleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by [`StateMachine::goto`] for an illegal transition.
///
/// The state machine is left unchanged. Callers must escalate this to
/// ensemble failure; it indicates a protocol bug or a peer driving us
/// out of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal {role} transition {from} -> {to}", role = role.as_str(), from = from.as_str(), to = to.as_str())]
pub struct TransitionError {
    /// Role whose table rejected the transition.
    pub role: Role,
    /// State before the attempted transition.
    pub from: EnsembleStatus,
    /// The rejected target state.
    pub to: EnsembleStatus,
}

/// The single owner of one node's [`EnsembleStatus`].
#[derive(Debug, Clone)]
pub struct StateMachine {
    role: Role,
    status: EnsembleStatus,
}

impl StateMachine {
    /// Creates a state machine in [`EnsembleStatus::Initializing`].
    #[must_use]
    pub const fn new(role: Role) -> Self {
        Self {
            role,
            status: EnsembleStatus::Initializing,
        }
    }

    /// The node's role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// The current committed status.
    #[must_use]
    pub const fn status(&self) -> EnsembleStatus {
        self.status
    }

    /// Attempts a transition to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] and leaves the state unchanged if
    /// the transition is not in the role's legal table.
    pub fn goto(&mut self, target: EnsembleStatus) -> Result<(), TransitionError> {
        if is_legal(self.role, self.status, target) {
            self.status = target;
            Ok(())
        } else {
            Err(TransitionError {
                role: self.role,
                from: self.status,
                to: target,
            })
        }
    }
}

/// Whether `from -> to` is in `role`'s legal-transition table.
#[must_use]
#[allow(clippy::match_same_arms)]
pub const fn is_legal(role: Role, from: EnsembleStatus, to: EnsembleStatus) -> bool {
    use EnsembleStatus as S;

    // Terminal states have no outgoing transitions.
    if from.is_terminal() {
        return false;
    }

    // Failure sinks reachable from any non-terminal state.
    // FailedActivationChecks is only reachable from the check itself.
    match to {
        S::Failed | S::FailedWhileDraining => return true,
        S::FailedActivationChecks => return matches!(from, S::InitCheckInProgress),
        _ => {},
    }

    let shared = matches!(
        (from, to),
        (S::Initializing, S::InitCheckInProgress)
            | (S::InitCheckInProgress, S::ActivationChecksOk)
            | (S::DistributedMeshKey, S::Activating)
            | (S::Activating, S::Activated)
            | (S::Ready, S::RedistributingMeshKey)
            // Rotation completes without re-activating the mesh.
            | (S::DistributedMeshKey, S::Ready)
    );
    if shared {
        return true;
    }

    match role {
        Role::Leader => matches!(
            (from, to),
            (S::ActivationChecksOk, S::Coordinating)
                // Single-node shortcut: no followers, no key distribution.
                | (S::ActivationChecksOk, S::Ready)
                | (S::Coordinating, S::DistributingMeshKey)
                | (S::DistributingMeshKey, S::DistributedMeshKey)
                | (S::RedistributingMeshKey, S::DistributedMeshKey)
                | (S::Activated, S::Ready)
        ),
        Role::Follower => matches!(
            (from, to),
            (S::ActivationChecksOk, S::Coordinating)
                | (S::Coordinating, S::KeyAccepted)
                | (S::KeyAccepted, S::DistributedMeshKey)
                | (S::Activated, S::NodeReady)
                | (S::NodeReady, S::Ready)
                | (S::RedistributingMeshKey, S::KeyAccepted)
        ),
    }
}

#[cfg(test)]
#[allow(missing_docs)]
mod tests {
    use super::*;

    const ALL_STATUSES: [EnsembleStatus; 15] = [
        EnsembleStatus::Initializing,
        EnsembleStatus::InitCheckInProgress,
        EnsembleStatus::ActivationChecksOk,
        EnsembleStatus::Coordinating,
        EnsembleStatus::DistributingMeshKey,
        EnsembleStatus::KeyAccepted,
        EnsembleStatus::DistributedMeshKey,
        EnsembleStatus::Activating,
        EnsembleStatus::Activated,
        EnsembleStatus::NodeReady,
        EnsembleStatus::Ready,
        EnsembleStatus::RedistributingMeshKey,
        EnsembleStatus::Failed,
        EnsembleStatus::FailedActivationChecks,
        EnsembleStatus::FailedWhileDraining,
    ];

    fn drive(machine: &mut StateMachine, path: &[EnsembleStatus]) {
        for target in path {
            machine
                .goto(*target)
                .unwrap_or_else(|e| panic!("expected legal transition: {e}"));
        }
    }

    // ========================================================================
    // Happy paths
    // ========================================================================

    #[test]
    fn test_leader_bootstrap_path() {
        let mut machine = StateMachine::new(Role::Leader);
        drive(
            &mut machine,
            &[
                EnsembleStatus::InitCheckInProgress,
                EnsembleStatus::ActivationChecksOk,
                EnsembleStatus::Coordinating,
                EnsembleStatus::DistributingMeshKey,
                EnsembleStatus::DistributedMeshKey,
                EnsembleStatus::Activating,
                EnsembleStatus::Activated,
                EnsembleStatus::Ready,
            ],
        );
        assert_eq!(machine.status(), EnsembleStatus::Ready);
    }

    #[test]
    fn test_follower_bootstrap_path() {
        let mut machine = StateMachine::new(Role::Follower);
        drive(
            &mut machine,
            &[
                EnsembleStatus::InitCheckInProgress,
                EnsembleStatus::ActivationChecksOk,
                EnsembleStatus::Coordinating,
                EnsembleStatus::KeyAccepted,
                EnsembleStatus::DistributedMeshKey,
                EnsembleStatus::Activating,
                EnsembleStatus::Activated,
                EnsembleStatus::NodeReady,
                EnsembleStatus::Ready,
            ],
        );
        assert_eq!(machine.status(), EnsembleStatus::Ready);
    }

    #[test]
    fn test_leader_rotation_path() {
        let mut machine = StateMachine::new(Role::Leader);
        drive(
            &mut machine,
            &[
                EnsembleStatus::InitCheckInProgress,
                EnsembleStatus::ActivationChecksOk,
                EnsembleStatus::Coordinating,
                EnsembleStatus::DistributingMeshKey,
                EnsembleStatus::DistributedMeshKey,
                EnsembleStatus::Activating,
                EnsembleStatus::Activated,
                EnsembleStatus::Ready,
                EnsembleStatus::RedistributingMeshKey,
                EnsembleStatus::DistributedMeshKey,
                EnsembleStatus::Ready,
            ],
        );
        assert_eq!(machine.status(), EnsembleStatus::Ready);
    }

    #[test]
    fn test_follower_rotation_path() {
        let mut machine = StateMachine::new(Role::Follower);
        drive(
            &mut machine,
            &[
                EnsembleStatus::InitCheckInProgress,
                EnsembleStatus::ActivationChecksOk,
                EnsembleStatus::Coordinating,
                EnsembleStatus::KeyAccepted,
                EnsembleStatus::DistributedMeshKey,
                EnsembleStatus::Activating,
                EnsembleStatus::Activated,
                EnsembleStatus::NodeReady,
                EnsembleStatus::Ready,
                EnsembleStatus::RedistributingMeshKey,
                EnsembleStatus::KeyAccepted,
                EnsembleStatus::DistributedMeshKey,
                EnsembleStatus::Ready,
            ],
        );
        assert_eq!(machine.status(), EnsembleStatus::Ready);
    }

    #[test]
    fn test_single_node_shortcut_is_leader_only() {
        let mut leader = StateMachine::new(Role::Leader);
        drive(
            &mut leader,
            &[
                EnsembleStatus::InitCheckInProgress,
                EnsembleStatus::ActivationChecksOk,
                EnsembleStatus::Ready,
            ],
        );
        assert_eq!(leader.status(), EnsembleStatus::Ready);

        let mut follower = StateMachine::new(Role::Follower);
        drive(
            &mut follower,
            &[
                EnsembleStatus::InitCheckInProgress,
                EnsembleStatus::ActivationChecksOk,
            ],
        );
        assert!(follower.goto(EnsembleStatus::Ready).is_err());
    }

    // ========================================================================
    // Legality
    // ========================================================================

    #[test]
    fn test_follower_never_drives_key_distribution() {
        for from in ALL_STATUSES {
            assert!(
                !is_legal(Role::Follower, from, EnsembleStatus::DistributingMeshKey),
                "follower must never enter DistributingMeshKey (from {from})"
            );
        }
    }

    #[test]
    fn test_illegal_transition_leaves_state_unchanged() {
        let mut machine = StateMachine::new(Role::Leader);
        let err = machine.goto(EnsembleStatus::Activated).unwrap_err();
        assert_eq!(err.from, EnsembleStatus::Initializing);
        assert_eq!(err.to, EnsembleStatus::Activated);
        assert_eq!(machine.status(), EnsembleStatus::Initializing);
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for role in [Role::Leader, Role::Follower] {
            for from in [
                EnsembleStatus::Failed,
                EnsembleStatus::FailedActivationChecks,
                EnsembleStatus::FailedWhileDraining,
            ] {
                for to in ALL_STATUSES {
                    assert!(!is_legal(role, from, to), "{role:?} {from} -> {to}");
                }
            }
        }
    }

    #[test]
    fn test_failed_reachable_from_all_non_terminal_states() {
        for role in [Role::Leader, Role::Follower] {
            for from in ALL_STATUSES {
                if from.is_terminal() {
                    continue;
                }
                assert!(is_legal(role, from, EnsembleStatus::Failed));
                assert!(is_legal(role, from, EnsembleStatus::FailedWhileDraining));
            }
        }
    }

    #[test]
    fn test_failed_activation_checks_only_from_check() {
        for role in [Role::Leader, Role::Follower] {
            for from in ALL_STATUSES {
                let legal = is_legal(role, from, EnsembleStatus::FailedActivationChecks);
                assert_eq!(legal, from == EnsembleStatus::InitCheckInProgress);
            }
        }
    }

    /// Exhaustive check: goto fails and preserves state for every pair
    /// not in the legal table.
    #[test]
    fn test_goto_matches_table_for_all_pairs() {
        for role in [Role::Leader, Role::Follower] {
            for from in ALL_STATUSES {
                for to in ALL_STATUSES {
                    let mut machine = StateMachine { role, status: from };
                    let result = machine.goto(to);
                    if is_legal(role, from, to) {
                        assert!(result.is_ok());
                        assert_eq!(machine.status(), to);
                    } else {
                        assert!(result.is_err());
                        assert_eq!(machine.status(), from);
                    }
                }
            }
        }
    }
}
