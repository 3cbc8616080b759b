//! The formation convergence watchdog.
//!
//! One watchdog is armed per formation attempt. It never retries:
//! expiry is terminal for the attempt. On expiry it enqueues a single
//! [`CoordinatorEvent::WatchdogExpired`](super::CoordinatorEvent) so
//! the diagnosis and failure run inside the coordinator's serialized
//! handler path; the watchdog itself only reads.

use std::time::Duration;

use meshd_core::ensemble::peer::{PeerTable, ProgressFlag};
use meshd_core::ensemble::status::EnsembleStatus;
use meshd_core::node::RANKS_PER_CHASSIS;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::CoordinatorEvent;

/// Spawns the watchdog for one formation attempt.
///
/// The task sleeps for `timeout` and then enqueues
/// `WatchdogExpired`. It exits early, without firing, as soon as the
/// status watch reports `Ready` or a terminal state.
pub(super) fn arm(
    timeout: Duration,
    mut status_rx: watch::Receiver<EnsembleStatus>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
) {
    tokio::spawn(async move {
        let expiry = tokio::time::sleep(timeout);
        tokio::pin!(expiry);
        loop {
            tokio::select! {
                () = &mut expiry => {
                    // Ignore a send error: the coordinator is gone and
                    // there is nothing left to fail.
                    let _ = events.send(CoordinatorEvent::WatchdogExpired);
                    return;
                }
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let status = *status_rx.borrow();
                    if status == EnsembleStatus::Ready || status.is_terminal() {
                        debug!(status = %status, "convergence watchdog disarmed");
                        return;
                    }
                }
            }
        }
    });
}

/// Builds the human-readable diagnosis for a formation attempt stuck
/// at `status` when the watchdog expired.
///
/// Names the lagging ranks for the stage, the likely causes, and, for
/// multi-chassis ensembles, the cable-connectivity check.
#[must_use]
pub fn diagnose(status: EnsembleStatus, peers: &PeerTable, node_count: usize) -> String {
    let (stage, flag) = match status {
        EnsembleStatus::Initializing
        | EnsembleStatus::InitCheckInProgress
        | EnsembleStatus::ActivationChecksOk => {
            return format!(
                "formation timed out before coordination began (status {status}); \
                 local initialization checks did not complete"
            );
        },
        EnsembleStatus::Coordinating => ("node discovery", ProgressFlag::Found),
        EnsembleStatus::DistributingMeshKey | EnsembleStatus::RedistributingMeshKey | EnsembleStatus::KeyAccepted => {
            ("mesh key distribution", ProgressFlag::KeyShared)
        },
        EnsembleStatus::DistributedMeshKey | EnsembleStatus::Activating => {
            ("mesh activation", ProgressFlag::Activated)
        },
        EnsembleStatus::Activated | EnsembleStatus::NodeReady => {
            ("node readiness", ProgressFlag::NodeReady)
        },
        _ => {
            return format!("formation watchdog expired in unexpected status {status}");
        },
    };

    let lagging = peers.lagging_ranks(flag);
    let mut message = format!(
        "formation timed out during {stage}: ranks {lagging:?} did not converge. \
         Likely causes: network partition, ACL blocking the control channel, \
         or an attestation mismatch between nodes."
    );

    #[allow(clippy::cast_possible_truncation)]
    if node_count as u32 > RANKS_PER_CHASSIS {
        message.push_str(
            " This ensemble spans multiple chassis; verify the inter-chassis \
             mesh cables are seated and link lights are up.",
        );
    }

    message
}

#[cfg(test)]
#[allow(missing_docs)]
mod tests {
    use meshd_core::node::{EnsembleConfig, NodeConfiguration};

    use super::*;

    fn make_peers(count: u32) -> PeerTable {
        let nodes = (0..count)
            .map(|rank| NodeConfiguration {
                rank,
                host: format!("node-{rank}"),
                chassis_id: rank / RANKS_PER_CHASSIS,
                udid: format!("udid-{rank}"),
            })
            .collect();
        PeerTable::from_config(&EnsembleConfig::new(nodes).unwrap())
    }

    #[test]
    fn test_diagnose_names_lagging_ranks_for_stage() {
        let mut peers = make_peers(4);
        peers.mark("udid-1", ProgressFlag::Found);
        let message = diagnose(EnsembleStatus::Coordinating, &peers, 4);
        assert!(message.contains("node discovery"));
        assert!(message.contains("[2, 3]"));
        assert!(message.contains("network partition"));
        // Single-chassis ensemble: no cable diagnostic.
        assert!(!message.contains("cables"));
    }

    #[test]
    fn test_diagnose_key_distribution_stage() {
        let peers = make_peers(4);
        let message = diagnose(EnsembleStatus::DistributingMeshKey, &peers, 4);
        assert!(message.contains("mesh key distribution"));
        assert!(message.contains("[1, 2, 3]"));
    }

    #[test]
    fn test_diagnose_multi_chassis_cable_hint() {
        let peers = make_peers(8);
        let message = diagnose(EnsembleStatus::Activating, &peers, 8);
        assert!(message.contains("mesh activation"));
        assert!(message.contains("cables"));
    }

    #[test]
    fn test_diagnose_before_coordination() {
        let peers = make_peers(2);
        let message = diagnose(EnsembleStatus::InitCheckInProgress, &peers, 2);
        assert!(message.contains("before coordination"));
    }
}
