//! Per-peer formation progress tracking.
//!
//! The leader (and, mirrored, each follower) tracks one
//! [`PeerProgress`] entry per configured node, keyed by UDID. Progress
//! flags are monotone within one formation pass: they only move
//! false→true, and only an explicit [`PeerTable::reset_for_new_pass`]
//! (the start of a key rotation) clears them again. Aggregate checks
//! skip rank 0; the leader is trivially "ready" for its own rounds.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::node::EnsembleConfig;

/// One monotone progress flag tracked per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgressFlag {
    /// The peer announced itself.
    Found,
    /// The peer accepted the shared mesh key.
    KeyShared,
    /// The peer obtained the ad hoc data key.
    DataKeyShared,
    /// The peer finished all local setup.
    NodeReady,
    /// The peer activated its mesh backend.
    Activated,
}

impl ProgressFlag {
    /// Returns the string representation of this flag.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Found => "FOUND",
            Self::KeyShared => "KEY_SHARED",
            Self::DataKeyShared => "DATA_KEY_SHARED",
            Self::NodeReady => "NODE_READY",
            Self::Activated => "ACTIVATED",
        }
    }
}

/// Formation progress of a single configured peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProgress {
    /// Unique device identifier; the table key.
    pub udid: String,
    /// Ensemble rank.
    pub rank: u32,
    /// Whether this entry is the leader's own.
    pub is_leader: bool,
    /// The peer announced itself this pass.
    pub found: bool,
    /// The peer accepted the shared mesh key this pass.
    pub key_shared: bool,
    /// The peer obtained the ad hoc data key this pass.
    pub data_key_shared: bool,
    /// The peer reported node-ready this pass.
    pub node_ready: bool,
    /// The peer activated its mesh backend.
    pub activated: bool,
}

impl PeerProgress {
    /// Creates an entry with all flags cleared.
    #[must_use]
    pub fn new(udid: impl Into<String>, rank: u32) -> Self {
        Self {
            udid: udid.into(),
            rank,
            is_leader: rank == 0,
            found: false,
            key_shared: false,
            data_key_shared: false,
            node_ready: false,
            activated: false,
        }
    }

    /// Reads one flag.
    #[must_use]
    pub const fn get(&self, flag: ProgressFlag) -> bool {
        match flag {
            ProgressFlag::Found => self.found,
            ProgressFlag::KeyShared => self.key_shared,
            ProgressFlag::DataKeyShared => self.data_key_shared,
            ProgressFlag::NodeReady => self.node_ready,
            ProgressFlag::Activated => self.activated,
        }
    }

    /// Sets one flag true. Monotone within a pass; only the explicit
    /// pass-start resets on [`PeerTable`] clear flags.
    pub fn mark(&mut self, flag: ProgressFlag) {
        match flag {
            ProgressFlag::Found => self.found = true,
            ProgressFlag::KeyShared => self.key_shared = true,
            ProgressFlag::DataKeyShared => self.data_key_shared = true,
            ProgressFlag::NodeReady => self.node_ready = true,
            ProgressFlag::Activated => self.activated = true,
        }
    }
}

/// The full peer-progress table for one ensemble, keyed by UDID.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerTable {
    peers: HashMap<String, PeerProgress>,
}

impl PeerTable {
    /// Builds a table with one cleared entry per configured node.
    #[must_use]
    pub fn from_config(config: &EnsembleConfig) -> Self {
        let peers = config
            .nodes
            .iter()
            .map(|n| (n.udid.clone(), PeerProgress::new(n.udid.clone(), n.rank)))
            .collect();
        Self { peers }
    }

    /// Number of entries (including the leader's own).
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns `true` if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Looks up a peer by UDID.
    #[must_use]
    pub fn get(&self, udid: &str) -> Option<&PeerProgress> {
        self.peers.get(udid)
    }

    /// Marks `flag` for the peer with `udid`.
    ///
    /// Returns `false` if the UDID is unknown (the message is from a
    /// node outside the configured ensemble and must be ignored) and
    /// `true` otherwise, whether or not the flag was already set.
    pub fn mark(&mut self, udid: &str, flag: ProgressFlag) -> bool {
        match self.peers.get_mut(udid) {
            Some(peer) => {
                peer.mark(flag);
                true
            },
            None => false,
        }
    }

    /// Starts a new formation pass: clears `found`, `key_shared`,
    /// `data_key_shared`, and `node_ready` on every entry. `activated`
    /// survives; the mesh stays up across a key rotation.
    pub fn reset_for_new_pass(&mut self) {
        for peer in self.peers.values_mut() {
            peer.found = false;
            peer.key_shared = false;
            peer.data_key_shared = false;
            peer.node_ready = false;
        }
    }

    /// Starts a new data-key distribution: clears only
    /// `data_key_shared` on every entry. Each distribution is its own
    /// pass over that flag; formation progress is untouched.
    pub fn start_data_key_pass(&mut self) {
        for peer in self.peers.values_mut() {
            peer.data_key_shared = false;
        }
    }

    /// Aggregate check: `true` iff every non-leader entry has `flag`
    /// set. Trivially `true` for a single-node ensemble. The leader's
    /// own entry is never consulted; rank 0 is trivially ready.
    #[must_use]
    pub fn all_marked(&self, flag: ProgressFlag) -> bool {
        self.peers
            .values()
            .filter(|p| !p.is_leader)
            .all(|p| p.get(flag))
    }

    /// The ranks of non-leader peers still missing `flag`, sorted.
    /// Used for convergence diagnostics.
    #[must_use]
    pub fn lagging_ranks(&self, flag: ProgressFlag) -> Vec<u32> {
        let mut ranks: Vec<u32> = self
            .peers
            .values()
            .filter(|p| !p.is_leader && !p.get(flag))
            .map(|p| p.rank)
            .collect();
        ranks.sort_unstable();
        ranks
    }
}

#[cfg(test)]
#[allow(missing_docs)]
mod tests {
    use super::*;
    use crate::node::{NodeConfiguration, RANKS_PER_CHASSIS};

    fn make_table(count: u32) -> PeerTable {
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
    fn test_table_from_config() {
        let table = make_table(4);
        assert_eq!(table.len(), 4);
        let leader = table.get("udid-0").unwrap();
        assert!(leader.is_leader);
        assert!(!leader.found);
    }

    #[test]
    fn test_mark_unknown_udid_rejected() {
        let mut table = make_table(2);
        assert!(!table.mark("udid-99", ProgressFlag::Found));
        assert!(table.mark("udid-1", ProgressFlag::Found));
    }

    #[test]
    fn test_aggregate_skips_leader() {
        let mut table = make_table(4);
        table.mark("udid-1", ProgressFlag::Found);
        table.mark("udid-2", ProgressFlag::Found);
        assert!(!table.all_marked(ProgressFlag::Found));
        table.mark("udid-3", ProgressFlag::Found);
        // All followers found; leader's own entry is never consulted.
        assert!(table.all_marked(ProgressFlag::Found));
        assert!(!table.get("udid-0").unwrap().found);
    }

    #[test]
    fn test_aggregate_trivially_true_for_single_node() {
        let table = make_table(1);
        for flag in [
            ProgressFlag::Found,
            ProgressFlag::KeyShared,
            ProgressFlag::DataKeyShared,
            ProgressFlag::NodeReady,
            ProgressFlag::Activated,
        ] {
            assert!(table.all_marked(flag));
        }
    }

    #[test]
    fn test_lagging_ranks_sorted() {
        let mut table = make_table(5);
        table.mark("udid-3", ProgressFlag::KeyShared);
        assert_eq!(
            table.lagging_ranks(ProgressFlag::KeyShared),
            vec![1, 2, 4]
        );
    }

    #[test]
    fn test_marking_is_idempotent() {
        let mut table = make_table(2);
        table.mark("udid-1", ProgressFlag::NodeReady);
        let before = table.get("udid-1").unwrap().clone();
        table.mark("udid-1", ProgressFlag::NodeReady);
        assert_eq!(table.get("udid-1").unwrap(), &before);
    }

    #[test]
    fn test_data_key_pass_clears_only_its_flag() {
        let mut table = make_table(2);
        table.mark("udid-1", ProgressFlag::Found);
        table.mark("udid-1", ProgressFlag::DataKeyShared);
        table.start_data_key_pass();
        let peer = table.get("udid-1").unwrap();
        assert!(peer.found);
        assert!(!peer.data_key_shared);
    }

    #[test]
    fn test_reset_for_new_pass_preserves_activated() {
        let mut table = make_table(2);
        for flag in [
            ProgressFlag::Found,
            ProgressFlag::KeyShared,
            ProgressFlag::DataKeyShared,
            ProgressFlag::NodeReady,
            ProgressFlag::Activated,
        ] {
            table.mark("udid-1", flag);
        }
        table.reset_for_new_pass();
        let peer = table.get("udid-1").unwrap();
        assert!(!peer.found);
        assert!(!peer.key_shared);
        assert!(!peer.data_key_shared);
        assert!(!peer.node_ready);
        assert!(peer.activated);
    }
}
