//! Validated node and ensemble configuration.
//!
//! An ensemble is a fixed set of ranked nodes. Rank 0 is always the
//! leader. Ranks are contiguous, UDIDs unique, and nodes are grouped
//! four to a chassis (ranks 0-3 share a chassis, 4-7 the next, and so
//! on). Configuration is immutable once loaded; everything downstream
//! assumes it has passed [`EnsembleConfig::validate`].

use serde::{Deserialize, Serialize};

/// Number of node slots per chassis.
pub const RANKS_PER_CHASSIS: u32 = 4;

/// Errors produced while validating an ensemble configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The node table is empty.
    #[error("ensemble configuration contains no nodes")]
    Empty,

    /// Ranks are not the contiguous range `0..node_count`.
    #[error("node ranks are not contiguous: missing rank {missing}")]
    NonContiguousRanks {
        /// The lowest rank with no configured node.
        missing: u32,
    },

    /// Two nodes share a rank.
    #[error("duplicate rank {rank}")]
    DuplicateRank {
        /// The rank that appears more than once.
        rank: u32,
    },

    /// Two nodes share a UDID.
    #[error("duplicate UDID {udid}")]
    DuplicateUdid {
        /// The UDID that appears more than once.
        udid: String,
    },

    /// A node's UDID is empty.
    #[error("node at rank {rank} has an empty UDID")]
    EmptyUdid {
        /// The rank of the offending node.
        rank: u32,
    },

    /// A node's chassis ID disagrees with its rank-derived group.
    #[error("node at rank {rank} declares chassis {declared} but belongs to chassis group {expected}")]
    ChassisMismatch {
        /// The rank of the offending node.
        rank: u32,
        /// The chassis ID present in the configuration.
        declared: u32,
        /// The chassis group implied by the rank.
        expected: u32,
    },
}

/// One node of the ensemble. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfiguration {
    /// Rank within the ensemble; rank 0 is the leader.
    pub rank: u32,

    /// Host identity used when dialing this node.
    pub host: String,

    /// Chassis the node is physically installed in.
    pub chassis_id: u32,

    /// Unique device identifier; the map key for all peer state.
    pub udid: String,
}

impl NodeConfiguration {
    /// Returns `true` if this node is the ensemble leader.
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        self.rank == 0
    }

    /// Returns the chassis group implied by this node's rank.
    #[must_use]
    pub const fn chassis_group(&self) -> u32 {
        self.rank / RANKS_PER_CHASSIS
    }
}

/// The full, validated node table for one ensemble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// All nodes, in no particular order.
    pub nodes: Vec<NodeConfiguration>,
}

impl EnsembleConfig {
    /// Creates a configuration after validating it.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first violation found.
    pub fn new(nodes: Vec<NodeConfiguration>) -> Result<Self, ConfigError> {
        let config = Self { nodes };
        config.validate()?;
        Ok(config)
    }

    /// Number of nodes in the ensemble.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` for a single-node ensemble, which skips key
    /// distribution and mesh activation entirely.
    #[must_use]
    pub fn is_single_node(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Looks up a node by rank.
    #[must_use]
    pub fn node_at_rank(&self, rank: u32) -> Option<&NodeConfiguration> {
        self.nodes.iter().find(|n| n.rank == rank)
    }

    /// Looks up a node by UDID.
    #[must_use]
    pub fn node_with_udid(&self, udid: &str) -> Option<&NodeConfiguration> {
        self.nodes.iter().find(|n| n.udid == udid)
    }

    /// The leader's configuration entry.
    ///
    /// Only meaningful after validation, which guarantees rank 0 exists.
    #[must_use]
    pub fn leader(&self) -> Option<&NodeConfiguration> {
        self.node_at_rank(0)
    }

    /// Validates rank contiguity, UDID uniqueness, and chassis grouping.
    ///
    /// Chassis grouping requires each node's declared `chassis_id` to
    /// match `rank / RANKS_PER_CHASSIS`: ranks 0-3 share a chassis,
    /// ranks 4-7 the next, and so on.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] violation found.
    #[allow(clippy::cast_possible_truncation)]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::Empty);
        }

        let count = self.nodes.len() as u32;
        let mut seen_ranks = vec![false; self.nodes.len()];
        let mut seen_udids = std::collections::HashSet::with_capacity(self.nodes.len());

        for node in &self.nodes {
            if node.udid.is_empty() {
                return Err(ConfigError::EmptyUdid { rank: node.rank });
            }
            if node.rank >= count {
                // A rank beyond the table size implies a gap below it.
                let missing = (0..count)
                    .find(|r| !self.nodes.iter().any(|n| n.rank == *r))
                    .unwrap_or(count);
                return Err(ConfigError::NonContiguousRanks { missing });
            }
            let slot = &mut seen_ranks[node.rank as usize];
            if *slot {
                return Err(ConfigError::DuplicateRank { rank: node.rank });
            }
            *slot = true;

            if !seen_udids.insert(node.udid.as_str()) {
                return Err(ConfigError::DuplicateUdid {
                    udid: node.udid.clone(),
                });
            }

            let expected = node.chassis_group();
            if node.chassis_id != expected {
                return Err(ConfigError::ChassisMismatch {
                    rank: node.rank,
                    declared: node.chassis_id,
                    expected,
                });
            }
        }

        Ok(())
    }
}
