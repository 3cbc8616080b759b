//! Ensemble formation: the per-node state machine and peer progress
//! tracking the coordinator drives.
//!
//! # Modules
//!
//! - [`status`]: the [`EnsembleStatus`](status::EnsembleStatus) finite
//!   state machine with role-specific legal-transition tables
//! - [`peer`]: per-peer monotone progress flags and aggregate checks

pub mod peer;
pub mod status;
