//! meshd-daemon - the ensemble mesh coordination daemon.
//!
//! This crate owns everything with a runtime in it:
//!
//! - [`coordinator`]: the leader/follower ensemble-formation actor and
//!   its convergence watchdog
//! - [`attestation`]: the attested-key lifecycle manager, its rotation
//!   loop, and the on-disk attestation cache
//! - [`replay`]: the crash-safe session replay store
//! - [`service`]: the in-process API consumed by the request-serving
//!   daemon and worker helpers
//! - [`transport`]: the seams to the external control channel, mesh
//!   backend, and follower client pool
//! - [`config`]: daemon configuration loading
//! - [`health`]: the aggregated daemon health snapshot
//!
//! The pure state machines and key material types live in
//! [`meshd_core`].

pub mod attestation;
pub mod config;
pub mod coordinator;
pub mod health;
pub mod replay;
pub mod service;
pub mod transport;
