//! Durable session replay protection, keyed by attested node key.

pub mod store;

pub use store::{SessionStore, StoreError};
