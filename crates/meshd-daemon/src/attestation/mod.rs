//! Attested node key lifecycle: provider seam, on-disk bundle cache,
//! and the rotation actor.

pub mod cache;
pub mod lifecycle;
pub mod provider;

pub use cache::{AttestationCache, CacheError};
pub use lifecycle::{AttestationError, KeyLifecycleHandle, KeyLifecycleManager};
pub use provider::{Attestor, AttestorError, BackoffPolicy, SoftwareAttestor};
