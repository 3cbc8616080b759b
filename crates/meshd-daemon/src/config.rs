//! Daemon configuration parsing.
//!
//! Loaded once from a TOML file at startup, validated, then treated as
//! immutable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use meshd_core::node::EnsembleConfig;
use serde::{Deserialize, Serialize};

/// Errors produced while loading the daemon configuration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The ensemble node table failed validation.
    #[error("invalid ensemble configuration: {0}")]
    Ensemble(#[from] meshd_core::node::ConfigError),

    /// This node's UDID does not appear in the node table.
    #[error("local UDID {udid} is not in the ensemble node table")]
    UnknownLocalNode {
        /// The configured local UDID.
        udid: String,
    },
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// UDID of the node this daemon runs on.
    pub local_udid: String,

    /// The ensemble node table.
    pub ensemble: EnsembleConfig,

    /// Timeout knobs.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// On-disk storage paths.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl DaemonConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read, parsed,
    /// or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if parsing or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.ensemble.validate()?;
        if config.ensemble.node_with_udid(&config.local_udid).is_none() {
            return Err(ConfigError::UnknownLocalNode {
                udid: config.local_udid.clone(),
            });
        }
        Ok(config)
    }

    /// This node's rank, or `None` if `local_udid` names no node in
    /// the ensemble table.
    ///
    /// Always `Some` after [`Self::from_toml`] succeeded; the option
    /// form keeps callers holding a hand-built config honest.
    #[must_use]
    pub fn local_rank(&self) -> Option<u32> {
        self.ensemble
            .node_with_udid(&self.local_udid)
            .map(|n| n.rank)
    }
}

/// Timeout knobs, all with production defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// One watchdog per formation attempt; expiry is terminal.
    #[serde(default = "default_formation_timeout_secs")]
    pub formation_timeout_secs: u64,

    /// Poll interval while waiting for follower client connections.
    #[serde(default = "default_connection_poll_secs")]
    pub connection_poll_secs: u64,

    /// How long the leader waits for all followers to confirm an ad
    /// hoc data key. Tolerant of a miss; the flag check absorbs late
    /// confirmations.
    #[serde(default = "default_data_key_wait_ms")]
    pub data_key_wait_ms: u64,

    /// Grace period past expiry during which an attested key remains
    /// valid for existing sessions.
    #[serde(default = "default_key_expiry_grace_secs")]
    pub key_expiry_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            formation_timeout_secs: default_formation_timeout_secs(),
            connection_poll_secs: default_connection_poll_secs(),
            data_key_wait_ms: default_data_key_wait_ms(),
            key_expiry_grace_secs: default_key_expiry_grace_secs(),
        }
    }
}

impl TimeoutConfig {
    /// The formation watchdog duration.
    #[must_use]
    pub const fn formation_timeout(&self) -> Duration {
        Duration::from_secs(self.formation_timeout_secs)
    }

    /// The connection-readiness poll interval.
    #[must_use]
    pub const fn connection_poll(&self) -> Duration {
        Duration::from_secs(self.connection_poll_secs)
    }

    /// The data-key confirmation wait.
    #[must_use]
    pub const fn data_key_wait(&self) -> Duration {
        Duration::from_millis(self.data_key_wait_ms)
    }

    /// The attested-key expiry grace period.
    #[must_use]
    pub const fn key_expiry_grace(&self) -> Duration {
        Duration::from_secs(self.key_expiry_grace_secs)
    }
}

/// On-disk storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding session replay files, one per node key.
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,

    /// Path of the attestation bundle cache.
    #[serde(default = "default_attestation_cache")]
    pub attestation_cache: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            session_dir: default_session_dir(),
            attestation_cache: default_attestation_cache(),
        }
    }
}

const fn default_formation_timeout_secs() -> u64 {
    1200
}

const fn default_connection_poll_secs() -> u64 {
    1
}

const fn default_data_key_wait_ms() -> u64 {
    500
}

const fn default_key_expiry_grace_secs() -> u64 {
    300
}

fn default_session_dir() -> PathBuf {
    PathBuf::from("/var/lib/meshd/sessions")
}

fn default_attestation_cache() -> PathBuf {
    PathBuf::from("/var/lib/meshd/attestation-cache.json")
}
