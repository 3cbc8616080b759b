//! The user-visible health surface.
//!
//! Failures surface as a structured [`HealthReport`] with a primary
//! and secondary human-readable message. Raw internal errors are never
//! exposed without this wrapping.

use serde::{Deserialize, Serialize};

/// Coarse health of one subsystem or of the whole daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Still starting up; not ready to serve.
    Initializing,
    /// Serving normally.
    Healthy,
    /// In a terminal or degraded state.
    Unhealthy,
}

impl HealthStatus {
    /// Returns the string representation of this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Healthy => "HEALTHY",
            Self::Unhealthy => "UNHEALTHY",
        }
    }
}

/// A structured health snapshot with wrapped debug messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Coarse status.
    pub status: HealthStatus,
    /// Primary human-readable message.
    pub message: String,
    /// Secondary detail, when available.
    pub detail: Option<String>,
}

impl HealthReport {
    /// A healthy report.
    #[must_use]
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: message.into(),
            detail: None,
        }
    }

    /// An initializing report.
    #[must_use]
    pub fn initializing(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Initializing,
            message: message.into(),
            detail: None,
        }
    }

    /// An unhealthy report with a primary and secondary message.
    #[must_use]
    pub fn unhealthy(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: message.into(),
            detail: Some(detail.into()),
        }
    }
}
