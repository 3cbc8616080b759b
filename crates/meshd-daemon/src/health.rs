//! Aggregated daemon health.
//!
//! Combines the ensemble status and the attested-key state into one
//! [`HealthReport`]. Internal error detail is folded into the report's
//! secondary message, never handed out raw.

use std::time::{Duration, SystemTime};

use meshd_core::ensemble::status::EnsembleStatus;
use meshd_core::health::HealthReport;
use meshd_core::key::AttestedKeySet;

/// Computes the daemon's health from its two long-lived subsystems.
#[must_use]
pub fn assess(
    ensemble: EnsembleStatus,
    key_set: Option<&AttestedKeySet>,
    grace: Duration,
) -> HealthReport {
    if ensemble.is_failed() {
        return HealthReport::unhealthy(
            "ensemble formation failed",
            format!("ensemble status {ensemble}"),
        );
    }

    let now = SystemTime::now();
    match key_set {
        Some(set) if now < set.current.retire_at(grace) => {
            if ensemble == EnsembleStatus::Ready {
                HealthReport::healthy("serving")
            } else {
                HealthReport::initializing(format!("ensemble status {ensemble}"))
            }
        },
        Some(_) => HealthReport::unhealthy(
            "attested key expired",
            "current node key is past expiry plus grace and no rotation has landed",
        ),
        None => HealthReport::initializing("no attested key yet"),
    }
}

#[cfg(test)]
#[allow(missing_docs)]
mod tests {
    use meshd_core::health::HealthStatus;
    use meshd_core::key::AttestedKey;

    use super::*;

    const GRACE: Duration = Duration::from_secs(300);

    fn make_set(ttl_secs: i64) -> AttestedKeySet {
        let expiry = if ttl_secs >= 0 {
            SystemTime::now() + Duration::from_secs(ttl_secs.unsigned_abs())
        } else {
            SystemTime::now() - Duration::from_secs(ttl_secs.unsigned_abs())
        };
        AttestedKeySet::new(AttestedKey::new(b"bundle".to_vec(), expiry, [0; 32]))
    }

    #[test]
    fn test_ready_with_key_is_healthy() {
        let set = make_set(3600);
        let report = assess(EnsembleStatus::Ready, Some(&set), GRACE);
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_forming_is_initializing() {
        let set = make_set(3600);
        let report = assess(EnsembleStatus::Coordinating, Some(&set), GRACE);
        assert_eq!(report.status, HealthStatus::Initializing);
    }

    #[test]
    fn test_failed_ensemble_is_unhealthy_with_detail() {
        let set = make_set(3600);
        let report = assess(EnsembleStatus::Failed, Some(&set), GRACE);
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.detail.is_some());
    }

    #[test]
    fn test_retired_key_is_unhealthy() {
        let set = make_set(-3600);
        let report = assess(EnsembleStatus::Ready, Some(&set), GRACE);
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_no_key_yet_is_initializing() {
        let report = assess(EnsembleStatus::Ready, None, GRACE);
        assert_eq!(report.status, HealthStatus::Initializing);
    }
}
