use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime state of one upstream credential.
///
/// `Cooling` always carries a `cooling_until` on the owning [`Credential`];
/// `state=Active ⇒ cooling_until <= now` and `state=Cooling ⇒ cooling_until > now`
/// are invariants maintained by [`crate::pool::CredentialPool`], never by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialState {
    Active,
    Cooling,
    /// Set only by the administrative surface; failure accounting never sets this.
    Disabled,
}

/// Classification of an upstream attempt's outcome, fed to `report_failure`/`report_success`.
///
/// Only `AuthRejected`, `QuotaExceeded`, and `TransientUpstream` cool a credential and are
/// retried against another lease. `BadRequest`, `ModelNotFound`, and `ContentFiltered` are
/// terminal: the Dispatcher returns them to the caller without cooling or retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    AuthRejected,
    QuotaExceeded,
    TransientUpstream,
    BadRequest,
    ModelNotFound,
    ContentFiltered,
}

impl FailureKind {
    /// Whether this outcome should increment failure counters and potentially cool the credential.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::AuthRejected | FailureKind::QuotaExceeded | FailureKind::TransientUpstream
        )
    }
}

/// Configurable cooling durations by failure kind.
#[derive(Debug, Clone, Copy)]
pub struct CoolingPeriods {
    pub auth_rejected: Duration,
    pub quota_exceeded: Duration,
    pub transient_upstream: Duration,
}

impl Default for CoolingPeriods {
    fn default() -> Self {
        Self {
            auth_rejected: Duration::from_secs(60 * 60),
            quota_exceeded: Duration::from_secs(5 * 60),
            transient_upstream: Duration::from_secs(30),
        }
    }
}

impl CoolingPeriods {
    pub fn for_kind(&self, kind: FailureKind) -> Duration {
        match kind {
            FailureKind::AuthRejected => self.auth_rejected,
            FailureKind::QuotaExceeded => self.quota_exceeded,
            FailureKind::TransientUpstream => self.transient_upstream,
            FailureKind::BadRequest | FailureKind::ModelNotFound | FailureKind::ContentFiltered => {
                Duration::ZERO
            }
        }
    }
}
