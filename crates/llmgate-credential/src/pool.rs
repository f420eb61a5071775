use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::state::{CoolingPeriods, CredentialState, FailureKind};

pub type CredentialId = String;

/// One upstream API key and its runtime health bookkeeping.
///
/// `secret` never leaves this module in a [`CredentialSnapshot`] or log line.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: CredentialId,
    pub secret: String,
    pub state: CredentialState,
    pub cooling_until: Instant,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_requests: u64,
    pub last_used_at: Instant,
}

impl Credential {
    fn new(id: CredentialId, secret: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            secret,
            state: CredentialState::Active,
            cooling_until: now,
            consecutive_failures: 0,
            total_failures: 0,
            total_requests: 0,
            last_used_at: now,
        }
    }
}

/// A credential's public health, safe to serve from `/stats` — never carries `secret`.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSnapshot {
    pub id: CredentialId,
    pub state: CredentialState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_requests: u64,
    pub cooling_remaining_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    NoHealthyCredential,
}

pub struct CredentialPool {
    inner: Mutex<Vec<Credential>>,
    next_id: AtomicU64,
    max_failures_before_cool: u32,
    cooling: CoolingPeriods,
}

impl CredentialPool {
    pub fn new(max_failures_before_cool: u32, cooling: CoolingPeriods) -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            max_failures_before_cool,
            cooling,
        }
    }

    /// Adds a credential from startup configuration or the admin surface.
    pub fn add(&self, secret: String) -> CredentialId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("cred-{n:04}");
        let cred = Credential::new(id.clone(), secret);
        self.inner.lock().expect("credential pool poisoned").push(cred);
        id
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut guard = self.inner.lock().expect("credential pool poisoned");
        let before = guard.len();
        guard.retain(|c| c.id != id);
        guard.len() != before
    }

    pub fn disable(&self, id: &str) -> bool {
        self.with_credential_mut(id, |c| c.state = CredentialState::Disabled)
    }

    pub fn enable(&self, id: &str) -> bool {
        self.with_credential_mut(id, |c| {
            c.state = CredentialState::Active;
            c.cooling_until = Instant::now();
        })
    }

    /// Resets a credential to `Active`, clearing `consecutive_failures` and `cooling_until`
    /// while preserving lifetime counters (`total_requests`, `total_failures`).
    pub fn reset(&self, id: &str) -> bool {
        self.with_credential_mut(id, |c| {
            c.state = CredentialState::Active;
            c.consecutive_failures = 0;
            c.cooling_until = Instant::now();
        })
    }

    fn with_credential_mut(&self, id: &str, f: impl FnOnce(&mut Credential)) -> bool {
        let mut guard = self.inner.lock().expect("credential pool poisoned");
        match guard.iter_mut().find(|c| c.id == id) {
            Some(c) => {
                f(c);
                true
            }
            None => false,
        }
    }

    /// Sweeps any `Cooling` credential whose `cooling_until <= now` back to `Active`,
    /// resetting `consecutive_failures`, then leases the Active credential with the
    /// oldest `last_used_at` that is not in `exclude`. Ties break by `id` ascending.
    pub fn lease(&self, exclude: &[CredentialId]) -> Result<(CredentialId, String), AcquireError> {
        let now = Instant::now();
        let mut guard = self.inner.lock().expect("credential pool poisoned");

        for c in guard.iter_mut() {
            if c.state == CredentialState::Cooling && c.cooling_until <= now {
                c.state = CredentialState::Active;
                c.consecutive_failures = 0;
            }
        }

        let chosen = guard
            .iter_mut()
            .filter(|c| c.state == CredentialState::Active && !exclude.contains(&c.id))
            .min_by(|a, b| a.last_used_at.cmp(&b.last_used_at).then_with(|| a.id.cmp(&b.id)));

        match chosen {
            Some(c) => {
                c.last_used_at = now;
                c.total_requests += 1;
                Ok((c.id.clone(), c.secret.clone()))
            }
            None => Err(AcquireError::NoHealthyCredential),
        }
    }

    /// Records a retryable failure. Non-retryable kinds are terminal to the Dispatcher and
    /// must not reach this method.
    pub fn report_failure(&self, id: &str, kind: FailureKind) {
        if !kind.is_retryable() {
            return;
        }
        self.with_credential_mut(id, |c| {
            c.consecutive_failures += 1;
            c.total_failures += 1;
            let should_cool = c.consecutive_failures >= self.max_failures_before_cool
                || matches!(kind, FailureKind::AuthRejected | FailureKind::QuotaExceeded);
            if should_cool {
                c.state = CredentialState::Cooling;
                c.cooling_until = Instant::now() + self.cooling.for_kind(kind);
            }
        });
    }

    pub fn report_success(&self, id: &str) {
        self.with_credential_mut(id, |c| c.consecutive_failures = 0);
    }

    /// Earliest `cooling_until` among currently `Cooling` credentials, used for the
    /// `Retry-After` hint when the pool has no healthy credential.
    pub fn earliest_cooling_deadline(&self) -> Option<Duration> {
        let now = Instant::now();
        self.inner
            .lock()
            .expect("credential pool poisoned")
            .iter()
            .filter(|c| c.state == CredentialState::Cooling)
            .map(|c| c.cooling_until.saturating_duration_since(now))
            .min()
    }

    pub fn snapshot(&self) -> Vec<CredentialSnapshot> {
        let now = Instant::now();
        self.inner
            .lock()
            .expect("credential pool poisoned")
            .iter()
            .map(|c| CredentialSnapshot {
                id: c.id.clone(),
                state: c.state,
                consecutive_failures: c.consecutive_failures,
                total_failures: c.total_failures,
                total_requests: c.total_requests,
                cooling_remaining_secs: c.cooling_until.saturating_duration_since(now).as_secs(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("credential pool poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> CredentialPool {
        CredentialPool::new(3, CoolingPeriods::default())
    }

    #[test]
    fn lease_picks_least_recently_used_active() {
        let pool = pool();
        let a = pool.add("key-a".into());
        let b = pool.add("key-b".into());

        let (first, _) = pool.lease(&[]).unwrap();
        assert_eq!(first, a);
        let (second, _) = pool.lease(&[]).unwrap();
        assert_eq!(second, b);
    }

    #[test]
    fn report_failure_cools_on_auth_rejected_immediately() {
        let pool = pool();
        let a = pool.add("key-a".into());
        pool.report_failure(&a, FailureKind::AuthRejected);
        let snap = pool.snapshot();
        assert_eq!(snap[0].state, CredentialState::Cooling);
    }

    #[test]
    fn report_failure_cools_after_max_transient_failures() {
        let pool = pool();
        let a = pool.add("key-a".into());
        pool.report_failure(&a, FailureKind::TransientUpstream);
        pool.report_failure(&a, FailureKind::TransientUpstream);
        assert_eq!(pool.snapshot()[0].state, CredentialState::Active);
        pool.report_failure(&a, FailureKind::TransientUpstream);
        assert_eq!(pool.snapshot()[0].state, CredentialState::Cooling);
    }

    #[test]
    fn non_retryable_kinds_do_not_cool() {
        let pool = pool();
        let a = pool.add("key-a".into());
        pool.report_failure(&a, FailureKind::ModelNotFound);
        pool.report_failure(&a, FailureKind::BadRequest);
        pool.report_failure(&a, FailureKind::ContentFiltered);
        let snap = pool.snapshot();
        assert_eq!(snap[0].state, CredentialState::Active);
        assert_eq!(snap[0].total_failures, 0);
    }

    #[test]
    fn lease_with_no_active_credentials_errors() {
        let pool = pool();
        let a = pool.add("key-a".into());
        pool.disable(&a);
        assert_eq!(pool.lease(&[]).unwrap_err(), AcquireError::NoHealthyCredential);
    }

    #[test]
    fn reset_clears_failures_but_keeps_lifetime_counters() {
        let pool = pool();
        let a = pool.add("key-a".into());
        pool.report_failure(&a, FailureKind::AuthRejected);
        pool.reset(&a);
        let snap = pool.snapshot();
        assert_eq!(snap[0].state, CredentialState::Active);
        assert_eq!(snap[0].consecutive_failures, 0);
        assert_eq!(snap[0].total_failures, 1);
    }
}
