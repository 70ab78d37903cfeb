//! Per-provider failover bookkeeping.
//!
//! Tracks which providers are temporarily failed (cooling down), the
//! configured primary, the provider that last served a request and the
//! round-robin cursor. All state is in-memory and resets on restart.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};

use crate::clock::{elapsed_since, to_chrono};
use crate::errors::ProviderErrorKind;
use crate::models::ProviderId;

/// Sentinel for "no provider has served yet".
const NO_LAST_USED: usize = usize::MAX;

/// A provider's entry in the temporarily-failed set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemporaryFailure {
    pub failed_at: DateTime<Utc>,
    pub kind: ProviderErrorKind,
}

/// Failover state shared by all requests.
///
/// Cooldown membership is only ever cleared by elapsed time or by a success
/// from the same provider.
pub struct FailoverState {
    cooldown: Duration,
    failures: DashMap<String, TemporaryFailure>,
    consecutive_failures: AtomicU32,
    primary: RwLock<Option<ProviderId>>,
    current: RwLock<Option<ProviderId>>,
    last_used: AtomicUsize,
}

impl FailoverState {
    pub fn new(cooldown: Duration, primary: Option<ProviderId>) -> Self {
        Self {
            cooldown,
            failures: DashMap::new(),
            consecutive_failures: AtomicU32::new(0),
            current: RwLock::new(primary.clone()),
            primary: RwLock::new(primary),
            last_used: AtomicUsize::new(NO_LAST_USED),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Put a provider into cooldown starting at `now`.
    pub fn mark_failed(&self, provider: &str, kind: ProviderErrorKind, now: DateTime<Utc>) {
        info!(
            "Provider '{}' marked temporarily failed ({}) for {:?}",
            provider,
            kind.label(),
            self.cooldown
        );
        self.failures.insert(
            provider.to_string(),
            TemporaryFailure {
                failed_at: now,
                kind,
            },
        );
    }

    /// Whether the provider is still cooling down at `now`. An elapsed
    /// cooldown is removed on the way.
    pub fn is_cooling_down(&self, provider: &str, now: DateTime<Utc>) -> bool {
        let expired = match self.failures.get(provider) {
            None => return false,
            Some(failure) => elapsed_since(failure.failed_at, now) >= self.cooldown,
        };

        if expired {
            let cooldown = self.cooldown;
            self.failures
                .remove_if(provider, |_, f| elapsed_since(f.failed_at, now) >= cooldown);
            debug!("Provider '{}' cooldown elapsed", provider);
            false
        } else {
            true
        }
    }

    /// When the provider's cooldown ends, if it is cooling down at `now`.
    pub fn cooldown_until(&self, provider: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.failures
            .get(provider)
            .map(|f| f.failed_at + to_chrono(self.cooldown))
            .filter(|until| now < *until)
    }

    pub fn failure(&self, provider: &str) -> Option<TemporaryFailure> {
        self.failures.get(provider).map(|f| f.clone())
    }

    /// Forget any temporary failure, after the provider succeeded.
    pub fn clear(&self, provider: &str) {
        if self.failures.remove(provider).is_some() {
            info!("Provider '{}' recovered", provider);
        }
    }

    /// Providers currently cooling down.
    pub fn temporarily_failed(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut failed: Vec<String> = self
            .failures
            .iter()
            .filter(|f| elapsed_since(f.failed_at, now) < self.cooldown)
            .map(|f| f.key().clone())
            .collect();
        failed.sort();
        failed
    }

    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn primary(&self) -> Option<ProviderId> {
        read(&self.primary).clone()
    }

    pub fn set_primary(&self, provider: ProviderId) {
        *write(&self.primary) = Some(provider);
    }

    pub fn current(&self) -> Option<ProviderId> {
        read(&self.current).clone()
    }

    pub fn set_current(&self, provider: ProviderId) {
        *write(&self.current) = Some(provider);
    }

    /// Registration index of the provider that served last.
    pub fn last_used(&self) -> Option<usize> {
        match self.last_used.load(Ordering::Relaxed) {
            NO_LAST_USED => None,
            index => Some(index),
        }
    }

    pub fn set_last_used(&self, index: usize) {
        self.last_used.store(index, Ordering::Relaxed);
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("Failover state lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("Failover state lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    const COOLDOWN: Duration = Duration::from_millis(300_000);

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::milliseconds(ms)
    }

    #[test]
    fn test_cooldown_window() {
        let state = FailoverState::new(COOLDOWN, None);
        state.mark_failed("A", ProviderErrorKind::AuthInvalid, at(0));

        assert!(state.is_cooling_down("A", at(299_999)));
        assert_eq!(state.cooldown_until("A", at(1)), Some(at(300_000)));
        assert!(!state.is_cooling_down("A", at(300_000)));
        assert!(state.failure("A").is_none());
    }

    #[test]
    fn test_success_clears_cooldown() {
        let state = FailoverState::new(COOLDOWN, None);
        state.mark_failed("A", ProviderErrorKind::ServiceUnavailable, at(0));
        assert_eq!(state.temporarily_failed(at(10)), vec!["A".to_string()]);

        state.clear("A");
        assert!(!state.is_cooling_down("A", at(10)));
        assert!(state.temporarily_failed(at(10)).is_empty());
    }

    #[test]
    fn test_unknown_provider_is_not_cooling_down() {
        let state = FailoverState::new(COOLDOWN, None);
        assert!(!state.is_cooling_down("X", at(0)));
        assert_eq!(state.cooldown_until("X", at(0)), None);
    }

    #[test]
    fn test_primary_and_current() {
        let state = FailoverState::new(COOLDOWN, Some(Cow::Borrowed("A")));
        assert_eq!(state.primary().as_deref(), Some("A"));
        assert_eq!(state.current().as_deref(), Some("A"));

        state.set_current(Cow::Borrowed("B"));
        assert_eq!(state.current().as_deref(), Some("B"));
        assert_eq!(state.primary().as_deref(), Some("A"));
    }

    #[test]
    fn test_consecutive_failures() {
        let state = FailoverState::new(COOLDOWN, None);
        assert_eq!(state.record_failure(), 1);
        assert_eq!(state.record_failure(), 2);
        state.reset_failures();
        assert_eq!(state.consecutive_failures(), 0);
    }

    #[test]
    fn test_last_used_cursor() {
        let state = FailoverState::new(COOLDOWN, None);
        assert_eq!(state.last_used(), None);
        state.set_last_used(2);
        assert_eq!(state.last_used(), Some(2));
    }
}
