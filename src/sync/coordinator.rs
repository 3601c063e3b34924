//! Mutual exclusion between push, pull, and realtime application, plus the
//! central retry policy.
//!
//! Push holds the lock for a full drain pass, pull for a full cycle, and the
//! realtime applier for one event at a time.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as StateMutex;
use tokio::sync::{Mutex, MutexGuard};
use tracing::trace;

use crate::config::SyncSettings;
use crate::error::OperationError;

/// Which path currently holds the sync lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockHolder {
    Push,
    Pull,
    Realtime,
}

/// Shared sync lock. Clones refer to the same lock.
#[derive(Debug, Clone, Default)]
pub struct SyncCoordinator {
    lock: Arc<Mutex<()>>,
    holder: Arc<StateMutex<Option<LockHolder>>>,
}

/// Proof of exclusive access; releases the lock when dropped.
pub struct SyncGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    holder: &'a StateMutex<Option<LockHolder>>,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.holder.lock().take();
    }
}

impl SyncCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access.
    pub async fn acquire(&self, who: LockHolder) -> SyncGuard<'_> {
        let guard = self.lock.lock().await;
        trace!(?who, "Sync lock acquired");
        *self.holder.lock() = Some(who);
        SyncGuard {
            _guard: guard,
            holder: &self.holder,
        }
    }

    /// Current holder, for diagnostics.
    #[must_use]
    pub fn holder(&self) -> Option<LockHolder> {
        *self.holder.lock()
    }
}

/// What to do with a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep it pending for the next flush.
    RetryLater,
    /// Mark it failed and show it to the user.
    Surface,
}

/// Central retry and backoff rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before a retryable failure is surfaced.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_secs(settings.backoff_base_secs),
            max_delay: Duration::from_secs(settings.backoff_max_secs),
        }
    }

    /// Decide the fate of an operation that has already failed
    /// `previous_attempts` times and just failed again with `error`.
    #[must_use]
    pub const fn disposition(&self, error: &OperationError, previous_attempts: u32) -> Disposition {
        if error.is_terminal() || previous_attempts.saturating_add(1) >= self.max_attempts {
            Disposition::Surface
        } else {
            Disposition::RetryLater
        }
    }

    /// Wait before the next automatic flush after `consecutive_failures`
    /// deferred passes: `base * 2^(n-1)`, capped.
    #[must_use]
    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (consecutive_failures - 1).min(16);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_excludes_and_reports_holder() {
        let coordinator = SyncCoordinator::new();
        let other = coordinator.clone();

        let guard = coordinator.acquire(LockHolder::Pull).await;
        assert_eq!(other.holder(), Some(LockHolder::Pull));

        let blocked = tokio::time::timeout(
            Duration::from_millis(20),
            other.acquire(LockHolder::Push),
        )
        .await;
        assert!(blocked.is_err());

        drop(guard);
        assert_eq!(other.holder(), None);
        let _push = other.acquire(LockHolder::Push).await;
        assert_eq!(coordinator.holder(), Some(LockHolder::Push));
    }

    #[test]
    fn test_terminal_errors_surface_immediately() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.disposition(&OperationError::PayloadCorrupt("x".into()), 0),
            Disposition::Surface
        );
        assert_eq!(
            policy.disposition(&OperationError::NoHandler("x".into()), 0),
            Disposition::Surface
        );
    }

    #[test]
    fn test_retryable_errors_surface_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let err = OperationError::Network("timeout".into());
        assert_eq!(policy.disposition(&err, 0), Disposition::RetryLater);
        assert_eq!(policy.disposition(&err, 1), Disposition::RetryLater);
        assert_eq!(policy.disposition(&err, 2), Disposition::Surface);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        };
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(10));
        assert_eq!(policy.backoff(4), Duration::from_secs(40));
        assert_eq!(policy.backoff(10), Duration::from_secs(300));
        assert_eq!(policy.backoff(100), Duration::from_secs(300));
    }
}
