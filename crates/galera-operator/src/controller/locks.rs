//! Per-cluster mutual exclusion between reconciliation and scheduled jobs
//!
//! Every cluster key gets one [`ReconcileLock`]: an async mutex plus a
//! throttle flag. Reconciliation holds the mutex for a whole pass and
//! resets the flag when it finishes. A scheduled job takes the mutex and
//! then flips the flag from `Ready` to `Pending`, so two job runs for the
//! same cluster are always separated by at least one reconciliation.
//!
//! Locks are created on first use and never evicted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Whether a scheduled job may run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Throttle {
    /// A reconciliation ran since the last job
    Ready,
    /// A job ran and no reconciliation has followed yet
    Pending,
}

/// Lock and throttle flag for one cluster
#[derive(Default)]
pub struct ReconcileLock {
    mutex: Arc<Mutex<()>>,
    pending: AtomicBool,
}

impl ReconcileLock {
    /// Hold the lock for a reconciliation pass
    ///
    /// Dropping the guard resets the throttle to [`Throttle::Ready`] before
    /// the mutex is released.
    pub async fn reconcile(self: &Arc<Self>) -> ReconcileGuard {
        let permit = self.mutex.clone().lock_owned().await;
        ReconcileGuard {
            lock: self.clone(),
            _permit: permit,
        }
    }

    /// Hold the lock for a scheduled job
    ///
    /// Returns `None` when the previous job's result has not been
    /// reconciled yet.
    pub async fn job(&self) -> Option<JobGuard> {
        let permit = self.mutex.clone().lock_owned().await;
        self.pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| JobGuard { _permit: permit })
    }

    /// Current throttle state
    pub fn throttle(&self) -> Throttle {
        if self.pending.load(Ordering::Acquire) {
            Throttle::Pending
        } else {
            Throttle::Ready
        }
    }
}

/// Held for the duration of one reconciliation pass
pub struct ReconcileGuard {
    lock: Arc<ReconcileLock>,
    _permit: OwnedMutexGuard<()>,
}

impl Drop for ReconcileGuard {
    fn drop(&mut self) {
        // Runs before the fields drop, so the mutex is still held here
        self.lock.pending.store(false, Ordering::Release);
    }
}

/// Held for the duration of one scheduled job run
pub struct JobGuard {
    _permit: OwnedMutexGuard<()>,
}

/// Registry of every lock handed out, keyed by `<namespace>/<name>`
#[derive(Default)]
pub struct LockRegistry {
    locks: DashMap<String, Arc<ReconcileLock>>,
}

impl LockRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `key`, created on first use
    pub fn load_or_create(&self, key: &str) -> Arc<ReconcileLock> {
        if let Some(lock) = self.locks.get(key) {
            return lock.clone();
        }
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(ReconcileLock::default()))
            .clone()
    }

    /// Number of keys seen so far
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True if no key was seen yet
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn same_key_returns_same_lock() {
        let registry = LockRegistry::new();
        let a = registry.load_or_create("db/prod");
        let b = registry.load_or_create("db/prod");
        let c = registry.load_or_create("db/staging");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn story_one_holder_per_key_under_contention() {
        let registry = Arc::new(LockRegistry::new());
        let holders = Arc::new(AtomicUsize::new(0));
        let max_holders = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let registry = registry.clone();
                let holders = holders.clone();
                let max_holders = max_holders.clone();
                tokio::spawn(async move {
                    let lock = registry.load_or_create("db/prod");
                    // Mix reconciliations with scheduled jobs
                    let _guard: Box<dyn Send> = if i % 4 == 0 {
                        match lock.job().await {
                            Some(g) => Box::new(g),
                            None => return,
                        }
                    } else {
                        Box::new(lock.reconcile().await)
                    };
                    let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    max_holders.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    holders.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_holders.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn story_second_job_waits_for_a_reconciliation() {
        let registry = LockRegistry::new();
        let lock = registry.load_or_create("db/prod");

        let first = lock.job().await;
        assert!(first.is_some());
        drop(first);
        assert_eq!(lock.throttle(), Throttle::Pending);

        // Back-to-back job is skipped
        assert!(lock.job().await.is_none());

        drop(lock.reconcile().await);
        assert_eq!(lock.throttle(), Throttle::Ready);
        assert!(lock.job().await.is_some());
    }

    #[tokio::test]
    async fn reconcile_guard_resets_throttle_while_locked() {
        let lock = Arc::new(ReconcileLock::default());
        drop(lock.job().await);

        let guard = lock.reconcile().await;
        // Still pending while the pass runs
        assert_eq!(lock.throttle(), Throttle::Pending);
        assert!(lock.mutex.try_lock().is_err());
        drop(guard);
        assert_eq!(lock.throttle(), Throttle::Ready);
        assert!(lock.mutex.try_lock().is_ok());
    }
}
