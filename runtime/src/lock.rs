//! Cross-process distributed locks over the coordination store.
//!
//! A lock is a store key `lock:{name}` holding the acquirer's token with a
//! lease TTL, taken with an atomic set-if-absent. The lease bounds the
//! damage of a crashed holder: the key expires and the next acquirer gets
//! in without operator intervention.
//!
//! Multi-key acquisition sorts the key set into one canonical order before
//! touching the store. Two callers contending for overlapping sets always
//! walk the keys in the same relative order, so a cyclic wait cannot form.

use flashsale_core::{CoordinationStore, StoreError};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

/// Default time a caller waits for a contended lock.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(3);

/// Default lease after which an unreleased lock expires on its own.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(5);

const POLL_BASE: Duration = Duration::from_millis(50);
const POLL_JITTER_MS: u64 = 25;

/// Failure to take a lock.
#[derive(Error, Debug)]
pub enum LockError {
    /// The wait deadline passed without the key (or full key set) becoming
    /// free. Nothing is held when this is returned.
    #[error("timed out waiting for lock {key}")]
    Timeout {
        /// The contended key, with its `lock:` prefix.
        key: String,
    },

    /// The coordination store failed mid-acquisition. Anything already
    /// acquired has been released.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Proof of acquisition. Consumed by [`LockCoordinator::release`]; the
/// token ties release to this acquisition so an expired lease taken over
/// by another holder is never deleted from under them.
#[derive(Debug)]
pub struct LockHandle {
    keys: Vec<String>,
    token: String,
    expires_at: Instant,
}

impl LockHandle {
    /// The held keys in acquisition (canonical) order.
    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Whether the lease deadline has passed. An expired handle may no
    /// longer be protecting anything; the key can already belong to the
    /// next acquirer.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Distributed lock coordinator over a shared [`CoordinationStore`].
#[derive(Debug)]
pub struct LockCoordinator<S> {
    store: Arc<S>,
}

impl<S> Clone for LockCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

fn prefixed(key: &str) -> String {
    format!("lock:{key}")
}

fn poll_interval() -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=POLL_JITTER_MS);
    POLL_BASE + Duration::from_millis(jitter)
}

impl<S: CoordinationStore> LockCoordinator<S> {
    /// Create a coordinator over `store`.
    #[must_use]
    pub const fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Acquire a single lock, waiting up to `wait` for it to become free.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] when the deadline passes and
    /// [`LockError::Store`] on store failure; neither leaves anything held.
    pub async fn acquire(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<LockHandle, LockError> {
        self.acquire_all(&[key], wait, lease).await
    }

    /// Acquire every key in `keys` as one logical unit.
    ///
    /// The set is sorted and deduplicated first; all keys share the token,
    /// the lease, and one wait deadline. On any failure the keys already
    /// taken are released before the error is returned, so a partial
    /// acquisition is never observable.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] when the shared deadline passes while
    /// some key is still contended, [`LockError::Store`] on store failure.
    pub async fn acquire_all(
        &self,
        keys: &[&str],
        wait: Duration,
        lease: Duration,
    ) -> Result<LockHandle, LockError> {
        let mut sorted: Vec<String> = keys.iter().map(|k| prefixed(k)).collect();
        sorted.sort();
        sorted.dedup();

        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait;
        let mut acquired: Vec<String> = Vec::with_capacity(sorted.len());
        // Each key's lease starts when that key is taken; the handle keeps
        // the earliest expiry, the first point the set stops being whole.
        let mut first_acquired_at: Option<Instant> = None;

        for key in &sorted {
            loop {
                match self.store.set_if_absent(key, &token, lease).await {
                    Ok(true) => {
                        first_acquired_at.get_or_insert_with(Instant::now);
                        acquired.push(key.clone());
                        break;
                    }
                    Ok(false) => {
                        if Instant::now() >= deadline {
                            self.release_keys(&acquired, &token).await;
                            tracing::debug!(key = %key, wait_ms = wait.as_millis(), "lock wait timed out");
                            return Err(LockError::Timeout { key: key.clone() });
                        }
                        tokio::time::sleep(poll_interval()).await;
                    }
                    Err(err) => {
                        self.release_keys(&acquired, &token).await;
                        return Err(LockError::Store(err));
                    }
                }
            }
        }

        tracing::trace!(keys = ?sorted, "locks acquired");
        Ok(LockHandle {
            keys: sorted,
            token,
            expires_at: first_acquired_at.unwrap_or_else(Instant::now) + lease,
        })
    }

    /// Release every key in `handle`.
    ///
    /// Idempotent from the caller's perspective: a key whose lease already
    /// expired, or that another holder took over, or that the store refuses
    /// to delete is logged and skipped, never escalated.
    pub async fn release(&self, handle: LockHandle) {
        if handle.is_expired() {
            tracing::debug!(keys = ?handle.keys, "lease expired before release");
        }
        self.release_keys(&handle.keys, &handle.token).await;
    }

    async fn release_keys(&self, keys: &[String], token: &str) {
        for key in keys {
            match self.store.delete_if_equals(key, token).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(key = %key, "lock already expired or taken over at release");
                }
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "failed to release lock");
                }
            }
        }
    }

    /// Run `op` while holding the lock on `key`.
    ///
    /// The lock is released on every exit path, whatever `op` returns,
    /// before the result is propagated.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] when acquisition fails; `op` is not run then.
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
        op: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.with_locks(&[key], wait, lease, op).await
    }

    /// Run `op` while holding every lock in `keys` (sorted, deduplicated).
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] when acquisition fails; `op` is not run then.
    pub async fn with_locks<F, Fut, T>(
        &self,
        keys: &[&str],
        wait: Duration,
        lease: Duration,
        op: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = self.acquire_all(keys, wait, lease).await?;
        let out = op().await;
        self.release(handle).await;
        Ok(out)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use flashsale_memory::InMemoryCoordinationStore;

    fn coordinator() -> LockCoordinator<InMemoryCoordinationStore> {
        LockCoordinator::new(Arc::new(InMemoryCoordinationStore::new()))
    }

    #[tokio::test]
    async fn second_acquirer_times_out_while_held() {
        let locks = coordinator();
        let held = locks
            .acquire("order:1", DEFAULT_WAIT, DEFAULT_LEASE)
            .await
            .unwrap();

        let err = locks
            .acquire("order:1", Duration::from_millis(150), DEFAULT_LEASE)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));

        locks.release(held).await;
        let reacquired = locks
            .acquire("order:1", Duration::from_millis(150), DEFAULT_LEASE)
            .await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn release_is_safe_after_lease_expiry() {
        let locks = coordinator();
        let handle = locks
            .acquire("order:2", DEFAULT_WAIT, Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_expired());
        // The lease has expired and the key may belong to someone else now.
        let other = locks
            .acquire("order:2", Duration::from_millis(100), DEFAULT_LEASE)
            .await
            .unwrap();
        locks.release(handle).await;
        // The late release must not have deleted the new holder's key.
        let err = locks
            .acquire("order:2", Duration::from_millis(100), DEFAULT_LEASE)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        locks.release(other).await;
    }

    #[tokio::test]
    async fn partial_multi_acquisition_is_rolled_back() {
        let locks = coordinator();
        let blocker = locks
            .acquire("b", DEFAULT_WAIT, DEFAULT_LEASE)
            .await
            .unwrap();

        let err = locks
            .acquire_all(&["a", "b", "c"], Duration::from_millis(150), DEFAULT_LEASE)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));

        // "a" must have been released during rollback.
        let a = locks
            .acquire("a", Duration::from_millis(100), DEFAULT_LEASE)
            .await;
        assert!(a.is_ok());
        locks.release(blocker).await;
    }

    #[tokio::test]
    async fn permuted_key_sets_do_not_deadlock() {
        let locks = Arc::new(coordinator());
        let mut handles = Vec::new();
        for i in 0..16 {
            let locks = Arc::clone(&locks);
            handles.push(tokio::spawn(async move {
                let keys: [&str; 2] = if i % 2 == 0 { ["a", "b"] } else { ["b", "a"] };
                locks
                    .with_locks(&keys, Duration::from_secs(10), DEFAULT_LEASE, || async {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn with_lock_releases_on_error_result() {
        let locks = coordinator();
        let out: Result<Result<(), &str>, LockError> = locks
            .with_lock("order:3", DEFAULT_WAIT, DEFAULT_LEASE, || async {
                Err("boom")
            })
            .await;
        assert_eq!(out.unwrap(), Err("boom"));
        // The failed operation must not leave the key held.
        let again = locks
            .acquire("order:3", Duration::from_millis(100), DEFAULT_LEASE)
            .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn duplicate_keys_collapse_to_one_lock() {
        let locks = coordinator();
        let handle = locks
            .acquire_all(&["x", "x", "x"], DEFAULT_WAIT, DEFAULT_LEASE)
            .await
            .unwrap();
        assert_eq!(handle.keys().len(), 1);
        locks.release(handle).await;
    }
}
