//! Per-key in-process mutual exclusion.
//!
//! [`KeyedMutex`] hands out one async mutex per key, created lazily on
//! first use, so that read-check-mutate sequences on a single aggregate
//! (stock decrement, balance deduction, quota increment) are serialized
//! within one process. It deliberately protects nothing across processes:
//! when several processes mutate the same durable row, the durable store's
//! own row-level exclusive read must be used instead.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A lazily-populated map of per-key async mutexes.
///
/// Cloning is cheap and all clones share the same lock table.
///
/// # Example
///
/// ```
/// use flashsale_core::KeyedMutex;
///
/// # async fn example() {
/// let guard: KeyedMutex<i64> = KeyedMutex::new();
/// let value = guard.with(7, async { 1 + 1 }).await;
/// assert_eq!(value, 2);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct KeyedMutex<K> {
    locks: Arc<StdMutex<HashMap<K, Arc<Mutex<()>>>>>,
}

// Manual impl: the derive would demand `K: Default`, which key types like
// the id newtypes do not and should not provide.
impl<K> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self {
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }
}

impl<K> KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Acquire the mutex for `key`, creating it on first use.
    ///
    /// The returned guard releases the key when dropped, on every exit path
    /// including panics and cancelled futures.
    pub async fn acquire(&self, key: K) -> OwnedMutexGuard<()> {
        let entry = {
            // Poisoning only matters if a holder panicked while touching the
            // table itself; the table is still structurally valid then.
            let mut table = match self.locks.lock() {
                Ok(table) => table,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(table.entry(key).or_default())
        };
        entry.lock_owned().await
    }

    /// Run `fut` while holding the mutex for `key`.
    ///
    /// The future is only polled once the key is held, and the key is
    /// released unconditionally afterwards.
    pub async fn with<T>(&self, key: K, fut: impl Future<Output = T>) -> T {
        let _guard = self.acquire(key).await;
        fut.await
    }

    /// Number of keys with an allocated mutex (held or not).
    ///
    /// # Panics
    ///
    /// Never panics; a poisoned table is recovered.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        match self.locks.lock() {
            Ok(table) => table.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
