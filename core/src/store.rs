//! Shared coordination store abstraction.
//!
//! The coordination store is the external key-value service every process
//! of the backend can reach. It offers the small set of *individually
//! atomic* primitives that the lock coordinator and the coupon allocator
//! compose: set-with-expiry, compare-and-delete, counters, a scored
//! add-if-absent set, and a list used as a queue. Per-key expiry bounds
//! leaked state when a process dies mid-sequence.
//!
//! # Implementations
//!
//! - `RedisCoordinationStore` (in `flashsale-redis`): production
//!   implementation over a shared Redis.
//! - `InMemoryCoordinationStore` (in `flashsale-memory`): deterministic
//!   single-process implementation for tests and local development.
//!
//! # Dyn compatibility
//!
//! Methods return explicit `Pin<Box<dyn Future>>` instead of `async fn` so
//! the trait can be used as `Arc<dyn CoordinationStore>` and generically at
//! the same time.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Boxed future returned by [`CoordinationStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Failures talking to the coordination store.
///
/// These are infrastructure errors: transient, possibly retryable, and
/// never a business outcome.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("coordination store error: {0}")]
    Backend(String),

    /// A stored value could not be interpreted (for example a counter key
    /// holding a non-numeric string).
    #[error("corrupt value at {key}: {value}")]
    InvalidValue {
        /// Key holding the corrupt value.
        key: String,
        /// The value as found.
        value: String,
    },
}

/// Atomic primitives offered by the shared coordination store.
///
/// Every method is an independent atomic step; the store offers no
/// cross-key transactions. Composite sequences (the allocator's
/// dedup/decrement/enqueue pipeline) are built from these steps with
/// explicit compensation.
pub trait CoordinationStore: Send + Sync {
    /// Set `key` to `value` with a time-to-live, only if `key` is absent.
    ///
    /// Returns `true` when the value was set (the caller now "owns" the
    /// key until the TTL elapses or it is deleted).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> StoreFuture<'a, bool>;

    /// Delete `key` only if it currently holds exactly `value`.
    ///
    /// Returns `true` when the key was deleted, `false` when it was absent
    /// or held a different value (an expired lease taken over by another
    /// holder, for instance).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn delete_if_equals<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, bool>;

    /// Unconditionally set `key` to `value` with a time-to-live.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn put<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> StoreFuture<'a, ()>;

    /// Read `key`, or `None` when absent or expired.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Atomically add 1 to the counter at `key` and return the new value.
    /// A missing key counts as 0.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidValue`] when the key holds a
    /// non-numeric value.
    fn increment<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64>;

    /// Atomically subtract 1 from the counter at `key` and return the new
    /// value. A missing key counts as 0, so the first decrement yields -1.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidValue`] when the key holds a
    /// non-numeric value.
    fn decrement<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64>;

    /// Add `member` with `score` to the scored set at `key`, only if the
    /// member is absent. Returns `true` when the member was added.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn add_if_absent<'a>(
        &'a self,
        key: &'a str,
        member: &'a str,
        score: f64,
    ) -> StoreFuture<'a, bool>;

    /// Remove `member` from the scored set at `key`. Returns `true` when
    /// the member was present.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn remove_member<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, bool>;

    /// Score of `member` in the scored set at `key`, or `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn member_score<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, Option<f64>>;

    /// Append `value` to the tail of the list at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn push_back<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, ()>;

    /// Prepend `value` to the head of the list at `key` (used to return
    /// work to the queue after a failed drain batch).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn push_front<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, ()>;

    /// Pop the head of the list at `key`, or `None` when empty.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn pop_front<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Length of the list at `key`; a missing key is an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn list_len<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64>;

    /// Refresh the time-to-live of `key`. A no-op for missing keys.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, ()>;
}
