//! Durable repository traits.
//!
//! The durable store is the relational backend holding long-term records:
//! coupon events, user coupons, products, user balances. These traits are
//! the seams between the allocation subsystem and that store.
//!
//! # Implementations
//!
//! - `flashsale-postgres`: production sqlx implementations; stock and
//!   balance mutations take a row-level exclusive read
//!   (`SELECT ... FOR UPDATE`) inside a transaction.
//! - `flashsale-memory`: in-process implementations guarded by
//!   [`crate::KeyedMutex`], used by tests and local development.
//!
//! Methods return `Pin<Box<dyn Future>>` for the same dyn-compatibility
//! reason as [`crate::CoordinationStore`].

use crate::coupon::{CouponEvent, NewUserCoupon, UserCoupon};
use crate::error::DomainError;
use crate::ids::{CouponEventId, ProductId, UserCouponId, UserId};
use crate::product::Product;
use crate::user::User;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by repository methods.
pub type RepoFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RepoError>> + Send + 'a>>;

/// Failures from the durable store.
#[derive(Error, Debug)]
pub enum RepoError {
    /// The addressed record does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind, for the message.
        entity: &'static str,
        /// Raw id value.
        id: i64,
    },

    /// A domain invariant rejected the mutation (terminal, not retryable).
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The storage backend failed (transient, possibly retryable).
    #[error("storage error: {0}")]
    Storage(String),
}

/// Coupon event records.
pub trait CouponEventRepository: Send + Sync {
    /// Fetch one event by id.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Storage`] on backend failure.
    fn find(&self, id: CouponEventId) -> RepoFuture<'_, Option<CouponEvent>>;

    /// Events whose validity window contains `now`.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Storage`] on backend failure.
    fn find_active(&self, now: DateTime<Utc>) -> RepoFuture<'_, Vec<CouponEvent>>;

    /// Insert or update an event.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Storage`] on backend failure.
    fn save(&self, event: CouponEvent) -> RepoFuture<'_, CouponEvent>;

    /// Add `count` to the event's issued quantity (drain bookkeeping),
    /// holding the row exclusively for the read-check-mutate.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::NotFound`] for an unknown event and
    /// [`RepoError::Domain`] ([`DomainError::SoldOut`]) when the count
    /// would exceed the total quantity.
    fn record_issued(&self, id: CouponEventId, count: u32) -> RepoFuture<'_, ()>;
}

/// User coupon records. Unique per `(user_id, coupon_event_id)`.
pub trait UserCouponRepository: Send + Sync {
    /// Bulk-insert drained allocations, skipping rows that collide with
    /// the uniqueness constraint. Returns the number actually inserted.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Storage`] on backend failure; a duplicate row
    /// is not an error.
    fn insert_batch(&self, coupons: Vec<NewUserCoupon>) -> RepoFuture<'_, u64>;

    /// Whether `user` already holds a coupon from `event`.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Storage`] on backend failure.
    fn exists(&self, user: UserId, event: CouponEventId) -> RepoFuture<'_, bool>;

    /// All coupons held by `user`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Storage`] on backend failure.
    fn find_by_user(&self, user: UserId) -> RepoFuture<'_, Vec<UserCoupon>>;

    /// Fetch one coupon by id.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Storage`] on backend failure.
    fn find(&self, id: UserCouponId) -> RepoFuture<'_, Option<UserCoupon>>;

    /// Redeem a coupon at `now`, applying [`UserCoupon::use_coupon`] under
    /// the store's exclusive row read.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::NotFound`] for an unknown coupon and
    /// [`RepoError::Domain`] when the coupon is spent or expired.
    fn mark_used(&self, id: UserCouponId, now: DateTime<Utc>) -> RepoFuture<'_, UserCoupon>;
}

/// Product records with guarded stock mutation.
pub trait ProductRepository: Send + Sync {
    /// Fetch one product by id.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Storage`] on backend failure.
    fn find(&self, id: ProductId) -> RepoFuture<'_, Option<Product>>;

    /// Insert or update a product.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Storage`] on backend failure.
    fn save(&self, product: Product) -> RepoFuture<'_, Product>;

    /// Decrement stock by `quantity` under the store's mutation guard,
    /// returning the updated product.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::NotFound`] for an unknown product and
    /// [`RepoError::Domain`] ([`DomainError::InsufficientStock`]) when the
    /// stock cannot cover the decrement.
    fn decrease_stock(&self, id: ProductId, quantity: u32) -> RepoFuture<'_, Product>;

    /// Increment stock by `quantity` (cancellation path), returning the
    /// updated product.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::NotFound`] for an unknown product and
    /// [`RepoError::Domain`] for a zero quantity.
    fn increase_stock(&self, id: ProductId, quantity: u32) -> RepoFuture<'_, Product>;
}

/// User records with guarded balance mutation.
pub trait UserRepository: Send + Sync {
    /// Fetch one user by id.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Storage`] on backend failure.
    fn find(&self, id: UserId) -> RepoFuture<'_, Option<User>>;

    /// Insert or update a user.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Storage`] on backend failure.
    fn save(&self, user: User) -> RepoFuture<'_, User>;

    /// Add `amount` to the balance under the store's mutation guard,
    /// returning the updated user.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::NotFound`] for an unknown user and
    /// [`RepoError::Domain`] for a non-positive amount.
    fn charge_points(&self, id: UserId, amount: i64) -> RepoFuture<'_, User>;

    /// Deduct `amount` from the balance under the store's mutation guard,
    /// returning the updated user.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::NotFound`] for an unknown user and
    /// [`RepoError::Domain`] ([`DomainError::InsufficientBalance`] or
    /// [`DomainError::InvalidAmount`]) when the deduction is rejected.
    fn use_points(&self, id: UserId, amount: i64) -> RepoFuture<'_, User>;
}
