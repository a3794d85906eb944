//! Core domain model and coordination traits for the flashsale subsystem.
//!
//! This crate holds everything that is pure or abstract in the allocation
//! subsystem of the commerce backend:
//!
//! - **Entities and invariants**: [`CouponEvent`], [`UserCoupon`],
//!   [`Product`], [`User`] enforce their own rules (`stock >= 0`,
//!   `0 <= issued <= total`, `balance >= 0`) and report violations as typed
//!   [`DomainError`] values rather than panics or ad-hoc strings.
//! - **Coordination store abstraction**: [`CoordinationStore`] exposes the
//!   atomic primitives (set-with-expiry, counters, scored dedup set, list
//!   queue) that the lock coordinator and coupon allocator in
//!   `flashsale-runtime` compose. Production uses the Redis implementation
//!   in `flashsale-redis`; tests use the deterministic one in
//!   `flashsale-memory`.
//! - **Durable repository traits**: typed seams over the relational store
//!   (`flashsale-postgres` in production, `flashsale-memory` for tests).
//! - **In-process guard**: [`KeyedMutex`] serializes read-check-mutate
//!   sequences on a single aggregate within one process.
//!
//! No I/O happens in this crate; every implementation lives behind the
//! traits defined here.

pub mod coupon;
pub mod error;
pub mod guard;
pub mod ids;
pub mod product;
pub mod repository;
pub mod store;
pub mod user;

pub use coupon::{CouponEvent, CouponStatus, DiscountSpec, NewUserCoupon, PendingAllocation, UserCoupon};
pub use error::DomainError;
pub use guard::KeyedMutex;
pub use ids::{CouponEventId, ProductId, UserCouponId, UserId};
pub use product::Product;
pub use repository::{
    CouponEventRepository, ProductRepository, RepoError, RepoFuture, UserCouponRepository,
    UserRepository,
};
pub use store::{CoordinationStore, StoreError, StoreFuture};
pub use user::User;
