//! In-memory backends for the flashsale subsystem.
//!
//! This crate mirrors the production backends with deterministic
//! single-process implementations:
//!
//! - [`InMemoryCoordinationStore`] implements
//!   [`flashsale_core::CoordinationStore`] with the same per-operation
//!   atomicity and TTL semantics as the Redis store.
//! - The `InMemory*Repository` types implement the durable repository
//!   traits over hash maps, guarding every read-check-mutate with
//!   [`flashsale_core::KeyedMutex`] exactly as the production service
//!   guards its in-memory profile.
//!
//! Concurrency tests for the allocator, lock coordinator, and scheduler
//! run against these backends; nothing here touches the network.

pub mod repos;
pub mod store;

pub use repos::{
    InMemoryCouponEventRepository, InMemoryProductRepository, InMemoryUserCouponRepository,
    InMemoryUserRepository,
};
pub use store::InMemoryCoordinationStore;
