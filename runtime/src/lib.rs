//! Runtime components of the flashsale subsystem.
//!
//! This crate composes the abstractions from `flashsale-core` into the
//! pieces that carry contention:
//!
//! - [`LockCoordinator`] — cross-process locks with leases; multi-key
//!   acquisition in canonical order so overlapping key sets cannot
//!   deadlock.
//! - [`CouponAllocator`] — first-come-first-served issuance composed from
//!   the store's atomic primitives with explicit compensation.
//! - [`QueueDrainScheduler`] — periodic, single-flight drain of pending
//!   allocations into the durable store.
//! - [`AnalyticsPublisher`] — fire-and-forget event delivery with retry.
//! - Services — the lock-wrapped use cases (coupons, points, orders).
//!
//! Everything is generic over [`flashsale_core::CoordinationStore`]; the
//! concurrency test suites run against the in-memory store, production
//! wires in the Redis one.

pub mod allocator;
pub mod analytics;
pub mod config;
pub mod lock;
pub mod retry;
pub mod scheduler;
pub mod services;

pub use allocator::{CouponAllocator, IssueOutcome, KEY_TTL};
pub use analytics::{AnalyticsEvent, AnalyticsPublisher, AnalyticsSink, RecordingSink, SinkError};
pub use config::AppConfig;
pub use lock::{DEFAULT_LEASE, DEFAULT_WAIT, LockCoordinator, LockError, LockHandle};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use scheduler::{DrainConfig, DrainReport, QueueDrainScheduler};
pub use services::{
    CouponService, LockTimeouts, OrderLine, OrderReceipt, OrderService, PointService,
    ServiceError,
};
