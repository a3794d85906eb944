//! Application services: the lock-wrapped use cases over the core
//! components.
//!
//! Business failures keep their identity across the service boundary;
//! lock and store failures collapse into [`ServiceError::Unavailable`],
//! the one variant a caller may retry.

use crate::allocator::{CouponAllocator, IssueOutcome};
use crate::analytics::{AnalyticsEvent, AnalyticsPublisher};
use crate::lock::{LockCoordinator, LockError};
use chrono::Utc;
use flashsale_core::{
    CoordinationStore, CouponEventId, CouponEventRepository, DomainError, ProductId,
    ProductRepository, RepoError, StoreError, UserCouponId, UserCouponRepository, UserId,
    UserRepository,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by the services.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// A business invariant rejected the request; retrying cannot help.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The addressed record does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Raw id value.
        id: i64,
    },

    /// Infrastructure trouble (lock contention, store failure); the caller
    /// may retry later.
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),
}

impl From<RepoError> for ServiceError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound { entity, id } => Self::NotFound { entity, id },
            RepoError::Domain(domain) => Self::Domain(domain),
            RepoError::Storage(msg) => Self::Unavailable(msg),
        }
    }
}

impl From<LockError> for ServiceError {
    fn from(err: LockError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Lock wait/lease timeouts shared by the services.
#[derive(Debug, Clone, Copy)]
pub struct LockTimeouts {
    /// How long a caller waits for a contended lock.
    pub wait: Duration,
    /// Lease after which an unreleased lock expires.
    pub lease: Duration,
}

impl Default for LockTimeouts {
    fn default() -> Self {
        Self {
            wait: crate::lock::DEFAULT_WAIT,
            lease: crate::lock::DEFAULT_LEASE,
        }
    }
}

/// High-throughput coupon issuance.
///
/// Deliberately lock-free: the allocator's store-side atomicity carries
/// the contention, so a hot event never serializes requests.
pub struct CouponService<S> {
    allocator: CouponAllocator<S>,
    events: Arc<dyn CouponEventRepository>,
}

impl<S: CoordinationStore> CouponService<S> {
    /// Create the service.
    pub fn new(allocator: CouponAllocator<S>, events: Arc<dyn CouponEventRepository>) -> Self {
        Self { allocator, events }
    }

    /// Request a coupon from `event` for `user`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] for an unknown event,
    /// [`DomainError::CouponExpired`] outside the validity window, and
    /// [`ServiceError::Unavailable`] on store failure. `SoldOut` and
    /// `AlreadyIssued` are outcomes, not errors.
    pub async fn issue(
        &self,
        event_id: CouponEventId,
        user: UserId,
    ) -> Result<IssueOutcome, ServiceError> {
        let event = self
            .events
            .find(event_id)
            .await?
            .ok_or(ServiceError::NotFound {
                entity: "coupon event",
                id: event_id.value(),
            })?;
        if !event.is_active(Utc::now()) {
            return Err(DomainError::CouponExpired { event: event_id }.into());
        }
        Ok(self.allocator.try_issue(event_id, user).await?)
    }
}

/// Point balance mutations behind a per-user distributed lock.
pub struct PointService<S> {
    locks: LockCoordinator<S>,
    users: Arc<dyn UserRepository>,
    timeouts: LockTimeouts,
}

fn point_key(user: UserId) -> String {
    format!("user:point:{user}")
}

impl<S: CoordinationStore> PointService<S> {
    /// Create the service.
    pub fn new(
        locks: LockCoordinator<S>,
        users: Arc<dyn UserRepository>,
        timeouts: LockTimeouts,
    ) -> Self {
        Self {
            locks,
            users,
            timeouts,
        }
    }

    /// Add `amount` points to `user`'s balance. Returns the new balance.
    ///
    /// # Errors
    ///
    /// Returns the domain rejection for a non-positive amount, or
    /// [`ServiceError::Unavailable`] on lock/store trouble.
    pub async fn charge(&self, user: UserId, amount: i64) -> Result<i64, ServiceError> {
        let updated = self
            .locks
            .with_lock(&point_key(user), self.timeouts.wait, self.timeouts.lease, || {
                self.users.charge_points(user, amount)
            })
            .await??;
        Ok(updated.balance)
    }

    /// Deduct `amount` points from `user`'s balance. Returns the new
    /// balance.
    ///
    /// # Errors
    ///
    /// Returns the domain rejection (insufficient balance, bad amount) or
    /// [`ServiceError::Unavailable`] on lock/store trouble.
    pub async fn spend(&self, user: UserId, amount: i64) -> Result<i64, ServiceError> {
        let updated = self
            .locks
            .with_lock(&point_key(user), self.timeouts.wait, self.timeouts.lease, || {
                self.users.use_points(user, amount)
            })
            .await??;
        Ok(updated.balance)
    }
}

/// One line of an order.
#[derive(Debug, Clone, Copy)]
pub struct OrderLine {
    /// Ordered product.
    pub product_id: ProductId,
    /// Units ordered. Must be positive.
    pub quantity: u32,
}

/// What an accepted order settled to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderReceipt {
    /// Paying user.
    pub user_id: UserId,
    /// Sum of line prices before discount.
    pub total: i64,
    /// Discount applied from the redeemed coupon, if any.
    pub discount: i64,
    /// Points actually deducted.
    pub charged: i64,
}

/// Order placement across products, balance, and optional coupon
/// redemption, under one sorted multi-key lock.
pub struct OrderService<S> {
    locks: LockCoordinator<S>,
    products: Arc<dyn ProductRepository>,
    users: Arc<dyn UserRepository>,
    coupons: Arc<dyn UserCouponRepository>,
    events: Arc<dyn CouponEventRepository>,
    analytics: AnalyticsPublisher,
    timeouts: LockTimeouts,
}

impl<S: CoordinationStore> OrderService<S> {
    /// Create the service.
    pub fn new(
        locks: LockCoordinator<S>,
        products: Arc<dyn ProductRepository>,
        users: Arc<dyn UserRepository>,
        coupons: Arc<dyn UserCouponRepository>,
        events: Arc<dyn CouponEventRepository>,
        analytics: AnalyticsPublisher,
        timeouts: LockTimeouts,
    ) -> Self {
        Self {
            locks,
            products,
            users,
            coupons,
            events,
            analytics,
            timeouts,
        }
    }

    /// Place an order: decrement stock per line, optionally redeem a
    /// coupon, deduct the balance, then notify analytics.
    ///
    /// The lock set covers every touched product plus the user, sorted by
    /// the coordinator, so two orders over overlapping products cannot
    /// deadlock.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError`] rejections (stock, balance, coupon state),
    /// [`ServiceError::NotFound`] for unknown records, and
    /// [`ServiceError::Unavailable`] on lock/store trouble.
    pub async fn place_order(
        &self,
        user: UserId,
        lines: &[OrderLine],
        coupon: Option<UserCouponId>,
    ) -> Result<OrderReceipt, ServiceError> {
        if lines.is_empty() {
            return Err(DomainError::InvalidAmount { amount: 0 }.into());
        }

        let mut keys: Vec<String> = lines
            .iter()
            .map(|line| format!("product:{}", line.product_id))
            .collect();
        keys.push(format!("user:{user}"));
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();

        let receipt = self
            .locks
            .with_locks(&key_refs, self.timeouts.wait, self.timeouts.lease, || {
                self.settle(user, lines, coupon)
            })
            .await??;

        self.analytics.notify(AnalyticsEvent::new(
            "order.placed",
            json!({
                "user_id": receipt.user_id.value(),
                "total": receipt.total,
                "discount": receipt.discount,
                "charged": receipt.charged,
            }),
        ));
        Ok(receipt)
    }

    /// The critical section: runs with every key held.
    async fn settle(
        &self,
        user: UserId,
        lines: &[OrderLine],
        coupon: Option<UserCouponId>,
    ) -> Result<OrderReceipt, ServiceError> {
        let now = Utc::now();

        // Validate before mutating anything; the held locks keep these
        // reads stable against concurrent orders in this process.
        let mut total: i64 = 0;
        for line in lines {
            let product =
                self.products
                    .find(line.product_id)
                    .await?
                    .ok_or(ServiceError::NotFound {
                        entity: "product",
                        id: line.product_id.value(),
                    })?;
            if !product.has_stock(line.quantity) {
                return Err(DomainError::InsufficientStock {
                    product: product.id,
                    requested: line.quantity,
                    available: product.stock,
                }
                .into());
            }
            total += product.price.saturating_mul(i64::from(line.quantity));
        }

        let discount = match coupon {
            None => 0,
            Some(coupon_id) => {
                let held = self
                    .coupons
                    .find(coupon_id)
                    .await?
                    .filter(|c| c.user_id == user)
                    .ok_or(ServiceError::NotFound {
                        entity: "user coupon",
                        id: coupon_id.value(),
                    })?;
                // Same rejections mark_used would raise, checked here so a
                // doomed order never burns the coupon.
                if held.used {
                    return Err(DomainError::CouponAlreadyUsed { coupon: held.id }.into());
                }
                if !held.can_use(now) {
                    return Err(DomainError::CouponExpired {
                        event: held.coupon_event_id,
                    }
                    .into());
                }
                let event = self.events.find(held.coupon_event_id).await?.ok_or(
                    ServiceError::NotFound {
                        entity: "coupon event",
                        id: held.coupon_event_id.value(),
                    },
                )?;
                event.discount.discount_for(total)
            }
        };

        let charged = total - discount;
        if charged > 0 {
            let account = self
                .users
                .find(user)
                .await?
                .ok_or(ServiceError::NotFound {
                    entity: "user",
                    id: user.value(),
                })?;
            if !account.has_balance(charged) {
                return Err(DomainError::InsufficientBalance {
                    user,
                    requested: charged,
                    available: account.balance,
                }
                .into());
            }
        }

        // Every check passed; mutations start here. Redemption stays
        // single-shot at the repository level, so a concurrent order with
        // the same coupon still loses there.
        if let Some(coupon_id) = coupon {
            self.coupons.mark_used(coupon_id, now).await?;
        }
        if charged > 0 {
            self.users.use_points(user, charged).await?;
        }
        for line in lines {
            self.products
                .decrease_stock(line.product_id, line.quantity)
                .await?;
        }

        tracing::info!(
            user_id = user.value(),
            total,
            discount,
            charged,
            lines = lines.len(),
            "order placed"
        );
        Ok(OrderReceipt {
            user_id: user,
            total,
            discount,
            charged,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::analytics::RecordingSink;
    use chrono::Duration as ChronoDuration;
    use flashsale_core::{CouponEvent, DiscountSpec, NewUserCoupon, Product, User};
    use flashsale_memory::{
        InMemoryCoordinationStore, InMemoryCouponEventRepository, InMemoryProductRepository,
        InMemoryUserCouponRepository, InMemoryUserRepository,
    };

    struct World {
        products: Arc<InMemoryProductRepository>,
        users: Arc<InMemoryUserRepository>,
        coupons: Arc<InMemoryUserCouponRepository>,
        events: Arc<InMemoryCouponEventRepository>,
        sink: Arc<RecordingSink>,
        orders: OrderService<InMemoryCoordinationStore>,
        points: PointService<InMemoryCoordinationStore>,
    }

    fn world() -> World {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let locks = LockCoordinator::new(store);
        let products = Arc::new(InMemoryProductRepository::new());
        let users = Arc::new(InMemoryUserRepository::new());
        let coupons = Arc::new(InMemoryUserCouponRepository::new());
        let events = Arc::new(InMemoryCouponEventRepository::new());
        let sink = Arc::new(RecordingSink::new());
        let orders = OrderService::new(
            locks.clone(),
            Arc::clone(&products) as Arc<dyn ProductRepository>,
            Arc::clone(&users) as Arc<dyn UserRepository>,
            Arc::clone(&coupons) as Arc<dyn UserCouponRepository>,
            Arc::clone(&events) as Arc<dyn CouponEventRepository>,
            AnalyticsPublisher::new(Arc::clone(&sink) as Arc<dyn crate::analytics::AnalyticsSink>),
            LockTimeouts::default(),
        );
        let points = PointService::new(
            locks,
            Arc::clone(&users) as Arc<dyn UserRepository>,
            LockTimeouts::default(),
        );
        World {
            products,
            users,
            coupons,
            events,
            sink,
            orders,
            points,
        }
    }

    async fn seed_coupon(w: &World, user: UserId, percent: u8, max_amount: i64) -> UserCouponId {
        let now = Utc::now();
        let event = CouponEvent::new(
            CouponEventId::new(900),
            "launch",
            DiscountSpec::Rate {
                percent,
                max_amount,
            },
            10,
            now - ChronoDuration::hours(1),
            now + ChronoDuration::hours(1),
        );
        w.events.save(event.clone()).await.unwrap();
        w.coupons
            .insert_batch(vec![NewUserCoupon::from_event(user, &event, now)])
            .await
            .unwrap();
        w.coupons.find_by_user(user).await.unwrap().remove(0).id
    }

    #[tokio::test]
    async fn order_settles_stock_balance_and_analytics() {
        let w = world();
        let user = UserId::new(1);
        let product = ProductId::new(10);
        w.products
            .save(Product::new(product, "keyboard", 2_000, 5).unwrap())
            .await
            .unwrap();
        w.users
            .save(User::new(user, "alice", 10_000).unwrap())
            .await
            .unwrap();

        let receipt = w
            .orders
            .place_order(
                user,
                &[OrderLine {
                    product_id: product,
                    quantity: 2,
                }],
                None,
            )
            .await
            .unwrap();

        assert_eq!(receipt.total, 4_000);
        assert_eq!(receipt.charged, 4_000);
        assert_eq!(w.products.find(product).await.unwrap().unwrap().stock, 3);
        assert_eq!(w.users.find(user).await.unwrap().unwrap().balance, 6_000);

        // Analytics delivery is async; give the spawned task a beat.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(w.sink.events().len(), 1);
        assert_eq!(w.sink.events()[0].kind, "order.placed");
    }

    #[tokio::test]
    async fn coupon_discount_is_applied_and_single_shot() {
        let w = world();
        let user = UserId::new(2);
        let product = ProductId::new(11);
        w.products
            .save(Product::new(product, "monitor", 10_000, 5).unwrap())
            .await
            .unwrap();
        w.users
            .save(User::new(user, "bob", 50_000).unwrap())
            .await
            .unwrap();
        let coupon = seed_coupon(&w, user, 10, 5_000).await;

        let receipt = w
            .orders
            .place_order(
                user,
                &[OrderLine {
                    product_id: product,
                    quantity: 1,
                }],
                Some(coupon),
            )
            .await
            .unwrap();
        assert_eq!(receipt.discount, 1_000);
        assert_eq!(receipt.charged, 9_000);

        // A second redemption of the same coupon is rejected before any
        // stock or balance mutation.
        let err = w
            .orders
            .place_order(
                user,
                &[OrderLine {
                    product_id: product,
                    quantity: 1,
                }],
                Some(coupon),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Domain(DomainError::CouponAlreadyUsed { .. })
        ));
        assert_eq!(w.products.find(product).await.unwrap().unwrap().stock, 4);
    }

    #[tokio::test]
    async fn rejected_order_leaves_the_coupon_redeemable() {
        let w = world();
        let user = UserId::new(5);
        let product = ProductId::new(30);
        w.products
            .save(Product::new(product, "headset", 3_000, 2).unwrap())
            .await
            .unwrap();
        w.users
            .save(User::new(user, "erin", 1_000).unwrap())
            .await
            .unwrap();
        let coupon = seed_coupon(&w, user, 10, 5_000).await;

        // 3_000 minus the 300 discount still exceeds the 1_000 balance.
        let err = w
            .orders
            .place_order(
                user,
                &[OrderLine {
                    product_id: product,
                    quantity: 1,
                }],
                Some(coupon),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Domain(DomainError::InsufficientBalance { .. })
        ));

        // The rejection touched nothing: coupon unspent, balance and
        // stock intact.
        assert!(!w.coupons.find(coupon).await.unwrap().unwrap().used);
        assert_eq!(w.users.find(user).await.unwrap().unwrap().balance, 1_000);
        assert_eq!(w.products.find(product).await.unwrap().unwrap().stock, 2);

        // After topping up, the same coupon settles the order.
        w.points.charge(user, 5_000).await.unwrap();
        let receipt = w
            .orders
            .place_order(
                user,
                &[OrderLine {
                    product_id: product,
                    quantity: 1,
                }],
                Some(coupon),
            )
            .await
            .unwrap();
        assert_eq!(receipt.discount, 300);
        assert_eq!(receipt.charged, 2_700);
        assert!(w.coupons.find(coupon).await.unwrap().unwrap().used);
    }

    #[tokio::test]
    async fn insufficient_stock_rejects_before_any_mutation() {
        let w = world();
        let user = UserId::new(3);
        let cheap = ProductId::new(20);
        let scarce = ProductId::new(21);
        w.products
            .save(Product::new(cheap, "cable", 500, 10).unwrap())
            .await
            .unwrap();
        w.products
            .save(Product::new(scarce, "gpu", 900_000, 1).unwrap())
            .await
            .unwrap();
        w.users
            .save(User::new(user, "carol", 1_000_000).unwrap())
            .await
            .unwrap();

        let err = w
            .orders
            .place_order(
                user,
                &[
                    OrderLine {
                        product_id: cheap,
                        quantity: 2,
                    },
                    OrderLine {
                        product_id: scarce,
                        quantity: 2,
                    },
                ],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Domain(DomainError::InsufficientStock { .. })
        ));
        // Neither line was applied.
        assert_eq!(w.products.find(cheap).await.unwrap().unwrap().stock, 10);
        assert_eq!(w.users.find(user).await.unwrap().unwrap().balance, 1_000_000);
    }

    #[tokio::test]
    async fn point_service_serializes_balance_mutations() {
        let w = world();
        let user = UserId::new(4);
        w.users
            .save(User::new(user, "dave", 0).unwrap())
            .await
            .unwrap();

        assert_eq!(w.points.charge(user, 1_000).await.unwrap(), 1_000);
        assert_eq!(w.points.spend(user, 400).await.unwrap(), 600);
        let err = w.points.spend(user, 700).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Domain(DomainError::InsufficientBalance { .. })
        ));
    }
}
