//! In-memory durable repositories.
//!
//! Each repository keeps its rows in a hash map and serializes every
//! read-check-mutate through a [`KeyedMutex`] on the row id, the same
//! discipline the domain entities document. The map mutex itself is only
//! held for synchronous get/insert, never across an await.

use chrono::{DateTime, Utc};
use flashsale_core::{
    CouponEvent, CouponEventId, CouponEventRepository, KeyedMutex, NewUserCoupon, Product,
    ProductId, ProductRepository, RepoError, RepoFuture, User, UserCoupon, UserCouponId,
    UserCouponRepository, UserId, UserRepository,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

fn lock_rows<T>(rows: &Mutex<T>) -> MutexGuard<'_, T> {
    match rows.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Coupon events held in memory.
#[derive(Debug, Default)]
pub struct InMemoryCouponEventRepository {
    rows: Mutex<HashMap<CouponEventId, CouponEvent>>,
    guard: KeyedMutex<CouponEventId>,
}

impl InMemoryCouponEventRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CouponEventRepository for InMemoryCouponEventRepository {
    fn find(&self, id: CouponEventId) -> RepoFuture<'_, Option<CouponEvent>> {
        Box::pin(async move { Ok(lock_rows(&self.rows).get(&id).cloned()) })
    }

    fn find_active(&self, now: DateTime<Utc>) -> RepoFuture<'_, Vec<CouponEvent>> {
        Box::pin(async move {
            let mut active: Vec<CouponEvent> = lock_rows(&self.rows)
                .values()
                .filter(|event| event.is_active(now))
                .cloned()
                .collect();
            active.sort_by_key(|event| event.id.value());
            Ok(active)
        })
    }

    fn save(&self, event: CouponEvent) -> RepoFuture<'_, CouponEvent> {
        Box::pin(async move {
            lock_rows(&self.rows).insert(event.id, event.clone());
            Ok(event)
        })
    }

    fn record_issued(&self, id: CouponEventId, count: u32) -> RepoFuture<'_, ()> {
        Box::pin(async move {
            self.guard
                .with(id, async {
                    let mut event = lock_rows(&self.rows)
                        .get(&id)
                        .cloned()
                        .ok_or(RepoError::NotFound {
                            entity: "coupon event",
                            id: id.value(),
                        })?;
                    event.record_issued(count)?;
                    lock_rows(&self.rows).insert(id, event);
                    Ok(())
                })
                .await
        })
    }
}

/// User coupons held in memory, unique per `(user_id, coupon_event_id)`.
#[derive(Debug, Default)]
pub struct InMemoryUserCouponRepository {
    rows: Mutex<HashMap<UserCouponId, UserCoupon>>,
    guard: KeyedMutex<UserCouponId>,
    next_id: AtomicI64,
}

impl InMemoryUserCouponRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            guard: KeyedMutex::new(),
            next_id: AtomicI64::new(1),
        }
    }
}

impl UserCouponRepository for InMemoryUserCouponRepository {
    fn insert_batch(&self, coupons: Vec<NewUserCoupon>) -> RepoFuture<'_, u64> {
        Box::pin(async move {
            // Check-and-insert happens under one synchronous map lock, so
            // the uniqueness constraint cannot be raced from this process.
            let mut rows = lock_rows(&self.rows);
            let mut inserted = 0u64;
            for coupon in coupons {
                let duplicate = rows.values().any(|existing| {
                    existing.user_id == coupon.user_id
                        && existing.coupon_event_id == coupon.coupon_event_id
                });
                if duplicate {
                    continue;
                }
                let id = UserCouponId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
                rows.insert(
                    id,
                    UserCoupon {
                        id,
                        user_id: coupon.user_id,
                        coupon_event_id: coupon.coupon_event_id,
                        used: false,
                        starts_at: coupon.starts_at,
                        ends_at: coupon.ends_at,
                        issued_at: coupon.issued_at,
                        used_at: None,
                    },
                );
                inserted += 1;
            }
            Ok(inserted)
        })
    }

    fn exists(&self, user: UserId, event: CouponEventId) -> RepoFuture<'_, bool> {
        Box::pin(async move {
            Ok(lock_rows(&self.rows)
                .values()
                .any(|c| c.user_id == user && c.coupon_event_id == event))
        })
    }

    fn find_by_user(&self, user: UserId) -> RepoFuture<'_, Vec<UserCoupon>> {
        Box::pin(async move {
            let mut coupons: Vec<UserCoupon> = lock_rows(&self.rows)
                .values()
                .filter(|c| c.user_id == user)
                .cloned()
                .collect();
            coupons.sort_by(|a, b| {
                b.issued_at
                    .cmp(&a.issued_at)
                    .then(b.id.value().cmp(&a.id.value()))
            });
            Ok(coupons)
        })
    }

    fn find(&self, id: UserCouponId) -> RepoFuture<'_, Option<UserCoupon>> {
        Box::pin(async move { Ok(lock_rows(&self.rows).get(&id).cloned()) })
    }

    fn mark_used(&self, id: UserCouponId, now: DateTime<Utc>) -> RepoFuture<'_, UserCoupon> {
        Box::pin(async move {
            self.guard
                .with(id, async {
                    let mut coupon = lock_rows(&self.rows)
                        .get(&id)
                        .cloned()
                        .ok_or(RepoError::NotFound {
                            entity: "user coupon",
                            id: id.value(),
                        })?;
                    coupon.use_coupon(now)?;
                    lock_rows(&self.rows).insert(id, coupon.clone());
                    Ok(coupon)
                })
                .await
        })
    }
}

/// Products held in memory.
#[derive(Debug, Default)]
pub struct InMemoryProductRepository {
    rows: Mutex<HashMap<ProductId, Product>>,
    guard: KeyedMutex<ProductId>,
}

impl InMemoryProductRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn mutate(
        &self,
        id: ProductId,
        apply: impl FnOnce(&mut Product) -> Result<(), flashsale_core::DomainError>,
    ) -> Result<Product, RepoError> {
        self.guard
            .with(id, async {
                let mut product = lock_rows(&self.rows)
                    .get(&id)
                    .cloned()
                    .ok_or(RepoError::NotFound {
                        entity: "product",
                        id: id.value(),
                    })?;
                apply(&mut product)?;
                lock_rows(&self.rows).insert(id, product.clone());
                Ok(product)
            })
            .await
    }
}

impl ProductRepository for InMemoryProductRepository {
    fn find(&self, id: ProductId) -> RepoFuture<'_, Option<Product>> {
        Box::pin(async move { Ok(lock_rows(&self.rows).get(&id).cloned()) })
    }

    fn save(&self, product: Product) -> RepoFuture<'_, Product> {
        Box::pin(async move {
            lock_rows(&self.rows).insert(product.id, product.clone());
            Ok(product)
        })
    }

    fn decrease_stock(&self, id: ProductId, quantity: u32) -> RepoFuture<'_, Product> {
        Box::pin(async move { self.mutate(id, |p| p.decrease_stock(quantity)).await })
    }

    fn increase_stock(&self, id: ProductId, quantity: u32) -> RepoFuture<'_, Product> {
        Box::pin(async move { self.mutate(id, |p| p.increase_stock(quantity)).await })
    }
}

/// Users held in memory.
#[derive(Debug, Default)]
pub struct InMemoryUserRepository {
    rows: Mutex<HashMap<UserId, User>>,
    guard: KeyedMutex<UserId>,
}

impl InMemoryUserRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn mutate(
        &self,
        id: UserId,
        apply: impl FnOnce(&mut User) -> Result<(), flashsale_core::DomainError>,
    ) -> Result<User, RepoError> {
        self.guard
            .with(id, async {
                let mut user = lock_rows(&self.rows)
                    .get(&id)
                    .cloned()
                    .ok_or(RepoError::NotFound {
                        entity: "user",
                        id: id.value(),
                    })?;
                apply(&mut user)?;
                lock_rows(&self.rows).insert(id, user.clone());
                Ok(user)
            })
            .await
    }
}

impl UserRepository for InMemoryUserRepository {
    fn find(&self, id: UserId) -> RepoFuture<'_, Option<User>> {
        Box::pin(async move { Ok(lock_rows(&self.rows).get(&id).cloned()) })
    }

    fn save(&self, user: User) -> RepoFuture<'_, User> {
        Box::pin(async move {
            lock_rows(&self.rows).insert(user.id, user.clone());
            Ok(user)
        })
    }

    fn charge_points(&self, id: UserId, amount: i64) -> RepoFuture<'_, User> {
        Box::pin(async move { self.mutate(id, |u| u.charge_points(amount)).await })
    }

    fn use_points(&self, id: UserId, amount: i64) -> RepoFuture<'_, User> {
        Box::pin(async move { self.mutate(id, |u| u.use_points(amount)).await })
    }
}
