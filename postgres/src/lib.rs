//! PostgreSQL repositories for the flashsale subsystem.
//!
//! Every read-check-mutate (stock decrement, balance deduction, issued
//! quantity bookkeeping, coupon redemption) runs inside a transaction
//! that first takes the row with `SELECT ... FOR UPDATE`, so concurrent
//! processes serialize on the row instead of losing updates. Plain reads
//! and upserts go straight through the pool.
//!
//! Quantities are stored as `BIGINT` and converted back to the domain's
//! `u32` on load; a value outside that range is reported as corrupt
//! storage rather than silently truncated.

mod coupon_event;
mod product;
mod user;
mod user_coupon;

pub use coupon_event::PgCouponEventRepository;
pub use product::PgProductRepository;
pub use user::PgUserRepository;
pub use user_coupon::PgUserCouponRepository;

use flashsale_core::RepoError;
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Connect to PostgreSQL at `database_url`.
///
/// # Errors
///
/// Returns [`RepoError::Storage`] when the connection cannot be
/// established.
pub async fn connect(database_url: &str) -> Result<PgPool, RepoError> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| RepoError::Storage(format!("failed to connect to PostgreSQL: {e}")))
}

/// Run the embedded migrations against `pool`.
///
/// # Errors
///
/// Returns [`RepoError::Storage`] when a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), RepoError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| RepoError::Storage(format!("migration failed: {e}")))?;
    Ok(())
}

/// Convert a stored `BIGINT` quantity back to the domain's `u32`.
pub(crate) fn quantity_from_db(value: i64, column: &str) -> Result<u32, RepoError> {
    u32::try_from(value)
        .map_err(|_| RepoError::Storage(format!("corrupt {column} value {value}")))
}

// Run against a live PostgreSQL (DATABASE_URL must be set):
//   cargo test -p flashsale-postgres -- --ignored
#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use flashsale_core::{
        CouponEvent, CouponEventId, CouponEventRepository, DiscountSpec, NewUserCoupon, Product,
        ProductId, ProductRepository, RepoError, User, UserCouponRepository, UserId,
        UserRepository,
    };
    use std::sync::Arc;

    async fn pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = connect(&url).await.unwrap();
        migrate(&pool).await.unwrap();
        pool
    }

    // Millisecond ids keep repeated runs from colliding.
    fn fresh_id() -> i64 {
        Utc::now().timestamp_micros()
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL instance"]
    async fn product_stock_round_trips_and_rejects_oversell() {
        let repo = PgProductRepository::new(pool().await);
        let id = ProductId::new(fresh_id());
        let product = Product::new(id, "keyboard", 42_000, 3).unwrap();
        repo.save(product).await.unwrap();

        let after = repo.decrease_stock(id, 2).await.unwrap();
        assert_eq!(after.stock, 1);
        let err = repo.decrease_stock(id, 2).await.unwrap_err();
        assert!(matches!(err, RepoError::Domain(_)));
        let stored = repo.find(id).await.unwrap().unwrap();
        assert_eq!(stored.stock, 1);
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL instance"]
    async fn concurrent_decrements_serialize_on_the_row() {
        let repo = Arc::new(PgProductRepository::new(pool().await));
        let id = ProductId::new(fresh_id());
        repo.save(Product::new(id, "keyboard", 42_000, 10).unwrap())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let repo = Arc::clone(&repo);
            handles.push(tokio::spawn(async move {
                repo.decrease_stock(id, 1).await.is_ok()
            }));
        }
        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 10);
        assert_eq!(repo.find(id).await.unwrap().unwrap().stock, 0);
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL instance"]
    async fn user_balance_cannot_be_overdrawn() {
        let repo = PgUserRepository::new(pool().await);
        let id = UserId::new(fresh_id());
        repo.save(User::new(id, "alice", 500).unwrap()).await.unwrap();

        repo.use_points(id, 300).await.unwrap();
        let err = repo.use_points(id, 300).await.unwrap_err();
        assert!(matches!(err, RepoError::Domain(_)));
        repo.charge_points(id, 100).await.unwrap();
        assert_eq!(repo.find(id).await.unwrap().unwrap().balance, 300);
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL instance"]
    async fn coupon_batch_insert_is_idempotent() {
        let p = pool().await;
        let events = PgCouponEventRepository::new(p.clone());
        let coupons = PgUserCouponRepository::new(p);

        let now = Utc::now();
        let event = CouponEvent::new(
            CouponEventId::new(fresh_id()),
            "launch",
            DiscountSpec::Amount { amount: 1_000 },
            10,
            now - Duration::hours(1),
            now + Duration::hours(1),
        );
        events.save(event.clone()).await.unwrap();

        let user_a = UserId::new(fresh_id());
        let user_b = UserId::new(fresh_id());
        let batch = vec![
            NewUserCoupon::from_event(user_a, &event, now),
            NewUserCoupon::from_event(user_b, &event, now),
        ];
        assert_eq!(coupons.insert_batch(batch.clone()).await.unwrap(), 2);
        // Redelivery of the same batch inserts nothing.
        assert_eq!(coupons.insert_batch(batch).await.unwrap(), 0);
        assert!(coupons.exists(user_a, event.id).await.unwrap());

        events.record_issued(event.id, 2).await.unwrap();
        let stored = events.find(event.id).await.unwrap().unwrap();
        assert_eq!(stored.issued_quantity, 2);
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL instance"]
    async fn mark_used_is_single_shot() {
        let p = pool().await;
        let events = PgCouponEventRepository::new(p.clone());
        let coupons = PgUserCouponRepository::new(p);

        let now = Utc::now();
        let event = CouponEvent::new(
            CouponEventId::new(fresh_id()),
            "launch",
            DiscountSpec::Rate {
                percent: 10,
                max_amount: 500,
            },
            10,
            now - Duration::hours(1),
            now + Duration::hours(1),
        );
        events.save(event.clone()).await.unwrap();

        let user = UserId::new(fresh_id());
        coupons
            .insert_batch(vec![NewUserCoupon::from_event(user, &event, now)])
            .await
            .unwrap();
        let coupon = coupons.find_by_user(user).await.unwrap().remove(0);

        let used = coupons.mark_used(coupon.id, now).await.unwrap();
        assert!(used.used);
        let err = coupons.mark_used(coupon.id, now).await.unwrap_err();
        assert!(matches!(err, RepoError::Domain(_)));
    }
}
