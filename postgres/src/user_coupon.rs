//! User coupon rows, unique per `(user_id, coupon_event_id)`.

use chrono::{DateTime, Utc};
use flashsale_core::{
    CouponEventId, NewUserCoupon, RepoError, RepoFuture, UserCoupon, UserCouponId,
    UserCouponRepository, UserId,
};
use sqlx::PgPool;

type CouponRow = (
    i64,
    i64,
    i64,
    bool,
    DateTime<Utc>,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

const SELECT_COLUMNS: &str =
    "id, user_id, coupon_event_id, used, starts_at, ends_at, issued_at, used_at";

fn coupon_from_row(row: CouponRow) -> UserCoupon {
    let (id, user_id, coupon_event_id, used, starts_at, ends_at, issued_at, used_at) = row;
    UserCoupon {
        id: UserCouponId::new(id),
        user_id: UserId::new(user_id),
        coupon_event_id: CouponEventId::new(coupon_event_id),
        used,
        starts_at,
        ends_at,
        issued_at,
        used_at,
    }
}

/// [`UserCouponRepository`] over PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgUserCouponRepository {
    pool: PgPool,
}

impl PgUserCouponRepository {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl UserCouponRepository for PgUserCouponRepository {
    fn insert_batch(&self, coupons: Vec<NewUserCoupon>) -> RepoFuture<'_, u64> {
        Box::pin(async move {
            if coupons.is_empty() {
                return Ok(0);
            }
            let mut user_ids = Vec::with_capacity(coupons.len());
            let mut event_ids = Vec::with_capacity(coupons.len());
            let mut starts = Vec::with_capacity(coupons.len());
            let mut ends = Vec::with_capacity(coupons.len());
            let mut issued = Vec::with_capacity(coupons.len());
            for coupon in &coupons {
                user_ids.push(coupon.user_id.value());
                event_ids.push(coupon.coupon_event_id.value());
                starts.push(coupon.starts_at);
                ends.push(coupon.ends_at);
                issued.push(coupon.issued_at);
            }

            // One statement for the whole batch; the unique constraint
            // absorbs redelivered rows, making drain retries idempotent.
            let result = sqlx::query(
                "INSERT INTO user_coupons
                     (user_id, coupon_event_id, starts_at, ends_at, issued_at)
                 SELECT * FROM UNNEST
                     ($1::bigint[], $2::bigint[], $3::timestamptz[],
                      $4::timestamptz[], $5::timestamptz[])
                 ON CONFLICT (user_id, coupon_event_id) DO NOTHING",
            )
            .bind(&user_ids)
            .bind(&event_ids)
            .bind(&starts)
            .bind(&ends)
            .bind(&issued)
            .execute(&self.pool)
            .await
            .map_err(|e| RepoError::Storage(format!("failed to insert coupon batch: {e}")))?;

            let inserted = result.rows_affected();
            if inserted < coupons.len() as u64 {
                tracing::debug!(
                    batch = coupons.len(),
                    inserted,
                    "skipped duplicate user coupons in batch"
                );
            }
            Ok(inserted)
        })
    }

    fn exists(&self, user: UserId, event: CouponEventId) -> RepoFuture<'_, bool> {
        Box::pin(async move {
            let (exists,): (bool,) = sqlx::query_as(
                "SELECT EXISTS (
                     SELECT 1 FROM user_coupons
                     WHERE user_id = $1 AND coupon_event_id = $2
                 )",
            )
            .bind(user.value())
            .bind(event.value())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RepoError::Storage(format!("failed to check coupon existence: {e}")))?;
            Ok(exists)
        })
    }

    fn find_by_user(&self, user: UserId) -> RepoFuture<'_, Vec<UserCoupon>> {
        Box::pin(async move {
            let rows: Vec<CouponRow> = sqlx::query_as(&format!(
                "SELECT {SELECT_COLUMNS} FROM user_coupons
                 WHERE user_id = $1
                 ORDER BY issued_at DESC, id DESC"
            ))
            .bind(user.value())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepoError::Storage(format!("failed to list user coupons: {e}")))?;
            Ok(rows.into_iter().map(coupon_from_row).collect())
        })
    }

    fn find(&self, id: UserCouponId) -> RepoFuture<'_, Option<UserCoupon>> {
        Box::pin(async move {
            let row: Option<CouponRow> = sqlx::query_as(&format!(
                "SELECT {SELECT_COLUMNS} FROM user_coupons WHERE id = $1"
            ))
            .bind(id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepoError::Storage(format!("failed to load user coupon: {e}")))?;
            Ok(row.map(coupon_from_row))
        })
    }

    fn mark_used(&self, id: UserCouponId, now: DateTime<Utc>) -> RepoFuture<'_, UserCoupon> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| RepoError::Storage(format!("failed to begin transaction: {e}")))?;

            let row: Option<CouponRow> = sqlx::query_as(&format!(
                "SELECT {SELECT_COLUMNS} FROM user_coupons WHERE id = $1 FOR UPDATE"
            ))
            .bind(id.value())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| RepoError::Storage(format!("failed to lock user coupon: {e}")))?;

            let mut coupon = row.map(coupon_from_row).ok_or(RepoError::NotFound {
                entity: "user coupon",
                id: id.value(),
            })?;
            coupon.use_coupon(now)?;

            sqlx::query("UPDATE user_coupons SET used = TRUE, used_at = $2 WHERE id = $1")
                .bind(id.value())
                .bind(coupon.used_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| RepoError::Storage(format!("failed to mark coupon used: {e}")))?;

            tx.commit()
                .await
                .map_err(|e| RepoError::Storage(format!("failed to commit: {e}")))?;
            Ok(coupon)
        })
    }
}
