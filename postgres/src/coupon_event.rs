//! Coupon event rows.

use crate::quantity_from_db;
use chrono::{DateTime, Utc};
use flashsale_core::{CouponEvent, CouponEventId, CouponEventRepository, DiscountSpec, RepoError, RepoFuture};
use sqlx::PgPool;

type EventRow = (
    i64,
    String,
    String,
    i64,
    i64,
    DateTime<Utc>,
    DateTime<Utc>,
    DateTime<Utc>,
);

const SELECT_COLUMNS: &str =
    "id, name, discount, total_quantity, issued_quantity, starts_at, ends_at, created_at";

fn event_from_row(row: EventRow) -> Result<CouponEvent, RepoError> {
    let (id, name, discount, total, issued, starts_at, ends_at, created_at) = row;
    let discount: DiscountSpec = serde_json::from_str(&discount)
        .map_err(|e| RepoError::Storage(format!("corrupt discount spec for event {id}: {e}")))?;
    Ok(CouponEvent {
        id: CouponEventId::new(id),
        name,
        discount,
        total_quantity: quantity_from_db(total, "total_quantity")?,
        issued_quantity: quantity_from_db(issued, "issued_quantity")?,
        starts_at,
        ends_at,
        created_at,
    })
}

/// [`CouponEventRepository`] over PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgCouponEventRepository {
    pool: PgPool,
}

impl PgCouponEventRepository {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CouponEventRepository for PgCouponEventRepository {
    fn find(&self, id: CouponEventId) -> RepoFuture<'_, Option<CouponEvent>> {
        Box::pin(async move {
            let row: Option<EventRow> = sqlx::query_as(&format!(
                "SELECT {SELECT_COLUMNS} FROM coupon_events WHERE id = $1"
            ))
            .bind(id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepoError::Storage(format!("failed to load coupon event: {e}")))?;
            row.map(event_from_row).transpose()
        })
    }

    fn find_active(&self, now: DateTime<Utc>) -> RepoFuture<'_, Vec<CouponEvent>> {
        Box::pin(async move {
            let rows: Vec<EventRow> = sqlx::query_as(&format!(
                "SELECT {SELECT_COLUMNS} FROM coupon_events
                 WHERE starts_at <= $1 AND ends_at >= $1
                 ORDER BY id"
            ))
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepoError::Storage(format!("failed to list active events: {e}")))?;
            rows.into_iter().map(event_from_row).collect()
        })
    }

    fn save(&self, event: CouponEvent) -> RepoFuture<'_, CouponEvent> {
        Box::pin(async move {
            let discount = serde_json::to_string(&event.discount)
                .map_err(|e| RepoError::Storage(format!("failed to encode discount spec: {e}")))?;
            sqlx::query(
                "INSERT INTO coupon_events
                     (id, name, discount, total_quantity, issued_quantity,
                      starts_at, ends_at, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (id) DO UPDATE SET
                     name = EXCLUDED.name,
                     discount = EXCLUDED.discount,
                     total_quantity = EXCLUDED.total_quantity,
                     issued_quantity = EXCLUDED.issued_quantity,
                     starts_at = EXCLUDED.starts_at,
                     ends_at = EXCLUDED.ends_at",
            )
            .bind(event.id.value())
            .bind(&event.name)
            .bind(&discount)
            .bind(i64::from(event.total_quantity))
            .bind(i64::from(event.issued_quantity))
            .bind(event.starts_at)
            .bind(event.ends_at)
            .bind(event.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| RepoError::Storage(format!("failed to save coupon event: {e}")))?;
            Ok(event)
        })
    }

    fn record_issued(&self, id: CouponEventId, count: u32) -> RepoFuture<'_, ()> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(|e| {
                RepoError::Storage(format!("failed to begin transaction: {e}"))
            })?;

            let row: Option<EventRow> = sqlx::query_as(&format!(
                "SELECT {SELECT_COLUMNS} FROM coupon_events WHERE id = $1 FOR UPDATE"
            ))
            .bind(id.value())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| RepoError::Storage(format!("failed to lock coupon event: {e}")))?;

            let mut event = row
                .map(event_from_row)
                .transpose()?
                .ok_or(RepoError::NotFound {
                    entity: "coupon event",
                    id: id.value(),
                })?;
            event.record_issued(count)?;

            sqlx::query("UPDATE coupon_events SET issued_quantity = $2 WHERE id = $1")
                .bind(id.value())
                .bind(i64::from(event.issued_quantity))
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    RepoError::Storage(format!("failed to update issued quantity: {e}"))
                })?;

            tx.commit()
                .await
                .map_err(|e| RepoError::Storage(format!("failed to commit: {e}")))?;

            tracing::debug!(
                event_id = id.value(),
                count,
                issued_quantity = event.issued_quantity,
                "recorded issued coupons"
            );
            Ok(())
        })
    }
}
