//! First-come-first-served coupon allocation over the coordination store.
//!
//! Per event the allocator owns three keys:
//!
//! - `coupon:issued:{event}` — scored dedup set of users already granted an
//!   allocation (score = grant time in epoch millis)
//! - `coupon:stock:{event}` — remaining stock counter
//! - `coupon:queue:{event}` — FIFO queue of allocations awaiting drain
//!
//! Issuance composes three individually atomic store operations with
//! explicit compensation instead of a cross-key transaction. The known gap:
//! a store failure between the dedup insert and the compensation path can
//! leave a user in the dedup set without stock consumed or a queue entry.

use chrono::{DateTime, TimeZone, Utc};
use flashsale_core::{CoordinationStore, CouponEventId, PendingAllocation, StoreError, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// TTL applied to every allocator key; bounds leaked state for events
/// whose queues are never fully drained.
pub const KEY_TTL: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// Outcome of one issuance attempt. All three are ordinary business
/// results, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueOutcome {
    /// The user was granted an allocation and queued for drain.
    Issued,
    /// The user already holds an allocation for this event.
    AlreadyIssued,
    /// The event's stock is exhausted.
    SoldOut,
}

/// Wire form of a queue entry.
#[derive(Debug, Serialize, Deserialize)]
struct QueueEntry {
    user_id: i64,
    enqueued_at_ms: i64,
}

/// Coupon allocator over a shared [`CoordinationStore`].
#[derive(Debug)]
pub struct CouponAllocator<S> {
    store: Arc<S>,
}

impl<S> Clone for CouponAllocator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

fn issued_key(event: CouponEventId) -> String {
    format!("coupon:issued:{event}")
}

fn stock_key(event: CouponEventId) -> String {
    format!("coupon:stock:{event}")
}

fn queue_key(event: CouponEventId) -> String {
    format!("coupon:queue:{event}")
}

impl<S: CoordinationStore> CouponAllocator<S> {
    /// Create an allocator over `store`.
    #[must_use]
    pub const fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Seed the stock counter for an event (administrative setup, before
    /// issuance opens).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    pub async fn initialize_stock(
        &self,
        event: CouponEventId,
        total: u32,
    ) -> Result<(), StoreError> {
        self.store
            .put(&stock_key(event), &total.to_string(), KEY_TTL)
            .await
    }

    /// Attempt to issue one coupon allocation to `user`.
    ///
    /// Dedup insert, stock decrement, and queue append run as separate
    /// atomic steps; an exhausted decrement is compensated (re-increment,
    /// then dedup removal) before `SoldOut` is returned.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure. A failure after the dedup
    /// insert may leave the user marked issued without a grant; see the
    /// module docs.
    pub async fn try_issue(
        &self,
        event: CouponEventId,
        user: UserId,
    ) -> Result<IssueOutcome, StoreError> {
        let now = Utc::now();
        let issued = issued_key(event);
        let member = user.to_string();

        #[allow(clippy::cast_precision_loss)]
        let score = now.timestamp_millis() as f64;
        if !self.store.add_if_absent(&issued, &member, score).await? {
            return Ok(IssueOutcome::AlreadyIssued);
        }
        self.store.expire(&issued, KEY_TTL).await?;

        let remaining = self.store.decrement(&stock_key(event)).await?;
        if remaining < 0 {
            self.store.increment(&stock_key(event)).await?;
            self.store.remove_member(&issued, &member).await?;
            tracing::debug!(event_id = event.value(), user_id = user.value(), "sold out");
            return Ok(IssueOutcome::SoldOut);
        }

        let entry = QueueEntry {
            user_id: user.value(),
            enqueued_at_ms: now.timestamp_millis(),
        };
        let encoded = serde_json::to_string(&entry)
            .map_err(|e| StoreError::Backend(format!("failed to encode queue entry: {e}")))?;
        let queue = queue_key(event);
        self.store.push_back(&queue, &encoded).await?;
        self.store.expire(&queue, KEY_TTL).await?;

        tracing::debug!(
            event_id = event.value(),
            user_id = user.value(),
            remaining,
            "coupon allocation issued"
        );
        Ok(IssueOutcome::Issued)
    }

    /// Whether `user` already holds an allocation for `event`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    pub async fn is_already_issued(
        &self,
        event: CouponEventId,
        user: UserId,
    ) -> Result<bool, StoreError> {
        let score = self
            .store
            .member_score(&issued_key(event), &user.to_string())
            .await?;
        Ok(score.is_some())
    }

    /// Remaining stock, clamped to zero (the counter dips below zero
    /// transiently between a losing decrement and its compensation).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidValue`] when the counter key holds a
    /// non-numeric value.
    pub async fn remaining_stock(&self, event: CouponEventId) -> Result<u64, StoreError> {
        let key = stock_key(event);
        let raw = self.store.get(&key).await?;
        let value = match raw {
            None => 0,
            Some(text) => text.parse::<i64>().map_err(|_| StoreError::InvalidValue {
                key,
                value: text,
            })?,
        };
        Ok(u64::try_from(value).unwrap_or(0))
    }

    /// Number of allocations awaiting drain.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    pub async fn queue_depth(&self, event: CouponEventId) -> Result<u64, StoreError> {
        self.store.list_len(&queue_key(event)).await
    }

    /// Pop up to `max` pending allocations from the queue head.
    ///
    /// An entry that fails to parse is logged and skipped; it still counts
    /// against `max` and is gone from the queue.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    pub async fn pop_pending(
        &self,
        event: CouponEventId,
        max: usize,
    ) -> Result<Vec<PendingAllocation>, StoreError> {
        let queue = queue_key(event);
        let mut pending = Vec::new();
        for _ in 0..max {
            let Some(raw) = self.store.pop_front(&queue).await? else {
                break;
            };
            match serde_json::from_str::<QueueEntry>(&raw) {
                Ok(entry) => pending.push(PendingAllocation {
                    user_id: UserId::new(entry.user_id),
                    coupon_event_id: event,
                    enqueued_at: millis_to_datetime(entry.enqueued_at_ms),
                }),
                Err(err) => {
                    tracing::warn!(
                        event_id = event.value(),
                        entry = %raw,
                        error = %err,
                        "dropping unparsable queue entry"
                    );
                }
            }
        }
        Ok(pending)
    }

    /// Push `pending` back onto the queue head, preserving their relative
    /// order (failed-batch recovery).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure; entries not yet pushed
    /// back are lost from the queue but still protected by the durable
    /// store's uniqueness on redelivery.
    pub async fn requeue_front(
        &self,
        event: CouponEventId,
        pending: &[PendingAllocation],
    ) -> Result<(), StoreError> {
        let queue = queue_key(event);
        for allocation in pending.iter().rev() {
            let entry = QueueEntry {
                user_id: allocation.user_id.value(),
                enqueued_at_ms: allocation.enqueued_at.timestamp_millis(),
            };
            let encoded = serde_json::to_string(&entry)
                .map_err(|e| StoreError::Backend(format!("failed to encode queue entry: {e}")))?;
            self.store.push_front(&queue, &encoded).await?;
        }
        self.store.expire(&queue, KEY_TTL).await?;
        Ok(())
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}
