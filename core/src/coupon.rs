//! Coupon event and user coupon entities.
//!
//! A [`CouponEvent`] is an issuance campaign with a fixed quantity and a
//! validity window. A [`UserCoupon`] is one grant out of that quantity,
//! carrying a copy of the window taken at issuance time. The quantity
//! invariant `0 <= issued_quantity <= total_quantity` is enforced here;
//! the high-throughput issuance path additionally tracks stock in the
//! coordination store (see `CouponAllocator` in `flashsale-runtime`).

use crate::error::DomainError;
use crate::ids::{CouponEventId, UserCouponId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a coupon discounts an order total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscountSpec {
    /// A fixed amount off the total.
    Amount {
        /// Discount amount in minor currency units.
        amount: i64,
    },
    /// A percentage off the total, capped at `max_amount`.
    Rate {
        /// Discount rate in percent (0-100).
        percent: u8,
        /// Upper bound on the discounted amount.
        max_amount: i64,
    },
}

impl DiscountSpec {
    /// Discount this spec grants against `total`, never exceeding it.
    #[must_use]
    pub fn discount_for(&self, total: i64) -> i64 {
        let raw = match *self {
            Self::Amount { amount } => amount,
            Self::Rate { percent, max_amount } => {
                (total.saturating_mul(i64::from(percent)) / 100).min(max_amount)
            }
        };
        raw.clamp(0, total)
    }
}

/// A coupon issuance campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponEvent {
    /// Campaign id.
    pub id: CouponEventId,
    /// Human-readable campaign name.
    pub name: String,
    /// Discount granted by coupons from this event.
    pub discount: DiscountSpec,
    /// Total number of coupons this event may ever issue.
    pub total_quantity: u32,
    /// Number of coupons issued so far. Invariant: `<= total_quantity`.
    pub issued_quantity: u32,
    /// Start of the validity window (inclusive).
    pub starts_at: DateTime<Utc>,
    /// End of the validity window (inclusive).
    pub ends_at: DateTime<Utc>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl CouponEvent {
    /// Create a fresh event with nothing issued yet.
    #[must_use]
    pub fn new(
        id: CouponEventId,
        name: impl Into<String>,
        discount: DiscountSpec,
        total_quantity: u32,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            discount,
            total_quantity,
            issued_quantity: 0,
            starts_at,
            ends_at,
            created_at: Utc::now(),
        }
    }

    /// Whether at least one more coupon can be issued.
    #[must_use]
    pub const fn can_issue(&self) -> bool {
        self.issued_quantity < self.total_quantity
    }

    /// Coupons still available for issuance.
    #[must_use]
    pub const fn remaining_quantity(&self) -> u32 {
        self.total_quantity - self.issued_quantity
    }

    /// Whether `now` falls inside the validity window.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now >= self.starts_at && now <= self.ends_at
    }

    /// Whether a coupon could be issued right now (window and quantity).
    #[must_use]
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.is_active(now) && self.can_issue()
    }

    /// Issue a single coupon, incrementing `issued_quantity`.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::SoldOut`] when the event is at capacity.
    pub fn issue(&mut self) -> Result<(), DomainError> {
        self.record_issued(1)
    }

    /// Record `count` issued coupons at once (used by the drain scheduler
    /// after a batch insert).
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::SoldOut`] when `count` exceeds the remaining
    /// quantity; the event is left unchanged in that case.
    pub fn record_issued(&mut self, count: u32) -> Result<(), DomainError> {
        if count > self.remaining_quantity() {
            return Err(DomainError::SoldOut {
                event: self.id,
                total: self.total_quantity,
            });
        }
        self.issued_quantity += count;
        Ok(())
    }
}

/// Lifecycle state of a [`UserCoupon`] at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponStatus {
    /// Within its window and not yet redeemed.
    Available,
    /// Already redeemed.
    Used,
    /// Past its validity window.
    Expired,
}

/// A coupon granted to a user, pending or after redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCoupon {
    /// Grant id.
    pub id: UserCouponId,
    /// Owning user. Unique together with `coupon_event_id`.
    pub user_id: UserId,
    /// Event this coupon was issued from.
    pub coupon_event_id: CouponEventId,
    /// Whether the coupon has been redeemed.
    pub used: bool,
    /// Validity window start, copied from the event at issuance.
    pub starts_at: DateTime<Utc>,
    /// Validity window end, copied from the event at issuance.
    pub ends_at: DateTime<Utc>,
    /// When the coupon was issued.
    pub issued_at: DateTime<Utc>,
    /// When the coupon was redeemed, if it was.
    pub used_at: Option<DateTime<Utc>>,
}

impl UserCoupon {
    /// Whether the coupon could be redeemed at `now`.
    #[must_use]
    pub fn can_use(&self, now: DateTime<Utc>) -> bool {
        !self.used && now >= self.starts_at && now <= self.ends_at
    }

    /// Whether the validity window has passed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.ends_at
    }

    /// Lifecycle state at `now`.
    #[must_use]
    pub fn status(&self, now: DateTime<Utc>) -> CouponStatus {
        if self.used {
            CouponStatus::Used
        } else if self.is_expired(now) {
            CouponStatus::Expired
        } else {
            CouponStatus::Available
        }
    }

    /// Redeem the coupon at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::CouponAlreadyUsed`] for a second redemption and
    /// [`DomainError::CouponExpired`] outside the validity window.
    pub fn use_coupon(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.used {
            return Err(DomainError::CouponAlreadyUsed { coupon: self.id });
        }
        if now < self.starts_at || now > self.ends_at {
            return Err(DomainError::CouponExpired {
                event: self.coupon_event_id,
            });
        }
        self.used = true;
        self.used_at = Some(now);
        Ok(())
    }
}

/// A [`UserCoupon`] about to be persisted; the durable store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUserCoupon {
    /// Owning user.
    pub user_id: UserId,
    /// Source event.
    pub coupon_event_id: CouponEventId,
    /// Validity window start, copied from the event.
    pub starts_at: DateTime<Utc>,
    /// Validity window end, copied from the event.
    pub ends_at: DateTime<Utc>,
    /// Issuance timestamp.
    pub issued_at: DateTime<Utc>,
}

impl NewUserCoupon {
    /// Build the durable record for a drained allocation, copying the
    /// event's validity window.
    #[must_use]
    pub fn from_event(user_id: UserId, event: &CouponEvent, issued_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            coupon_event_id: event.id,
            starts_at: event.starts_at,
            ends_at: event.ends_at,
            issued_at,
        }
    }
}

/// An allocation sitting in the coordination store's pending queue: granted
/// by the allocator but not yet drained into a durable [`UserCoupon`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAllocation {
    /// User the allocation was granted to.
    pub user_id: UserId,
    /// Event the allocation belongs to.
    pub coupon_event_id: CouponEventId,
    /// When the allocation entered the queue.
    pub enqueued_at: DateTime<Utc>,
}
