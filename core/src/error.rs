//! Business error taxonomy.
//!
//! These are *terminal* outcomes of domain rules: callers map them to
//! client-facing failures and never retry them automatically. Transient
//! infrastructure failures live elsewhere ([`crate::store::StoreError`],
//! [`crate::repository::RepoError`], and the lock errors in
//! `flashsale-runtime`).

use crate::ids::{CouponEventId, ProductId, UserCouponId, UserId};
use thiserror::Error;

/// A domain invariant rejected the requested mutation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The coupon event has issued its entire quantity.
    #[error("coupon event {event} is sold out (total quantity {total})")]
    SoldOut {
        /// The exhausted event.
        event: CouponEventId,
        /// Its total quantity, for the error message.
        total: u32,
    },

    /// Not enough stock to satisfy the requested decrement.
    #[error("insufficient stock for product {product}: requested {requested}, available {available}")]
    InsufficientStock {
        /// The product being decremented.
        product: ProductId,
        /// The requested quantity.
        requested: u32,
        /// The stock actually available.
        available: u32,
    },

    /// Not enough balance to satisfy the requested deduction.
    #[error("insufficient balance for user {user}: requested {requested}, available {available}")]
    InsufficientBalance {
        /// The paying user.
        user: UserId,
        /// The requested amount.
        requested: i64,
        /// The balance actually available.
        available: i64,
    },

    /// A charge, deduction, or quantity that must be positive was not.
    #[error("amount must be positive, got {amount}")]
    InvalidAmount {
        /// The rejected amount.
        amount: i64,
    },

    /// The coupon event's validity window does not contain the current time.
    #[error("coupon event {event} is outside its validity window")]
    CouponExpired {
        /// The inactive event.
        event: CouponEventId,
    },

    /// The user coupon was already redeemed.
    #[error("user coupon {coupon} was already used")]
    CouponAlreadyUsed {
        /// The spent coupon.
        coupon: UserCouponId,
    },
}
