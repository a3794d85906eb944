//! Strongly typed identifiers for the domain entities.
//!
//! Ids are `i64` newtypes so a `UserId` can never be passed where a
//! `ProductId` is expected, and so coordination-store keys and SQL bindings
//! stay explicit about what they identify.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when parsing an id from a string fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {kind} id: {value}")]
pub struct ParseIdError {
    /// Which id type failed to parse.
    pub kind: &'static str,
    /// The offending input.
    pub value: String,
}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw database id.
            #[must_use]
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            /// The raw `i64` value, for SQL bindings and store keys.
            #[must_use]
            pub const fn value(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse::<i64>().map(Self).map_err(|_| ParseIdError {
                    kind: $kind,
                    value: s.to_owned(),
                })
            }
        }
    };
}

entity_id!(
    /// Identifier of a user account.
    UserId,
    "user"
);

entity_id!(
    /// Identifier of a coupon event (an issuance campaign).
    CouponEventId,
    "coupon event"
);

entity_id!(
    /// Identifier of a coupon granted to a user.
    UserCouponId,
    "user coupon"
);

entity_id!(
    /// Identifier of a product.
    ProductId,
    "product"
);
