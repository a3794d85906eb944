//! User entity and its point-balance invariant.

use crate::error::DomainError;
use crate::ids::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user account holding a non-negative point balance.
///
/// Balance mutation follows the same serialization discipline as
/// [`crate::Product`] stock: [`crate::KeyedMutex`] in-process or a durable
/// row lock cross-process, never a mix for the same aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id.
    pub id: UserId,
    /// Display name.
    pub name: String,
    /// Point balance in minor currency units. Never negative.
    pub balance: i64,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Create a user.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::InvalidAmount`] for a negative starting
    /// balance.
    pub fn new(id: UserId, name: impl Into<String>, balance: i64) -> Result<Self, DomainError> {
        if balance < 0 {
            return Err(DomainError::InvalidAmount { amount: balance });
        }
        Ok(Self {
            id,
            name: name.into(),
            balance,
            updated_at: Utc::now(),
        })
    }

    /// Whether the balance covers `amount`.
    #[must_use]
    pub const fn has_balance(&self, amount: i64) -> bool {
        self.balance >= amount
    }

    /// Add `amount` to the balance.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::InvalidAmount`] for a non-positive amount.
    pub fn charge_points(&mut self, amount: i64) -> Result<(), DomainError> {
        if amount <= 0 {
            return Err(DomainError::InvalidAmount { amount });
        }
        self.balance += amount;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Deduct `amount` from the balance.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::InvalidAmount`] for a non-positive amount and
    /// [`DomainError::InsufficientBalance`] when the balance cannot cover
    /// it; the user is left unchanged in both cases.
    pub fn use_points(&mut self, amount: i64) -> Result<(), DomainError> {
        if amount <= 0 {
            return Err(DomainError::InvalidAmount { amount });
        }
        if amount > self.balance {
            return Err(DomainError::InsufficientBalance {
                user: self.id,
                requested: amount,
                available: self.balance,
            });
        }
        self.balance -= amount;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn user(balance: i64) -> User {
        User::new(UserId::new(1), "alice", balance).unwrap()
    }

    #[test]
    fn rejects_negative_starting_balance() {
        assert!(User::new(UserId::new(1), "bob", -1).is_err());
    }

    #[test]
    fn charge_and_use_adjust_the_balance() {
        let mut u = user(1_000);
        u.charge_points(500).unwrap();
        assert_eq!(u.balance, 1_500);
        u.use_points(1_500).unwrap();
        assert_eq!(u.balance, 0);
    }

    #[test]
    fn non_positive_amounts_are_rejected_everywhere() {
        let mut u = user(100);
        assert!(u.charge_points(0).is_err());
        assert!(u.charge_points(-10).is_err());
        assert!(u.use_points(0).is_err());
        assert_eq!(u.balance, 100);
    }

    #[test]
    fn overdraft_fails_and_preserves_balance() {
        let mut u = user(300);
        let err = u.use_points(301).unwrap_err();
        assert_eq!(
            err,
            DomainError::InsufficientBalance {
                user: u.id,
                requested: 301,
                available: 300
            }
        );
        assert_eq!(u.balance, 300);
    }

    proptest! {
        // Interleaved charges and uses keep the balance equal to the sum of
        // accepted operations and never below zero.
        #[test]
        fn balance_is_exact_bookkeeping(initial in 0i64..10_000, ops in proptest::collection::vec((any::<bool>(), 1i64..500), 0..60)) {
            let mut u = user(initial);
            let mut expected = initial;
            for (charge, amount) in ops {
                if charge {
                    if u.charge_points(amount).is_ok() {
                        expected += amount;
                    }
                } else if u.use_points(amount).is_ok() {
                    expected -= amount;
                }
                prop_assert!(u.balance >= 0);
                prop_assert_eq!(u.balance, expected);
            }
        }
    }
}
