//! Product entity and its stock invariant.

use crate::error::DomainError;
use crate::ids::ProductId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A sellable product with a non-negative stock count.
///
/// Stock mutation is a read-check-mutate sequence; callers must serialize
/// concurrent access, either with [`crate::KeyedMutex`] (single process) or
/// the durable store's row-level lock (cross-process). An aggregate uses
/// exactly one of the two disciplines, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Product id.
    pub id: ProductId,
    /// Display name.
    pub name: String,
    /// Unit price in minor currency units. Always positive.
    pub price: i64,
    /// Units in stock. The type keeps this non-negative.
    pub stock: u32,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// Create a product.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::InvalidAmount`] for a non-positive price.
    pub fn new(
        id: ProductId,
        name: impl Into<String>,
        price: i64,
        stock: u32,
    ) -> Result<Self, DomainError> {
        if price <= 0 {
            return Err(DomainError::InvalidAmount { amount: price });
        }
        Ok(Self {
            id,
            name: name.into(),
            price,
            stock,
            updated_at: Utc::now(),
        })
    }

    /// Whether `quantity` units could be taken without going negative.
    #[must_use]
    pub const fn has_stock(&self, quantity: u32) -> bool {
        self.stock >= quantity
    }

    /// Remove `quantity` units from stock.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::InsufficientStock`] when `quantity` exceeds the
    /// available stock; the product is left unchanged.
    pub fn decrease_stock(&mut self, quantity: u32) -> Result<(), DomainError> {
        if quantity > self.stock {
            return Err(DomainError::InsufficientStock {
                product: self.id,
                requested: quantity,
                available: self.stock,
            });
        }
        self.stock -= quantity;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Return `quantity` units to stock (order cancellation path).
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::InvalidAmount`] for a zero quantity.
    pub fn increase_stock(&mut self, quantity: u32) -> Result<(), DomainError> {
        if quantity == 0 {
            return Err(DomainError::InvalidAmount { amount: 0 });
        }
        self.stock += quantity;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn product(stock: u32) -> Product {
        Product::new(ProductId::new(1), "keyboard", 42_000, stock).unwrap()
    }

    #[test]
    fn rejects_non_positive_price() {
        assert!(Product::new(ProductId::new(1), "free", 0, 1).is_err());
        assert!(Product::new(ProductId::new(1), "negative", -5, 1).is_err());
    }

    #[test]
    fn decrease_within_stock_succeeds() {
        let mut p = product(10);
        assert!(p.decrease_stock(4).is_ok());
        assert_eq!(p.stock, 6);
    }

    #[test]
    fn decrease_beyond_stock_fails_and_preserves_state() {
        let mut p = product(3);
        let err = p.decrease_stock(4).unwrap_err();
        assert_eq!(
            err,
            DomainError::InsufficientStock {
                product: p.id,
                requested: 4,
                available: 3
            }
        );
        assert_eq!(p.stock, 3);
    }

    #[test]
    fn increase_rejects_zero() {
        let mut p = product(1);
        assert!(p.increase_stock(0).is_err());
        assert!(p.increase_stock(2).is_ok());
        assert_eq!(p.stock, 3);
    }

    proptest! {
        // Any sequence of decrements either fails cleanly or keeps the
        // running total consistent; stock can never underflow.
        #[test]
        fn stock_never_goes_negative(initial in 0u32..1_000, takes in proptest::collection::vec(1u32..50, 0..50)) {
            let mut p = product(initial);
            let mut taken = 0u32;
            for qty in takes {
                if p.decrease_stock(qty).is_ok() {
                    taken += qty;
                }
                prop_assert_eq!(p.stock, initial - taken);
            }
        }
    }
}
