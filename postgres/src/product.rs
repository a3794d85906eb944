//! Product rows with row-locked stock mutation.

use crate::quantity_from_db;
use chrono::{DateTime, Utc};
use flashsale_core::{DomainError, Product, ProductId, ProductRepository, RepoError, RepoFuture};
use sqlx::PgPool;

type ProductRow = (i64, String, i64, i64, DateTime<Utc>);

fn product_from_row(row: ProductRow) -> Result<Product, RepoError> {
    let (id, name, price, stock, updated_at) = row;
    Ok(Product {
        id: ProductId::new(id),
        name,
        price,
        stock: quantity_from_db(stock, "stock")?,
        updated_at,
    })
}

/// [`ProductRepository`] over PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgProductRepository {
    pool: PgPool,
}

impl PgProductRepository {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply a domain mutation to the row while holding it `FOR UPDATE`.
    async fn mutate(
        &self,
        id: ProductId,
        apply: impl FnOnce(&mut Product) -> Result<(), DomainError>,
    ) -> Result<Product, RepoError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RepoError::Storage(format!("failed to begin transaction: {e}")))?;

        let row: Option<ProductRow> = sqlx::query_as(
            "SELECT id, name, price, stock, updated_at FROM products WHERE id = $1 FOR UPDATE",
        )
        .bind(id.value())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| RepoError::Storage(format!("failed to lock product: {e}")))?;

        let mut product = row
            .map(product_from_row)
            .transpose()?
            .ok_or(RepoError::NotFound {
                entity: "product",
                id: id.value(),
            })?;
        apply(&mut product)?;

        sqlx::query("UPDATE products SET stock = $2, updated_at = $3 WHERE id = $1")
            .bind(id.value())
            .bind(i64::from(product.stock))
            .bind(product.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| RepoError::Storage(format!("failed to update product stock: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| RepoError::Storage(format!("failed to commit: {e}")))?;
        Ok(product)
    }
}

impl ProductRepository for PgProductRepository {
    fn find(&self, id: ProductId) -> RepoFuture<'_, Option<Product>> {
        Box::pin(async move {
            let row: Option<ProductRow> = sqlx::query_as(
                "SELECT id, name, price, stock, updated_at FROM products WHERE id = $1",
            )
            .bind(id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepoError::Storage(format!("failed to load product: {e}")))?;
            row.map(product_from_row).transpose()
        })
    }

    fn save(&self, product: Product) -> RepoFuture<'_, Product> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO products (id, name, price, stock, updated_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (id) DO UPDATE SET
                     name = EXCLUDED.name,
                     price = EXCLUDED.price,
                     stock = EXCLUDED.stock,
                     updated_at = EXCLUDED.updated_at",
            )
            .bind(product.id.value())
            .bind(&product.name)
            .bind(product.price)
            .bind(i64::from(product.stock))
            .bind(product.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| RepoError::Storage(format!("failed to save product: {e}")))?;
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
