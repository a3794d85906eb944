//! User rows with row-locked balance mutation.

use chrono::{DateTime, Utc};
use flashsale_core::{DomainError, RepoError, RepoFuture, User, UserId, UserRepository};
use sqlx::PgPool;

type UserRow = (i64, String, i64, DateTime<Utc>);

fn user_from_row(row: UserRow) -> User {
    let (id, name, balance, updated_at) = row;
    User {
        id: UserId::new(id),
        name,
        balance,
        updated_at,
    }
}

/// [`UserRepository`] over PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply a domain mutation to the row while holding it `FOR UPDATE`.
    async fn mutate(
        &self,
        id: UserId,
        apply: impl FnOnce(&mut User) -> Result<(), DomainError>,
    ) -> Result<User, RepoError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RepoError::Storage(format!("failed to begin transaction: {e}")))?;

        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, name, balance, updated_at FROM users WHERE id = $1 FOR UPDATE",
        )
        .bind(id.value())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| RepoError::Storage(format!("failed to lock user: {e}")))?;

        let mut user = row.map(user_from_row).ok_or(RepoError::NotFound {
            entity: "user",
            id: id.value(),
        })?;
        apply(&mut user)?;

        sqlx::query("UPDATE users SET balance = $2, updated_at = $3 WHERE id = $1")
            .bind(id.value())
            .bind(user.balance)
            .bind(user.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| RepoError::Storage(format!("failed to update user balance: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| RepoError::Storage(format!("failed to commit: {e}")))?;
        Ok(user)
    }
}

impl UserRepository for PgUserRepository {
    fn find(&self, id: UserId) -> RepoFuture<'_, Option<User>> {
        Box::pin(async move {
            let row: Option<UserRow> = sqlx::query_as(
                "SELECT id, name, balance, updated_at FROM users WHERE id = $1",
            )
            .bind(id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepoError::Storage(format!("failed to load user: {e}")))?;
            Ok(row.map(user_from_row))
        })
    }

    fn save(&self, user: User) -> RepoFuture<'_, User> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO users (id, name, balance, updated_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (id) DO UPDATE SET
                     name = EXCLUDED.name,
                     balance = EXCLUDED.balance,
                     updated_at = EXCLUDED.updated_at",
            )
            .bind(user.id.value())
            .bind(&user.name)
            .bind(user.balance)
            .bind(user.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| RepoError::Storage(format!("failed to save user: {e}")))?;
            Ok(user)
        })
    }

    fn charge_points(&self, id: UserId, amount: i64) -> RepoFuture<'_, User> {
        Box::pin(async move { self.mutate(id, |u| u.charge_points(amount)).await })
    }

    fn use_points(&self, id: UserId, amount: i64) -> RepoFuture<'_, User> {
        Box::pin(async move { self.mutate(id, |u| u.use_points(amount)).await })
    }
}
