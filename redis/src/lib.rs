//! Redis-backed [`CoordinationStore`].
//!
//! One `ConnectionManager` is shared by all clones; each operation clones
//! it (cheap, it multiplexes a single reconnecting connection) and issues
//! one command, so every trait method inherits Redis's per-command
//! atomicity. The compare-and-delete uses a Lua script because GET + DEL
//! would race a lease takeover between the two commands.

use flashsale_core::{CoordinationStore, StoreError, StoreFuture};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;

/// DEL only when the key still holds the caller's value.
const DELETE_IF_EQUALS: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end";

fn backend_err(err: &redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[allow(clippy::cast_possible_truncation)]
fn ttl_millis(ttl: Duration) -> u64 {
    // Leases and key TTLs are seconds to days; u64 milliseconds cannot
    // overflow for any value the callers pass.
    ttl.as_millis() as u64
}

/// Coordination store over a shared Redis.
#[derive(Clone)]
pub struct RedisCoordinationStore {
    conn_manager: ConnectionManager,
}

impl RedisCoordinationStore {
    /// Connect to Redis at `redis_url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] when the client cannot be created or
    /// the initial connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| {
            StoreError::Backend(format!("failed to create Redis client: {e}"))
        })?;
        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            StoreError::Backend(format!("failed to create Redis connection manager: {e}"))
        })?;
        Ok(Self { conn_manager })
    }

    async fn bump(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn_manager.clone();
        match conn.incr::<_, _, i64>(key, delta).await {
            Ok(value) => Ok(value),
            // INCRBY reports a non-numeric value as a type error; surface
            // the offending value instead of the raw protocol message.
            Err(err) if err.to_string().contains("not an integer") => {
                let value: Option<String> =
                    conn.get(key).await.map_err(|e| backend_err(&e))?;
                Err(StoreError::InvalidValue {
                    key: key.to_owned(),
                    value: value.unwrap_or_default(),
                })
            }
            Err(err) => Err(backend_err(&err)),
        }
    }
}

impl CoordinationStore for RedisCoordinationStore {
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            // SET NX PX replies OK or nil.
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await
                .map_err(|e| backend_err(&e))?;
            Ok(reply.is_some())
        })
    }

    fn delete_if_equals<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let script = redis::Script::new(DELETE_IF_EQUALS);
            let deleted: i64 = script
                .key(key)
                .arg(value)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| backend_err(&e))?;
            Ok(deleted == 1)
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await
                .map_err(|e| backend_err(&e))?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let value: Option<String> = conn.get(key).await.map_err(|e| backend_err(&e))?;
            Ok(value)
        })
    }

    fn increment<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64> {
        Box::pin(async move { self.bump(key, 1).await })
    }

    fn decrement<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64> {
        Box::pin(async move { self.bump(key, -1).await })
    }

    fn add_if_absent<'a>(
        &'a self,
        key: &'a str,
        member: &'a str,
        score: f64,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            // ZADD NX replies with the number of members actually added.
            let added: i64 = redis::cmd("ZADD")
                .arg(key)
                .arg("NX")
                .arg(score)
                .arg(member)
                .query_async(&mut conn)
                .await
                .map_err(|e| backend_err(&e))?;
            Ok(added == 1)
        })
    }

    fn remove_member<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let removed: i64 = conn.zrem(key, member).await.map_err(|e| backend_err(&e))?;
            Ok(removed > 0)
        })
    }

    fn member_score<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, Option<f64>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let score: Option<f64> = conn
                .zscore(key, member)
                .await
                .map_err(|e| backend_err(&e))?;
            Ok(score)
        })
    }

    fn push_back<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let _: i64 = conn.rpush(key, value).await.map_err(|e| backend_err(&e))?;
            Ok(())
        })
    }

    fn push_front<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let _: i64 = conn.lpush(key, value).await.map_err(|e| backend_err(&e))?;
            Ok(())
        })
    }

    fn pop_front<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let head: Option<String> = conn
                .lpop(key, None)
                .await
                .map_err(|e| backend_err(&e))?;
            Ok(head)
        })
    }

    fn list_len<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let len: u64 = conn.llen(key).await.map_err(|e| backend_err(&e))?;
            Ok(len)
        })
    }

    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let ms = i64::try_from(ttl_millis(ttl)).unwrap_or(i64::MAX);
            let _: bool = conn
                .pexpire(key, ms)
                .await
                .map_err(|e| backend_err(&e))?;
            Ok(())
        })
    }
}

impl std::fmt::Debug for RedisCoordinationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCoordinationStore").finish_non_exhaustive()
    }
}
