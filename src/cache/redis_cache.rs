use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

use crate::cache::CacheStats;
use crate::error::{AppError, Result};
use crate::idempotency::{CacheKey, DistributedLock, IdempotencyRecord, IdempotencyStore};
use crate::observability::get_metrics;

/// Deletes the lease only while it still carries the caller's token.
const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

async fn shared_connection(
    client: &redis::Client,
    cell: &OnceCell<MultiplexedConnection>,
) -> Result<MultiplexedConnection> {
    let conn = cell
        .get_or_try_init(|| client.get_multiplexed_async_connection())
        .await
        .map_err(AppError::Redis)?;
    Ok(conn.clone())
}

/// Redis-backed record tier shared by every instance.
pub struct RedisRecordCache {
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
    stats: Arc<CacheStats>,
}

impl RedisRecordCache {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            conn: OnceCell::new(),
            stats: Arc::new(CacheStats::new()),
        }
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> Arc<CacheStats> {
        self.stats.clone()
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        shared_connection(&self.client, &self.conn).await.map_err(|e| {
            self.stats.record_error();
            tracing::warn!("Redis connection error in idempotency store: {}", e);
            e
        })
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let start = Instant::now();

        let result: redis::RedisResult<Option<String>> = conn.get(key).await;
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        get_metrics().record_store_operation("redis_get", duration_ms, result.is_ok());

        result.map_err(|e| {
            self.stats.record_error();
            tracing::warn!("Redis get error: {}", e);
            AppError::Redis(e)
        })
    }

    pub async fn set_raw(&self, key: &str, wire: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let start = Instant::now();

        // EX has second granularity; round up so a record never outlives its TTL by less.
        let ttl_secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        let result: redis::RedisResult<()> = conn.set_ex(key, wire, ttl_secs.max(1)).await;
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        get_metrics().record_store_operation("redis_set", duration_ms, result.is_ok());

        match result {
            Ok(()) => {
                self.stats.record_write();
                tracing::debug!(key = %key, ttl_secs = ttl_secs, "Stored idempotency record");
                Ok(())
            }
            Err(e) => {
                self.stats.record_error();
                tracing::warn!("Redis set error: {}", e);
                Err(AppError::Redis(e))
            }
        }
    }

    pub async fn get_record(&self, key: &CacheKey) -> Result<Option<IdempotencyRecord>> {
        let Some(wire) = self.get_raw(key.as_str()).await? else {
            self.stats.record_miss();
            return Ok(None);
        };

        match IdempotencyRecord::from_wire(key.as_str(), &wire) {
            Ok(record) if record.is_expired() => {
                self.stats.record_miss();
                Ok(None)
            }
            Ok(record) => {
                self.stats.record_hit();
                Ok(Some(record))
            }
            Err(e) => {
                self.stats.record_error();
                Err(e)
            }
        }
    }

    pub async fn set_record(
        &self,
        key: &CacheKey,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> Result<()> {
        let wire = record.to_wire()?;
        self.set_raw(key.as_str(), &wire, ttl).await
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(AppError::Redis)
    }
}

#[async_trait]
impl IdempotencyStore for RedisRecordCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<IdempotencyRecord>> {
        self.get_record(key).await
    }

    async fn set(&self, key: &CacheKey, record: &IdempotencyRecord, ttl: Duration) -> Result<()> {
        self.set_record(key, record, ttl).await
    }

    async fn ping(&self) -> Result<()> {
        RedisRecordCache::ping(self).await
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Cross-instance lease held in Redis with a TTL as fencing token.
pub struct RedisLeaseLock {
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
}

impl RedisLeaseLock {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            conn: OnceCell::new(),
        }
    }
}

#[async_trait]
impl DistributedLock for RedisLeaseLock {
    async fn try_acquire(&self, lease_key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = shared_connection(&self.client, &self.conn).await?;

        let ttl_ms = (ttl.as_millis() as usize).max(1);
        let result: Option<String> = conn
            .set_options(
                lease_key,
                token,
                redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::PX(ttl_ms)),
            )
            .await
            .map_err(AppError::Redis)?;

        Ok(result.is_some())
    }

    async fn release(&self, lease_key: &str, token: &str) -> Result<()> {
        let mut conn = shared_connection(&self.client, &self.conn).await?;

        let _released: i64 = redis::Script::new(RELEASE_LEASE_SCRIPT)
            .key(lease_key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        Ok(())
    }
}
