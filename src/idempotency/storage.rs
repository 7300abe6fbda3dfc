use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::key_generator::CacheKey;
use crate::cache::{LocalRecordCache, RedisRecordCache};
use crate::error::{AppError, Result};
use crate::observability::mask_key;

/// Stored outcome of the first successful execution for a key.
///
/// Persisted as `{"statusCode":..,"value":..,"encoding":..,"contentType":..,"createdAt":..,"expiresAt":..}`;
/// only `statusCode` and `value` are required when reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub status_code: u16,
    /// Codec-encoded response payload.
    pub value: String,
    /// Name of the codec that produced `value`. Absent means the orchestrator's codec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl IdempotencyRecord {
    pub fn new(
        status_code: u16,
        value: String,
        content_type: Option<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self {
            status_code,
            value,
            encoding: None,
            content_type,
            created_at: now,
            expires_at: Some(now + ttl),
        }
    }

    pub fn with_encoding(mut self, encoding: &str) -> Self {
        self.encoding = Some(encoding.to_string());
        self
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(expires_at) if Utc::now() >= expires_at)
    }

    /// Lifetime left before the record expires, `None` when unknown.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        let expires_at = self.expires_at?;
        Some((expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn to_wire(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Failed to serialize idempotency record: {}", e))
        })
    }

    pub fn from_wire(key: &str, raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| AppError::CorruptRecord {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Key-value store with per-entry expiration holding idempotency records.
///
/// Implementations must make `set` atomic per key (readers never observe a partial
/// record) and must report expired entries as absent.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns the live record for `key`, `None` on a miss or after expiry.
    async fn get(&self, key: &CacheKey) -> Result<Option<IdempotencyRecord>>;

    async fn set(&self, key: &CacheKey, record: &IdempotencyRecord, ttl: Duration) -> Result<()>;

    /// Drops expired entries the backend does not evict on its own.
    async fn purge_expired(&self) -> Result<u64> {
        Ok(0)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// Two-tier store: an in-process tier in front of the shared Redis tier.
///
/// Reads go local first and back-fill the local tier from Redis; writes go to both.
pub struct HybridIdempotencyStore {
    local: Option<Arc<LocalRecordCache>>,
    remote: Option<RedisRecordCache>,
    local_ttl: Duration,
}

impl HybridIdempotencyStore {
    pub fn new(
        local: Option<Arc<LocalRecordCache>>,
        remote: Option<RedisRecordCache>,
        local_ttl: Duration,
    ) -> Result<Self> {
        if local.is_none() && remote.is_none() {
            return Err(AppError::Config(
                "At least one idempotency store tier must be enabled".to_string(),
            ));
        }
        Ok(Self {
            local,
            remote,
            local_ttl,
        })
    }

    pub fn local(&self) -> Option<&Arc<LocalRecordCache>> {
        self.local.as_ref()
    }

    pub fn remote(&self) -> Option<&RedisRecordCache> {
        self.remote.as_ref()
    }

    /// The local cap only applies in front of a remote tier; alone, the local tier is authoritative.
    fn local_lifetime(&self, record: &IdempotencyRecord, ttl: Duration) -> Duration {
        let ttl = if self.remote.is_some() {
            ttl.min(self.local_ttl)
        } else {
            ttl
        };
        match record.remaining_ttl() {
            Some(remaining) => ttl.min(remaining),
            None => ttl,
        }
    }
}

#[async_trait]
impl IdempotencyStore for HybridIdempotencyStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<IdempotencyRecord>> {
        if let Some(local) = &self.local {
            match local.get_record(key) {
                Ok(Some(record)) => return Ok(Some(record)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key = %mask_key(key.as_str()), error = %e, "Dropped unreadable local record");
                }
            }
        }

        let Some(remote) = &self.remote else {
            return Ok(None);
        };

        let record = match remote.get_record(key).await? {
            Some(record) => record,
            None => return Ok(None),
        };

        if let Some(local) = &self.local {
            let lifetime = self.local_lifetime(&record, self.local_ttl);
            if !lifetime.is_zero() {
                local.insert_record(key, &record, lifetime)?;
            }
        }

        Ok(Some(record))
    }

    async fn set(&self, key: &CacheKey, record: &IdempotencyRecord, ttl: Duration) -> Result<()> {
        // Remote first: a record only visible locally would diverge across instances.
        if let Some(remote) = &self.remote {
            remote.set_record(key, record, ttl).await?;
        }

        if let Some(local) = &self.local {
            let lifetime = self.local_lifetime(record, ttl);
            // A full local tier only matters when nothing else holds the record.
            if !local.insert_record(key, record, lifetime)? && self.remote.is_none() {
                local.stats().record_error();
                return Err(AppError::StoreUnavailable(
                    "Local idempotency cache is at capacity".to_string(),
                ));
            }
        }

        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        match &self.local {
            Some(local) => Ok(local.purge_expired_entries() as u64),
            None => Ok(0),
        }
    }

    async fn ping(&self) -> Result<()> {
        match &self.remote {
            Some(remote) => remote.ping().await,
            None => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        match (&self.local, &self.remote) {
            (Some(_), Some(_)) => "hybrid",
            (None, Some(_)) => "redis",
            _ => "local",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_wire_shape() {
        let record = IdempotencyRecord::new(
            200,
            r#"{"a":1}"#.to_string(),
            Some("application/json".to_string()),
            Duration::from_secs(3600),
        );
        let wire = record.to_wire().unwrap();
        let json: serde_json::Value = serde_json::from_str(&wire).unwrap();

        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["value"], r#"{"a":1}"#);
        assert_eq!(json["contentType"], "application/json");
        assert!(json["createdAt"].is_string());
        assert!(json["expiresAt"].is_string());
    }

    #[test]
    fn test_minimal_wire_record_is_accepted() {
        let record = IdempotencyRecord::from_wire("k", r#"{"statusCode":201,"value":"ok"}"#).unwrap();
        assert_eq!(record.status_code, 201);
        assert_eq!(record.value, "ok");
        assert!(record.content_type.is_none());
        assert!(record.expires_at.is_none());
        assert!(!record.is_expired());
        assert!(record.remaining_ttl().is_none());
    }

    #[test]
    fn test_unparseable_wire_record_is_corrupt() {
        let err = IdempotencyRecord::from_wire("idem:k", "{not json").unwrap_err();
        match err {
            AppError::CorruptRecord { key, .. } => assert_eq!(key, "idem:k"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_record_expiration() {
        let live = IdempotencyRecord::new(200, String::new(), None, Duration::from_secs(60));
        assert!(!live.is_expired());
        assert!(live.remaining_ttl().unwrap() <= Duration::from_secs(60));

        let mut expired = live.clone();
        expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(expired.is_expired());
        assert_eq!(expired.remaining_ttl(), Some(Duration::ZERO));
    }

    #[test]
    fn test_hybrid_requires_a_tier() {
        assert!(HybridIdempotencyStore::new(None, None, Duration::from_secs(60)).is_err());
    }

    #[tokio::test]
    async fn test_local_only_hybrid_store() {
        let local = Arc::new(LocalRecordCache::new(10));
        let store = HybridIdempotencyStore::new(Some(local.clone()), None, Duration::from_secs(60)).unwrap();
        let key = CacheKey::from_raw("idem:POST /orders:abc");
        let record = IdempotencyRecord::new(200, "{}".to_string(), None, Duration::from_secs(3600));

        assert_eq!(store.name(), "local");
        assert!(store.get(&key).await.unwrap().is_none());

        store.set(&key, &record, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(record));
        assert_eq!(local.len(), 1);
        assert_eq!(store.purge_expired().await.unwrap(), 0);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_local_only_store_reports_full_tier() {
        let local = Arc::new(LocalRecordCache::new(1));
        let store = HybridIdempotencyStore::new(Some(local.clone()), None, Duration::from_secs(60)).unwrap();
        let record = IdempotencyRecord::new(200, "{}".to_string(), None, Duration::from_secs(3600));

        store
            .set(&CacheKey::from_raw("idem:filler"), &record, Duration::from_secs(3600))
            .await
            .unwrap();
        let err = store
            .set(&CacheKey::from_raw("idem:target"), &record, Duration::from_secs(3600))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::StoreUnavailable(_)));
        assert!(local.get_raw("idem:target").is_none());
        assert_eq!(local.stats().errors.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
