use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::cache::CacheStats;
use crate::error::{AppError, Result};
use crate::idempotency::{CacheKey, IdempotencyRecord, IdempotencyStore};

struct LocalEntry {
    wire: String,
    expires_at: Instant,
}

/// In-process record tier with per-entry expiry.
///
/// Entries are kept in their wire form so a read never observes a half-built record.
pub struct LocalRecordCache {
    entries: DashMap<String, LocalEntry>,
    max_entries: usize,
    stats: Arc<CacheStats>,
}

impl LocalRecordCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            stats: Arc::new(CacheStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        self.stats.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the stored wire text, or `None` if absent or expired.
    pub fn get_raw(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.wire.clone());
            }
            drop(entry);
            if self.entries.remove_if(key, |_, e| e.expires_at <= now).is_some() {
                self.stats.record_evictions(1);
            }
        }
        None
    }

    /// Stores wire text for `ttl`. Returns false when the cache is full of live entries.
    pub fn insert_raw(&self, key: &str, wire: String, ttl: Duration) -> bool {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(key) {
            self.purge_expired_entries();
            if self.entries.len() >= self.max_entries {
                tracing::debug!(
                    max_entries = self.max_entries,
                    "Local idempotency cache full, skipping insert"
                );
                return false;
            }
        }

        self.entries.insert(
            key.to_string(),
            LocalEntry {
                wire,
                expires_at: Instant::now() + ttl,
            },
        );
        self.stats.record_write();
        true
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn purge_expired_entries(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            self.stats.record_evictions(purged as u64);
        }
        purged
    }

    pub fn get_record(&self, key: &CacheKey) -> Result<Option<IdempotencyRecord>> {
        let Some(wire) = self.get_raw(key.as_str()) else {
            self.stats.record_miss();
            return Ok(None);
        };

        match IdempotencyRecord::from_wire(key.as_str(), &wire) {
            Ok(record) if record.is_expired() => {
                self.remove(key.as_str());
                self.stats.record_miss();
                Ok(None)
            }
            Ok(record) => {
                self.stats.record_hit();
                Ok(Some(record))
            }
            Err(e) => {
                self.stats.record_error();
                self.remove(key.as_str());
                Err(e)
            }
        }
    }

    pub fn insert_record(
        &self,
        key: &CacheKey,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> Result<bool> {
        let wire = record.to_wire()?;
        Ok(self.insert_raw(key.as_str(), wire, ttl))
    }
}

impl Default for LocalRecordCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl IdempotencyStore for LocalRecordCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<IdempotencyRecord>> {
        self.get_record(key)
    }

    async fn set(&self, key: &CacheKey, record: &IdempotencyRecord, ttl: Duration) -> Result<()> {
        if self.insert_record(key, record, ttl)? {
            Ok(())
        } else {
            self.stats.record_error();
            Err(AppError::StoreUnavailable(
                "Local idempotency cache is at capacity".to_string(),
            ))
        }
    }

    async fn purge_expired(&self) -> Result<u64> {
        Ok(self.purge_expired_entries() as u64)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
