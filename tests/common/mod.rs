#![allow(dead_code)]

use async_trait::async_trait;
use http::{Method, StatusCode};
use idempotency_gateway::cache::LocalRecordCache;
use idempotency_gateway::error::Result;
use idempotency_gateway::idempotency::{
    CacheKey, CacheKeyBuilder, DistributedLock, EndpointIdentity, HandlerOutcome,
    IdempotencyConfig, IdempotencyOrchestrator, IdempotencyStore, RequestIdentifier,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Identifier used in the worked example of the protocol.
pub const EXAMPLE_IDENTIFIER: &str = "3fa85f64-5717-4562-b3fc-2c963f66afa6";

pub fn local_store() -> Arc<LocalRecordCache> {
    Arc::new(LocalRecordCache::new(1_000))
}

pub fn orchestrator(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Arc<IdempotencyOrchestrator> {
    Arc::new(IdempotencyOrchestrator::new(store, config))
}

pub fn key_for(identifier: &str, route: &str) -> CacheKey {
    let identifier = RequestIdentifier::new(Uuid::parse_str(identifier).unwrap());
    CacheKeyBuilder::with_default_config().build(&identifier, &EndpointIdentity::new(Method::POST, route))
}

pub fn fresh_key() -> CacheKey {
    key_for(&Uuid::new_v4().to_string(), "/orders")
}

/// Downstream handler stand-in that counts its invocations.
#[derive(Clone, Default)]
pub struct CountingHandler {
    calls: Arc<AtomicUsize>,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Responds with `status` and a body carrying the invocation number.
    pub async fn respond(&self, status: StatusCode, delay: Duration) -> Result<HandlerOutcome> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(HandlerOutcome::json(status, &serde_json::json!({ "invocation": n })))
    }
}

/// Lease lock shared by several orchestrators in one test, standing in for Redis.
#[derive(Default)]
pub struct InMemoryLeaseLock {
    leases: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl DistributedLock for InMemoryLeaseLock {
    async fn try_acquire(&self, lease_key: &str, token: &str, _ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap();
        if leases.contains_key(lease_key) {
            return Ok(false);
        }
        leases.insert(lease_key.to_string(), token.to_string());
        Ok(true)
    }

    async fn release(&self, lease_key: &str, token: &str) -> Result<()> {
        let mut leases = self.leases.lock().unwrap();
        if leases.get(lease_key).map(String::as_str) == Some(token) {
            leases.remove(lease_key);
        }
        Ok(())
    }
}

impl InMemoryLeaseLock {
    pub fn held(&self) -> usize {
        self.leases.lock().unwrap().len()
    }
}
