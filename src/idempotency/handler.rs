use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::IdempotencySettings;
use crate::error::{AppError, Result};
use crate::idempotency::capture::{HandlerOutcome, ResponseCapture, UncachedReason};
use crate::idempotency::codec::{Base64Codec, PayloadCodec};
use crate::idempotency::gate::{DistributedLock, ExecutionGate, GateDecision, LeaseGuard, WaitOutcome};
use crate::idempotency::key_generator::CacheKey;
use crate::idempotency::replay::ReplayEngine;
use crate::idempotency::storage::{IdempotencyRecord, IdempotencyStore};
use crate::observability::{get_metrics, mask_key};

/// What to do when the idempotency store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Execute the handler anyway; its outcome is not guaranteed to be cached.
    #[default]
    FailOpen,
    /// Reject the request with `StoreUnavailable`.
    FailClosed,
}

/// What a duplicate does once its bounded wait for the in-flight execution runs out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitTimeoutPolicy {
    #[default]
    Conflict,
    /// Run the handler without holding the lease. The outcome is never cached.
    Execute,
}

/// Metrics for idempotency handling.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub replayed_requests: AtomicU64,
    pub executed_requests: AtomicU64,
    pub cached_outcomes: AtomicU64,
    pub uncached_outcomes: AtomicU64,
    pub waits: AtomicU64,
    pub conflicts: AtomicU64,
    pub corrupt_records: AtomicU64,
    pub store_errors: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay(&self) {
        self.replayed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_execution(&self, cached: bool) {
        self.executed_requests.fetch_add(1, Ordering::Relaxed);
        if cached {
            self.cached_outcomes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.uncached_outcomes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_wait(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt(&self) {
        self.corrupt_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            replayed_requests: self.replayed_requests.load(Ordering::Relaxed),
            executed_requests: self.executed_requests.load(Ordering::Relaxed),
            cached_outcomes: self.cached_outcomes.load(Ordering::Relaxed),
            uncached_outcomes: self.uncached_outcomes.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            corrupt_records: self.corrupt_records.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub replayed_requests: u64,
    pub executed_requests: u64,
    pub cached_outcomes: u64,
    pub uncached_outcomes: u64,
    pub waits: u64,
    pub conflicts: u64,
    pub corrupt_records: u64,
    pub store_errors: u64,
    pub failed_requests: u64,
}

impl MetricsSnapshot {
    pub fn replay_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.replayed_requests as f64 / self.total_requests as f64
        }
    }
}

/// Runtime configuration of the orchestrator.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// Retention of a stored record.
    pub ttl: Duration,
    /// Upper bound on how long a duplicate waits for the in-flight execution.
    pub wait_timeout: Duration,
    /// Times a duplicate may find the lease released with no record before giving up.
    pub max_wait_rounds: u32,
    pub on_wait_timeout: WaitTimeoutPolicy,
    pub store_failure_policy: StoreFailurePolicy,
    /// Upper bound on handler runtime. With a distributed lock it is kept below `lock_ttl`.
    pub execution_timeout: Option<Duration>,
    /// Larger successful bodies are treated as a failed store write. `None` stores any size.
    pub max_cached_body_bytes: Option<usize>,
    pub lock_ttl: Duration,
    pub lock_poll_interval: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            wait_timeout: Duration::from_secs(5),
            max_wait_rounds: 2,
            on_wait_timeout: WaitTimeoutPolicy::Conflict,
            store_failure_policy: StoreFailurePolicy::FailOpen,
            execution_timeout: None,
            max_cached_body_bytes: None,
            lock_ttl: Duration::from_secs(30),
            lock_poll_interval: Duration::from_millis(50),
        }
    }
}

impl IdempotencyConfig {
    /// Longest a handler may run while holding a distributed lease: 90% of `lock_ttl`,
    /// so the lease cannot lapse under a running handler.
    pub fn lease_bound(&self) -> Duration {
        self.lock_ttl - self.lock_ttl / 10
    }
}

impl From<&IdempotencySettings> for IdempotencyConfig {
    fn from(settings: &IdempotencySettings) -> Self {
        Self {
            ttl: Duration::from_secs(settings.ttl_secs),
            wait_timeout: Duration::from_millis(settings.wait_timeout_ms),
            max_wait_rounds: settings.max_wait_rounds.max(1),
            on_wait_timeout: settings.on_wait_timeout,
            store_failure_policy: settings.store_failure_policy,
            execution_timeout: settings.execution_timeout_ms.map(Duration::from_millis),
            max_cached_body_bytes: settings.max_cached_body_bytes,
            lock_ttl: Duration::from_millis(settings.lock_ttl_ms),
            lock_poll_interval: Duration::from_millis(settings.lock_poll_interval_ms),
        }
    }
}

/// How a request was resolved.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The handler ran for this request. `cached` tells whether its outcome was stored.
    Executed { outcome: HandlerOutcome, cached: bool },
    /// A stored outcome was replayed; the handler did not run.
    Replayed(HandlerOutcome),
}

impl Resolution {
    pub fn outcome(&self) -> &HandlerOutcome {
        match self {
            Resolution::Executed { outcome, .. } | Resolution::Replayed(outcome) => outcome,
        }
    }

    pub fn into_outcome(self) -> HandlerOutcome {
        match self {
            Resolution::Executed { outcome, .. } | Resolution::Replayed(outcome) => outcome,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Resolution::Replayed(_))
    }
}

enum DistributedAdmission {
    Acquired(DistributedLeaseGuard),
    /// The lock backend failed and the fail-open policy let us continue on the local lease.
    Unavailable,
    Replayed(HandlerOutcome),
    TimedOut,
}

/// Releases a distributed lease. When dropped without `release` (cancellation or an
/// early return) the release is spawned onto the runtime.
struct DistributedLeaseGuard {
    lock: Arc<dyn DistributedLock>,
    lease_key: String,
    token: String,
    released: bool,
}

impl DistributedLeaseGuard {
    async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.lock.release(&self.lease_key, &self.token).await {
            tracing::warn!(lease = %self.lease_key, "Failed to release distributed lease: {}", e);
        }
    }
}

impl Drop for DistributedLeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let lock = Arc::clone(&self.lock);
        let lease_key = std::mem::take(&mut self.lease_key);
        let token = std::mem::take(&mut self.token);
        runtime.spawn(async move {
            if let Err(e) = lock.release(&lease_key, &token).await {
                tracing::warn!(lease = %lease_key, "Failed to release distributed lease: {}", e);
            }
        });
    }
}

/// Runs handlers at most once per key and replays their outcome to duplicates.
pub struct IdempotencyOrchestrator {
    store: Arc<dyn IdempotencyStore>,
    gate: ExecutionGate,
    capture: ResponseCapture,
    replay: ReplayEngine,
    lock: Option<Arc<dyn DistributedLock>>,
    metrics: Arc<IdempotencyMetrics>,
    config: IdempotencyConfig,
}

impl IdempotencyOrchestrator {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        let codec: Arc<dyn PayloadCodec> = Arc::new(Base64Codec);
        Self {
            store,
            gate: ExecutionGate::new(),
            capture: Self::build_capture(&config, Arc::clone(&codec)),
            replay: ReplayEngine::new(codec),
            lock: None,
            metrics: Arc::new(IdempotencyMetrics::new()),
            config,
        }
    }

    fn build_capture(config: &IdempotencyConfig, codec: Arc<dyn PayloadCodec>) -> ResponseCapture {
        ResponseCapture::new(
            codec,
            config.ttl,
            config.max_cached_body_bytes,
            config.execution_timeout,
        )
    }

    /// Replaces the payload codec used to store and replay bodies.
    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.capture = Self::build_capture(&self.config, Arc::clone(&codec));
        self.replay = ReplayEngine::new(codec);
        self
    }

    /// Extends single-flight across instances sharing the same store.
    ///
    /// Handler runtime is capped at [`IdempotencyConfig::lease_bound`] from here on.
    pub fn with_distributed_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        let bound = self.config.lease_bound();
        if self.config.execution_timeout.map_or(true, |limit| limit > bound) {
            tracing::warn!(
                lock_ttl_ms = self.config.lock_ttl.as_millis() as u64,
                execution_timeout_ms = bound.as_millis() as u64,
                "Capping execution timeout below the distributed lease TTL"
            );
            self.config.execution_timeout = Some(bound);
            self.capture = self.capture.with_execution_timeout(Some(bound));
        }
        self.lock = Some(lock);
        self
    }

    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn gate(&self) -> &ExecutionGate {
        &self.gate
    }

    pub fn store(&self) -> Arc<dyn IdempotencyStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Resolves one request for `key`, invoking `handler` only if no stored outcome
    /// exists and no other execution for the key is in flight.
    pub async fn execute<F, Fut>(&self, key: &CacheKey, handler: F) -> Result<Resolution>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HandlerOutcome>>,
    {
        self.metrics.record_request();

        if let Some(outcome) = self.lookup(key).await? {
            return Ok(self.replayed(key, outcome));
        }

        let deadline = Instant::now() + self.config.wait_timeout;
        let mut rounds = 0u32;

        loop {
            match self.gate.acquire(key) {
                GateDecision::Admitted(lease) => {
                    get_metrics().set_in_flight_leases(self.gate.in_flight());
                    // An execution may have completed between our miss and admission.
                    if let Some(outcome) = self.lookup(key).await? {
                        lease.release();
                        return Ok(self.replayed(key, outcome));
                    }
                    return self.run_admitted(key, lease, deadline, handler).await;
                }
                GateDecision::Wait(waiter) => {
                    rounds += 1;
                    self.metrics.record_wait();
                    let waited = Instant::now();
                    let remaining = deadline.saturating_duration_since(waited);
                    let outcome = waiter.wait(remaining).await;
                    get_metrics().record_gate_wait(waited.elapsed().as_secs_f64() * 1000.0);

                    match outcome {
                        WaitOutcome::Released => {
                            if let Some(outcome) = self.lookup(key).await? {
                                return Ok(self.replayed(key, outcome));
                            }
                            if rounds >= self.config.max_wait_rounds {
                                return Err(self.conflict(key));
                            }
                            tracing::debug!(
                                key = %masked(key),
                                "In-flight execution left no record, retrying admission"
                            );
                        }
                        WaitOutcome::TimedOut => {
                            return self.on_wait_timeout(key, handler).await;
                        }
                    }
                }
            }
        }
    }

    /// Purges expired records from tiers that do not expire on their own.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        self.store.purge_expired().await
    }

    async fn run_admitted<F, Fut>(
        &self,
        key: &CacheKey,
        lease: LeaseGuard,
        deadline: Instant,
        handler: F,
    ) -> Result<Resolution>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HandlerOutcome>>,
    {
        let distributed = match &self.lock {
            Some(lock) => match self.acquire_distributed(lock, key, deadline).await? {
                DistributedAdmission::Acquired(guard) => Some(guard),
                DistributedAdmission::Unavailable => None,
                DistributedAdmission::Replayed(outcome) => {
                    return Ok(self.replayed(key, outcome));
                }
                DistributedAdmission::TimedOut => {
                    drop(lease);
                    return self.on_wait_timeout(key, handler).await;
                }
            },
            None => None,
        };

        let started = Instant::now();
        let captured = match self.capture.capture(key, handler).await {
            Ok(captured) => captured,
            Err(e) => {
                self.metrics.record_failed();
                get_metrics().record_outcome("failed");
                tracing::warn!(key = %masked(key), "Idempotent execution failed: {}", e);
                return Err(e);
            }
        };

        // The record must be visible before waiters are woken by the lease release.
        let cached = self.persist(key, captured.record).await?;
        get_metrics().record_handler_latency(started.elapsed().as_secs_f64() * 1000.0, cached);

        if let Some(guard) = distributed {
            guard.release().await;
        }
        drop(lease);
        get_metrics().set_in_flight_leases(self.gate.in_flight());

        self.metrics.record_execution(cached);
        get_metrics().record_outcome("executed");
        tracing::debug!(
            key = %masked(key),
            status = captured.outcome.status.as_u16(),
            cached = cached,
            "Executed idempotent request"
        );

        Ok(Resolution::Executed {
            outcome: captured.outcome,
            cached,
        })
    }

    async fn acquire_distributed(
        &self,
        lock: &Arc<dyn DistributedLock>,
        key: &CacheKey,
        deadline: Instant,
    ) -> Result<DistributedAdmission> {
        let lease_key = key.lease_key();
        let token = Uuid::new_v4().to_string();

        loop {
            match lock.try_acquire(&lease_key, &token, self.config.lock_ttl).await {
                Ok(true) => {
                    return Ok(DistributedAdmission::Acquired(DistributedLeaseGuard {
                        lock: Arc::clone(lock),
                        lease_key,
                        token,
                        released: false,
                    }));
                }
                Ok(false) => {}
                Err(e) => {
                    self.store_failure(key, e)?;
                    return Ok(DistributedAdmission::Unavailable);
                }
            }

            if let Some(outcome) = self.lookup(key).await? {
                return Ok(DistributedAdmission::Replayed(outcome));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(DistributedAdmission::TimedOut);
            }
            let pause = self
                .config
                .lock_poll_interval
                .min(deadline.saturating_duration_since(now));
            tokio::time::sleep(pause).await;
        }
    }

    async fn on_wait_timeout<F, Fut>(&self, key: &CacheKey, handler: F) -> Result<Resolution>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HandlerOutcome>>,
    {
        match self.config.on_wait_timeout {
            WaitTimeoutPolicy::Conflict => Err(self.conflict(key)),
            WaitTimeoutPolicy::Execute => {
                tracing::warn!(
                    key = %masked(key),
                    "Timed out waiting for in-flight execution, executing without lease"
                );
                let captured = match self.capture.capture(key, handler).await {
                    Ok(captured) => captured,
                    Err(e) => {
                        self.metrics.record_failed();
                        get_metrics().record_outcome("failed");
                        return Err(e);
                    }
                };
                self.metrics.record_execution(false);
                get_metrics().record_outcome("executed");
                Ok(Resolution::Executed {
                    outcome: captured.outcome,
                    cached: false,
                })
            }
        }
    }

    /// Reads the stored outcome for `key`. Corrupt records count as a miss.
    async fn lookup(&self, key: &CacheKey) -> Result<Option<HandlerOutcome>> {
        let record = match self.store.get(key).await {
            Ok(record) => record,
            Err(e @ AppError::CorruptRecord { .. }) => {
                self.corrupt(key, &e);
                return Ok(None);
            }
            Err(e) => {
                self.store_failure(key, e)?;
                return Ok(None);
            }
        };

        let Some(record) = record else {
            return Ok(None);
        };

        match self.replay.replay(key, &record) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                self.corrupt(key, &e);
                Ok(None)
            }
        }
    }

    /// Stores a cacheable outcome and returns whether it was stored. A failed write,
    /// including an oversized body, goes through the store-failure policy.
    async fn persist(
        &self,
        key: &CacheKey,
        record: std::result::Result<IdempotencyRecord, UncachedReason>,
    ) -> Result<bool> {
        let record = match record {
            Ok(record) => record,
            Err(UncachedReason::BodyTooLarge { size, limit }) => {
                self.store_failure(
                    key,
                    AppError::StoreUnavailable(format!(
                        "response body of {} bytes exceeds the {} byte record limit",
                        size, limit
                    )),
                )?;
                return Ok(false);
            }
            Err(reason) => {
                tracing::debug!(key = %masked(key), reason = ?reason, "Outcome not cached");
                return Ok(false);
            }
        };

        match self.store.set(key, &record, self.config.ttl).await {
            Ok(()) => Ok(true),
            Err(e) => {
                self.store_failure(key, e)?;
                Ok(false)
            }
        }
    }

    fn store_failure(&self, key: &CacheKey, error: AppError) -> Result<()> {
        self.metrics.record_store_error();
        match self.config.store_failure_policy {
            StoreFailurePolicy::FailOpen => {
                tracing::warn!(
                    key = %masked(key),
                    store = self.store.name(),
                    "Idempotency store unavailable, continuing without it: {}",
                    error
                );
                Ok(())
            }
            StoreFailurePolicy::FailClosed => {
                tracing::error!(
                    key = %masked(key),
                    store = self.store.name(),
                    "Idempotency store unavailable, rejecting request: {}",
                    error
                );
                get_metrics().record_outcome("failed");
                Err(AppError::StoreUnavailable(error.to_string()))
            }
        }
    }

    fn corrupt(&self, key: &CacheKey, error: &AppError) {
        self.metrics.record_corrupt();
        get_metrics().record_corrupt_record();
        tracing::warn!(key = %masked(key), "Ignoring unreadable idempotency record: {}", error);
    }

    fn replayed(&self, key: &CacheKey, outcome: HandlerOutcome) -> Resolution {
        self.metrics.record_replay();
        get_metrics().record_outcome("replayed");
        tracing::debug!(
            key = %masked(key),
            status = outcome.status.as_u16(),
            "Replayed stored outcome"
        );
        Resolution::Replayed(outcome)
    }

    fn conflict(&self, key: &CacheKey) -> AppError {
        self.metrics.record_conflict();
        get_metrics().record_outcome("conflict");
        tracing::warn!(key = %masked(key), "Duplicate request still unresolved, returning conflict");
        AppError::Conflict {
            key: key.to_string(),
        }
    }
}

fn masked(key: &CacheKey) -> String {
    mask_key(key.as_str())
}

/// Background cleanup job for expired idempotency records.
pub struct IdempotencyCleanupJob {
    orchestrator: Arc<IdempotencyOrchestrator>,
    interval: Duration,
}

impl IdempotencyCleanupJob {
    pub fn new(orchestrator: Arc<IdempotencyOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Runs the cleanup job once.
    pub async fn run_once(&self) -> Result<u64> {
        self.orchestrator.cleanup_expired().await
    }

    /// Starts the cleanup job in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);

            loop {
                interval.tick().await;

                match self.orchestrator.cleanup_expired().await {
                    Ok(count) => {
                        if count > 0 {
                            tracing::info!("Cleaned up {} expired idempotency records", count);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to cleanup expired idempotency records: {}", e);
                    }
                }
            }
        })
    }
}
