use async_trait::async_trait;
use http::Method;
use idempotency_gateway::cache::LocalRecordCache;
use idempotency_gateway::error::{AppError, Result};
use idempotency_gateway::idempotency::{
    CacheKey, CacheKeyBuilder, EndpointIdentity, ExecutionGate, IdempotencyRecord, IdempotencyStore,
    RequestIdentifier,
};
use idempotency_gateway::observability::{
    get_metrics, init_metrics, mask_key, mask_uuid, HealthChecker, HealthStatus, HealthThresholds, LatencyTimer,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Store whose ping takes `delay` and then answers with `healthy`.
struct PingStore {
    delay: Duration,
    healthy: bool,
}

#[async_trait]
impl IdempotencyStore for PingStore {
    async fn get(&self, _key: &CacheKey) -> Result<Option<IdempotencyRecord>> {
        Ok(None)
    }

    async fn set(&self, _key: &CacheKey, _record: &IdempotencyRecord, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        if self.healthy {
            Ok(())
        } else {
            Err(AppError::StoreUnavailable("connection refused".to_string()))
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

fn checker(delay: Duration, healthy: bool) -> HealthChecker {
    HealthChecker::new(Arc::new(PingStore { delay, healthy }), ExecutionGate::new()).with_thresholds(
        HealthThresholds {
            slow_store: Duration::from_millis(20),
            store_timeout: Duration::from_millis(200),
            ..HealthThresholds::default()
        },
    )
}

#[tokio::test]
async fn test_failing_store_is_unhealthy_and_not_ready() {
    let checker = checker(Duration::ZERO, false);

    let health = checker.check_all().await;
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert_eq!(health.dependencies[0].name, "store:redis");
    assert!(health.dependencies[0]
        .detail
        .as_deref()
        .is_some_and(|detail| detail.contains("connection refused")));
    assert!(!checker.is_ready().await);
}

#[tokio::test]
async fn test_slow_store_is_degraded_but_ready() {
    let checker = checker(Duration::from_millis(60), true);

    let store = checker.check_store().await;
    assert_eq!(store.status, HealthStatus::Degraded);
    assert!(store.latency_ms.is_some_and(|ms| ms >= 60.0));
    assert!(checker.is_ready().await);
}

#[tokio::test]
async fn test_hanging_store_times_out() {
    let checker = checker(Duration::from_secs(5), true);

    let started = std::time::Instant::now();
    let store = checker.check_store().await;
    assert_eq!(store.status, HealthStatus::Unhealthy);
    assert!(store.latency_ms.is_none());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_health_report_serialization() {
    let checker = HealthChecker::new(Arc::new(LocalRecordCache::new(10)), ExecutionGate::new());
    let json = serde_json::to_value(checker.check_all().await).unwrap();

    assert_eq!(json["status"], "healthy");
    assert_eq!(json["dependencies"][0]["name"], "store:local");
    assert!(json["dependencies"][0].get("detail").is_none());
    assert_eq!(json["dependencies"][1]["name"], "execution_gate");
    assert!(json["dependencies"][1].get("latency_ms").is_none());
}

#[test]
fn test_store_keys_are_masked_like_identifiers() {
    let uuid = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
    let identifier = RequestIdentifier::new(uuid);
    let key = CacheKeyBuilder::with_default_config()
        .build(&identifier, &EndpointIdentity::new(Method::POST, "/v1/echo"));

    let masked = mask_key(key.as_str());
    assert_eq!(masked, format!("idem:POST /v1/echo:{}", identifier.masked()));
    assert_eq!(identifier.masked(), mask_uuid(&uuid));
    assert!(!masked.contains("e29b-41d4"));
}

#[test]
fn test_recorded_metrics_are_exported() {
    let handle = init_metrics().unwrap();
    let metrics = get_metrics();

    metrics.record_outcome("replayed");
    metrics.record_store_operation("local_get", 0.2, true);
    metrics.record_gate_wait(12.0);
    metrics.set_in_flight_leases(3);
    metrics.record_corrupt_record();

    let rendered = handle.render();
    assert!(rendered.contains("idempotency_requests_total"));
    assert!(rendered.contains("outcome=\"replayed\""));
    assert!(rendered.contains("idempotency_store_operations_total"));
    assert!(rendered.contains("idempotency_in_flight_leases"));
    assert!(rendered.contains("idempotency_corrupt_records_total"));

    // A second install reuses the recorder.
    assert!(init_metrics().is_ok());
}

#[test]
fn test_latency_timer() {
    let timer = LatencyTimer::new();
    std::thread::sleep(Duration::from_millis(10));
    let elapsed = timer.elapsed_ms();
    assert!(elapsed >= 10.0);
    assert!(elapsed < 1000.0);
}
