use idempotency_gateway::api::{create_router, AppState};
use idempotency_gateway::cache::{LocalRecordCache, RedisLeaseLock, RedisRecordCache};
use idempotency_gateway::config::Settings;
use idempotency_gateway::idempotency::{
    HybridIdempotencyStore, IdempotencyCleanupJob, IdempotencyConfig, IdempotencyLayerState,
    IdempotencyOrchestrator,
};
use idempotency_gateway::observability::{init_logging, init_metrics, LogConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;

    // Initialize logging
    init_logging(&LogConfig::from(&settings.application))?;
    info!("Configuration loaded");

    let metrics_handle = init_metrics()?;

    let local = settings
        .local_cache
        .enabled
        .then(|| Arc::new(LocalRecordCache::new(settings.local_cache.max_entries)));

    let redis_client = if settings.redis.enabled {
        info!("Using Redis at {} for idempotency records", settings.redis.url);
        Some(redis::Client::open(settings.redis.url.as_str())?)
    } else {
        None
    };
    let remote = redis_client.clone().map(RedisRecordCache::new);

    let store = HybridIdempotencyStore::new(
        local,
        remote,
        Duration::from_secs(settings.local_cache.ttl_secs),
    )?;
    info!("Idempotency store ready");

    let mut orchestrator =
        IdempotencyOrchestrator::new(Arc::new(store), IdempotencyConfig::from(&settings.idempotency));

    if settings.idempotency.distributed_lock {
        match redis_client {
            Some(client) => {
                orchestrator = orchestrator.with_distributed_lock(Arc::new(RedisLeaseLock::new(client)));
                info!("Distributed execution lease enabled");
            }
            None => tracing::warn!("distributed_lock requires redis.enabled, using the local gate only"),
        }
    }

    let orchestrator = Arc::new(orchestrator);

    if settings.local_cache.enabled {
        IdempotencyCleanupJob::new(
            Arc::clone(&orchestrator),
            Duration::from_secs(settings.local_cache.cleanup_interval_secs),
        )
        .start();
    }

    let layer_state = IdempotencyLayerState::from_settings(orchestrator, &settings.idempotency)?;
    let state = AppState::new(layer_state).with_metrics(metrics_handle);
    let app = create_router(state);

    let address = settings.bind_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Idempotency gateway listening on {}", address);

    axum::serve(listener, app).await?;

    Ok(())
}
