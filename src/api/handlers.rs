use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use uuid::Uuid;

use crate::api::responses::{ApiResponse, EchoResponse, HealthResponse, IdempotencyStatsResponse};

use super::routes::AppState;

/// Health check endpoint.
pub async fn health_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiResponse<HealthResponse>>) {
    let health = state.health_checker.check_all().await;

    let status = if health.status.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let response = HealthResponse {
        status: health.status,
        version: health.version,
        timestamp: chrono::Utc::now(),
        uptime_seconds: health.uptime_seconds,
        dependencies: health.dependencies,
    };

    (status, Json(ApiResponse::success(response)))
}

/// Readiness check endpoint.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    if state.health_checker.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check endpoint.
pub async fn liveness_check() -> StatusCode {
    StatusCode::OK
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn idempotency_stats(
    State(state): State<AppState>,
) -> Json<ApiResponse<IdempotencyStatsResponse>> {
    let orchestrator = &state.idempotency.orchestrator;
    let counters = orchestrator.metrics().snapshot();

    Json(ApiResponse::success(IdempotencyStatsResponse {
        store: orchestrator.store().name().to_string(),
        in_flight_leases: orchestrator.gate().in_flight(),
        replay_rate: counters.replay_rate(),
        counters,
    }))
}

/// Echoes the JSON body back with a fresh id. Mounted behind the idempotency middleware,
/// so a retried request gets the first id back.
pub async fn echo(Json(payload): Json<serde_json::Value>) -> (StatusCode, Json<EchoResponse>) {
    let response = EchoResponse {
        id: Uuid::new_v4(),
        received: payload,
        processed_at: chrono::Utc::now(),
    };
    tracing::info!(id = %response.id, "Processed echo request");

    (StatusCode::CREATED, Json(response))
}
