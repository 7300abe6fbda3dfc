//! Axum adapter for the idempotency protocol.
//!
//! ```rust,ignore
//! let state = IdempotencyLayerState::from_settings(orchestrator, &settings.idempotency)?;
//! let router = Router::new()
//!     .route("/orders", post(create_order))
//!     .route_layer(middleware::from_fn_with_state(state, idempotency_middleware));
//! ```
//!
//! Install it with `route_layer` so the matched route template is available; with a
//! plain `layer` the endpoint identity falls back to the request path.

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::{HeaderName, HeaderValue};
use std::sync::Arc;

use super::capture::HandlerOutcome;
use super::handler::{IdempotencyOrchestrator, Resolution};
use super::identifier::IdentifierExtractor;
use super::key_generator::{CacheKeyBuilder, EndpointIdentity, KeyGeneratorConfig};
use crate::config::IdempotencySettings;
use crate::error::Result;

/// Header added to replayed responses when `mark_replays` is on.
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

#[derive(Clone)]
pub struct IdempotencyLayerState {
    pub orchestrator: Arc<IdempotencyOrchestrator>,
    pub extractor: IdentifierExtractor,
    pub keys: CacheKeyBuilder,
    pub mark_replays: bool,
}

impl IdempotencyLayerState {
    pub fn new(
        orchestrator: Arc<IdempotencyOrchestrator>,
        extractor: IdentifierExtractor,
        keys: CacheKeyBuilder,
    ) -> Self {
        Self {
            orchestrator,
            extractor,
            keys,
            mark_replays: false,
        }
    }

    pub fn from_settings(
        orchestrator: Arc<IdempotencyOrchestrator>,
        settings: &IdempotencySettings,
    ) -> Result<Self> {
        let extractor = IdentifierExtractor::new(&settings.header_name)?;
        let keys = CacheKeyBuilder::new(KeyGeneratorConfig {
            key_prefix: settings.key_prefix.clone(),
            scope: settings.key_scope,
            hash_endpoint: settings.hash_endpoint,
        });
        Ok(Self::new(orchestrator, extractor, keys).with_replay_marker(settings.mark_replays))
    }

    pub fn with_replay_marker(mut self, enabled: bool) -> Self {
        self.mark_replays = enabled;
        self
    }
}

pub async fn idempotency_middleware(
    State(state): State<IdempotencyLayerState>,
    request: Request,
    next: Next,
) -> Response {
    // Rejected before any store or handler interaction.
    let identifier = match state.extractor.extract(request.headers()) {
        Ok(identifier) => identifier,
        Err(e) => {
            tracing::debug!(path = %request.uri().path(), code = e.code(), "Rejected request without a usable identifier");
            return e.into_response();
        }
    };

    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let endpoint = EndpointIdentity::new(request.method().clone(), route);
    let key = state.keys.build(&identifier, &endpoint);
    tracing::debug!(
        identifier = %identifier.masked(),
        method = %request.method(),
        "Resolving idempotent request"
    );

    let resolution = state
        .orchestrator
        .execute(&key, || async move {
            let response = next.run(request).await;
            HandlerOutcome::from_response(response).await
        })
        .await;

    match resolution {
        Ok(Resolution::Replayed(outcome)) => {
            let mut response = outcome.into_response();
            if state.mark_replays {
                response.headers_mut().insert(
                    HeaderName::from_static(REPLAYED_HEADER),
                    HeaderValue::from_static("true"),
                );
            }
            response
        }
        Ok(Resolution::Executed { outcome, .. }) => outcome.into_response(),
        Err(e) => e.into_response(),
    }
}
