use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::codec::{Base64Codec, PayloadCodec};
use super::key_generator::CacheKey;
use super::storage::IdempotencyRecord;
use crate::error::{AppError, Result};

/// Status and payload produced by one handler invocation.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HandlerOutcome {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string()).with_content_type("application/json")
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            self.headers.insert(header::CONTENT_TYPE, value);
        }
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Buffers a framework response into an outcome.
    pub async fn from_response(response: Response) -> Result<Self> {
        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to read response body: {}", e)))?;

        Ok(Self {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

impl IntoResponse for HandlerOutcome {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Why an outcome was returned without being stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UncachedReason {
    NonSuccessStatus(u16),
    /// Body size and the configured limit. Handled as a store write failure.
    BodyTooLarge { size: usize, limit: usize },
}

/// A handler outcome plus the record to persist, if it is cacheable.
#[derive(Debug)]
pub struct CapturedOutcome {
    pub outcome: HandlerOutcome,
    pub record: std::result::Result<IdempotencyRecord, UncachedReason>,
}

/// Invokes the downstream handler once and decides whether its outcome is stored.
#[derive(Debug, Clone)]
pub struct ResponseCapture {
    codec: Arc<dyn PayloadCodec>,
    ttl: Duration,
    max_body_bytes: Option<usize>,
    execution_timeout: Option<Duration>,
}

impl ResponseCapture {
    pub fn new(
        codec: Arc<dyn PayloadCodec>,
        ttl: Duration,
        max_body_bytes: Option<usize>,
        execution_timeout: Option<Duration>,
    ) -> Self {
        Self {
            codec,
            ttl,
            max_body_bytes,
            execution_timeout,
        }
    }

    pub fn with_execution_timeout(mut self, execution_timeout: Option<Duration>) -> Self {
        self.execution_timeout = execution_timeout;
        self
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout
    }

    /// Only [200, 300) outcomes are ever persisted.
    pub fn is_cacheable_status(status: StatusCode) -> bool {
        (200..300).contains(&status.as_u16())
    }

    pub async fn capture<F, Fut>(&self, key: &CacheKey, handler: F) -> Result<CapturedOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HandlerOutcome>>,
    {
        let outcome = match self.execution_timeout {
            Some(limit) => tokio::time::timeout(limit, handler())
                .await
                .map_err(|_| AppError::ExecutionTimeout {
                    key: key.to_string(),
                })??,
            None => handler().await?,
        };

        let record = self.build_record(&outcome);
        Ok(CapturedOutcome { outcome, record })
    }

    pub fn build_record(
        &self,
        outcome: &HandlerOutcome,
    ) -> std::result::Result<IdempotencyRecord, UncachedReason> {
        if !Self::is_cacheable_status(outcome.status) {
            return Err(UncachedReason::NonSuccessStatus(outcome.status.as_u16()));
        }

        if let Some(limit) = self.max_body_bytes {
            if outcome.body.len() > limit {
                return Err(UncachedReason::BodyTooLarge {
                    size: outcome.body.len(),
                    limit,
                });
            }
        }

        // A body the configured codec refuses is still stored, as base64.
        let (value, encoding) = match self.codec.encode(&outcome.body) {
            Ok(value) => (value, self.codec.name()),
            Err(e) => {
                tracing::debug!(error = %e, "Storing payload as base64");
                (Base64Codec::encode_bytes(&outcome.body), Base64Codec::NAME)
            }
        };

        Ok(IdempotencyRecord::new(
            outcome.status.as_u16(),
            value,
            outcome.content_type().map(str::to_owned),
            self.ttl,
        )
        .with_encoding(encoding))
    }
}
