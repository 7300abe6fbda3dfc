use http::{header, HeaderMap, HeaderValue, StatusCode};
use std::sync::Arc;

use super::capture::{HandlerOutcome, ResponseCapture};
use super::codec::{Base64Codec, PayloadCodec};
use super::key_generator::CacheKey;
use super::storage::IdempotencyRecord;
use crate::error::{AppError, Result};

/// Rebuilds a response from a stored record without touching the handler.
#[derive(Debug, Clone)]
pub struct ReplayEngine {
    codec: Arc<dyn PayloadCodec>,
}

impl ReplayEngine {
    pub fn new(codec: Arc<dyn PayloadCodec>) -> Self {
        Self { codec }
    }

    /// Fails with `CorruptRecord` when the record cannot be turned back into a response.
    pub fn replay(&self, key: &CacheKey, record: &IdempotencyRecord) -> Result<HandlerOutcome> {
        let corrupt = |reason: String| AppError::CorruptRecord {
            key: key.to_string(),
            reason,
        };

        let status = StatusCode::from_u16(record.status_code)
            .map_err(|_| corrupt(format!("invalid status code {}", record.status_code)))?;

        // Only successful outcomes are ever written; anything else did not come from us.
        if !ResponseCapture::is_cacheable_status(status) {
            return Err(corrupt(format!("non-cacheable status code {}", status.as_u16())));
        }

        let codec: &dyn PayloadCodec = match record.encoding.as_deref() {
            None => self.codec.as_ref(),
            Some(name) if name == self.codec.name() => self.codec.as_ref(),
            Some(Base64Codec::NAME) => &Base64Codec,
            Some(other) => return Err(corrupt(format!("unknown payload encoding '{}'", other))),
        };
        let body = codec
            .decode(&record.value)
            .map_err(|e| corrupt(e.to_string()))?;

        let mut headers = HeaderMap::new();
        if let Some(content_type) = &record.content_type {
            let value = HeaderValue::from_str(content_type)
                .map_err(|_| corrupt(format!("invalid content type '{}'", content_type)))?;
            headers.insert(header::CONTENT_TYPE, value);
        }

        Ok(HandlerOutcome {
            status,
            headers,
            body,
        })
    }
}
