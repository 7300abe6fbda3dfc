use http::{HeaderMap, HeaderName};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::observability::mask_uuid;

/// Default transport field carrying the caller's request identifier.
pub const DEFAULT_IDENTIFIER_HEADER: &str = "Idempotency-Key";

/// Caller-supplied identifier of a logical operation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestIdentifier(Uuid);

impl RequestIdentifier {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Form safe to put in logs.
    pub fn masked(&self) -> String {
        mask_uuid(&self.0)
    }
}

impl fmt::Display for RequestIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Hyphenated lowercase, whatever casing the caller used.
        write!(f, "{}", self.0.hyphenated())
    }
}

impl From<Uuid> for RequestIdentifier {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Pulls the request identifier out of a single designated header.
#[derive(Debug, Clone)]
pub struct IdentifierExtractor {
    header: HeaderName,
}

impl IdentifierExtractor {
    pub fn new(header_name: &str) -> Result<Self> {
        let header = HeaderName::try_from(header_name).map_err(|e| {
            AppError::Config(format!("Invalid identifier header name '{}': {}", header_name, e))
        })?;
        Ok(Self { header })
    }

    pub fn header_name(&self) -> &HeaderName {
        &self.header
    }

    pub fn extract(&self, headers: &HeaderMap) -> Result<RequestIdentifier> {
        let raw = headers
            .get(&self.header)
            .ok_or_else(|| AppError::MissingIdentifier {
                header: self.header.to_string(),
            })?;

        let value = raw.to_str().map_err(|_| AppError::InvalidIdentifier {
            header: self.header.to_string(),
            value: String::from_utf8_lossy(raw.as_bytes()).into_owned(),
        })?;

        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(AppError::MissingIdentifier {
                header: self.header.to_string(),
            });
        }

        Uuid::parse_str(trimmed)
            .map(RequestIdentifier)
            .map_err(|_| AppError::InvalidIdentifier {
                header: self.header.to_string(),
                value: trimmed.to_string(),
            })
    }
}

impl Default for IdentifierExtractor {
    fn default() -> Self {
        Self {
            header: HeaderName::from_static("idempotency-key"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("idempotency-key", HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_extracts_valid_uuid() {
        let extractor = IdentifierExtractor::default();
        let id = extractor
            .extract(&headers_with("3fa85f64-5717-4562-b3fc-2c963f66afa6"))
            .unwrap();
        assert_eq!(id.to_string(), "3fa85f64-5717-4562-b3fc-2c963f66afa6");
    }

    #[test]
    fn test_uppercase_uuid_normalizes() {
        let extractor = IdentifierExtractor::default();
        let id = extractor
            .extract(&headers_with("3FA85F64-5717-4562-B3FC-2C963F66AFA6"))
            .unwrap();
        assert_eq!(id.to_string(), "3fa85f64-5717-4562-b3fc-2c963f66afa6");
    }

    #[test]
    fn test_masked_form_hides_the_middle() {
        let id = IdentifierExtractor::default()
            .extract(&headers_with("3FA85F64-5717-4562-B3FC-2C963F66AFA6"))
            .unwrap();
        let masked = id.masked();
        assert!(masked.starts_with("3fa8"));
        assert!(masked.ends_with("afa6"));
        assert!(!masked.contains("5717"));
    }

    #[test]
    fn test_missing_header() {
        let extractor = IdentifierExtractor::default();
        let err = extractor.extract(&HeaderMap::new()).unwrap_err();
        assert!(matches!(err, AppError::MissingIdentifier { .. }));
    }

    #[test]
    fn test_blank_header_is_missing() {
        let extractor = IdentifierExtractor::default();
        let err = extractor.extract(&headers_with("   ")).unwrap_err();
        assert!(matches!(err, AppError::MissingIdentifier { .. }));
    }

    #[test]
    fn test_malformed_uuid() {
        let extractor = IdentifierExtractor::default();
        let err = extractor.extract(&headers_with("order-42")).unwrap_err();
        match err {
            AppError::InvalidIdentifier { value, .. } => assert_eq!(value, "order-42"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_custom_header_name() {
        let extractor = IdentifierExtractor::new("X-Request-Id").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-request-id",
            HeaderValue::from_static("550e8400-e29b-41d4-a716-446655440000"),
        );
        assert!(extractor.extract(&headers).is_ok());
        assert!(extractor.extract(&headers_with("550e8400-e29b-41d4-a716-446655440000")).is_err());
    }

    #[test]
    fn test_invalid_header_name_rejected() {
        assert!(IdentifierExtractor::new("bad header").is_err());
    }
}
