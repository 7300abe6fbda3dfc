use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::de::IgnoredAny;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{codec} codec: {reason}")]
pub struct CodecError {
    pub codec: &'static str,
    pub reason: String,
}

/// Converts response payloads to and from the opaque `value` stored in a record.
pub trait PayloadCodec: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn encode(&self, body: &[u8]) -> Result<String, CodecError>;

    fn decode(&self, value: &str) -> Result<Bytes, CodecError>;
}

/// Stores any body byte-for-byte as standard base64. The default codec, and the
/// fallback for bodies a narrower codec refuses.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Codec;

impl Base64Codec {
    pub const NAME: &'static str = "base64";

    pub fn encode_bytes(body: &[u8]) -> String {
        STANDARD.encode(body)
    }
}

impl PayloadCodec for Base64Codec {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn encode(&self, body: &[u8]) -> Result<String, CodecError> {
        Ok(Self::encode_bytes(body))
    }

    fn decode(&self, value: &str) -> Result<Bytes, CodecError> {
        STANDARD
            .decode(value)
            .map(Bytes::from)
            .map_err(|e| CodecError {
                codec: self.name(),
                reason: e.to_string(),
            })
    }
}

/// Stores JSON bodies verbatim after checking they parse. Empty bodies pass through.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    fn validate(&self, raw: &[u8]) -> Result<(), CodecError> {
        if raw.is_empty() {
            return Ok(());
        }
        serde_json::from_slice::<IgnoredAny>(raw)
            .map(|_| ())
            .map_err(|e| CodecError {
                codec: self.name(),
                reason: e.to_string(),
            })
    }
}

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, body: &[u8]) -> Result<String, CodecError> {
        self.validate(body)?;
        String::from_utf8(body.to_vec()).map_err(|e| CodecError {
            codec: self.name(),
            reason: e.to_string(),
        })
    }

    fn decode(&self, value: &str) -> Result<Bytes, CodecError> {
        self.validate(value.as_bytes())?;
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }
}

/// Stores any UTF-8 body as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl PayloadCodec for TextCodec {
    fn name(&self) -> &'static str {
        "text"
    }

    fn encode(&self, body: &[u8]) -> Result<String, CodecError> {
        std::str::from_utf8(body)
            .map(str::to_owned)
            .map_err(|e| CodecError {
                codec: self.name(),
                reason: e.to_string(),
            })
    }

    fn decode(&self, value: &str) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_codec_keeps_arbitrary_bytes() {
        let body: &[u8] = &[0xff, 0x00, b'o', b'k', 0xfe];
        let encoded = Base64Codec.encode(body).unwrap();
        assert_eq!(encoded, "/wBva/4=");
        assert_eq!(Base64Codec.decode(&encoded).unwrap().as_ref(), body);

        assert_eq!(Base64Codec.encode(b"").unwrap(), "");
        assert!(Base64Codec.decode("{\"a\":").is_err());
    }

    #[test]
    fn test_json_codec_keeps_bytes_verbatim() {
        let body = br#"{ "b": 2,  "a": 1 }"#;
        let encoded = JsonCodec.encode(body).unwrap();
        assert_eq!(JsonCodec.decode(&encoded).unwrap().as_ref(), body);
    }

    #[test]
    fn test_json_codec_rejects_non_json() {
        assert!(JsonCodec.encode(b"<html></html>").is_err());
        assert!(JsonCodec.decode("{\"a\":").is_err());
    }

    #[test]
    fn test_json_codec_allows_empty_body() {
        assert_eq!(JsonCodec.encode(b"").unwrap(), "");
        assert!(JsonCodec.decode("").unwrap().is_empty());
    }

    #[test]
    fn test_text_codec() {
        assert_eq!(TextCodec.encode(b"plain text").unwrap(), "plain text");
        assert!(TextCodec.encode(&[0xff, 0xfe]).is_err());
        assert_eq!(TextCodec.decode("x").unwrap(), Bytes::from_static(b"x"));
    }
}
