use http::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::identifier::RequestIdentifier;

/// How far a caller-chosen identifier is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScope {
    /// Keys are namespaced by endpoint; the same identifier on two endpoints never collides.
    Endpoint,
    /// Keys depend on the identifier alone and are shared across every endpoint.
    Global,
}

/// Configuration for store key derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyGeneratorConfig {
    /// Prefix for generated keys
    pub key_prefix: String,
    pub scope: KeyScope,
    /// Replace the endpoint identity with its SHA-256 digest
    pub hash_endpoint: bool,
}

impl Default for KeyGeneratorConfig {
    fn default() -> Self {
        Self {
            key_prefix: "idem".to_string(),
            scope: KeyScope::Endpoint,
            hash_endpoint: false,
        }
    }
}

/// Identity of the endpoint a request targets: method plus route template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointIdentity {
    method: Method,
    route: String,
}

impl EndpointIdentity {
    pub fn new(method: Method, route: impl Into<String>) -> Self {
        let route = route.into();
        let trimmed = route.trim_end_matches('/');
        let route = if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        };
        Self { method, route }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn route(&self) -> &str {
        &self.route
    }
}

impl fmt::Display for EndpointIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.route)
    }
}

/// Store key for one (endpoint, identifier) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wraps a key produced outside the builder, e.g. one listed from a store.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    /// Key of the distributed lease guarding this key.
    pub fn lease_key(&self) -> String {
        format!("{}:lease", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derives deterministic store keys from request identifiers.
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    config: KeyGeneratorConfig,
}

impl CacheKeyBuilder {
    pub fn new(config: KeyGeneratorConfig) -> Self {
        Self { config }
    }

    pub fn with_default_config() -> Self {
        Self::new(KeyGeneratorConfig::default())
    }

    pub fn scope(&self) -> KeyScope {
        self.config.scope
    }

    /// Builds the key for `identifier` as seen by `endpoint`.
    pub fn build(&self, identifier: &RequestIdentifier, endpoint: &EndpointIdentity) -> CacheKey {
        match self.config.scope {
            KeyScope::Global => CacheKey(format!("{}:{}", self.config.key_prefix, identifier)),
            KeyScope::Endpoint => {
                let endpoint = if self.config.hash_endpoint {
                    let mut hasher = Sha256::new();
                    hasher.update(endpoint.method.as_str().as_bytes());
                    hasher.update(b"|");
                    hasher.update(endpoint.route.as_bytes());
                    hex::encode(hasher.finalize())
                } else {
                    endpoint.to_string()
                };
                CacheKey(format!(
                    "{}:{}:{}",
                    self.config.key_prefix, endpoint, identifier
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn identifier() -> RequestIdentifier {
        RequestIdentifier::new(Uuid::parse_str("3fa85f64-5717-4562-b3fc-2c963f66afa6").unwrap())
    }

    #[test]
    fn test_key_generation_consistency() {
        let builder = CacheKeyBuilder::with_default_config();
        let endpoint = EndpointIdentity::new(Method::POST, "/orders");

        let key1 = builder.build(&identifier(), &endpoint);
        let key2 = builder.build(&identifier(), &endpoint);

        assert_eq!(key1, key2);
        assert_eq!(
            key1.as_str(),
            "idem:POST /orders:3fa85f64-5717-4562-b3fc-2c963f66afa6"
        );
    }

    #[test]
    fn test_different_endpoints_do_not_collide() {
        let builder = CacheKeyBuilder::with_default_config();

        let orders = builder.build(&identifier(), &EndpointIdentity::new(Method::POST, "/orders"));
        let refunds = builder.build(&identifier(), &EndpointIdentity::new(Method::POST, "/refunds"));
        let put_orders = builder.build(&identifier(), &EndpointIdentity::new(Method::PUT, "/orders"));

        assert_ne!(orders, refunds);
        assert_ne!(orders, put_orders);
    }

    #[test]
    fn test_global_scope_shares_keys() {
        let builder = CacheKeyBuilder::new(KeyGeneratorConfig {
            key_prefix: "test".to_string(),
            scope: KeyScope::Global,
            hash_endpoint: false,
        });

        let orders = builder.build(&identifier(), &EndpointIdentity::new(Method::POST, "/orders"));
        let refunds = builder.build(&identifier(), &EndpointIdentity::new(Method::POST, "/refunds"));

        assert_eq!(orders, refunds);
        assert_eq!(orders.as_str(), "test:3fa85f64-5717-4562-b3fc-2c963f66afa6");
    }

    #[test]
    fn test_hashed_endpoint() {
        let builder = CacheKeyBuilder::new(KeyGeneratorConfig {
            key_prefix: "idem".to_string(),
            scope: KeyScope::Endpoint,
            hash_endpoint: true,
        });

        let key = builder.build(&identifier(), &EndpointIdentity::new(Method::POST, "/orders"));
        let parts: Vec<&str> = key.as_str().split(':').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].len(), 64);
        assert!(parts[1].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_trailing_slash_is_ignored() {
        assert_eq!(
            EndpointIdentity::new(Method::POST, "/orders/"),
            EndpointIdentity::new(Method::POST, "/orders")
        );
        assert_eq!(EndpointIdentity::new(Method::GET, "/").route(), "/");
    }

    #[test]
    fn test_lease_key() {
        let builder = CacheKeyBuilder::with_default_config();
        let key = builder.build(&identifier(), &EndpointIdentity::new(Method::POST, "/orders"));
        assert_eq!(key.lease_key(), format!("{}:lease", key));
    }
}
