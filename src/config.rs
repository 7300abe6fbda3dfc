use serde::Deserialize;
use validator::{Validate, ValidationError};

use crate::error::{AppError, Result};
use crate::idempotency::{KeyScope, StoreFailurePolicy, WaitTimeoutPolicy};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Settings {
    #[validate]
    pub application: ApplicationSettings,
    #[serde(default)]
    pub redis: RedisSettings,
    #[validate]
    #[serde(default)]
    pub idempotency: IdempotencySettings,
    #[validate]
    #[serde(default)]
    pub local_cache: LocalCacheSettings,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ApplicationSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub url: String,
    pub enabled: bool,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            enabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_lease_bounds"))]
pub struct IdempotencySettings {
    #[validate(length(min = 1))]
    pub header_name: String,
    #[validate(range(min = 1))]
    pub ttl_secs: u64,
    #[validate(length(min = 1))]
    pub key_prefix: String,
    pub key_scope: KeyScope,
    pub hash_endpoint: bool,
    #[validate(range(min = 1))]
    pub wait_timeout_ms: u64,
    #[validate(range(min = 1, max = 10))]
    pub max_wait_rounds: u32,
    pub on_wait_timeout: WaitTimeoutPolicy,
    pub store_failure_policy: StoreFailurePolicy,
    /// Required, and below `lock_ttl_ms`, when `distributed_lock` is on.
    pub execution_timeout_ms: Option<u64>,
    /// Unset stores bodies of any size.
    pub max_cached_body_bytes: Option<usize>,
    pub mark_replays: bool,
    pub distributed_lock: bool,
    #[validate(range(min = 100))]
    pub lock_ttl_ms: u64,
    #[validate(range(min = 1))]
    pub lock_poll_interval_ms: u64,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            header_name: "Idempotency-Key".to_string(),
            ttl_secs: 3600,
            key_prefix: "idem".to_string(),
            key_scope: KeyScope::Endpoint,
            hash_endpoint: false,
            wait_timeout_ms: 5000,
            max_wait_rounds: 2,
            on_wait_timeout: WaitTimeoutPolicy::Conflict,
            store_failure_policy: StoreFailurePolicy::FailOpen,
            execution_timeout_ms: None,
            max_cached_body_bytes: None,
            mark_replays: false,
            distributed_lock: false,
            lock_ttl_ms: 30_000,
            lock_poll_interval_ms: 50,
        }
    }
}

/// A distributed lease must outlive the handler holding it.
fn validate_lease_bounds(settings: &IdempotencySettings) -> std::result::Result<(), ValidationError> {
    if !settings.distributed_lock {
        return Ok(());
    }
    match settings.execution_timeout_ms {
        Some(timeout) if timeout < settings.lock_ttl_ms => Ok(()),
        _ => {
            let mut error = ValidationError::new("execution_timeout_exceeds_lock_ttl");
            error.message = Some("distributed_lock requires execution_timeout_ms below lock_ttl_ms".into());
            Err(error)
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct LocalCacheSettings {
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub max_entries: usize,
    #[validate(range(min = 1))]
    pub ttl_secs: u64,
    #[validate(range(min = 1))]
    pub cleanup_interval_secs: u64,
}

impl Default for LocalCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            ttl_secs: 60,
            cleanup_interval_secs: 30,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Settings {
    pub fn new() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        let settings: Settings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| AppError::Config(e.to_string()))?;

        settings
            .validate()
            .map_err(|e| AppError::Config(e.to_string()))?;

        Ok(settings)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.application.host, self.application.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_defaults() {
        let settings = IdempotencySettings::default();
        assert_eq!(settings.header_name, "Idempotency-Key");
        assert_eq!(settings.ttl_secs, 3600);
        assert_eq!(settings.key_scope, KeyScope::Endpoint);
        assert_eq!(settings.on_wait_timeout, WaitTimeoutPolicy::Conflict);
        assert_eq!(settings.store_failure_policy, StoreFailurePolicy::FailOpen);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let settings = IdempotencySettings {
            ttl_secs: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_distributed_lock_requires_bounded_execution() {
        let unbounded = IdempotencySettings {
            distributed_lock: true,
            ..Default::default()
        };
        assert!(unbounded.validate().is_err());

        let too_long = IdempotencySettings {
            distributed_lock: true,
            execution_timeout_ms: Some(30_000),
            lock_ttl_ms: 30_000,
            ..Default::default()
        };
        assert!(too_long.validate().is_err());

        let bounded = IdempotencySettings {
            distributed_lock: true,
            execution_timeout_ms: Some(10_000),
            ..Default::default()
        };
        assert!(bounded.validate().is_ok());
    }

    #[test]
    fn test_settings_from_toml_source() {
        let raw = r#"
            [application]
            port = 8080

            [idempotency]
            ttl_secs = 120
            key_scope = "global"
            store_failure_policy = "fail_closed"
            on_wait_timeout = "execute"
        "#;

        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.application.port, 8080);
        assert_eq!(settings.application.host, "0.0.0.0");
        assert_eq!(settings.idempotency.ttl_secs, 120);
        assert_eq!(settings.idempotency.key_scope, KeyScope::Global);
        assert_eq!(
            settings.idempotency.store_failure_policy,
            StoreFailurePolicy::FailClosed
        );
        assert_eq!(settings.idempotency.on_wait_timeout, WaitTimeoutPolicy::Execute);
        assert_eq!(settings.idempotency.header_name, "Idempotency-Key");
        assert!(!settings.redis.enabled);
        assert!(settings.local_cache.enabled);
        assert_eq!(settings.bind_address(), "0.0.0.0:8080");
    }
}
