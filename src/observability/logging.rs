use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};
use uuid::Uuid;

use crate::config::ApplicationSettings;
use crate::error::{AppError, Result};

/// Characters kept at each end of a masked identifier.
const VISIBLE_CHARS: usize = 4;

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
    pub include_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
            include_location: false,
        }
    }
}

impl From<&ApplicationSettings> for LogConfig {
    fn from(settings: &ApplicationSettings) -> Self {
        Self {
            level: settings.log_level.clone(),
            format: LogFormat::from(settings.log_format.as_str()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    /// One JSON object per event, with closed-span timings for request tracing.
    Json,
    Compact,
}

impl From<&str> for LogFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

impl LogConfig {
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let layer = fmt::layer()
            .with_target(self.include_target)
            .with_file(self.include_location)
            .with_line_number(self.include_location);

        match self.format {
            LogFormat::Json => layer.json().with_span_events(FmtSpan::CLOSE).boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Pretty => layer.pretty().boxed(),
        }
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(config.env_filter())
        .try_init()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to initialize logging: {}", e)))?;

    tracing::info!(format = ?config.format, "Logging initialized with level: {}", config.level);
    Ok(())
}

/// Keeps `visible_chars` at each end of `value` and stars out the rest.
pub fn mask_sensitive(value: &str, visible_chars: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= visible_chars * 2 {
        return "*".repeat(chars.len());
    }

    let hidden = chars.len() - visible_chars * 2;
    let prefix: String = chars[..visible_chars].iter().collect();
    let suffix: String = chars[chars.len() - visible_chars..].iter().collect();
    format!("{}{}{}", prefix, "*".repeat(hidden), suffix)
}

/// Request identifiers are never logged in full.
pub fn mask_uuid(uuid: &Uuid) -> String {
    mask_sensitive(&uuid.hyphenated().to_string(), VISIBLE_CHARS)
}

/// Masks the identifier segment of a store key; the prefix and endpoint stay readable.
///
/// Hashed or otherwise opaque trailing segments are masked the same way as UUIDs.
pub fn mask_key(key: &str) -> String {
    let Some((scope, identifier)) = key.rsplit_once(':') else {
        return mask_sensitive(key, VISIBLE_CHARS);
    };

    let masked = match Uuid::parse_str(identifier) {
        Ok(uuid) => mask_uuid(&uuid),
        Err(_) => mask_sensitive(identifier, VISIBLE_CHARS),
    };
    format!("{}:{}", scope, masked)
}
