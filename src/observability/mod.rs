pub mod logging;
pub mod metrics;
pub mod health;

pub use logging::{init_logging, LogConfig, LogFormat, mask_key, mask_sensitive, mask_uuid};
pub use metrics::{init_metrics, get_metrics, Metrics, LatencyTimer, METRICS};
pub use health::{AggregatedHealth, DependencyHealth, HealthChecker, HealthStatus, HealthThresholds};
