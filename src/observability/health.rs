use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::idempotency::{ExecutionGate, IdempotencyStore};

/// Ordered from best to worst so the overall status is the maximum of its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DependencyHealth {
    fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            latency_ms: None,
            detail: None,
        }
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(latency.as_secs_f64() * 1000.0);
        self
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedHealth {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: Vec<DependencyHealth>,
}

impl AggregatedHealth {
    pub fn new(version: String, uptime_seconds: u64, dependencies: Vec<DependencyHealth>) -> Self {
        let status = dependencies
            .iter()
            .map(|d| d.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            status,
            version,
            uptime_seconds,
            dependencies,
        }
    }
}

/// Where the store ping and the gate backlog turn from healthy to degraded.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    /// A store ping slower than this is degraded.
    pub slow_store: Duration,
    /// A store ping that has not answered by now is unhealthy.
    pub store_timeout: Duration,
    /// More executions in flight than this means duplicates are piling up behind leases.
    pub in_flight_backlog: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            slow_store: Duration::from_millis(50),
            store_timeout: Duration::from_secs(5),
            in_flight_backlog: 1_000,
        }
    }
}

/// Reports on the record store and the execution gate behind the idempotency layer.
pub struct HealthChecker {
    store: Arc<dyn IdempotencyStore>,
    gate: ExecutionGate,
    thresholds: HealthThresholds,
    started: Instant,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn IdempotencyStore>, gate: ExecutionGate) -> Self {
        Self {
            store,
            gate,
            thresholds: HealthThresholds::default(),
            started: Instant::now(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub async fn check_all(&self) -> AggregatedHealth {
        let dependencies = vec![self.check_store().await, self.check_gate()];
        AggregatedHealth::new(
            env!("CARGO_PKG_VERSION").to_string(),
            self.uptime_seconds(),
            dependencies,
        )
    }

    /// Pings every configured store tier.
    pub async fn check_store(&self) -> DependencyHealth {
        let name = format!("store:{}", self.store.name());
        let started = Instant::now();

        match tokio::time::timeout(self.thresholds.store_timeout, self.store.ping()).await {
            Ok(Ok(())) => {
                let latency = started.elapsed();
                if latency > self.thresholds.slow_store {
                    DependencyHealth::new(name, HealthStatus::Degraded)
                        .with_latency(latency)
                        .with_detail("slow ping, lookups add latency to every request")
                } else {
                    DependencyHealth::new(name, HealthStatus::Healthy).with_latency(latency)
                }
            }
            Ok(Err(e)) => DependencyHealth::new(name, HealthStatus::Unhealthy)
                .with_detail(format!("ping failed: {}", e)),
            Err(_) => DependencyHealth::new(name, HealthStatus::Unhealthy)
                .with_detail(format!("no ping reply within {:?}", self.thresholds.store_timeout)),
        }
    }

    /// The gate is in-process; it degrades only when executions back up.
    pub fn check_gate(&self) -> DependencyHealth {
        let in_flight = self.gate.in_flight();
        let status = if in_flight > self.thresholds.in_flight_backlog {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        DependencyHealth::new("execution_gate", status).with_detail(format!("{} in-flight leases", in_flight))
    }

    /// Ready once the store answers, even slowly.
    pub async fn is_ready(&self) -> bool {
        !self.check_store().await.status.is_unhealthy()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}
