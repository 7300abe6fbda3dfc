use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::key_generator::CacheKey;
use crate::error::Result;

/// Cross-instance lease used when several gateway instances share one store.
///
/// `try_acquire` must be a single atomic set-if-absent with expiry, and `release`
/// must only delete the lease while it still carries `token`.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn try_acquire(&self, lease_key: &str, token: &str, ttl: Duration) -> Result<bool>;

    async fn release(&self, lease_key: &str, token: &str) -> Result<()>;
}

struct Lease {
    id: u64,
    // Never sent on. Dropping it wakes every subscribed waiter.
    released: watch::Sender<()>,
}

/// Single-flight coordinator: at most one admitted execution per key in this process.
///
/// Admission is a single check-and-insert on the key's map shard, so two callers can
/// never both observe a free key. The lease lives as long as the returned
/// [`LeaseGuard`], which means it is released on every exit path, including a
/// cancelled request future.
#[derive(Clone, Default)]
pub struct ExecutionGate {
    leases: Arc<DashMap<String, Lease>>,
    next_id: Arc<AtomicU64>,
}

/// Result of asking the gate for a key.
pub enum GateDecision {
    /// No execution was in flight; the caller now owns the lease.
    Admitted(LeaseGuard),
    /// Another execution holds the lease.
    Wait(LeaseWaiter),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Released,
    TimedOut,
}

impl ExecutionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: &CacheKey) -> GateDecision {
        match self.leases.entry(key.as_str().to_string()) {
            Entry::Occupied(entry) => GateDecision::Wait(LeaseWaiter {
                released: entry.get().released.subscribe(),
            }),
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (released, _) = watch::channel(());
                entry.insert(Lease { id, released });
                GateDecision::Admitted(LeaseGuard {
                    leases: Arc::clone(&self.leases),
                    key: key.as_str().to_string(),
                    id,
                })
            }
        }
    }

    /// Number of keys with an execution in flight.
    pub fn in_flight(&self) -> usize {
        self.leases.len()
    }

    pub fn is_leased(&self, key: &CacheKey) -> bool {
        self.leases.contains_key(key.as_str())
    }
}

impl std::fmt::Debug for ExecutionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionGate")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Ownership of a key's lease. Dropping it releases the key.
pub struct LeaseGuard {
    leases: Arc<DashMap<String, Lease>>,
    key: String,
    id: u64,
}

impl LeaseGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn release(self) {}
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let id = self.id;
        self.leases.remove_if(&self.key, |_, lease| lease.id == id);
    }
}

/// Handle for waiting on another caller's lease.
pub struct LeaseWaiter {
    released: watch::Receiver<()>,
}

impl LeaseWaiter {
    pub async fn wait(mut self, timeout: Duration) -> WaitOutcome {
        match tokio::time::timeout(timeout, self.released.changed()).await {
            Ok(_) => WaitOutcome::Released,
            Err(_) => WaitOutcome::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> CacheKey {
        CacheKey::from_raw(raw)
    }

    #[tokio::test]
    async fn test_first_caller_admitted_second_waits() {
        let gate = ExecutionGate::new();
        let k = key("idem:a");

        let guard = match gate.acquire(&k) {
            GateDecision::Admitted(guard) => guard,
            GateDecision::Wait(_) => panic!("first caller must be admitted"),
        };
        assert!(gate.is_leased(&k));
        assert_eq!(guard.key(), "idem:a");
        assert!(matches!(gate.acquire(&k), GateDecision::Wait(_)));

        // other keys are independent
        assert!(matches!(gate.acquire(&key("idem:b")), GateDecision::Admitted(_)));
    }

    #[tokio::test]
    async fn test_drop_releases_and_wakes_waiter() {
        let gate = ExecutionGate::new();
        let k = key("idem:a");

        let GateDecision::Admitted(guard) = gate.acquire(&k) else {
            panic!("expected admission");
        };
        let GateDecision::Wait(waiter) = gate.acquire(&k) else {
            panic!("expected wait");
        };

        let handle = tokio::spawn(waiter.wait(Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);

        assert_eq!(handle.await.unwrap(), WaitOutcome::Released);
        assert_eq!(gate.in_flight(), 0);
        assert!(matches!(gate.acquire(&k), GateDecision::Admitted(_)));
    }

    #[tokio::test]
    async fn test_wait_times_out_while_lease_held() {
        let gate = ExecutionGate::new();
        let k = key("idem:a");

        let GateDecision::Admitted(_guard) = gate.acquire(&k) else {
            panic!("expected admission");
        };
        let GateDecision::Wait(waiter) = gate.acquire(&k) else {
            panic!("expected wait");
        };

        assert_eq!(
            waiter.wait(Duration::from_millis(20)).await,
            WaitOutcome::TimedOut
        );
        assert!(gate.is_leased(&k));
    }

    #[tokio::test]
    async fn test_failed_holder_does_not_block_key() {
        let gate = ExecutionGate::new();
        let k = key("idem:a");

        let result = tokio::spawn({
            let gate = gate.clone();
            let k = k.clone();
            async move {
                let GateDecision::Admitted(_guard) = gate.acquire(&k) else {
                    return Err("not admitted");
                };
                Err::<(), _>("handler failed")
            }
        })
        .await
        .unwrap();

        assert_eq!(result, Err("handler failed"));
        assert!(!gate.is_leased(&k));
        assert!(matches!(gate.acquire(&k), GateDecision::Admitted(_)));
    }

    #[tokio::test]
    async fn test_cancelled_holder_releases_lease() {
        let gate = ExecutionGate::new();
        let k = key("idem:a");

        let task = tokio::spawn({
            let gate = gate.clone();
            let k = k.clone();
            async move {
                let _lease = gate.acquire(&k);
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(gate.is_leased(&k));

        task.abort();
        let _ = task.await;
        assert!(!gate.is_leased(&k));
    }
}
