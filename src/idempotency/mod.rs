pub mod capture;
pub mod codec;
pub mod gate;
pub mod handler;
pub mod identifier;
pub mod key_generator;
pub mod middleware;
pub mod replay;
pub mod storage;

pub use capture::{CapturedOutcome, HandlerOutcome, ResponseCapture, UncachedReason};
pub use codec::{Base64Codec, CodecError, JsonCodec, PayloadCodec, TextCodec};
pub use gate::{DistributedLock, ExecutionGate, GateDecision, LeaseGuard, LeaseWaiter, WaitOutcome};
pub use handler::{
    IdempotencyCleanupJob, IdempotencyConfig, IdempotencyMetrics, IdempotencyOrchestrator,
    MetricsSnapshot, Resolution, StoreFailurePolicy, WaitTimeoutPolicy,
};
pub use identifier::{IdentifierExtractor, RequestIdentifier, DEFAULT_IDENTIFIER_HEADER};
pub use key_generator::{CacheKey, CacheKeyBuilder, EndpointIdentity, KeyGeneratorConfig, KeyScope};
pub use middleware::{idempotency_middleware, IdempotencyLayerState, REPLAYED_HEADER};
pub use replay::ReplayEngine;
pub use storage::{HybridIdempotencyStore, IdempotencyRecord, IdempotencyStore};
