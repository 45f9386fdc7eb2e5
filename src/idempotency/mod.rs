pub mod activation;
pub mod coordinator;
pub mod middleware;
pub mod outcome;
pub mod redis_store;
pub mod request;
pub mod specification;
pub mod storage;

pub use activation::{ActivationPredicate, ActivationStrategy};
pub use coordinator::{
    CoordinatorConfig, CoordinatorError, DownstreamError, IdempotencyCoordinator, IdempotencyMetrics,
    MetricsSnapshot,
};
pub use middleware::idempotency_middleware;
pub use outcome::{IdempotencyOutcome, IdempotencyStatus, Rejection, IDEMPOTENCY_STATUS_HEADER};
pub use redis_store::RedisIdempotencyStore;
pub use request::{IdempotentRequest, StoredResponse};
pub use specification::{
    DefaultSpecification, Fingerprint, IdempotencySpecification, LookupKey, SpecificationConfig,
    IDEMPOTENCY_KEY_HEADER,
};
pub use storage::{
    lock_stamp, IdempotencyStore, IdempotentRequestRecord, MemoryIdempotencyStore, PurgeJob,
    StorageError, StorageResult,
};
