// Modules are kept private where we can, and the parts callers need re-exported, so internals
// can move around without breaking the public API

// Types
mod types;
pub use types::Expected;
pub use types::Job;
pub use types::JobId;
pub use types::JobRef;
pub use types::JobStatus;
pub use types::JobUpdate;
pub use types::NewJob;
pub use types::QueueStats;
pub use types::DEFAULT_MAX_ATTEMPTS;

// Errors
mod error;
pub use error::ParseError;
// Errors surfaced by the facade: storage faults and rejected arguments
pub use error::QueueError;
pub use error::QueueResult;
// Errors about the store itself - postgres/network faults, a poisoned in-memory store
pub use error::StorageError;
pub use error::StorageResult;

// Storage
pub mod store;
pub use store::JobStore;
pub use store::MemoryStore;
pub use store::PgStore;

// Claim protocol
mod lease;
pub use lease::{Claim, LeaseManager};
pub use lease::{DEFAULT_MAX_CLAIM_RETRIES, EXPIRED_ON_FINAL_ATTEMPT, MAX_LEASE_SECS};

// Retries
pub mod retry;
pub use retry::RetryDecision;
pub use retry::RetryPolicy;

// Facade
mod queue;
pub use queue::FailOutcome;
pub use queue::Operation;
pub use queue::OperationOutput;
pub use queue::Queue;

pub mod health;
pub mod metrics;
pub mod metrics_consts;
