//! # JobStore
//!
//! Durable storage for job records. Every state transition in the queue is built on top of a
//! single primitive, `conditional_update`, which applies a change to a job only if it still
//! matches an `Expected` precondition. Stores must apply it atomically per job, but may allow
//! full concurrency across different jobs and queues.
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageResult;
use crate::types::{Expected, Job, JobId, JobUpdate, NewJob, QueueStats};

mod memory;
mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Durably write a new pending job and return its id. A failed insert writes nothing.
    async fn insert(&self, job: NewJob) -> StorageResult<JobId>;

    /// Fetch a job by id.
    async fn get(&self, id: JobId) -> StorageResult<Option<Job>>;

    /// Return the oldest job in `queue_name` that can be claimed at `now`: either pending, or
    /// processing with a lease that expired. Ordered by `created_at`, ties broken by `id`.
    async fn find_claimable(&self, queue_name: &str, now: DateTime<Utc>)
        -> StorageResult<Option<Job>>;

    /// Apply `update` to job `id` only if it currently matches `expected`.
    /// Returns false, and changes nothing, if another actor changed the job first.
    async fn conditional_update(
        &self,
        id: JobId,
        expected: &Expected,
        update: JobUpdate,
    ) -> StorageResult<bool>;

    /// Count the jobs of `queue_name` in every status.
    async fn stats(&self, queue_name: &str) -> StorageResult<QueueStats>;
}
