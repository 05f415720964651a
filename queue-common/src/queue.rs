//! # Queue
//!
//! The public API producers and workers use. A `Queue` composes a `JobStore` with the claim
//! protocol of `LeaseManager` and the outcome handling of `RetryPolicy`.
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::error::{QueueError, QueueResult};
use crate::lease::{Claim, LeaseManager, MAX_LEASE_SECS};
use crate::metrics_consts::{
    JOBS_COMPLETED, JOBS_ENQUEUED, JOBS_FAILED, JOBS_RETRIED, LEASES_LOST,
};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::JobStore;
use crate::types::{
    Expected, Job, JobId, JobRef, JobStatus, NewJob, QueueStats, DEFAULT_MAX_ATTEMPTS,
};

/// What reporting a failed attempt did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to pending, claimable again from `not_before` (or immediately).
    Retried { not_before: Option<DateTime<Utc>> },
    /// That was the last attempt, the job is now failed.
    Failed,
    /// The reporter no longer held the lease, so nothing changed.
    LeaseLost,
}

/// The closed set of operations a `Queue` can execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Enqueue {
        queue_name: String,
        payload: Vec<u8>,
        max_attempts: i32,
    },
    Dequeue {
        queue_name: String,
        lease: Duration,
    },
    Complete {
        id: JobId,
    },
    Fail {
        id: JobId,
        error: String,
    },
    Stats {
        queue_name: String,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Enqueue { .. } => "enqueue",
            Operation::Dequeue { .. } => "dequeue",
            Operation::Complete { .. } => "complete",
            Operation::Fail { .. } => "fail",
            Operation::Stats { .. } => "stats",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    Enqueued(JobId),
    Dequeued(Option<JobRef>),
    Completed(bool),
    Failed(bool),
    Stats(QueueStats),
}

#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn JobStore>,
    retry_policy: RetryPolicy,
    lease_manager: LeaseManager,
}

impl Queue {
    /// A queue over `store` with immediate retries and the default claim retry bound.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            retry_policy: RetryPolicy::default(),
            lease_manager: LeaseManager::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_lease_manager(mut self, lease_manager: LeaseManager) -> Self {
        self.lease_manager = lease_manager;
        self
    }

    /// Enqueue a job that may be attempted up to `DEFAULT_MAX_ATTEMPTS` times.
    pub async fn enqueue(&self, queue_name: &str, payload: Vec<u8>) -> QueueResult<JobId> {
        self.enqueue_with_attempts(queue_name, payload, DEFAULT_MAX_ATTEMPTS)
            .await
    }

    pub async fn enqueue_with_attempts(
        &self,
        queue_name: &str,
        payload: Vec<u8>,
        max_attempts: i32,
    ) -> QueueResult<JobId> {
        validate_queue_name(queue_name)?;
        if max_attempts < 1 {
            return Err(QueueError::InvalidArgument(format!(
                "max_attempts must be at least 1, got {max_attempts}"
            )));
        }

        let id = self
            .store
            .insert(NewJob::new(queue_name, payload, max_attempts))
            .await?;

        metrics::counter!(JOBS_ENQUEUED, "queue" => queue_name.to_owned()).increment(1);
        debug!(job.id = id, queue_name, "enqueued job");

        Ok(id)
    }

    /// Claim the next job of `queue_name` for `lease`. `None` means there was nothing to claim.
    pub async fn dequeue(&self, queue_name: &str, lease: Duration) -> QueueResult<Option<JobRef>> {
        Ok(self.claim(queue_name, lease).await?.job)
    }

    /// Like `dequeue`, but also reports the jobs this poll failed because the lease on their
    /// final attempt expired.
    pub async fn claim(&self, queue_name: &str, lease: Duration) -> QueueResult<Claim> {
        validate_queue_name(queue_name)?;
        validate_lease(lease)?;

        Ok(self
            .lease_manager
            .claim(self.store.as_ref(), queue_name, Utc::now(), lease)
            .await?)
    }

    /// Mark a processing job as completed. Returns false if it isn't processing anymore,
    /// or never existed.
    pub async fn complete(&self, id: JobId) -> QueueResult<bool> {
        match self.store.get(id).await? {
            Some(job) if job.status == JobStatus::Processing => self.complete_job(&job).await,
            _ => Ok(false),
        }
    }

    /// Like `complete`, but only if `job_ref`'s claim is still the current one.
    pub async fn complete_claimed(&self, job_ref: &JobRef) -> QueueResult<bool> {
        match self.store.get(job_ref.id).await? {
            Some(job) if holds_claim(&job, job_ref) => self.complete_job(&job).await,
            _ => {
                self.lease_lost(job_ref);
                Ok(false)
            }
        }
    }

    /// Report a failed attempt of a processing job. Returns false if it isn't processing anymore,
    /// or never existed.
    pub async fn fail(&self, id: JobId, error: &str) -> QueueResult<bool> {
        let outcome = match self.store.get(id).await? {
            Some(job) if job.status == JobStatus::Processing => self.fail_job(&job, error).await?,
            _ => FailOutcome::LeaseLost,
        };

        Ok(outcome != FailOutcome::LeaseLost)
    }

    /// Like `fail`, but only if `job_ref`'s claim is still the current one.
    pub async fn fail_claimed(&self, job_ref: &JobRef, error: &str) -> QueueResult<FailOutcome> {
        let outcome = match self.store.get(job_ref.id).await? {
            Some(job) if holds_claim(&job, job_ref) => self.fail_job(&job, error).await?,
            _ => FailOutcome::LeaseLost,
        };

        if outcome == FailOutcome::LeaseLost {
            self.lease_lost(job_ref);
        }

        Ok(outcome)
    }

    /// Extend the lease on a claimed job. Returns false once the lease was lost.
    pub async fn heartbeat(&self, job_ref: &mut JobRef, lease: Duration) -> QueueResult<bool> {
        validate_lease(lease)?;

        Ok(self
            .lease_manager
            .renew(self.store.as_ref(), job_ref, Utc::now(), lease)
            .await?)
    }

    pub async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        Ok(self.store.get(id).await?)
    }

    pub async fn stats(&self, queue_name: &str) -> QueueResult<QueueStats> {
        validate_queue_name(queue_name)?;
        Ok(self.store.stats(queue_name).await?)
    }

    pub async fn execute(&self, operation: Operation) -> QueueResult<OperationOutput> {
        debug!(operation = operation.name(), "executing queue operation");

        match operation {
            Operation::Enqueue {
                queue_name,
                payload,
                max_attempts,
            } => self
                .enqueue_with_attempts(&queue_name, payload, max_attempts)
                .await
                .map(OperationOutput::Enqueued),
            Operation::Dequeue { queue_name, lease } => self
                .dequeue(&queue_name, lease)
                .await
                .map(OperationOutput::Dequeued),
            Operation::Complete { id } => self.complete(id).await.map(OperationOutput::Completed),
            Operation::Fail { id, error } => {
                self.fail(id, &error).await.map(OperationOutput::Failed)
            }
            Operation::Stats { queue_name } => {
                self.stats(&queue_name).await.map(OperationOutput::Stats)
            }
        }
    }

    async fn complete_job(&self, job: &Job) -> QueueResult<bool> {
        let update = self.retry_policy.on_success(Utc::now());
        let completed = self
            .store
            .conditional_update(job.id, &processing_version(job), update)
            .await?;

        if completed {
            metrics::counter!(JOBS_COMPLETED, "queue" => job.queue_name.clone()).increment(1);
        }

        Ok(completed)
    }

    async fn fail_job(&self, job: &Job, error: &str) -> QueueResult<FailOutcome> {
        let (decision, update) = self.retry_policy.on_failure(job, error, Utc::now());
        let applied = self
            .store
            .conditional_update(job.id, &processing_version(job), update)
            .await?;

        if !applied {
            return Ok(FailOutcome::LeaseLost);
        }

        let labels = [("queue", job.queue_name.clone())];
        match decision {
            RetryDecision::Requeue { not_before } => {
                metrics::counter!(JOBS_RETRIED, &labels).increment(1);
                debug!(job.id, job.attempts, "requeued failed job");
                Ok(FailOutcome::Retried { not_before })
            }
            RetryDecision::TerminalFail => {
                metrics::counter!(JOBS_FAILED, &labels).increment(1);
                warn!(job.id, job.attempts, error, "job failed after its last attempt");
                Ok(FailOutcome::Failed)
            }
        }
    }

    fn lease_lost(&self, job_ref: &JobRef) {
        metrics::counter!(LEASES_LOST, "queue" => job_ref.queue_name.clone()).increment(1);
        debug!(
            job.id = job_ref.id,
            job.attempts = job_ref.attempts,
            "discarding result of a claim that lost its lease"
        );
    }
}

/// Finalizing requires the job to still be processing under the claim we read.
fn processing_version(job: &Job) -> Expected {
    Expected::status(JobStatus::Processing).attempts(job.attempts)
}

fn holds_claim(job: &Job, job_ref: &JobRef) -> bool {
    job.status == JobStatus::Processing && job.attempts == job_ref.attempts
}

fn validate_queue_name(queue_name: &str) -> QueueResult<()> {
    if queue_name.is_empty() {
        return Err(QueueError::InvalidArgument(
            "queue_name must not be empty".to_owned(),
        ));
    }
    Ok(())
}

fn validate_lease(lease: Duration) -> QueueResult<()> {
    if lease <= Duration::zero() {
        return Err(QueueError::InvalidArgument(format!(
            "lease duration must be positive, got {lease}"
        )));
    }
    if lease > Duration::seconds(MAX_LEASE_SECS) {
        return Err(QueueError::InvalidArgument(format!(
            "lease duration must be at most {MAX_LEASE_SECS}s, got {lease}"
        )));
    }
    Ok(())
}
