use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Jobs are identified by a store-assigned, monotonically increasing id.
pub type JobId = i64;

/// Used when a caller doesn't ask for a specific number of attempts.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Enumeration of possible statuses for a Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
pub enum JobStatus {
    /// A job that is waiting in the queue to be claimed by a worker.
    Pending,
    /// A job that was claimed by a worker and is leased to it until `lease_expires_at`.
    Processing,
    /// A job that was successfully completed by a worker.
    Completed,
    /// A job whose last allowed attempt failed.
    Failed,
}

impl JobStatus {
    /// Completed and failed jobs never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allow casting JobStatus from strings.
impl FromStr for JobStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            invalid => Err(ParseError::ParseJobStatusError(invalid.to_owned())),
        }
    }
}

/// A Job as stored in a `JobStore`.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Job {
    /// A unique id identifying a job.
    pub id: JobId,
    /// The queue this job belongs to. Jobs in different queues are consumed independently.
    pub queue_name: String,
    /// Opaque job data, never interpreted by the queue.
    pub payload: Vec<u8>,
    /// The current status of the job.
    pub status: JobStatus,
    /// How many times a worker has claimed this job.
    pub attempts: i32,
    /// The maximum number of claims this job may receive.
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set iff the job is `Processing`.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Set once the job has completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// The error reported by the most recent failed attempt.
    pub last_error: Option<String>,
    /// A requeued job is not claimable before this instant, when retry backoff is in use.
    pub not_before: Option<DateTime<Utc>>,
}

impl Job {
    /// Return true if this job used up all of its allowed attempts.
    pub fn is_gte_max_attempts(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => self.not_before.map_or(true, |not_before| not_before <= now),
            JobStatus::Processing => self
                .lease_expires_at
                .is_some_and(|expires_at| expires_at <= now),
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }
}

/// A NewJob to be inserted into a `JobStore`.
/// We take ownership of `NewJob` on insert to enforce a specific `NewJob` is only enqueued once.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue_name: String,
    pub payload: Vec<u8>,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
}

impl NewJob {
    pub fn new(queue_name: &str, payload: Vec<u8>, max_attempts: i32) -> Self {
        Self {
            queue_name: queue_name.to_owned(),
            payload,
            max_attempts,
            created_at: Utc::now(),
        }
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// The record a store should persist for this job.
    pub fn into_job(self, id: JobId) -> Job {
        Job {
            id,
            queue_name: self.queue_name,
            payload: self.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            created_at: self.created_at,
            updated_at: self.created_at,
            lease_expires_at: None,
            completed_at: None,
            last_error: None,
            not_before: None,
        }
    }
}

/// A claimed job, handed to the worker holding its lease.
///
/// `attempts` identifies the claim: every claim increments it, so a `JobRef` from an older
/// claim can no longer finalize the job once it has been claimed again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    pub id: JobId,
    pub queue_name: String,
    pub payload: Vec<u8>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub lease_expires_at: DateTime<Utc>,
}

/// The precondition a conditional update must match to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expected {
    pub status: JobStatus,
    /// Only match if the job's attempts still equal this value.
    pub attempts: Option<i32>,
    /// Only match if the job's lease expired at or before this instant.
    pub lease_expired_by: Option<DateTime<Utc>>,
}

impl Expected {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            attempts: None,
            lease_expired_by: None,
        }
    }

    pub fn attempts(mut self, attempts: i32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn lease_expired_by(mut self, instant: DateTime<Utc>) -> Self {
        self.lease_expired_by = Some(instant);
        self
    }

    /// The precondition that re-reads the version of `job` we have in hand.
    pub fn current(job: &Job) -> Self {
        let expected = Self::status(job.status).attempts(job.attempts);
        match (job.status, job.lease_expires_at) {
            (JobStatus::Processing, Some(expires_at)) => expected.lease_expired_by(expires_at),
            _ => expected,
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if job.status != self.status {
            return false;
        }
        if self.attempts.is_some_and(|attempts| attempts != job.attempts) {
            return false;
        }
        match self.lease_expired_by {
            Some(instant) => job
                .lease_expires_at
                .is_some_and(|expires_at| expires_at <= instant),
            None => true,
        }
    }
}

// A set of updates for a job. Outer none values mean "don't update this field",
// with nested none values meaning "set this field to null" for nullable fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobUpdate {
    pub updated_at: DateTime<Utc>,
    pub status: Option<JobStatus>,
    pub attempts: Option<i32>,
    pub lease_expires_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub last_error: Option<Option<String>>,
    pub not_before: Option<Option<DateTime<Utc>>>,
}

impl JobUpdate {
    pub fn new(updated_at: DateTime<Utc>) -> Self {
        Self {
            updated_at,
            status: None,
            attempts: None,
            lease_expires_at: None,
            completed_at: None,
            last_error: None,
            not_before: None,
        }
    }

    pub fn apply(self, job: &mut Job) {
        job.updated_at = self.updated_at;
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(attempts) = self.attempts {
            job.attempts = attempts;
        }
        if let Some(lease_expires_at) = self.lease_expires_at {
            job.lease_expires_at = lease_expires_at;
        }
        if let Some(completed_at) = self.completed_at {
            job.completed_at = completed_at;
        }
        if let Some(last_error) = self.last_error {
            job.last_error = last_error;
        }
        if let Some(not_before) = self.not_before {
            job.not_before = not_before;
        }
    }
}

/// Count of jobs in a queue, per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
        }
    }

    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }

    /// No job is waiting or running.
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}
