//! # Lease
//!
//! The claim protocol. A claim moves one claimable job to `processing`, bumps its attempts
//! and grants a lease until `now + lease`. Mutual exclusion comes only from the store's
//! conditional update: of several claimers racing for a job, exactly one update applies.
//! A worker that disappears simply lets its lease run out, after which the job can be
//! claimed again (at-least-once delivery).
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::error::StorageResult;
use crate::metrics_consts::{CLAIM_CONFLICTS, JOBS_CLAIMED, JOBS_FAILED, JOBS_REDELIVERED};
use crate::store::JobStore;
use crate::types::{Expected, Job, JobId, JobRef, JobStatus, JobUpdate};

pub const DEFAULT_MAX_CLAIM_RETRIES: u32 = 5;

/// The longest lease the queue hands out, in seconds.
pub const MAX_LEASE_SECS: i64 = 7 * 24 * 60 * 60;

/// The error recorded on a job whose last allowed attempt ran out its lease.
pub const EXPIRED_ON_FINAL_ATTEMPT: &str = "lease expired after final attempt";

/// The result of one claim poll.
#[derive(Debug, Default)]
pub struct Claim {
    pub job: Option<JobRef>,
    /// Jobs moved to `failed` during this poll because their final attempt's lease expired.
    pub expired: Vec<JobId>,
}

#[derive(Debug, Clone)]
pub struct LeaseManager {
    /// How many lost races a single claim tolerates before giving up for this poll.
    max_claim_retries: u32,
}

impl Default for LeaseManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLAIM_RETRIES)
    }
}

impl LeaseManager {
    pub fn new(max_claim_retries: u32) -> Self {
        Self { max_claim_retries }
    }

    /// Claim the oldest claimable job in `queue_name`, if there is one.
    ///
    /// `Claim::job` is `None` when the queue has nothing claimable, or when every attempt lost
    /// its race against another claimer; the caller is expected to poll again later either way.
    pub async fn claim<S>(
        &self,
        store: &S,
        queue_name: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StorageResult<Claim>
    where
        S: JobStore + ?Sized,
    {
        let labels = [("queue", queue_name.to_owned())];
        let lease_expires_at = lease_deadline(now, lease);
        let mut claim = Claim::default();
        let mut conflicts = 0;

        while conflicts <= self.max_claim_retries {
            let Some(job) = store.find_claimable(queue_name, now).await? else {
                return Ok(claim);
            };

            if job.is_gte_max_attempts() {
                // Claiming again would exceed max_attempts.
                if self.expire_exhausted(store, &job, now).await? {
                    metrics::counter!(JOBS_FAILED, &labels).increment(1);
                    claim.expired.push(job.id);
                } else {
                    conflicts += 1;
                }
                continue;
            }

            let mut update = JobUpdate::new(now);
            update.status = Some(JobStatus::Processing);
            update.attempts = Some(job.attempts + 1);
            update.lease_expires_at = Some(Some(lease_expires_at));
            update.not_before = Some(None);

            if store
                .conditional_update(job.id, &claimable_version(&job, now), update)
                .await?
            {
                metrics::counter!(JOBS_CLAIMED, &labels).increment(1);
                if job.status == JobStatus::Processing {
                    metrics::counter!(JOBS_REDELIVERED, &labels).increment(1);
                    debug!(job.id, "re-claimed job after its lease expired");
                }

                claim.job = Some(JobRef {
                    id: job.id,
                    queue_name: job.queue_name,
                    payload: job.payload,
                    attempts: job.attempts + 1,
                    max_attempts: job.max_attempts,
                    lease_expires_at,
                });
                return Ok(claim);
            }

            metrics::counter!(CLAIM_CONFLICTS, &labels).increment(1);
            debug!(job.id, "lost claim race, looking for another job");
            conflicts += 1;
        }

        Ok(claim)
    }

    /// Extend the lease held by `job`. Returns false if the lease was lost in the meantime,
    /// leaving `job` untouched.
    pub async fn renew<S>(
        &self,
        store: &S,
        job: &mut JobRef,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StorageResult<bool>
    where
        S: JobStore + ?Sized,
    {
        let lease_expires_at = lease_deadline(now, lease);
        let mut update = JobUpdate::new(now);
        update.lease_expires_at = Some(Some(lease_expires_at));

        let expected = Expected::status(JobStatus::Processing).attempts(job.attempts);
        let renewed = store.conditional_update(job.id, &expected, update).await?;
        if renewed {
            job.lease_expires_at = lease_expires_at;
        }

        Ok(renewed)
    }

    async fn expire_exhausted<S>(
        &self,
        store: &S,
        job: &Job,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>
    where
        S: JobStore + ?Sized,
    {
        let mut update = JobUpdate::new(now);
        update.status = Some(JobStatus::Failed);
        update.lease_expires_at = Some(None);
        update.last_error = Some(Some(EXPIRED_ON_FINAL_ATTEMPT.to_owned()));

        let failed = store
            .conditional_update(job.id, &Expected::current(job), update)
            .await?;
        if failed {
            warn!(job.id, job.attempts, "job failed: {EXPIRED_ON_FINAL_ATTEMPT}");
        }

        Ok(failed)
    }
}

/// `now + lease`, saturating at the latest representable instant.
fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The precondition under which `job`, as read by `find_claimable`, may still be claimed.
fn claimable_version(job: &Job, now: DateTime<Utc>) -> Expected {
    let expected = Expected::status(job.status).attempts(job.attempts);
    match job.status {
        JobStatus::Processing => expected.lease_expired_by(now),
        _ => expected,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::MemoryStore;
    use crate::types::NewJob;

    #[tokio::test]
    async fn test_claim_returns_none_on_empty_queue() {
        let store = MemoryStore::new();

        let claimed = LeaseManager::default()
            .claim(&store, "empty", Utc::now(), Duration::seconds(30))
            .await
            .expect("failed to claim");

        assert!(claimed.job.is_none());
        assert!(claimed.expired.is_empty());
    }

    #[tokio::test]
    async fn test_claim_grants_lease_and_counts_attempt() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = store.insert(NewJob::new("q", b"x".to_vec(), 3)).await.unwrap();

        let job_ref = LeaseManager::default()
            .claim(&store, "q", now, Duration::seconds(30))
            .await
            .unwrap()
            .job
            .expect("no job claimed");

        assert_eq!(job_ref.id, id);
        assert_eq!(job_ref.attempts, 1);
        assert_eq!(job_ref.payload, b"x".to_vec());
        assert_eq!(job_ref.lease_expires_at, now + Duration::seconds(30));

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.lease_expires_at, Some(now + Duration::seconds(30)));

        // A valid lease keeps the job away from everyone else.
        let again = LeaseManager::default()
            .claim(&store, "q", now + Duration::seconds(29), Duration::seconds(30))
            .await
            .unwrap();
        assert!(again.job.is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let manager = LeaseManager::default();
        let id = store.insert(NewJob::new("q", vec![], 3)).await.unwrap();

        manager
            .claim(&store, "q", now, Duration::seconds(1))
            .await
            .unwrap()
            .job
            .expect("no job claimed");

        let reclaimed = manager
            .claim(&store, "q", now + Duration::seconds(2), Duration::seconds(1))
            .await
            .unwrap()
            .job
            .expect("expired job was not reclaimed");

        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn test_expired_final_attempt_is_failed_not_reclaimed() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let manager = LeaseManager::default();
        let id = store.insert(NewJob::new("q", vec![], 1)).await.unwrap();

        manager
            .claim(&store, "q", now, Duration::seconds(1))
            .await
            .unwrap()
            .job
            .expect("no job claimed");

        let reclaimed = manager
            .claim(&store, "q", now + Duration::seconds(2), Duration::seconds(1))
            .await
            .unwrap();
        assert!(reclaimed.job.is_none());
        assert_eq!(reclaimed.expired, vec![id]);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.lease_expires_at, None);
        assert_eq!(job.last_error.as_deref(), Some(EXPIRED_ON_FINAL_ATTEMPT));
    }

    #[tokio::test]
    async fn test_renew_extends_lease_only_for_current_claim() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let manager = LeaseManager::default();
        store.insert(NewJob::new("q", vec![], 3)).await.unwrap();

        let mut stale = manager
            .claim(&store, "q", now, Duration::seconds(1))
            .await
            .unwrap()
            .job
            .unwrap();
        let mut current = manager
            .claim(&store, "q", now + Duration::seconds(2), Duration::seconds(1))
            .await
            .unwrap()
            .job
            .unwrap();

        let later = now + Duration::seconds(2);
        assert!(!manager
            .renew(&store, &mut stale, later, Duration::seconds(60))
            .await
            .unwrap());
        assert_eq!(stale.lease_expires_at, now + Duration::seconds(1));

        assert!(manager
            .renew(&store, &mut current, later, Duration::seconds(60))
            .await
            .unwrap());
        assert_eq!(current.lease_expires_at, later + Duration::seconds(60));
    }

    #[tokio::test]
    async fn test_unbounded_lease_saturates() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let manager = LeaseManager::default();
        let id = store.insert(NewJob::new("q", vec![], 3)).await.unwrap();

        let mut job_ref = manager
            .claim(&store, "q", now, Duration::MAX)
            .await
            .unwrap()
            .job
            .expect("no job claimed");
        assert_eq!(job_ref.id, id);
        assert_eq!(job_ref.lease_expires_at, DateTime::<Utc>::MAX_UTC);

        assert!(manager
            .renew(&store, &mut job_ref, now, Duration::MAX)
            .await
            .unwrap());
        assert_eq!(job_ref.lease_expires_at, DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn test_concurrent_claims_hand_out_each_job_once() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        for _ in 0..20 {
            store.insert(NewJob::new("q", vec![], 3)).await.unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let manager = LeaseManager::default();
                let mut claimed = Vec::new();
                while let Some(job_ref) = manager
                    .claim(store.as_ref(), "q", now, Duration::seconds(60))
                    .await
                    .unwrap()
                    .job
                {
                    claimed.push(job_ref.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        all.sort_unstable();
        all.dedup();

        assert_eq!(all.len(), 20);
    }
}
