//! # Retry
//!
//! Module providing a `RetryPolicy` struct that decides what happens to a job after a worker
//! reports its outcome.
use std::time;

use chrono::{DateTime, Utc};

use crate::types::{Job, JobStatus, JobUpdate};

/// What a failed attempt leads to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The job goes back to pending, claimable again from `not_before` (or immediately).
    Requeue { not_before: Option<DateTime<Utc>> },
    /// The job has no attempts left and is marked as failed.
    TerminalFail,
}

#[derive(Clone, Debug)]
/// A retry policy to determine retry parameters for a job.
///
/// The default policy retries immediately. Backoff kicks in only when `initial_interval` is
/// non-zero, by setting a `not_before` instant on the requeued job.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine interval for retrying at a given attempt number.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .unwrap_or(time::Duration::MAX);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Decide whether a job that just failed its current attempt is retried.
    pub fn decide(&self, job: &Job, now: DateTime<Utc>) -> RetryDecision {
        if job.is_gte_max_attempts() {
            return RetryDecision::TerminalFail;
        }

        let interval = self.retry_interval(u32::try_from(job.attempts).unwrap_or(0));
        let not_before = if interval.is_zero() {
            None
        } else {
            let delay = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX);
            Some(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC))
        };

        RetryDecision::Requeue { not_before }
    }

    /// Build the update recording a failed attempt of `job`.
    pub fn on_failure(
        &self,
        job: &Job,
        error: &str,
        now: DateTime<Utc>,
    ) -> (RetryDecision, JobUpdate) {
        let decision = self.decide(job, now);

        let mut update = JobUpdate::new(now);
        update.lease_expires_at = Some(None);
        update.last_error = Some(Some(error.to_owned()));
        match decision {
            RetryDecision::Requeue { not_before } => {
                update.status = Some(JobStatus::Pending);
                update.not_before = Some(not_before);
            }
            RetryDecision::TerminalFail => {
                update.status = Some(JobStatus::Failed);
            }
        }

        (decision, update)
    }

    /// Build the update recording a successful attempt.
    pub fn on_success(&self, now: DateTime<Utc>) -> JobUpdate {
        let mut update = JobUpdate::new(now);
        update.status = Some(JobStatus::Completed);
        update.completed_at = Some(Some(now));
        update.lease_expires_at = Some(None);
        update
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::ZERO,
            maximum_interval: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewJob;

    fn processing_job(attempts: i32, max_attempts: i32) -> Job {
        let mut job = NewJob::new("test", vec![], max_attempts).into_job(1);
        job.status = JobStatus::Processing;
        job.attempts = attempts;
        job.lease_expires_at = Some(Utc::now());
        job
    }

    #[test]
    fn test_constant_retry_interval() {
        let retry_policy = RetryPolicy::build(1, time::Duration::from_secs(2)).provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_secs(2));
    }

    #[test]
    fn test_retry_interval_never_exceeds_maximum() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(2))
            .maximum_interval(time::Duration::from_secs(4))
            .provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(40), time::Duration::from_secs(4));
    }

    #[test]
    fn test_retry_interval_increases_with_coefficient() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(2)).provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_secs(8));
    }

    #[test]
    fn test_default_policy_requeues_immediately() {
        let now = Utc::now();
        let job = processing_job(1, 3);

        let (decision, update) = RetryPolicy::default().on_failure(&job, "boom", now);

        assert_eq!(decision, RetryDecision::Requeue { not_before: None });
        assert_eq!(update.status, Some(JobStatus::Pending));
        assert_eq!(update.lease_expires_at, Some(None));
        assert_eq!(update.not_before, Some(None));
        assert_eq!(update.last_error, Some(Some("boom".to_owned())));
    }

    #[test]
    fn test_backoff_sets_not_before() {
        let now = Utc::now();
        let job = processing_job(2, 3);
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(1)).provide();

        let (decision, _) = retry_policy.on_failure(&job, "boom", now);

        assert_eq!(
            decision,
            RetryDecision::Requeue {
                not_before: Some(now + chrono::Duration::seconds(2))
            }
        );
    }

    #[test]
    fn test_exhausted_attempts_fail_terminally() {
        let now = Utc::now();
        let job = processing_job(3, 3);

        let (decision, update) = RetryPolicy::default().on_failure(&job, "boom", now);

        assert_eq!(decision, RetryDecision::TerminalFail);
        assert_eq!(update.status, Some(JobStatus::Failed));
        assert_eq!(update.lease_expires_at, Some(None));
        assert_eq!(update.last_error, Some(Some("boom".to_owned())));
    }

    #[test]
    fn test_success_completes_and_releases_lease() {
        let now = Utc::now();
        let update = RetryPolicy::default().on_success(now);

        assert_eq!(update.status, Some(JobStatus::Completed));
        assert_eq!(update.completed_at, Some(Some(now)));
        assert_eq!(update.lease_expires_at, Some(None));
    }
}
