pub const JOBS_ENQUEUED: &str = "queue_jobs_enqueued_total";
pub const JOBS_CLAIMED: &str = "queue_jobs_claimed_total";
// Claims of a processing job whose lease ran out, i.e. a re-delivery after a worker went away
pub const JOBS_REDELIVERED: &str = "queue_jobs_redelivered_total";
// Lost races between two claimers for the same job
pub const CLAIM_CONFLICTS: &str = "queue_claim_conflicts_total";
pub const JOBS_COMPLETED: &str = "queue_jobs_completed_total";
pub const JOBS_RETRIED: &str = "queue_jobs_retried_total";
pub const JOBS_FAILED: &str = "queue_jobs_failed_total";
// Late completions or failures discarded because the reporter no longer held the lease
pub const LEASES_LOST: &str = "queue_leases_lost_total";
// Gauge of jobs per status, labelled by queue and status
pub const QUEUE_DEPTH: &str = "queue_jobs";
// Histogram of handler run time in seconds
pub const JOB_DURATION: &str = "queue_job_duration_seconds";
pub const STORAGE_ERRORS: &str = "queue_storage_errors_total";
