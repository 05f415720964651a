use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use queue_common::health::{HealthHandle, HealthRegistry};
use queue_common::metrics_consts::{JOB_DURATION, STORAGE_ERRORS};
use queue_common::{
    FailOutcome, JobId, JobRef, Queue, QueueError, EXPIRED_ON_FINAL_ATTEMPT, MAX_LEASE_SECS,
};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{HandlerError, WorkerError};

/// Headroom added on top of the longest a worker may legitimately go without reporting.
const LIVENESS_SLACK: Duration = Duration::from_secs(10);

/// Runs claimed jobs. Returning an error, panicking or timing out all count as a failed attempt.
///
/// Jobs are delivered at least once: a job can run again after its lease expired, so handlers
/// should be idempotent, or deduplicate on `JobRef::id`.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: JobRef) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobRef) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, job: JobRef) -> anyhow::Result<()> {
        (self)(job).await
    }
}

/// Told about every job that failed for good, with the error of its final attempt.
pub trait AlertSink: Send + Sync + 'static {
    fn notify(&self, job_id: JobId, error: &str);
}

impl<F> AlertSink for F
where
    F: Fn(JobId, &str) + Send + Sync + 'static,
{
    fn notify(&self, job_id: JobId, error: &str) {
        (self)(job_id, error)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// The queue every worker of the pool consumes.
    pub queue_name: String,
    /// Number of concurrent workers.
    pub pool_size: usize,
    /// How long a worker sleeps after finding nothing to claim.
    pub poll_interval: Duration,
    /// The lease granted on every claim. A job whose worker went away is claimable again after it.
    pub lease_duration: Duration,
    /// Give up waiting on a handler after this long and report the attempt as failed.
    pub execution_timeout: Option<Duration>,
    /// How long a worker sleeps after a storage error before polling again.
    pub error_backoff: Duration,
    /// Stop a worker as soon as it finds nothing to claim, instead of polling forever.
    pub shutdown_when_queue_empty: bool,
}

impl PoolConfig {
    pub fn new(queue_name: &str) -> Self {
        Self {
            queue_name: queue_name.to_owned(),
            pool_size: 1,
            poll_interval: Duration::from_millis(100),
            lease_duration: Duration::from_secs(30),
            execution_timeout: None,
            error_backoff: Duration::from_secs(1),
            shutdown_when_queue_empty: false,
        }
    }

    fn validated_lease(&self) -> Result<chrono::Duration, WorkerError> {
        if self.queue_name.is_empty() {
            return Err(WorkerError::InvalidConfig(
                "queue_name must not be empty".to_owned(),
            ));
        }
        if self.pool_size == 0 {
            return Err(WorkerError::InvalidConfig(
                "pool_size must be at least 1".to_owned(),
            ));
        }

        let max_lease = chrono::Duration::seconds(MAX_LEASE_SECS);
        match chrono::Duration::from_std(self.lease_duration) {
            Ok(lease) if lease > chrono::Duration::zero() && lease <= max_lease => Ok(lease),
            _ => Err(WorkerError::InvalidConfig(format!(
                "lease_duration must be positive and at most {MAX_LEASE_SECS}s, got {:?}",
                self.lease_duration
            ))),
        }
    }

    /// A worker reports on every loop, so it goes quiet for at most one execution plus one sleep.
    fn liveness_deadline(&self) -> time::Duration {
        let longest_quiet = self
            .execution_timeout
            .unwrap_or(self.lease_duration)
            .saturating_add(self.poll_interval.max(self.error_backoff))
            .saturating_add(LIVENESS_SLACK);

        time::Duration::try_from(longest_quiet).unwrap_or(time::Duration::MAX)
    }
}

/// A fixed number of workers consuming one queue.
///
/// Workers share nothing but the `Queue`: mutual exclusion between them, and between pools in
/// other processes, comes entirely from the store's conditional updates.
pub struct WorkerPool {
    queue: Queue,
    handler: Arc<dyn JobHandler>,
    config: PoolConfig,
    liveness: HealthRegistry,
    alert_sink: Option<Arc<dyn AlertSink>>,
}

impl WorkerPool {
    pub fn new<H: JobHandler>(queue: Queue, handler: H, config: PoolConfig) -> Self {
        Self {
            queue,
            handler: Arc::new(handler),
            config,
            liveness: HealthRegistry::new("liveness"),
            alert_sink: None,
        }
    }

    /// Report every worker's liveness to `liveness`.
    pub fn with_liveness(mut self, liveness: HealthRegistry) -> Self {
        self.liveness = liveness;
        self
    }

    /// Notify `alert_sink` of every job that failed for good, whether its final attempt
    /// returned an error or ran out its lease.
    pub fn with_alert_sink<A: AlertSink>(mut self, alert_sink: A) -> Self {
        self.alert_sink = Some(Arc::new(alert_sink));
        self
    }

    /// Spawn the workers on the current tokio runtime.
    pub fn start(&self) -> Result<PoolHandle, WorkerError> {
        let lease = self.config.validated_lease()?;
        let deadline = self.config.liveness_deadline();
        let config = Arc::new(self.config.clone());
        let shutdown = CancellationToken::new();

        let handles = (0..config.pool_size)
            .map(|id| {
                let worker = Worker {
                    queue: self.queue.clone(),
                    handler: self.handler.clone(),
                    config: config.clone(),
                    lease,
                    liveness: self.liveness.register(format!("worker-{id}"), deadline),
                    alert_sink: self.alert_sink.clone(),
                    shutdown: shutdown.clone(),
                };

                let span = info_span!("worker", worker.id = id, queue = %config.queue_name);
                tokio::spawn(worker.run().instrument(span))
            })
            .collect();

        info!(
            queue = %config.queue_name,
            pool_size = config.pool_size,
            "started worker pool"
        );

        Ok(PoolHandle { shutdown, handles })
    }
}

/// Handle to the workers of a running `WorkerPool`.
#[derive(Debug)]
pub struct PoolHandle {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    /// Ask every worker to stop polling. Jobs already executing run to completion.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    /// Wait for all workers to stop, either after `cancel` or because the queue ran dry with
    /// `shutdown_when_queue_empty` set.
    pub async fn wait(self) {
        log_join_errors(join_all(self.handles).await);
    }

    /// Stop the pool, giving in-flight jobs up to `grace` to finish before aborting them.
    /// Returns false if any worker had to be aborted. Their jobs become claimable again once
    /// their leases expire.
    pub async fn shutdown(self, grace: Duration) -> bool {
        self.shutdown.cancel();

        let abort_handles: Vec<AbortHandle> =
            self.handles.iter().map(JoinHandle::abort_handle).collect();

        match tokio::time::timeout(grace, join_all(self.handles)).await {
            Ok(results) => {
                log_join_errors(results);
                true
            }
            Err(_) => {
                warn!(?grace, "workers did not stop in time, aborting them");
                abort_handles.iter().for_each(AbortHandle::abort);
                false
            }
        }
    }
}

fn log_join_errors(results: Vec<Result<(), tokio::task::JoinError>>) {
    for result in results {
        if let Err(error) = result {
            warn!(%error, "worker task did not finish cleanly");
        }
    }
}

struct Worker {
    queue: Queue,
    handler: Arc<dyn JobHandler>,
    config: Arc<PoolConfig>,
    lease: chrono::Duration,
    liveness: HealthHandle,
    alert_sink: Option<Arc<dyn AlertSink>>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!("worker started");

        while !self.shutdown.is_cancelled() {
            self.liveness.report_healthy();

            let keep_going = match self.run_next_job().await {
                Ok(Some(_)) => true,
                Ok(None) if self.config.shutdown_when_queue_empty => {
                    debug!("no claimable jobs left, stopping worker");
                    false
                }
                Ok(None) => self.pause(self.config.poll_interval).await,
                Err(error) => {
                    error!("failed to run job: {error}");
                    metrics::counter!(STORAGE_ERRORS, "queue" => self.config.queue_name.clone())
                        .increment(1);
                    self.pause(self.config.error_backoff).await
                }
            };

            if !keep_going {
                break;
            }
        }

        self.liveness.deregister();
        debug!("worker stopped");
    }

    /// Sleep for `duration`. Returns false if the pool was shut down in the meantime.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Claim and process the next job, if there is one.
    async fn run_next_job(&self) -> Result<Option<JobId>, QueueError> {
        let claim = self.queue.claim(&self.config.queue_name, self.lease).await?;
        for job_id in claim.expired {
            self.alert(job_id, EXPIRED_ON_FINAL_ATTEMPT);
        }

        let Some(job_ref) = claim.job else {
            return Ok(None);
        };

        let job_id = job_ref.id;
        let span = info_span!("job", job.id = job_id, job.attempts = job_ref.attempts);
        self.process(job_ref).instrument(span).await?;

        Ok(Some(job_id))
    }

    async fn process(&self, job_ref: JobRef) -> Result<(), QueueError> {
        let labels = [("queue", self.config.queue_name.clone())];
        let started = Instant::now();
        let result = self.execute(job_ref.clone()).await;
        metrics::histogram!(JOB_DURATION, &labels).record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                if !self.queue.complete_claimed(&job_ref).await? {
                    warn!("lease was lost before the job completed, discarding its result");
                }
            }
            Err(error) => {
                let error = error.to_string();
                match self.queue.fail_claimed(&job_ref, &error).await? {
                    FailOutcome::Retried { not_before } => {
                        debug!(?not_before, "job attempt failed: {error}");
                    }
                    FailOutcome::Failed => self.alert(job_ref.id, &error),
                    FailOutcome::LeaseLost => {
                        warn!("lease was lost before the job failed, discarding its result");
                    }
                }
            }
        }

        Ok(())
    }

    fn alert(&self, job_id: JobId, error: &str) {
        if let Some(alert_sink) = &self.alert_sink {
            alert_sink.notify(job_id, error);
        }
    }

    async fn execute(&self, job_ref: JobRef) -> Result<(), HandlerError> {
        let handling = AssertUnwindSafe(self.handler.handle(job_ref)).catch_unwind();

        let outcome = match self.config.execution_timeout {
            Some(timeout) => tokio::time::timeout(timeout, handling)
                .await
                .map_err(|_| HandlerError::TimedOut(timeout))?,
            None => handling.await,
        };

        match outcome {
            Ok(result) => result.map_err(HandlerError::Failed),
            Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_pool_config_is_rejected() {
        let empty_name = PoolConfig::new("");
        assert!(matches!(
            empty_name.validated_lease(),
            Err(WorkerError::InvalidConfig(_))
        ));

        let no_workers = PoolConfig {
            pool_size: 0,
            ..PoolConfig::new("q")
        };
        assert!(no_workers.validated_lease().is_err());

        let no_lease = PoolConfig {
            lease_duration: Duration::ZERO,
            ..PoolConfig::new("q")
        };
        assert!(no_lease.validated_lease().is_err());

        let endless_lease = PoolConfig {
            lease_duration: Duration::from_millis(9_000_000_000_000_000_000),
            ..PoolConfig::new("q")
        };
        assert!(endless_lease.validated_lease().is_err());

        assert_eq!(
            PoolConfig::new("q").validated_lease().unwrap(),
            chrono::Duration::seconds(30)
        );
    }

    #[test]
    fn test_liveness_deadline_covers_execution_and_sleep() {
        let config = PoolConfig {
            execution_timeout: Some(Duration::from_secs(5)),
            poll_interval: Duration::from_millis(100),
            error_backoff: Duration::from_secs(2),
            ..PoolConfig::new("q")
        };

        assert_eq!(config.liveness_deadline(), time::Duration::seconds(17));

        let endless = PoolConfig {
            execution_timeout: Some(Duration::MAX),
            ..PoolConfig::new("q")
        };
        assert_eq!(endless.liveness_deadline(), time::Duration::MAX);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(payload.as_ref()), "kaboom");

        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
