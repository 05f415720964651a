use std::time;

use queue_common::QueueError;
use thiserror::Error;

/// Enumeration of errors related to starting and running a `WorkerPool`.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
    #[error("a queue operation failed: {0}")]
    QueueError(#[from] QueueError),
}

/// Enumeration of the ways a single job execution can fail. All of them are reported to the
/// queue as a failed attempt.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("{0:#}")]
    Failed(anyhow::Error),
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error("handler timed out after {0:?}")]
    TimedOut(time::Duration),
}

/// Enumeration of errors related to delivering a job payload to a webhook.
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("failed to construct webhook client: {0}")]
    ClientError(reqwest::Error),
    #[error("webhook request failed: {0}")]
    RequestError(reqwest::Error),
    #[error("webhook responded with non-success status {0}")]
    BadStatus(reqwest::StatusCode),
}
