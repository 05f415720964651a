use thiserror::Error;

/// Enumeration of parsing errors in the queue.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("{0} is not a valid JobStatus")]
    ParseJobStatusError(String),
}

/// Enumeration of errors raised by a `JobStore` that could not read or write.
/// Errors that originate from sqlx are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("migrations failed with: {error}")]
    MigrationError { error: sqlx::migrate::MigrateError },
    #[error("store is unavailable: {0}")]
    Unavailable(String),
}

/// Enumeration of errors surfaced by the `Queue` facade.
/// Lease conflicts are not errors: they are reported as `false`/`None` results.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
pub type QueueResult<T> = std::result::Result<T, QueueError>;
