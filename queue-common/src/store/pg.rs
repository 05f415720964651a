use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use super::JobStore;
use crate::error::{StorageError, StorageResult};
use crate::types::{Expected, Job, JobId, JobStatus, JobUpdate, NewJob, QueueStats};

/// A `JobStore` implemented on top of a PostgreSQL table.
///
/// Each operation is a single statement, so the row-level atomicity of an `UPDATE ... WHERE`
/// is what makes a conditional update safe against concurrent workers, across processes too.
#[derive(Clone)]
pub struct PgStore {
    /// The table holding job records, created by the migrations in this repository.
    table: String,
    /// A connection pool used to connect to the PostgreSQL database.
    pool: PgPool,
}

impl PgStore {
    /// Initialize a new PgStore by initializing a lazy connection pool to the database in `url`.
    ///
    /// # Arguments
    ///
    /// * `table`: The name of the table holding job records.
    /// * `url`: A URL pointing to where the PostgreSQL database is hosted.
    /// * `max_connections`: Upper bound on the connections held by the pool.
    /// * `app_name`: Reported to PostgreSQL as the connection's `application_name`.
    pub fn new(
        table: &str,
        url: &str,
        max_connections: u32,
        app_name: &'static str,
    ) -> StorageResult<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| StorageError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self::new_from_pool(table, pool))
    }

    /// Initialize a new PgStore from a provided connection pool.
    pub fn new_from_pool(table: &str, pool: PgPool) -> Self {
        Self {
            table: table.to_owned(),
            pool,
        }
    }

    /// Create the job table and its supporting types, if they don't exist yet.
    pub async fn run_migrations(&self) -> StorageResult<()> {
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|error| StorageError::MigrationError { error })
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert(&self, job: NewJob) -> StorageResult<JobId> {
        let base_query = format!(
            r#"
INSERT INTO "{0}"
    (queue_name, payload, status, attempts, max_attempts, created_at, updated_at)
VALUES
    ($1, $2, 'pending'::job_status, 0, $3, $4, $4)
RETURNING
    id
            "#,
            self.table
        );

        sqlx::query_scalar(&base_query)
            .bind(&job.queue_name)
            .bind(&job.payload)
            .bind(job.max_attempts)
            .bind(job.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StorageError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })
    }

    async fn get(&self, id: JobId) -> StorageResult<Option<Job>> {
        let base_query = format!(r#"SELECT * FROM "{0}" WHERE id = $1"#, self.table);

        sqlx::query_as(&base_query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StorageError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn find_claimable(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<Job>> {
        let base_query = format!(
            r#"
SELECT
    *
FROM
    "{0}"
WHERE
    queue_name = $1
    AND (
        (status = 'pending'::job_status AND (not_before IS NULL OR not_before <= $2))
        OR (status = 'processing'::job_status AND lease_expires_at <= $2)
    )
ORDER BY
    created_at,
    id
LIMIT 1
            "#,
            self.table
        );

        sqlx::query_as(&base_query)
            .bind(queue_name)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StorageError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn conditional_update(
        &self,
        id: JobId,
        expected: &Expected,
        update: JobUpdate,
    ) -> StorageResult<bool> {
        // Nullable columns take a flag saying whether to overwrite them, since NULL is a valid
        // new value for them.
        let base_query = format!(
            r#"
UPDATE
    "{0}"
SET
    updated_at = $5,
    status = COALESCE($6::job_status, status),
    attempts = COALESCE($7::INT, attempts),
    lease_expires_at = CASE WHEN $8 THEN $9::TIMESTAMPTZ ELSE lease_expires_at END,
    completed_at = CASE WHEN $10 THEN $11::TIMESTAMPTZ ELSE completed_at END,
    last_error = CASE WHEN $12 THEN $13::TEXT ELSE last_error END,
    not_before = CASE WHEN $14 THEN $15::TIMESTAMPTZ ELSE not_before END
WHERE
    id = $1
    AND status = $2::job_status
    AND ($3::INT IS NULL OR attempts = $3)
    AND ($4::TIMESTAMPTZ IS NULL OR lease_expires_at <= $4)
            "#,
            self.table
        );

        let result = sqlx::query(&base_query)
            .bind(id)
            .bind(expected.status)
            .bind(expected.attempts)
            .bind(expected.lease_expired_by)
            .bind(update.updated_at)
            .bind(update.status)
            .bind(update.attempts)
            .bind(update.lease_expires_at.is_some())
            .bind(update.lease_expires_at.flatten())
            .bind(update.completed_at.is_some())
            .bind(update.completed_at.flatten())
            .bind(update.last_error.is_some())
            .bind(update.last_error.flatten())
            .bind(update.not_before.is_some())
            .bind(update.not_before.flatten())
            .execute(&self.pool)
            .await
            .map_err(|error| StorageError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected() == 1)
    }

    async fn stats(&self, queue_name: &str) -> StorageResult<QueueStats> {
        let base_query = format!(
            r#"
SELECT
    status,
    COUNT(*) AS count
FROM
    "{0}"
WHERE
    queue_name = $1
GROUP BY
    status
            "#,
            self.table
        );

        let rows: Vec<(JobStatus, i64)> = sqlx::query_as(&base_query)
            .bind(queue_name)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StorageError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(rows
            .into_iter()
            .fold(QueueStats::default(), |mut stats, (status, count)| {
                stats.add(status, u64::try_from(count).unwrap_or(0));
                stats
            }))
    }
}
