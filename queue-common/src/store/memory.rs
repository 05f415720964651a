use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::JobStore;
use crate::error::{StorageError, StorageResult};
use crate::types::{Expected, Job, JobId, JobUpdate, NewJob, QueueStats};

#[derive(Default)]
struct MemoryState {
    last_id: JobId,
    jobs: BTreeMap<JobId, Job>,
}

/// A `JobStore` kept in process memory.
///
/// Nothing survives a restart, so this is meant for tests and for embedding the queue in a
/// single process. Conditional updates are atomic because every operation runs under one lock.
#[derive(Default)]
pub struct MemoryStore {
    // TRICKY - this is a sync mutex, none of the operations below await while holding it.
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::Unavailable("poisoned MemoryStore mutex".to_owned()))
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, job: NewJob) -> StorageResult<JobId> {
        let mut state = self.lock()?;
        state.last_id += 1;
        let id = state.last_id;
        state.jobs.insert(id, job.into_job(id));
        Ok(id)
    }

    async fn get(&self, id: JobId) -> StorageResult<Option<Job>> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn find_claimable(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<Job>> {
        let state = self.lock()?;
        let oldest = state
            .jobs
            .values()
            .filter(|job| job.queue_name == queue_name && job.is_claimable(now))
            .min_by_key(|job| (job.created_at, job.id));

        Ok(oldest.cloned())
    }

    async fn conditional_update(
        &self,
        id: JobId,
        expected: &Expected,
        update: JobUpdate,
    ) -> StorageResult<bool> {
        let mut state = self.lock()?;
        match state.jobs.get_mut(&id) {
            Some(job) if expected.matches(job) => {
                update.apply(job);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stats(&self, queue_name: &str) -> StorageResult<QueueStats> {
        let state = self.lock()?;
        let stats = state
            .jobs
            .values()
            .filter(|job| job.queue_name == queue_name)
            .fold(QueueStats::default(), |mut stats, job| {
                stats.add(job.status, 1);
                stats
            });

        Ok(stats)
    }
}
