//! Job registry: one record per job under `jobs/{job_id}`.

use std::sync::Arc;

use tracing::{debug, warn};

use pipeline::{
    get_typed, Clock, Job, JobId, KeyValueStore, StoreError, WritePrecondition, WriteResult,
};

use crate::error::retry_transient;
use crate::job_id::SUFFIX_LEN;

pub const JOBS_PREFIX: &str = "jobs";

/// Reservation attempts before giving up on finding a free id.
const MAX_RESERVE_ATTEMPTS: u32 = 8;

fn job_key(job_id: &JobId) -> String {
    format!("{JOBS_PREFIX}/{job_id}")
}

fn random_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..SUFFIX_LEN].to_string()
}

pub struct JobRegistry {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Persists `job` under a fresh id.
    ///
    /// Tries `job.job_id` first; if another job already holds it, appends a
    /// random suffix and tries again. Returns the job as stored.
    pub async fn reserve(&self, mut job: Job) -> Result<Job, StoreError> {
        let base = job.job_id.clone();
        for attempt in 0..MAX_RESERVE_ATTEMPTS {
            let key = job_key(&job.job_id);
            let encoded = serde_json::to_value(&job).map_err(|e| StoreError::corrupt(&key, e))?;
            let written = retry_transient(self.clock.as_ref(), "job reserve", || {
                self.store
                    .put(&key, encoded.clone(), WritePrecondition::DoesNotExist)
            })
            .await?;
            match written {
                WriteResult::Success { .. } => {
                    debug!(job_id = %job.job_id, attempt, "job id reserved");
                    return Ok(job);
                }
                WriteResult::PreconditionFailed { .. } => {
                    warn!(job_id = %job.job_id, "job id already taken; adding suffix");
                    job.job_id = base.with_suffix(&random_suffix());
                }
            }
        }
        Err(StoreError::Conflict {
            key: job_key(&base),
            attempts: MAX_RESERVE_ATTEMPTS,
        })
    }

    /// Overwrites the stored record of `job`.
    pub async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let key = job_key(&job.job_id);
        let encoded = serde_json::to_value(job).map_err(|e| StoreError::corrupt(&key, e))?;
        retry_transient(self.clock.as_ref(), "job save", || {
            self.store.put(&key, encoded.clone(), WritePrecondition::None)
        })
        .await?;
        Ok(())
    }

    pub async fn get(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        let key = job_key(job_id);
        let found = retry_transient(self.clock.as_ref(), "job read", || {
            get_typed::<Job>(self.store.as_ref(), &key)
        })
        .await?;
        Ok(found.map(|(job, _)| job))
    }
}
