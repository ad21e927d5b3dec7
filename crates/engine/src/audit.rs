//! Two-phase audit trail of agent invocations.
//!
//! Each logical call gets exactly one [`InferenceRecord`]. [`AuditRecorder::begin`]
//! creates it in the `pending` state before the call; [`AuditRecorder::complete`]
//! or [`AuditRecorder::fail`] then updates that same record. Finalised records
//! are never touched again.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use pipeline::{
    update, ActionName, AgentName, Clock, InferenceRecord, InferenceStatus, InvocationId, JobId,
    KeyValueStore, StoreError, Timestamp, Versioned, WritePrecondition, WriteResult,
};

use crate::error::{retry_transient, TransientFailure};

/// Key prefix of every audit record.
pub const AUDIT_PREFIX: &str = "audit";

/// Bound on timestamp bumps when two records of one job collide on a key.
const MAX_KEY_COLLISIONS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuditError {
    /// The record a handle points at does not exist.
    #[error("Audit record {key} does not exist")]
    UnknownRecord { key: String },

    /// The record has already left the pending state.
    #[error("Audit record {key} is already finalised as {status:?}")]
    AlreadyFinalised {
        key: String,
        status: InferenceStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TransientFailure for AuditError {
    fn transient_backoff(&self) -> Option<Duration> {
        match self {
            AuditError::Store(err) => err.transient_backoff(),
            _ => None,
        }
    }
}

/// Ties the output phase of a call to the record its input phase created.
///
/// Only [`AuditRecorder::begin`] produces handles, so an output can never be
/// written without a matching pending record.
#[derive(Debug)]
pub struct AuditHandle {
    key: String,
    job_id: JobId,
    timestamp: Timestamp,
    invocation_id: InvocationId,
    started_at: Timestamp,
}

impl AuditHandle {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Second half of the record key.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn invocation_id(&self) -> InvocationId {
        self.invocation_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

pub struct AuditRecorder {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

fn job_prefix(job_id: &JobId) -> String {
    format!("{AUDIT_PREFIX}/{job_id}/")
}

fn record_key(job_id: &JobId, timestamp: Timestamp) -> String {
    format!("{}{}", job_prefix(job_id), timestamp.to_key_string())
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Input phase: records the request before the call is made.
    ///
    /// A create-only write that reports a transient failure may still have
    /// landed; the retry then finds a record carrying this call's invocation
    /// id and adopts it instead of opening a second one.
    pub async fn begin(
        &self,
        job_id: &JobId,
        agent_name: &AgentName,
        action_name: &ActionName,
        request_payload: &str,
    ) -> Result<AuditHandle, AuditError> {
        let started_at = self.clock.now();
        let invocation_id = InvocationId::new_random();
        let mut timestamp = started_at;

        for _ in 0..MAX_KEY_COLLISIONS {
            let key = record_key(job_id, timestamp);
            let record = InferenceRecord {
                job_id: job_id.clone(),
                timestamp,
                invocation_id,
                agent_name: agent_name.clone(),
                action_name: action_name.clone(),
                request_payload: request_payload.to_string(),
                response_payload: None,
                status: InferenceStatus::Pending,
                duration_seconds: None,
                error_message: None,
                completed_at: None,
            };
            let encoded =
                serde_json::to_value(&record).map_err(|e| StoreError::corrupt(&key, e))?;

            let written = retry_transient(self.clock.as_ref(), "audit begin", || {
                self.store
                    .put(&key, encoded.clone(), WritePrecondition::DoesNotExist)
            })
            .await?;
            let opened = match written {
                WriteResult::Success { .. } => true,
                WriteResult::PreconditionFailed { .. } => {
                    self.fetch(&key).await?.map_or(false, |existing| {
                        existing.invocation_id == invocation_id
                    })
                }
            };
            if opened {
                debug!(job_id = %job_id, agent = %agent_name, key = %key, "audit record opened");
                return Ok(AuditHandle {
                    key,
                    job_id: job_id.clone(),
                    timestamp,
                    invocation_id,
                    started_at,
                });
            }
            // Same job, same microsecond: move to the next free key.
            timestamp = timestamp.saturating_add(Duration::from_micros(1));
        }

        Err(StoreError::Conflict {
            key: record_key(job_id, started_at),
            attempts: MAX_KEY_COLLISIONS,
        }
        .into())
    }

    /// Output phase for a successful call.
    pub async fn complete(
        &self,
        handle: &AuditHandle,
        response_payload: &str,
        duration: Duration,
    ) -> Result<InferenceRecord, AuditError> {
        let completed_at = self.clock.now();
        self.finalise(handle, |record| {
            record.status = InferenceStatus::Success;
            record.response_payload = Some(response_payload.to_string());
            record.duration_seconds = Some(duration.as_secs_f64());
            record.completed_at = Some(completed_at);
        })
        .await
    }

    /// Output phase for a call that failed, exhausted its retries, or was aborted.
    pub async fn fail(
        &self,
        handle: &AuditHandle,
        error_message: &str,
    ) -> Result<InferenceRecord, AuditError> {
        let completed_at = self.clock.now();
        let duration = completed_at.saturating_since(handle.started_at);
        self.finalise(handle, |record| {
            record.status = InferenceStatus::Error;
            record.error_message = Some(error_message.to_string());
            record.duration_seconds = Some(duration.as_secs_f64());
            record.completed_at = Some(completed_at);
        })
        .await
    }

    async fn finalise<F>(&self, handle: &AuditHandle, apply: F) -> Result<InferenceRecord, AuditError>
    where
        F: Fn(&mut InferenceRecord) + Send + Sync,
    {
        let key = handle.key.as_str();
        let apply = &apply;
        let result = retry_transient(self.clock.as_ref(), "audit complete", || {
            update(self.store.as_ref(), key, move |current: Option<InferenceRecord>| {
                let mut record = current.ok_or_else(|| AuditError::UnknownRecord {
                    key: key.to_string(),
                })?;
                if record.status != InferenceStatus::Pending {
                    return Err(AuditError::AlreadyFinalised {
                        key: key.to_string(),
                        status: record.status,
                    });
                }
                apply(&mut record);
                Ok(record)
            })
        })
        .await;

        match result {
            Ok((record, _)) => Ok(record),
            Err(err) => {
                warn!(key, error = %err, "audit record could not be finalised");
                Err(err)
            }
        }
    }

    /// The record of `job_id` written at `timestamp`, if any.
    pub async fn get_record(
        &self,
        job_id: &JobId,
        timestamp: Timestamp,
    ) -> Result<Option<InferenceRecord>, AuditError> {
        self.fetch(&record_key(job_id, timestamp)).await
    }

    /// Records of `job_id`, oldest first, at most `limit` of them.
    pub async fn records_for_job(
        &self,
        job_id: &JobId,
        limit: Option<usize>,
    ) -> Result<Vec<InferenceRecord>, AuditError> {
        let mut records = self.scan(&job_prefix(job_id)).await?;
        truncate(&mut records, limit);
        Ok(records)
    }

    /// Records of every job made by `agent_name` within `range`, oldest first,
    /// at most `limit` of them.
    pub async fn records_for_agent(
        &self,
        agent_name: &AgentName,
        range: TimeRange,
        limit: Option<usize>,
    ) -> Result<Vec<InferenceRecord>, AuditError> {
        let mut records: Vec<_> = self
            .scan(&format!("{AUDIT_PREFIX}/"))
            .await?
            .into_iter()
            .filter(|record| &record.agent_name == agent_name && range.contains(record.timestamp))
            .collect();
        truncate(&mut records, limit);
        Ok(records)
    }

    async fn fetch(&self, key: &str) -> Result<Option<InferenceRecord>, AuditError> {
        let found = retry_transient(self.clock.as_ref(), "audit read", || self.store.get(key)).await?;
        match found {
            Some(Versioned { value, .. }) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StoreError::corrupt(key, e).into()),
            None => Ok(None),
        }
    }

    /// Decoded records under `prefix`, sorted by timestamp.
    async fn scan(&self, prefix: &str) -> Result<Vec<InferenceRecord>, AuditError> {
        let entries = retry_transient(self.clock.as_ref(), "audit scan", || {
            self.store.scan_prefix(prefix)
        })
        .await?;

        let mut records = entries
            .into_iter()
            .map(|(key, Versioned { value, .. })| {
                serde_json::from_value::<InferenceRecord>(value)
                    .map_err(|e| AuditError::from(StoreError::corrupt(&key, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(records)
    }
}

/// Inclusive time window for audit queries; open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

impl TimeRange {
    pub fn between(start: Timestamp, end: Timestamp) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, at: Timestamp) -> bool {
        self.start.map_or(true, |start| start <= at) && self.end.map_or(true, |end| at <= end)
    }
}

fn truncate(records: &mut Vec<InferenceRecord>, limit: Option<usize>) {
    if let Some(limit) = limit {
        records.truncate(limit);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use pipeline::Stage;
    use serde_json::Value;
    use store::MemoryKeyValueStore;

    use super::*;
    use crate::MonotonicClock;

    fn recorder() -> (AuditRecorder, MemoryKeyValueStore) {
        let store = MemoryKeyValueStore::new();
        let recorder = AuditRecorder::new(Arc::new(store.clone()), Arc::new(MonotonicClock::new()));
        (recorder, store)
    }

    async fn open(recorder: &AuditRecorder, job: &JobId, stage: Stage, payload: &str) -> AuditHandle {
        recorder
            .begin(job, &AgentName::from(stage), &ActionName::from(stage), payload)
            .await
            .unwrap()
    }

    fn job() -> JobId {
        JobId::new("job-audit-20250101-000000").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn begin_then_complete_updates_one_record() {
        let (recorder, store) = recorder();
        let handle = open(&recorder, &job(), Stage::Analysis, "{\"request\":\"build\"}").await;

        let pending = recorder.records_for_job(&job(), None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, InferenceStatus::Pending);
        assert_eq!(pending[0].agent_name.as_str(), "requirements-analyst");
        assert_eq!(pending[0].response_payload, None);

        let done = recorder
            .complete(&handle, "raw output", Duration::from_millis(1500))
            .await
            .unwrap();
        assert_eq!(done.status, InferenceStatus::Success);
        assert_eq!(done.duration_seconds, Some(1.5));
        assert_eq!(done.invocation_id, handle.invocation_id());

        let records = recorder.records_for_job(&job(), None).await.unwrap();
        assert_eq!(records, vec![done]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn finalised_records_are_immutable() {
        let (recorder, _) = recorder();
        let handle = open(&recorder, &job(), Stage::Validation, "{}").await;
        recorder.fail(&handle, "boom").await.unwrap();

        let err = recorder
            .complete(&handle, "late", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuditError::AlreadyFinalised {
                status: InferenceStatus::Error,
                ..
            }
        ));
        let records = recorder.records_for_job(&job(), None).await.unwrap();
        assert_eq!(records[0].error_message.as_deref(), Some("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn same_instant_records_get_distinct_keys() {
        let (recorder, _) = recorder();
        // Time does not advance between these calls on a paused runtime.
        let first = open(&recorder, &job(), Stage::Analysis, "a").await;
        let second = open(&recorder, &job(), Stage::Analysis, "b").await;
        assert_ne!(first.key(), second.key());
        assert!(first.timestamp() < second.timestamp());
        assert_eq!(recorder.records_for_job(&job(), None).await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn records_are_scoped_to_their_job() {
        let (recorder, _) = recorder();
        let other = JobId::new("job-audit-20250101-000000-ab12").unwrap();
        open(&recorder, &job(), Stage::Analysis, "a").await;
        open(&recorder, &other, Stage::Analysis, "b").await;
        assert_eq!(recorder.records_for_job(&job(), None).await.unwrap().len(), 1);
        assert_eq!(recorder.records_for_job(&other, None).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_records_cannot_be_completed() {
        let (recorder, store) = recorder();
        let handle = open(&recorder, &job(), Stage::Analysis, "a").await;
        let fresh = AuditRecorder::new(Arc::new(MemoryKeyValueStore::new()), Arc::new(MonotonicClock::new()));
        let err = fresh.complete(&handle, "x", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, AuditError::UnknownRecord { .. }));
        assert_eq!(store.len(), 1);
    }

    /// Store whose first create-only write lands but reports a transient failure.
    struct AckLostStore {
        inner: MemoryKeyValueStore,
        lost: AtomicBool,
    }

    #[async_trait]
    impl KeyValueStore for AckLostStore {
        async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
            self.inner.get(key).await
        }

        async fn put(
            &self,
            key: &str,
            value: Value,
            precondition: WritePrecondition,
        ) -> Result<WriteResult, StoreError> {
            let result = self.inner.put(key, value, precondition).await?;
            if !self.lost.swap(true, Ordering::SeqCst) {
                return Err(StoreError::Transient {
                    message: "request timed out".into(),
                });
            }
            Ok(result)
        }

        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError> {
            self.inner.scan_prefix(prefix).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn begin_adopts_a_write_whose_acknowledgement_was_lost() {
        let inner = MemoryKeyValueStore::new();
        let store = AckLostStore {
            inner: inner.clone(),
            lost: AtomicBool::new(false),
        };
        let recorder = AuditRecorder::new(Arc::new(store), Arc::new(MonotonicClock::new()));

        let handle = open(&recorder, &job(), Stage::Analysis, "a").await;
        assert_eq!(inner.len(), 1);
        let records = recorder.records_for_job(&job(), None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].invocation_id, handle.invocation_id());
        assert_eq!(records[0].timestamp, handle.timestamp());
    }

    #[tokio::test(start_paused = true)]
    async fn get_record_reads_one_entry_by_timestamp() {
        let (recorder, _) = recorder();
        let handle = open(&recorder, &job(), Stage::Validation, "v").await;

        let found = recorder.get_record(&job(), handle.timestamp()).await.unwrap().unwrap();
        assert_eq!(found.invocation_id, handle.invocation_id());
        let later = handle.timestamp().saturating_add(Duration::from_secs(1));
        assert_eq!(recorder.get_record(&job(), later).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn job_queries_honour_the_limit() {
        let (recorder, _) = recorder();
        for stage in [Stage::Analysis, Stage::Architecture, Stage::CodeGeneration] {
            open(&recorder, &job(), stage, "x").await;
        }
        let first_two = recorder.records_for_job(&job(), Some(2)).await.unwrap();
        assert_eq!(first_two.len(), 2);
        assert_eq!(first_two[0].agent_name, AgentName::from(Stage::Analysis));
        assert_eq!(first_two[1].agent_name, AgentName::from(Stage::Architecture));
    }

    #[tokio::test(start_paused = true)]
    async fn agent_queries_span_jobs_within_a_time_range() {
        let clock = Arc::new(MonotonicClock::new());
        let recorder = AuditRecorder::new(Arc::new(MemoryKeyValueStore::new()), clock.clone());
        let other = JobId::new("job-audit-20250101-000000-ab12").unwrap();
        let analyst = AgentName::from(Stage::Analysis);
        let action = ActionName::from(Stage::Analysis);

        let start = clock.now();
        recorder.begin(&job(), &analyst, &action, "1").await.unwrap();
        clock.sleep(Duration::from_secs(10)).await;
        recorder.begin(&other, &analyst, &action, "2").await.unwrap();
        open(&recorder, &other, Stage::Deployment, "3").await;
        clock.sleep(Duration::from_secs(10)).await;
        recorder.begin(&job(), &analyst, &action, "4").await.unwrap();

        let all = recorder
            .records_for_agent(&analyst, TimeRange::default(), None)
            .await
            .unwrap();
        let payloads: Vec<_> = all.iter().map(|r| r.request_payload.as_str()).collect();
        assert_eq!(payloads, ["1", "2", "4"]);

        let window = TimeRange::between(
            start.saturating_add(Duration::from_secs(5)),
            start.saturating_add(Duration::from_secs(20)),
        );
        let windowed = recorder.records_for_agent(&analyst, window, None).await.unwrap();
        let payloads: Vec<_> = windowed.iter().map(|r| r.request_payload.as_str()).collect();
        assert_eq!(payloads, ["2", "4"]);

        let limited = recorder.records_for_agent(&analyst, window, Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].job_id, other);
    }
}
