//! Artifact store: raw and derived stage outputs, addressed by path.
//!
//! Layout is `{job_id}/{phase}/{stage_name}/{filename}`. Each successful stage
//! writes its raw response text and its converted JSON form.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error};

use pipeline::{ArtifactKind, ArtifactRef, BlobStore, Clock, JobId, Stage, StoreError};

use crate::error::retry_transient;

/// File name of the raw response artifact of every stage.
pub const RAW_RESPONSE_FILENAME: &str = "raw_response.txt";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArtifactError {
    /// A path component was empty or contained a separator.
    #[error("Invalid artifact path component {component:?}")]
    InvalidComponent { component: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Only some of a stage's artifacts were written.
    #[error("Stage {stage} artifacts incomplete: wrote {written:?}; {message}")]
    Incomplete {
        stage: Stage,
        written: Vec<String>,
        message: String,
    },
}

pub struct ArtifactStore {
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
}

fn check_component(component: &str) -> Result<&str, ArtifactError> {
    if component.is_empty()
        || component.contains('/')
        || component.contains('\\')
        || component == "."
        || component == ".."
    {
        return Err(ArtifactError::InvalidComponent {
            component: component.to_string(),
        });
    }
    Ok(component)
}

/// Builds `{job_id}/{phase}/{stage_name}/{filename}`.
pub fn artifact_path(
    job_id: &JobId,
    phase: &str,
    stage_name: &str,
    filename: &str,
) -> Result<String, ArtifactError> {
    Ok(format!(
        "{}/{}/{}/{}",
        check_component(job_id.as_str())?,
        check_component(phase)?,
        check_component(stage_name)?,
        check_component(filename)?
    ))
}

impl ArtifactStore {
    pub fn new(blobs: Arc<dyn BlobStore>, clock: Arc<dyn Clock>) -> Self {
        Self { blobs, clock }
    }

    /// Stores `content` and returns its reference.
    pub async fn put(
        &self,
        job_id: &JobId,
        phase: &str,
        stage_name: &str,
        filename: &str,
        content: &[u8],
        kind: ArtifactKind,
    ) -> Result<ArtifactRef, ArtifactError> {
        let path = artifact_path(job_id, phase, stage_name, filename)?;
        retry_transient(self.clock.as_ref(), "artifact put", || {
            self.blobs.put(&path, content.to_vec())
        })
        .await?;
        debug!(path = %path, size = content.len(), "artifact stored");
        Ok(ArtifactRef {
            path,
            kind,
            size_bytes: content.len(),
        })
    }

    /// Reads an artifact; `None` when it was never written.
    pub async fn get(
        &self,
        job_id: &JobId,
        phase: &str,
        stage_name: &str,
        filename: &str,
    ) -> Result<Option<Vec<u8>>, ArtifactError> {
        let path = artifact_path(job_id, phase, stage_name, filename)?;
        Ok(retry_transient(self.clock.as_ref(), "artifact get", || self.blobs.get(&path)).await?)
    }

    /// Writes both artifacts of a successful stage: raw text, then derived JSON.
    pub async fn put_stage_output(
        &self,
        job_id: &JobId,
        stage: Stage,
        raw: &str,
        derived: &serde_json::Value,
    ) -> Result<[ArtifactRef; 2], ArtifactError> {
        let raw_ref = self
            .put(
                job_id,
                stage.phase(),
                stage.agent_name(),
                RAW_RESPONSE_FILENAME,
                raw.as_bytes(),
                ArtifactKind::Raw,
            )
            .await?;

        let derived_bytes = serde_json::to_vec_pretty(derived).map_err(|e| {
            ArtifactError::Incomplete {
                stage,
                written: vec![raw_ref.path.clone()],
                message: e.to_string(),
            }
        })?;
        match self
            .put(
                job_id,
                stage.phase(),
                stage.agent_name(),
                stage.derived_filename(),
                &derived_bytes,
                ArtifactKind::Derived,
            )
            .await
        {
            Ok(derived_ref) => Ok([raw_ref, derived_ref]),
            Err(err) => {
                error!(job_id = %job_id, stage = %stage, error = %err, "derived artifact write failed after raw artifact was stored");
                Err(ArtifactError::Incomplete {
                    stage,
                    written: vec![raw_ref.path],
                    message: err.to_string(),
                })
            }
        }
    }

    /// Paths of a job's artifacts, optionally narrowed to one phase.
    pub async fn list(
        &self,
        job_id: &JobId,
        phase: Option<&str>,
    ) -> Result<Vec<String>, ArtifactError> {
        let mut prefix = format!("{}/", check_component(job_id.as_str())?);
        if let Some(phase) = phase {
            prefix.push_str(check_component(phase)?);
            prefix.push('/');
        }
        Ok(retry_transient(self.clock.as_ref(), "artifact list", || self.blobs.list(&prefix)).await?)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;
    use store::MemoryBlobStore;

    use super::*;
    use crate::MonotonicClock;

    fn job() -> JobId {
        JobId::new("job-artifact-20250101-000000").unwrap()
    }

    fn artifacts(blobs: Arc<dyn BlobStore>) -> ArtifactStore {
        ArtifactStore::new(blobs, Arc::new(MonotonicClock::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn put_then_get_returns_identical_content() {
        let store = artifacts(Arc::new(MemoryBlobStore::new()));
        let content = "line one\nline two \u{1F680}\n".as_bytes();
        let reference = store
            .put(&job(), "code", "code-generator", "notes.txt", content, ArtifactKind::Raw)
            .await
            .unwrap();
        assert_eq!(reference.path, "job-artifact-20250101-000000/code/code-generator/notes.txt");
        assert_eq!(reference.size_bytes, content.len());

        let read = store
            .get(&job(), "code", "code-generator", "notes.txt")
            .await
            .unwrap();
        assert_eq!(read.as_deref(), Some(content));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_artifacts_are_none() {
        let store = artifacts(Arc::new(MemoryBlobStore::new()));
        let read = store
            .get(&job(), "code", "code-generator", "absent.json")
            .await
            .unwrap();
        assert_eq!(read, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stage_output_writes_raw_and_derived_forms() {
        let store = artifacts(Arc::new(MemoryBlobStore::new()));
        let [raw, derived] = store
            .put_stage_output(&job(), Stage::Architecture, "```json\n{}\n```", &json!({"layers": 3}))
            .await
            .unwrap();
        assert_eq!(raw.kind, ArtifactKind::Raw);
        assert!(raw.path.ends_with("/architecture/solution-architect/raw_response.txt"));
        assert_eq!(derived.kind, ArtifactKind::Derived);
        assert!(derived.path.ends_with("/architecture/solution-architect/architecture.json"));

        let bytes = store
            .get(&job(), "architecture", "solution-architect", "architecture.json")
            .await
            .unwrap()
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, json!({"layers": 3}));
    }

    #[tokio::test(start_paused = true)]
    async fn listing_filters_by_job_and_phase() {
        let store = artifacts(Arc::new(MemoryBlobStore::new()));
        store
            .put_stage_output(&job(), Stage::Analysis, "a", &json!({}))
            .await
            .unwrap();
        store
            .put_stage_output(&job(), Stage::CodeGeneration, "b", &json!({}))
            .await
            .unwrap();
        let other = JobId::new("job-artifact-20250101-000000-beef").unwrap();
        store
            .put_stage_output(&other, Stage::Analysis, "c", &json!({}))
            .await
            .unwrap();

        assert_eq!(store.list(&job(), None).await.unwrap().len(), 4);
        let code = store.list(&job(), Some("code")).await.unwrap();
        assert_eq!(code.len(), 2);
        assert!(code.iter().all(|p| p.starts_with("job-artifact-20250101-000000/code/")));
    }

    #[tokio::test(start_paused = true)]
    async fn path_components_are_validated() {
        let store = artifacts(Arc::new(MemoryBlobStore::new()));
        let err = store
            .put(&job(), "../etc", "x", "y", b"z", ArtifactKind::Raw)
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidComponent { .. }));
        assert!(store.get(&job(), "code", "", "f").await.is_err());
    }

    /// Accepts the raw artifact, rejects everything after it.
    struct FailsSecondWrite(MemoryBlobStore);

    #[async_trait]
    impl BlobStore for FailsSecondWrite {
        async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
            if path.ends_with(RAW_RESPONSE_FILENAME) {
                self.0.put(path, bytes).await
            } else {
                Err(StoreError::Unavailable {
                    message: "disk full".into(),
                })
            }
        }

        async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.0.get(path).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.0.list(prefix).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn partial_stage_output_is_an_error() {
        let store = artifacts(Arc::new(FailsSecondWrite(MemoryBlobStore::new())));
        let err = store
            .put_stage_output(&job(), Stage::Deployment, "raw", &json!({}))
            .await
            .unwrap_err();
        match err {
            ArtifactError::Incomplete { stage, written, .. } => {
                assert_eq!(stage, Stage::Deployment);
                assert_eq!(written.len(), 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
