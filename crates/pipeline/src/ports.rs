//! Port traits: what the engine needs from the outside world.
//!
//! Infrastructure crates implement these; the engine only ever sees the traits.
//!
//! | Trait | Implemented by |
//! |-------|----------------|
//! | [`KeyValueStore`] | `store::MemoryKeyValueStore`, `store::FsKeyValueStore` |
//! | [`BlobStore`] | `store::MemoryBlobStore`, `store::FsBlobStore` |
//! | [`StageExecutor`] | `agents::HttpStageExecutor` (and test doubles) |
//! | [`Clock`] | `engine::SystemClock`, `engine::MonotonicClock` |

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{JobId, Stage, StageError, StoreError, Timestamp};

// ---------------------------------------------------------------------------
// Key-value store
// ---------------------------------------------------------------------------

/// A stored value together with its version token.
///
/// Versions start at `1` for a newly created key and increase by one on every
/// successful write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub version: u64,
    pub value: Value,
}

/// Precondition attached to a key-value write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if the key does not exist.
    DoesNotExist,
    /// Write only if the stored version matches.
    MatchesVersion(u64),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded; carries the new version.
    Success { version: u64 },
    /// Precondition failed; carries the current version (`None` if absent).
    PreconditionFailed { current_version: Option<u64> },
}

/// Durable key-value store used for audit records, job records and the
/// rate-limit singleton.
///
/// Implementations must make `put` with a precondition atomic with respect to
/// every other writer that shares the store, including writers in other
/// processes.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads the value at `key`, or `None` if it was never written.
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Writes `value` at `key` subject to `precondition`.
    ///
    /// A failed precondition is a normal result, never an error.
    async fn put(
        &self,
        key: &str,
        value: Value,
        precondition: WritePrecondition,
    ) -> Result<WriteResult, StoreError>;

    /// Returns every entry whose key starts with `prefix`, sorted by key.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError>;
}

/// Maximum read-modify-write cycles [`update`] attempts before giving up.
pub const MAX_UPDATE_ATTEMPTS: u32 = 8;

/// Reads `key` and decodes it as `T`.
pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<(T, u64)>, StoreError> {
    match store.get(key).await? {
        Some(versioned) => {
            let decoded =
                serde_json::from_value(versioned.value).map_err(|e| StoreError::corrupt(key, e))?;
            Ok(Some((decoded, versioned.version)))
        }
        None => Ok(None),
    }
}

/// Optimistic read-modify-write of one key.
///
/// `mutator` receives the current decoded value (or `None`) and returns the
/// value to store. If another writer gets in between the read and the write,
/// the cycle restarts with the fresh value. The mutator may reject the current
/// value by returning an error, which aborts the update.
pub async fn update<T, E, F>(store: &dyn KeyValueStore, key: &str, mut mutator: F) -> Result<(T, u64), E>
where
    T: Serialize + DeserializeOwned + Send,
    E: From<StoreError>,
    F: FnMut(Option<T>) -> Result<T, E> + Send,
{
    for _ in 0..MAX_UPDATE_ATTEMPTS {
        let current = get_typed::<T>(store, key).await?;
        let precondition = match &current {
            Some((_, version)) => WritePrecondition::MatchesVersion(*version),
            None => WritePrecondition::DoesNotExist,
        };
        let next = mutator(current.map(|(value, _)| value))?;
        let encoded = serde_json::to_value(&next).map_err(|e| StoreError::corrupt(key, e))?;
        match store.put(key, encoded, precondition).await? {
            WriteResult::Success { version } => return Ok((next, version)),
            WriteResult::PreconditionFailed { current_version } => {
                tracing::debug!(key, ?current_version, "update lost a write race; retrying");
            }
        }
    }
    Err(StoreError::Conflict {
        key: key.to_string(),
        attempts: MAX_UPDATE_ATTEMPTS,
    }
    .into())
}

// ---------------------------------------------------------------------------
// Blob store
// ---------------------------------------------------------------------------

/// Path-addressed blob storage for artifacts.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` at `path`, replacing any previous content.
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Reads the blob at `path`; `None` when nothing was ever written there.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Lists blob paths starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

// ---------------------------------------------------------------------------
// Stage executor
// ---------------------------------------------------------------------------

/// Input handed to a [`StageExecutor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRequest {
    /// Job the call belongs to; agents use it as their session identifier.
    pub job_id: JobId,
    /// Stage being executed.
    pub stage: Stage,
    /// Stage input composed from the seed request and prior outputs.
    pub input: Value,
}

/// Executes the domain work of one pipeline stage on a remote agent.
///
/// Returns the raw response text. Implementations classify failures as
/// [`StageError::Throttled`] (retryable) or [`StageError::Failed`].
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, request: &StageRequest) -> Result<String, StageError>;
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of wall-clock time and the only way the engine suspends.
///
/// Shared by rate limiting, backoff and audit timestamps so tests can run the
/// whole engine on simulated time.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> Timestamp;

    /// Suspends the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;

    /// Minimal store for exercising the free functions in this module.
    #[derive(Default)]
    struct MapStore {
        entries: Mutex<BTreeMap<String, Versioned>>,
        /// Number of upcoming puts that should lose a race.
        lose_next: Mutex<u32>,
    }

    #[async_trait]
    impl KeyValueStore for MapStore {
        async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn put(
            &self,
            key: &str,
            value: Value,
            precondition: WritePrecondition,
        ) -> Result<WriteResult, StoreError> {
            let mut entries = self.entries.lock().unwrap();
            let current = entries.get(key).map(|v| v.version);
            {
                let mut lose = self.lose_next.lock().unwrap();
                if *lose > 0 {
                    *lose -= 1;
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: current,
                    });
                }
            }
            let ok = match precondition {
                WritePrecondition::None => true,
                WritePrecondition::DoesNotExist => current.is_none(),
                WritePrecondition::MatchesVersion(v) => current == Some(v),
            };
            if !ok {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: current,
                });
            }
            let version = current.unwrap_or(0) + 1;
            entries.insert(key.to_string(), Versioned { version, value });
            Ok(WriteResult::Success { version })
        }

        async fn scan_prefix(
            &self,
            prefix: &str,
        ) -> Result<Vec<(String, Versioned)>, StoreError> {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }
    }

    #[tokio::test]
    async fn update_creates_then_increments() {
        let store = MapStore::default();
        let (value, version) = update::<u32, StoreError, _>(&store, "counter", |current| {
            Ok(current.unwrap_or(0) + 1)
        })
        .await
        .unwrap();
        assert_eq!((value, version), (1, 1));

        let (value, version) = update::<u32, StoreError, _>(&store, "counter", |current| {
            Ok(current.unwrap_or(0) + 1)
        })
        .await
        .unwrap();
        assert_eq!((value, version), (2, 2));
    }

    #[tokio::test]
    async fn update_retries_lost_races_and_eventually_conflicts() {
        let store = MapStore::default();
        *store.lose_next.lock().unwrap() = 2;
        let mut calls = 0;
        let (value, _) = update::<u32, StoreError, _>(&store, "k", |_| {
            calls += 1;
            Ok(7)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls, 3);

        *store.lose_next.lock().unwrap() = MAX_UPDATE_ATTEMPTS;
        let err = update::<u32, StoreError, _>(&store, "k", |_| Ok(8))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { attempts, .. } if attempts == MAX_UPDATE_ATTEMPTS));
    }

    #[tokio::test]
    async fn get_typed_reports_corrupt_values() {
        let store = MapStore::default();
        store
            .put("k", Value::String("not a number".into()), WritePrecondition::None)
            .await
            .unwrap();
        let err = get_typed::<u32>(&store, "k").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
