//! In-process stores.
//!
//! Cloning a store shares its contents, so several engine instances (standing
//! in for separate processes) can coordinate through one value.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use pipeline::{BlobStore, KeyValueStore, StoreError, Versioned, WritePrecondition, WriteResult};

fn poisoned() -> StoreError {
    StoreError::Unavailable {
        message: "lock poisoned".into(),
    }
}

/// [`KeyValueStore`] backed by a shared in-memory map.
#[derive(Clone, Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Arc<RwLock<BTreeMap<String, Versioned>>>,
}

impl MemoryKeyValueStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Returns `true` if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    async fn put(
        &self,
        key: &str,
        value: Value,
        precondition: WritePrecondition,
    ) -> Result<WriteResult, StoreError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let current = entries.get(key).map(|v| v.version);

        let allowed = match precondition {
            WritePrecondition::None => true,
            WritePrecondition::DoesNotExist => current.is_none(),
            WritePrecondition::MatchesVersion(expected) => current == Some(expected),
        };
        if !allowed {
            return Ok(WriteResult::PreconditionFailed {
                current_version: current,
            });
        }

        let version = current.unwrap_or(0) + 1;
        entries.insert(key.to_string(), Versioned { version, value });
        Ok(WriteResult::Success { version })
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// [`BlobStore`] backed by a shared in-memory map.
#[derive(Clone, Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently stored.
    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    /// Returns `true` if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let mut blobs = self.blobs.write().map_err(|_| poisoned())?;
        blobs.insert(path.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        Ok(blobs.get(path).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        Ok(blobs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
