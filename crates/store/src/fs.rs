//! Filesystem-backed stores.
//!
//! Keys and blob paths map onto a directory tree under a root directory. Every
//! write goes to a hidden temporary file first and is then renamed into place,
//! so readers never observe partial content. Conditional key-value writes are
//! serialised across processes with a per-key lock file created with
//! `create_new` (the filesystem's "does not exist" precondition).

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use pipeline::{BlobStore, KeyValueStore, StoreError, Versioned, WritePrecondition, WriteResult};

/// How long to wait for a contended key lock before reporting a transient failure.
const LOCK_WAIT: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a key lock.
const LOCK_POLL: Duration = Duration::from_millis(10);

/// Lock files older than this are assumed to belong to a crashed writer.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn io_error(context: &str, err: io::Error) -> StoreError {
    let message = format!("{context}: {err}");
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => {
            StoreError::Transient { message }
        }
        _ => StoreError::Unavailable { message },
    }
}

/// Resolves a `/`-separated key under `root`, rejecting anything that could
/// escape it or collide with the store's hidden bookkeeping files.
fn resolve(root: &Path, key: &str, extension: Option<&str>) -> Result<PathBuf, StoreError> {
    let invalid = || StoreError::Corrupt {
        key: key.to_string(),
        message: "invalid key".into(),
    };
    let mut path = root.to_path_buf();
    let segments: Vec<&str> = key.split('/').collect();
    for segment in &segments {
        if segment.is_empty() || segment.starts_with('.') || segment.contains('\\') {
            return Err(invalid());
        }
        if !matches!(Path::new(segment).components().next(), Some(Component::Normal(_))) {
            return Err(invalid());
        }
    }
    for (i, segment) in segments.iter().enumerate() {
        if i + 1 == segments.len() {
            match extension {
                Some(ext) => path.push(format!("{segment}.{ext}")),
                None => path.push(segment),
            }
        } else {
            path.push(segment);
        }
    }
    Ok(path)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{suffix}"))
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error("create directory", e))?;
    }
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp = sibling(path, &format!("tmp-{}-{n}", std::process::id()));
    tokio::fs::write(&temp, bytes)
        .await
        .map_err(|e| io_error("write temporary file", e))?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(io_error("rename into place", e));
    }
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error("read", e)),
    }
}

/// Returns every visible file below `root` as a `/`-joined relative path.
async fn walk(root: &Path) -> Result<Vec<String>, StoreError> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(io_error("read directory", e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("read directory entry", e))?
        {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| io_error("stat", e))?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                if let Ok(relative) = path.strip_prefix(root) {
                    let parts: Vec<String> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    found.push(parts.join("/"));
                }
            }
        }
    }
    found.sort();
    Ok(found)
}

// ---------------------------------------------------------------------------
// Key lock
// ---------------------------------------------------------------------------

/// Exclusive lock on one key file, held for the duration of a conditional write.
struct KeyLock {
    path: PathBuf,
    released: bool,
}

impl KeyLock {
    async fn acquire(target: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create directory", e))?;
        }
        let path = sibling(target, "lock");
        let started = tokio::time::Instant::now();
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => {
                    return Ok(Self {
                        path,
                        released: false,
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if Self::is_stale(&path).await {
                        warn!(lock = %path.display(), "removing stale key lock");
                        let _ = tokio::fs::remove_file(&path).await;
                        continue;
                    }
                    if started.elapsed() >= LOCK_WAIT {
                        return Err(StoreError::Transient {
                            message: format!("timed out waiting for {}", path.display()),
                        });
                    }
                    tokio::time::sleep(LOCK_POLL).await;
                }
                Err(e) => return Err(io_error("create lock file", e)),
            }
        }
    }

    async fn is_stale(path: &Path) -> bool {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return false;
        };
        meta.modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > STALE_LOCK_AGE)
    }

    async fn release(mut self) {
        self.released = true;
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            warn!(lock = %self.path.display(), error = %e, "failed to remove key lock");
        }
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// ---------------------------------------------------------------------------
// Key-value store
// ---------------------------------------------------------------------------

/// [`KeyValueStore`] persisting one JSON file per key under a root directory.
///
/// Safe to share between processes on the same filesystem.
#[derive(Clone, Debug)]
pub struct FsKeyValueStore {
    root: PathBuf,
}

impl FsKeyValueStore {
    /// Creates a store rooted at `root`; the directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_versioned(&self, key: &str, path: &Path) -> Result<Option<Versioned>, StoreError> {
        match read_optional(path).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::corrupt(key, e)),
            None => Ok(None),
        }
    }

    async fn put_locked(
        &self,
        key: &str,
        path: &Path,
        value: Value,
        precondition: WritePrecondition,
    ) -> Result<WriteResult, StoreError> {
        let current = self.read_versioned(key, path).await?.map(|v| v.version);
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
        let bytes = serde_json::to_vec(&Versioned { version, value })
            .map_err(|e| StoreError::corrupt(key, e))?;
        write_atomic(path, &bytes).await?;
        Ok(WriteResult::Success { version })
    }
}

#[async_trait]
impl KeyValueStore for FsKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let path = resolve(&self.root, key, Some("json"))?;
        self.read_versioned(key, &path).await
    }

    async fn put(
        &self,
        key: &str,
        value: Value,
        precondition: WritePrecondition,
    ) -> Result<WriteResult, StoreError> {
        let path = resolve(&self.root, key, Some("json"))?;
        let lock = KeyLock::acquire(&path).await?;
        let result = self.put_locked(key, &path, value, precondition).await;
        lock.release().await;
        result
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError> {
        let mut out = Vec::new();
        for file in walk(&self.root).await? {
            let Some(key) = file.strip_suffix(".json") else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            let path = resolve(&self.root, key, Some("json"))?;
            if let Some(versioned) = self.read_versioned(key, &path).await? {
                out.push((key.to_string(), versioned));
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Blob store
// ---------------------------------------------------------------------------

/// [`BlobStore`] persisting one file per blob path under a root directory.
#[derive(Clone, Debug)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Creates a store rooted at `root`; the directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let target = resolve(&self.root, path, None)?;
        write_atomic(&target, &bytes).await
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let target = resolve(&self.root, path, None)?;
        read_optional(&target).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(walk(&self.root)
            .await?
            .into_iter()
            .filter(|p| p.starts_with(prefix))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn key_value_round_trip_with_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsKeyValueStore::new(dir.path());

        assert_eq!(store.get("jobs/job-a").await.unwrap(), None);
        let first = store
            .put("jobs/job-a", json!({"n": 1}), WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        assert_eq!(first, WriteResult::Success { version: 1 });

        let again = store
            .put("jobs/job-a", json!({"n": 2}), WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        assert_eq!(
            again,
            WriteResult::PreconditionFailed {
                current_version: Some(1)
            }
        );

        let second = store
            .put("jobs/job-a", json!({"n": 3}), WritePrecondition::MatchesVersion(1))
            .await
            .unwrap();
        assert_eq!(second, WriteResult::Success { version: 2 });

        let stored = store.get("jobs/job-a").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.value, json!({"n": 3}));
    }

    #[tokio::test]
    async fn scan_ignores_bookkeeping_files_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsKeyValueStore::new(dir.path());
        for key in ["audit/job-a/2", "audit/job-a/1", "audit/job-b/1"] {
            store.put(key, json!(key), WritePrecondition::None).await.unwrap();
        }
        std::fs::write(dir.path().join("audit/job-a/.1.json.lock"), b"").unwrap();

        let keys: Vec<_> = store
            .scan_prefix("audit/job-a/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["audit/job-a/1", "audit/job-a/2"]);
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsKeyValueStore::new(dir.path());
        for key in ["../outside", "a//b", ".hidden", ""] {
            let err = store
                .put(key, json!(null), WritePrecondition::None)
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::Corrupt { .. }), "key {key:?}");
        }
    }

    #[tokio::test]
    async fn concurrent_creates_admit_exactly_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsKeyValueStore::new(dir.path());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .put("race/key", json!(i), WritePrecondition::DoesNotExist)
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), WriteResult::Success { .. }) {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn blobs_round_trip_and_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(dir.path());
        assert_eq!(blobs.get("job-a/code/code-generator/code.json").await.unwrap(), None);

        blobs
            .put("job-a/code/code-generator/code.json", b"{}".to_vec())
            .await
            .unwrap();
        blobs
            .put("job-a/code/code-generator/raw_response.json", b"raw".to_vec())
            .await
            .unwrap();
        assert_eq!(
            blobs.get("job-a/code/code-generator/code.json").await.unwrap(),
            Some(b"{}".to_vec())
        );
        assert_eq!(
            blobs.list("job-a/code/").await.unwrap(),
            vec![
                "job-a/code/code-generator/code.json".to_string(),
                "job-a/code/code-generator/raw_response.json".to_string(),
            ]
        );
    }
}
