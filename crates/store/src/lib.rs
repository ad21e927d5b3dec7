//! AgentForge storage adapters.
//!
//! Implements the [`pipeline::KeyValueStore`] and [`pipeline::BlobStore`] ports
//! with two backends:
//!
//! - [`MemoryKeyValueStore`] / [`MemoryBlobStore`]: shared in-process maps.
//!   Used by tests and single-process runs.
//! - [`FsKeyValueStore`] / [`FsBlobStore`]: a directory tree on the local
//!   filesystem. Several processes pointed at the same root share audit
//!   records, job records and the global rate-limit record.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Serialisation layout, file locking and atomic renames
//! live here. The engine sees only the port traits.

mod fs;
mod memory;

pub use fs::{FsBlobStore, FsKeyValueStore};
pub use memory::{MemoryBlobStore, MemoryKeyValueStore};
