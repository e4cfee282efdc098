//! Storage backend trait definition

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::Result;

/// What lives at a storage path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    File,
    Directory,
}

/// Async trait for storage backends
///
/// All paths are relative to the backend root. Writes must be atomic at the
/// object boundary: a reader sees either the previous object or the new one,
/// never a partial write.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the object at `path`
    ///
    /// # Errors
    /// `StoragePathNotFound` if nothing exists at `path`
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write `data` to `path`, creating parent directories
    ///
    /// Returns the number of bytes written.
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Describe what exists at `path`, if anything
    async fn stat(&self, path: &str) -> Result<Option<ObjectKind>>;

    /// List all object paths under a given prefix, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Shared handle to a storage backend
pub type StorageHandle = Arc<dyn StorageBackend>;
