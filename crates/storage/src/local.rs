//! Local filesystem storage backend
//!
//! Writes go to a hidden temp file next to the target, are fsynced, then
//! renamed over the target, so a crash mid-write leaves the previous artifact
//! intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{ObjectKind, StorageBackend};

fn storage_error(action: &str, target: impl std::fmt::Debug, e: std::io::Error) -> Error {
    Error::Storage {
        message: format!("Failed to {} {:?}: {}", action, target, e),
    }
}

/// Local filesystem storage backend rooted at a base directory
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a backend rooted at `base_path`
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Get the base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a relative key to a filesystem path
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }

    /// Unique hidden sibling used for the atomic write
    fn temp_path(full_path: &Path) -> PathBuf {
        let temp_name = format!(
            ".{}.{}.tmp",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        );
        full_path.with_file_name(temp_name)
    }

    fn is_temp_file(path: &Path) -> bool {
        path.file_name()
            .map(|n| {
                let n = n.to_string_lossy();
                n.starts_with('.') && n.ends_with(".tmp")
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.resolve_path(path);
        debug!(?full_path, "Reading file");

        match fs::read(&full_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(storage_error("read", &full_path, e)),
        }
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.resolve_path(path);
        let temp_path = Self::temp_path(&full_path);
        let size = data.len() as u64;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error("create directory", parent, e))?;
        }

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| storage_error("create temp file", &temp_path, e))?;
        file.write_all(&data)
            .await
            .map_err(|e| storage_error("write", &temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| storage_error("sync", &temp_path, e))?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(storage_error("rename temp file onto", &full_path, e));
        }

        debug!(?full_path, size, "File written atomically");
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn stat(&self, path: &str) -> Result<Option<ObjectKind>> {
        let full_path = self.resolve_path(path);

        match fs::metadata(&full_path).await {
            Ok(meta) if meta.is_dir() => Ok(Some(ObjectKind::Directory)),
            Ok(_) => Ok(Some(ObjectKind::File)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("stat", &full_path, e)),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let search_path = self.resolve_path(prefix);
        let mut results = Vec::new();

        // A prefix may name a directory or a partial file name within one
        let dir_to_scan = if search_path.is_dir() {
            search_path
        } else {
            match search_path.parent() {
                Some(parent) if parent.is_dir() => parent.to_path_buf(),
                _ => return Ok(results),
            }
        };

        let mut stack = vec![dir_to_scan];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let entry_path = entry.path();
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };

                if file_type.is_dir() {
                    stack.push(entry_path);
                } else if file_type.is_file() && !Self::is_temp_file(&entry_path) {
                    if let Ok(relative) = entry_path.strip_prefix(&self.base_path) {
                        let relative = relative.to_string_lossy().replace('\\', "/");
                        if relative.starts_with(prefix) {
                            results.push(relative);
                        }
                    }
                }
            }
        }

        results.sort();
        debug!(count = results.len(), "Listed objects");
        Ok(results)
    }
}
