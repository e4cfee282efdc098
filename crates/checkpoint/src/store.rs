//! Artifact store over a storage backend
//!
//! Single-file artifacts are addressed by key; distributed artifacts by
//! (directory, rank).

use std::time::Duration;

use bytes::Bytes;
use runtime_core::{Epoch, Error, Rank, Result, Snapshot};
use storage::{ObjectKind, StorageHandle};
use tracing::{debug, warn};

use crate::format::{decode_artifact, encode_artifact, ArtifactHeader, DistributedManifest};
use crate::layout::{manifest_key, shard_key};

/// Reads and writes checkpoint artifacts
#[derive(Clone)]
pub struct ArtifactStore {
    backend: StorageHandle,
    write_retries: u32,
}

impl ArtifactStore {
    pub fn new(backend: StorageHandle) -> Self {
        Self {
            backend,
            write_retries: 0,
        }
    }

    /// Retry writes that fail with a retryable error up to `retries` times
    pub fn with_write_retries(mut self, retries: u32) -> Self {
        self.write_retries = retries;
        self
    }

    /// Write `data` to `key`, backing off between retryable failures
    async fn write_with_retry(&self, key: &str, data: Bytes) -> Result<u64> {
        let mut attempt = 0u32;
        loop {
            match self.backend.write(key, data.clone()).await {
                Err(e) if e.is_retryable() && attempt < self.write_retries => {
                    attempt += 1;
                    let delay = Duration::from_millis(e.retry_delay_hint_ms().unwrap_or(100) * u64::from(attempt));
                    warn!(
                        key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Artifact write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    /// What exists at `key`, if anything
    pub async fn probe(&self, key: &str) -> Result<Option<ObjectKind>> {
        self.backend.stat(key).await
    }

    /// Encode and atomically write one artifact file
    pub async fn write_artifact(&self, key: &str, header: &ArtifactHeader, snapshot: &Snapshot) -> Result<u64> {
        let data = encode_artifact(header, snapshot)?;
        let expected = data.len() as u64;

        let written = self.write_with_retry(key, data).await?;
        if written != expected {
            return Err(Error::CheckpointWriteFailed {
                message: format!("{}: wrote {} of {} bytes", key, written, expected),
            });
        }

        debug!(key, size_bytes = written, entries = snapshot.len(), "Artifact written");
        Ok(written)
    }

    /// Read and decode one artifact file
    pub async fn read_artifact(&self, key: &str) -> Result<(ArtifactHeader, Snapshot)> {
        let data = self.backend.read(key).await.map_err(|e| match e {
            Error::StoragePathNotFound { path } => Error::ArtifactNotFound { path },
            other => other,
        })?;
        decode_artifact(key, data)
    }

    /// Write one rank's entry of a distributed checkpoint
    pub async fn write_shard(
        &self,
        dir: &str,
        rank: Rank,
        header: &ArtifactHeader,
        snapshot: &Snapshot,
    ) -> Result<u64> {
        self.write_artifact(&shard_key(dir, rank), header, snapshot).await
    }

    /// Read one rank's entry of a distributed checkpoint
    pub async fn read_shard(&self, dir: &str, rank: Rank) -> Result<(ArtifactHeader, Snapshot)> {
        self.read_artifact(&shard_key(dir, rank)).await
    }

    pub async fn write_manifest(&self, dir: &str, manifest: &DistributedManifest) -> Result<u64> {
        self.write_with_retry(&manifest_key(dir), manifest.to_bytes()?).await
    }

    pub async fn read_manifest(&self, dir: &str) -> Result<DistributedManifest> {
        let key = manifest_key(dir);
        let data = self.backend.read(&key).await.map_err(|e| match e {
            Error::StoragePathNotFound { path } => Error::ArtifactNotFound { path },
            other => other,
        })?;
        DistributedManifest::from_bytes(&key, &data)
    }

    /// Highest epoch among keys under `prefix` that `parse` recognizes
    pub async fn latest_epoch<F>(&self, prefix: &str, parse: F) -> Result<Option<Epoch>>
    where
        F: Fn(&str) -> Option<Epoch>,
    {
        let keys = self.backend.list(prefix).await?;
        Ok(keys.iter().filter_map(|k| parse(k)).max())
    }
}
