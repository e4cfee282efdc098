//! Distributed (per-rank) model checkpoints
//!
//! Each rank writes its own shard into a per-epoch directory with no
//! collective. On load the coordinator decides whether the directory is
//! usable, every rank reads its own shard, and nothing is applied until all
//! ranks have read successfully.

use std::time::Instant;

use runtime_core::{ArtifactPurpose, CheckpointMode, Epoch, Error, Rank, Result, Snapshot};
use storage::ObjectKind;
use tracing::{info, warn};

use crate::checkpointer::{Checkpointer, LoadDecision};
use crate::events::{track_progress, CheckpointEvent, Phase};
use crate::format::{ArtifactHeader, DistributedManifest};
use crate::layout::shard_key;
use crate::provider::ShardSnapshotProvider;

impl Checkpointer {
    /// Write this rank's shard for `epoch`
    ///
    /// No collective is involved; ranks finish in any order. The coordinating
    /// rank also writes the directory manifest.
    pub async fn save_distributed<M>(&self, model: &M, epoch: Epoch) -> Result<()>
    where
        M: ShardSnapshotProvider + ?Sized,
    {
        self.require_mode("save_distributed", CheckpointMode::Distributed)?;

        let rank = self.role.rank();
        let dir = self.layout.distributed_dir(epoch);
        let path = shard_key(&dir, rank);
        let start = Instant::now();
        self.events
            .emit(CheckpointEvent::Started {
                purpose: ArtifactPurpose::Model,
                rank,
                target: path.clone(),
            })
            .await;

        let snapshot = model.local_snapshot().await?;
        if snapshot.owner() != Some(rank) {
            return Err(Error::SnapshotMismatch {
                message: format!("rank {} produced a {:?} snapshot", rank, snapshot.scope()),
            });
        }

        let header = self
            .header(ArtifactPurpose::Model, CheckpointMode::Distributed, epoch)
            .with_rank(rank);
        let size_bytes = track_progress(
            &self.events,
            ArtifactPurpose::Model,
            rank,
            Phase::Writing,
            self.config.progress_interval,
            self.store.write_shard(&dir, rank, &header, &snapshot),
        )
        .await?;
        self.trace_rank(&format!("wrote {} parameters to {}", snapshot.len(), path));

        if self.role.is_coordinator() {
            let manifest = DistributedManifest::new(&self.config.model_name, epoch, self.role.world_size());
            self.store.write_manifest(&dir, &manifest).await?;
            info!(
                dir = %dir,
                epoch,
                world_size = self.role.world_size(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Distributed checkpoint saved"
            );
        }

        self.events
            .emit(CheckpointEvent::Completed {
                artifact: header.artifact_id(),
                rank,
                path,
                size_bytes,
                elapsed: start.elapsed(),
            })
            .await;
        Ok(())
    }

    /// Restore every rank's shard from a distributed checkpoint
    ///
    /// Every rank must call this on a sharded model. Returns `false` on every
    /// rank when no checkpoint directory exists.
    pub async fn load_distributed<M>(&self, model: &mut M) -> Result<bool>
    where
        M: ShardSnapshotProvider + ?Sized,
    {
        self.require_mode("load_distributed", CheckpointMode::Distributed)?;
        if !model.is_sharded() {
            return Err(Error::InvalidState {
                message: "distributed load needs a sharded model".to_string(),
            });
        }

        let rank = self.role.rank();
        let start = Instant::now();

        let mut coordinator_error = None;
        let proposal = if self.role.is_coordinator() {
            Some(match self.prepare_distributed_load().await {
                Ok(decision) => decision,
                Err(e) => {
                    let decision = LoadDecision::Failed { reason: e.to_string() };
                    coordinator_error = Some(e);
                    decision
                }
            })
        } else {
            None
        };

        let (dir, epoch) = match self.broadcast_decision(proposal).await? {
            LoadDecision::Present {
                target,
                epoch: Some(epoch),
            } => (target, epoch),
            LoadDecision::Present { target, epoch: None } => {
                return Err(Error::Internal {
                    message: format!("distributed load decision for {} carries no epoch", target),
                });
            }
            LoadDecision::Missing { target } => {
                if self.role.is_coordinator() {
                    info!(dir = %target, "No distributed checkpoint found, starting fresh");
                }
                self.skip(ArtifactPurpose::Model, &format!("{} not found", target)).await;
                return Ok(false);
            }
            LoadDecision::Failed { reason } => {
                return Err(coordinator_error.unwrap_or_else(|| Error::PartialParticipation {
                    message: format!("coordinator rejected distributed checkpoint: {}", reason),
                }));
            }
        };

        let path = shard_key(&dir, rank);
        self.events
            .emit(CheckpointEvent::Started {
                purpose: ArtifactPurpose::Model,
                rank,
                target: path.clone(),
            })
            .await;

        let read = track_progress(
            &self.events,
            ArtifactPurpose::Model,
            rank,
            Phase::Reading,
            self.config.progress_interval,
            self.store.read_shard(&dir, rank),
        )
        .await;
        let checked = read.and_then(|(header, snapshot)| {
            self.check_shard_header("load_distributed", &path, &header, rank, epoch)?;
            model.check_snapshot(&snapshot)?;
            Ok((header, snapshot))
        });
        let (header, snapshot) = self.commit("load_distributed", checked).await?;

        let size_bytes = snapshot.size_bytes() as u64;
        let parameters = snapshot.len();
        track_progress(
            &self.events,
            ArtifactPurpose::Model,
            rank,
            Phase::Applying,
            self.config.progress_interval,
            model.apply_snapshot(snapshot),
        )
        .await?;
        self.trace_rank(&format!("applied {} parameters from {}", parameters, path));

        let elapsed = start.elapsed();
        if self.role.is_coordinator() {
            info!(
                dir = %dir,
                epoch,
                elapsed_ms = elapsed.as_millis() as u64,
                "Distributed checkpoint loaded"
            );
        }
        self.events
            .emit(CheckpointEvent::Completed {
                artifact: header.artifact_id(),
                rank,
                path,
                size_bytes,
                elapsed,
            })
            .await;
        Ok(true)
    }

    /// Merge every shard of a distributed checkpoint into one complete snapshot
    ///
    /// Not collective; any rank or offline tool may call it.
    pub async fn assemble_distributed(&self, epoch: Epoch) -> Result<Snapshot> {
        let dir = self.layout.distributed_dir(epoch);
        let manifest = self.store.read_manifest(&dir).await?;
        self.check_manifest(&dir, &manifest, epoch, manifest.world_size)?;

        let mut shards = Vec::with_capacity(manifest.world_size as usize);
        for rank in 0..manifest.world_size {
            let path = shard_key(&dir, rank);
            let (header, snapshot) = self.store.read_shard(&dir, rank).await?;
            self.check_shard_header("assemble_distributed", &path, &header, rank, epoch)?;
            shards.push(snapshot);
        }

        let full = Snapshot::merge_partials(shards)?;
        info!(dir = %dir, epoch, parameters = full.len(), "Assembled distributed checkpoint");
        Ok(full)
    }

    /// Resolve and validate the directory to load, on the coordinator
    async fn prepare_distributed_load(&self) -> Result<LoadDecision> {
        let epoch = match self.config.load_epoch {
            Some(epoch) => Some(epoch),
            None => {
                self.store
                    .latest_epoch(&self.layout.distributed_prefix(), |key| self.layout.manifest_epoch(key))
                    .await?
            }
        };
        let Some(epoch) = epoch else {
            return Ok(LoadDecision::Missing {
                target: self.layout.distributed_prefix(),
            });
        };

        let dir = self.layout.distributed_dir(epoch);
        match self.store.probe(&dir).await? {
            None => return Ok(LoadDecision::Missing { target: dir }),
            Some(ObjectKind::File) => {
                return Err(Error::ConfigurationMismatch {
                    operation: format!("load_distributed ({})", dir),
                    expected: CheckpointMode::Distributed,
                    actual: CheckpointMode::FullState,
                });
            }
            Some(ObjectKind::Directory) => {}
        }

        let manifest = match self.store.read_manifest(&dir).await {
            Ok(manifest) => manifest,
            Err(Error::ArtifactNotFound { path }) => {
                warn!(dir = %dir, "Distributed checkpoint directory has no manifest");
                return Err(Error::CheckpointCorrupted {
                    path,
                    reason: "manifest missing, save did not complete".to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        self.check_manifest(&dir, &manifest, epoch, self.role.world_size())?;

        Ok(LoadDecision::Present {
            target: dir,
            epoch: Some(epoch),
        })
    }

    fn check_manifest(&self, dir: &str, manifest: &DistributedManifest, epoch: Epoch, world_size: u32) -> Result<()> {
        if manifest.mode != CheckpointMode::Distributed {
            return Err(Error::ConfigurationMismatch {
                operation: format!("load_distributed ({})", dir),
                expected: CheckpointMode::Distributed,
                actual: manifest.mode,
            });
        }
        if manifest.epoch != epoch || manifest.world_size != world_size {
            return Err(Error::SnapshotMismatch {
                message: format!(
                    "{} holds epoch {} from {} ranks, expected epoch {} from {} ranks",
                    dir, manifest.epoch, manifest.world_size, epoch, world_size
                ),
            });
        }
        Ok(())
    }

    fn check_shard_header(
        &self,
        operation: &str,
        path: &str,
        header: &ArtifactHeader,
        rank: Rank,
        epoch: Epoch,
    ) -> Result<()> {
        self.check_header(operation, path, header, ArtifactPurpose::Model, CheckpointMode::Distributed)?;
        if header.rank != Some(rank) || header.epoch != epoch {
            return Err(Error::CheckpointCorrupted {
                path: path.to_string(),
                reason: format!(
                    "shard header is rank {:?} epoch {}, expected rank {} epoch {}",
                    header.rank, header.epoch, rank, epoch
                ),
            });
        }
        Ok(())
    }
}
