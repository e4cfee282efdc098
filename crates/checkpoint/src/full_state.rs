//! Full-state model checkpoints
//!
//! Save gathers the complete model onto the coordinating rank, which writes
//! one file. Load reads and applies on the coordinator alone, before the model
//! is sharded, and broadcasts the outcome so every rank agrees on it; sharding
//! then spreads the restored weights.

use std::time::Instant;

use runtime_core::{ArtifactPurpose, CheckpointMode, Epoch, Error, Result};
use storage::ObjectKind;
use tracing::{info, warn};

use crate::checkpointer::{Checkpointer, LoadDecision};
use crate::events::{track_progress, CheckpointEvent, Phase};
use crate::format::ArtifactHeader;
use crate::provider::ShardSnapshotProvider;

/// Outcome of the coordinator's read-and-apply
enum Restored {
    Applied {
        path: String,
        header: ArtifactHeader,
        size_bytes: u64,
    },
    Absent {
        target: String,
    },
}

impl Checkpointer {
    /// Save the complete model for `epoch`
    ///
    /// Every rank must call this: the snapshot is gathered collectively.
    /// Only the coordinating rank writes.
    pub async fn save_model<M>(&self, model: &M, epoch: Epoch) -> Result<()>
    where
        M: ShardSnapshotProvider + ?Sized,
    {
        self.require_mode("save_model", CheckpointMode::FullState)?;

        let rank = self.role.rank();
        let path = self.layout.model_file(epoch);
        let start = Instant::now();
        self.events
            .emit(CheckpointEvent::Started {
                purpose: ArtifactPurpose::Model,
                rank,
                target: path.clone(),
            })
            .await;
        self.trace_rank(&format!("gathering model state for epoch {}", epoch));

        let snapshot = track_progress(
            &self.events,
            ArtifactPurpose::Model,
            rank,
            Phase::Gathering,
            self.config.progress_interval,
            model.full_snapshot(),
        )
        .await?;

        if !self.role.is_coordinator() {
            return Ok(());
        }
        let snapshot = snapshot.ok_or_else(|| Error::Internal {
            message: "coordinator received no full model snapshot".to_string(),
        })?;

        if self.store.probe(&path).await?.is_some() {
            warn!(path = %path, epoch, "Overwriting existing model checkpoint");
        }

        let header = self.header(ArtifactPurpose::Model, CheckpointMode::FullState, epoch);
        let size_bytes = track_progress(
            &self.events,
            ArtifactPurpose::Model,
            rank,
            Phase::Writing,
            self.config.progress_interval,
            self.store.write_artifact(&path, &header, &snapshot),
        )
        .await?;

        let elapsed = start.elapsed();
        info!(
            path = %path,
            epoch,
            parameters = snapshot.len(),
            size_bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "Model checkpoint saved"
        );
        self.events
            .emit(CheckpointEvent::Completed {
                artifact: header.artifact_id(),
                rank,
                path,
                size_bytes,
                elapsed,
            })
            .await;
        Ok(())
    }

    /// Load a full-state model checkpoint into an unsharded model
    ///
    /// Every rank must call this. Only the coordinating rank reads and
    /// applies; it returns `true` when a checkpoint was applied. Other ranks
    /// do no I/O and return `false`, receiving the weights when the model is
    /// sharded, or `PartialParticipation` when the coordinator failed.
    pub async fn load_model<M>(&self, model: &mut M) -> Result<bool>
    where
        M: ShardSnapshotProvider + ?Sized,
    {
        self.require_mode("load_model", CheckpointMode::FullState)?;
        if model.is_sharded() {
            return Err(Error::InvalidState {
                message: "full-state model load must run before the model is sharded".to_string(),
            });
        }

        let rank = self.role.rank();
        let start = Instant::now();

        let mut coordinator_error = None;
        let mut restored = None;
        let proposal = if self.role.is_coordinator() {
            Some(match self.restore_model(model).await {
                Ok(Restored::Applied { path, header, size_bytes }) => {
                    let decision = LoadDecision::Present {
                        target: path.clone(),
                        epoch: Some(header.epoch),
                    };
                    restored = Some((path, header, size_bytes));
                    decision
                }
                Ok(Restored::Absent { target }) => LoadDecision::Missing { target },
                Err(e) => {
                    let decision = LoadDecision::Failed { reason: e.to_string() };
                    coordinator_error = Some(e);
                    decision
                }
            })
        } else {
            None
        };

        match self.broadcast_decision(proposal).await? {
            LoadDecision::Present { .. } => {}
            LoadDecision::Missing { target } => {
                if self.role.is_coordinator() {
                    warn!(path = %target, "No model checkpoint found, starting fresh");
                }
                self.skip(ArtifactPurpose::Model, &format!("{} not found", target)).await;
                return Ok(false);
            }
            LoadDecision::Failed { reason } => {
                return Err(coordinator_error.unwrap_or_else(|| Error::PartialParticipation {
                    message: format!("coordinator could not load model state: {}", reason),
                }));
            }
        }

        let Some((path, header, size_bytes)) = restored else {
            self.trace_rank("model restored on coordinator, waiting for shard");
            return Ok(false);
        };

        let elapsed = start.elapsed();
        info!(
            path = %path,
            epoch = header.epoch,
            size_bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "Model checkpoint loaded"
        );
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

    /// Resolve, read, check and apply the model artifact on the coordinator
    async fn restore_model<M>(&self, model: &mut M) -> Result<Restored>
    where
        M: ShardSnapshotProvider + ?Sized,
    {
        let rank = self.role.rank();
        let Some((path, _)) = self.resolve_file_target(ArtifactPurpose::Model).await? else {
            return Ok(Restored::Absent {
                target: self.layout.model_prefix(),
            });
        };

        match self.store.probe(&path).await? {
            None => return Ok(Restored::Absent { target: path }),
            Some(ObjectKind::Directory) => {
                return Err(Error::ConfigurationMismatch {
                    operation: format!("load_model ({})", path),
                    expected: CheckpointMode::FullState,
                    actual: CheckpointMode::Distributed,
                });
            }
            Some(ObjectKind::File) => {}
        }

        self.events
            .emit(CheckpointEvent::Started {
                purpose: ArtifactPurpose::Model,
                rank,
                target: path.clone(),
            })
            .await;

        let (header, snapshot) = track_progress(
            &self.events,
            ArtifactPurpose::Model,
            rank,
            Phase::Reading,
            self.config.progress_interval,
            self.store.read_artifact(&path),
        )
        .await?;
        self.check_header("load_model", &path, &header, ArtifactPurpose::Model, CheckpointMode::FullState)?;

        let size_bytes = snapshot.size_bytes() as u64;
        track_progress(
            &self.events,
            ArtifactPurpose::Model,
            rank,
            Phase::Applying,
            self.config.progress_interval,
            model.apply_snapshot(snapshot),
        )
        .await?;

        Ok(Restored::Applied {
            path,
            header,
            size_bytes,
        })
    }

    pub(crate) async fn skip(&self, purpose: ArtifactPurpose, reason: &str) {
        self.events
            .emit(CheckpointEvent::Skipped {
                purpose,
                rank: self.role.rank(),
                reason: reason.to_string(),
            })
            .await;
    }
}
