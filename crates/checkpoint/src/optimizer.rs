//! Optimizer state checkpoints
//!
//! Optimizer state is always gathered to the coordinating rank on save and
//! scattered back by the live layout on load, whatever the checkpoint mode.

use std::time::Instant;

use runtime_core::{ArtifactId, ArtifactPurpose, CheckpointMode, Epoch, Error, Result, Snapshot};
use storage::ObjectKind;
use tracing::{info, warn};

use crate::checkpointer::{Checkpointer, LoadDecision};
use crate::events::{track_progress, CheckpointEvent, Phase};
use crate::provider::OptimizerStateProvider;

/// What the coordinator found when preparing a load
enum Prepared {
    Found {
        path: String,
        epoch: Epoch,
        state: Snapshot,
    },
    Absent {
        target: String,
    },
}

impl Checkpointer {
    /// Save optimizer state for `epoch`
    ///
    /// Every rank must call this. Gathering and writing report progress at
    /// the configured interval; neither has a timeout.
    pub async fn save_optimizer<O>(&self, optimizer: &O, epoch: Epoch) -> Result<()>
    where
        O: OptimizerStateProvider + ?Sized,
    {
        let rank = self.role.rank();
        let path = self.layout.optimizer_file(epoch);
        let start = Instant::now();
        self.events
            .emit(CheckpointEvent::Started {
                purpose: ArtifactPurpose::Optimizer,
                rank,
                target: path.clone(),
            })
            .await;
        self.trace_rank(&format!("gathering optimizer state for epoch {}", epoch));

        let state = track_progress(
            &self.events,
            ArtifactPurpose::Optimizer,
            rank,
            Phase::Gathering,
            self.config.progress_interval,
            optimizer.gather_full_optimizer_state(),
        )
        .await?;

        if !self.role.is_coordinator() {
            return Ok(());
        }
        let state = state.ok_or_else(|| Error::Internal {
            message: "coordinator received no optimizer state".to_string(),
        })?;

        if self.store.probe(&path).await?.is_some() {
            warn!(path = %path, epoch, "Overwriting existing optimizer checkpoint");
        }

        let header = self.header(ArtifactPurpose::Optimizer, CheckpointMode::FullState, epoch);
        let size_bytes = track_progress(
            &self.events,
            ArtifactPurpose::Optimizer,
            rank,
            Phase::Writing,
            self.config.progress_interval,
            self.store.write_artifact(&path, &header, &state),
        )
        .await?;

        let elapsed = start.elapsed();
        info!(
            path = %path,
            epoch,
            slots = state.len(),
            size_bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "Optimizer checkpoint saved"
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

    /// Restore optimizer state on every rank
    ///
    /// Every rank must call this. Returns `false` on every rank when no
    /// optimizer checkpoint exists; nothing is applied anywhere unless every
    /// rank received and validated its portion.
    pub async fn load_optimizer<O>(&self, optimizer: &mut O) -> Result<bool>
    where
        O: OptimizerStateProvider + ?Sized,
    {
        let rank = self.role.rank();
        let start = Instant::now();

        let mut coordinator_error = None;
        let mut found = None;
        let proposal = if self.role.is_coordinator() {
            Some(match self.prepare_optimizer_load().await {
                Ok(Prepared::Found { path, epoch, state }) => {
                    found = Some(state);
                    LoadDecision::Present {
                        target: path,
                        epoch: Some(epoch),
                    }
                }
                Ok(Prepared::Absent { target }) => LoadDecision::Missing { target },
                Err(e) => {
                    let decision = LoadDecision::Failed { reason: e.to_string() };
                    coordinator_error = Some(e);
                    decision
                }
            })
        } else {
            None
        };

        let decision = self.broadcast_decision(proposal).await?;
        let (target, epoch) = match decision {
            LoadDecision::Present { target, epoch } => (target, epoch),
            LoadDecision::Missing { target } => {
                if self.role.is_coordinator() {
                    warn!(path = %target, "No optimizer state available, skipping optimizer load");
                }
                self.skip(ArtifactPurpose::Optimizer, &format!("{} not found", target)).await;
                return Ok(false);
            }
            LoadDecision::Failed { reason } => {
                return Err(coordinator_error.unwrap_or_else(|| Error::PartialParticipation {
                    message: format!("coordinator could not read optimizer state: {}", reason),
                }));
            }
        };

        self.events
            .emit(CheckpointEvent::Started {
                purpose: ArtifactPurpose::Optimizer,
                rank,
                target: target.clone(),
            })
            .await;

        let scattered = track_progress(
            &self.events,
            ArtifactPurpose::Optimizer,
            rank,
            Phase::Scattering,
            self.config.progress_interval,
            optimizer.scatter_optimizer_state(found),
        )
        .await;
        let checked = scattered.and_then(|shard| {
            optimizer.check_optimizer_state(&shard)?;
            Ok(shard)
        });
        let shard = self.commit("load_optimizer", checked).await?;

        let size_bytes = shard.size_bytes() as u64;
        track_progress(
            &self.events,
            ArtifactPurpose::Optimizer,
            rank,
            Phase::Applying,
            self.config.progress_interval,
            optimizer.apply_optimizer_state(shard),
        )
        .await?;

        let elapsed = start.elapsed();
        self.trace_rank("optimizer state applied");
        if self.role.is_coordinator() {
            info!(path = %target, elapsed_ms = elapsed.as_millis() as u64, "Optimizer checkpoint loaded");
        }
        if let Some(epoch) = epoch {
            self.events
                .emit(CheckpointEvent::Completed {
                    artifact: ArtifactId::new(ArtifactPurpose::Optimizer, self.config.model_name.as_str(), epoch),
                    rank,
                    path: target,
                    size_bytes,
                    elapsed,
                })
                .await;
        }
        Ok(true)
    }

    /// Resolve, probe and read the optimizer artifact on the coordinator
    async fn prepare_optimizer_load(&self) -> Result<Prepared> {
        let Some((path, _)) = self.resolve_file_target(ArtifactPurpose::Optimizer).await? else {
            return Ok(Prepared::Absent {
                target: self.layout.optimizer_prefix(),
            });
        };

        match self.store.probe(&path).await? {
            None => return Ok(Prepared::Absent { target: path }),
            Some(ObjectKind::Directory) => {
                return Err(Error::ConfigurationMismatch {
                    operation: format!("load_optimizer ({})", path),
                    expected: CheckpointMode::FullState,
                    actual: CheckpointMode::Distributed,
                });
            }
            Some(ObjectKind::File) => {}
        }

        let (header, state) = track_progress(
            &self.events,
            ArtifactPurpose::Optimizer,
            self.role.rank(),
            Phase::Reading,
            self.config.progress_interval,
            self.store.read_artifact(&path),
        )
        .await?;
        self.check_header(
            "load_optimizer",
            &path,
            &header,
            ArtifactPurpose::Optimizer,
            CheckpointMode::FullState,
        )?;

        Ok(Prepared::Found {
            path,
            epoch: header.epoch,
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharded::{LocalShardedModel, LocalShardedOptimizer};
    use collective::{local_cohort, Collective, CollectiveHandle};
    use runtime_core::{CheckpointConfig, RankRole, StateValue, Tensor};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use storage::{LocalStorage, StorageHandle};
    use tempfile::TempDir;

    fn params() -> BTreeMap<String, StateValue> {
        ["w0", "w1", "w2", "w3"]
            .iter()
            .map(|n| (n.to_string(), StateValue::from(Tensor::filled(vec![2], 1.0))))
            .collect()
    }

    /// Shard a model on every rank and run `load_optimizer` on a fresh optimizer
    async fn load_on_cohort(dir: &TempDir, world_size: u32) -> Vec<Result<(bool, LocalShardedOptimizer)>> {
        let storage: StorageHandle = Arc::new(LocalStorage::new(dir.path()));
        let handles: Vec<_> = local_cohort(world_size)
            .unwrap()
            .into_iter()
            .map(|member| {
                let storage = Arc::clone(&storage);
                tokio::spawn(async move {
                    let role = RankRole::new(member.rank(), world_size)?;
                    let member: CollectiveHandle = Arc::new(member);
                    let checkpointer = Checkpointer::new(
                        role,
                        Arc::new(CheckpointConfig::default()),
                        storage,
                        Arc::clone(&member),
                    )?;
                    let mut model = LocalShardedModel::new(Arc::clone(&member), params());
                    model.shard().await?;
                    let mut optimizer = LocalShardedOptimizer::for_model(member, &model)?;
                    let loaded = checkpointer.load_optimizer(&mut optimizer).await?;
                    Ok::<_, Error>((loaded, optimizer))
                })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn test_missing_optimizer_skips_on_every_rank() {
        let dir = TempDir::new().unwrap();
        for result in load_on_cohort(&dir, 3).await {
            let (loaded, optimizer) = result.unwrap();
            assert!(!loaded);
            assert!(optimizer.is_empty());
        }
    }

    #[tokio::test]
    async fn test_corrupt_optimizer_fails_on_every_rank() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoints/optimizer-model-1.ckpt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not a checkpoint").unwrap();

        let results = load_on_cohort(&dir, 2).await;
        assert!(matches!(results[0], Err(Error::CheckpointCorrupted { .. })));
        assert!(matches!(results[1], Err(Error::PartialParticipation { .. })));
    }

    #[tokio::test]
    async fn test_save_then_load_restores_each_shard() {
        let dir = TempDir::new().unwrap();
        let storage: StorageHandle = Arc::new(LocalStorage::new(dir.path()));

        let handles: Vec<_> = local_cohort(2)
            .unwrap()
            .into_iter()
            .map(|member| {
                let storage = Arc::clone(&storage);
                tokio::spawn(async move {
                    let role = RankRole::new(member.rank(), 2)?;
                    let member: CollectiveHandle = Arc::new(member);
                    let checkpointer = Checkpointer::new(
                        role,
                        Arc::new(CheckpointConfig::default()),
                        storage,
                        Arc::clone(&member),
                    )?;
                    let mut model = LocalShardedModel::new(Arc::clone(&member), params());
                    model.shard().await?;

                    let mut optimizer = LocalShardedOptimizer::for_model(Arc::clone(&member), &model)?;
                    for name in model.parameters() {
                        optimizer.set_slot(&name, "momentum", StateValue::Scalar(role.rank() as f64 + 0.5))?;
                    }
                    checkpointer.save_optimizer(&optimizer, 2).await?;

                    let mut restored = LocalShardedOptimizer::for_model(member, &model)?;
                    assert!(checkpointer.load_optimizer(&mut restored).await?);
                    Ok::<_, Error>((optimizer.local_state(), restored.local_state()))
                })
            })
            .collect();

        for handle in handles {
            let (saved, restored) = handle.await.unwrap().unwrap();
            assert!(!saved.is_empty());
            assert_eq!(saved, restored);
        }
        assert!(dir.path().join("checkpoints/optimizer-model-2.ckpt").exists());
    }
}
