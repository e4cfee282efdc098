//! Checkpoint guarantees exercised across a multi-rank cohort
//!
//! - full-state round trip
//! - distributed shard completeness
//! - missing artifacts load as a uniform no-op
//! - mode mismatches abort before writing
//! - optimizer gather/scatter symmetry, and scatter by the live layout
//! - epoch isolation in both modes

mod common;

use std::sync::Arc;

use anyhow::Result;
use checkpoint::{optimizer_key, LocalShardedModel, LocalShardedOptimizer, ShardSnapshotProvider};
use collective::CollectiveOp;
use common::{cohort, file_count, init_tracing, on_every_rank, parameters, tensor};
use runtime_core::{CheckpointConfig, CheckpointMode, Error, Snapshot, SnapshotScope, StateValue};
use tempfile::TempDir;

fn distributed_config() -> CheckpointConfig {
    CheckpointConfig {
        mode: CheckpointMode::Distributed,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_full_state_round_trip() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;

    // Save from a sharded cohort of 4
    let saved = on_every_rank(cohort(dir.path(), CheckpointConfig::default(), 4)?, |ctx| async move {
        let mut model = LocalShardedModel::new(Arc::clone(&ctx.collective), parameters(10, 1.0));
        model.shard().await?;
        ctx.checkpointer.save_model(&model, 3).await?;
        Ok(model.full_snapshot().await?)
    })
    .await;
    let original = saved[0].as_ref().map_err(|e| anyhow::anyhow!("{e}"))?.clone();
    let original = original.ok_or_else(|| anyhow::anyhow!("coordinator has no snapshot"))?;

    // Load into a fresh cohort, then shard so every rank receives its part
    let loaded = on_every_rank(cohort(dir.path(), CheckpointConfig::default(), 4)?, |ctx| async move {
        let mut model = LocalShardedModel::new(Arc::clone(&ctx.collective), parameters(10, 0.0));
        let applied = ctx.checkpointer.load_model(&mut model).await?;
        model.shard().await?;
        Ok((applied, model.full_snapshot().await?))
    })
    .await;

    for (rank, result) in loaded.into_iter().enumerate() {
        let (applied, full) = result?;
        assert_eq!(applied, rank == 0, "only the coordinator applies a full-state load");
        if rank == 0 {
            assert_eq!(full, Some(original.clone()));
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_distributed_shards_partition_the_model() -> Result<()> {
    let dir = TempDir::new()?;
    let world_size = 3;

    let results = on_every_rank(cohort(dir.path(), distributed_config(), world_size)?, |ctx| async move {
        let mut model = LocalShardedModel::new(Arc::clone(&ctx.collective), parameters(8, 2.0));
        model.shard().await?;
        ctx.checkpointer.save_distributed(&model, 1).await?;
        ctx.collective.barrier(CollectiveOp::Barrier).await?;

        let local = model.local_snapshot().await?;
        let assembled = if ctx.role.is_coordinator() {
            Some(ctx.checkpointer.assemble_distributed(1).await?)
        } else {
            None
        };
        Ok((local, assembled))
    })
    .await;

    let mut shards = Vec::new();
    let mut assembled = None;
    for result in results {
        let (local, full) = result?;
        shards.push(local);
        assembled = assembled.or(full);
    }

    let union = Snapshot::merge_partials(shards)?;
    assert_eq!(union.len(), 8, "no parameter missing or duplicated across shards");
    assert_eq!(Some(union), assembled);
    assert_eq!(
        file_count(&dir.path().join("distributed_checkpoints/dist-model-1")),
        world_size as usize + 1
    );
    Ok(())
}

#[tokio::test]
async fn test_missing_artifacts_are_uniform_noops() -> Result<()> {
    let dir = TempDir::new()?;

    let full_state = on_every_rank(cohort(dir.path(), CheckpointConfig::default(), 3)?, |ctx| async move {
        let mut model = LocalShardedModel::new(Arc::clone(&ctx.collective), parameters(4, 5.0));
        let model_loaded = ctx.checkpointer.load_model(&mut model).await?;
        model.shard().await?;

        let mut optimizer = LocalShardedOptimizer::for_model(Arc::clone(&ctx.collective), &model)?;
        let optimizer_loaded = ctx.checkpointer.load_optimizer(&mut optimizer).await?;
        Ok((model_loaded, optimizer_loaded, model.local_snapshot().await?, optimizer.len()))
    })
    .await;
    for result in full_state {
        let (model_loaded, optimizer_loaded, local, slots) = result?;
        assert!(!model_loaded);
        assert!(!optimizer_loaded);
        assert_eq!(slots, 0);
        for (name, value) in local.entries() {
            let i: f32 = name["block".len()..name.len() - ".weight".len()].parse()?;
            assert_eq!(value, &tensor(5.0 + i), "state untouched by a skipped load");
        }
    }

    let distributed = on_every_rank(cohort(dir.path(), distributed_config(), 3)?, |ctx| async move {
        let mut model = LocalShardedModel::new(Arc::clone(&ctx.collective), parameters(4, 5.0));
        model.shard().await?;
        Ok(ctx.checkpointer.load_distributed(&mut model).await?)
    })
    .await;
    for result in distributed {
        assert!(!result?);
    }

    assert_eq!(file_count(dir.path()), 0);
    Ok(())
}

#[tokio::test]
async fn test_mode_mismatch_aborts_before_any_write() -> Result<()> {
    let dir = TempDir::new()?;

    let results = on_every_rank(cohort(dir.path(), distributed_config(), 2)?, |ctx| async move {
        let mut model = LocalShardedModel::new(Arc::clone(&ctx.collective), parameters(4, 1.0));
        model.shard().await?;
        match ctx.checkpointer.save_model(&model, 1).await {
            Err(Error::ConfigurationMismatch { .. }) => Ok(()),
            other => Err(anyhow::anyhow!("expected a mode mismatch, got {:?}", other)),
        }
    })
    .await;
    for result in results {
        result?;
    }

    let results = on_every_rank(cohort(dir.path(), CheckpointConfig::default(), 2)?, |ctx| async move {
        let mut model = LocalShardedModel::new(Arc::clone(&ctx.collective), parameters(4, 1.0));
        model.shard().await?;
        match ctx.checkpointer.save_distributed(&model, 1).await {
            Err(Error::ConfigurationMismatch { .. }) => Ok(()),
            other => Err(anyhow::anyhow!("expected a mode mismatch, got {:?}", other)),
        }
    })
    .await;
    for result in results {
        result?;
    }

    assert_eq!(file_count(dir.path()), 0);
    Ok(())
}

#[tokio::test]
async fn test_full_state_reader_rejects_distributed_artifact() -> Result<()> {
    let dir = TempDir::new()?;

    let saved = on_every_rank(cohort(dir.path(), distributed_config(), 2)?, |ctx| async move {
        let mut model = LocalShardedModel::new(Arc::clone(&ctx.collective), parameters(4, 1.0));
        model.shard().await?;
        ctx.checkpointer.save_distributed(&model, 1).await?;
        Ok(())
    })
    .await;
    for result in saved {
        result?;
    }

    // Point the full-state reader at the distributed directory
    let config = CheckpointConfig {
        checkpoint_folder: "distributed_checkpoints".to_string(),
        checkpoint_model_filename: Some("dist-model-1".to_string()),
        ..Default::default()
    };
    let mut ranks = cohort(dir.path(), config, 1)?;
    let ctx = ranks.remove(0);
    let mut model = LocalShardedModel::new(Arc::clone(&ctx.collective), parameters(4, 0.0));
    let result = ctx.checkpointer.load_model(&mut model).await;
    assert!(matches!(result, Err(Error::ConfigurationMismatch { .. })));
    Ok(())
}

#[tokio::test]
async fn test_optimizer_state_survives_gather_and_scatter() -> Result<()> {
    let dir = TempDir::new()?;

    let results = on_every_rank(cohort(dir.path(), CheckpointConfig::default(), 4)?, |ctx| async move {
        let mut model = LocalShardedModel::new(Arc::clone(&ctx.collective), parameters(9, 0.0));
        model.shard().await?;

        let mut optimizer = LocalShardedOptimizer::for_model(Arc::clone(&ctx.collective), &model)?;
        for name in model.parameters() {
            optimizer.set_slot(&name, "exp_avg", tensor(ctx.role.rank() as f32))?;
            optimizer.set_slot(&name, "exp_avg_sq", tensor(0.25))?;
            optimizer.set_slot(&name, "step", StateValue::Count(100))?;
        }
        ctx.checkpointer.save_optimizer(&optimizer, 7).await?;

        let mut restored = LocalShardedOptimizer::for_model(Arc::clone(&ctx.collective), &model)?;
        let loaded = ctx.checkpointer.load_optimizer(&mut restored).await?;
        Ok((loaded, optimizer.local_state(), restored.local_state()))
    })
    .await;

    let mut total = 0;
    for result in results {
        let (loaded, before, after) = result?;
        assert!(loaded);
        assert_eq!(before, after);
        total += after.len();
    }
    assert_eq!(total, 9 * 3);
    Ok(())
}

#[tokio::test]
async fn test_optimizer_scatter_follows_current_layout() -> Result<()> {
    let dir = TempDir::new()?;

    // Saved from a cohort of 2
    let saved = on_every_rank(cohort(dir.path(), CheckpointConfig::default(), 2)?, |ctx| async move {
        let mut model = LocalShardedModel::new(Arc::clone(&ctx.collective), parameters(7, 0.0));
        model.shard().await?;
        let mut optimizer = LocalShardedOptimizer::for_model(Arc::clone(&ctx.collective), &model)?;
        for name in model.parameters() {
            optimizer.set_slot(&name, "exp_avg", tensor(1.5))?;
        }
        ctx.checkpointer.save_optimizer(&optimizer, 3).await?;
        Ok(())
    })
    .await;
    for result in saved {
        result?;
    }

    // Restored into a cohort of 3
    let restored = on_every_rank(cohort(dir.path(), CheckpointConfig::default(), 3)?, |ctx| async move {
        let mut model = LocalShardedModel::new(Arc::clone(&ctx.collective), parameters(7, 0.0));
        model.shard().await?;
        let mut optimizer = LocalShardedOptimizer::for_model(Arc::clone(&ctx.collective), &model)?;
        let loaded = ctx.checkpointer.load_optimizer(&mut optimizer).await?;
        Ok((loaded, model.parameters(), optimizer.local_state()))
    })
    .await;

    let mut total = 0;
    for result in restored {
        let (loaded, owned, state) = result?;
        assert!(loaded);
        assert_eq!(state.len(), owned.len(), "one slot per owned parameter");
        for name in &owned {
            assert_eq!(state.entries().get(&optimizer_key(name, "exp_avg")), Some(&tensor(1.5)));
        }
        total += state.len();
    }
    assert_eq!(total, 7);
    Ok(())
}

#[tokio::test]
async fn test_full_state_epochs_are_independently_loadable() -> Result<()> {
    let dir = TempDir::new()?;

    let saved = on_every_rank(cohort(dir.path(), CheckpointConfig::default(), 2)?, |ctx| async move {
        let mut model = LocalShardedModel::new(Arc::clone(&ctx.collective), parameters(5, 0.0));
        model.shard().await?;
        for epoch in [4u64, 5] {
            for name in model.parameters() {
                model.update(&name, tensor(epoch as f32))?;
            }
            ctx.checkpointer.save_model(&model, epoch).await?;
        }
        Ok(())
    })
    .await;
    for result in saved {
        result?;
    }

    for epoch in [4u64, 5] {
        let config = CheckpointConfig {
            load_epoch: Some(epoch),
            ..Default::default()
        };
        let results = on_every_rank(cohort(dir.path(), config, 2)?, |ctx| async move {
            let mut model = LocalShardedModel::new(Arc::clone(&ctx.collective), parameters(5, 0.0));
            let loaded = ctx.checkpointer.load_model(&mut model).await?;
            model.shard().await?;
            Ok((loaded, model.local_snapshot().await?))
        })
        .await;

        for (rank, result) in results.into_iter().enumerate() {
            let (loaded, local) = result?;
            assert_eq!(loaded, rank == 0);
            assert!(!local.is_empty());
            assert!(local.entries().values().all(|v| v == &tensor(epoch as f32)));
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_epochs_are_independently_loadable() -> Result<()> {
    let dir = TempDir::new()?;

    let saved = on_every_rank(cohort(dir.path(), distributed_config(), 2)?, |ctx| async move {
        let mut model = LocalShardedModel::new(Arc::clone(&ctx.collective), parameters(6, 0.0));
        model.shard().await?;
        for epoch in [4u64, 5] {
            for name in model.parameters() {
                model.update(&name, tensor(epoch as f32))?;
            }
            ctx.checkpointer.save_distributed(&model, epoch).await?;
        }
        Ok(())
    })
    .await;
    for result in saved {
        result?;
    }

    for epoch in [4u64, 5] {
        let config = CheckpointConfig {
            load_epoch: Some(epoch),
            ..distributed_config()
        };
        let results = on_every_rank(cohort(dir.path(), config, 2)?, |ctx| async move {
            let mut model = LocalShardedModel::new(Arc::clone(&ctx.collective), parameters(6, 0.0));
            model.shard().await?;
            let loaded = ctx.checkpointer.load_distributed(&mut model).await?;
            Ok((loaded, model.local_snapshot().await?))
        })
        .await;

        for result in results {
            let (loaded, local) = result?;
            assert!(loaded);
            assert!(matches!(local.scope(), SnapshotScope::Partial { .. }));
            assert!(local.entries().values().all(|v| v == &tensor(epoch as f32)));
        }
    }
    Ok(())
}
