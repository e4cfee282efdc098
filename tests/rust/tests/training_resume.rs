//! Train, stop, restart and resume from the newest checkpoint

mod common;

use std::sync::Arc;

use anyhow::Result;
use checkpoint::{CheckpointEvent, LocalShardedModel, LocalShardedOptimizer, ShardSnapshotProvider};
use common::{cohort, init_tracing, on_every_rank, parameters, tensor, RankContext};
use runtime_core::{ArtifactPurpose, CheckpointConfig, CheckpointMode, StateValue};
use tempfile::TempDir;
use tokio::sync::mpsc;

/// One simulated run: restore, then train and checkpoint `epochs` epochs
async fn train(
    ctx: RankContext,
    start_epoch: u64,
    epochs: u64,
    events: mpsc::Sender<CheckpointEvent>,
) -> Result<(bool, bool, Vec<(String, StateValue)>)> {
    let checkpointer = ctx.checkpointer.with_events(events);
    let mode = checkpointer.config().mode;

    let mut model = LocalShardedModel::new(Arc::clone(&ctx.collective), parameters(6, 0.0));
    let model_restored = match mode {
        CheckpointMode::FullState => {
            let loaded = checkpointer.load_model(&mut model).await?;
            model.shard().await?;
            loaded
        }
        CheckpointMode::Distributed => {
            model.shard().await?;
            checkpointer.load_distributed(&mut model).await?
        }
    };

    let mut optimizer = LocalShardedOptimizer::for_model(Arc::clone(&ctx.collective), &model)?;
    let optimizer_restored = checkpointer.load_optimizer(&mut optimizer).await?;

    for epoch in start_epoch..start_epoch + epochs {
        for name in model.parameters() {
            model.update(&name, tensor(epoch as f32))?;
            optimizer.set_slot(&name, "step", StateValue::Count(epoch))?;
        }
        match mode {
            CheckpointMode::FullState => checkpointer.save_model(&model, epoch).await?,
            CheckpointMode::Distributed => checkpointer.save_distributed(&model, epoch).await?,
        }
        checkpointer.save_optimizer(&optimizer, epoch).await?;
    }

    let mut seen: Vec<_> = model
        .local_snapshot()
        .await?
        .into_entries()
        .into_iter()
        .collect();
    seen.extend(optimizer.local_state().into_entries());
    Ok((model_restored, optimizer_restored, seen))
}

async fn run(
    dir: &TempDir,
    config: CheckpointConfig,
    start_epoch: u64,
    epochs: u64,
) -> Result<(Vec<(bool, bool, Vec<(String, StateValue)>)>, Vec<CheckpointEvent>)> {
    let (tx, mut rx) = mpsc::channel(1024);
    let ranks = cohort(dir.path(), config, 3)?;
    let results = on_every_rank(ranks, |ctx| train(ctx, start_epoch, epochs, tx.clone())).await;
    drop(tx);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    let results = results.into_iter().collect::<Result<Vec<_>>>()?;
    Ok((results, events))
}

fn completed(events: &[CheckpointEvent], purpose: ArtifactPurpose) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, CheckpointEvent::Completed { artifact, .. } if artifact.purpose == purpose))
        .count()
}

#[tokio::test]
async fn test_full_state_resume() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;

    let (first, events) = run(&dir, CheckpointConfig::default(), 0, 2).await?;
    assert!(first.iter().all(|(model, optimizer, _)| !model && !optimizer));
    // Only the coordinator writes full-state and optimizer artifacts
    assert_eq!(completed(&events, ArtifactPurpose::Model), 2);
    assert_eq!(completed(&events, ArtifactPurpose::Optimizer), 2);
    assert!(events.iter().any(|e| matches!(e, CheckpointEvent::Skipped { .. })));

    // Resume: the newest epoch (1) is picked up, then one more epoch runs
    let (second, events) = run(&dir, CheckpointConfig::default(), 2, 0).await?;
    for (rank, (model, optimizer, state)) in second.iter().enumerate() {
        assert_eq!(*model, rank == 0);
        assert!(*optimizer);
        for (key, value) in state {
            if key.ends_with("/step") {
                assert_eq!(value, &StateValue::Count(1));
            } else {
                assert_eq!(value, &tensor(1.0));
            }
        }
    }
    // Model applied on the coordinator, optimizer shards applied everywhere
    assert_eq!(completed(&events, ArtifactPurpose::Model), 1);
    assert_eq!(completed(&events, ArtifactPurpose::Optimizer), 3);
    Ok(())
}

#[tokio::test]
async fn test_distributed_resume() -> Result<()> {
    let dir = TempDir::new()?;
    let config = || CheckpointConfig {
        mode: CheckpointMode::Distributed,
        model_name: "resnet".to_string(),
        ..Default::default()
    };

    let (_, events) = run(&dir, config(), 0, 3).await?;
    // Every rank writes its own shard each epoch
    assert_eq!(completed(&events, ArtifactPurpose::Model), 3 * 3);
    assert!(dir.path().join("distributed_checkpoints/dist-resnet-2/manifest.json").exists());

    let (resumed, _) = run(&dir, config(), 3, 0).await?;
    for (model, optimizer, state) in resumed {
        assert!(model);
        assert!(optimizer);
        assert!(!state.is_empty());
        for (key, value) in state {
            if !key.ends_with("/step") {
                assert_eq!(value, tensor(2.0));
            }
        }
    }
    Ok(())
}
