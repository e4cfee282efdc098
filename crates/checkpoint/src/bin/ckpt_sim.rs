//! Checkpoint simulation binary
//!
//! Runs an in-process cohort through load, shard, and a few epochs of
//! mutate-then-save using the configured checkpoint mode.
//!
//! ```text
//! ckpt-sim [config.json] [--ranks N] [--epochs E] [--start-epoch S] [--params P]
//! ```
//!
//! Exits with 2 when a rank hit a fatal error, 1 for any other failure.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use checkpoint::{CheckpointEvent, Checkpointer, LocalShardedModel, LocalShardedOptimizer};
use clap::Parser;
use collective::{local_cohort, Collective, CollectiveHandle, CollectiveOp, LocalCollective};
use runtime_core::logging::init_logging;
use runtime_core::{
    CheckpointConfig, CheckpointMode, Epoch, RankRole, Result, RuntimeConfig, StateValue, Tensor,
};
use storage::{LocalStorage, StorageHandle};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Simulate a training cohort that checkpoints every epoch
#[derive(Debug, Clone, Parser)]
#[command(name = "ckpt-sim", version, about, long_about = None)]
struct SimArgs {
    /// JSON runtime configuration; defaults when omitted
    config: Option<PathBuf>,

    /// Number of ranks in the cohort
    #[arg(long, default_value_t = 4)]
    ranks: u32,

    /// Epochs to train after restoring
    #[arg(long, default_value_t = 3)]
    epochs: u64,

    /// First epoch number to save
    #[arg(long, default_value_t = 0)]
    start_epoch: Epoch,

    /// Model parameters per run
    #[arg(long, default_value_t = 8)]
    params: usize,
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = SimArgs::parse();
    let config = match &args.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    init_logging(&config.logging)?;

    let checkpoint = Arc::new(config.checkpoint);
    info!(
        mode = %checkpoint.mode,
        ranks = args.ranks,
        epochs = args.epochs,
        base_path = %checkpoint.base_path.display(),
        "Starting checkpoint simulation"
    );

    let (tx, mut rx) = mpsc::channel(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let storage: StorageHandle = Arc::new(LocalStorage::new(&checkpoint.base_path));
    let handles: Vec<_> = local_cohort(args.ranks)?
        .into_iter()
        .map(|member| {
            tokio::spawn(run_rank(
                member,
                Arc::clone(&checkpoint),
                Arc::clone(&storage),
                tx.clone(),
                args.clone(),
            ))
        })
        .collect();
    drop(tx);

    let mut exit_code = 0;
    for handle in handles {
        if let Err(e) = handle.await? {
            error!(
                error = %e,
                fatal = e.is_fatal(),
                recoverable = e.is_recoverable(),
                "Rank failed"
            );
            exit_code = exit_code.max(if e.is_fatal() { 2 } else { 1 });
        }
    }
    printer.await?;

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    info!("Simulation finished");
    Ok(())
}

async fn run_rank(
    member: LocalCollective,
    config: Arc<CheckpointConfig>,
    storage: StorageHandle,
    events: mpsc::Sender<CheckpointEvent>,
    args: SimArgs,
) -> Result<()> {
    let role = RankRole::new(member.rank(), member.world_size())?;
    let collective: CollectiveHandle = Arc::new(member);
    let checkpointer =
        Checkpointer::new(role, Arc::clone(&config), storage, Arc::clone(&collective))?.with_events(events);

    let mut model = LocalShardedModel::new(Arc::clone(&collective), initial_parameters(args.params));
    let restored = match config.mode {
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
    println!("{}: model restored = {}, holding {:?}", role, restored, model.parameters());

    let mut optimizer = LocalShardedOptimizer::for_model(Arc::clone(&collective), &model)?;
    let restored = checkpointer.load_optimizer(&mut optimizer).await?;
    println!("{}: optimizer restored = {} ({} slots)", role, restored, optimizer.len());

    for epoch in args.start_epoch..args.start_epoch + args.epochs {
        train_step(&mut model, &mut optimizer, epoch)?;
        match config.mode {
            CheckpointMode::FullState => checkpointer.save_model(&model, epoch).await?,
            CheckpointMode::Distributed => checkpointer.save_distributed(&model, epoch).await?,
        }
        checkpointer.save_optimizer(&optimizer, epoch).await?;
    }

    if config.mode == CheckpointMode::Distributed && args.epochs > 0 {
        // Distributed saves have no collective; wait for every shard
        collective.barrier(CollectiveOp::Barrier).await?;
        if role.is_coordinator() {
            let last = args.start_epoch + args.epochs - 1;
            let full = checkpointer.assemble_distributed(last).await?;
            println!("{}: epoch {} assembles to {} parameters", role, last, full.len());
        }
    }
    Ok(())
}

fn initial_parameters(count: usize) -> BTreeMap<String, StateValue> {
    (0..count)
        .map(|i| {
            let name = format!("layer{:02}.weight", i);
            (name, StateValue::from(Tensor::filled(vec![4, 4], i as f32 * 0.1)))
        })
        .collect()
}

/// Stand-in for a training epoch: nudge weights, record optimizer slots
fn train_step(model: &mut LocalShardedModel, optimizer: &mut LocalShardedOptimizer, epoch: Epoch) -> Result<()> {
    for name in model.parameters() {
        let Some(StateValue::Tensor(weights)) = model.get(&name).cloned() else {
            continue;
        };
        let nudged = Tensor::new(weights.shape.clone(), weights.data.iter().map(|w| w + 0.01).collect())?;
        model.update(&name, nudged)?;

        optimizer.set_slot(&name, "exp_avg", Tensor::filled(weights.shape, 0.01))?;
        optimizer.set_slot(&name, "step", StateValue::Count(epoch + 1))?;
    }
    Ok(())
}

fn print_event(event: &CheckpointEvent) {
    match event {
        CheckpointEvent::Started { purpose, rank, target } => {
            println!("rank {}: {} started ({})", rank, purpose, target)
        }
        CheckpointEvent::Progress {
            purpose,
            rank,
            phase,
            elapsed,
        } => println!("rank {}: {} still {} after {:?}", rank, purpose, phase, elapsed),
        CheckpointEvent::Completed {
            artifact,
            rank,
            path,
            size_bytes,
            elapsed,
        } => println!(
            "rank {}: {} epoch {} done at {} ({} bytes, {:?})",
            rank, artifact.purpose, artifact.epoch, path, size_bytes, elapsed
        ),
        CheckpointEvent::Skipped { purpose, rank, reason } => {
            println!("rank {}: {} skipped: {}", rank, purpose, reason)
        }
    }
}
