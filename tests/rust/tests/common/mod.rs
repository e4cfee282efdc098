//! Shared helpers for multi-rank checkpoint scenarios

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use checkpoint::Checkpointer;
use collective::{local_cohort, Collective, CollectiveHandle};
use runtime_core::{CheckpointConfig, RankRole, StateValue, Tensor};
use storage::{LocalStorage, StorageHandle};

/// Everything one rank needs to run a scenario
pub struct RankContext {
    pub role: RankRole,
    pub collective: CollectiveHandle,
    pub checkpointer: Checkpointer,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Build a cohort of `world_size` ranks sharing storage rooted at `root`
pub fn cohort(root: &Path, config: CheckpointConfig, world_size: u32) -> Result<Vec<RankContext>> {
    let config = Arc::new(config);
    let storage: StorageHandle = Arc::new(LocalStorage::new(root));

    local_cohort(world_size)?
        .into_iter()
        .map(|member| -> Result<RankContext> {
            let role = RankRole::new(member.rank(), world_size)?;
            let collective: CollectiveHandle = Arc::new(member);
            let checkpointer =
                Checkpointer::new(role, Arc::clone(&config), Arc::clone(&storage), Arc::clone(&collective))?;
            Ok(RankContext {
                role,
                collective,
                checkpointer,
            })
        })
        .collect()
}

/// Run `f` on every rank concurrently and return results in rank order
pub async fn on_every_rank<F, Fut, T>(ranks: Vec<RankContext>, f: F) -> Vec<Result<T>>
where
    F: Fn(RankContext) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = ranks.into_iter().map(|ctx| tokio::spawn(f(ctx))).collect();

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(match handle.await {
            Ok(result) => result,
            Err(e) => Err(e.into()),
        });
    }
    results
}

/// `count` parameters named `block{i}.weight`, each a small tensor of `base + i`
pub fn parameters(count: usize, base: f32) -> BTreeMap<String, StateValue> {
    (0..count)
        .map(|i| (format!("block{:02}.weight", i), tensor(base + i as f32)))
        .collect()
}

pub fn tensor(value: f32) -> StateValue {
    StateValue::from(Tensor::filled(vec![3, 2], value))
}

/// Count of regular files under `dir`, recursively
pub fn file_count(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                file_count(&path)
            } else {
                1
            }
        })
        .sum()
}
