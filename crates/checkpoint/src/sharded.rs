//! In-process reference sharding runtime
//!
//! Parameters are assigned round-robin over their sorted names. Optimizer
//! slots are keyed `{param}/{slot}` and live on their parameter's owner.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use collective::{CollectiveHandle, CollectiveOp};
use runtime_core::{Error, Rank, Result, Snapshot, SnapshotScope, StateValue, COORDINATOR_RANK};
use tracing::{debug, warn};

use crate::provider::{OptimizerStateProvider, ShardSnapshotProvider};

/// Key of an optimizer slot for a parameter
pub fn optimizer_key(param: &str, slot: &str) -> String {
    format!("{}/{}", param, slot)
}

/// Which rank owns which parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLayout {
    world_size: u32,
    owners: BTreeMap<String, Rank>,
}

impl ShardLayout {
    /// Assign names to ranks in turn, in sorted order
    pub fn round_robin<I, S>(names: I, world_size: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut owners: BTreeMap<String, Rank> = names.into_iter().map(|n| (n.into(), 0)).collect();
        for (i, owner) in owners.values_mut().enumerate() {
            *owner = (i as u64 % world_size.max(1) as u64) as Rank;
        }
        Self {
            world_size: world_size.max(1),
            owners,
        }
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn owner_of(&self, param: &str) -> Option<Rank> {
        self.owners.get(param).copied()
    }

    /// Parameter names owned by `rank`, sorted
    pub fn owned_by(&self, rank: Rank) -> Vec<String> {
        self.owners
            .iter()
            .filter(|(_, owner)| **owner == rank)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Owner of an optimizer slot key
    pub fn optimizer_owner(&self, key: &str) -> Option<Rank> {
        let (param, _slot) = key.rsplit_once('/')?;
        self.owner_of(param)
    }

    /// Split a complete optimizer snapshot into one partial per rank
    pub fn split_optimizer(&self, full: Snapshot) -> Result<Vec<Snapshot>> {
        if !full.is_complete() {
            return Err(Error::SnapshotMismatch {
                message: "optimizer state to scatter must be complete".to_string(),
            });
        }

        let mut parts: Vec<Snapshot> = (0..self.world_size).map(Snapshot::partial).collect();
        for (key, value) in full.into_entries() {
            let owner = self.optimizer_owner(&key).ok_or_else(|| Error::SnapshotMismatch {
                message: format!("optimizer key '{}' has no owner in the current layout", key),
            })?;
            parts[owner as usize].insert(key, value);
        }
        Ok(parts)
    }
}

enum ModelState {
    Unsharded(BTreeMap<String, StateValue>),
    Sharded {
        layout: ShardLayout,
        local: BTreeMap<String, StateValue>,
    },
}

/// Model replica that can be partitioned across a cohort
pub struct LocalShardedModel {
    collective: CollectiveHandle,
    state: ModelState,
}

impl LocalShardedModel {
    /// Unsharded model holding every parameter
    pub fn new(collective: CollectiveHandle, params: BTreeMap<String, StateValue>) -> Self {
        Self {
            collective,
            state: ModelState::Unsharded(params),
        }
    }

    /// Partition the model; every rank must call this
    ///
    /// The coordinating rank's weights are broadcast first, so a full-state
    /// load applied there reaches every shard.
    pub async fn shard(&mut self) -> Result<()> {
        let ModelState::Unsharded(params) = &self.state else {
            return Err(Error::InvalidState {
                message: "model is already sharded".to_string(),
            });
        };

        let rank = self.collective.rank();
        let payload = if rank == COORDINATOR_RANK {
            let full = Snapshot::from_entries(SnapshotScope::Complete, params.clone());
            Some(Bytes::from(full.to_bytes()?))
        } else {
            None
        };

        let bytes = self
            .collective
            .broadcast(CollectiveOp::ModelStateBroadcast, payload, COORDINATOR_RANK)
            .await?;
        let full = Snapshot::from_bytes(&bytes)?;

        let layout = ShardLayout::round_robin(full.keys().cloned(), self.collective.world_size());
        let local: BTreeMap<_, _> = full
            .into_entries()
            .into_iter()
            .filter(|(name, _)| layout.owner_of(name) == Some(rank))
            .collect();

        debug!(rank, owned = local.len(), total = layout.len(), "Model sharded");
        self.state = ModelState::Sharded { layout, local };
        Ok(())
    }

    pub fn layout(&self) -> Option<&ShardLayout> {
        match &self.state {
            ModelState::Sharded { layout, .. } => Some(layout),
            ModelState::Unsharded(_) => None,
        }
    }

    /// Parameter names held by this rank
    pub fn parameters(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&StateValue> {
        self.entries().get(name)
    }

    /// Replace a parameter held by this rank
    pub fn update(&mut self, name: &str, value: impl Into<StateValue>) -> Result<()> {
        let entries = match &mut self.state {
            ModelState::Unsharded(params) => params,
            ModelState::Sharded { local, .. } => local,
        };
        match entries.get_mut(name) {
            Some(slot) => {
                *slot = value.into();
                Ok(())
            }
            None => Err(Error::InvalidState {
                message: format!("parameter '{}' is not held by this rank", name),
            }),
        }
    }

    fn entries(&self) -> &BTreeMap<String, StateValue> {
        match &self.state {
            ModelState::Unsharded(params) => params,
            ModelState::Sharded { local, .. } => local,
        }
    }

    fn local_partial(&self, local: &BTreeMap<String, StateValue>) -> Snapshot {
        Snapshot::from_entries(
            SnapshotScope::Partial {
                rank: self.collective.rank(),
            },
            local.clone(),
        )
    }
}

fn require_same_keys(live: &BTreeMap<String, StateValue>, incoming: &Snapshot) -> Result<()> {
    if !incoming.same_keys(live.keys()) {
        let missing: Vec<_> = live.keys().filter(|k| !incoming.contains(k)).collect();
        let extra: Vec<_> = incoming.keys().filter(|k| !live.contains_key(*k)).collect();
        return Err(Error::SnapshotMismatch {
            message: format!("missing keys {:?}, unexpected keys {:?}", missing, extra),
        });
    }
    Ok(())
}

#[async_trait]
impl ShardSnapshotProvider for LocalShardedModel {
    fn is_sharded(&self) -> bool {
        matches!(self.state, ModelState::Sharded { .. })
    }

    async fn full_snapshot(&self) -> Result<Option<Snapshot>> {
        let rank = self.collective.rank();
        match &self.state {
            ModelState::Unsharded(params) => Ok((rank == COORDINATOR_RANK)
                .then(|| Snapshot::from_entries(SnapshotScope::Complete, params.clone()))),
            ModelState::Sharded { layout, local } => {
                let payload = Bytes::from(self.local_partial(local).to_bytes()?);
                let gathered = self
                    .collective
                    .gather(CollectiveOp::ModelStateGather, payload, COORDINATOR_RANK)
                    .await?;

                let Some(parts) = gathered else {
                    return Ok(None);
                };
                let shards = parts
                    .iter()
                    .map(|bytes| Snapshot::from_bytes(bytes))
                    .collect::<Result<Vec<_>>>()?;
                let full = Snapshot::merge_partials(shards)?;
                if full.len() != layout.len() {
                    return Err(Error::SnapshotMismatch {
                        message: format!("gathered {} parameters, layout has {}", full.len(), layout.len()),
                    });
                }
                Ok(Some(full))
            }
        }
    }

    async fn local_snapshot(&self) -> Result<Snapshot> {
        match &self.state {
            ModelState::Sharded { local, .. } => Ok(self.local_partial(local)),
            ModelState::Unsharded(_) => Err(Error::InvalidState {
                message: "local snapshot requested from an unsharded model".to_string(),
            }),
        }
    }

    fn check_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        match (&self.state, snapshot.scope()) {
            (ModelState::Unsharded(params), SnapshotScope::Complete) => require_same_keys(params, snapshot),
            (ModelState::Sharded { local, .. }, SnapshotScope::Partial { rank })
                if rank == self.collective.rank() =>
            {
                require_same_keys(local, snapshot)
            }
            (_, scope) => Err(Error::SnapshotMismatch {
                message: format!(
                    "cannot apply {:?} snapshot to {} model on rank {}",
                    scope,
                    if self.is_sharded() { "sharded" } else { "unsharded" },
                    self.collective.rank()
                ),
            }),
        }
    }

    async fn apply_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        self.check_snapshot(&snapshot)?;
        match &mut self.state {
            ModelState::Unsharded(params) => *params = snapshot.into_entries(),
            ModelState::Sharded { local, .. } => *local = snapshot.into_entries(),
        }
        Ok(())
    }
}

/// Optimizer state partitioned like its model
pub struct LocalShardedOptimizer {
    collective: CollectiveHandle,
    layout: ShardLayout,
    local: BTreeMap<String, StateValue>,
}

impl LocalShardedOptimizer {
    pub fn new(collective: CollectiveHandle, layout: ShardLayout) -> Self {
        Self {
            collective,
            layout,
            local: BTreeMap::new(),
        }
    }

    /// Empty optimizer following a sharded model's layout
    pub fn for_model(collective: CollectiveHandle, model: &LocalShardedModel) -> Result<Self> {
        let layout = model.layout().cloned().ok_or_else(|| Error::InvalidState {
            message: "optimizer needs a sharded model".to_string(),
        })?;
        Ok(Self::new(collective, layout))
    }

    pub fn layout(&self) -> &ShardLayout {
        &self.layout
    }

    /// Set a slot for a parameter owned by this rank
    pub fn set_slot(&mut self, param: &str, slot: &str, value: impl Into<StateValue>) -> Result<()> {
        let rank = self.collective.rank();
        match self.layout.owner_of(param) {
            Some(owner) if owner == rank => {
                self.local.insert(optimizer_key(param, slot), value.into());
                Ok(())
            }
            Some(owner) => Err(Error::InvalidState {
                message: format!("parameter '{}' is owned by rank {}, not {}", param, owner, rank),
            }),
            None => Err(Error::InvalidState {
                message: format!("unknown parameter '{}'", param),
            }),
        }
    }

    pub fn slot(&self, param: &str, slot: &str) -> Option<&StateValue> {
        self.local.get(&optimizer_key(param, slot))
    }

    /// Number of slots held by this rank
    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    /// This rank's slots as a partial snapshot
    pub fn local_state(&self) -> Snapshot {
        Snapshot::from_entries(
            SnapshotScope::Partial {
                rank: self.collective.rank(),
            },
            self.local.clone(),
        )
    }
}

#[async_trait]
impl OptimizerStateProvider for LocalShardedOptimizer {
    async fn gather_full_optimizer_state(&self) -> Result<Option<Snapshot>> {
        let payload = Bytes::from(self.local_state().to_bytes()?);
        let gathered = self
            .collective
            .gather(CollectiveOp::OptimizerGather, payload, COORDINATOR_RANK)
            .await?;

        match gathered {
            Some(parts) => {
                let shards = parts
                    .iter()
                    .map(|bytes| Snapshot::from_bytes(bytes))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Some(Snapshot::merge_partials(shards)?))
            }
            None => Ok(None),
        }
    }

    async fn scatter_optimizer_state(&self, full: Option<Snapshot>) -> Result<Snapshot> {
        let rank = self.collective.rank();

        // The coordinator still joins the round when splitting fails, so every
        // rank sees the scatter fail together.
        let mut split_error = None;
        let parts = match full {
            Some(full) if rank == COORDINATOR_RANK => match self.layout.split_optimizer(full) {
                Ok(shards) => Some(
                    shards
                        .iter()
                        .map(|s| s.to_bytes().map(Bytes::from))
                        .collect::<Result<Vec<_>>>()?,
                ),
                Err(e) => {
                    warn!(rank, error = %e, "Optimizer state does not fit the current layout");
                    split_error = Some(e);
                    None
                }
            },
            _ => None,
        };

        let received = self
            .collective
            .scatter(CollectiveOp::OptimizerScatter, parts, COORDINATOR_RANK)
            .await;
        if let Some(e) = split_error {
            return Err(e);
        }

        let shard = Snapshot::from_bytes(&received?)?;
        debug!(rank, slots = shard.len(), "Optimizer shard received");
        Ok(shard)
    }

    fn check_optimizer_state(&self, shard: &Snapshot) -> Result<()> {
        let rank = self.collective.rank();
        if shard.owner() != Some(rank) {
            return Err(Error::SnapshotMismatch {
                message: format!("optimizer shard for {:?} delivered to rank {}", shard.scope(), rank),
            });
        }
        if let Some(stray) = shard.keys().find(|k| self.layout.optimizer_owner(k) != Some(rank)) {
            return Err(Error::SnapshotMismatch {
                message: format!("optimizer key '{}' is not owned by rank {}", stray, rank),
            });
        }
        Ok(())
    }

    async fn apply_optimizer_state(&mut self, shard: Snapshot) -> Result<()> {
        self.check_optimizer_state(&shard)?;
        self.local = shard.into_entries();
        Ok(())
    }
}
