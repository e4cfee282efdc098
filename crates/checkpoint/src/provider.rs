//! Boundary to the sharding runtime
//!
//! The coordinator never touches parameters directly. It asks the runtime for
//! snapshots and hands restored snapshots back through these traits.

use async_trait::async_trait;
use runtime_core::{Result, Snapshot};

/// Model state as seen by the sharding runtime
#[async_trait]
pub trait ShardSnapshotProvider: Send + Sync {
    /// True once parameters are partitioned across ranks
    fn is_sharded(&self) -> bool;

    /// Complete snapshot, materialized on the coordinating rank only
    ///
    /// Collective when sharded: every rank must call it. Non-coordinating
    /// ranks receive `None`.
    async fn full_snapshot(&self) -> Result<Option<Snapshot>>;

    /// This rank's own partition. Never collective.
    async fn local_snapshot(&self) -> Result<Snapshot>;

    /// Validate a snapshot without applying it
    fn check_snapshot(&self, _snapshot: &Snapshot) -> Result<()> {
        Ok(())
    }

    /// Install a restored snapshot into the live representation
    ///
    /// A complete snapshot applies to an unsharded model, a partial one to the
    /// owning rank's shard.
    async fn apply_snapshot(&mut self, snapshot: Snapshot) -> Result<()>;
}

/// Optimizer state as seen by the sharding runtime
#[async_trait]
pub trait OptimizerStateProvider: Send + Sync {
    /// Gather every rank's optimizer state onto the coordinating rank
    ///
    /// Always collective. Non-coordinating ranks receive `None`.
    async fn gather_full_optimizer_state(&self) -> Result<Option<Snapshot>>;

    /// Split the coordinator's complete state by the current layout and hand
    /// each rank its portion
    ///
    /// Always collective. Non-coordinating ranks pass `None`.
    async fn scatter_optimizer_state(&self, full: Option<Snapshot>) -> Result<Snapshot>;

    /// Validate a scattered shard without applying it
    fn check_optimizer_state(&self, _shard: &Snapshot) -> Result<()> {
        Ok(())
    }

    /// Install this rank's scattered portion
    async fn apply_optimizer_state(&mut self, shard: Snapshot) -> Result<()>;
}
