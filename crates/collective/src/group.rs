//! Collective trait definition

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{Rank, Result};
use std::fmt;
use std::sync::Arc;

use crate::CollectiveOp;

/// Cross-rank communication primitives
///
/// Every rank in the cohort must issue the same sequence of calls with the
/// same `op` and `root`. Implementations report a divergence as
/// `Error::CollectiveMismatch` on every participant of the affected round.
/// Invalid root input is reported after the rendezvous so all ranks fail
/// together.
#[async_trait]
pub trait Collective: Send + Sync + fmt::Debug {
    /// Rank of this participant
    fn rank(&self) -> Rank;

    /// Number of participants
    fn world_size(&self) -> u32;

    /// Collect one payload from every rank on `root`
    ///
    /// Returns `Some(payloads)` indexed by rank on the root, `None` elsewhere.
    async fn gather(&self, op: CollectiveOp, payload: Bytes, root: Rank) -> Result<Option<Vec<Bytes>>>;

    /// Distribute one part per rank from `root`
    ///
    /// Only the root's `parts` are used; it must hold exactly `world_size`
    /// entries.
    async fn scatter(&self, op: CollectiveOp, parts: Option<Vec<Bytes>>, root: Rank) -> Result<Bytes>;

    /// Send the root's payload to every rank
    async fn broadcast(&self, op: CollectiveOp, payload: Option<Bytes>, root: Rank) -> Result<Bytes>;

    /// Collect one payload from every rank on every rank
    async fn all_gather(&self, op: CollectiveOp, payload: Bytes) -> Result<Vec<Bytes>>;

    /// Wait until every rank arrives
    async fn barrier(&self, op: CollectiveOp) -> Result<()>;
}

/// Thread-safe handle to a collective group member
pub type CollectiveHandle = Arc<dyn Collective>;
