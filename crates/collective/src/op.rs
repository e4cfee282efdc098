//! Collective operation tags

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies which step of a checkpoint protocol a collective call belongs to
///
/// Ranks rendezvous by call order; the tag lets the rendezvous detect two
/// ranks that reached the same slot through different protocol steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectiveOp {
    /// Gather partial model state to the coordinator
    ModelStateGather,

    /// Broadcast coordinator weights when sharding a model
    ModelStateBroadcast,

    /// Gather partial optimizer state to the coordinator
    OptimizerGather,

    /// Scatter coordinator optimizer state by current layout
    OptimizerScatter,

    /// Coordinator tells every rank whether an artifact will be loaded
    LoadDecision,

    /// Every rank reports whether its local read succeeded
    ReadCommit,

    /// Plain synchronization point
    Barrier,
}

impl fmt::Display for CollectiveOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollectiveOp::ModelStateGather => "model_state_gather",
            CollectiveOp::ModelStateBroadcast => "model_state_broadcast",
            CollectiveOp::OptimizerGather => "optimizer_gather",
            CollectiveOp::OptimizerScatter => "optimizer_scatter",
            CollectiveOp::LoadDecision => "load_decision",
            CollectiveOp::ReadCommit => "read_commit",
            CollectiveOp::Barrier => "barrier",
        };
        f.write_str(name)
    }
}
