//! Checkpoint coordination for sharded training
//!
//! A [`Checkpointer`] is built once per rank and exposes the save/load pairs
//! for the two checkpoint modes plus optimizer state:
//!
//! - full-state: [`Checkpointer::save_model`] / [`Checkpointer::load_model`]
//! - distributed: [`Checkpointer::save_distributed`] / [`Checkpointer::load_distributed`]
//! - optimizer: [`Checkpointer::save_optimizer`] / [`Checkpointer::load_optimizer`]
//!
//! Loads return whether an artifact was applied. Every load decision that
//! gates a collective comes from the coordinating rank, so all ranks either
//! apply or skip together.

pub mod checkpointer;
pub mod distributed;
pub mod events;
pub mod format;
pub mod full_state;
pub mod layout;
pub mod optimizer;
pub mod provider;
pub mod sharded;
pub mod store;

pub use checkpointer::Checkpointer;
pub use events::{track_progress, CheckpointEvent, EventSink, Phase};
pub use format::{ArtifactHeader, DistributedManifest, ARTIFACT_MAGIC, ARTIFACT_VERSION};
pub use layout::ArtifactLayout;
pub use provider::{OptimizerStateProvider, ShardSnapshotProvider};
pub use sharded::{optimizer_key, LocalShardedModel, LocalShardedOptimizer, ShardLayout};
pub use store::ArtifactStore;
