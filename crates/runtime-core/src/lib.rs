//! Runtime Core - Foundation for the distributed checkpoint coordinator
//!
//! Provides the rank role, checkpoint mode and snapshot types, the shared
//! error taxonomy, configuration, and logging bootstrap used by every other
//! crate in the workspace.

pub mod config;
pub mod error;
pub mod logging;
pub mod snapshot;
pub mod types;

pub use config::{CheckpointConfig, LoggingConfig, RuntimeConfig};
pub use error::{Error, Result};
pub use snapshot::{Snapshot, SnapshotScope, StateValue, Tensor};
pub use types::*;
