//! Error types for the distributed checkpoint coordinator

use thiserror::Error;

use crate::types::{CheckpointMode, Rank};

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type shared by every crate in the workspace
#[derive(Error, Debug)]
pub enum Error {
    // Checkpoint errors
    #[error("Checkpoint mode mismatch in {operation}: expected {expected}, found {actual}")]
    ConfigurationMismatch {
        operation: String,
        expected: CheckpointMode,
        actual: CheckpointMode,
    },

    #[error("Checkpoint artifact not found: {path}")]
    ArtifactNotFound { path: String },

    #[error("Partial participation prevented: {message}")]
    PartialParticipation { message: String },

    #[error("Checkpoint corrupted: {path} - {reason}")]
    CheckpointCorrupted { path: String, reason: String },

    #[error("Checkpoint write failed: {message}")]
    CheckpointWriteFailed { message: String },

    #[error("Snapshot mismatch: {message}")]
    SnapshotMismatch { message: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    // Collective errors
    #[error("Collective mismatch at sequence {sequence} on rank {rank}: round is {expected}, rank called {actual}")]
    CollectiveMismatch {
        sequence: u64,
        rank: Rank,
        expected: String,
        actual: String,
    },

    #[error("Collective {op} failed: {message}")]
    CollectiveFailed { op: String, message: String },

    #[error("Invalid rank {rank} for world size {world_size}")]
    InvalidRank { rank: Rank, world_size: u32 },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    // Channel errors
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },
}

impl Error {
    /// Returns true if the condition should be reported and skipped rather
    /// than abort training
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ArtifactNotFound { .. } | Error::StoragePathNotFound { .. }
        )
    }

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage { .. } | Error::Io(_))
    }

    /// Returns true if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigurationMismatch { .. }
                | Error::PartialParticipation { .. }
                | Error::CheckpointCorrupted { .. }
                | Error::CollectiveMismatch { .. }
                | Error::InvalidConfig { .. }
                | Error::InvalidRank { .. }
                | Error::Internal { .. }
        )
    }

    /// Returns a retry delay hint in milliseconds, if applicable
    pub fn retry_delay_hint_ms(&self) -> Option<u64> {
        match self {
            Error::Storage { .. } => Some(100),
            Error::Io(_) => Some(250),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
