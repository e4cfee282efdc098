//! Core type definitions for the checkpoint coordinator

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Process identity within the training cohort
pub type Rank = u32;

/// Training epoch counter
pub type Epoch = u64;

/// The rank that owns full-state file I/O and reporting
pub const COORDINATOR_RANK: Rank = 0;

/// Role of this process in the cohort, fixed for the lifetime of the run
///
/// Constructed once at startup and handed to every component, so the
/// "who does I/O" decision is made in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankRole {
    rank: Rank,
    world_size: u32,
    coordinator: Rank,
}

impl RankRole {
    /// Create a role with rank 0 as coordinator
    pub fn new(rank: Rank, world_size: u32) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::InvalidConfig {
                message: "world size must be at least 1".to_string(),
            });
        }
        if rank >= world_size {
            return Err(Error::InvalidRank { rank, world_size });
        }

        Ok(Self {
            rank,
            world_size,
            coordinator: COORDINATOR_RANK,
        })
    }

    /// This process's rank
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of ranks in the cohort
    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    /// Rank of the coordinator
    pub fn coordinator(&self) -> Rank {
        self.coordinator
    }

    /// Returns true if this process is the coordinating rank
    pub fn is_coordinator(&self) -> bool {
        self.rank == self.coordinator
    }
}

impl fmt::Display for RankRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank {}/{}", self.rank, self.world_size)
    }
}

/// Checkpoint strategy selected once per run
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    /// Gather to the coordinator and write a single artifact
    #[default]
    FullState,

    /// Every rank writes its own shard into a shared directory
    Distributed,
}

impl CheckpointMode {
    /// Stable on-disk code
    pub fn code(self) -> u8 {
        match self {
            CheckpointMode::FullState => 1,
            CheckpointMode::Distributed => 2,
        }
    }

    /// Decode an on-disk code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(CheckpointMode::FullState),
            2 => Some(CheckpointMode::Distributed),
            _ => None,
        }
    }
}

impl fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointMode::FullState => f.write_str("full_state"),
            CheckpointMode::Distributed => f.write_str("distributed"),
        }
    }
}

/// What a checkpoint artifact holds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactPurpose {
    /// Model weights
    Model,

    /// Optimizer state
    Optimizer,
}

impl ArtifactPurpose {
    /// Stable on-disk code
    pub fn code(self) -> u8 {
        match self {
            ArtifactPurpose::Model => 1,
            ArtifactPurpose::Optimizer => 2,
        }
    }

    /// Decode an on-disk code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ArtifactPurpose::Model),
            2 => Some(ArtifactPurpose::Optimizer),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactPurpose::Model => f.write_str("model"),
            ArtifactPurpose::Optimizer => f.write_str("optimizer"),
        }
    }
}

/// Identity of a persisted checkpoint artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactId {
    /// Model or optimizer
    pub purpose: ArtifactPurpose,

    /// Model name the artifact belongs to
    pub model_name: String,

    /// Epoch that produced the artifact
    pub epoch: Epoch,
}

impl ArtifactId {
    pub fn new(purpose: ArtifactPurpose, model_name: impl Into<String>, epoch: Epoch) -> Self {
        Self {
            purpose,
            model_name: model_name.into(),
            epoch,
        }
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.purpose, self.model_name, self.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_role() {
        let role = RankRole::new(0, 4).unwrap();
        assert!(role.is_coordinator());
        assert_eq!(role.world_size(), 4);

        let role = RankRole::new(3, 4).unwrap();
        assert!(!role.is_coordinator());
        assert_eq!(role.coordinator(), 0);
        assert_eq!(role.to_string(), "rank 3/4");
    }

    #[test]
    fn test_rank_role_rejects_out_of_range() {
        assert!(matches!(
            RankRole::new(4, 4),
            Err(Error::InvalidRank { rank: 4, world_size: 4 })
        ));
        assert!(matches!(RankRole::new(0, 0), Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_codes_roundtrip() {
        for mode in [CheckpointMode::FullState, CheckpointMode::Distributed] {
            assert_eq!(CheckpointMode::from_code(mode.code()), Some(mode));
        }
        for purpose in [ArtifactPurpose::Model, ArtifactPurpose::Optimizer] {
            assert_eq!(ArtifactPurpose::from_code(purpose.code()), Some(purpose));
        }
        assert_eq!(CheckpointMode::from_code(9), None);
    }

    #[test]
    fn test_mode_serde_names() {
        let json = serde_json::to_string(&CheckpointMode::Distributed).unwrap();
        assert_eq!(json, "\"distributed\"");
        let parsed: CheckpointMode = serde_json::from_str("\"full_state\"").unwrap();
        assert_eq!(parsed, CheckpointMode::FullState);
    }
}
