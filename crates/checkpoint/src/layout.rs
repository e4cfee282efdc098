//! Artifact naming
//!
//! Every epoch's artifact gets a distinct key, so saves for different epochs
//! never race on the same path.

use std::sync::Arc;

use runtime_core::{CheckpointConfig, Epoch, Rank};

/// File extension for artifact files
pub const ARTIFACT_EXTENSION: &str = "ckpt";

/// Manifest written by the coordinator into each distributed directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Key of one rank's entry inside a distributed checkpoint directory
pub fn shard_key(dir: &str, rank: Rank) -> String {
    format!("{}/shard-{:05}.{}", dir, rank, ARTIFACT_EXTENSION)
}

/// Key of the manifest inside a distributed checkpoint directory
pub fn manifest_key(dir: &str) -> String {
    format!("{}/{}", dir, MANIFEST_FILE)
}

/// Maps (purpose, model name, epoch) to storage keys
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    config: Arc<CheckpointConfig>,
}

impl ArtifactLayout {
    pub fn new(config: Arc<CheckpointConfig>) -> Self {
        Self { config }
    }

    /// `{folder}/{model_save_name}-{epoch}.ckpt`
    pub fn model_file(&self, epoch: Epoch) -> String {
        format!("{}{}.{}", self.model_prefix(), epoch, ARTIFACT_EXTENSION)
    }

    /// `{folder}/{optimizer_name}-{model_save_name}-{epoch}.ckpt`
    pub fn optimizer_file(&self, epoch: Epoch) -> String {
        format!("{}{}.{}", self.optimizer_prefix(), epoch, ARTIFACT_EXTENSION)
    }

    /// `{dist_root}/{dist_folder}-{model_name}-{epoch}`
    pub fn distributed_dir(&self, epoch: Epoch) -> String {
        format!("{}{}", self.distributed_prefix(), epoch)
    }

    pub fn shard_file(&self, epoch: Epoch, rank: Rank) -> String {
        shard_key(&self.distributed_dir(epoch), rank)
    }

    pub fn manifest_file(&self, epoch: Epoch) -> String {
        manifest_key(&self.distributed_dir(epoch))
    }

    /// Explicitly configured model file, if any
    pub fn model_load_override(&self) -> Option<String> {
        self.config
            .checkpoint_model_filename
            .as_ref()
            .map(|name| format!("{}/{}", self.config.checkpoint_folder, name))
    }

    /// Explicitly configured optimizer file, if any
    pub fn optimizer_load_override(&self) -> Option<String> {
        self.config
            .optimizer_checkpoint_file
            .as_ref()
            .map(|name| format!("{}/{}", self.config.checkpoint_folder, name))
    }

    pub fn model_prefix(&self) -> String {
        format!("{}/{}-", self.config.checkpoint_folder, self.config.model_save_name)
    }

    pub fn optimizer_prefix(&self) -> String {
        format!(
            "{}/{}-{}-",
            self.config.checkpoint_folder, self.config.optimizer_name, self.config.model_save_name
        )
    }

    pub fn distributed_prefix(&self) -> String {
        format!(
            "{}/{}-{}-",
            self.config.dist_checkpoint_root_folder,
            self.config.dist_checkpoint_folder,
            self.config.model_name
        )
    }

    /// Epoch encoded in a full-state file key, given its prefix
    pub fn file_epoch(prefix: &str, key: &str) -> Option<Epoch> {
        let rest = key.strip_prefix(prefix)?;
        let digits = rest.strip_suffix(ARTIFACT_EXTENSION)?.strip_suffix('.')?;
        parse_epoch(digits)
    }

    /// Epoch of a distributed directory, recognized by its manifest key
    pub fn manifest_epoch(&self, key: &str) -> Option<Epoch> {
        let rest = key.strip_prefix(&self.distributed_prefix())?;
        let (digits, file) = rest.split_once('/')?;
        (file == MANIFEST_FILE).then_some(())?;
        parse_epoch(digits)
    }
}

fn parse_epoch(digits: &str) -> Option<Epoch> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
