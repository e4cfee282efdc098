//! Runtime configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{CheckpointMode, Epoch, Error, Result};

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Checkpoint settings
    pub checkpoint: CheckpointConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::InvalidConfig {
            message: format!("Failed to read {}: {}", path.as_ref().display(), e),
        })?;
        let config: RuntimeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all sections
    pub fn validate(&self) -> Result<()> {
        self.checkpoint.validate()
    }
}

/// Checkpoint configuration
///
/// Built once per run and shared read-only by every operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Strategy used for model checkpoints
    pub mode: CheckpointMode,

    /// Root that all artifact keys are resolved against
    pub base_path: PathBuf,

    /// Folder for full-state model and optimizer files
    pub checkpoint_folder: String,

    /// File stem for full-state model artifacts
    pub model_save_name: String,

    /// Optimizer name, prefixed to optimizer artifacts
    pub optimizer_name: String,

    /// Model name, suffixed to distributed checkpoint directories
    pub model_name: String,

    /// Root folder for distributed checkpoints
    pub dist_checkpoint_root_folder: String,

    /// Directory stem for distributed checkpoints
    pub dist_checkpoint_folder: String,

    /// Explicit model file to load, relative to `checkpoint_folder`
    pub checkpoint_model_filename: Option<String>,

    /// Explicit optimizer file to load, relative to `checkpoint_folder`
    pub optimizer_checkpoint_file: Option<String>,

    /// Epoch to resume from; latest present when unset
    pub load_epoch: Option<Epoch>,

    /// Log per-rank progress at info level
    pub verbose: bool,

    /// Interval between progress reports during long transfers
    #[serde(with = "humantime_serde")]
    pub progress_interval: Duration,

    /// Extra attempts for an artifact write that failed with a retryable error
    pub write_retries: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            mode: CheckpointMode::FullState,
            base_path: PathBuf::from("."),
            checkpoint_folder: "checkpoints".to_string(),
            model_save_name: "model".to_string(),
            optimizer_name: "optimizer".to_string(),
            model_name: "model".to_string(),
            dist_checkpoint_root_folder: "distributed_checkpoints".to_string(),
            dist_checkpoint_folder: "dist".to_string(),
            checkpoint_model_filename: None,
            optimizer_checkpoint_file: None,
            load_epoch: None,
            verbose: true,
            progress_interval: Duration::from_secs(10),
            write_retries: 3,
        }
    }
}

impl CheckpointConfig {
    /// Check naming parts and intervals
    pub fn validate(&self) -> Result<()> {
        let names = [
            ("checkpoint_folder", &self.checkpoint_folder),
            ("model_save_name", &self.model_save_name),
            ("optimizer_name", &self.optimizer_name),
            ("model_name", &self.model_name),
            ("dist_checkpoint_root_folder", &self.dist_checkpoint_root_folder),
            ("dist_checkpoint_folder", &self.dist_checkpoint_folder),
        ];
        for (field, value) in names {
            if value.is_empty() {
                return Err(Error::InvalidConfig {
                    message: format!("{} must not be empty", field),
                });
            }
        }

        // Stems are joined with '-' into a single path component
        for (field, value) in [
            ("model_save_name", &self.model_save_name),
            ("optimizer_name", &self.optimizer_name),
            ("model_name", &self.model_name),
            ("dist_checkpoint_folder", &self.dist_checkpoint_folder),
        ] {
            if value.contains('/') || value.contains('\\') {
                return Err(Error::InvalidConfig {
                    message: format!("{} must not contain path separators: {}", field, value),
                });
            }
        }

        if self.progress_interval.is_zero() {
            return Err(Error::InvalidConfig {
                message: "progress_interval must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub filter: String,

    /// Emit ANSI colors
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "checkpoint=info,collective=info,storage=info,runtime_core=info".to_string(),
            ansi: true,
        }
    }
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
