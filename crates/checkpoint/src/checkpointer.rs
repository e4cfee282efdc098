//! Per-rank checkpoint entry point
//!
//! A `Checkpointer` binds the rank role, configuration, storage and collective
//! once. The save and load operations live in `full_state`, `optimizer` and
//! `distributed`; this module holds what they share.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use collective::{CollectiveHandle, CollectiveOp};
use runtime_core::{
    ArtifactPurpose, CheckpointConfig, CheckpointMode, Epoch, Error, RankRole, Result,
};
use serde::{Deserialize, Serialize};
use storage::{LocalStorage, StorageHandle};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{CheckpointEvent, EventSink};
use crate::format::ArtifactHeader;
use crate::layout::ArtifactLayout;
use crate::store::ArtifactStore;

/// Coordinator's verdict on a load, mirrored to every rank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum LoadDecision {
    /// Artifact exists and was read by the coordinator
    Present { target: String, epoch: Option<Epoch> },
    /// Nothing to load; every rank skips
    Missing { target: String },
    /// Coordinator could not read it; every rank fails
    Failed { reason: String },
}

/// Save and load operations for one rank
pub struct Checkpointer {
    pub(crate) role: RankRole,
    pub(crate) config: Arc<CheckpointConfig>,
    pub(crate) layout: ArtifactLayout,
    pub(crate) store: ArtifactStore,
    pub(crate) collective: CollectiveHandle,
    pub(crate) events: EventSink,
}

impl Checkpointer {
    /// Bind a rank to its configuration, storage and cohort
    pub fn new(
        role: RankRole,
        config: Arc<CheckpointConfig>,
        storage: StorageHandle,
        collective: CollectiveHandle,
    ) -> Result<Self> {
        config.validate()?;

        if collective.rank() != role.rank() || collective.world_size() != role.world_size() {
            return Err(Error::InvalidConfig {
                message: format!(
                    "collective is rank {}/{} but role is {}",
                    collective.rank(),
                    collective.world_size(),
                    role
                ),
            });
        }

        let store = ArtifactStore::new(storage).with_write_retries(config.write_retries);
        Ok(Self {
            role,
            layout: ArtifactLayout::new(Arc::clone(&config)),
            config,
            store,
            collective,
            events: EventSink::default(),
        })
    }

    /// Checkpointer writing under the configured base path on local disk
    pub fn local(role: RankRole, config: Arc<CheckpointConfig>, collective: CollectiveHandle) -> Result<Self> {
        let storage = Arc::new(LocalStorage::new(&config.base_path));
        Self::new(role, config, storage, collective)
    }

    /// Report progress and completion on `tx`
    pub fn with_events(mut self, tx: mpsc::Sender<CheckpointEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    pub fn role(&self) -> RankRole {
        self.role
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Fail before any I/O or collective if the run is in another mode
    pub(crate) fn require_mode(&self, operation: &str, expected: CheckpointMode) -> Result<()> {
        if self.config.mode != expected {
            return Err(Error::ConfigurationMismatch {
                operation: operation.to_string(),
                expected,
                actual: self.config.mode,
            });
        }
        Ok(())
    }

    /// Per-rank progress line, loud only when verbose
    pub(crate) fn trace_rank(&self, message: &str) {
        if self.config.verbose {
            info!(rank = self.role.rank(), "{}", message);
        } else {
            debug!(rank = self.role.rank(), "{}", message);
        }
    }

    pub(crate) fn header(&self, purpose: ArtifactPurpose, mode: CheckpointMode, epoch: Epoch) -> ArtifactHeader {
        ArtifactHeader::new(purpose, mode, epoch, self.role.world_size())
            .with_metadata("model_name", self.config.model_name.as_str())
            .with_metadata("created_at", Utc::now().to_rfc3339())
    }

    /// Check a decoded header against what the caller asked for
    pub(crate) fn check_header(
        &self,
        operation: &str,
        path: &str,
        header: &ArtifactHeader,
        purpose: ArtifactPurpose,
        mode: CheckpointMode,
    ) -> Result<()> {
        if header.mode != mode {
            return Err(Error::ConfigurationMismatch {
                operation: operation.to_string(),
                expected: mode,
                actual: header.mode,
            });
        }
        if header.purpose != purpose {
            return Err(Error::CheckpointCorrupted {
                path: path.to_string(),
                reason: format!("holds {} state, expected {}", header.purpose, purpose),
            });
        }
        Ok(())
    }

    /// Key to load for `purpose`, resolved on the coordinator
    ///
    /// An explicit file name wins, then `load_epoch`, then the newest epoch
    /// found on storage. Returns `None` when nothing was ever saved.
    pub(crate) async fn resolve_file_target(&self, purpose: ArtifactPurpose) -> Result<Option<(String, Option<Epoch>)>> {
        let (explicit, prefix) = match purpose {
            ArtifactPurpose::Model => (self.layout.model_load_override(), self.layout.model_prefix()),
            ArtifactPurpose::Optimizer => (self.layout.optimizer_load_override(), self.layout.optimizer_prefix()),
        };
        if let Some(key) = explicit {
            return Ok(Some((key, None)));
        }

        let epoch = match self.config.load_epoch {
            Some(epoch) => Some(epoch),
            None => {
                self.store
                    .latest_epoch(&prefix, |key| ArtifactLayout::file_epoch(&prefix, key))
                    .await?
            }
        };

        Ok(epoch.map(|epoch| {
            let key = match purpose {
                ArtifactPurpose::Model => self.layout.model_file(epoch),
                ArtifactPurpose::Optimizer => self.layout.optimizer_file(epoch),
            };
            (key, Some(epoch))
        }))
    }

    /// Mirror the coordinator's decision to every rank
    ///
    /// Non-coordinating ranks pass `None`.
    pub(crate) async fn broadcast_decision(&self, decision: Option<LoadDecision>) -> Result<LoadDecision> {
        let payload = match decision {
            Some(decision) if self.role.is_coordinator() => Some(Bytes::from(bincode::serialize(&decision)?)),
            _ => None,
        };
        let bytes = self
            .collective
            .broadcast(CollectiveOp::LoadDecision, payload, self.role.coordinator())
            .await?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Agree across ranks that every read succeeded before anyone applies
    ///
    /// Returns the local value only if all ranks report success. A local
    /// failure is returned as is; a peer failure becomes
    /// `PartialParticipation`.
    pub(crate) async fn commit<T: Send>(&self, operation: &str, local: Result<T>) -> Result<T> {
        let vote: &'static [u8] = if local.is_ok() { &[1] } else { &[0] };
        let votes = self
            .collective
            .all_gather(CollectiveOp::ReadCommit, Bytes::from_static(vote))
            .await?;

        let value = local?;
        let failed: Vec<usize> = votes
            .iter()
            .enumerate()
            .filter(|(_, v)| v.first() != Some(&1))
            .map(|(rank, _)| rank)
            .collect();

        if !failed.is_empty() {
            warn!(rank = self.role.rank(), ?failed, operation, "Peers failed to read; nothing applied");
            return Err(Error::PartialParticipation {
                message: format!("{}: ranks {:?} failed before apply", operation, failed),
            });
        }
        Ok(value)
    }
}
