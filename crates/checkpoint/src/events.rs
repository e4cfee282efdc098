//! Checkpoint progress events
//!
//! Long gathers and writes must be distinguishable from a hung process, so
//! every collective or disk phase runs under [`track_progress`], which reports
//! at a fixed interval until the phase finishes.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use runtime_core::{ArtifactId, ArtifactPurpose, Rank};
use tokio::sync::mpsc;
use tracing::info;

/// Phase of the checkpoint state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Gathering,
    Reading,
    Writing,
    Scattering,
    Applying,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Gathering => "gathering",
            Phase::Reading => "reading",
            Phase::Writing => "writing",
            Phase::Scattering => "scattering",
            Phase::Applying => "applying",
        };
        f.write_str(name)
    }
}

/// Event reported to the caller
#[derive(Debug, Clone)]
pub enum CheckpointEvent {
    /// A save or load began on this rank
    Started {
        purpose: ArtifactPurpose,
        rank: Rank,
        target: String,
    },
    /// A phase is still running
    Progress {
        purpose: ArtifactPurpose,
        rank: Rank,
        phase: Phase,
        elapsed: Duration,
    },
    /// An artifact was written or applied on this rank
    Completed {
        artifact: ArtifactId,
        rank: Rank,
        path: String,
        size_bytes: u64,
        elapsed: Duration,
    },
    /// A load found nothing to apply
    Skipped {
        purpose: ArtifactPurpose,
        rank: Rank,
        reason: String,
    },
}

/// Optional destination for checkpoint events
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<CheckpointEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<CheckpointEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Deliver an event; a dropped receiver is ignored
    pub async fn emit(&self, event: CheckpointEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}

/// Drive `fut` to completion, reporting every `interval` while it runs
pub async fn track_progress<F, T>(
    sink: &EventSink,
    purpose: ArtifactPurpose,
    rank: Rank,
    phase: Phase,
    interval: Duration,
    fut: F,
) -> T
where
    F: Future<Output = T>,
{
    tokio::pin!(fut);
    let start = Instant::now();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            output = &mut fut => return output,
            _ = ticker.tick() => {
                let elapsed = start.elapsed();
                info!(
                    %purpose,
                    rank,
                    %phase,
                    elapsed_secs = elapsed.as_secs(),
                    "Checkpoint still in progress"
                );
                sink.emit(CheckpointEvent::Progress { purpose, rank, phase, elapsed }).await;
            }
        }
    }
}
