//! In-process collective group
//!
//! Ranks are tasks in one process sharing a rendezvous hub. Each call takes
//! the next slot in the caller's sequence; the round for that slot completes
//! once every rank has contributed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use runtime_core::{Error, Rank, Result};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{Collective, CollectiveOp};

/// Contributions of every rank, indexed by rank
type Contributions = Arc<Vec<Vec<Bytes>>>;

/// Outcome delivered to ranks waiting on a round
type RoundOutcome = std::result::Result<Contributions, String>;

/// One rendezvous slot
struct Round {
    op: CollectiveOp,
    root: Rank,
    state: Mutex<RoundState>,
}

struct RoundState {
    contributions: Vec<Option<Vec<Bytes>>>,
    arrived: u32,
    /// Ranks that reached this slot, including ones that failed in it
    touched: u32,
    waiters: Vec<oneshot::Sender<RoundOutcome>>,
    failure: Option<String>,
}

/// Shared rendezvous state for one cohort
struct Hub {
    world_size: u32,
    rounds: DashMap<u64, Arc<Round>>,
}

/// Create every member of an in-process cohort of `world_size` ranks
pub fn local_cohort(world_size: u32) -> Result<Vec<LocalCollective>> {
    if world_size == 0 {
        return Err(Error::InvalidConfig {
            message: "cohort needs at least one rank".to_string(),
        });
    }

    let hub = Arc::new(Hub {
        world_size,
        rounds: DashMap::new(),
    });

    Ok((0..world_size)
        .map(|rank| LocalCollective {
            rank,
            hub: Arc::clone(&hub),
            sequence: AtomicU64::new(0),
        })
        .collect())
}

/// Member of an in-process cohort
pub struct LocalCollective {
    rank: Rank,
    hub: Arc<Hub>,
    sequence: AtomicU64,
}

impl fmt::Debug for LocalCollective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCollective")
            .field("rank", &self.rank)
            .field("world_size", &self.hub.world_size)
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish()
    }
}

impl LocalCollective {
    fn check_root(&self, root: Rank) -> Result<()> {
        if root >= self.hub.world_size {
            return Err(Error::InvalidRank {
                rank: root,
                world_size: self.hub.world_size,
            });
        }
        Ok(())
    }

    /// Contribute `payload` to the next round and wait for every rank
    async fn exchange(&self, op: CollectiveOp, root: Rank, payload: Vec<Bytes>) -> Result<Contributions> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let world_size = self.hub.world_size;

        let round = self
            .hub
            .rounds
            .entry(sequence)
            .or_insert_with(|| {
                Arc::new(Round {
                    op,
                    root,
                    state: Mutex::new(RoundState {
                        contributions: vec![None; world_size as usize],
                        arrived: 0,
                        touched: 0,
                        waiters: Vec::new(),
                        failure: None,
                    }),
                })
            })
            .clone();

        let rx = {
            let mut state = round.state.lock();
            state.touched += 1;

            let failed = if let Some(message) = state.failure.clone() {
                Err(Error::CollectiveFailed {
                    op: op.to_string(),
                    message,
                })
            } else if round.op != op || round.root != root {
                let message = format!(
                    "rank {} called {} (root {}) where the cohort is in {} (root {})",
                    self.rank, op, root, round.op, round.root
                );
                warn!(sequence, rank = self.rank, %message, "Collective call order diverged");
                state.failure = Some(message.clone());
                for waiter in state.waiters.drain(..) {
                    let _ = waiter.send(Err(message.clone()));
                }
                Err(Error::CollectiveMismatch {
                    sequence,
                    rank: self.rank,
                    expected: format!("{} (root {})", round.op, round.root),
                    actual: format!("{} (root {})", op, root),
                })
            } else {
                Ok(())
            };

            if let Err(e) = failed {
                // The last rank through a failed slot retires it
                if state.touched == world_size {
                    drop(state);
                    self.hub.rounds.remove(&sequence);
                }
                return Err(e);
            }

            state.contributions[self.rank as usize] = Some(payload);
            state.arrived += 1;

            if state.arrived == world_size {
                let all: Contributions = Arc::new(
                    state
                        .contributions
                        .iter_mut()
                        .map(|c| c.take().unwrap_or_default())
                        .collect(),
                );
                for waiter in state.waiters.drain(..) {
                    let _ = waiter.send(Ok(Arc::clone(&all)));
                }
                drop(state);
                self.hub.rounds.remove(&sequence);

                debug!(sequence, %op, rank = self.rank, "Collective round complete");
                return Ok(all);
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            rx
        };

        match rx.await {
            Ok(Ok(all)) => Ok(all),
            Ok(Err(message)) => Err(Error::CollectiveFailed {
                op: op.to_string(),
                message,
            }),
            Err(_) => Err(Error::ChannelClosed {
                channel: format!("collective round {} ({})", sequence, op),
            }),
        }
    }
}

#[async_trait]
impl Collective for LocalCollective {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.hub.world_size
    }

    async fn gather(&self, op: CollectiveOp, payload: Bytes, root: Rank) -> Result<Option<Vec<Bytes>>> {
        self.check_root(root)?;
        let all = self.exchange(op, root, vec![payload]).await?;

        if self.rank != root {
            return Ok(None);
        }
        Ok(Some(
            all.iter()
                .map(|p| p.first().cloned().unwrap_or_default())
                .collect(),
        ))
    }

    async fn scatter(&self, op: CollectiveOp, parts: Option<Vec<Bytes>>, root: Rank) -> Result<Bytes> {
        self.check_root(root)?;
        let contribution = if self.rank == root {
            parts.unwrap_or_default()
        } else {
            if parts.is_some() {
                warn!(rank = self.rank, %op, "Ignoring scatter input on non-root rank");
            }
            Vec::new()
        };

        let all = self.exchange(op, root, contribution).await?;
        let root_parts = &all[root as usize];
        if root_parts.len() != self.hub.world_size as usize {
            return Err(Error::CollectiveFailed {
                op: op.to_string(),
                message: format!(
                    "root {} provided {} parts for {} ranks",
                    root,
                    root_parts.len(),
                    self.hub.world_size
                ),
            });
        }
        Ok(root_parts[self.rank as usize].clone())
    }

    async fn broadcast(&self, op: CollectiveOp, payload: Option<Bytes>, root: Rank) -> Result<Bytes> {
        self.check_root(root)?;
        let contribution = match payload {
            Some(bytes) if self.rank == root => vec![bytes],
            _ => Vec::new(),
        };

        let all = self.exchange(op, root, contribution).await?;
        all[root as usize]
            .first()
            .cloned()
            .ok_or_else(|| Error::CollectiveFailed {
                op: op.to_string(),
                message: format!("root {} did not provide a payload", root),
            })
    }

    async fn all_gather(&self, op: CollectiveOp, payload: Bytes) -> Result<Vec<Bytes>> {
        let all = self.exchange(op, 0, vec![payload]).await?;
        Ok(all
            .iter()
            .map(|p| p.first().cloned().unwrap_or_default())
            .collect())
    }

    async fn barrier(&self, op: CollectiveOp) -> Result<()> {
        self.exchange(op, 0, Vec::new()).await.map(|_| ())
    }
}
