//! Collective operations for checkpoint coordination
//!
//! Every cross-rank step of a checkpoint (gathering a full snapshot,
//! scattering optimizer state, agreeing on whether to load) goes through the
//! [`Collective`] trait. Calls are tagged with a [`CollectiveOp`] so that a
//! rank taking a different code path than its peers fails loudly instead of
//! deadlocking the cohort.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use collective::{local_cohort, Collective, CollectiveOp};
//!
//! # #[tokio::main] async fn main() -> runtime_core::Result<()> {
//! let mut ranks = local_cohort(2)?.into_iter();
//! let (r0, r1) = (ranks.next().unwrap(), ranks.next().unwrap());
//!
//! let peer = tokio::spawn(async move { r1.gather(CollectiveOp::Barrier, Bytes::from("b"), 0).await });
//! let gathered = r0.gather(CollectiveOp::Barrier, Bytes::from("a"), 0).await?;
//! assert_eq!(gathered.unwrap().len(), 2);
//! assert!(peer.await.unwrap()?.is_none());
//! # Ok(())
//! # }
//! ```

mod group;
mod local;
mod op;

pub use group::{Collective, CollectiveHandle};
pub use local::{local_cohort, LocalCollective};
pub use op::CollectiveOp;
