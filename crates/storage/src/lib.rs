//! Storage - Pluggable storage backends for checkpoint artifacts
//!
//! Full-state checkpoints are single objects; distributed checkpoints are a
//! directory of per-rank objects. Both go through [`StorageBackend`] using
//! paths relative to the backend root.
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage, ObjectKind};
//! use bytes::Bytes;
//!
//! # async fn example() -> runtime_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/checkpoints");
//! storage.write("checkpoints/model-1.ckpt", Bytes::from(vec![1, 2, 3])).await?;
//! assert_eq!(storage.stat("checkpoints").await?, Some(ObjectKind::Directory));
//! let data = storage.read("checkpoints/model-1.ckpt").await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;

pub use backend::{ObjectKind, StorageBackend, StorageHandle};
pub use local::LocalStorage;
