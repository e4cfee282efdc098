//! In-memory state snapshots
//!
//! A snapshot maps parameter or optimizer-slot names to values. It is either
//! complete (every entry, as materialized on the coordinator) or partial (the
//! entries owned by one rank).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Error, Rank, Result};

/// Dense f32 tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    /// Create a tensor, checking the element count against the shape
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(Error::SnapshotMismatch {
                message: format!(
                    "tensor shape {:?} needs {} elements, got {}",
                    shape,
                    numel,
                    data.len()
                ),
            });
        }
        Ok(Self { shape, data })
    }

    /// Tensor filled with a constant
    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            data: vec![value; numel],
        }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

/// A single entry of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    Tensor(Tensor),
    Scalar(f64),
    Count(u64),
}

impl StateValue {
    /// Approximate in-memory payload size
    pub fn size_bytes(&self) -> usize {
        match self {
            StateValue::Tensor(t) => t.numel() * std::mem::size_of::<f32>(),
            StateValue::Scalar(_) | StateValue::Count(_) => 8,
        }
    }
}

impl From<Tensor> for StateValue {
    fn from(t: Tensor) -> Self {
        StateValue::Tensor(t)
    }
}

/// Whether a snapshot holds everything or one rank's portion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotScope {
    Complete,
    Partial { rank: Rank },
}

/// Name-to-value state mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    scope: SnapshotScope,
    entries: BTreeMap<String, StateValue>,
}

impl Snapshot {
    /// Empty complete snapshot
    pub fn complete() -> Self {
        Self {
            scope: SnapshotScope::Complete,
            entries: BTreeMap::new(),
        }
    }

    /// Empty partial snapshot owned by `rank`
    pub fn partial(rank: Rank) -> Self {
        Self {
            scope: SnapshotScope::Partial { rank },
            entries: BTreeMap::new(),
        }
    }

    pub fn from_entries(scope: SnapshotScope, entries: BTreeMap<String, StateValue>) -> Self {
        Self { scope, entries }
    }

    pub fn scope(&self) -> SnapshotScope {
        self.scope
    }

    pub fn is_complete(&self) -> bool {
        self.scope == SnapshotScope::Complete
    }

    /// Owning rank of a partial snapshot
    pub fn owner(&self) -> Option<Rank> {
        match self.scope {
            SnapshotScope::Partial { rank } => Some(rank),
            SnapshotScope::Complete => None,
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<StateValue>) -> Option<StateValue> {
        self.entries.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&StateValue> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, StateValue> {
        &self.entries
    }

    pub fn into_entries(self) -> BTreeMap<String, StateValue> {
        self.entries
    }

    /// Sum of entry payload sizes
    pub fn size_bytes(&self) -> usize {
        self.entries.values().map(StateValue::size_bytes).sum()
    }

    /// True if the snapshot holds exactly `keys`, given in sorted order
    pub fn same_keys<'a, I>(&self, keys: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut keys = keys.into_iter();
        self.entries.keys().all(|k| keys.next() == Some(k)) && keys.next().is_none()
    }

    /// Encode with bincode
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from bincode
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Merge per-rank partial snapshots into one complete snapshot
    ///
    /// Fails if any input is complete or if a key appears in two shards.
    pub fn merge_partials<I>(parts: I) -> Result<Snapshot>
    where
        I: IntoIterator<Item = Snapshot>,
    {
        let mut merged = Snapshot::complete();
        for part in parts {
            let Some(rank) = part.owner() else {
                return Err(Error::SnapshotMismatch {
                    message: "cannot merge a complete snapshot as a shard".to_string(),
                });
            };
            for (name, value) in part.entries {
                if merged.entries.contains_key(&name) {
                    return Err(Error::SnapshotMismatch {
                        message: format!("key '{}' from rank {} already owned by another shard", name, rank),
                    });
                }
                merged.entries.insert(name, value);
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(rank: Rank, keys: &[&str]) -> Snapshot {
        let mut s = Snapshot::partial(rank);
        for (i, k) in keys.iter().enumerate() {
            s.insert(*k, Tensor::filled(vec![2], i as f32));
        }
        s
    }

    #[test]
    fn test_tensor_shape_check() {
        assert!(Tensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(matches!(
            Tensor::new(vec![2, 3], vec![0.0; 5]),
            Err(Error::SnapshotMismatch { .. })
        ));
    }

    #[test]
    fn test_merge_partials() {
        let merged = Snapshot::merge_partials(vec![shard(0, &["a", "c"]), shard(1, &["b"])]).unwrap();
        assert!(merged.is_complete());
        assert_eq!(merged.keys().cloned().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_same_keys() {
        let s = shard(0, &["a", "b"]);
        let keys = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        assert!(s.same_keys(&keys(&["a", "b"])));
        assert!(!s.same_keys(&keys(&["a"])));
        assert!(!s.same_keys(&keys(&["a", "b", "c"])));
        assert!(!s.same_keys(&keys(&["a", "x"])));
    }

    #[test]
    fn test_merge_rejects_duplicates() {
        let result = Snapshot::merge_partials(vec![shard(0, &["a"]), shard(1, &["a"])]);
        assert!(matches!(result, Err(Error::SnapshotMismatch { .. })));
    }

    #[test]
    fn test_merge_rejects_complete_input() {
        let result = Snapshot::merge_partials(vec![Snapshot::complete()]);
        assert!(result.is_err());
    }

    #[test]
    fn test_bytes_preserve_scope_and_values() {
        let mut s = shard(3, &["w"]);
        s.insert("step", StateValue::Count(7));
        s.insert("lr", StateValue::Scalar(0.5));
        let decoded = Snapshot::from_bytes(&s.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, s);
        assert_eq!(decoded.owner(), Some(3));
        assert_eq!(decoded.size_bytes(), 8 + 8 + 8);
    }
}
