//! On-disk artifact format
//!
//! An artifact file is a fixed little-endian header, a JSON metadata block,
//! and the bincode-encoded snapshot:
//!
//! ```text
//! magic "CKPT" | version u32 | purpose u8 | mode u8 | epoch u64 | rank u32
//! | world_size u32 | payload_size u64 | metadata_len u32 | metadata | payload
//! ```

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use runtime_core::{
    ArtifactId, ArtifactPurpose, CheckpointMode, Epoch, Error, Rank, Result, Snapshot,
};
use serde::{Deserialize, Serialize};

/// Magic bytes for checkpoint files
pub const ARTIFACT_MAGIC: [u8; 4] = *b"CKPT";

/// Checkpoint format version
pub const ARTIFACT_VERSION: u32 = 1;

/// Rank field value for artifacts not owned by a single rank
const NO_RANK: u32 = u32::MAX;

/// Bytes before the metadata block
const FIXED_HEADER_LEN: usize = 4 + 4 + 1 + 1 + 8 + 4 + 4 + 8 + 4;

/// Checkpoint file header
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactHeader {
    pub version: u32,
    pub purpose: ArtifactPurpose,
    pub mode: CheckpointMode,
    pub epoch: Epoch,
    /// Writing rank for distributed shards
    pub rank: Option<Rank>,
    pub world_size: u32,
    pub payload_size: u64,
    pub metadata: BTreeMap<String, String>,
}

impl ArtifactHeader {
    pub fn new(purpose: ArtifactPurpose, mode: CheckpointMode, epoch: Epoch, world_size: u32) -> Self {
        Self {
            version: ARTIFACT_VERSION,
            purpose,
            mode,
            epoch,
            rank: None,
            world_size,
            payload_size: 0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_rank(mut self, rank: Rank) -> Self {
        self.rank = Some(rank);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Identity recorded in the header
    pub fn artifact_id(&self) -> ArtifactId {
        let model_name = self.metadata.get("model_name").cloned().unwrap_or_default();
        ArtifactId::new(self.purpose, model_name, self.epoch)
    }
}

fn corrupted(path: &str, reason: impl Into<String>) -> Error {
    Error::CheckpointCorrupted {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Serialize a header and snapshot into one artifact buffer
pub fn encode_artifact(header: &ArtifactHeader, snapshot: &Snapshot) -> Result<Bytes> {
    let payload = snapshot.to_bytes()?;
    let metadata_json = serde_json::to_vec(&header.metadata)?;

    let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN + metadata_json.len() + payload.len());
    buf.put_slice(&ARTIFACT_MAGIC);
    buf.put_u32_le(header.version);
    buf.put_u8(header.purpose.code());
    buf.put_u8(header.mode.code());
    buf.put_u64_le(header.epoch);
    buf.put_u32_le(header.rank.unwrap_or(NO_RANK));
    buf.put_u32_le(header.world_size);
    buf.put_u64_le(payload.len() as u64);
    buf.put_u32_le(metadata_json.len() as u32);
    buf.put_slice(&metadata_json);
    buf.put_slice(&payload);

    Ok(buf.freeze())
}

/// Parse an artifact buffer read from `path`
pub fn decode_artifact(path: &str, mut data: Bytes) -> Result<(ArtifactHeader, Snapshot)> {
    if data.len() < FIXED_HEADER_LEN {
        return Err(corrupted(path, format!("truncated header ({} bytes)", data.len())));
    }

    let mut magic = [0u8; 4];
    data.copy_to_slice(&mut magic);
    if magic != ARTIFACT_MAGIC {
        return Err(corrupted(path, "invalid checkpoint magic"));
    }

    let version = data.get_u32_le();
    if version == 0 || version > ARTIFACT_VERSION {
        return Err(corrupted(path, format!("unsupported format version {}", version)));
    }

    let purpose_code = data.get_u8();
    let purpose = ArtifactPurpose::from_code(purpose_code)
        .ok_or_else(|| corrupted(path, format!("unknown purpose code {}", purpose_code)))?;
    let mode_code = data.get_u8();
    let mode = CheckpointMode::from_code(mode_code)
        .ok_or_else(|| corrupted(path, format!("unknown mode code {}", mode_code)))?;

    let epoch = data.get_u64_le();
    let rank = match data.get_u32_le() {
        NO_RANK => None,
        rank => Some(rank),
    };
    let world_size = data.get_u32_le();
    let payload_size = data.get_u64_le();
    let metadata_len = data.get_u32_le() as usize;

    if data.remaining() < metadata_len {
        return Err(corrupted(path, "truncated metadata"));
    }
    let metadata_bytes = data.split_to(metadata_len);
    let metadata: BTreeMap<String, String> = serde_json::from_slice(&metadata_bytes)
        .map_err(|e| corrupted(path, format!("invalid metadata: {}", e)))?;

    if data.remaining() as u64 != payload_size {
        return Err(corrupted(
            path,
            format!("payload is {} bytes, header declares {}", data.remaining(), payload_size),
        ));
    }
    let snapshot = Snapshot::from_bytes(&data).map_err(|e| corrupted(path, e.to_string()))?;

    let header = ArtifactHeader {
        version,
        purpose,
        mode,
        epoch,
        rank,
        world_size,
        payload_size,
        metadata,
    };
    Ok((header, snapshot))
}

/// Directory-level description of a distributed checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedManifest {
    pub model_name: String,
    pub epoch: Epoch,
    pub world_size: u32,
    pub mode: CheckpointMode,
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
}

impl DistributedManifest {
    pub fn new(model_name: impl Into<String>, epoch: Epoch, world_size: u32) -> Self {
        Self {
            model_name: model_name.into(),
            epoch,
            world_size,
            mode: CheckpointMode::Distributed,
            format_version: ARTIFACT_VERSION,
            created_at: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec_pretty(self)?))
    }

    pub fn from_bytes(path: &str, data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| corrupted(path, format!("invalid manifest: {}", e)))
    }
}
