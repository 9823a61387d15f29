//! On-disk shard encoding.
//!
//! A shard is a fixed header followed by a JSON payload:
//!
//! | offset | size | field                      |
//! |--------|------|----------------------------|
//! | 0      | 8    | magic `NSTATS01`           |
//! | 8      | 4    | format version (LE)        |
//! | 12     | 8    | payload length (LE)        |
//! | 20     | 32   | SHA-256 of the payload     |
//! | 52     | n    | serde_json of a Collection |

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::stats::collection::Collection;

const MAGIC: &[u8; 8] = b"NSTATS01";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 8 + 4 + 8 + 32;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("shard too short: {size} bytes")]
    Truncated { size: usize },

    #[error("bad magic")]
    BadMagic,

    #[error("unsupported format version {version}")]
    UnsupportedVersion { version: u32 },

    #[error("payload length {declared} does not match {actual} bytes on disk")]
    LengthMismatch { declared: u64, actual: usize },

    #[error("payload checksum mismatch")]
    ChecksumMismatch,

    #[error("decoding payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("encoding payload: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Serializes `collection` into a self-validating shard.
pub fn encode(collection: &Collection) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_vec(collection).map_err(CodecError::Encode)?;
    let digest = Sha256::digest(&payload);

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&digest);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Validates and deserializes a shard produced by [`encode`].
pub fn decode(data: &[u8]) -> Result<Collection, CodecError> {
    if data.len() < HEADER_SIZE {
        return Err(CodecError::Truncated { size: data.len() });
    }
    if &data[0..8] != MAGIC {
        return Err(CodecError::BadMagic);
    }

    let version = read_u32_le(data, 8);
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion { version });
    }

    let declared = read_u64_le(data, 12);
    let payload = &data[HEADER_SIZE..];
    if declared != payload.len() as u64 {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }

    if Sha256::digest(payload).as_slice() != &data[20..HEADER_SIZE] {
        return Err(CodecError::ChecksumMismatch);
    }

    serde_json::from_slice(payload).map_err(CodecError::Decode)
}

fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(buf)
}
