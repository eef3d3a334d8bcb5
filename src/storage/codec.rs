//! Shard codec - encryption + Reed-Solomon + shard header framing
//!
//! The metadata layer only ever sees opaque shard byte vectors produced here.
//! Each shard carries a fixed-size header so a single file on disk can be
//! validated structurally without the rest of its blob.

use super::erasure::{ErasureCoder, ErasureConfig};
use super::StorageError;
use crate::crypto::{shard_digest, Checksum, ChecksumWriter, ContentIv, EncryptionKey, FileEncryptor};

use serde::{Deserialize, Serialize};

const SHARD_MAGIC: [u8; 4] = *b"SVSH";
const SHARD_FORMAT: u8 = 1;

/// Serialized header length: magic(4) + 4 x u8 + 2 x u64 + hash(32)
pub const HEADER_LEN: usize = 56;

/// Header prepended to every shard file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardHeader {
    pub magic: [u8; 4],
    pub format: u8,
    pub index: u8,
    pub data_shards: u8,
    pub parity_shards: u8,
    pub payload_len: u64,
    pub ciphertext_len: u64,
    pub payload_hash: [u8; 32],
}

impl ShardHeader {
    pub fn layout_matches(&self, layout: &ErasureConfig) -> bool {
        self.data_shards as usize == layout.data_shards
            && self.parity_shards as usize == layout.parity_shards
    }
}

/// Key material needed to encode or decode one blob
#[derive(Debug, Clone)]
pub struct ContentKey {
    pub key: EncryptionKey,
    pub iv: ContentIv,
}

impl ContentKey {
    pub fn new(key: EncryptionKey, iv: ContentIv) -> Self {
        Self { key, iv }
    }
}

/// Result of encoding one plaintext
#[derive(Debug, Clone)]
pub struct EncodedBlob {
    /// Framed shards, index i at position i
    pub shards: Vec<Vec<u8>>,

    /// BLAKE3 of the plaintext
    pub checksum: Checksum,

    pub plaintext_size: u64,
    pub ciphertext_size: u64,
}

impl EncodedBlob {
    /// Bytes this blob occupies across all nodes
    pub fn stored_size(&self) -> u64 {
        self.shards.iter().map(|s| s.len() as u64).sum()
    }
}

/// Erasure codec seam used by the versioning and repair paths
pub trait ShardCodec: Send + Sync {
    fn encode(
        &self,
        plaintext: &[u8],
        layout: ErasureConfig,
        key: &ContentKey,
    ) -> Result<EncodedBlob, StorageError>;

    /// Decode from any `data_shards` valid shards; missing shards are None
    fn decode(
        &self,
        shards: Vec<Option<Vec<u8>>>,
        layout: ErasureConfig,
        key: &ContentKey,
    ) -> Result<Vec<u8>, StorageError>;

    /// Structural validation of a single framed shard
    fn inspect(&self, shard: &[u8]) -> Result<ShardHeader, StorageError>;
}

/// Frame `payload` as shard `index` of a blob
pub fn finalize_shard_header(
    index: usize,
    layout: &ErasureConfig,
    payload: &[u8],
    ciphertext_len: u64,
) -> Result<Vec<u8>, StorageError> {
    let narrow = |v: usize, what: &str| {
        u8::try_from(v).map_err(|_| StorageError::InvalidShard(format!("{} {} too large", what, v)))
    };

    let header = ShardHeader {
        magic: SHARD_MAGIC,
        format: SHARD_FORMAT,
        index: narrow(index, "index")?,
        data_shards: narrow(layout.data_shards, "data shards")?,
        parity_shards: narrow(layout.parity_shards, "parity shards")?,
        payload_len: payload.len() as u64,
        ciphertext_len,
        payload_hash: shard_digest(payload),
    };

    let mut framed =
        bincode::serialize(&header).map_err(|e| StorageError::Serialization(e.to_string()))?;
    framed.extend_from_slice(payload);
    Ok(framed)
}

/// Split a framed shard into its validated header and payload
pub fn parse_shard(shard: &[u8]) -> Result<(ShardHeader, &[u8]), StorageError> {
    if shard.len() < HEADER_LEN {
        return Err(StorageError::InvalidShard(format!(
            "shard of {} bytes is shorter than its header",
            shard.len()
        )));
    }

    let (head, payload) = shard.split_at(HEADER_LEN);
    let header: ShardHeader =
        bincode::deserialize(head).map_err(|e| StorageError::InvalidShard(e.to_string()))?;

    if header.magic != SHARD_MAGIC || header.format != SHARD_FORMAT {
        return Err(StorageError::InvalidShard("bad magic or format".into()));
    }
    if header.payload_len != payload.len() as u64 {
        return Err(StorageError::InvalidShard(format!(
            "payload is {} bytes, header says {}",
            payload.len(),
            header.payload_len
        )));
    }
    if shard_digest(payload) != header.payload_hash {
        return Err(StorageError::IntegrityCheckFailed);
    }

    Ok((header, payload))
}

/// AES-GCM + Reed-Solomon codec
#[derive(Debug, Clone, Copy, Default)]
pub struct ReedSolomonCodec;

impl ShardCodec for ReedSolomonCodec {
    fn encode(
        &self,
        plaintext: &[u8],
        layout: ErasureConfig,
        key: &ContentKey,
    ) -> Result<EncodedBlob, StorageError> {
        let mut hasher = ChecksumWriter::new();
        let ciphertext = FileEncryptor::new(key.key.clone(), key.iv)
            .encrypt_observed(plaintext, |chunk| hasher.update(chunk))
            .map_err(|e| StorageError::Encryption(e.to_string()))?;

        let payloads = ErasureCoder::new(layout)?.split(&ciphertext)?;

        let shards = payloads
            .iter()
            .enumerate()
            .map(|(index, payload)| {
                finalize_shard_header(index, &layout, payload, ciphertext.len() as u64)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(EncodedBlob {
            shards,
            checksum: hasher.finish(),
            plaintext_size: plaintext.len() as u64,
            ciphertext_size: ciphertext.len() as u64,
        })
    }

    fn decode(
        &self,
        shards: Vec<Option<Vec<u8>>>,
        layout: ErasureConfig,
        key: &ContentKey,
    ) -> Result<Vec<u8>, StorageError> {
        let mut ciphertext_len = None;
        let payloads: Vec<Option<Vec<u8>>> = shards
            .into_iter()
            .enumerate()
            .map(|(position, shard)| {
                let shard = shard?;
                match parse_shard(&shard) {
                    Ok((header, payload))
                        if header.index as usize == position && header.layout_matches(&layout) =>
                    {
                        ciphertext_len.get_or_insert(header.ciphertext_len);
                        Some(payload.to_vec())
                    }
                    Ok(_) => {
                        tracing::debug!("Shard at position {} has a foreign header", position);
                        None
                    }
                    Err(e) => {
                        tracing::debug!("Discarding shard at position {}: {}", position, e);
                        None
                    }
                }
            })
            .collect();

        let ciphertext_len = ciphertext_len.ok_or(StorageError::InsufficientFragments {
            have: 0,
            need: layout.data_shards,
        })?;
        let ciphertext_len = usize::try_from(ciphertext_len)
            .map_err(|_| StorageError::InvalidShard("ciphertext length overflow".into()))?;

        let ciphertext = ErasureCoder::new(layout)?.join(payloads, ciphertext_len)?;

        FileEncryptor::new(key.key.clone(), key.iv)
            .decrypt_file(&ciphertext)
            .map_err(|e| StorageError::Encryption(e.to_string()))
    }

    fn inspect(&self, shard: &[u8]) -> Result<ShardHeader, StorageError> {
        parse_shard(shard).map(|(header, _)| header)
    }
}
