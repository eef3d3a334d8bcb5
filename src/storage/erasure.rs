//! Reed-Solomon layer under the shard codec
//!
//! A blob's ciphertext is cut into `data_shards` slices and extended with
//! `parity_shards` parity slices; any `data_shards` of them rebuild it.

use super::StorageError;
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};

pub const DEFAULT_DATA_SHARDS: usize = 3;
pub const DEFAULT_PARITY_SHARDS: usize = 2;
pub const DEFAULT_KEY_THRESHOLD: usize = 3;

const MIN_SHARD_PARAM: usize = 1;
const MAX_SHARD_PARAM: usize = 10;

/// Erasure coding parameters for one content blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureConfig {
    /// Number of data shards
    pub data_shards: usize,

    /// Number of parity shards
    pub parity_shards: usize,

    /// Below this many live shards the blob is unrecoverable
    pub key_threshold: usize,
}

impl ErasureConfig {
    pub fn new(data_shards: usize, parity_shards: usize, key_threshold: usize) -> Self {
        Self {
            data_shards,
            parity_shards,
            key_threshold,
        }
    }

    /// Total number of shards
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Minimum good shards needed before a decode is attempted
    pub fn min_shards(&self) -> usize {
        self.data_shards.max(self.key_threshold)
    }

    /// Replace out-of-range values with defaults.
    ///
    /// Each parameter must lie in [1, 10] and the key threshold may not
    /// exceed the total shard count. Every correction is reported as a
    /// human-readable message; corrections are never fatal.
    pub fn clamped(self) -> (Self, Vec<String>) {
        let mut errors = Vec::new();
        let in_range = |v: usize| (MIN_SHARD_PARAM..=MAX_SHARD_PARAM).contains(&v);

        let mut fixed = self;
        if !in_range(fixed.data_shards) {
            errors.push(format!(
                "dataShards {} outside [{}, {}], using {}",
                fixed.data_shards, MIN_SHARD_PARAM, MAX_SHARD_PARAM, DEFAULT_DATA_SHARDS
            ));
            fixed.data_shards = DEFAULT_DATA_SHARDS;
        }
        if !in_range(fixed.parity_shards) {
            errors.push(format!(
                "parityShards {} outside [{}, {}], using {}",
                fixed.parity_shards, MIN_SHARD_PARAM, MAX_SHARD_PARAM, DEFAULT_PARITY_SHARDS
            ));
            fixed.parity_shards = DEFAULT_PARITY_SHARDS;
        }
        if !in_range(fixed.key_threshold) || fixed.key_threshold > fixed.total_shards() {
            let replacement = DEFAULT_KEY_THRESHOLD.min(fixed.total_shards());
            errors.push(format!(
                "keyThreshold {} invalid for {} total shards, using {}",
                fixed.key_threshold,
                fixed.total_shards(),
                replacement
            ));
            fixed.key_threshold = replacement;
        }

        (fixed, errors)
    }
}

impl Default for ErasureConfig {
    fn default() -> Self {
        Self {
            data_shards: DEFAULT_DATA_SHARDS,
            parity_shards: DEFAULT_PARITY_SHARDS,
            key_threshold: DEFAULT_KEY_THRESHOLD,
        }
    }
}

/// Reed-Solomon over GF(2^8) for one layout
pub struct ErasureCoder {
    layout: ErasureConfig,
    rs: ReedSolomon,
}

impl ErasureCoder {
    pub fn new(layout: ErasureConfig) -> Result<Self, StorageError> {
        let rs = ReedSolomon::new(layout.data_shards, layout.parity_shards)
            .map_err(|e| StorageError::ErasureCoding(e.to_string()))?;
        Ok(Self { layout, rs })
    }

    pub fn layout(&self) -> ErasureConfig {
        self.layout
    }

    /// Split `data` into `data_shards` zero-padded slices plus parity, all
    /// of the same length.
    pub fn split(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, StorageError> {
        let width = data.len().div_ceil(self.layout.data_shards).max(1);

        let mut shards: Vec<Vec<u8>> = data
            .chunks(width)
            .map(<[u8]>::to_vec)
            .chain(std::iter::repeat_with(Vec::new))
            .take(self.layout.data_shards)
            .collect();
        shards.resize_with(self.layout.total_shards(), Vec::new);
        for shard in &mut shards {
            shard.resize(width, 0);
        }

        self.rs
            .encode(&mut shards)
            .map_err(|e| StorageError::ErasureCoding(e.to_string()))?;
        Ok(shards)
    }

    /// Rebuild the first `len` bytes from any `data_shards` of the slices.
    ///
    /// `shards` holds one entry per index, `None` where the slice is lost.
    pub fn join(&self, mut shards: Vec<Option<Vec<u8>>>, len: usize) -> Result<Vec<u8>, StorageError> {
        if shards.len() != self.layout.total_shards() {
            return Err(StorageError::ErasureCoding(format!(
                "layout has {} shards, got {}",
                self.layout.total_shards(),
                shards.len()
            )));
        }
        let have = shards.iter().flatten().count();
        if have < self.layout.data_shards {
            return Err(StorageError::InsufficientFragments {
                have,
                need: self.layout.data_shards,
            });
        }

        self.rs
            .reconstruct_data(&mut shards)
            .map_err(|e| StorageError::ErasureCoding(e.to_string()))?;

        let mut data: Vec<u8> = shards
            .into_iter()
            .take(self.layout.data_shards)
            .flatten()
            .flatten()
            .collect();
        if data.len() < len {
            return Err(StorageError::ErasureCoding(format!(
                "rebuilt {} bytes, expected {}",
                data.len(),
                len
            )));
        }
        data.truncate(len);
        Ok(data)
    }

    /// Whether the parity slices agree with the data slices
    pub fn verify(&self, shards: &[Vec<u8>]) -> Result<bool, StorageError> {
        self.rs
            .verify(shards)
            .map_err(|e| StorageError::ErasureCoding(e.to_string()))
    }
}
