//! BLAKE3 checksums
//!
//! File checksums cover the plaintext. Shard digests cover one framed
//! shard payload and are derived under their own context string, so a
//! shard digest can never be mistaken for a file checksum.

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::fmt;

const SHARD_DIGEST_CONTEXT: &str = "shardvault 2024 shard payload digest";

/// Plaintext checksum of a content blob, stored on its versions
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether `plaintext` is what was checksummed
    pub fn verify(&self, plaintext: &[u8]) -> bool {
        // blake3::Hash compares in constant time
        blake3::Hash::from(self.0) == blake3::hash(plaintext)
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

/// Builds a [`Checksum`] while the content streams through the encryptor
#[derive(Default)]
pub struct ChecksumWriter {
    hasher: Hasher,
}

impl ChecksumWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    pub fn finish(self) -> Checksum {
        Checksum(*self.hasher.finalize().as_bytes())
    }
}

/// Integrity digest of a shard payload, kept in its header
pub fn shard_digest(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new_derive_key(SHARD_DIGEST_CONTEXT);
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_streams() {
        let data = b"fragment payload spread over several chunks";
        let whole = Checksum::of(data);

        let mut writer = ChecksumWriter::new();
        for chunk in data.chunks(7) {
            writer.update(chunk);
        }
        assert_eq!(writer.finish(), whole);
        assert!(whole.verify(data));
        assert!(!whole.verify(b"something else"));
    }

    #[test]
    fn test_shard_digest_is_separate() {
        let payload = b"shard bytes";
        assert_ne!(&shard_digest(payload), Checksum::of(payload).as_bytes());
        assert_eq!(shard_digest(payload), shard_digest(payload));
        assert_eq!(Checksum::of(payload).to_string().len(), 16);
    }
}
