//! Cryptography Module - content encryption and key wrapping
//!
//! Provides AES-256-GCM content encryption, BLAKE3 checksums, and the
//! password/system-key wrapping used by PasswordProtect rows.

pub mod encryption;
mod hashing;
pub mod keywrap;

pub use encryption::{derive_subkey, generate_iv, ContentIv, EncryptionKey, FileEncryptor};
pub use hashing::{shard_digest, Checksum, ChecksumWriter};
pub use keywrap::{unwrap_with_key, unwrap_with_password, wrap_with_key, wrap_with_password};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Fresh secret for system keys and node identity seeds
pub fn random_32_bytes() -> [u8; 32] {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        assert_eq!(random_bytes(16).len(), 16);
        assert_ne!(random_32_bytes(), random_32_bytes());
    }

    #[test]
    fn test_key_wrapping_is_reachable_from_crypto() {
        let kek = EncryptionKey::generate();
        let key = EncryptionKey::generate();
        let wrapped = wrap_with_key(&kek, &key).unwrap();
        assert_eq!(unwrap_with_key(&kek, &wrapped).unwrap(), key);

        let (sealed, salt) = wrap_with_password("pw", &key).unwrap();
        assert_eq!(unwrap_with_password("pw", &salt, &sealed).unwrap(), key);
    }
}
