//! Content encryption using AES-256-GCM
//!
//! Two modes are offered: random-nonce sealing for small secrets (wrapped
//! keys), and chunked encryption with nonces derived from a per-content IV so
//! that re-encoding the same plaintext reproduces the same ciphertext.

use super::CryptoError;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use rand::RngCore;
use std::fmt;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const TAG_SIZE: usize = 16;

/// Default plaintext chunk size for content encryption
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Per-content initialization vector
pub type ContentIv = [u8; NONCE_SIZE];

/// Generate a fresh content IV
pub fn generate_iv() -> ContentIv {
    let mut iv = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// AES-256-GCM encryption key
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    key: [u8; KEY_SIZE],
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

impl EncryptionKey {
    /// Create a new encryption key from bytes
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Build a key from a slice, checking its length
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected {} bytes, got {}", KEY_SIZE, bytes.len())))?;
        Ok(Self { key })
    }

    /// Generate a random encryption key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }

    /// Encrypt data with a random nonce
    /// Returns: nonce (12 bytes) || ciphertext || tag (16 bytes)
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self.encrypt_with_nonce(&nonce_bytes, plaintext)?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(result)
    }

    /// Decrypt data produced by [`EncryptionKey::encrypt`]
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed("Ciphertext too short".into()));
        }

        let (nonce, body) = ciphertext.split_at(NONCE_SIZE);
        let nonce: [u8; NONCE_SIZE] = nonce
            .try_into()
            .map_err(|_| CryptoError::DecryptionFailed("Bad nonce".into()))?;
        self.decrypt_with_nonce(&nonce, body)
    }

    /// Encrypt with a caller-supplied nonce (ciphertext || tag)
    pub fn encrypt_with_nonce(
        &self,
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher()
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    /// Decrypt with a caller-supplied nonce
    pub fn decrypt_with_nonce(
        &self,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }

    /// Get the raw key bytes (be careful with this!)
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

/// Chunked content encryptor
///
/// Every chunk is sealed independently under `iv XOR chunk_index`, so the
/// output is a deterministic function of (key, iv, plaintext).
pub struct FileEncryptor {
    key: EncryptionKey,
    iv: ContentIv,
    chunk_size: usize,
}

impl FileEncryptor {
    pub fn new(key: EncryptionKey, iv: ContentIv) -> Self {
        Self {
            key,
            iv,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set custom chunk size
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    fn chunk_nonce(&self, index: usize) -> Result<[u8; NONCE_SIZE], CryptoError> {
        let counter = u32::try_from(index)
            .map_err(|_| CryptoError::InvalidData("Too many chunks".into()))?;
        let mut nonce = self.iv;
        for (slot, byte) in nonce[NONCE_SIZE - 4..].iter_mut().zip(counter.to_be_bytes()) {
            *slot ^= byte;
        }
        Ok(nonce)
    }

    /// Size of the ciphertext produced for a plaintext of `len` bytes
    pub fn ciphertext_len(&self, len: usize) -> usize {
        let chunks = if len == 0 {
            1
        } else {
            (len + self.chunk_size - 1) / self.chunk_size
        };
        len + chunks * TAG_SIZE
    }

    /// Encrypt content, invoking `observe` with each plaintext chunk
    pub fn encrypt_observed<F>(&self, data: &[u8], mut observe: F) -> Result<Vec<u8>, CryptoError>
    where
        F: FnMut(&[u8]),
    {
        let mut out = Vec::with_capacity(self.ciphertext_len(data.len()));

        // Empty content still produces one authenticated chunk
        if data.is_empty() {
            out.extend(self.key.encrypt_with_nonce(&self.chunk_nonce(0)?, &[])?);
            return Ok(out);
        }

        for (index, chunk) in data.chunks(self.chunk_size).enumerate() {
            observe(chunk);
            out.extend(self.key.encrypt_with_nonce(&self.chunk_nonce(index)?, chunk)?);
        }

        Ok(out)
    }

    /// Encrypt content
    pub fn encrypt_file(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.encrypt_observed(data, |_| {})
    }

    /// Decrypt content produced by [`FileEncryptor::encrypt_file`]
    pub fn decrypt_file(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let sealed_chunk = self.chunk_size + TAG_SIZE;
        let mut plaintext = Vec::with_capacity(ciphertext.len());

        for (index, chunk) in ciphertext.chunks(sealed_chunk).enumerate() {
            if chunk.len() < TAG_SIZE {
                return Err(CryptoError::DecryptionFailed("Truncated chunk".into()));
            }
            plaintext.extend(self.key.decrypt_with_nonce(&self.chunk_nonce(index)?, chunk)?);
        }

        Ok(plaintext)
    }
}

/// Derive a purpose-bound subkey from a master key
pub fn derive_subkey(master_key: &EncryptionKey, context: &[u8]) -> Result<EncryptionKey, CryptoError> {
    use hkdf::Hkdf;
    use sha2::Sha256;

    let hk = Hkdf::<Sha256>::new(Some(context), master_key.as_bytes());
    let mut sub_key = [0u8; KEY_SIZE];
    hk.expand(b"shardvault-subkey", &mut sub_key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    Ok(EncryptionKey::new(sub_key))
}
