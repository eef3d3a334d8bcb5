//! Content key wrapping
//!
//! A file's content key is never stored in clear. It is sealed either under
//! the cluster's system key or under a key derived from a user password, so
//! re-keying touches one small row instead of every fragment.

use super::{random_bytes, CryptoError, EncryptionKey};
use argon2::Argon2;

const SALT_SIZE: usize = 16;

/// Argon2id key-encryption key for a password
fn password_kek(password: &str, salt: &[u8]) -> Result<EncryptionKey, CryptoError> {
    let mut kek = [0u8; 32];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut kek)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(EncryptionKey::new(kek))
}

/// Seal `key` under a key-encryption key
pub fn wrap_with_key(kek: &EncryptionKey, key: &EncryptionKey) -> Result<Vec<u8>, CryptoError> {
    kek.encrypt(key.as_bytes())
}

/// Open a key sealed with [`wrap_with_key`]
pub fn unwrap_with_key(kek: &EncryptionKey, wrapped: &[u8]) -> Result<EncryptionKey, CryptoError> {
    let raw = kek.decrypt(wrapped)?;
    EncryptionKey::from_slice(&raw)
}

/// Seal `key` under a password; returns (wrapped, salt)
pub fn wrap_with_password(
    password: &str,
    key: &EncryptionKey,
) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let salt = random_bytes(SALT_SIZE);
    let kek = password_kek(password, &salt)?;
    Ok((wrap_with_key(&kek, key)?, salt))
}

/// Open a key sealed with [`wrap_with_password`]
///
/// A wrong password surfaces as `DecryptionFailed`.
pub fn unwrap_with_password(
    password: &str,
    salt: &[u8],
    wrapped: &[u8],
) -> Result<EncryptionKey, CryptoError> {
    let kek = password_kek(password, salt)?;
    unwrap_with_key(&kek, wrapped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_key_wrap() {
        let kek = EncryptionKey::generate();
        let key = EncryptionKey::generate();

        let wrapped = wrap_with_key(&kek, &key).unwrap();
        assert_eq!(unwrap_with_key(&kek, &wrapped).unwrap(), key);
        assert!(unwrap_with_key(&EncryptionKey::generate(), &wrapped).is_err());
    }

    #[test]
    fn test_password_wrap() {
        let key = EncryptionKey::generate();

        let (wrapped, salt) = wrap_with_password("correct horse", &key).unwrap();
        assert_eq!(unwrap_with_password("correct horse", &salt, &wrapped).unwrap(), key);

        let wrong = unwrap_with_password("battery staple", &salt, &wrapped);
        assert!(matches!(wrong, Err(CryptoError::DecryptionFailed(_))));

        // same password, fresh salt
        let (again, other_salt) = wrap_with_password("correct horse", &key).unwrap();
        assert_ne!(salt, other_salt);
        assert_ne!(wrapped, again);
    }
}
