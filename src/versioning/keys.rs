//! Content key sealing and resolution through PasswordProtect

use crate::crypto::{
    unwrap_with_key, unwrap_with_password, wrap_with_key, wrap_with_password, EncryptionKey,
};
use crate::metadata::{ClusterSettings, MetadataStore, PasswordProtect};
use crate::{Result, ShardVaultError};

/// Seal `key` under `password`, or under the system key when there is none.
/// Returns `(wrapped, salt)`; the salt is set only for password sealing.
pub fn seal_content_key(
    settings: &ClusterSettings,
    key: &EncryptionKey,
    password: Option<&str>,
) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
    match password {
        Some(password) => {
            let (wrapped, salt) = wrap_with_password(password, key)?;
            Ok((wrapped, Some(salt)))
        }
        None => {
            let system = EncryptionKey::new(settings.system_key);
            Ok((wrap_with_key(&system, key)?, None))
        }
    }
}

/// Open the sealed key of one PasswordProtect row
pub fn open_content_key(
    settings: &ClusterSettings,
    protect: &PasswordProtect,
    password: Option<&str>,
) -> Result<EncryptionKey> {
    match (&protect.salt, password) {
        (Some(_), None) => Err(ShardVaultError::PasswordRequired(protect.file_id.clone())),
        (Some(salt), Some(password)) => unwrap_with_password(password, salt, &protect.wrapped_key)
            .map_err(|_| {
                ShardVaultError::PermissionDenied(format!(
                    "wrong password for file {}",
                    protect.file_id
                ))
            }),
        (None, _) => {
            let system = EncryptionKey::new(settings.system_key);
            Ok(unwrap_with_key(&system, &protect.wrapped_key)?)
        }
    }
}

/// Resolve the content key of `file_id`
pub fn resolve_content_key(
    store: &MetadataStore,
    file_id: &str,
    password: Option<&str>,
) -> Result<EncryptionKey> {
    let settings = store.settings()?;
    let protect = store.password_protect(file_id)?;
    open_content_key(&settings, &protect, password)
}

/// Resolve the key of a blob shared by several files.
///
/// Any referencing file sealed under the system key will do. Otherwise the
/// password is tried against each password-sealed row in turn.
pub fn resolve_data_key(
    store: &MetadataStore,
    file_ids: &[String],
    password: Option<&str>,
) -> Result<EncryptionKey> {
    let settings = store.settings()?;
    let mut protects = Vec::new();
    for file_id in file_ids {
        if let Some(protect) = store.get::<PasswordProtect>(&PasswordProtect::key_for(file_id))? {
            if !protect.is_password_wrapped() {
                return open_content_key(&settings, &protect, None);
            }
            protects.push(protect);
        }
    }

    let mut last_error = None;
    for protect in &protects {
        match open_content_key(&settings, protect, password) {
            Ok(key) => return Ok(key),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        ShardVaultError::NotFound(format!("key material for files {:?}", file_ids))
    }))
}
