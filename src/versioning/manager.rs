//! Content writes and reads
//!
//! A write allocates its metadata first, uploads every shard, and only then
//! flips the file to `Good` in one transaction. Shard uploads sit outside
//! the metadata transaction, so any failure before finalize is undone by an
//! explicit compensating cleanup.

use super::content::ContentIo;
use super::keys::{open_content_key, resolve_content_key, seal_content_key};
use super::session::{WriteKind, WriteSession, WriteState};
use crate::crypto::{generate_iv, EncryptionKey};
use crate::metadata::{
    abort, new_id, unix_now, validate_name, Capabilities, EntryType, File, FileStatus,
    FileVersion, Fragment, FragmentStatus, MetadataStore, PasswordProtect, Record,
    VersioningMode,
};
use crate::permissions::PermissionEngine;
use crate::storage::{ContentKey, ErasureConfig};
use crate::{Result, ShardVaultError};

use std::sync::Arc;

/// Options for a new file
#[derive(Debug, Clone, Default)]
pub struct NewFileOptions {
    pub versioning: VersioningMode,

    /// Erasure parameters; the cluster default when None
    pub layout: Option<ErasureConfig>,

    /// Seal the content key under this password
    pub password: Option<String>,
}

/// Versioned file operations on behalf of an authenticated user
#[derive(Clone)]
pub struct FileManager {
    pub(crate) store: Arc<MetadataStore>,
    pub(crate) permissions: PermissionEngine,
    pub(crate) content: ContentIo,
    pub(crate) server_name: String,
}

impl FileManager {
    pub fn new(store: Arc<MetadataStore>, content: ContentIo, server_name: impl Into<String>) -> Self {
        Self {
            permissions: PermissionEngine::new(store.clone()),
            store,
            content,
            server_name: server_name.into(),
        }
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn permissions(&self) -> &PermissionEngine {
        &self.permissions
    }

    pub fn content(&self) -> &ContentIo {
        &self.content
    }

    /// A `Good` file or folder, NotFound otherwise
    pub(crate) fn good_file(&self, file_id: &str) -> Result<File> {
        let file = self.store.file(file_id)?;
        if file.status != FileStatus::Good {
            return Err(ShardVaultError::not_found("file", file_id));
        }
        Ok(file)
    }

    pub(crate) fn good_folder(&self, folder_id: &str) -> Result<File> {
        let folder = self.good_file(folder_id)?;
        if !folder.is_folder() {
            return Err(ShardVaultError::InvalidInput(format!(
                "{} is not a folder",
                folder_id
            )));
        }
        Ok(folder)
    }

    /// Refuse a name already used by a live sibling other than `except`
    pub(crate) fn ensure_unique_name(&self, parent_id: &str, name: &str, except: Option<&str>) -> Result<()> {
        let taken = self
            .store
            .children(parent_id)?
            .iter()
            .any(|c| c.is_live() && c.name == name && Some(c.id.as_str()) != except);
        if taken {
            return Err(ShardVaultError::Conflict(format!(
                "{} already exists in folder {}",
                name, parent_id
            )));
        }
        Ok(())
    }

    /// Allocate a file and its key material; the returned session uploads
    /// its content.
    ///
    /// The File row starts as `Rebuilding` with no dataId. It is written
    /// together with its PasswordProtect row and the permissions inherited
    /// from the parent.
    pub fn create_initial_file(
        &self,
        actor: &str,
        parent_id: &str,
        name: &str,
        options: NewFileOptions,
    ) -> Result<(File, WriteSession)> {
        validate_name("file name", name)?;
        self.good_folder(parent_id)?;
        self.permissions.check(actor, parent_id, Capabilities::WRITE)?;
        self.ensure_unique_name(parent_id, name, None)?;

        let settings = self.store.settings()?;
        let (layout, corrections) = options.layout.unwrap_or(settings.layout).clamped();
        for correction in &corrections {
            tracing::warn!("Layout for {}: {}", name, correction);
        }

        let now = unix_now();
        let file_id = new_id();
        let key = EncryptionKey::generate();
        let iv = generate_iv();
        let (wrapped_key, salt) = seal_content_key(&settings, &key, options.password.as_deref())?;
        let inherited = self.permissions.inherited_permissions(parent_id, &file_id, now)?;

        let file = File {
            id: file_id.clone(),
            name: name.to_string(),
            entry_type: EntryType::File,
            parent_id: Some(parent_id.to_string()),
            version_no: 1,
            data_id: None,
            data_version: 0,
            size: 0,
            actual_size: 0,
            versioning: options.versioning,
            checksum: None,
            layout,
            iv,
            password_protected: salt.is_some(),
            status: FileStatus::Rebuilding,
            owner: actor.to_string(),
            handled_by: self.server_name.clone(),
            created_at: now,
            modified_at: now,
        };
        let protect = PasswordProtect {
            file_id: file_id.clone(),
            wrapped_key,
            salt,
            created_at: now,
            modified_at: now,
        };

        self.store.transaction(|txn| {
            let parent: File = txn.require(&File::key_for(parent_id), "parent folder")?;
            if parent.status != FileStatus::Good {
                return abort(ShardVaultError::not_found("folder", parent_id));
            }
            txn.save_file(&file)?;
            txn.put(&protect)?;
            for permission in &inherited {
                txn.save_permission(permission)?;
            }
            Ok(())
        })?;

        tracing::info!("Created file {} ({}) in {}", name, file_id, parent_id);
        let session = WriteSession::new(
            file_id,
            new_id(),
            1,
            layout,
            ContentKey::new(key, iv),
            WriteKind::Create,
        );
        Ok((file, session))
    }

    /// Encode `bytes`, write every shard and record a fragment row per shard.
    ///
    /// On failure the written shards are removed, the session is aborted
    /// and, for a first write, the allocated file is removed again.
    pub async fn upload_fragments(&self, session: &mut WriteSession, bytes: &[u8]) -> Result<()> {
        session.advance(WriteState::Fragmenting)?;

        match self.upload(session, bytes).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!("Upload of {} failed: {}", session.file_id, e);
                self.abort_session(session).await;
                Err(e)
            }
        }
    }

    async fn upload(&self, session: &mut WriteSession, bytes: &[u8]) -> Result<()> {
        let blob = self.content.encode(bytes, session.layout, &session.content_key)?;
        let fragments = self
            .content
            .store_blob(&session.data_id, session.version_no, &blob)
            .await?;
        session.fragments = fragments;

        let file_id = session.file_id.clone();
        let rows = session.fragments.clone();
        self.store.transaction(|txn| {
            let file: File = txn.require(&File::key_for(&file_id), "file")?;
            if !file.is_live() {
                return abort(ShardVaultError::Conflict(format!(
                    "file {} was deleted during upload",
                    file_id
                )));
            }
            for fragment in &rows {
                txn.put(fragment)?;
            }
            Ok(())
        })?;

        session.checksum = Some(blob.checksum);
        session.size = blob.plaintext_size;
        session.actual_size = blob.stored_size();
        tracing::debug!(
            "Uploaded {} shards of {} for {}",
            session.fragments.len(),
            session.data_id,
            session.file_id
        );
        Ok(())
    }

    /// Undo everything a failed write left behind
    pub(crate) async fn abort_session(&self, session: &mut WriteSession) {
        let removed = self.content.discard(&session.fragments).await;

        let fragment_keys: Vec<Vec<u8>> = session.fragments.iter().map(|f| f.key()).collect();
        let permission_rows = match session.kind {
            WriteKind::Create => self.store.permissions_of(&session.file_id).unwrap_or_default(),
            WriteKind::Update { .. } => Vec::new(),
        };
        let file_id = session.file_id.clone();
        let kind = session.kind;

        let cleanup = self.store.transaction(|txn| {
            for key in &fragment_keys {
                txn.delete(key)?;
            }
            if kind == WriteKind::Create {
                if let Some(file) = txn.get::<File>(&File::key_for(&file_id))? {
                    if file.status == FileStatus::Rebuilding || file.data_id.is_none() {
                        txn.remove_file(&file)?;
                        txn.delete(&PasswordProtect::key_for(&file_id))?;
                        for permission in &permission_rows {
                            txn.delete(&permission.key())?;
                        }
                    }
                }
            }
            Ok(())
        });
        if let Err(e) = cleanup {
            tracing::error!("Cleanup of aborted write {} failed: {}", session.data_id, e);
        }

        session.fragments.clear();
        if session.state != WriteState::Aborted {
            if let Err(e) = session.advance(WriteState::Aborted) {
                tracing::debug!("{}", e);
            }
        }
        tracing::info!(
            "Aborted write {} of {} ({} shards removed)",
            session.data_id,
            session.file_id,
            removed
        );
    }

    /// Publish a first write: the file turns `Good`, gets its content and
    /// its first version, and the parent folder moves to a new version.
    pub async fn finish_file(&self, mut session: WriteSession) -> Result<File> {
        if session.kind != WriteKind::Create {
            return Err(ShardVaultError::InvalidInput(
                "finish_file called on an update".into(),
            ));
        }
        if session.state != WriteState::Fragmenting || !session.is_complete() {
            return Err(ShardVaultError::InvalidInput(format!(
                "write of {} is {:?} with {} of {} shards",
                session.file_id,
                session.state,
                session.fragments.len(),
                session.layout.total_shards()
            )));
        }

        let now = unix_now();
        let result = self.store.transaction(|txn| {
            let mut file: File = txn.require(&File::key_for(&session.file_id), "file")?;
            if file.status != FileStatus::Rebuilding {
                return abort(ShardVaultError::Conflict(format!(
                    "file {} is {:?}, not awaiting content",
                    file.id, file.status
                )));
            }

            file.data_id = Some(session.data_id.clone());
            file.data_version = session.version_no;
            file.checksum = session.checksum;
            file.size = session.size;
            file.actual_size = session.actual_size;
            file.status = FileStatus::Good;
            file.handled_by = self.server_name.clone();
            file.modified_at = now;

            if let Some(parent_id) = &file.parent_id {
                txn.bump_folder_version(parent_id, now)?;
            }
            txn.save_file(&file)?;
            let parent_version = txn.parent_version(&file)?;
            txn.save_version(&FileVersion::from_file(&file, parent_version))?;
            Ok(file)
        });

        match result {
            Ok(file) => {
                session.advance(WriteState::Finalized)?;
                tracing::info!("Finished file {} ({} bytes)", file.id, file.size);
                Ok(file)
            }
            Err(e) => {
                self.abort_session(&mut session).await;
                Err(e)
            }
        }
    }

    /// Create a file and write its content in one go
    pub async fn write_file(
        &self,
        actor: &str,
        parent_id: &str,
        name: &str,
        bytes: &[u8],
        options: NewFileOptions,
    ) -> Result<File> {
        let (_, mut session) = self.create_initial_file(actor, parent_id, name, options)?;
        self.upload_fragments(&mut session, bytes).await?;
        self.finish_file(session).await
    }

    /// Open a new-version write on top of the file's current version
    pub fn begin_update(&self, actor: &str, file_id: &str, password: Option<&str>) -> Result<WriteSession> {
        let file = self.good_file(file_id)?;
        if file.is_folder() {
            return Err(ShardVaultError::InvalidInput(format!(
                "{} is a folder",
                file_id
            )));
        }
        self.permissions.check(actor, file_id, Capabilities::WRITE)?;
        let key = resolve_content_key(&self.store, file_id, password)?;

        // fresh IV per version; nonces derive from it
        Ok(WriteSession::new(
            file.id,
            new_id(),
            file.version_no + 1,
            file.layout,
            ContentKey::new(key, generate_iv()),
            WriteKind::Update {
                expected_version: file.version_no,
            },
        ))
    }

    /// Publish an update as the file's next version.
    ///
    /// Fails with `Conflict` when another update got there first; the
    /// loser's shards are removed. The superseded version is released unless
    /// the file keeps all versions.
    pub async fn finish_update_file(&self, mut session: WriteSession) -> Result<File> {
        let expected_version = match session.kind {
            WriteKind::Update { expected_version } => expected_version,
            WriteKind::Create => {
                return Err(ShardVaultError::InvalidInput(
                    "finish_update_file called on a first write".into(),
                ))
            }
        };
        if session.state != WriteState::Fragmenting || !session.is_complete() {
            return Err(ShardVaultError::InvalidInput(format!(
                "update of {} is {:?} with {} of {} shards",
                session.file_id,
                session.state,
                session.fragments.len(),
                session.layout.total_shards()
            )));
        }

        let now = unix_now();
        let result = self.store.transaction(|txn| {
            let mut file: File = txn.require(&File::key_for(&session.file_id), "file")?;
            if file.status != FileStatus::Good {
                return abort(ShardVaultError::Conflict(format!(
                    "file {} was deleted during the update",
                    file.id
                )));
            }
            if file.version_no != expected_version {
                return abort(ShardVaultError::Conflict(format!(
                    "file {} moved to version {} while writing version {}",
                    file.id,
                    file.version_no,
                    expected_version + 1
                )));
            }

            if let Some(mut previous) =
                txn.get::<FileVersion>(&FileVersion::key_for(&file.id, file.version_no))?
            {
                if file.versioning == VersioningMode::Off {
                    previous.status = FileStatus::ToBeDeleted;
                }
                previous.modified_at = now;
                txn.save_version(&previous)?;
            }

            file.version_no = session.version_no;
            file.data_id = Some(session.data_id.clone());
            file.data_version = session.version_no;
            file.checksum = session.checksum;
            file.size = session.size;
            file.actual_size = session.actual_size;
            file.iv = session.content_key.iv;
            file.handled_by = self.server_name.clone();
            file.modified_at = now;
            txn.save_file(&file)?;

            let parent_version = txn.parent_version(&file)?;
            txn.save_version(&FileVersion::from_file(&file, parent_version))?;
            Ok(file)
        });

        match result {
            Ok(file) => {
                session.advance(WriteState::Finalized)?;
                tracing::info!("File {} now at version {}", file.id, file.version_no);
                Ok(file)
            }
            Err(e) => {
                self.abort_session(&mut session).await;
                Err(e)
            }
        }
    }

    /// Replace a file's content with a new version
    pub async fn update_file(
        &self,
        actor: &str,
        file_id: &str,
        bytes: &[u8],
        password: Option<&str>,
    ) -> Result<File> {
        let mut session = self.begin_update(actor, file_id, password)?;
        self.upload_fragments(&mut session, bytes).await?;
        self.finish_update_file(session).await
    }

    /// Download the current or a historical version
    pub async fn read_file(
        &self,
        actor: &str,
        file_id: &str,
        version_no: Option<u64>,
        password: Option<&str>,
    ) -> Result<Vec<u8>> {
        let file = self.good_file(file_id)?;
        if file.is_folder() {
            return Err(ShardVaultError::InvalidInput(format!(
                "{} is a folder",
                file_id
            )));
        }
        self.permissions.check(actor, file_id, Capabilities::READ)?;

        let version = self.store.version(file_id, version_no.unwrap_or(file.version_no))?;
        if version.status == FileStatus::Deleted {
            return Err(ShardVaultError::not_found(
                "version",
                format!("{} of file {}", version.version_no, file_id),
            ));
        }
        let data_id = version
            .data_id
            .clone()
            .ok_or_else(|| ShardVaultError::not_found("content of file", file_id))?;

        let key = resolve_content_key(&self.store, file_id, password)?;
        let good: Vec<Fragment> = self
            .store
            .fragments_of(&data_id)?
            .into_iter()
            .filter(|f| f.version_no == version.data_version && f.status == FragmentStatus::Good)
            .collect();

        let needed = version.layout.min_shards();
        if good.len() < needed {
            return Err(ShardVaultError::ContentUnrecoverable {
                data_id,
                good: good.len(),
                needed,
            });
        }

        let fetched = self.content.fetch(&good, version.layout).await;
        for (fragment, error) in &fetched.failures {
            tracing::warn!(
                "Skipping shard {} of {} on {}: {}",
                fragment.frag_id,
                data_id,
                fragment.server,
                error
            );
        }

        self.content.decode_verified(
            &data_id,
            fetched.shards,
            version.layout,
            &ContentKey::new(key, version.iv),
            version.checksum.as_ref(),
        )
    }

    /// Seal the file's content key under `new_password`.
    ///
    /// Only the PasswordProtect row changes; shards stay as they are.
    pub fn set_password(
        &self,
        actor: &str,
        file_id: &str,
        current: Option<&str>,
        new_password: &str,
    ) -> Result<()> {
        if new_password.is_empty() {
            return Err(ShardVaultError::InvalidInput("empty password".into()));
        }
        self.rekey(actor, file_id, current, Some(new_password))
    }

    /// Return the content key to system sealing
    pub fn clear_password(&self, actor: &str, file_id: &str, current: &str) -> Result<()> {
        self.rekey(actor, file_id, Some(current), None)
    }

    fn rekey(&self, actor: &str, file_id: &str, current: Option<&str>, new_password: Option<&str>) -> Result<()> {
        let file = self.good_file(file_id)?;
        if file.is_folder() {
            return Err(ShardVaultError::InvalidInput(format!(
                "{} is a folder",
                file_id
            )));
        }
        self.permissions.check(actor, file_id, Capabilities::WRITE)?;

        let settings = self.store.settings()?;
        let protect = self.store.password_protect(file_id)?;
        let key = open_content_key(&settings, &protect, current)?;
        let (wrapped_key, salt) = seal_content_key(&settings, &key, new_password)?;
        let now = unix_now();

        self.store.transaction(|txn| {
            let mut protect: PasswordProtect =
                txn.require(&PasswordProtect::key_for(file_id), "key material")?;
            protect.wrapped_key = wrapped_key.clone();
            protect.salt = salt.clone();
            protect.modified_at = now;
            txn.put(&protect)?;

            let mut file: File = txn.require(&File::key_for(file_id), "file")?;
            file.password_protected = salt.is_some();
            txn.save_file(&file)?;
            Ok(())
        })?;

        tracing::info!(
            "Content key of {} now sealed under {}",
            file_id,
            if new_password.is_some() { "a password" } else { "the system key" }
        );
        Ok(())
    }
}
