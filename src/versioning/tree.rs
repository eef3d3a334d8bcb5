//! Folder structure operations: create, move, copy, delete, rename, list
//!
//! Every change to a folder's membership starts a new version of that
//! folder. Deletion only marks rows; the collector removes the bytes.

use super::manager::FileManager;
use crate::metadata::{
    abort, new_id, unix_now, validate_name, Capabilities, DataCopies, EntryType, File,
    FileStatus, FileVersion, PasswordProtect, VersioningMode,
};
use crate::{Result, ShardVaultError};

impl FileManager {
    pub fn create_folder(&self, actor: &str, parent_id: &str, name: &str) -> Result<File> {
        validate_name("folder name", name)?;
        let parent = self.good_folder(parent_id)?;
        self.permissions.check(actor, parent_id, Capabilities::WRITE)?;
        self.ensure_unique_name(parent_id, name, None)?;

        let now = unix_now();
        let folder_id = new_id();
        let inherited = self.permissions.inherited_permissions(parent_id, &folder_id, now)?;
        let folder = File {
            id: folder_id.clone(),
            name: name.to_string(),
            entry_type: EntryType::Folder,
            parent_id: Some(parent_id.to_string()),
            version_no: 1,
            data_id: None,
            data_version: 0,
            size: 0,
            actual_size: 0,
            versioning: VersioningMode::Off,
            checksum: None,
            layout: parent.layout,
            iv: [0; 12],
            password_protected: false,
            status: FileStatus::Good,
            owner: actor.to_string(),
            handled_by: self.server_name.clone(),
            created_at: now,
            modified_at: now,
        };

        self.store.transaction(|txn| {
            txn.bump_folder_version(parent_id, now)?;
            txn.save_file(&folder)?;
            let parent_version = txn.parent_version(&folder)?;
            txn.save_version(&FileVersion::from_file(&folder, parent_version))?;
            for permission in &inherited {
                txn.save_permission(permission)?;
            }
            Ok(())
        })?;

        tracing::info!("Created folder {} ({}) in {}", name, folder_id, parent_id);
        Ok(folder)
    }

    /// Reparent a file or folder.
    ///
    /// Needs write on the item and on the destination. Permissions stay as
    /// they are; a folder cannot move below itself.
    pub fn move_file(&self, actor: &str, file_id: &str, new_parent_id: &str) -> Result<File> {
        let file = self.good_file(file_id)?;
        let old_parent_id = file
            .parent_id
            .clone()
            .ok_or_else(|| ShardVaultError::InvalidInput("the root folder cannot move".into()))?;
        if old_parent_id == new_parent_id {
            return Ok(file);
        }

        self.good_folder(new_parent_id)?;
        self.permissions.check(actor, file_id, Capabilities::WRITE)?;
        self.permissions.check(actor, new_parent_id, Capabilities::WRITE)?;
        if self.store.is_within(new_parent_id, file_id)? {
            return Err(ShardVaultError::InvalidInput(format!(
                "cannot move {} below itself",
                file_id
            )));
        }
        self.ensure_unique_name(new_parent_id, &file.name, Some(file_id))?;

        let now = unix_now();
        let moved = self.store.transaction(|txn| {
            let mut file: File = txn.require(&File::key_for(file_id), "file")?;
            if file.parent_id.as_deref() != Some(old_parent_id.as_str()) {
                return abort(ShardVaultError::Conflict(format!(
                    "file {} was moved concurrently",
                    file_id
                )));
            }

            txn.bump_folder_version(&old_parent_id, now)?;
            txn.bump_folder_version(new_parent_id, now)?;

            file.parent_id = Some(new_parent_id.to_string());
            file.modified_at = now;
            txn.save_file(&file)?;
            txn.mirror_current_version(&file)?;
            Ok(file)
        })?;

        tracing::info!("Moved {} from {} to {}", file_id, old_parent_id, new_parent_id);
        Ok(moved)
    }

    /// Copy a file into `dest_parent_id` without duplicating its bytes.
    ///
    /// The copy points at the same dataId and carries its own copy of the
    /// sealed key. A DataCopies row marks the blob as shared.
    pub fn copy_file(&self, actor: &str, file_id: &str, dest_parent_id: &str, new_name: Option<&str>) -> Result<File> {
        let source = self.good_file(file_id)?;
        if source.is_folder() {
            return Err(ShardVaultError::InvalidInput(format!(
                "{} is a folder; only files can be copied",
                file_id
            )));
        }
        let data_id = source
            .data_id
            .clone()
            .ok_or_else(|| ShardVaultError::not_found("content of file", file_id))?;

        let name = new_name.unwrap_or(&source.name).to_string();
        validate_name("file name", &name)?;
        self.good_folder(dest_parent_id)?;
        self.permissions.check(actor, file_id, Capabilities::READ)?;
        self.permissions.check(actor, dest_parent_id, Capabilities::WRITE)?;
        self.ensure_unique_name(dest_parent_id, &name, None)?;

        let now = unix_now();
        let copy_id = new_id();
        let inherited = self.permissions.inherited_permissions(dest_parent_id, &copy_id, now)?;

        let copy = self.store.transaction(|txn| {
            let source: File = txn.require(&File::key_for(file_id), "file")?;
            if source.status != FileStatus::Good || source.data_id.as_deref() != Some(data_id.as_str()) {
                return abort(ShardVaultError::Conflict(format!(
                    "file {} changed while copying",
                    file_id
                )));
            }
            let protect: PasswordProtect =
                txn.require(&PasswordProtect::key_for(file_id), "key material")?;

            let copy = File {
                id: copy_id.clone(),
                name: name.clone(),
                parent_id: Some(dest_parent_id.to_string()),
                version_no: 1,
                owner: actor.to_string(),
                handled_by: self.server_name.clone(),
                created_at: now,
                modified_at: now,
                ..source
            };

            txn.bump_folder_version(dest_parent_id, now)?;
            txn.save_file(&copy)?;
            let parent_version = txn.parent_version(&copy)?;
            txn.save_version(&FileVersion::from_file(&copy, parent_version))?;
            txn.put(&PasswordProtect {
                file_id: copy_id.clone(),
                created_at: now,
                modified_at: now,
                ..protect
            })?;
            for permission in &inherited {
                txn.save_permission(permission)?;
            }
            if !txn.contains(&DataCopies::key_for(&data_id))? {
                txn.put(&DataCopies {
                    data_id: data_id.clone(),
                    created_at: now,
                })?;
            }
            Ok(copy)
        })?;

        tracing::info!("Copied {} to {} sharing data {}", file_id, copy.id, data_id);
        Ok(copy)
    }

    /// Mark an item and everything below it for deletion.
    ///
    /// Files, folders and all their versions become `ToBeDeleted`. Fragments
    /// are left for the collector. Returns how many items were marked.
    pub fn delete_file(&self, actor: &str, file_id: &str) -> Result<usize> {
        let file = self.good_file(file_id)?;
        let parent_id = file
            .parent_id
            .clone()
            .ok_or_else(|| ShardVaultError::InvalidInput("the root folder cannot be deleted".into()))?;
        self.permissions.check(actor, file_id, Capabilities::WRITE)?;

        let ids = self.store.subtree_ids(file_id)?;
        let mut version_keys = Vec::new();
        for id in &ids {
            for version in self.store.versions(id)? {
                version_keys.push(FileVersion::key_for(&version.file_id, version.version_no));
            }
        }

        let now = unix_now();
        let marked = self.store.transaction(|txn| {
            let mut marked = 0;
            let mut to_mark = version_keys.clone();

            for id in &ids {
                let mut item: File = match txn.get(&File::key_for(id))? {
                    Some(item) => item,
                    None => continue,
                };
                if !item.is_live() {
                    continue;
                }
                // a version finished after the scan is still caught here
                to_mark.push(FileVersion::key_for(&item.id, item.version_no));
                item.status = FileStatus::ToBeDeleted;
                item.modified_at = now;
                txn.save_file(&item)?;
                marked += 1;
            }

            for key in &to_mark {
                if let Some(mut version) = txn.get::<FileVersion>(key)? {
                    if matches!(version.status, FileStatus::Good | FileStatus::Rebuilding) {
                        version.status = FileStatus::ToBeDeleted;
                        version.modified_at = now;
                        txn.save_version(&version)?;
                    }
                }
            }

            txn.bump_folder_version(&parent_id, now)?;
            Ok(marked)
        })?;

        tracing::info!("Marked {} items under {} for deletion", marked, file_id);
        Ok(marked)
    }

    pub fn rename_file(&self, actor: &str, file_id: &str, new_name: &str) -> Result<File> {
        validate_name("file name", new_name)?;
        let file = self.good_file(file_id)?;
        let parent_id = file
            .parent_id
            .clone()
            .ok_or_else(|| ShardVaultError::InvalidInput("the root folder cannot be renamed".into()))?;
        self.permissions.check(actor, file_id, Capabilities::WRITE)?;
        if file.name == new_name {
            return Ok(file);
        }
        self.ensure_unique_name(&parent_id, new_name, Some(file_id))?;

        let now = unix_now();
        let renamed = self.store.transaction(|txn| {
            let mut file: File = txn.require(&File::key_for(file_id), "file")?;
            file.name = new_name.to_string();
            file.modified_at = now;
            txn.bump_folder_version(&parent_id, now)?;
            txn.save_file(&file)?;
            txn.mirror_current_version(&file)?;
            Ok(file)
        })?;

        tracing::info!("Renamed {} to {}", file_id, new_name);
        Ok(renamed)
    }

    /// `Good` children of a folder, by name
    pub fn list_children(&self, actor: &str, folder_id: &str) -> Result<Vec<File>> {
        self.good_folder(folder_id)?;
        self.permissions.check(actor, folder_id, Capabilities::READ)?;

        let mut children: Vec<File> = self
            .store
            .children(folder_id)?
            .into_iter()
            .filter(|c| c.status == FileStatus::Good)
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    /// Versions still on record, oldest first
    pub fn list_versions(&self, actor: &str, file_id: &str) -> Result<Vec<FileVersion>> {
        self.good_file(file_id)?;
        self.permissions.check(actor, file_id, Capabilities::READ)?;

        Ok(self
            .store
            .versions(file_id)?
            .into_iter()
            .filter(|v| v.status != FileStatus::Deleted)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::metadata::{Capabilities, FileStatus, Principal};
    use crate::testing::{TestCluster, ADMIN};
    use crate::versioning::NewFileOptions;
    use crate::ErrorKind;

    #[tokio::test]
    async fn test_folder_versions_follow_membership() {
        let cluster = TestCluster::new(3).await;
        let files = cluster.files(0);
        let root = cluster.root_id();

        let docs = files.create_folder(ADMIN, &root, "docs").unwrap();
        assert_eq!(docs.version_no, 1);
        let a = files
            .write_file(ADMIN, &docs.id, "a", b"a", NewFileOptions::default())
            .await
            .unwrap();
        files.rename_file(ADMIN, &a.id, "b").unwrap();

        let versions = cluster.store.versions(&docs.id).unwrap();
        assert_eq!(versions.iter().map(|v| v.version_no).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(versions[2].status, FileStatus::Good);
        assert!(versions[..2].iter().all(|v| v.status == FileStatus::ToBeDeleted));

        let current = cluster.store.version(&a.id, 1).unwrap();
        assert_eq!(current.name, "b");
        assert_eq!(
            files.list_children(ADMIN, &docs.id).unwrap().iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            vec!["b"]
        );
    }

    #[tokio::test]
    async fn test_name_conflicts() {
        let cluster = TestCluster::new(3).await;
        let files = cluster.files(0);
        let root = cluster.root_id();

        files.create_folder(ADMIN, &root, "x").unwrap();
        let err = files
            .write_file(ADMIN, &root, "x", b"1", NewFileOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let y = files.create_folder(ADMIN, &root, "y").unwrap();
        assert_eq!(files.rename_file(ADMIN, &y.id, "x").unwrap_err().kind(), ErrorKind::Conflict);
        assert_eq!(files.create_folder(ADMIN, &root, "a/b").unwrap_err().kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_move_rules() {
        let cluster = TestCluster::new(3).await;
        let files = cluster.files(0);
        let root = cluster.root_id();

        let outer = files.create_folder(ADMIN, &root, "outer").unwrap();
        let inner = files.create_folder(ADMIN, &outer.id, "inner").unwrap();
        let file = files
            .write_file(ADMIN, &inner.id, "f", b"content", NewFileOptions::default())
            .await
            .unwrap();

        assert_eq!(
            files.move_file(ADMIN, &outer.id, &inner.id).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );

        let moved = files.move_file(ADMIN, &file.id, &root).unwrap();
        assert_eq!(moved.parent_id.as_deref(), Some(root.as_str()));
        assert_eq!(cluster.store.version(&file.id, 1).unwrap().parent_id.as_deref(), Some(root.as_str()));
        assert_eq!(files.read_file(ADMIN, &file.id, None, None).await.unwrap(), b"content");

        // write on the destination is required
        cluster.add_user("bob").unwrap();
        let bob = Principal::User("bob".into());
        let permissions = files.permissions();
        permissions
            .upsert_permission(ADMIN, &root, &bob, Capabilities::READ_WRITE)
            .unwrap();
        let open = files.create_folder(ADMIN, &root, "open").unwrap();
        let locked = files.create_folder(ADMIN, &root, "locked").unwrap();
        permissions.remove_permission(ADMIN, &locked.id, &bob).unwrap();

        let bobs = files
            .write_file("bob", &open.id, "g", b"g", NewFileOptions::default())
            .await
            .unwrap();
        assert_eq!(
            files.move_file("bob", &bobs.id, &locked.id).unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
        files.move_file("bob", &bobs.id, &root).unwrap();
    }

    #[tokio::test]
    async fn test_delete_marks_subtree() {
        let cluster = TestCluster::new(3).await;
        let files = cluster.files(0);
        let root = cluster.root_id();

        let folder = files.create_folder(ADMIN, &root, "trash").unwrap();
        let file = files
            .write_file(ADMIN, &folder.id, "f", b"bytes", NewFileOptions::default())
            .await
            .unwrap();
        let data_id = file.data_id.clone().unwrap();

        assert_eq!(files.delete_file(ADMIN, &folder.id).unwrap(), 2);
        assert_eq!(cluster.store.file(&file.id).unwrap().status, FileStatus::ToBeDeleted);
        assert!(cluster
            .store
            .versions(&file.id)
            .unwrap()
            .iter()
            .all(|v| v.status == FileStatus::ToBeDeleted));
        // bytes stay until the collector runs
        assert_eq!(cluster.store.fragments_of(&data_id).unwrap().len(), 5);
        assert!(files.list_children(ADMIN, &root).unwrap().is_empty());
        assert_eq!(
            files.read_file(ADMIN, &file.id, None, None).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(files.delete_file(ADMIN, &root).unwrap_err().kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_copy_shares_content() {
        let cluster = TestCluster::new(3).await;
        let files = cluster.files(0);
        let root = cluster.root_id();
        let options = NewFileOptions {
            password: Some("pw".into()),
            ..Default::default()
        };

        let file = files.write_file(ADMIN, &root, "orig", b"shared", options).await.unwrap();
        let copy = files.copy_file(ADMIN, &file.id, &root, Some("copy")).unwrap();

        assert_eq!(copy.data_id, file.data_id);
        assert_ne!(copy.id, file.id);
        assert!(cluster.store.data_copies(file.data_id.as_deref().unwrap()).unwrap().is_some());
        assert_eq!(files.read_file(ADMIN, &copy.id, None, Some("pw")).await.unwrap(), b"shared");

        // re-keying the copy leaves the original alone
        files.clear_password(ADMIN, &copy.id, "pw").unwrap();
        assert_eq!(files.read_file(ADMIN, &copy.id, None, None).await.unwrap(), b"shared");
        assert_eq!(
            files.read_file(ADMIN, &file.id, None, None).await.unwrap_err().kind(),
            ErrorKind::PasswordRequired
        );
    }

    #[tokio::test]
    async fn test_list_versions_hides_deleted() {
        let cluster = TestCluster::new(3).await;
        let files = cluster.files(0);
        let root = cluster.root_id();

        let file = files
            .write_file(ADMIN, &root, "h", b"1", NewFileOptions::default())
            .await
            .unwrap();
        files.update_file(ADMIN, &file.id, b"2", None).await.unwrap();
        assert_eq!(files.list_versions(ADMIN, &file.id).unwrap().len(), 2);

        let mut old = cluster.store.version(&file.id, 1).unwrap();
        old.status = FileStatus::Deleted;
        cluster.store.transaction(|txn| txn.save_version(&old)).unwrap();
        assert_eq!(files.list_versions(ADMIN, &file.id).unwrap().len(), 1);
    }
}
