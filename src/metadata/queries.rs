//! Query surface and index-maintaining writes
//!
//! Two secondary indexes are kept next to the rows they describe:
//! `idx.child` (parent -> child file ids) and `idx.dref` (dataId -> the
//! FileVersion rows pointing at it). Rows that participate in an index are
//! only ever written through the `Txn::save_*` helpers below.

use super::entities::*;
use super::store::{key_strings, KeyBuilder, MetadataStore, Record, TxResult, Txn};
use crate::Result;

const CHILD_INDEX: &str = "idx.child";
const DATA_REF_INDEX: &str = "idx.dref";
const USER_GROUP_INDEX: &str = "idx.ugrp";
const PERMISSION_REVISION: &str = "rev.perm";
const GROUP_REVISION: &str = "rev.group";

fn child_key(parent_id: &str, child_id: &str) -> Vec<u8> {
    KeyBuilder::table(CHILD_INDEX)
        .str(parent_id)
        .str(child_id)
        .build()
}

fn data_ref_prefix(data_id: &str) -> Vec<u8> {
    KeyBuilder::table(DATA_REF_INDEX).str(data_id).build()
}

fn data_ref_key(data_id: &str, file_id: &str, version_no: u64) -> Vec<u8> {
    KeyBuilder::table(DATA_REF_INDEX)
        .str(data_id)
        .str(file_id)
        .u64(version_no)
        .build()
}

/// Decode `(file_id, version_no)` from a data reference key
fn parse_data_ref(key: &[u8], prefix_len: usize) -> Option<(String, u64)> {
    let rest = key.get(prefix_len..)?;
    let nul = rest.iter().position(|b| *b == 0)?;
    let file_id = String::from_utf8(rest[..nul].to_vec()).ok()?;
    let version: [u8; 8] = rest.get(nul + 1..)?.try_into().ok()?;
    Some((file_id, u64::from_be_bytes(version)))
}

fn user_group_key(user: &str, group: &str) -> Vec<u8> {
    KeyBuilder::table(USER_GROUP_INDEX).str(user).str(group).build()
}

fn permission_revision_key(file_id: &str) -> Vec<u8> {
    KeyBuilder::table(PERMISSION_REVISION).str(file_id).build()
}

fn group_revision_key(group: &str) -> Vec<u8> {
    KeyBuilder::table(GROUP_REVISION).str(group).build()
}

impl<'a> Txn<'a> {
    /// Write a File row and keep the child index in step
    pub fn save_file(&self, file: &File) -> TxResult<()> {
        let previous: Option<File> = self.get(&file.key())?;
        let old_parent = previous.and_then(|f| f.parent_id);

        if old_parent != file.parent_id {
            if let Some(old) = &old_parent {
                self.delete(&child_key(old, &file.id))?;
            }
        }
        if let Some(parent) = &file.parent_id {
            self.put_marker(child_key(parent, &file.id))?;
        }
        self.put(file)
    }

    /// Remove a File row and its child index entry
    pub fn remove_file(&self, file: &File) -> TxResult<()> {
        if let Some(parent) = &file.parent_id {
            self.delete(&child_key(parent, &file.id))?;
        }
        self.delete(&file.key())?;
        Ok(())
    }

    /// Write a FileVersion row and keep the data reference index in step
    pub fn save_version(&self, version: &FileVersion) -> TxResult<()> {
        let previous: Option<FileVersion> = self.get(&version.key())?;
        if let Some(old_data) = previous.and_then(|v| v.data_id) {
            if version.data_id.as_deref() != Some(old_data.as_str()) {
                self.delete(&data_ref_key(&old_data, &version.file_id, version.version_no))?;
            }
        }
        if let Some(data_id) = &version.data_id {
            self.put_marker(data_ref_key(data_id, &version.file_id, version.version_no))?;
        }
        self.put(version)
    }

    pub fn add_group_member(&self, member: &GroupMember) -> TxResult<()> {
        self.bump(&group_revision_key(&member.group))?;
        self.put_marker(user_group_key(&member.user, &member.group))?;
        self.put(member)
    }

    /// Write a permission row and advance the revisions it belongs to.
    ///
    /// A row naming a group that no longer exists is not written; returns
    /// whether the row was saved.
    pub fn save_permission(&self, permission: &Permission) -> TxResult<bool> {
        if let Principal::Group(group) = &permission.principal {
            if !self.contains(&Group::key_for(group))? {
                return Ok(false);
            }
            self.bump(&group_revision_key(group))?;
        }
        self.bump(&permission_revision_key(&permission.file_id))?;
        self.put(permission)?;
        Ok(true)
    }

    /// Advances on every permission write on `file_id`
    pub fn permission_revision(&self, file_id: &str) -> TxResult<u64> {
        self.counter(&permission_revision_key(file_id))
    }

    /// Advances whenever a permission row, membership or role mapping
    /// naming `group` is written
    pub fn group_revision(&self, group: &str) -> TxResult<u64> {
        self.counter(&group_revision_key(group))
    }

    pub fn bump_group_revision(&self, group: &str) -> TxResult<u64> {
        self.bump(&group_revision_key(group))
    }

    pub fn clear_group_revision(&self, group: &str) -> TxResult<bool> {
        self.delete(&group_revision_key(group))
    }

    pub fn remove_group_member(&self, group: &str, user: &str) -> TxResult<bool> {
        self.delete(&user_group_key(user, group))?;
        self.delete(&GroupMember::key_for(group, user))
    }

    /// Start a new version of a folder whose membership changed.
    ///
    /// The superseded folder version is released unless the folder keeps
    /// all versions. Returns the new version number.
    pub fn bump_folder_version(&self, folder_id: &str, now: i64) -> TxResult<u64> {
        let mut folder: File = self.require(&File::key_for(folder_id), "folder")?;

        if let Some(mut current) =
            self.get::<FileVersion>(&FileVersion::key_for(&folder.id, folder.version_no))?
        {
            if folder.versioning == VersioningMode::Off && current.status == FileStatus::Good {
                current.status = FileStatus::ToBeDeleted;
                current.modified_at = now;
                self.save_version(&current)?;
            }
        }

        folder.version_no += 1;
        folder.modified_at = now;
        self.save_file(&folder)?;

        let parent_version = self.parent_version(&folder)?;
        self.save_version(&FileVersion::from_file(&folder, parent_version))?;

        Ok(folder.version_no)
    }

    /// Current version number of `file`'s parent, if it has one
    pub fn parent_version(&self, file: &File) -> TxResult<Option<u64>> {
        match &file.parent_id {
            Some(parent_id) => {
                let parent: File = self.require(&File::key_for(parent_id), "parent folder")?;
                Ok(Some(parent.version_no))
            }
            None => Ok(None),
        }
    }

    /// Refresh the current version row so it mirrors the live File row
    pub fn mirror_current_version(&self, file: &File) -> TxResult<()> {
        let key = FileVersion::key_for(&file.id, file.version_no);
        if let Some(mut current) = self.get::<FileVersion>(&key)? {
            current.mirror(file);
            self.save_version(&current)?;
        }
        Ok(())
    }
}

impl MetadataStore {
    pub fn file(&self, id: &str) -> Result<File> {
        self.require(&File::key_for(id), &format!("file {}", id))
    }

    pub fn find_file(&self, id: &str) -> Result<Option<File>> {
        self.get(&File::key_for(id))
    }

    pub fn all_files(&self) -> Result<Vec<File>> {
        self.scan_table()
    }

    /// Every child row of `parent_id`, whatever its status
    pub fn children(&self, parent_id: &str) -> Result<Vec<File>> {
        let prefix = KeyBuilder::table(CHILD_INDEX).str(parent_id).build();
        let mut children = Vec::new();
        for key in self.scan_keys(&prefix)? {
            let parts = key_strings(&key, CHILD_INDEX);
            if let Some(child_id) = parts.get(1) {
                if let Some(child) = self.find_file(child_id)? {
                    children.push(child);
                }
            }
        }
        Ok(children)
    }

    /// Ids of `root_id` and everything below it, parents before children
    pub fn subtree_ids(&self, root_id: &str) -> Result<Vec<String>> {
        let mut ids = vec![root_id.to_string()];
        let mut cursor = 0;
        while cursor < ids.len() {
            let next = ids[cursor].clone();
            for child in self.children(&next)? {
                if child.status != FileStatus::Deleted {
                    ids.push(child.id);
                }
            }
            cursor += 1;
        }
        Ok(ids)
    }

    /// Whether `candidate` is `ancestor` or lies below it
    pub fn is_within(&self, candidate: &str, ancestor: &str) -> Result<bool> {
        let mut cursor = Some(candidate.to_string());
        while let Some(id) = cursor {
            if id == ancestor {
                return Ok(true);
            }
            cursor = self.find_file(&id)?.and_then(|f| f.parent_id);
        }
        Ok(false)
    }

    pub fn versions(&self, file_id: &str) -> Result<Vec<FileVersion>> {
        self.scan(&FileVersion::prefix_for(file_id))
    }

    pub fn version(&self, file_id: &str, version_no: u64) -> Result<FileVersion> {
        self.require(
            &FileVersion::key_for(file_id, version_no),
            &format!("version {} of file {}", version_no, file_id),
        )
    }

    pub fn current_version(&self, file_id: &str) -> Result<Option<FileVersion>> {
        let file = self.file(file_id)?;
        self.get(&FileVersion::key_for(file_id, file.version_no))
    }

    pub fn all_versions(&self) -> Result<Vec<FileVersion>> {
        self.scan_table()
    }

    /// FileVersion rows pointing at `data_id`, any status
    pub fn versions_referencing(&self, data_id: &str) -> Result<Vec<FileVersion>> {
        let prefix = data_ref_prefix(data_id);
        let mut versions = Vec::new();
        for key in self.scan_keys(&prefix)? {
            if let Some((file_id, version_no)) = parse_data_ref(&key, prefix.len()) {
                if let Some(version) = self.get(&FileVersion::key_for(&file_id, version_no))? {
                    versions.push(version);
                }
            }
        }
        Ok(versions)
    }

    pub fn fragments_of(&self, data_id: &str) -> Result<Vec<Fragment>> {
        self.scan(&Fragment::prefix_for(data_id))
    }

    pub fn fragments_on_server(&self, server: &str) -> Result<Vec<Fragment>> {
        Ok(self
            .scan_table::<Fragment>()?
            .into_iter()
            .filter(|f| f.server == server)
            .collect())
    }

    pub fn data_copies(&self, data_id: &str) -> Result<Option<DataCopies>> {
        self.get(&DataCopies::key_for(data_id))
    }

    /// All permission rows of a file, including removed ones
    pub fn permissions_of(&self, file_id: &str) -> Result<Vec<Permission>> {
        self.scan(&Permission::prefix_for(file_id))
    }

    pub fn all_permissions(&self) -> Result<Vec<Permission>> {
        self.scan_table()
    }

    pub fn permission_revision(&self, file_id: &str) -> Result<u64> {
        self.counter(&permission_revision_key(file_id))
    }

    pub fn group_revision(&self, group: &str) -> Result<u64> {
        self.counter(&group_revision_key(group))
    }

    pub fn password_protect(&self, file_id: &str) -> Result<PasswordProtect> {
        self.require(
            &PasswordProtect::key_for(file_id),
            &format!("key material of file {}", file_id),
        )
    }

    pub fn server(&self, name: &str) -> Result<Server> {
        self.require(&Server::key_for(name), &format!("server {}", name))
    }

    pub fn servers(&self) -> Result<Vec<Server>> {
        self.scan_table()
    }

    pub fn online_servers(&self) -> Result<Vec<Server>> {
        Ok(self
            .servers()?
            .into_iter()
            .filter(Server::is_online)
            .collect())
    }

    pub fn settings(&self) -> Result<ClusterSettings> {
        self.require(&ClusterSettings::key_for(), "cluster settings")
    }

    pub fn user(&self, name: &str) -> Result<User> {
        self.require(&User::key_for(name), &format!("user {}", name))
    }

    pub fn group(&self, name: &str) -> Result<Group> {
        self.require(&Group::key_for(name), &format!("group {}", name))
    }

    pub fn find_group(&self, name: &str) -> Result<Option<Group>> {
        self.get(&Group::key_for(name))
    }

    pub fn group_members(&self, group: &str) -> Result<Vec<GroupMember>> {
        self.scan(&GroupMember::prefix_for(group))
    }

    /// Groups `user` belongs to directly
    pub fn direct_groups_of(&self, user: &str) -> Result<Vec<String>> {
        let prefix = KeyBuilder::table(USER_GROUP_INDEX).str(user).build();
        Ok(self
            .scan_keys(&prefix)?
            .iter()
            .filter_map(|key| key_strings(key, USER_GROUP_INDEX).get(1).cloned())
            .collect())
    }

    pub fn role_groups(&self, role: &str) -> Result<Vec<RoleGroup>> {
        self.scan(&RoleGroup::prefix_for(role))
    }

    pub fn role_mappings(&self) -> Result<Vec<RoleGroup>> {
        self.scan_table()
    }

    pub fn lease(&self, name: &str) -> Result<Option<Lease>> {
        self.get(&Lease::key_for(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ErasureConfig;

    fn folder(id: &str, parent: Option<&str>) -> File {
        File {
            id: id.into(),
            name: id.into(),
            entry_type: EntryType::Folder,
            parent_id: parent.map(String::from),
            version_no: 1,
            data_id: None,
            data_version: 0,
            size: 0,
            actual_size: 0,
            versioning: VersioningMode::Off,
            checksum: None,
            layout: ErasureConfig::default(),
            iv: [0; 12],
            password_protected: false,
            status: FileStatus::Good,
            owner: "admin".into(),
            handled_by: "s1".into(),
            created_at: 0,
            modified_at: 0,
        }
    }

    #[test]
    fn test_child_index_follows_moves() {
        let store = MetadataStore::temporary().unwrap();
        store
            .transaction(|txn| {
                txn.save_file(&folder("root", None))?;
                txn.save_file(&folder("a", Some("root")))?;
                txn.save_file(&folder("b", Some("root")))?;
                txn.save_file(&folder("c", Some("a")))?;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.children("root").unwrap().len(), 2);
        assert_eq!(store.subtree_ids("a").unwrap(), vec!["a", "c"]);
        assert!(store.is_within("c", "root").unwrap());

        let moved = folder("c", Some("b"));
        store.transaction(|txn| txn.save_file(&moved)).unwrap();

        assert!(store.children("a").unwrap().is_empty());
        assert_eq!(store.children("b").unwrap()[0].id, "c");
        assert!(!store.is_within("c", "a").unwrap());
    }

    #[test]
    fn test_data_reference_index() {
        let store = MetadataStore::temporary().unwrap();
        let mut file = folder("f", None);
        file.entry_type = EntryType::File;
        file.data_id = Some("blob-1".into());

        let v1 = FileVersion::from_file(&file, None);
        file.version_no = 2;
        file.data_id = Some("blob-2".into());
        let v2 = FileVersion::from_file(&file, None);

        store
            .transaction(|txn| {
                txn.save_version(&v1)?;
                txn.save_version(&v2)?;
                Ok(())
            })
            .unwrap();

        let refs = store.versions_referencing("blob-1").unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].version_no, 1);
        assert!(store.versions_referencing("blob").unwrap().is_empty());
    }

    #[test]
    fn test_folder_bump_releases_old_version() {
        let store = MetadataStore::temporary().unwrap();
        let root = folder("root", None);
        store
            .transaction(|txn| {
                txn.save_file(&root)?;
                txn.save_version(&FileVersion::from_file(&root, None))?;
                Ok(())
            })
            .unwrap();

        let new_version = store
            .transaction(|txn| txn.bump_folder_version("root", 10))
            .unwrap();
        assert_eq!(new_version, 2);

        let versions = store.versions("root").unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].status, FileStatus::ToBeDeleted);
        assert_eq!(versions[1].status, FileStatus::Good);
        assert_eq!(store.file("root").unwrap().version_no, 2);
    }
}
