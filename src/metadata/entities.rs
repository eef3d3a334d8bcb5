//! Persisted entities and their keys

use super::store::{KeyBuilder, Record};
use crate::crypto::{Checksum, ContentIv};
use crate::storage::{ErasureConfig, FragmentKey};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Folder,
}

/// Whether superseded versions are kept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersioningMode {
    #[default]
    Off,
    KeepAll,
}

/// Lifecycle of File and FileVersion rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileStatus {
    /// Created, content not yet finalized
    Rebuilding,
    Good,
    ToBeDeleted,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FragmentStatus {
    Rebuilding,
    Good,
    Bad,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerStatus {
    Starting,
    Online,
    Offline,
    Stopping,
    Warning,
    Error,
}

/// Current state of one logical file or folder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: String,
    pub name: String,
    pub entry_type: EntryType,

    /// None only for the root folder
    pub parent_id: Option<String>,

    pub version_no: u64,

    /// Content blob; None until content is finalized and for folders
    pub data_id: Option<String>,

    /// Version number under which `data_id` was written
    pub data_version: u64,

    /// Plaintext size
    pub size: u64,

    /// Bytes occupied by all shards
    pub actual_size: u64,

    pub versioning: VersioningMode,
    pub checksum: Option<Checksum>,
    pub layout: ErasureConfig,

    /// Per-content IV; the key itself lives in PasswordProtect
    pub iv: ContentIv,

    pub password_protected: bool,
    pub status: FileStatus,
    pub owner: String,

    /// Server that handled the last write
    pub handled_by: String,

    pub created_at: i64,
    pub modified_at: i64,
}

impl File {
    pub fn key_for(id: &str) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str(id).build()
    }

    pub fn is_folder(&self) -> bool {
        self.entry_type == EntryType::Folder
    }

    pub fn is_live(&self) -> bool {
        matches!(self.status, FileStatus::Good | FileStatus::Rebuilding)
    }
}

impl Record for File {
    const TABLE: &'static str = "file";

    fn key(&self) -> Vec<u8> {
        Self::key_for(&self.id)
    }
}

/// Immutable snapshot of a File at one version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileVersion {
    pub file_id: String,
    pub version_no: u64,
    pub name: String,
    pub entry_type: EntryType,
    pub parent_id: Option<String>,

    /// Parent's version number when this snapshot was taken
    pub parent_version_no: Option<u64>,

    pub data_id: Option<String>,
    pub data_version: u64,
    pub size: u64,
    pub actual_size: u64,
    pub checksum: Option<Checksum>,
    pub layout: ErasureConfig,
    pub iv: ContentIv,
    pub status: FileStatus,
    pub created_at: i64,
    pub modified_at: i64,
}

impl FileVersion {
    pub fn key_for(file_id: &str, version_no: u64) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE)
            .str(file_id)
            .u64(version_no)
            .build()
    }

    pub fn prefix_for(file_id: &str) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str(file_id).build()
    }

    /// Snapshot `file` at its current version
    pub fn from_file(file: &File, parent_version_no: Option<u64>) -> Self {
        Self {
            file_id: file.id.clone(),
            version_no: file.version_no,
            name: file.name.clone(),
            entry_type: file.entry_type,
            parent_id: file.parent_id.clone(),
            parent_version_no,
            data_id: file.data_id.clone(),
            data_version: file.data_version,
            size: file.size,
            actual_size: file.actual_size,
            checksum: file.checksum,
            layout: file.layout,
            iv: file.iv,
            status: file.status,
            created_at: file.modified_at,
            modified_at: file.modified_at,
        }
    }

    /// Copy the mutable naming fields of the live row
    pub fn mirror(&mut self, file: &File) {
        self.name = file.name.clone();
        self.parent_id = file.parent_id.clone();
        self.status = file.status;
        self.modified_at = file.modified_at;
    }
}

impl Record for FileVersion {
    const TABLE: &'static str = "fver";

    fn key(&self) -> Vec<u8> {
        Self::key_for(&self.file_id, self.version_no)
    }
}

/// One physical shard of a content blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub data_id: String,
    pub version_no: u64,
    pub frag_id: u32,
    pub server: String,

    /// Path relative to the hosting node's fragment store
    pub path: String,

    pub last_checked: Option<i64>,
    pub total_shards: u32,
    pub status: FragmentStatus,
}

impl Fragment {
    pub fn key_for(data_id: &str, version_no: u64, frag_id: u32) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE)
            .str(data_id)
            .u64(version_no)
            .u32(frag_id)
            .build()
    }

    pub fn prefix_for(data_id: &str) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str(data_id).build()
    }

    pub fn fragment_key(&self) -> FragmentKey {
        FragmentKey::new(self.data_id.clone(), self.version_no, self.frag_id)
    }
}

impl Record for Fragment {
    const TABLE: &'static str = "frag";

    fn key(&self) -> Vec<u8> {
        Self::key_for(&self.data_id, self.version_no, self.frag_id)
    }
}

/// Marks a content blob referenced by more than one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataCopies {
    pub data_id: String,
    pub created_at: i64,
}

impl DataCopies {
    pub fn key_for(data_id: &str) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str(data_id).build()
    }
}

impl Record for DataCopies {
    const TABLE: &'static str = "dcopy";

    fn key(&self) -> Vec<u8> {
        Self::key_for(&self.data_id)
    }
}

/// Capability bits of a permission grant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capabilities {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub share: bool,
    pub audit: bool,
}

impl Capabilities {
    pub const NONE: Self = Self {
        read: false,
        write: false,
        execute: false,
        share: false,
        audit: false,
    };

    pub const ALL: Self = Self {
        read: true,
        write: true,
        execute: true,
        share: true,
        audit: true,
    };

    pub const READ: Self = Self {
        read: true,
        ..Self::NONE
    };

    pub const WRITE: Self = Self {
        write: true,
        ..Self::NONE
    };

    pub const SHARE: Self = Self {
        share: true,
        ..Self::NONE
    };

    pub const AUDIT: Self = Self {
        audit: true,
        ..Self::NONE
    };

    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
        ..Self::NONE
    };

    fn bits(&self) -> [bool; 5] {
        [self.read, self.write, self.execute, self.share, self.audit]
    }

    fn from_bits(bits: [bool; 5]) -> Self {
        Self {
            read: bits[0],
            write: bits[1],
            execute: bits[2],
            share: bits[3],
            audit: bits[4],
        }
    }

    /// Every bit set here is also set in `other`
    pub fn is_subset(&self, other: &Capabilities) -> bool {
        self.bits()
            .iter()
            .zip(other.bits().iter())
            .all(|(mine, theirs)| !mine || *theirs)
    }

    pub fn union(&self, other: &Capabilities) -> Capabilities {
        let (a, b) = (self.bits(), other.bits());
        Self::from_bits([a[0] || b[0], a[1] || b[1], a[2] || b[2], a[3] || b[3], a[4] || b[4]])
    }

    pub fn intersection(&self, other: &Capabilities) -> Capabilities {
        let (a, b) = (self.bits(), other.bits());
        Self::from_bits([a[0] && b[0], a[1] && b[1], a[2] && b[2], a[3] && b[3], a[4] && b[4]])
    }

    pub fn is_empty(&self) -> bool {
        !self.bits().iter().any(|b| *b)
    }
}

impl std::fmt::Display for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let letters = ['r', 'w', 'x', 's', 'a'];
        let rendered: String = self
            .bits()
            .iter()
            .zip(letters.iter())
            .map(|(set, letter)| if *set { *letter } else { '-' })
            .collect();
        f.write_str(&rendered)
    }
}

/// Subject of a permission row; a row names a user or a group, never both
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    User(String),
    Group(String),
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Principal::User(name) => write!(f, "user:{}", name),
            Principal::Group(name) => write!(f, "group:{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionStatus {
    Active,
    Removed,
}

/// ACL entry on one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub file_id: String,
    pub permission_id: String,
    pub principal: Principal,
    pub capabilities: Capabilities,
    pub status: PermissionStatus,
    pub created_at: i64,
    pub modified_at: i64,
}

impl Permission {
    pub fn prefix_for(file_id: &str) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str(file_id).build()
    }

    pub fn is_active(&self) -> bool {
        self.status == PermissionStatus::Active
    }
}

impl Record for Permission {
    const TABLE: &'static str = "perm";

    fn key(&self) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE)
            .str(&self.file_id)
            .str(&self.permission_id)
            .build()
    }
}

/// Cluster roster entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    pub hostname: String,
    pub port: u16,

    /// libp2p peer id, when the node runs the networked transport
    pub peer_id: Option<String>,

    pub status: ServerStatus,
    pub free_space: u64,
    pub last_seen: i64,

    /// When the node last entered `Starting`
    pub started_at: i64,
}

impl Server {
    pub fn key_for(name: &str) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str(name).build()
    }

    pub fn is_online(&self) -> bool {
        self.status == ServerStatus::Online
    }
}

impl Record for Server {
    const TABLE: &'static str = "srv";

    fn key(&self) -> Vec<u8> {
        Self::key_for(&self.name)
    }
}

/// Wrapped content key of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordProtect {
    pub file_id: String,

    /// Content key sealed under the system key or a password-derived key
    pub wrapped_key: Vec<u8>,

    /// Set when the key is sealed under a password
    pub salt: Option<Vec<u8>>,

    pub created_at: i64,
    pub modified_at: i64,
}

impl PasswordProtect {
    pub fn key_for(file_id: &str) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str(file_id).build()
    }

    pub fn is_password_wrapped(&self) -> bool {
        self.salt.is_some()
    }
}

impl Record for PasswordProtect {
    const TABLE: &'static str = "pwp";

    fn key(&self) -> Vec<u8> {
        Self::key_for(&self.file_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub is_super: bool,
    pub roles: Vec<String>,
    pub created_at: i64,
}

impl User {
    pub fn key_for(name: &str) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str(name).build()
    }
}

impl Record for User {
    const TABLE: &'static str = "user";

    fn key(&self) -> Vec<u8> {
        Self::key_for(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub created_at: i64,
}

impl Group {
    pub fn key_for(name: &str) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str(name).build()
    }
}

impl Record for Group {
    const TABLE: &'static str = "group";

    fn key(&self) -> Vec<u8> {
        Self::key_for(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub group: String,
    pub user: String,
}

impl GroupMember {
    pub fn key_for(group: &str, user: &str) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str(group).str(user).build()
    }

    pub fn prefix_for(group: &str) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str(group).build()
    }
}

impl Record for GroupMember {
    const TABLE: &'static str = "gmem";

    fn key(&self) -> Vec<u8> {
        Self::key_for(&self.group, &self.user)
    }
}

/// Maps an external role onto a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGroup {
    pub role: String,
    pub group: String,
}

impl RoleGroup {
    pub fn key_for(role: &str, group: &str) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str(role).str(group).build()
    }

    pub fn prefix_for(role: &str) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str(role).build()
    }
}

impl Record for RoleGroup {
    const TABLE: &'static str = "rgrp";

    fn key(&self) -> Vec<u8> {
        Self::key_for(&self.role, &self.group)
    }
}

/// Cluster-wide settings seeded at bootstrap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSettings {
    pub layout: ErasureConfig,

    /// Non-current versions older than this are swept (seconds)
    pub retention_secs: i64,

    /// Key-encryption key for content keys without a password
    pub system_key: [u8; 32],

    pub root_id: String,
    pub super_user: String,
    pub created_at: i64,
}

impl ClusterSettings {
    pub fn key_for() -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str("cluster").build()
    }
}

impl Record for ClusterSettings {
    const TABLE: &'static str = "settings";

    fn key(&self) -> Vec<u8> {
        Self::key_for()
    }
}

/// Exclusivity marker for cluster-wide jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub owner: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

impl Lease {
    pub fn key_for(name: &str) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str(name).build()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

impl Record for Lease {
    const TABLE: &'static str = "lease";

    fn key(&self) -> Vec<u8> {
        Self::key_for(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_lattice() {
        let rw = Capabilities::READ_WRITE;
        assert!(Capabilities::READ.is_subset(&rw));
        assert!(!rw.is_subset(&Capabilities::READ));
        assert!(Capabilities::NONE.is_subset(&Capabilities::NONE));

        assert_eq!(Capabilities::READ.union(&Capabilities::WRITE), rw);
        assert_eq!(rw.intersection(&Capabilities::SHARE), Capabilities::NONE);
        assert!(Capabilities::NONE.is_empty());
        assert_eq!(rw.to_string(), "rw---");
        assert_eq!(Capabilities::ALL.to_string(), "rwxsa");
    }

    #[test]
    fn test_fragment_keys_group_by_data_id() {
        let a = Fragment::key_for("data-a", 3, 1);
        assert!(a.starts_with(&Fragment::prefix_for("data-a")));
        assert!(!a.starts_with(&Fragment::prefix_for("data")));
        assert!(Fragment::key_for("d", 1, 9) < Fragment::key_for("d", 2, 0));
    }
}
