//! Local fragment storage - the shard directory of one node

use super::StorageError;

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const FRAGMENTS_DIR: &str = "fragments";
const SHARD_EXT: &str = "shard";

/// Identity of one physical shard
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentKey {
    pub data_id: String,
    pub version_no: u64,
    pub frag_id: u32,
}

impl FragmentKey {
    pub fn new(data_id: impl Into<String>, version_no: u64, frag_id: u32) -> Self {
        Self {
            data_id: data_id.into(),
            version_no,
            frag_id,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}.{}",
            self.data_id, self.version_no, self.frag_id, SHARD_EXT
        )
    }

    /// Inverse of [`FragmentKey::file_name`]
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(&format!(".{}", SHARD_EXT))?;
        let mut parts = stem.rsplitn(3, '_');
        let frag_id = parts.next()?.parse().ok()?;
        let version_no = parts.next()?.parse().ok()?;
        let data_id = parts.next()?;
        if data_id.is_empty() {
            return None;
        }
        Some(Self::new(data_id, version_no, frag_id))
    }

    /// Path of this shard relative to a store root
    pub fn relative_path(&self) -> String {
        let bucket = self.data_id.get(..2).unwrap_or("00");
        format!("{}/{}/{}", FRAGMENTS_DIR, bucket, self.file_name())
    }
}

impl std::fmt::Display for FragmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}#{}", self.data_id, self.version_no, self.frag_id)
    }
}

/// Byte range of a partial read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

/// A shard file found on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredShard {
    /// Path relative to the store root
    pub path: String,

    /// Parsed from the file name, if it follows the naming scheme
    pub key: Option<FragmentKey>,

    pub size_bytes: u64,
}

/// Manages this node's shard directory
pub struct FragmentStore {
    /// Base path for storage
    root: PathBuf,

    /// Maximum storage offered to the cluster (bytes)
    capacity_bytes: u64,

    /// Currently used storage (bytes)
    used_bytes: AtomicU64,
}

impl FragmentStore {
    /// Open (creating if needed) a shard directory and measure its usage
    pub async fn open(root: impl Into<PathBuf>, capacity_bytes: u64) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(FRAGMENTS_DIR)).await?;

        let store = Self {
            root,
            capacity_bytes,
            used_bytes: AtomicU64::new(0),
        };

        let used: u64 = store.list().await?.iter().map(|s| s.size_bytes).sum();
        store.used_bytes.store(used, Ordering::SeqCst);
        tracing::debug!(
            "Fragment store at {} holds {} bytes",
            store.root.display(),
            used
        );

        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative shard path, refusing anything that escapes the root
    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let candidate = Path::new(relative);
        let clean = candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !clean || !relative.starts_with(FRAGMENTS_DIR) {
            return Err(StorageError::InvalidPath(relative.to_string()));
        }
        Ok(self.root.join(candidate))
    }

    /// Write a shard; returns its relative path
    pub async fn write(&self, key: &FragmentKey, data: &[u8]) -> Result<String, StorageError> {
        let relative = key.relative_path();
        let full_path = self.resolve(&relative)?;

        let previous = match tokio::fs::metadata(&full_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let size = data.len() as u64;
        let available = self.free_space().saturating_add(previous);
        if size > available {
            return Err(StorageError::InsufficientSpace {
                needed: size,
                available,
            });
        }

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write next to the target, then rename into place
        let tmp_path = full_path.with_extension("tmp");
        tokio::fs::write(&tmp_path, data).await?;
        tokio::fs::rename(&tmp_path, &full_path).await?;

        self.used_bytes.fetch_add(size, Ordering::SeqCst);
        self.release(previous);

        Ok(relative)
    }

    /// Read a shard, optionally only a byte range of it
    pub async fn read(&self, relative: &str, range: Option<ByteRange>) -> Result<Vec<u8>, StorageError> {
        let full_path = self.resolve(relative)?;

        let mut file = match tokio::fs::File::open(&full_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::FileNotFound(relative.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut data = Vec::new();
        match range {
            Some(range) => {
                file.seek(std::io::SeekFrom::Start(range.offset)).await?;
                file.take(range.length).read_to_end(&mut data).await?;
            }
            None => {
                file.read_to_end(&mut data).await?;
            }
        }

        Ok(data)
    }

    /// Delete a shard. Returns false when it was already gone.
    pub async fn delete(&self, relative: &str) -> Result<bool, StorageError> {
        let full_path = self.resolve(relative)?;

        let size = match tokio::fs::metadata(&full_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        match tokio::fs::remove_file(&full_path).await {
            Ok(()) => {
                self.release(size);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, relative: &str) -> bool {
        match self.resolve(relative) {
            Ok(path) => tokio::fs::metadata(path).await.is_ok(),
            Err(_) => false,
        }
    }

    /// Enumerate every shard file under the store
    pub async fn list(&self) -> Result<Vec<StoredShard>, StorageError> {
        let mut shards = Vec::new();
        let base = self.root.join(FRAGMENTS_DIR);

        let mut buckets = tokio::fs::read_dir(&base).await?;
        while let Some(bucket) = buckets.next_entry().await? {
            if !bucket.file_type().await?.is_dir() {
                continue;
            }
            let bucket_name = bucket.file_name().to_string_lossy().into_owned();

            let mut entries = tokio::fs::read_dir(bucket.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if !meta.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.ends_with(SHARD_EXT) {
                    continue;
                }
                shards.push(StoredShard {
                    path: format!("{}/{}/{}", FRAGMENTS_DIR, bucket_name, name),
                    key: FragmentKey::parse_file_name(&name),
                    size_bytes: meta.len(),
                });
            }
        }

        shards.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(shards)
    }

    fn release(&self, size: u64) {
        let _ = self
            .used_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(size))
            });
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Free space left in the offered capacity
    pub fn free_space(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_file_name_roundtrip() {
        let key = FragmentKey::new("0f3a9c", 7, 4);
        assert_eq!(key.file_name(), "0f3a9c_7_4.shard");
        assert_eq!(FragmentKey::parse_file_name(&key.file_name()), Some(key.clone()));
        assert_eq!(key.relative_path(), "fragments/0f/0f3a9c_7_4.shard");

        assert_eq!(FragmentKey::parse_file_name("junk.shard"), None);
        assert_eq!(FragmentKey::parse_file_name("a_b_c.shard"), None);
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = FragmentStore::open(temp_dir.path(), 1_000_000).await.unwrap();

        let key = FragmentKey::new("abcdef", 1, 0);
        let path = store.write(&key, b"Test fragment data").await.unwrap();
        assert_eq!(store.used_bytes(), 18);
        assert!(store.exists(&path).await);

        let data = store.read(&path, None).await.unwrap();
        assert_eq!(data, b"Test fragment data");

        let partial = store
            .read(&path, Some(ByteRange { offset: 5, length: 8 }))
            .await
            .unwrap();
        assert_eq!(partial, b"fragment");

        assert!(store.delete(&path).await.unwrap());
        assert!(!store.delete(&path).await.unwrap());
        assert_eq!(store.used_bytes(), 0);
        assert!(matches!(
            store.read(&path, None).await,
            Err(StorageError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_storage_limit() {
        let temp_dir = TempDir::new().unwrap();
        let store = FragmentStore::open(temp_dir.path(), 100).await.unwrap();

        let result = store.write(&FragmentKey::new("abcdef", 1, 0), &[0u8; 200]).await;
        assert!(matches!(result, Err(StorageError::InsufficientSpace { .. })));
    }

    #[tokio::test]
    async fn test_list_and_reopen_measures_usage() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = FragmentStore::open(temp_dir.path(), 1_000).await.unwrap();
            store.write(&FragmentKey::new("aa11", 1, 0), &[1u8; 10]).await.unwrap();
            store.write(&FragmentKey::new("bb22", 2, 3), &[2u8; 20]).await.unwrap();
        }

        let store = FragmentStore::open(temp_dir.path(), 1_000).await.unwrap();
        assert_eq!(store.used_bytes(), 30);
        assert_eq!(store.free_space(), 970);

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].key, Some(FragmentKey::new("bb22", 2, 3)));
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let temp_dir = TempDir::new().unwrap();
        let store = FragmentStore::open(temp_dir.path(), 1_000).await.unwrap();

        assert!(matches!(
            store.read("fragments/../../etc/passwd", None).await,
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            store.delete("/etc/passwd").await,
            Err(StorageError::InvalidPath(_))
        ));
    }
}
