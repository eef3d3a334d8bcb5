//! Durable metadata store on top of sled
//!
//! Every entity lives in one tree under a table-prefixed key. Multi-row
//! writes go through [`MetadataStore::transaction`], which retries on
//! conflict and either applies all writes or none.

use crate::{Result, ShardVaultError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use std::path::Path;

const TREE_NAME: &str = "shardvault";

pub type TxResult<T> = sled::transaction::ConflictableTransactionResult<T, ShardVaultError>;

/// A persisted row
pub trait Record: Serialize + DeserializeOwned {
    /// Key prefix shared by every row of this type
    const TABLE: &'static str;

    fn key(&self) -> Vec<u8>;
}

/// Builds ordered keys: `table/` followed by NUL-terminated strings and
/// big-endian integers, so prefix scans return rows in natural order.
#[derive(Debug, Clone)]
pub struct KeyBuilder(Vec<u8>);

impl KeyBuilder {
    pub fn table(table: &str) -> Self {
        let mut key = Vec::with_capacity(table.len() + 48);
        key.extend_from_slice(table.as_bytes());
        key.push(b'/');
        Self(key)
    }

    pub fn str(mut self, part: &str) -> Self {
        self.0.extend_from_slice(part.as_bytes());
        self.0.push(0);
        self
    }

    pub fn u64(mut self, part: u64) -> Self {
        self.0.extend_from_slice(&part.to_be_bytes());
        self
    }

    pub fn u32(mut self, part: u32) -> Self {
        self.0.extend_from_slice(&part.to_be_bytes());
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.0
    }
}

/// Split the string parts back out of a key made only of string parts
pub fn key_strings(key: &[u8], table: &str) -> Vec<String> {
    let body = key.get(table.len() + 1..).unwrap_or_default();
    let mut parts: Vec<String> = body
        .split(|b| *b == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    // the trailing piece after the last NUL is binary or empty
    parts.pop();
    parts
}

/// Reject identifiers that would corrupt the key encoding
pub fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ShardVaultError::InvalidInput(format!("{} must not be empty", what)));
    }
    if name.contains('\0') || name.contains('/') {
        return Err(ShardVaultError::InvalidInput(format!(
            "{} {:?} contains a reserved character",
            what, name
        )));
    }
    Ok(())
}

fn encode<R: Record>(record: &R) -> Result<Vec<u8>> {
    bincode::serialize(record).map_err(|e| ShardVaultError::Serialization(e.to_string()))
}

fn decode<R: Record>(bytes: &[u8]) -> Result<R> {
    bincode::deserialize(bytes).map_err(|e| ShardVaultError::Serialization(e.to_string()))
}

/// Abort the surrounding transaction with `err`
pub fn abort<T>(err: ShardVaultError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

/// Typed view of one in-flight transaction
pub struct Txn<'a> {
    tree: &'a TransactionalTree,
}

impl<'a> Txn<'a> {
    pub fn get<R: Record>(&self, key: &[u8]) -> TxResult<Option<R>> {
        match self.tree.get(key)? {
            Some(bytes) => decode(&bytes)
                .map(Some)
                .map_err(ConflictableTransactionError::Abort),
            None => Ok(None),
        }
    }

    /// Like [`Txn::get`] but aborts with `NotFound` when the row is missing
    pub fn require<R: Record>(&self, key: &[u8], what: &str) -> TxResult<R> {
        match self.get(key)? {
            Some(record) => Ok(record),
            None => abort(ShardVaultError::NotFound(what.to_string())),
        }
    }

    pub fn contains(&self, key: &[u8]) -> TxResult<bool> {
        Ok(self.tree.get(key)?.is_some())
    }

    pub fn put<R: Record>(&self, record: &R) -> TxResult<()> {
        let bytes = encode(record).map_err(ConflictableTransactionError::Abort)?;
        self.tree.insert(record.key(), bytes)?;
        Ok(())
    }

    /// Insert a bare key (secondary index entry)
    pub fn put_marker(&self, key: Vec<u8>) -> TxResult<()> {
        self.tree.insert(key, Vec::<u8>::new())?;
        Ok(())
    }

    /// Delete a key; returns whether it existed
    pub fn delete(&self, key: &[u8]) -> TxResult<bool> {
        Ok(self.tree.remove(key)?.is_some())
    }

    /// Value of the counter at `key`, 0 when unset
    pub fn counter(&self, key: &[u8]) -> TxResult<u64> {
        Ok(decode_counter(self.tree.get(key)?.as_deref()))
    }

    /// Advance the counter at `key` and return its new value
    pub fn bump(&self, key: &[u8]) -> TxResult<u64> {
        let next = self.counter(key)? + 1;
        self.tree.insert(key, &next.to_be_bytes()[..])?;
        Ok(next)
    }
}

fn decode_counter(bytes: Option<&[u8]>) -> u64 {
    bytes
        .and_then(|b| <[u8; 8]>::try_from(b).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

/// Metadata store shared by every component of a node
pub struct MetadataStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl MetadataStore {
    /// Open (creating if needed) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let tree = db.open_tree(TREE_NAME)?;
        tracing::debug!("Opened metadata store at {}", path.as_ref().display());
        Ok(Self { db, tree })
    }

    /// In-memory store that vanishes on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { db, tree })
    }

    pub fn get<R: Record>(&self, key: &[u8]) -> Result<Option<R>> {
        match self.tree.get(key)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn require<R: Record>(&self, key: &[u8], what: &str) -> Result<R> {
        self.get(key)?
            .ok_or_else(|| ShardVaultError::NotFound(what.to_string()))
    }

    pub fn counter(&self, key: &[u8]) -> Result<u64> {
        Ok(decode_counter(self.tree.get(key)?.as_deref()))
    }

    /// All rows whose key starts with `prefix`, in key order
    pub fn scan<R: Record>(&self, prefix: &[u8]) -> Result<Vec<R>> {
        self.tree
            .scan_prefix(prefix)
            .map(|entry| {
                let (_, value) = entry?;
                decode(&value)
            })
            .collect()
    }

    /// Every row of a table
    pub fn scan_table<R: Record>(&self) -> Result<Vec<R>> {
        self.scan(&KeyBuilder::table(R::TABLE).build())
    }

    /// Keys under `prefix`, for secondary indexes
    pub fn scan_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.tree
            .scan_prefix(prefix)
            .keys()
            .map(|key| key.map(|k| k.to_vec()).map_err(ShardVaultError::from))
            .collect()
    }

    /// Run `f` atomically. It may be re-run on conflict, so it must not
    /// have side effects outside the transaction.
    ///
    /// Transactions hold the store exclusively while `f` runs: `f` must only
    /// read through its [`Txn`], never through `self`.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: Fn(&Txn<'_>) -> TxResult<T>,
    {
        self.tree
            .transaction(|tree| f(&Txn { tree }))
            .map_err(|e| match e {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => ShardVaultError::Store(err),
            })
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}
