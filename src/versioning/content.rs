//! Shard placement, upload and retrieval for one content blob

use crate::cluster::{select_replacement_servers, select_storage_servers, FragmentRouter};
use crate::crypto::Checksum;
use crate::metadata::{unix_now, Fragment, FragmentStatus, MetadataStore};
use crate::storage::{ContentKey, EncodedBlob, ErasureConfig, FragmentKey, ShardCodec, StorageError};
use crate::{Result, ShardVaultError};

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;

/// Shards gathered for a decode
#[derive(Debug, Default)]
pub struct FetchedShards {
    /// Indexed by fragment id; None where unavailable
    pub shards: Vec<Option<Vec<u8>>>,

    /// Fragments that could not be read or failed validation
    pub failures: Vec<(Fragment, String)>,
}

impl FetchedShards {
    pub fn available(&self) -> usize {
        self.shards.iter().filter(|s| s.is_some()).count()
    }
}

/// Moves encoded blobs between the codec and the cluster
#[derive(Clone)]
pub struct ContentIo {
    router: FragmentRouter,
    store: Arc<MetadataStore>,
    codec: Arc<dyn ShardCodec>,
}

impl ContentIo {
    pub fn new(router: FragmentRouter, store: Arc<MetadataStore>, codec: Arc<dyn ShardCodec>) -> Self {
        Self { router, store, codec }
    }

    pub fn router(&self) -> &FragmentRouter {
        &self.router
    }

    pub fn codec(&self) -> &dyn ShardCodec {
        self.codec.as_ref()
    }

    pub fn encode(&self, plaintext: &[u8], layout: ErasureConfig, key: &ContentKey) -> Result<EncodedBlob> {
        Ok(self.codec.encode(plaintext, layout, key)?)
    }

    /// Place every shard of `blob` and write it out.
    ///
    /// Returns one `Good` fragment row per shard, not yet persisted. If any
    /// write fails the shards already written are removed again.
    pub async fn store_blob(&self, data_id: &str, version_no: u64, blob: &EncodedBlob) -> Result<Vec<Fragment>> {
        let shard_size = blob.shards.first().map(|s| s.len() as u64).unwrap_or(0);
        let servers = self.store.online_servers()?;
        let targets = select_storage_servers(&servers, shard_size, blob.shards.len())?;

        let shards = blob
            .shards
            .iter()
            .enumerate()
            .map(|(index, shard)| (index as u32, shard.clone()))
            .collect();
        self.store_shards(data_id, version_no, blob.shards.len() as u32, shards, &targets)
            .await
    }

    /// Write selected shard indices of a blob onto fresh servers, avoiding
    /// the ones in `holders` where possible
    pub async fn store_replacements(
        &self,
        data_id: &str,
        version_no: u64,
        total_shards: u32,
        shards: Vec<(u32, Vec<u8>)>,
        holders: &HashSet<String>,
    ) -> Result<Vec<Fragment>> {
        let shard_size = shards.first().map(|(_, s)| s.len() as u64).unwrap_or(0);
        let servers = self.store.online_servers()?;
        let targets = select_replacement_servers(&servers, holders, shard_size, shards.len())?;
        self.store_shards(data_id, version_no, total_shards, shards, &targets)
            .await
    }

    async fn store_shards(
        &self,
        data_id: &str,
        version_no: u64,
        total_shards: u32,
        shards: Vec<(u32, Vec<u8>)>,
        targets: &[String],
    ) -> Result<Vec<Fragment>> {
        let writes = shards.into_iter().zip(targets.iter()).map(|((frag_id, shard), server)| {
            let key = FragmentKey::new(data_id, version_no, frag_id);
            async move {
                let result = self.router.put(server, &key, shard).await;
                (frag_id, server.clone(), result)
            }
        });

        let now = unix_now();
        let mut written = Vec::new();
        let mut first_error = None;
        for (frag_id, server, result) in join_all(writes).await {
            match result {
                Ok(path) => written.push(Fragment {
                    data_id: data_id.to_string(),
                    version_no,
                    frag_id,
                    server,
                    path,
                    last_checked: Some(now),
                    total_shards,
                    status: FragmentStatus::Good,
                }),
                Err(e) => {
                    tracing::warn!("Shard {} of {} to {} failed: {}", frag_id, data_id, server, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(error) = first_error {
            self.discard(&written).await;
            return Err(error);
        }
        written.sort_by_key(|f| f.frag_id);
        Ok(written)
    }

    /// Best-effort removal of shard bytes; returns how many were removed
    pub async fn discard(&self, fragments: &[Fragment]) -> usize {
        let deletes = fragments.iter().map(|fragment| async move {
            match self.router.delete(&fragment.server, &fragment.path).await {
                Ok(existed) => existed,
                Err(e) => {
                    tracing::warn!(
                        "Could not remove shard {} on {}: {}",
                        fragment.path,
                        fragment.server,
                        e
                    );
                    false
                }
            }
        });
        join_all(deletes).await.into_iter().filter(|removed| *removed).count()
    }

    /// Read and validate the given fragments of one blob
    pub async fn fetch(&self, fragments: &[Fragment], layout: ErasureConfig) -> FetchedShards {
        let mut fetched = FetchedShards {
            shards: vec![None; layout.total_shards()],
            failures: Vec::new(),
        };

        let reads = fragments.iter().map(|fragment| async move {
            let result = self.router.fetch(&fragment.server, &fragment.path, None).await;
            (fragment, result)
        });

        for (fragment, result) in join_all(reads).await {
            let index = fragment.frag_id as usize;
            let shard = match result {
                Ok(shard) => shard,
                Err(e) => {
                    fetched.failures.push((fragment.clone(), e.to_string()));
                    continue;
                }
            };
            match self.codec.inspect(&shard) {
                Ok(header) if header.index as usize == index && header.layout_matches(&layout) => {
                    if let Some(slot) = fetched.shards.get_mut(index) {
                        *slot = Some(shard);
                    }
                }
                Ok(_) => fetched
                    .failures
                    .push((fragment.clone(), "shard header does not match its row".into())),
                Err(e) => fetched.failures.push((fragment.clone(), e.to_string())),
            }
        }

        fetched
    }

    /// Decode `shards` and check the result against `checksum`
    pub fn decode_verified(
        &self,
        data_id: &str,
        shards: Vec<Option<Vec<u8>>>,
        layout: ErasureConfig,
        key: &ContentKey,
        checksum: Option<&Checksum>,
    ) -> Result<Vec<u8>> {
        let available = shards.iter().filter(|s| s.is_some()).count();
        let needed = layout.min_shards();
        if available < needed {
            return Err(ShardVaultError::ContentUnrecoverable {
                data_id: data_id.to_string(),
                good: available,
                needed,
            });
        }

        let plaintext = self.codec.decode(shards, layout, key)?;
        if let Some(expected) = checksum {
            if !expected.verify(&plaintext) {
                return Err(StorageError::IntegrityCheckFailed.into());
            }
        }
        Ok(plaintext)
    }
}
