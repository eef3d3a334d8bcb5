//! Rebuilding lost shards from the surviving ones

use crate::metadata::{unix_now, FileStatus, FileVersion, Fragment, FragmentStatus, Record};
use crate::storage::ContentKey;
use crate::versioning::{resolve_data_key, FileManager};
use crate::{Result, ShardVaultError};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    pub data_id: String,

    /// Shards that decoded cleanly before the repair
    pub good_before: usize,

    /// Shard indices written anew
    pub restored: Vec<u32>,

    /// Servers now holding the restored shards, in `restored` order
    pub targets: Vec<String>,
}

/// Restores missing or broken shards of live content
#[derive(Clone)]
pub struct Repairer {
    files: FileManager,
}

impl Repairer {
    pub fn new(files: FileManager) -> Self {
        Self { files }
    }

    /// Live versions pointing at `data_id`
    fn live_versions(&self, data_id: &str) -> Result<Vec<FileVersion>> {
        let live: Vec<FileVersion> = self
            .files
            .store()
            .versions_referencing(data_id)?
            .into_iter()
            .filter(|v| v.status == FileStatus::Good)
            .collect();
        if live.is_empty() {
            return Err(ShardVaultError::not_found("live content", data_id));
        }
        Ok(live)
    }

    /// Rebuild every shard of `data_id` that is missing, unreadable or
    /// marked bad.
    ///
    /// Needs at least `max(data_shards, key_threshold)` good shards, else
    /// fails with `ContentUnrecoverable`. The content key of a
    /// password-sealed blob is only released with its password.
    pub async fn repair_data(&self, data_id: &str, password: Option<&str>) -> Result<RepairReport> {
        let live = self.live_versions(data_id)?;
        let reference = &live[0];
        let layout = reference.layout;
        let needed = layout.min_shards();
        let store = self.files.store();
        let content = self.files.content();

        let fragments: Vec<Fragment> = store
            .fragments_of(data_id)?
            .into_iter()
            .filter(|f| f.version_no == reference.data_version)
            .collect();
        let good: Vec<Fragment> = fragments
            .iter()
            .filter(|f| f.status == FragmentStatus::Good)
            .cloned()
            .collect();

        let fetched = content.fetch(&good, layout).await;
        for (fragment, error) in &fetched.failures {
            tracing::warn!(
                "Shard {} of {} on {} is unusable: {}",
                fragment.frag_id,
                data_id,
                fragment.server,
                error
            );
        }
        let good_before = fetched.available();
        if good_before < needed {
            return Err(ShardVaultError::ContentUnrecoverable {
                data_id: data_id.to_string(),
                good: good_before,
                needed,
            });
        }

        let missing: Vec<u32> = fetched
            .shards
            .iter()
            .enumerate()
            .filter(|(_, shard)| shard.is_none())
            .map(|(index, _)| index as u32)
            .collect();
        if missing.is_empty() {
            tracing::debug!("Data {} has all {} shards", data_id, layout.total_shards());
            return Ok(RepairReport {
                data_id: data_id.to_string(),
                good_before,
                ..Default::default()
            });
        }

        let file_ids: Vec<String> = live.iter().map(|v| v.file_id.clone()).collect();
        let key = ContentKey::new(resolve_data_key(store, &file_ids, password)?, reference.iv);

        let plaintext = content.decode_verified(
            data_id,
            fetched.shards.clone(),
            layout,
            &key,
            reference.checksum.as_ref(),
        )?;
        let blob = content.encode(&plaintext, layout, &key)?;

        let holders: HashSet<String> = fetched
            .shards
            .iter()
            .zip(0u32..)
            .filter(|(shard, _)| shard.is_some())
            .filter_map(|(_, index)| good.iter().find(|f| f.frag_id == index))
            .map(|f| f.server.clone())
            .collect();
        let wanted: BTreeSet<u32> = missing.iter().copied().collect();
        let shards: Vec<(u32, Vec<u8>)> = blob
            .shards
            .into_iter()
            .zip(0u32..)
            .filter(|(_, index)| wanted.contains(index))
            .map(|(shard, index)| (index, shard))
            .collect();

        let replacements = content
            .store_replacements(
                data_id,
                reference.data_version,
                layout.total_shards() as u32,
                shards,
                &holders,
            )
            .await?;

        let superseded: Vec<Fragment> = fragments
            .iter()
            .filter(|old| {
                replacements
                    .iter()
                    .any(|new| new.frag_id == old.frag_id && (new.server != old.server || new.path != old.path))
            })
            .cloned()
            .collect();

        let committed = store.transaction(|txn| {
            for fragment in &replacements {
                txn.put(fragment)?;
            }
            Ok(())
        });
        if let Err(e) = committed {
            content.discard(&replacements).await;
            return Err(e);
        }

        // leftovers of replaced rows are unreferenced now
        if !superseded.is_empty() {
            let reachable: Vec<Fragment> = superseded
                .into_iter()
                .filter(|old| {
                    store
                        .server(&old.server)
                        .map(|s| s.is_online())
                        .unwrap_or(false)
                })
                .collect();
            content.discard(&reachable).await;
        }

        tracing::info!("Repaired {} shards of {}", replacements.len(), data_id);
        Ok(RepairReport {
            data_id: data_id.to_string(),
            good_before,
            restored: replacements.iter().map(|f| f.frag_id).collect(),
            targets: replacements.iter().map(|f| f.server.clone()).collect(),
        })
    }

    /// Flag a fragment row as `Bad` unless it was replaced meanwhile
    pub fn mark_bad(&self, fragment: &Fragment) -> Result<bool> {
        let now = unix_now();
        self.files.store().transaction(|txn| {
            let mut row: Fragment = match txn.get(&fragment.key())? {
                Some(row) => row,
                None => return Ok(false),
            };
            if row.server != fragment.server || row.path != fragment.path {
                return Ok(false);
            }
            row.status = FragmentStatus::Bad;
            row.last_checked = Some(now);
            txn.put(&row)?;
            Ok(true)
        })
    }
}
