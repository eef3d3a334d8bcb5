//! Retention sweep for superseded versions

use super::collector::GarbageCollector;
use crate::metadata::{File, FileStatus, FileVersion, Record};
use crate::{Result, ShardVaultError};

use std::collections::BTreeMap;

impl GarbageCollector {
    /// Release every non-current `Good` version last modified at least
    /// `window_secs` before `now`. A window of zero releases all of them.
    ///
    /// Returns how many versions were marked `ToBeDeleted`.
    pub fn mark_old_file_versions(&self, window_secs: i64, now: i64) -> Result<usize> {
        if window_secs < 0 {
            return Err(ShardVaultError::InvalidInput(format!(
                "retention window {} is negative",
                window_secs
            )));
        }
        let cutoff = now.saturating_sub(window_secs);

        let mut candidates: BTreeMap<String, Vec<Vec<u8>>> = BTreeMap::new();
        for version in self.store().all_versions()? {
            if version.status == FileStatus::Good && version.modified_at <= cutoff {
                candidates
                    .entry(version.file_id.clone())
                    .or_default()
                    .push(version.key());
            }
        }

        let mut marked = 0;
        for (file_id, keys) in &candidates {
            marked += self.store().transaction(|txn| {
                let file: File = match txn.get(&File::key_for(file_id))? {
                    Some(file) => file,
                    None => return Ok(0),
                };

                let mut marked = 0;
                for key in keys {
                    let mut version: FileVersion = match txn.get(key)? {
                        Some(version) => version,
                        None => continue,
                    };
                    if version.version_no == file.version_no || version.status != FileStatus::Good {
                        continue;
                    }
                    version.status = FileStatus::ToBeDeleted;
                    version.modified_at = now;
                    txn.save_version(&version)?;
                    marked += 1;
                }
                Ok(marked)
            })?;
        }

        if marked > 0 {
            tracing::info!("Retention released {} versions older than {}s", marked, window_secs);
        }
        Ok(marked)
    }
}

#[cfg(test)]
mod tests {
    use crate::metadata::{unix_now, FileStatus, VersioningMode};
    use crate::testing::{TestCluster, ADMIN};
    use crate::versioning::NewFileOptions;
    use crate::ErrorKind;

    #[tokio::test]
    async fn test_window_keeps_recent_versions() {
        let cluster = TestCluster::new(3).await;
        let files = cluster.files(0);
        let options = NewFileOptions {
            versioning: VersioningMode::KeepAll,
            ..Default::default()
        };
        let file = files
            .write_file(ADMIN, &cluster.root_id(), "log", b"v1", options)
            .await
            .unwrap();
        files.update_file(ADMIN, &file.id, b"v2", None).await.unwrap();
        files.update_file(ADMIN, &file.id, b"v3", None).await.unwrap();

        let collector = cluster.collector(0);
        assert_eq!(collector.mark_old_file_versions(3_600, unix_now()).unwrap(), 0);

        // an hour later both superseded versions are due, the current one never
        assert_eq!(collector.mark_old_file_versions(3_600, unix_now() + 3_600).unwrap(), 2);
        let statuses: Vec<FileStatus> = cluster
            .store
            .versions(&file.id)
            .unwrap()
            .iter()
            .map(|v| v.status)
            .collect();
        assert_eq!(
            statuses,
            vec![FileStatus::ToBeDeleted, FileStatus::ToBeDeleted, FileStatus::Good]
        );

        assert_eq!(collector.mark_old_file_versions(0, unix_now()).unwrap(), 0);
        assert_eq!(
            collector.mark_old_file_versions(-1, unix_now()).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }
}
