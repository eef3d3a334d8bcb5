//! First-run seeding of an empty metadata store

use super::entities::*;
use super::store::MetadataStore;
use crate::crypto::random_32_bytes;
use crate::storage::ErasureConfig;
use crate::Result;

/// Default retention window for superseded versions (30 days)
pub const DEFAULT_RETENTION_SECS: i64 = 30 * 24 * 3600;

pub const ROOT_FOLDER_NAME: &str = "/";

#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub super_user: String,

    /// Requested erasure parameters; clamped before use
    pub layout: ErasureConfig,

    pub retention_secs: i64,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            super_user: "admin".to_string(),
            layout: ErasureConfig::default(),
            retention_secs: DEFAULT_RETENTION_SECS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapReport {
    pub settings: ClusterSettings,

    /// False when the store was already seeded
    pub created: bool,

    /// Non-fatal corrections applied to the requested parameters
    pub config_errors: Vec<String>,
}

impl MetadataStore {
    /// Seed the root folder, super-user, system key and erasure defaults.
    ///
    /// Running it again on a seeded store changes nothing.
    pub fn bootstrap(&self, options: &BootstrapOptions, now: i64) -> Result<BootstrapReport> {
        super::store::validate_name("super-user name", &options.super_user)?;

        let (layout, mut config_errors) = options.layout.clamped();
        let retention_secs = if options.retention_secs < 0 {
            config_errors.push(format!(
                "retention {} is negative, using {}",
                options.retention_secs, DEFAULT_RETENTION_SECS
            ));
            DEFAULT_RETENTION_SECS
        } else {
            options.retention_secs
        };
        for error in &config_errors {
            tracing::warn!("Bootstrap configuration: {}", error);
        }

        let root_id = super::new_id();
        let permission_id = super::new_id();
        let system_key = random_32_bytes();

        let (settings, created) = self.transaction(|txn| {
            if let Some(existing) = txn.get::<ClusterSettings>(&ClusterSettings::key_for())? {
                return Ok((existing, false));
            }

            let settings = ClusterSettings {
                layout,
                retention_secs,
                system_key,
                root_id: root_id.clone(),
                super_user: options.super_user.clone(),
                created_at: now,
            };

            let root = File {
                id: root_id.clone(),
                name: ROOT_FOLDER_NAME.to_string(),
                entry_type: EntryType::Folder,
                parent_id: None,
                version_no: 1,
                data_id: None,
                data_version: 0,
                size: 0,
                actual_size: 0,
                versioning: VersioningMode::Off,
                checksum: None,
                layout,
                iv: [0; 12],
                password_protected: false,
                status: FileStatus::Good,
                owner: options.super_user.clone(),
                handled_by: String::new(),
                created_at: now,
                modified_at: now,
            };

            let super_user = User {
                name: options.super_user.clone(),
                is_super: true,
                roles: Vec::new(),
                created_at: now,
            };

            let grant = Permission {
                file_id: root_id.clone(),
                permission_id: permission_id.clone(),
                principal: Principal::User(options.super_user.clone()),
                capabilities: Capabilities::ALL,
                status: PermissionStatus::Active,
                created_at: now,
                modified_at: now,
            };

            txn.save_file(&root)?;
            txn.save_version(&FileVersion::from_file(&root, None))?;
            txn.put(&super_user)?;
            txn.save_permission(&grant)?;
            txn.put(&settings)?;
            Ok((settings, true))
        })?;

        if created {
            tracing::info!(
                "Bootstrapped cluster: root {}, super-user {}, layout {}+{} (threshold {})",
                settings.root_id,
                settings.super_user,
                settings.layout.data_shards,
                settings.layout.parity_shards,
                settings.layout.key_threshold
            );
        }

        Ok(BootstrapReport {
            settings,
            created,
            config_errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_seeds_once() {
        let store = MetadataStore::temporary().unwrap();
        let first = store.bootstrap(&BootstrapOptions::default(), 100).unwrap();
        assert!(first.created);
        assert!(first.config_errors.is_empty());

        let root = store.file(&first.settings.root_id).unwrap();
        assert!(root.is_folder());
        assert_eq!(store.versions(&root.id).unwrap().len(), 1);
        assert!(store.user("admin").unwrap().is_super);
        assert_eq!(
            store.permissions_of(&root.id).unwrap()[0].capabilities,
            Capabilities::ALL
        );

        let second = store.bootstrap(&BootstrapOptions::default(), 200).unwrap();
        assert!(!second.created);
        assert_eq!(second.settings, first.settings);
        assert_eq!(store.all_files().unwrap().len(), 1);
    }

    #[test]
    fn test_bootstrap_clamps_layout() {
        let store = MetadataStore::temporary().unwrap();
        let options = BootstrapOptions {
            layout: ErasureConfig::new(12, 2, 3),
            ..Default::default()
        };

        let report = store.bootstrap(&options, 0).unwrap();
        assert_eq!(report.settings.layout, ErasureConfig::new(3, 2, 3));
        assert_eq!(report.config_errors.len(), 1);
    }
}
