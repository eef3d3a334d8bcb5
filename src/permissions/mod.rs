//! Permissions Module - ACL resolution and inheritance
//!
//! A principal (a user, or a group the user belongs to directly or through
//! a role mapping) holds a capability on a file when one active row on
//! that file carries all requested bits. Children start with a copy of
//! their parent's rows and may never be granted more than the parent
//! allows the same principal.

mod engine;
mod principals;

pub use crate::metadata::{Capabilities, Permission, PermissionStatus, Principal};
pub use engine::PermissionEngine;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        unix_now, BootstrapOptions, EntryType, File, FileStatus, MetadataStore, VersioningMode,
    };
    use crate::storage::ErasureConfig;
    use crate::ErrorKind;
    use std::sync::Arc;

    struct Fixture {
        engine: PermissionEngine,
        root: String,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MetadataStore::temporary().unwrap());
        let report = store.bootstrap(&BootstrapOptions::default(), 0).unwrap();
        let engine = PermissionEngine::new(store);
        engine.create_user("admin", "alice", false, vec![]).unwrap();
        engine.create_user("admin", "bob", false, vec!["staff".into()]).unwrap();
        Fixture {
            engine,
            root: report.settings.root_id,
        }
    }

    fn add_folder(engine: &PermissionEngine, id: &str, parent: &str) {
        let now = unix_now();
        let folder = File {
            id: id.into(),
            name: id.into(),
            entry_type: EntryType::Folder,
            parent_id: Some(parent.into()),
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
            handled_by: String::new(),
            created_at: now,
            modified_at: now,
        };
        let inherited = engine.inherited_permissions(parent, id, now).unwrap();
        engine
            .store()
            .transaction(|txn| {
                txn.save_file(&folder)?;
                for row in &inherited {
                    txn.save_permission(row)?;
                }
                Ok(())
            })
            .unwrap();
    }

    fn alice() -> Principal {
        Principal::User("alice".into())
    }

    #[test]
    fn test_super_user_passes_every_check() {
        let f = fixture();
        assert!(f
            .engine
            .has_permission(&Principal::User("admin".into()), &f.root, Capabilities::ALL)
            .unwrap());
        assert!(!f.engine.has_permission(&alice(), &f.root, Capabilities::READ).unwrap());
    }

    #[test]
    fn test_children_inherit_and_cannot_widen() {
        let f = fixture();
        f.engine
            .upsert_permission("admin", &f.root, &alice(), Capabilities::READ_WRITE)
            .unwrap();
        add_folder(&f.engine, "docs", &f.root);

        // inherited at creation
        assert_eq!(
            f.engine.effective_capabilities(&alice(), "docs").unwrap(),
            Capabilities::READ_WRITE
        );

        // narrowing a child is allowed
        f.engine
            .upsert_permission("admin", "docs", &alice(), Capabilities::READ)
            .unwrap();
        assert_eq!(
            f.engine.effective_capabilities(&alice(), "docs").unwrap(),
            Capabilities::READ
        );

        // widening beyond the parent is refused
        let err = f
            .engine
            .upsert_permission("admin", "docs", &alice(), Capabilities::ALL)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(
            f.engine.effective_capabilities(&alice(), "docs").unwrap(),
            Capabilities::READ
        );
    }

    #[test]
    fn test_group_and_role_membership() {
        let f = fixture();
        f.engine.create_group("admin", "editors").unwrap();
        f.engine.create_group("admin", "staff-group").unwrap();
        f.engine.add_user_to_group("admin", "editors", "alice").unwrap();
        f.engine.map_role_to_group("admin", "staff", "staff-group").unwrap();

        f.engine
            .upsert_permission("admin", &f.root, &Principal::Group("editors".into()), Capabilities::WRITE)
            .unwrap();
        f.engine
            .upsert_permission("admin", &f.root, &Principal::Group("staff-group".into()), Capabilities::READ)
            .unwrap();

        assert!(f.engine.has_permission(&alice(), &f.root, Capabilities::WRITE).unwrap());
        assert!(!f.engine.has_permission(&alice(), &f.root, Capabilities::READ).unwrap());

        let bob = Principal::User("bob".into());
        assert!(f.engine.has_permission(&bob, &f.root, Capabilities::READ).unwrap());
        assert!(!f.engine.has_permission(&bob, &f.root, Capabilities::WRITE).unwrap());

        // one row must carry every requested bit
        assert!(!f.engine.has_permission(&alice(), &f.root, Capabilities::READ_WRITE).unwrap());
    }

    #[test]
    fn test_delete_group_cascades() {
        let f = fixture();
        f.engine.create_group("admin", "editors").unwrap();
        f.engine.add_user_to_group("admin", "editors", "alice").unwrap();
        f.engine
            .upsert_permission("admin", &f.root, &Principal::Group("editors".into()), Capabilities::READ)
            .unwrap();
        assert!(f.engine.has_permission(&alice(), &f.root, Capabilities::READ).unwrap());

        assert_eq!(f.engine.delete_group("admin", "editors").unwrap(), 1);

        assert!(!f.engine.has_permission(&alice(), &f.root, Capabilities::READ).unwrap());
        assert!(f.engine.store().direct_groups_of("alice").unwrap().is_empty());
        assert!(f.engine.store().find_group("editors").unwrap().is_none());
    }

    #[test]
    fn test_group_deletion_catches_rows_written_meanwhile() {
        let f = fixture();
        let editors = Principal::Group("editors".into());
        f.engine.create_group("admin", "editors").unwrap();
        f.engine
            .upsert_permission("admin", &f.root, &editors, Capabilities::READ)
            .unwrap();

        let plan = f.engine.plan_group_deletion("editors").unwrap();
        // a new folder copies the group's row after the rows were collected
        add_folder(&f.engine, "docs", &f.root);
        assert!(!f.engine.apply_group_deletion(&plan).unwrap());
        assert!(f.engine.store().find_group("editors").unwrap().is_some());

        assert_eq!(f.engine.delete_group("admin", "editors").unwrap(), 2);
        let left = f.engine.store().all_permissions().unwrap();
        assert!(left.iter().all(|p| p.principal != editors));
    }

    #[test]
    fn test_rows_of_a_deleted_group_are_not_written() {
        let f = fixture();
        let editors = Principal::Group("editors".into());
        f.engine.create_group("admin", "editors").unwrap();
        f.engine
            .upsert_permission("admin", &f.root, &editors, Capabilities::READ)
            .unwrap();
        let inherited = f.engine.inherited_permissions(&f.root, "late", unix_now()).unwrap();
        assert_eq!(inherited.len(), 2);

        f.engine.delete_group("admin", "editors").unwrap();
        let saved = f
            .engine
            .store()
            .transaction(|txn| {
                let mut saved = 0;
                for row in &inherited {
                    if txn.save_permission(row)? {
                        saved += 1;
                    }
                }
                Ok(saved)
            })
            .unwrap();
        assert_eq!(saved, 1);
        assert!(f.engine.store().permissions_of("late").unwrap().iter().all(|p| p.principal != editors));
    }

    #[test]
    fn test_grant_is_rechecked_when_the_parent_narrows() {
        let f = fixture();
        f.engine
            .upsert_permission("admin", &f.root, &alice(), Capabilities::READ_WRITE)
            .unwrap();
        add_folder(&f.engine, "docs", &f.root);

        let plan = f.engine.plan_grant("docs", &alice(), Capabilities::READ_WRITE).unwrap();
        f.engine
            .upsert_permission("admin", &f.root, &alice(), Capabilities::READ)
            .unwrap();
        assert!(!f.engine.apply_grant(&plan).unwrap());

        let err = f
            .engine
            .upsert_permission("admin", "docs", &alice(), Capabilities::READ_WRITE)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        f.engine
            .upsert_permission("admin", "docs", &alice(), Capabilities::READ)
            .unwrap();
        assert_eq!(
            f.engine.effective_capabilities(&alice(), "docs").unwrap(),
            Capabilities::READ
        );
    }

    #[test]
    fn test_remove_permission_is_soft() {
        let f = fixture();
        f.engine
            .upsert_permission("admin", &f.root, &alice(), Capabilities::READ)
            .unwrap();
        assert_eq!(f.engine.remove_permission("admin", &f.root, &alice()).unwrap(), 1);

        assert!(!f.engine.has_permission(&alice(), &f.root, Capabilities::READ).unwrap());
        let rows = f.engine.store().permissions_of(&f.root).unwrap();
        assert!(rows
            .iter()
            .any(|p| p.principal == alice() && p.status == PermissionStatus::Removed));

        let again = f.engine.remove_permission("admin", &f.root, &alice());
        assert_eq!(again.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_narrowing_is_explicit() {
        let f = fixture();
        f.engine
            .upsert_permission("admin", &f.root, &alice(), Capabilities::READ_WRITE)
            .unwrap();
        add_folder(&f.engine, "a", &f.root);
        add_folder(&f.engine, "b", "a");

        // narrowing the parent leaves children untouched
        f.engine
            .upsert_permission("admin", "a", &alice(), Capabilities::READ)
            .unwrap();
        assert_eq!(
            f.engine.effective_capabilities(&alice(), "b").unwrap(),
            Capabilities::READ_WRITE
        );
        assert_eq!(f.engine.narrowing_violations().unwrap().len(), 1);

        assert_eq!(f.engine.narrow_subtree("admin", "a", &alice()).unwrap(), 1);
        assert_eq!(
            f.engine.effective_capabilities(&alice(), "b").unwrap(),
            Capabilities::READ
        );
        assert!(f.engine.narrowing_violations().unwrap().is_empty());
    }

    #[test]
    fn test_non_super_cannot_administer() {
        let f = fixture();
        let err = f.engine.create_group("alice", "mine").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let err = f
            .engine
            .upsert_permission("alice", &f.root, &alice(), Capabilities::READ)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }
}
