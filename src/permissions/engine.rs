//! Permission checks, inheritance and the narrowing rule

use crate::metadata::{
    abort, unix_now, Capabilities, File, MetadataStore, Permission, PermissionStatus, Principal,
    Record, User,
};
use crate::{Result, ShardVaultError};

use std::collections::HashSet;
use std::sync::Arc;

/// Resolves and mutates ACLs on top of the metadata store
#[derive(Clone)]
pub struct PermissionEngine {
    store: Arc<MetadataStore>,
}

impl PermissionEngine {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// Groups `user` belongs to, directly or through role mappings
    pub fn groups_of(&self, user: &User) -> Result<HashSet<String>> {
        let mut groups: HashSet<String> = self.store.direct_groups_of(&user.name)?.into_iter().collect();
        for role in &user.roles {
            for mapping in self.store.role_groups(role)? {
                if self.store.find_group(&mapping.group)?.is_some() {
                    groups.insert(mapping.group);
                }
            }
        }
        Ok(groups)
    }

    /// Resolve which rows apply to `principal`
    fn matcher(&self, principal: &Principal) -> Result<Matcher> {
        match principal {
            Principal::User(name) => {
                let user = self.store.user(name)?;
                let groups = self.groups_of(&user)?;
                Ok(Matcher {
                    user: Some(user.name),
                    groups,
                    is_super: user.is_super,
                })
            }
            Principal::Group(name) => Ok(Matcher {
                user: None,
                groups: std::iter::once(name.clone()).collect(),
                is_super: false,
            }),
        }
    }

    fn active_rows_for(&self, file_id: &str, matcher: &Matcher) -> Result<Vec<Permission>> {
        Ok(self
            .store
            .permissions_of(file_id)?
            .into_iter()
            .filter(|p| p.is_active() && matcher.matches(&p.principal))
            .collect())
    }

    /// Granted iff one applicable row carries every requested bit
    pub fn has_permission(&self, principal: &Principal, file_id: &str, needed: Capabilities) -> Result<bool> {
        let matcher = self.matcher(principal)?;
        if matcher.is_super {
            return Ok(true);
        }
        Ok(self
            .active_rows_for(file_id, &matcher)?
            .iter()
            .any(|p| needed.is_subset(&p.capabilities)))
    }

    /// Fail with `PermissionDenied` unless `user` holds `needed` on `file_id`
    pub fn check(&self, user: &str, file_id: &str, needed: Capabilities) -> Result<()> {
        if self.has_permission(&Principal::User(user.to_string()), file_id, needed)? {
            Ok(())
        } else {
            Err(ShardVaultError::PermissionDenied(format!(
                "{} lacks {} on {}",
                user, needed, file_id
            )))
        }
    }

    /// Union of every applicable row on `file_id`
    pub fn effective_capabilities(&self, principal: &Principal, file_id: &str) -> Result<Capabilities> {
        let matcher = self.matcher(principal)?;
        if matcher.is_super {
            return Ok(Capabilities::ALL);
        }
        Ok(self
            .active_rows_for(file_id, &matcher)?
            .iter()
            .fold(Capabilities::NONE, |acc, p| acc.union(&p.capabilities)))
    }

    /// Rows a new child of `parent_id` starts with: a copy of the parent's
    /// active rows. Written by the caller inside its creating transaction.
    pub fn inherited_permissions(&self, parent_id: &str, new_file_id: &str, now: i64) -> Result<Vec<Permission>> {
        Ok(self
            .store
            .permissions_of(parent_id)?
            .into_iter()
            .filter(Permission::is_active)
            .map(|p| Permission {
                file_id: new_file_id.to_string(),
                permission_id: crate::metadata::new_id(),
                principal: p.principal,
                capabilities: p.capabilities,
                status: PermissionStatus::Active,
                created_at: now,
                modified_at: now,
            })
            .collect())
    }

    /// Create the inherited rows for an existing file in their own transaction
    pub fn create_inherited_permissions(&self, parent_id: &str, new_file_id: &str) -> Result<usize> {
        let rows = self.inherited_permissions(parent_id, new_file_id, unix_now())?;
        self.store.transaction(|txn| {
            let mut saved = 0;
            for row in &rows {
                if txn.save_permission(row)? {
                    saved += 1;
                }
            }
            Ok(saved)
        })
    }

    /// Most the parent allows `principal`, or None for the root
    fn parent_ceiling(&self, file: &File, principal: &Principal) -> Result<Option<Capabilities>> {
        match &file.parent_id {
            Some(parent_id) => Ok(Some(self.effective_capabilities(principal, parent_id)?)),
            None => Ok(None),
        }
    }

    /// Grant `capabilities` to `principal` on `file_id`, replacing its existing row.
    ///
    /// The actor needs `share` on the file. A grant exceeding what the
    /// parent folder allows the same principal is refused.
    pub fn upsert_permission(
        &self,
        actor: &str,
        file_id: &str,
        principal: &Principal,
        capabilities: Capabilities,
    ) -> Result<Permission> {
        self.check(actor, file_id, Capabilities::SHARE)?;

        loop {
            let plan = self.plan_grant(file_id, principal, capabilities)?;
            if self.apply_grant(&plan)? {
                tracing::debug!("Granted {} to {} on {}", capabilities, principal, file_id);
                return Ok(plan.permission);
            }
            tracing::debug!("Permissions around {} changed while granting, checking again", file_id);
        }
    }

    /// Check a grant against the parent's ceiling and note the revisions
    /// the check relied on
    pub(crate) fn plan_grant(
        &self,
        file_id: &str,
        principal: &Principal,
        capabilities: Capabilities,
    ) -> Result<GrantPlan> {
        let file = self.store.file(file_id)?;
        self.ensure_principal_exists(principal)?;

        let parent_revision = match &file.parent_id {
            Some(parent_id) => self.store.permission_revision(parent_id)?,
            None => 0,
        };
        let revision = self.store.permission_revision(file_id)?;

        if let Some(ceiling) = self.parent_ceiling(&file, principal)? {
            if !capabilities.is_subset(&ceiling) {
                return Err(ShardVaultError::PermissionDenied(format!(
                    "grant {} to {} on {} is wider than its parent allows ({})",
                    capabilities, principal, file_id, ceiling
                )));
            }
        }

        let replaced = self
            .store
            .permissions_of(file_id)?
            .into_iter()
            .filter(|p| p.is_active() && &p.principal == principal)
            .map(|p| p.key())
            .collect();
        let now = unix_now();
        Ok(GrantPlan {
            permission: Permission {
                file_id: file_id.to_string(),
                permission_id: crate::metadata::new_id(),
                principal: principal.clone(),
                capabilities,
                status: PermissionStatus::Active,
                created_at: now,
                modified_at: now,
            },
            parent_id: file.parent_id,
            parent_revision,
            revision,
            replaced,
        })
    }

    /// Write a planned grant. Returns false, writing nothing, when the file
    /// moved or its or its parent's rows changed since the plan was made.
    pub(crate) fn apply_grant(&self, plan: &GrantPlan) -> Result<bool> {
        let file_id = &plan.permission.file_id;
        self.store.transaction(|txn| {
            let file = match txn.get::<File>(&File::key_for(file_id))? {
                Some(file) => file,
                None => return abort(ShardVaultError::not_found("file", file_id)),
            };
            if file.parent_id != plan.parent_id {
                return Ok(false);
            }
            if let Some(parent_id) = &plan.parent_id {
                if txn.permission_revision(parent_id)? != plan.parent_revision {
                    return Ok(false);
                }
            }
            if txn.permission_revision(file_id)? != plan.revision {
                return Ok(false);
            }

            for key in &plan.replaced {
                txn.delete(key)?;
            }
            if !txn.save_permission(&plan.permission)? {
                return abort(ShardVaultError::not_found("principal", &plan.permission.principal));
            }
            Ok(true)
        })
    }

    /// Soft-delete every active row of `principal` on `file_id`
    pub fn remove_permission(&self, actor: &str, file_id: &str, principal: &Principal) -> Result<usize> {
        self.check(actor, file_id, Capabilities::SHARE)?;

        let rows: Vec<Permission> = self
            .store
            .permissions_of(file_id)?
            .into_iter()
            .filter(|p| p.is_active() && &p.principal == principal)
            .collect();
        if rows.is_empty() {
            return Err(ShardVaultError::NotFound(format!(
                "permission for {} on {}",
                principal, file_id
            )));
        }

        let now = unix_now();
        self.store.transaction(|txn| {
            for row in &rows {
                let mut removed = row.clone();
                removed.status = PermissionStatus::Removed;
                removed.modified_at = now;
                txn.save_permission(&removed)?;
            }
            Ok(())
        })?;

        Ok(rows.len())
    }

    /// Explicitly push a narrowed parent grant down a subtree.
    ///
    /// Every row of `principal` below `folder_id` is intersected with what
    /// its own parent allows, top-down. Returns how many rows changed.
    pub fn narrow_subtree(&self, actor: &str, folder_id: &str, principal: &Principal) -> Result<usize> {
        self.check(actor, folder_id, Capabilities::SHARE)?;

        let ids = self.store.subtree_ids(folder_id)?;
        let mut changed = 0;
        let now = unix_now();

        // parents precede children in `ids`, so each ceiling is already narrowed
        for id in ids.iter().skip(1) {
            let file = self.store.file(id)?;
            let ceiling = match self.parent_ceiling(&file, principal)? {
                Some(ceiling) => ceiling,
                None => continue,
            };

            let updates: Vec<Permission> = self
                .store
                .permissions_of(id)?
                .into_iter()
                .filter(|p| p.is_active() && &p.principal == principal)
                .filter(|p| !p.capabilities.is_subset(&ceiling))
                .map(|mut p| {
                    p.capabilities = p.capabilities.intersection(&ceiling);
                    p.modified_at = now;
                    p
                })
                .collect();

            if updates.is_empty() {
                continue;
            }
            self.store.transaction(|txn| {
                for row in &updates {
                    txn.save_permission(row)?;
                }
                Ok(())
            })?;
            changed += updates.len();
        }

        if changed > 0 {
            tracing::info!(
                "Narrowed {} permission rows of {} below {}",
                changed,
                principal,
                folder_id
            );
        }
        Ok(changed)
    }

    /// Rows whose grant exceeds what the parent currently allows
    pub fn narrowing_violations(&self) -> Result<Vec<(Permission, Capabilities)>> {
        let mut violations = Vec::new();
        for file in self.store.all_files()? {
            if !file.is_live() {
                continue;
            }
            for row in self.store.permissions_of(&file.id)? {
                if !row.is_active() {
                    continue;
                }
                if let Some(ceiling) = self.parent_ceiling(&file, &row.principal)? {
                    if !row.capabilities.is_subset(&ceiling) {
                        violations.push((row, ceiling));
                    }
                }
            }
        }
        Ok(violations)
    }

    fn ensure_principal_exists(&self, principal: &Principal) -> Result<()> {
        match principal {
            Principal::User(name) => self.store.user(name).map(|_| ()),
            Principal::Group(name) => self.store.group(name).map(|_| ()),
        }
    }
}

/// A grant checked against the rows around its file
pub(crate) struct GrantPlan {
    permission: Permission,
    parent_id: Option<String>,
    parent_revision: u64,
    revision: u64,
    replaced: Vec<Vec<u8>>,
}

/// Which permission rows apply to a principal
struct Matcher {
    user: Option<String>,
    groups: HashSet<String>,
    is_super: bool,
}

impl Matcher {
    fn matches(&self, principal: &Principal) -> bool {
        match principal {
            Principal::User(name) => self.user.as_deref() == Some(name.as_str()),
            Principal::Group(name) => self.groups.contains(name),
        }
    }
}
