//! User and group administration

use super::PermissionEngine;
use crate::metadata::{
    abort, unix_now, validate_name, Group, GroupMember, Permission, Principal, Record, RoleGroup,
    User,
};
use crate::{Result, ShardVaultError};

impl PermissionEngine {
    fn require_super(&self, actor: &str) -> Result<()> {
        if self.store().user(actor)?.is_super {
            Ok(())
        } else {
            Err(ShardVaultError::PermissionDenied(format!(
                "{} is not a super-user",
                actor
            )))
        }
    }

    pub fn create_user(&self, actor: &str, name: &str, is_super: bool, roles: Vec<String>) -> Result<User> {
        self.require_super(actor)?;
        validate_name("user name", name)?;

        let user = User {
            name: name.to_string(),
            is_super,
            roles,
            created_at: unix_now(),
        };
        self.store().transaction(|txn| {
            if txn.contains(&user.key())? {
                return abort(ShardVaultError::Conflict(format!("user {} exists", user.name)));
            }
            txn.put(&user)
        })?;

        tracing::info!("Created user {}", name);
        Ok(user)
    }

    pub fn create_group(&self, actor: &str, name: &str) -> Result<Group> {
        self.require_super(actor)?;
        validate_name("group name", name)?;

        let group = Group {
            name: name.to_string(),
            created_at: unix_now(),
        };
        self.store().transaction(|txn| {
            if txn.contains(&group.key())? {
                return abort(ShardVaultError::Conflict(format!("group {} exists", group.name)));
            }
            txn.put(&group)
        })?;

        tracing::info!("Created group {}", name);
        Ok(group)
    }

    pub fn add_user_to_group(&self, actor: &str, group: &str, user: &str) -> Result<()> {
        self.require_super(actor)?;
        let member = GroupMember {
            group: group.to_string(),
            user: user.to_string(),
        };

        self.store().transaction(|txn| {
            txn.require::<Group>(&Group::key_for(group), "group")?;
            txn.require::<User>(&User::key_for(user), "user")?;
            txn.add_group_member(&member)
        })
    }

    pub fn remove_user_from_group(&self, actor: &str, group: &str, user: &str) -> Result<()> {
        self.require_super(actor)?;
        let removed = self
            .store()
            .transaction(|txn| txn.remove_group_member(group, user))?;
        if !removed {
            return Err(ShardVaultError::NotFound(format!(
                "membership of {} in {}",
                user, group
            )));
        }
        Ok(())
    }

    /// Users holding `role` become members of `group`
    pub fn map_role_to_group(&self, actor: &str, role: &str, group: &str) -> Result<()> {
        self.require_super(actor)?;
        validate_name("role", role)?;
        let mapping = RoleGroup {
            role: role.to_string(),
            group: group.to_string(),
        };

        self.store().transaction(|txn| {
            txn.require::<Group>(&Group::key_for(group), "group")?;
            txn.bump_group_revision(group)?;
            txn.put(&mapping)
        })
    }

    /// Remove a group with its permission rows, memberships and role mappings,
    /// all in one transaction
    pub fn delete_group(&self, actor: &str, name: &str) -> Result<usize> {
        self.require_super(actor)?;

        loop {
            let plan = self.plan_group_deletion(name)?;
            if self.apply_group_deletion(&plan)? {
                tracing::info!(
                    "Deleted group {} ({} permission rows, {} members)",
                    name,
                    plan.permission_keys.len(),
                    plan.members.len()
                );
                return Ok(plan.permission_keys.len());
            }
            tracing::debug!("Group {} changed while deleting it, collecting its rows again", name);
        }
    }

    /// Collect every row naming `name` along with the group revision they
    /// were read at
    pub(crate) fn plan_group_deletion(&self, name: &str) -> Result<GroupDeletion> {
        self.store().group(name)?;
        let revision = self.store().group_revision(name)?;

        let principal = Principal::Group(name.to_string());
        let permission_keys = self
            .store()
            .all_permissions()?
            .into_iter()
            .filter(|p: &Permission| p.principal == principal)
            .map(|p| p.key())
            .collect();
        let members = self
            .store()
            .group_members(name)?
            .into_iter()
            .map(|m| m.user)
            .collect();
        let mapping_keys = self
            .store()
            .role_mappings()?
            .into_iter()
            .filter(|m| m.group == name)
            .map(|m| m.key())
            .collect();

        Ok(GroupDeletion {
            group: name.to_string(),
            revision,
            permission_keys,
            members,
            mapping_keys,
        })
    }

    /// Delete what a plan collected. Returns false, deleting nothing, when
    /// a row naming the group was written after the plan was made.
    pub(crate) fn apply_group_deletion(&self, plan: &GroupDeletion) -> Result<bool> {
        let name = plan.group.as_str();
        self.store().transaction(|txn| {
            txn.require::<Group>(&Group::key_for(name), "group")?;
            if txn.group_revision(name)? != plan.revision {
                return Ok(false);
            }

            for key in &plan.permission_keys {
                txn.delete(key)?;
            }
            for user in &plan.members {
                txn.remove_group_member(name, user)?;
            }
            for key in &plan.mapping_keys {
                txn.delete(key)?;
            }
            txn.clear_group_revision(name)?;
            txn.delete(&Group::key_for(name))?;
            Ok(true)
        })
    }
}

/// Rows naming a group, collected for its deletion
pub(crate) struct GroupDeletion {
    group: String,
    revision: u64,
    permission_keys: Vec<Vec<u8>>,
    members: Vec<String>,
    mapping_keys: Vec<Vec<u8>>,
}

