// Copyright (c) 2023 the Hearth contributors.
// SPDX-License-Identifier: AGPL-3.0-or-later
//
// This file is part of Hearth.
//
// Hearth is free software: you can redistribute it and/or modify it under the
// terms of the GNU Affero General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Hearth is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with Hearth. If not, see <https://www.gnu.org/licenses/>.

//! Group resources: a resource whose body is a membership set, whose ACL
//! grants or denies `ASSIGN_CLIENT` to its members.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::ContextRegistry;
use crate::error::VmciResult;
use crate::handle::{Handle, HandleArray};
use crate::resource::{Privilege, ResourceKind, ResourceTable};

/// Owns every group's `member_set`, keyed by the group's own handle.
///
/// Each body is reached through its own `Arc<Mutex<_>>` (the `Group.lock`,
/// highest rank in the lock inventory) rather than the registry-wide map
/// lock, so membership operations on distinct groups never contend.
pub struct GroupRegistry {
    resources: Arc<ResourceTable>,
    contexts: Arc<ContextRegistry>,
    bodies: Arc<Mutex<HashMap<Handle, Arc<Mutex<HandleArray>>>>>,
}

impl GroupRegistry {
    pub fn new(resources: Arc<ResourceTable>, contexts: Arc<ContextRegistry>) -> Self {
        Self {
            resources,
            contexts,
            bodies: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers a new, empty group resource owned by `owner`.
    pub fn create_group(&self, handle: Handle, owner: Handle) -> VmciResult<()> {
        let body = Arc::new(Mutex::new(HandleArray::new()));
        self.bodies.lock().insert(handle, body);

        let bodies = self.bodies.clone();
        self.resources.add(
            handle,
            ResourceKind::Group,
            owner,
            &[Privilege::AssignClient],
            Box::new(move || {
                bodies.lock().remove(&handle);
            }),
        )
    }

    fn body(&self, group: Handle) -> VmciResult<Arc<Mutex<HandleArray>>> {
        self.bodies
            .lock()
            .get(&group)
            .cloned()
            .ok_or(crate::error::VmciError::InvalidResource)
    }

    /// Adds `member` to `group`, granting or denying `ASSIGN_CLIENT` on the
    /// group's ACL according to `can_assign`.
    pub fn add_member(&self, group: Handle, member: Handle, can_assign: bool) -> VmciResult<()> {
        let body = self.body(group)?;
        body.lock().append(member);

        let (allow, deny): (&[Privilege], &[Privilege]) = if can_assign {
            (&[Privilege::AssignClient], &[])
        } else {
            (&[], &[Privilege::AssignClient])
        };
        self.resources.add_client_privileges(group, member, allow, deny)?;

        if let Some(ctx) = self.contexts.get(member.context) {
            ctx.append_group(group);
            self.contexts.release(ctx);
        }
        Ok(())
    }

    /// Removes `member` from `group`'s list and clears all of its
    /// privileges on the group.
    pub fn remove_member(&self, group: Handle, member: Handle) -> VmciResult<()> {
        let body = self.body(group)?;
        body.lock().remove(member);
        self.resources
            .remove_client_privileges(group, member, &Privilege::ALL)?;

        if let Some(ctx) = self.contexts.get(member.context) {
            ctx.remove_group(group);
            self.contexts.release(ctx);
        }
        Ok(())
    }

    pub fn is_member(&self, group: Handle, member: Handle) -> VmciResult<bool> {
        Ok(self.body(group)?.lock().has(member))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> GroupRegistry {
        GroupRegistry::new(Arc::new(ResourceTable::default()), Arc::new(ContextRegistry::new()))
    }

    #[test]
    fn add_and_check_membership() {
        let registry = registry();
        let group = Handle::new(crate::handle::WELL_KNOWN_CONTEXT, 1);
        let owner = Handle::new(50, 0);
        let member = Handle::new(60, 0);

        registry.create_group(group, owner).unwrap();
        registry.add_member(group, member, true).unwrap();
        assert!(registry.is_member(group, member).unwrap());
    }

    #[test]
    fn remove_clears_membership_and_privileges() {
        let registry = registry();
        let group = Handle::new(crate::handle::WELL_KNOWN_CONTEXT, 2);
        let owner = Handle::new(50, 0);
        let member = Handle::new(60, 0);

        registry.create_group(group, owner).unwrap();
        registry.add_member(group, member, true).unwrap();
        registry.remove_member(group, member).unwrap();
        assert!(!registry.is_member(group, member).unwrap());

        let check = registry
            .resources
            .check_client_privilege(group, member, Privilege::AssignClient, &[])
            .unwrap();
        assert_eq!(check, crate::resource::PrivilegeCheck::InvalidPriv);
    }

    #[test]
    fn can_assign_false_denies() {
        let registry = registry();
        let group = Handle::new(crate::handle::WELL_KNOWN_CONTEXT, 3);
        let owner = Handle::new(50, 0);
        let member = Handle::new(70, 0);

        registry.create_group(group, owner).unwrap();
        registry.add_member(group, member, false).unwrap();

        let check = registry
            .resources
            .check_client_privilege(group, member, Privilege::AssignClient, &[])
            .unwrap();
        assert_eq!(check, crate::resource::PrivilegeCheck::NoAccess);
    }
}
