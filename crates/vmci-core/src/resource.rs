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

//! The typed resource table: a [HashTable] entry plus a type tag, an owner, a
//! client ACL and a container-free callback invoked on the dead transition.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{VmciError, VmciResult};
use crate::handle::Handle;
use crate::hashtable::{HashTable, ReleaseOutcome, Slot};

/// One slot in a resource's ACL vector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Privilege {
    ChPriv,
    DestroyResource,
    DgSend,
    AssignClient,
}

impl Privilege {
    /// Every privilege slot this fabric recognizes.
    pub const ALL: [Privilege; 4] = [
        Privilege::ChPriv,
        Privilege::DestroyResource,
        Privilege::DgSend,
        Privilege::AssignClient,
    ];
}

/// A single ACL slot's state.
///
/// Used both in a resource's `valid_privs` map (where only [PrivState::NotSet]
/// and [PrivState::Valid] ever occur) and in a client's per-privilege map
/// (where all four values occur). [PrivState::Deny] always wins over
/// [PrivState::Allow] when both would otherwise apply through different
/// paths (direct vs. group-derived).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrivState {
    NotSet,
    Valid,
    Allow,
    Deny,
}

/// The type tag of a resource.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Api,
    Group,
    Datagram,
    SharedMem,
    Any,
}

/// The outcome of [ResourceTable::check_client_privilege].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrivilegeCheck {
    AccessGranted,
    NoAccess,
    InvalidPriv,
}

/// A client holding privileges on a resource.
pub struct ResourceClient {
    pub client_handle: Handle,
    privs: HashMap<Privilege, PrivState>,
}

impl ResourceClient {
    fn new(allow: &[Privilege], deny: &[Privilege], client_handle: Handle) -> Self {
        let mut privs = HashMap::new();
        for p in Privilege::ALL {
            privs.insert(p, PrivState::NotSet);
        }
        for p in allow {
            privs.insert(*p, PrivState::Allow);
        }
        for p in deny {
            privs.insert(*p, PrivState::Deny);
        }
        Self {
            client_handle,
            privs,
        }
    }

    fn get(&self, p: Privilege) -> PrivState {
        *self.privs.get(&p).unwrap_or(&PrivState::NotSet)
    }

    /// True once every privilege slot has returned to [PrivState::NotSet],
    /// meaning this client is eligible for removal.
    fn is_empty(&self) -> bool {
        self.privs.values().all(|s| *s == PrivState::NotSet)
    }
}

type ContainerFree = Box<dyn FnOnce() + Send>;

/// The body of a resource table entry.
pub struct ResourceState {
    pub kind: ResourceKind,
    pub owner: Handle,
    valid_privs: Mutex<HashMap<Privilege, PrivState>>,
    clients: Mutex<Vec<ResourceClient>>,
    registration_count: std::sync::atomic::AtomicUsize,
    container_free: Mutex<Option<ContainerFree>>,
}

impl ResourceState {
    /// The number of times this resource is currently registered with the
    /// discovery service, tracked for [crate::discovery::DiscoveryService].
    pub fn registration_count(&self) -> usize {
        self.registration_count.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub(crate) fn inc_registration(&self) {
        self.registration_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub(crate) fn dec_registration(&self) {
        self.registration_count
            .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    }
}

/// A handle-indexed table of typed, ACL-governed resources.
pub struct ResourceTable {
    table: HashTable<ResourceState>,
}

impl Default for ResourceTable {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ResourceTable {
    pub fn new(bucket_count: usize) -> Self {
        Self {
            table: HashTable::new(bucket_count),
        }
    }

    /// Registers a new resource under `handle`.
    ///
    /// `valid_privs` lists the privileges beyond `CH_PRIV` and
    /// `DESTROY_RESOURCE` (always granted) that clients of this resource may
    /// be assigned. The owner is inserted as the first client, with `ALLOW`
    /// on `CH_PRIV` and `DESTROY_RESOURCE`.
    pub fn add(
        &self,
        handle: Handle,
        kind: ResourceKind,
        owner: Handle,
        valid_privs: &[Privilege],
        container_free: ContainerFree,
    ) -> VmciResult<()> {
        let mut privs = HashMap::new();
        for p in Privilege::ALL {
            privs.insert(p, PrivState::NotSet);
        }
        privs.insert(Privilege::ChPriv, PrivState::Valid);
        privs.insert(Privilege::DestroyResource, PrivState::Valid);
        for p in valid_privs {
            privs.insert(*p, PrivState::Valid);
        }

        let owner_client = ResourceClient::new(
            &[Privilege::ChPriv, Privilege::DestroyResource],
            &[],
            owner,
        );

        let state = ResourceState {
            kind,
            owner,
            valid_privs: Mutex::new(privs),
            clients: Mutex::new(vec![owner_client]),
            registration_count: std::sync::atomic::AtomicUsize::new(0),
            container_free: Mutex::new(Some(container_free)),
        };

        self.table.add(handle, state)?;
        debug!(?handle, ?owner, "resource added");
        Ok(())
    }

    /// Looks up a resource, incrementing its refcount.
    pub fn get(&self, handle: Handle) -> Option<Arc<Slot<ResourceState>>> {
        self.table.get(handle)
    }

    /// Looks up two resources under one lock acquisition.
    pub fn get_pair(
        &self,
        a: Handle,
        b: Handle,
    ) -> (Option<Arc<Slot<ResourceState>>>, Option<Arc<Slot<ResourceState>>>) {
        self.table.get_pair(a, b)
    }

    /// Releases a reference obtained from [Self::get]; runs the resource's
    /// container-free callback exactly once if this was the last reference.
    pub fn release(&self, slot: &Arc<Slot<ResourceState>>) {
        if self.table.release(slot) == ReleaseOutcome::Dead {
            if let Some(free) = slot.value.container_free.lock().take() {
                free();
            }
            debug!(handle = ?slot.handle, "resource container freed");
        }
    }

    /// Removes `handle` after validating its type, dropping every client,
    /// then releasing the reference acquired for the removal itself.
    pub fn remove(&self, handle: Handle, kind: ResourceKind) -> VmciResult<()> {
        let slot = self.get(handle).ok_or(VmciError::InvalidResource)?;
        if !matches!(
            (&slot.value.kind, &kind),
            (ResourceKind::Api, ResourceKind::Api)
                | (ResourceKind::Group, ResourceKind::Group)
                | (ResourceKind::Datagram, ResourceKind::Datagram)
                | (ResourceKind::SharedMem, ResourceKind::SharedMem)
                | (ResourceKind::Any, _)
        ) {
            self.release(&slot);
            return Err(VmciError::InvalidResource);
        }

        slot.value.clients.lock().clear();
        // We are still holding `slot`'s own reference from `get` above, so
        // this unlink can only observe the dead transition if that was
        // somehow the last reference; the expected path is `release` below
        // draining it.
        match self.table.remove(handle) {
            Some(ReleaseOutcome::Dead) => {
                if let Some(free) = slot.value.container_free.lock().take() {
                    free();
                }
                debug!(handle = ?slot.handle, "resource container freed");
            }
            _ => self.release(&slot),
        }
        Ok(())
    }

    /// Grants/denies `allow`/`deny` privileges to `client` on `resource`,
    /// validating each against the resource's `valid_privs` set.
    pub fn add_client_privileges(
        &self,
        resource: Handle,
        client: Handle,
        allow: &[Privilege],
        deny: &[Privilege],
    ) -> VmciResult<()> {
        let slot = self.get(resource).ok_or(VmciError::InvalidResource)?;
        let result = (|| {
            let valid = slot.value.valid_privs.lock();
            for p in allow.iter().chain(deny.iter()) {
                if *valid.get(p).unwrap_or(&PrivState::NotSet) == PrivState::NotSet {
                    return Err(VmciError::InvalidPriv);
                }
            }
            drop(valid);

            let mut clients = slot.value.clients.lock();
            if let Some(existing) = clients.iter_mut().find(|c| c.client_handle == client) {
                for p in allow {
                    existing.privs.insert(*p, PrivState::Allow);
                }
                for p in deny {
                    existing.privs.insert(*p, PrivState::Deny);
                }
            } else {
                clients.push(ResourceClient::new(allow, deny, client));
            }
            Ok(())
        })();
        self.release(&slot);
        result
    }

    /// Clears `privs` back to [PrivState::NotSet] for `client` on `resource`,
    /// removing the client entirely once all its privileges are clear.
    pub fn remove_client_privileges(
        &self,
        resource: Handle,
        client: Handle,
        privs: &[Privilege],
    ) -> VmciResult<()> {
        let slot = self.get(resource).ok_or(VmciError::InvalidResource)?;
        {
            let mut clients = slot.value.clients.lock();
            if let Some(existing) = clients.iter_mut().find(|c| c.client_handle == client) {
                for p in privs {
                    existing.privs.insert(*p, PrivState::NotSet);
                }
                if existing.is_empty() {
                    clients.retain(|c| c.client_handle != client);
                }
            }
        }
        self.release(&slot);
        Ok(())
    }

    /// Checks whether `client` holds `privilege` on `resource`, consulting
    /// `groups` (the context's group membership, supplied by the caller) if
    /// the direct lookup is [PrivState::NotSet].
    pub fn check_client_privilege(
        &self,
        resource: Handle,
        client: Handle,
        privilege: Privilege,
        groups: &[Handle],
    ) -> VmciResult<PrivilegeCheck> {
        let slot = self.get(resource).ok_or(VmciError::InvalidResource)?;
        let direct = {
            let clients = slot.value.clients.lock();
            clients
                .iter()
                .find(|c| c.client_handle == client)
                .map(|c| c.get(privilege))
        };
        self.release(&slot);

        match direct {
            Some(PrivState::Allow) => return Ok(PrivilegeCheck::AccessGranted),
            Some(PrivState::Deny) => return Ok(PrivilegeCheck::NoAccess),
            _ => {}
        }

        for group in groups {
            let gslot = match self.get(*group) {
                Some(s) => s,
                None => continue,
            };
            let state = {
                let clients = gslot.value.clients.lock();
                clients
                    .iter()
                    .find(|c| c.client_handle == client)
                    .map(|c| c.get(privilege))
            };
            self.release(&gslot);

            match state {
                Some(PrivState::Allow) => return Ok(PrivilegeCheck::AccessGranted),
                Some(PrivState::Deny) => return Ok(PrivilegeCheck::NoAccess),
                _ => continue,
            }
        }

        Ok(PrivilegeCheck::InvalidPriv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(c: u32, r: u32) -> Handle {
        Handle::new(c, r)
    }

    #[test]
    fn add_creates_owner_client() {
        let table = ResourceTable::default();
        let res = h(100, 1);
        let owner = h(50, 0);
        table
            .add(res, ResourceKind::Api, owner, &[Privilege::DgSend], Box::new(|| {}))
            .unwrap();

        let check = table
            .check_client_privilege(res, owner, Privilege::ChPriv, &[])
            .unwrap();
        assert_eq!(check, PrivilegeCheck::AccessGranted);
    }

    #[test]
    fn invalid_priv_when_not_listed() {
        let table = ResourceTable::default();
        let res = h(100, 2);
        let owner = h(50, 0);
        table.add(res, ResourceKind::Api, owner, &[], Box::new(|| {})).unwrap();

        let other = h(60, 0);
        let check = table
            .check_client_privilege(res, other, Privilege::DgSend, &[])
            .unwrap();
        assert_eq!(check, PrivilegeCheck::InvalidPriv);
    }

    #[test]
    fn deny_wins_via_group() {
        let table = ResourceTable::default();
        let res = h(100, 3);
        let owner = h(50, 0);
        table
            .add(res, ResourceKind::Api, owner, &[Privilege::DgSend], Box::new(|| {}))
            .unwrap();

        let group = h(crate::handle::WELL_KNOWN_CONTEXT, 9);
        table
            .add(group, ResourceKind::Group, owner, &[Privilege::DgSend], Box::new(|| {}))
            .unwrap();

        let member = h(70, 0);
        table
            .add_client_privileges(group, member, &[], &[Privilege::DgSend])
            .unwrap();

        let check = table
            .check_client_privilege(res, member, Privilege::DgSend, &[group])
            .unwrap();
        assert_eq!(check, PrivilegeCheck::NoAccess);
    }

    #[test]
    fn container_free_runs_once() {
        let table = ResourceTable::default();
        let res = h(1, 1);
        let owner = h(2, 2);
        let freed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let freed2 = freed.clone();
        table
            .add(res, ResourceKind::Api, owner, &[], Box::new(move || {
                freed2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }))
            .unwrap();

        table.remove(res, ResourceKind::Api).unwrap();
        assert_eq!(freed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
