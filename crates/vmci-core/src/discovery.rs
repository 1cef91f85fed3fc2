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

//! Name-to-handle discovery: a growable vector of entries under one lock,
//! also reachable as a well-known datagram endpoint.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{VmciError, VmciResult};
use crate::handle::{Handle, HOST_CONTEXT};
use crate::resource::ResourceTable;
use crate::wire::PrivilegeFlags;

struct DiscoveryEntry {
    name: String,
    handle: Handle,
    owner_context_id: u32,
}

/// The reserved id discovery is reachable at as a well-known datagram
/// endpoint.
pub const DISCOVERY_WELL_KNOWN_ID: u32 = 1;

/// A request carried to the discovery service's well-known endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DiscoveryAction {
    Lookup,
    Register,
    Unregister,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub action: DiscoveryAction,
    pub name: String,
    pub handle: Handle,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub code: i32,
    pub handle: Handle,
    pub message: String,
}

/// The name registry: `{name, Handle, owner_context_id}` triples under a
/// single lock, plus the resource table whose `registration_count` it keeps
/// in step.
pub struct DiscoveryService {
    entries: Mutex<Vec<DiscoveryEntry>>,
    resources: Arc<ResourceTable>,
}

impl DiscoveryService {
    pub fn new(resources: Arc<ResourceTable>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            resources,
        }
    }

    pub fn register(&self, name: &str, handle: Handle, ctx: u32) -> VmciResult<()> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.name == name) {
            return Err(VmciError::AlreadyExists);
        }
        entries.push(DiscoveryEntry {
            name: name.to_owned(),
            handle,
            owner_context_id: ctx,
        });
        drop(entries);

        if let Some(slot) = self.resources.get(handle) {
            slot.value.inc_registration();
            self.resources.release(&slot);
        }

        debug!(name, ?handle, ctx, "discovery name registered");
        Ok(())
    }

    pub fn unregister(&self, name: &str, ctx: u32) -> VmciResult<()> {
        let mut entries = self.entries.lock();
        let pos = entries
            .iter()
            .position(|e| e.name == name)
            .ok_or(VmciError::NotFound)?;
        if ctx != HOST_CONTEXT && entries[pos].owner_context_id != ctx {
            return Err(VmciError::NoAccess);
        }
        let entry = entries.remove(pos);
        drop(entries);

        if let Some(slot) = self.resources.get(entry.handle) {
            slot.value.dec_registration();
            self.resources.release(&slot);
        }

        debug!(name, ctx, "discovery name unregistered");
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> VmciResult<Handle> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.handle)
            .ok_or(VmciError::NotFound)
    }

    /// Removes every entry for `resource`, decrementing its registration
    /// count once per removed entry.
    pub fn unregister_resource(&self, resource: Handle) {
        let removed = {
            let mut entries = self.entries.lock();
            let mut removed = 0usize;
            entries.retain(|e| {
                if e.handle == resource {
                    removed += 1;
                    false
                } else {
                    true
                }
            });
            removed
        };
        if removed == 0 {
            return;
        }
        if let Some(slot) = self.resources.get(resource) {
            for _ in 0..removed {
                slot.value.dec_registration();
            }
            self.resources.release(&slot);
        }
    }

    /// Drops every entry owned by `ctx`, called during context teardown.
    pub fn remove_context_entries(&self, ctx: u32) {
        let mut entries = self.entries.lock();
        entries.retain(|e| e.owner_context_id != ctx);
    }

    /// Handles a request delivered to the discovery well-known endpoint.
    /// Non-trusted senders may only `LOOKUP`.
    pub fn handle_request(
        &self,
        request: DiscoveryRequest,
        sender_ctx: u32,
        sender_priv: PrivilegeFlags,
    ) -> DiscoveryResponse {
        if !matches!(request.action, DiscoveryAction::Lookup)
            && !sender_priv.contains(PrivilegeFlags::TRUSTED)
        {
            return DiscoveryResponse {
                code: VmciError::NoAccess.code(),
                handle: Handle::INVALID,
                message: "access denied".to_owned(),
            };
        }

        match request.action {
            DiscoveryAction::Lookup => match self.lookup(&request.name) {
                Ok(handle) => DiscoveryResponse {
                    code: 0,
                    handle,
                    message: String::new(),
                },
                Err(err) => DiscoveryResponse {
                    code: err.code(),
                    handle: Handle::INVALID,
                    message: err.to_string(),
                },
            },
            DiscoveryAction::Register => match self.register(&request.name, request.handle, sender_ctx) {
                Ok(()) => DiscoveryResponse {
                    code: 0,
                    handle: request.handle,
                    message: String::new(),
                },
                Err(err) => DiscoveryResponse {
                    code: err.code(),
                    handle: Handle::INVALID,
                    message: err.to_string(),
                },
            },
            DiscoveryAction::Unregister => match self.unregister(&request.name, sender_ctx) {
                Ok(()) => DiscoveryResponse {
                    code: 0,
                    handle: Handle::INVALID,
                    message: String::new(),
                },
                Err(err) => DiscoveryResponse {
                    code: err.code(),
                    handle: Handle::INVALID,
                    message: err.to_string(),
                },
            },
        }
    }
}
