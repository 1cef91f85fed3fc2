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

//! Datagram endpoints and the dispatch routing engine: the hot path that
//! moves a datagram from a sender handle to a host callback, a remote
//! context's mailbox, or the event bus.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::context::ContextRegistry;
use crate::error::{VmciError, VmciResult};
use crate::event::EventBus;
use crate::handle::{
    Handle, CONTEXT_RESOURCE_ID, EVENT_HANDLER_RESOURCE_ID, HOST_CONTEXT, HYPERVISOR_CONTEXT,
    WELL_KNOWN_CONTEXT,
};
use crate::resource::{Privilege, ResourceKind, ResourceTable};
use crate::wire::{Datagram, EventPayload, PrivilegeFlags, MAX_DG_SIZE};

/// Flag recorded on an endpoint noting it additionally owns a well-known-name
/// reservation, addressed at `(WELL_KNOWN_CONTEXT, resource_id)`.
pub const WELL_KNOWN_DG_HND: u32 = 0b1;

const AUTO_ID_RETRIES: usize = 10;

/// A receive callback registered with [DatagramDispatcher::create_handle].
pub type RecvCallback = Arc<dyn Fn(&Datagram) + Send + Sync>;

/// Chooses whether a requested well-known id may be reserved at all,
/// independent of the caller's privilege flags (which are checked
/// separately). The default policy admits every id below 1024, leaving the
/// low range for fabric-internal endpoints such as discovery.
pub type WellKnownAllowPolicy = Arc<dyn Fn(u32) -> bool + Send + Sync>;

pub fn default_well_known_allow_policy() -> WellKnownAllowPolicy {
    Arc::new(|id| id < 1024)
}

struct DatagramEntry {
    #[allow(dead_code)]
    flags: u32,
    recv_cb: RecvCallback,
    priv_flags: PrivilegeFlags,
    destroy_event: Notify,
}

/// True if `src` and `dst` must not interact: either side is `RESTRICTED`
/// without its counterpart being `TRUSTED`, or (unless `skip_domain_check`)
/// their domain names are both present and differ.
///
/// Shared with [crate::queuepair], whose own domain check applies the same
/// predicate between a queue pair's two participant contexts.
pub(crate) fn deny_interaction(
    src_priv: PrivilegeFlags,
    dst_priv: PrivilegeFlags,
    src_domain: Option<&str>,
    dst_domain: Option<&str>,
    skip_domain_check: bool,
) -> bool {
    if src_priv.contains(PrivilegeFlags::RESTRICTED) && !dst_priv.contains(PrivilegeFlags::TRUSTED) {
        return true;
    }
    if dst_priv.contains(PrivilegeFlags::RESTRICTED) && !src_priv.contains(PrivilegeFlags::TRUSTED) {
        return true;
    }
    if !skip_domain_check {
        if let (Some(s), Some(d)) = (src_domain, dst_domain) {
            if s != d {
                return true;
            }
        }
    }
    false
}

/// Endpoint registry and routing engine.
pub struct DatagramDispatcher {
    resources: Arc<ResourceTable>,
    contexts: Arc<ContextRegistry>,
    events: Arc<EventBus>,
    endpoints: Arc<Mutex<HashMap<Handle, Arc<DatagramEntry>>>>,
    well_known: Mutex<HashMap<u32, u32>>,
    allow_policy: WellKnownAllowPolicy,
    next_resource_id: Mutex<u32>,
}

impl DatagramDispatcher {
    pub fn new(
        resources: Arc<ResourceTable>,
        contexts: Arc<ContextRegistry>,
        events: Arc<EventBus>,
        allow_policy: WellKnownAllowPolicy,
    ) -> Self {
        Self {
            resources,
            contexts,
            events,
            endpoints: Arc::new(Mutex::new(HashMap::new())),
            well_known: Mutex::new(HashMap::new()),
            allow_policy,
            next_resource_id: Mutex::new(1),
        }
    }

    fn fresh_resource_id(&self) -> u32 {
        let mut next = self.next_resource_id.lock();
        let id = *next;
        *next = next.wrapping_add(1);
        id
    }

    /// Registers `id` under `ctx`, subject to the allow policy and to the
    /// caller not being `RESTRICTED`.
    pub fn request_well_known_map(&self, id: u32, ctx: u32, priv_flags: PrivilegeFlags) -> VmciResult<()> {
        if priv_flags.contains(PrivilegeFlags::RESTRICTED) {
            return Err(VmciError::NoAccess);
        }
        if !(self.allow_policy)(id) {
            return Err(VmciError::NoAccess);
        }

        let mut well_known = self.well_known.lock();
        if well_known.contains_key(&id) {
            return Err(VmciError::AlreadyExists);
        }
        well_known.insert(id, ctx);
        drop(well_known);

        if let Some(ctx_entry) = self.contexts.get(ctx) {
            ctx_entry.append_well_known(id);
            self.contexts.release(ctx_entry);
        }
        debug!(id, ctx, "well-known mapping registered");
        Ok(())
    }

    /// Removes `id`'s mapping, requiring the caller's context to be the
    /// mapping's owner.
    pub fn remove_well_known_map(&self, id: u32, ctx: u32) -> VmciResult<()> {
        let mut well_known = self.well_known.lock();
        match well_known.get(&id) {
            Some(&owner) if owner == ctx => {
                well_known.remove(&id);
            }
            Some(_) => return Err(VmciError::NoAccess),
            None => return Err(VmciError::NotFound),
        }
        drop(well_known);

        if let Some(ctx_entry) = self.contexts.get(ctx) {
            ctx_entry.remove_well_known(id);
            self.contexts.release(ctx_entry);
        }
        Ok(())
    }

    /// Registers a new endpoint. If `WELL_KNOWN_DG_HND` is set in `flags`,
    /// `resource_id` must be `Some` and the handle is
    /// `(WELL_KNOWN_CONTEXT, resource_id)`; otherwise an explicit or
    /// freshly-allocated id is used under `HOST_CONTEXT`.
    pub fn create_handle(
        &self,
        resource_id: Option<u32>,
        flags: u32,
        priv_flags: PrivilegeFlags,
        owner: Handle,
        recv_cb: RecvCallback,
    ) -> VmciResult<Handle> {
        if !priv_flags.is_valid() {
            return Err(VmciError::InvalidArgs("priv_flags"));
        }

        if flags & WELL_KNOWN_DG_HND != 0 {
            let id = resource_id.ok_or(VmciError::InvalidArgs("resource_id"))?;
            self.request_well_known_map(id, owner.context, priv_flags)?;
            let handle = Handle::new(WELL_KNOWN_CONTEXT, id);
            if let Err(err) = self.register_endpoint(handle, flags, priv_flags, owner, recv_cb) {
                let _ = self.remove_well_known_map(id, owner.context);
                return Err(err);
            }
            return Ok(handle);
        }

        if let Some(id) = resource_id {
            let handle = Handle::new(HOST_CONTEXT, id);
            self.register_endpoint(handle, flags, priv_flags, owner, recv_cb)?;
            return Ok(handle);
        }

        for _ in 0..AUTO_ID_RETRIES {
            let id = self.fresh_resource_id();
            let handle = Handle::new(HOST_CONTEXT, id);
            match self.register_endpoint(handle, flags, priv_flags, owner, recv_cb.clone()) {
                Ok(()) => return Ok(handle),
                Err(VmciError::DuplicateEntry) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(VmciError::NoResources)
    }

    fn register_endpoint(
        &self,
        handle: Handle,
        flags: u32,
        priv_flags: PrivilegeFlags,
        owner: Handle,
        recv_cb: RecvCallback,
    ) -> VmciResult<()> {
        let entry = Arc::new(DatagramEntry {
            flags,
            recv_cb,
            priv_flags,
            destroy_event: Notify::new(),
        });
        self.endpoints.lock().insert(handle, entry);

        let endpoints = self.endpoints.clone();
        if let Err(err) = self.resources.add(
            handle,
            ResourceKind::Datagram,
            owner,
            &[Privilege::DgSend],
            Box::new(move || {
                if let Some(entry) = endpoints.lock().remove(&handle) {
                    entry.destroy_event.notify_waiters();
                }
            }),
        ) {
            self.endpoints.lock().remove(&handle);
            return Err(err);
        }
        debug!(?handle, "datagram endpoint created");
        Ok(())
    }

    /// Unregisters `handle`, then waits for every in-flight [Self::dispatch]
    /// call holding a reference to drain before returning.
    pub async fn destroy(&self, handle: Handle) -> VmciResult<()> {
        let entry = self.endpoints.lock().get(&handle).cloned();
        match entry {
            Some(entry) => {
                // Must be registered as a waiter before `remove` runs, since
                // the container-free closure may fire `notify_waiters`
                // synchronously from inside that call.
                let notified = entry.destroy_event.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                self.resources.remove(handle, ResourceKind::Datagram)?;
                notified.await;
            }
            None => {
                self.resources.remove(handle, ResourceKind::Datagram)?;
            }
        }
        debug!(?handle, "datagram endpoint destroyed");
        Ok(())
    }

    fn priv_flags_of(&self, cid: u32, resource_id: u32) -> PrivilegeFlags {
        if cid == HYPERVISOR_CONTEXT {
            PrivilegeFlags::MAX_PRIVILEGE
        } else if cid == HOST_CONTEXT {
            let handle = Handle::new(HOST_CONTEXT, resource_id);
            self.endpoints
                .lock()
                .get(&handle)
                .map(|e| e.priv_flags)
                .unwrap_or(PrivilegeFlags::empty())
        } else {
            match self.contexts.get(cid) {
                Some(ctx) => {
                    let p = ctx.priv_flags;
                    self.contexts.release(ctx);
                    p
                }
                None => PrivilegeFlags::empty(),
            }
        }
    }

    fn domain_name_of(&self, cid: u32) -> Option<String> {
        if cid == HOST_CONTEXT || cid == HYPERVISOR_CONTEXT {
            return None;
        }
        let ctx = self.contexts.get(cid)?;
        let name = ctx.domain_name();
        self.contexts.release(ctx);
        name
    }

    /// Routes `dg`, sent by `sender_cid`, to its destination.
    ///
    /// Returns the datagram's wire size on success.
    pub fn dispatch(&self, sender_cid: u32, dg: Datagram) -> VmciResult<u64> {
        let size = dg.wire_size();
        if size > MAX_DG_SIZE {
            return Err(VmciError::InvalidArgs("datagram exceeds MAX_DG_SIZE"));
        }
        if sender_cid == HOST_CONTEXT && dg.dst.context == HYPERVISOR_CONTEXT {
            return Err(VmciError::NoAccess);
        }

        if dg.src.context != sender_cid {
            if dg.src.context == WELL_KNOWN_CONTEXT {
                let owner = self.well_known.lock().get(&dg.src.resource).copied();
                if owner != Some(sender_cid) {
                    return Err(VmciError::NoAccess);
                }
            } else {
                return Err(VmciError::NoAccess);
            }
        }

        let dst_context = if dg.dst.context == WELL_KNOWN_CONTEXT {
            self.well_known
                .lock()
                .get(&dg.dst.resource)
                .copied()
                .ok_or(VmciError::DstUnreachable)?
        } else {
            dg.dst.context
        };

        let src_priv = self.priv_flags_of(sender_cid, dg.src.resource);
        let dst_priv = self.priv_flags_of(dst_context, dg.dst.resource);
        let hypervisor_src = sender_cid == HYPERVISOR_CONTEXT;
        let src_domain = self.domain_name_of(sender_cid);
        let dst_domain = self.domain_name_of(dst_context);
        if deny_interaction(
            src_priv,
            dst_priv,
            src_domain.as_deref(),
            dst_domain.as_deref(),
            hypervisor_src,
        ) {
            return Err(VmciError::NoAccess);
        }

        if dst_context == HOST_CONTEXT
            && dg.dst.resource == EVENT_HANDLER_RESOURCE_ID
            && dg.src.context == HYPERVISOR_CONTEXT
        {
            let payload: EventPayload =
                serde_json::from_slice(&dg.payload).map_err(|_| VmciError::EventUnknown)?;
            self.events.dispatch(payload)?;
        } else if dst_context == HOST_CONTEXT {
            let handle = Handle::new(HOST_CONTEXT, dg.dst.resource);
            let entry = self
                .endpoints
                .lock()
                .get(&handle)
                .cloned()
                .ok_or(VmciError::DstUnreachable)?;
            (entry.recv_cb)(&dg);
        } else {
            self.contexts.enqueue_datagram(dst_context, dg.clone())?;
        }

        trace!(sender_cid, dst_context, size, "datagram dispatched");
        Ok(size)
    }

    /// Best-effort delivery of a hypervisor-sourced event to a single
    /// target context, routed through [Self::dispatch] so a `HOST`
    /// subscriber reaches the event bus and a guest context gets an
    /// enqueued datagram. Failures are logged, never propagated: event
    /// delivery to one target must not block delivery to the rest.
    pub fn fire_event(&self, target_cid: u32, payload: EventPayload) {
        let bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(?err, "event payload failed to serialize");
                return;
            }
        };
        let dg = Datagram {
            src: Handle::new(HYPERVISOR_CONTEXT, CONTEXT_RESOURCE_ID),
            dst: Handle::new(target_cid, EVENT_HANDLER_RESOURCE_ID),
            payload: bytes,
        };
        if let Err(err) = self.dispatch(HYPERVISOR_CONTEXT, dg) {
            warn!(target_cid, ?err, "event delivery failed");
        }
    }
}
