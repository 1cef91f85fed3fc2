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

//! The queue-pair manager: the two-phase create/attach state machine for
//! paired circular queues between two contexts, plus delayed page-store
//! binding and peer-notification events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::context::ContextRegistry;
use crate::datagram::{deny_interaction, DatagramDispatcher};
use crate::error::{VmciError, VmciResult};
use crate::handle::{Handle, HOST_CONTEXT, HYPERVISOR_CONTEXT};
use crate::wire::{EventPayload, PrivilegeFlags};

bitflags::bitflags! {
    /// Flags accompanying a [QueuePairManager::alloc] call.
    #[derive(Default)]
    pub struct QueuePairFlags: u32 {
        /// The caller only wants to attach to an already-created pair; if
        /// the handle doesn't exist yet, the call fails with `NOT_FOUND`
        /// rather than creating one.
        const ATTACH_ONLY = 0b01;
    }
}

/// Sentinel used wherever a participant slot has no value: an unattached
/// `attach_id`, a wildcard `peer`, or a detached `create_id`/`attach_id`.
const UNSET: u32 = u32::MAX;

/// A queue pair's normalized page-store naming.
///
/// Always stored in the creator's frame of reference: `produce_name` is the
/// creator's produce queue regardless of which side actually called
/// [QueuePairManager::set_page_store].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageStore {
    pub produce_name: String,
    pub consume_name: String,
}

/// The outcome of [QueuePairManager::alloc].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocOutcome {
    /// A new entry was created, or (on a hosted platform, attaching to a
    /// host-created pair) the attacher must now build the page store itself.
    Create,
    /// The caller became the peer of an existing entry.
    Attach,
}

/// The outcome of a committed [QueuePairManager::detach].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DetachOutcome {
    /// This was the last participant; the entry is gone.
    LastDetach,
    /// The surviving peer is a guest context, notified of the detach.
    Success,
}

struct QueuePairState {
    /// The context the creator restricted attachment to, or `UNSET` for any.
    peer: u32,
    flags: QueuePairFlags,
    produce_size: u64,
    consume_size: u64,
    create_id: AtomicU32,
    attach_id: AtomicU32,
    refcount: AtomicUsize,
    allow_attach: AtomicBool,
    require_trusted_attach: bool,
    created_by_trusted: bool,
    page_store: Mutex<Option<PageStore>>,
    attach_event_deferred: AtomicBool,
}

/// Create/attach/set-page-store/detach state machine for queue pairs.
///
/// `hosted` selects between the two platform behaviors the spec
/// distinguishes: on a hosted platform the host may create a pair before a
/// page store exists and defers `QP_PEER_ATTACH` until the guest peer binds
/// one; on a VMKERNEL-style platform the page store must already be set
/// before any attach is allowed.
pub struct QueuePairManager {
    contexts: Arc<ContextRegistry>,
    dispatcher: Arc<DatagramDispatcher>,
    hosted: bool,
    entries: Mutex<HashMap<Handle, Arc<QueuePairState>>>,
}

impl QueuePairManager {
    pub fn new(contexts: Arc<ContextRegistry>, dispatcher: Arc<DatagramDispatcher>, hosted: bool) -> Self {
        Self {
            contexts,
            dispatcher,
            hosted,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn participant_priv_domain(&self, cid: u32) -> (PrivilegeFlags, Option<String>) {
        if cid == HOST_CONTEXT || cid == HYPERVISOR_CONTEXT {
            return (PrivilegeFlags::MAX_PRIVILEGE, None);
        }
        match self.contexts.get(cid) {
            Some(ctx) => {
                let priv_flags = ctx.priv_flags;
                let domain = ctx.domain_name();
                self.contexts.release(ctx);
                (priv_flags, domain)
            }
            None => (PrivilegeFlags::empty(), None),
        }
    }

    /// The platform domain check between a queue pair's two participants,
    /// sharing [crate::datagram::deny_interaction] with the dispatcher.
    fn deny_connection(&self, a: u32, b: u32) -> bool {
        let (a_priv, a_domain) = self.participant_priv_domain(a);
        let (b_priv, b_domain) = self.participant_priv_domain(b);
        deny_interaction(a_priv, b_priv, a_domain.as_deref(), b_domain.as_deref(), false)
    }

    /// Creates a new entry, or attaches to an existing one, at `handle`.
    ///
    /// `peer_cid` restricts who may attach; pass `None` to allow any context.
    /// `priv_flags` is the caller's own declared privilege for this
    /// operation, not a context lookup.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc(
        &self,
        handle: Handle,
        peer_cid: Option<u32>,
        flags: QueuePairFlags,
        priv_flags: PrivilegeFlags,
        produce_size: u64,
        consume_size: u64,
        caller_ctx: u32,
    ) -> VmciResult<AllocOutcome> {
        if !priv_flags.is_valid() {
            return Err(VmciError::InvalidArgs("priv_flags"));
        }
        if handle.is_invalid() {
            return Err(VmciError::InvalidArgs("handle"));
        }

        let existing = self.entries.lock().get(&handle).cloned();
        if let Some(entry) = existing {
            return self.attach(entry, handle, flags, priv_flags, produce_size, consume_size, caller_ctx);
        }
        self.create(handle, peer_cid, flags, priv_flags, produce_size, consume_size, caller_ctx)
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &self,
        handle: Handle,
        peer_cid: Option<u32>,
        flags: QueuePairFlags,
        priv_flags: PrivilegeFlags,
        produce_size: u64,
        consume_size: u64,
        caller_ctx: u32,
    ) -> VmciResult<AllocOutcome> {
        if produce_size == 0 && consume_size == 0 {
            return Err(VmciError::InvalidArgs("produce_size and consume_size both zero"));
        }
        if flags.contains(QueuePairFlags::ATTACH_ONLY) {
            return Err(VmciError::NotFound);
        }

        let peer_for_handle_check = peer_cid.unwrap_or(caller_ctx);
        if handle.context != caller_ctx && handle.context != peer_for_handle_check {
            return Err(VmciError::InvalidArgs("handle context matches neither caller nor peer"));
        }

        if let Some(peer) = peer_cid {
            if self.deny_connection(caller_ctx, peer) {
                return Err(VmciError::NoAccess);
            }
        }

        let entry = Arc::new(QueuePairState {
            peer: peer_cid.unwrap_or(UNSET),
            flags,
            produce_size,
            consume_size,
            create_id: AtomicU32::new(caller_ctx),
            attach_id: AtomicU32::new(UNSET),
            refcount: AtomicUsize::new(1),
            allow_attach: AtomicBool::new(true),
            require_trusted_attach: priv_flags.contains(PrivilegeFlags::RESTRICTED),
            created_by_trusted: priv_flags.contains(PrivilegeFlags::TRUSTED),
            page_store: Mutex::new(None),
            attach_event_deferred: AtomicBool::new(false),
        });
        self.entries.lock().insert(handle, entry);

        if let Some(ctx) = self.contexts.get(caller_ctx) {
            ctx.append_queue_pair(handle);
            self.contexts.release(ctx);
        }

        debug!(?handle, caller_ctx, peer_cid, "queue pair created");
        Ok(AllocOutcome::Create)
    }

    fn attach(
        &self,
        entry: Arc<QueuePairState>,
        handle: Handle,
        flags: QueuePairFlags,
        priv_flags: PrivilegeFlags,
        produce_size: u64,
        consume_size: u64,
        caller_ctx: u32,
    ) -> VmciResult<AllocOutcome> {
        let create_id = entry.create_id.load(Ordering::Acquire);
        let attach_id = entry.attach_id.load(Ordering::Acquire);
        if caller_ctx == create_id || caller_ctx == attach_id {
            return Err(VmciError::AlreadyExists);
        }
        if !entry.allow_attach.load(Ordering::Acquire) {
            return Err(VmciError::Unavailable);
        }
        if priv_flags.contains(PrivilegeFlags::RESTRICTED) && !entry.created_by_trusted {
            return Err(VmciError::NoAccess);
        }
        if entry.require_trusted_attach && !priv_flags.contains(PrivilegeFlags::TRUSTED) {
            return Err(VmciError::NoAccess);
        }
        if entry.peer != UNSET && entry.peer != caller_ctx {
            return Err(VmciError::NoAccess);
        }

        let sizes_match = produce_size == entry.consume_size && consume_size == entry.produce_size;
        let flags_match =
            (flags - QueuePairFlags::ATTACH_ONLY) == (entry.flags - QueuePairFlags::ATTACH_ONLY);
        if !sizes_match || !flags_match {
            return Err(VmciError::QueuePairMismatch);
        }

        if !self.hosted && entry.page_store.lock().is_none() {
            return Err(VmciError::QueuePairNotSet);
        }

        if self.deny_connection(create_id, caller_ctx) {
            return Err(VmciError::NoAccess);
        }

        let defer = self.hosted && create_id == HOST_CONTEXT;
        if defer {
            entry.attach_event_deferred.store(true, Ordering::Release);
        } else {
            self.dispatcher
                .fire_event(create_id, EventPayload::QpPeerAttach { handle, peer_id: caller_ctx });
        }

        entry.attach_id.store(caller_ctx, Ordering::Release);
        entry.refcount.store(2, Ordering::Release);
        entry.allow_attach.store(false, Ordering::Release);

        if let Some(ctx) = self.contexts.get(caller_ctx) {
            ctx.append_queue_pair(handle);
            self.contexts.release(ctx);
        }

        debug!(?handle, caller_ctx, defer, "queue pair attached");
        Ok(if defer { AllocOutcome::Create } else { AllocOutcome::Attach })
    }

    /// Binds a page store to `handle`. Only the creator, or (on a hosted
    /// platform, for a host-created pair) the attached peer, may call this.
    pub fn set_page_store(&self, handle: Handle, page_store: PageStore, caller_ctx: u32) -> VmciResult<()> {
        let entry = self
            .entries
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(VmciError::NotFound)?;

        let create_id = entry.create_id.load(Ordering::Acquire);
        let attach_id = entry.attach_id.load(Ordering::Acquire);
        let is_attacher = attach_id != UNSET && caller_ctx == attach_id;
        let allowed = caller_ctx == create_id || (self.hosted && create_id == HOST_CONTEXT && is_attacher);
        if !allowed {
            return Err(VmciError::QueuePairNotOwner);
        }

        let mut slot = entry.page_store.lock();
        if slot.is_some() {
            return Err(VmciError::Unavailable);
        }
        *slot = Some(if is_attacher {
            PageStore {
                produce_name: page_store.consume_name,
                consume_name: page_store.produce_name,
            }
        } else {
            page_store
        });
        drop(slot);

        if is_attacher && entry.attach_event_deferred.swap(false, Ordering::AcqRel) {
            self.dispatcher
                .fire_event(create_id, EventPayload::QpPeerAttach { handle, peer_id: caller_ctx });
        }

        debug!(?handle, caller_ctx, "queue pair page store set");
        Ok(())
    }

    /// Probes or commits a detach of `caller_ctx` from `handle`.
    ///
    /// In probe mode (`commit=false`) nothing is mutated; the return value
    /// is the outcome a real detach would produce right now.
    pub fn detach(&self, handle: Handle, caller_ctx: u32, commit: bool) -> VmciResult<DetachOutcome> {
        let entry = self
            .entries
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(VmciError::NotFound)?;

        let create_id = entry.create_id.load(Ordering::Acquire);
        let attach_id = entry.attach_id.load(Ordering::Acquire);
        if caller_ctx != create_id && caller_ctx != attach_id {
            return Err(VmciError::QueuePairNotOwner);
        }
        let peer = if caller_ctx == create_id { attach_id } else { create_id };

        if !commit {
            let refcount = entry.refcount.load(Ordering::Acquire);
            return Ok(if refcount <= 1 || peer == UNSET || peer == HOST_CONTEXT {
                DetachOutcome::LastDetach
            } else {
                DetachOutcome::Success
            });
        }

        if caller_ctx == create_id {
            entry.create_id.store(UNSET, Ordering::Release);
        } else {
            entry.attach_id.store(UNSET, Ordering::Release);
        }
        let prev = entry.refcount.fetch_sub(1, Ordering::AcqRel);

        if let Some(ctx) = self.contexts.get(caller_ctx) {
            ctx.remove_queue_pair(handle);
            self.contexts.release(ctx);
        }

        if prev <= 1 {
            self.entries.lock().remove(&handle);
            debug!(?handle, caller_ctx, "queue pair last detach");
            return Ok(DetachOutcome::LastDetach);
        }

        if peer != UNSET {
            self.dispatcher
                .fire_event(peer, EventPayload::QpPeerDetach { handle, peer_id: caller_ctx });
        }

        debug!(?handle, caller_ctx, peer, "queue pair detach");
        Ok(if peer == HOST_CONTEXT {
            DetachOutcome::LastDetach
        } else {
            DetachOutcome::Success
        })
    }

    /// Force-detaches `caller_ctx` from every queue pair it still holds,
    /// used during [ContextRegistry] teardown. Handles that fail a normal
    /// detach (already gone) are simply dropped from the set by the caller.
    pub fn force_detach_all(&self, caller_ctx: u32, handles: &[Handle]) {
        for &handle in handles {
            let _ = self.detach(handle, caller_ctx, true);
        }
    }
}
