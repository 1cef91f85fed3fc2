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

//! The context registry: live endpoints, their datagram mailboxes, and the
//! watcher table used to fan `CTX_REMOVED` out on release.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{VmciError, VmciResult};
use crate::handle::{Handle, HandleArray, EVENT_HANDLER_RESOURCE_ID, RESERVED_CID_LIMIT};
use crate::wire::{Datagram, PrivilegeFlags, MAX_DATAGRAM_QUEUE_SIZE, MAX_EVENT_PAYLOAD};

/// Which of a context's two checkpointable sets to serialize.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CheckpointKind {
    Notifier,
    WellKnown,
}

/// The outcome of a release that may or may not have drained a context's
/// last reference.
#[derive(Debug, PartialEq, Eq)]
pub enum ContextReleaseOutcome {
    Alive,
    Dead,
}

/// Invoked exactly once, after a context's last reference is released.
/// Runs with the context's sets still intact so the caller can drain them.
pub type ContextTeardown = Box<dyn FnOnce(&ContextEntry) + Send>;

/// One entry successfully dequeued, plus a sizing hint for the next one.
pub struct Dequeued {
    pub datagram: Datagram,
    pub next_size_hint: u64,
}

/// The result of a [ContextRegistry::dequeue_datagram] call against a live
/// context: modeled as data, not as `VmciError`, since `Empty`/`TooLarge` are
/// ordinary outcomes rather than failures of the dequeue operation itself.
pub enum DequeueOutcome {
    Ready(Dequeued),
    Empty,
    TooLarge { required_size: u64 },
}

struct ContextInner {
    datagram_queue: VecDeque<Datagram>,
    pending_count: usize,
    queued_bytes: u64,
    well_known_set: HandleArray,
    group_set: HandleArray,
    queue_pair_set: HandleArray,
}

/// A live fabric endpoint.
pub struct ContextEntry {
    pub cid: u32,
    pub priv_flags: PrivilegeFlags,
    pub user_version: u32,
    domain_name: Mutex<Option<String>>,
    refcount: AtomicUsize,
    inner: Mutex<ContextInner>,
    teardown: Mutex<Option<ContextTeardown>>,
    wake: Notify,
}

impl ContextEntry {
    pub fn domain_name(&self) -> Option<String> {
        self.domain_name.lock().clone()
    }

    pub fn set_domain_name(&self, name: Option<String>) {
        *self.domain_name.lock() = name;
    }

    /// The notification primitive a consumer can await for new datagrams.
    pub fn wake(&self) -> &Notify {
        &self.wake
    }

    pub fn append_well_known(&self, id: u32) {
        self.inner.lock().well_known_set.append(Handle::new(crate::handle::WELL_KNOWN_CONTEXT, id));
    }

    pub fn remove_well_known(&self, id: u32) {
        self.inner
            .lock()
            .well_known_set
            .remove(Handle::new(crate::handle::WELL_KNOWN_CONTEXT, id));
    }

    pub fn drain_well_known(&self) -> Vec<Handle> {
        self.inner.lock().well_known_set.drain()
    }

    pub fn append_group(&self, group: Handle) {
        self.inner.lock().group_set.append(group);
    }

    pub fn remove_group(&self, group: Handle) {
        self.inner.lock().group_set.remove(group);
    }

    pub fn drain_groups(&self) -> Vec<Handle> {
        self.inner.lock().group_set.drain()
    }

    /// A snapshot of this context's current group memberships, for ACL
    /// group-fallback checks that must not also clear the set.
    pub fn groups(&self) -> Vec<Handle> {
        self.inner.lock().group_set.iter().copied().collect()
    }

    pub fn append_queue_pair(&self, qp: Handle) {
        self.inner.lock().queue_pair_set.append(qp);
    }

    pub fn remove_queue_pair(&self, qp: Handle) {
        self.inner.lock().queue_pair_set.remove(qp);
    }

    pub fn queue_pairs(&self) -> Vec<Handle> {
        self.inner.lock().queue_pair_set.iter().copied().collect()
    }

    pub fn drain_datagrams(&self) -> Vec<Datagram> {
        let mut inner = self.inner.lock();
        inner.pending_count = 0;
        inner.queued_bytes = 0;
        inner.datagram_queue.drain(..).collect()
    }
}

/// Global registry of live contexts.
///
/// `members` is the list lock from the concurrency model; `firing` is the
/// lower-rank lock guarding every context's notifier set collectively, so
/// the `CTX_REMOVED` fan-out can scan for watchers without acquiring any
/// individual context's own lock.
pub struct ContextRegistry {
    members: Mutex<Vec<Arc<ContextEntry>>>,
    firing: Mutex<HashMap<u32, HandleArray>>,
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self {
            members: Mutex::new(Vec::new()),
            firing: Mutex::new(HashMap::new()),
        }
    }
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates and registers a new context, starting at refcount 1.
    ///
    /// `cid` is a hint; on collision it is advanced past the reserved range
    /// and retried until a free id is found.
    pub fn init_context(
        &self,
        mut cid: u32,
        priv_flags: PrivilegeFlags,
        user_version: u32,
        teardown: ContextTeardown,
    ) -> VmciResult<Arc<ContextEntry>> {
        if !priv_flags.is_valid() {
            return Err(VmciError::InvalidArgs("priv_flags"));
        }
        if user_version == 0 {
            return Err(VmciError::InvalidArgs("user_version"));
        }

        let mut members = self.members.lock();
        while members.iter().any(|c| c.cid == cid) {
            cid = cid
                .max(RESERVED_CID_LIMIT - 1)
                .checked_add(1)
                .unwrap_or(RESERVED_CID_LIMIT);
        }

        let entry = Arc::new(ContextEntry {
            cid,
            priv_flags,
            user_version,
            domain_name: Mutex::new(None),
            refcount: AtomicUsize::new(1),
            inner: Mutex::new(ContextInner {
                datagram_queue: VecDeque::new(),
                pending_count: 0,
                queued_bytes: 0,
                well_known_set: HandleArray::new(),
                group_set: HandleArray::new(),
                queue_pair_set: HandleArray::new(),
            }),
            teardown: Mutex::new(Some(teardown)),
            wake: Notify::new(),
        });

        members.insert(0, entry.clone());
        drop(members);
        self.firing.lock().insert(cid, HandleArray::new());

        debug!(cid, ?priv_flags, "context initialized");
        Ok(entry)
    }

    /// Looks up a live context by id, incrementing its refcount.
    pub fn get(&self, cid: u32) -> Option<Arc<ContextEntry>> {
        let members = self.members.lock();
        let ctx = members.iter().find(|c| c.cid == cid)?.clone();
        ctx.refcount.fetch_add(1, Ordering::AcqRel);
        Some(ctx)
    }

    /// Releases one reference obtained from [Self::get].
    pub fn release(&self, ctx: Arc<ContextEntry>) -> ContextReleaseOutcome {
        self.finish_release(ctx)
    }

    /// Unlinks `cid` from the membership list, then releases the reference
    /// that unlink implicitly holds. The teardown callback fires from
    /// whichever release (this one, or a later [Self::release] by some other
    /// holder) observes the refcount reach zero.
    pub fn release_context(&self, cid: u32) -> VmciResult<ContextReleaseOutcome> {
        let ctx = {
            let mut members = self.members.lock();
            let pos = members
                .iter()
                .position(|c| c.cid == cid)
                .ok_or(VmciError::NotFound)?;
            members.remove(pos)
        };
        Ok(self.finish_release(ctx))
    }

    fn finish_release(&self, ctx: Arc<ContextEntry>) -> ContextReleaseOutcome {
        let prev = ctx.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "refcount underflow");
        if prev == 1 {
            self.firing.lock().remove(&ctx.cid);
            if let Some(teardown) = ctx.teardown.lock().take() {
                teardown(&ctx);
            }
            debug!(cid = ctx.cid, "context released");
            ContextReleaseOutcome::Dead
        } else {
            ContextReleaseOutcome::Alive
        }
    }

    pub fn add_notification(&self, cid: u32, remote_cid: u32) -> VmciResult<()> {
        let mut firing = self.firing.lock();
        let set = firing.get_mut(&cid).ok_or(VmciError::NotFound)?;
        set.append(Handle::new(remote_cid, EVENT_HANDLER_RESOURCE_ID));
        Ok(())
    }

    pub fn remove_notification(&self, cid: u32, remote_cid: u32) -> VmciResult<()> {
        let mut firing = self.firing.lock();
        let set = firing.get_mut(&cid).ok_or(VmciError::NotFound)?;
        set.remove(Handle::new(remote_cid, EVENT_HANDLER_RESOURCE_ID));
        Ok(())
    }

    /// Collects every live context watching for `removed_cid`'s removal.
    pub fn collect_notifier_targets(&self, removed_cid: u32) -> Vec<u32> {
        let target = Handle::new(removed_cid, EVENT_HANDLER_RESOURCE_ID);
        self.firing
            .lock()
            .iter()
            .filter(|(_, set)| set.has(target))
            .map(|(cid, _)| *cid)
            .collect()
    }

    pub fn get_checkpoint_state(&self, cid: u32, kind: CheckpointKind) -> VmciResult<Vec<u32>> {
        match kind {
            CheckpointKind::Notifier => {
                let firing = self.firing.lock();
                let set = firing.get(&cid).ok_or(VmciError::NotFound)?;
                Ok(set.iter().map(|h| h.context).collect())
            }
            CheckpointKind::WellKnown => {
                let ctx = self.get(cid).ok_or(VmciError::NotFound)?;
                let ids = ctx
                    .inner
                    .lock()
                    .well_known_set
                    .iter()
                    .map(|h| h.resource)
                    .collect();
                self.release(ctx);
                Ok(ids)
            }
        }
    }

    /// Enqueues `dg` onto `cid`'s mailbox, enforcing the two size ceilings
    /// (ordinary vs. hypervisor-sourced). Returns the enqueued byte count.
    pub fn enqueue_datagram(&self, cid: u32, dg: Datagram) -> VmciResult<u64> {
        let ctx = self.get(cid).ok_or(VmciError::DstUnreachable)?;
        let size = dg.wire_size();
        let hypervisor_src = dg.src
            == Handle::new(
                crate::handle::HYPERVISOR_CONTEXT,
                crate::handle::CONTEXT_RESOURCE_ID,
            );
        let ceiling = if hypervisor_src {
            MAX_DATAGRAM_QUEUE_SIZE + 1024 * (crate::wire::DG_HEADER_SIZE + MAX_EVENT_PAYLOAD as u64)
        } else {
            MAX_DATAGRAM_QUEUE_SIZE
        };

        let result = {
            let mut inner = ctx.inner.lock();
            if inner.queued_bytes + size >= ceiling {
                Err(VmciError::NoResources)
            } else {
                inner.datagram_queue.push_back(dg);
                inner.pending_count += 1;
                inner.queued_bytes += size;
                Ok(size)
            }
        };
        if result.is_ok() {
            ctx.wake.notify_one();
        }
        self.release(ctx.clone());
        result
    }

    /// Dequeues the head of `cid`'s mailbox if it fits in `max_size` bytes.
    pub fn dequeue_datagram(&self, cid: u32, max_size: u64) -> VmciResult<DequeueOutcome> {
        let ctx = self.get(cid).ok_or(VmciError::NotFound)?;
        let outcome = {
            let mut inner = ctx.inner.lock();
            if inner.pending_count == 0 {
                DequeueOutcome::Empty
            } else {
                let head_size = inner.datagram_queue.front().expect("pending_count consistency").wire_size();
                if head_size > max_size {
                    DequeueOutcome::TooLarge { required_size: head_size }
                } else {
                    let datagram = inner.datagram_queue.pop_front().expect("pending_count consistency");
                    inner.pending_count -= 1;
                    inner.queued_bytes -= head_size;
                    let next_size_hint = inner
                        .datagram_queue
                        .front()
                        .map(|d| d.wire_size())
                        .unwrap_or(0);
                    DequeueOutcome::Ready(Dequeued { datagram, next_size_hint })
                }
            }
        };
        self.release(ctx);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_teardown() -> ContextTeardown {
        Box::new(|_| {})
    }

    #[test]
    fn init_assigns_requested_cid() {
        let registry = ContextRegistry::new();
        let ctx = registry
            .init_context(50, PrivilegeFlags::LEAST_PRIVILEGE, 1, noop_teardown())
            .unwrap();
        assert_eq!(ctx.cid, 50);
    }

    #[test]
    fn init_resolves_collision() {
        let registry = ContextRegistry::new();
        registry
            .init_context(50, PrivilegeFlags::LEAST_PRIVILEGE, 1, noop_teardown())
            .unwrap();
        let second = registry
            .init_context(50, PrivilegeFlags::LEAST_PRIVILEGE, 1, noop_teardown())
            .unwrap();
        assert_ne!(second.cid, 50);
        assert!(second.cid >= RESERVED_CID_LIMIT);
    }

    #[test]
    fn release_context_runs_teardown_once() {
        let registry = ContextRegistry::new();
        let freed = Arc::new(AtomicUsize::new(0));
        let freed2 = freed.clone();
        let ctx = registry
            .init_context(
                90,
                PrivilegeFlags::LEAST_PRIVILEGE,
                1,
                Box::new(move |_| {
                    freed2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        drop(ctx);

        assert_eq!(
            registry.release_context(90).unwrap(),
            ContextReleaseOutcome::Dead
        );
        assert_eq!(freed.load(Ordering::SeqCst), 1);
        assert!(registry.get(90).is_none());
    }

    #[test]
    fn release_context_deferred_while_get_outstanding() {
        let registry = ContextRegistry::new();
        let freed = Arc::new(AtomicUsize::new(0));
        let freed2 = freed.clone();
        registry
            .init_context(
                95,
                PrivilegeFlags::LEAST_PRIVILEGE,
                1,
                Box::new(move |_| {
                    freed2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let held = registry.get(95).unwrap();
        assert_eq!(
            registry.release_context(95).unwrap(),
            ContextReleaseOutcome::Alive
        );
        assert_eq!(freed.load(Ordering::SeqCst), 0);
        assert!(registry.get(95).is_none());

        assert_eq!(registry.release(held), ContextReleaseOutcome::Dead);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn notification_fan_out_scenario() {
        let registry = ContextRegistry::new();
        registry
            .init_context(90, PrivilegeFlags::LEAST_PRIVILEGE, 1, noop_teardown())
            .unwrap();
        registry
            .init_context(91, PrivilegeFlags::LEAST_PRIVILEGE, 1, noop_teardown())
            .unwrap();

        registry.add_notification(90, 91).unwrap();
        let targets = registry.collect_notifier_targets(91);
        assert_eq!(targets, vec![90]);
    }

    #[test]
    fn add_then_remove_notification_is_noop() {
        let registry = ContextRegistry::new();
        registry
            .init_context(90, PrivilegeFlags::LEAST_PRIVILEGE, 1, noop_teardown())
            .unwrap();
        registry.add_notification(90, 91).unwrap();
        registry.remove_notification(90, 91).unwrap();
        assert!(registry.collect_notifier_targets(91).is_empty());
    }

    #[test]
    fn enqueue_dequeue_round_trip() {
        let registry = ContextRegistry::new();
        registry
            .init_context(50, PrivilegeFlags::LEAST_PRIVILEGE, 1, noop_teardown())
            .unwrap();

        let dg = Datagram {
            src: Handle::new(50, 7),
            dst: Handle::new(2, 100),
            payload: vec![1, 2, 3, 4],
        };
        let size = registry.enqueue_datagram(50, dg.clone()).unwrap();
        assert_eq!(size, 28);

        match registry.dequeue_datagram(50, 1024).unwrap() {
            DequeueOutcome::Ready(d) => {
                assert_eq!(d.datagram, dg);
                assert_eq!(d.next_size_hint, 0);
            }
            _ => panic!("expected Ready"),
        }

        assert!(matches!(
            registry.dequeue_datagram(50, 1024).unwrap(),
            DequeueOutcome::Empty
        ));
    }

    #[test]
    fn dequeue_too_large_reports_required_size() {
        let registry = ContextRegistry::new();
        registry
            .init_context(50, PrivilegeFlags::LEAST_PRIVILEGE, 1, noop_teardown())
            .unwrap();
        let dg = Datagram {
            src: Handle::new(50, 7),
            dst: Handle::new(2, 100),
            payload: vec![0; 10],
        };
        registry.enqueue_datagram(50, dg).unwrap();

        match registry.dequeue_datagram(50, 4).unwrap() {
            DequeueOutcome::TooLarge { required_size } => assert_eq!(required_size, 34),
            _ => panic!("expected TooLarge"),
        }
    }

    #[test]
    fn enqueue_rejects_at_ceiling_for_ordinary_sources() {
        let registry = ContextRegistry::new();
        registry
            .init_context(50, PrivilegeFlags::LEAST_PRIVILEGE, 1, noop_teardown())
            .unwrap();
        let huge = Datagram {
            src: Handle::new(50, 7),
            dst: Handle::new(2, 100),
            payload: vec![0; MAX_DATAGRAM_QUEUE_SIZE as usize],
        };
        assert_eq!(
            registry.enqueue_datagram(50, huge),
            Err(VmciError::NoResources)
        );
    }
}
