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

//! [VmciFabric]: the single-process facade aggregating every component into
//! the operation surface an embedder or `vmci-ctl` actually calls.

use std::sync::Arc;

use tracing::warn;

use crate::config::VmciConfig;
use crate::context::{CheckpointKind, ContextRegistry, ContextReleaseOutcome, Dequeued, DequeueOutcome};
use crate::datagram::{DatagramDispatcher, RecvCallback, WELL_KNOWN_DG_HND};
use crate::discovery::{DiscoveryRequest, DiscoveryResponse, DiscoveryService, DISCOVERY_WELL_KNOWN_ID};
use crate::error::{VmciError, VmciResult};
use crate::event::{EventBus, EventCallback};
use crate::group::GroupRegistry;
use crate::handle::{Handle, HOST_CONTEXT, HYPERVISOR_CONTEXT};
use crate::queuepair::{AllocOutcome, DetachOutcome, PageStore, QueuePairFlags, QueuePairManager};
use crate::resource::{Privilege, PrivilegeCheck, ResourceTable};
use crate::wire::{Datagram, EventKind, EventPayload, PrivilegeFlags};

/// The "client handle" convention used wherever a context itself, rather
/// than one of its resources, needs to appear as a `Handle`: resource id 0
/// under the context's own cid.
fn context_handle(cid: u32) -> Handle {
    Handle::new(cid, 0)
}

/// Aggregates the context registry, resource table, discovery service,
/// event bus, group registry, datagram dispatcher and queue-pair manager
/// behind the single operation surface described for this fabric.
///
/// Construction wires the cross-module orchestration the individual
/// components deliberately don't know about themselves: context teardown's
/// fan-out of `CTX_REMOVED`, well-known-mapping and queue-pair cleanup, and
/// the discovery service's own well-known datagram endpoint.
pub struct VmciFabric {
    contexts: Arc<ContextRegistry>,
    resources: Arc<ResourceTable>,
    events: Arc<EventBus>,
    discovery: Arc<DiscoveryService>,
    groups: Arc<GroupRegistry>,
    dispatcher: Arc<DatagramDispatcher>,
    queue_pairs: Arc<QueuePairManager>,
}

impl VmciFabric {
    pub fn new(config: VmciConfig) -> Self {
        let resources = Arc::new(ResourceTable::new(config.resource_table_buckets));
        let contexts = Arc::new(ContextRegistry::new());
        let events = Arc::new(EventBus::new());
        let dispatcher = Arc::new(DatagramDispatcher::new(
            resources.clone(),
            contexts.clone(),
            events.clone(),
            config.well_known_allow_policy(),
        ));
        let discovery = Arc::new(DiscoveryService::new(resources.clone()));
        let groups = Arc::new(GroupRegistry::new(resources.clone(), contexts.clone()));
        let queue_pairs = Arc::new(QueuePairManager::new(
            contexts.clone(),
            dispatcher.clone(),
            config.hosted_queue_pairs,
        ));

        let fabric = Self {
            contexts,
            resources,
            events,
            discovery,
            groups,
            dispatcher,
            queue_pairs,
        };
        fabric.register_discovery_endpoint();
        fabric
    }

    /// Reserves [DISCOVERY_WELL_KNOWN_ID] for the discovery service and
    /// wires its recv callback to decode a [DiscoveryRequest], run it, and
    /// dispatch the [DiscoveryResponse] back to the requester.
    fn register_discovery_endpoint(&self) {
        let discovery = self.discovery.clone();
        let contexts = self.contexts.clone();
        let dispatcher_weak = Arc::downgrade(&self.dispatcher);

        let recv_cb: RecvCallback = Arc::new(move |dg: &Datagram| {
            let Some(dispatcher) = dispatcher_weak.upgrade() else {
                return;
            };
            let request: DiscoveryRequest = match serde_json::from_slice(&dg.payload) {
                Ok(request) => request,
                Err(err) => {
                    warn!(?err, "malformed discovery request");
                    return;
                }
            };

            let sender_ctx = dg.src.context;
            let sender_priv = if sender_ctx == HYPERVISOR_CONTEXT || sender_ctx == HOST_CONTEXT {
                PrivilegeFlags::MAX_PRIVILEGE
            } else if let Some(ctx) = contexts.get(sender_ctx) {
                let p = ctx.priv_flags;
                contexts.release(ctx);
                p
            } else {
                PrivilegeFlags::empty()
            };

            let response: DiscoveryResponse = discovery.handle_request(request, sender_ctx, sender_priv);
            let payload = match serde_json::to_vec(&response) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(?err, "failed to encode discovery response");
                    return;
                }
            };
            let reply = Datagram {
                src: Handle::new(crate::handle::WELL_KNOWN_CONTEXT, DISCOVERY_WELL_KNOWN_ID),
                dst: dg.src,
                payload,
            };
            if let Err(err) = dispatcher.dispatch(HOST_CONTEXT, reply) {
                warn!(?err, "discovery response undeliverable");
            }
        });

        self.dispatcher
            .create_handle(
                Some(DISCOVERY_WELL_KNOWN_ID),
                WELL_KNOWN_DG_HND,
                PrivilegeFlags::empty(),
                context_handle(HOST_CONTEXT),
                recv_cb,
            )
            .expect("reserved discovery well-known id must be free at startup");
    }

    // --- Context lifecycle -------------------------------------------------

    /// Registers a new context, returning its assigned cid. Wires teardown
    /// to fan `CTX_REMOVED` out to every watcher, drop the well-known
    /// mappings and queue pairs the context still held, leave any groups it
    /// was a member of, drop its pending discovery registrations, and drain
    /// its datagram mailbox.
    pub fn init_context(&self, cid: u32, priv_flags: PrivilegeFlags, user_version: u32) -> VmciResult<u32> {
        let dispatcher = self.dispatcher.clone();
        let contexts = self.contexts.clone();
        let discovery = self.discovery.clone();
        let queue_pairs = self.queue_pairs.clone();
        let groups = self.groups.clone();

        let teardown = Box::new(move |ctx: &crate::context::ContextEntry| {
            let removed_cid = ctx.cid;

            for target in contexts.collect_notifier_targets(removed_cid) {
                dispatcher.fire_event(target, EventPayload::CtxRemoved { context_id: removed_cid });
            }

            for well_known in ctx.drain_well_known() {
                let _ = dispatcher.remove_well_known_map(well_known.resource, removed_cid);
            }

            queue_pairs.force_detach_all(removed_cid, &ctx.queue_pairs());

            for group in ctx.drain_groups() {
                let _ = groups.remove_member(group, context_handle(removed_cid));
            }

            discovery.remove_context_entries(removed_cid);
            ctx.drain_datagrams();
        });

        let entry = self.contexts.init_context(cid, priv_flags, user_version, teardown)?;
        Ok(entry.cid)
    }

    /// Releases the fabric's own hold on `cid`. Teardown runs once the last
    /// outstanding reference (held by, e.g., an in-flight [Self::dequeue_datagram_blocking])
    /// is released.
    pub fn release_context(&self, cid: u32) -> VmciResult<()> {
        self.contexts.release_context(cid).map(|_: ContextReleaseOutcome| ())
    }

    pub fn context_get_priv_flags(&self, cid: u32) -> VmciResult<PrivilegeFlags> {
        let ctx = self.contexts.get(cid).ok_or(VmciError::NotFound)?;
        let flags = ctx.priv_flags;
        self.contexts.release(ctx);
        Ok(flags)
    }

    pub fn add_notification(&self, cid: u32, remote_cid: u32) -> VmciResult<()> {
        self.contexts.add_notification(cid, remote_cid)
    }

    pub fn remove_notification(&self, cid: u32, remote_cid: u32) -> VmciResult<()> {
        self.contexts.remove_notification(cid, remote_cid)
    }

    pub fn get_checkpoint_state(&self, cid: u32, kind: CheckpointKind) -> VmciResult<Vec<u32>> {
        self.contexts.get_checkpoint_state(cid, kind)
    }

    /// Plays a checkpointed set back through the operation that originally
    /// built it: notifier ids through [Self::add_notification], well-known
    /// ids through the dispatcher's well-known map.
    pub fn set_checkpoint_state(&self, cid: u32, kind: CheckpointKind, ids: &[u32]) -> VmciResult<()> {
        match kind {
            CheckpointKind::Notifier => {
                for &remote_cid in ids {
                    self.contexts.add_notification(cid, remote_cid)?;
                }
            }
            CheckpointKind::WellKnown => {
                let priv_flags = self.context_get_priv_flags(cid)?;
                for &id in ids {
                    self.dispatcher.request_well_known_map(id, cid, priv_flags)?;
                }
            }
        }
        Ok(())
    }

    // --- Datagrams -----------------------------------------------------

    pub fn datagram_create(
        &self,
        resource_id: Option<u32>,
        flags: u32,
        priv_flags: PrivilegeFlags,
        owner: Handle,
        recv_cb: RecvCallback,
    ) -> VmciResult<Handle> {
        self.dispatcher.create_handle(resource_id, flags, priv_flags, owner, recv_cb)
    }

    pub async fn datagram_destroy(&self, handle: Handle) -> VmciResult<()> {
        self.dispatcher.destroy(handle).await
    }

    pub fn datagram_dispatch(&self, sender_cid: u32, dg: Datagram) -> VmciResult<u64> {
        self.dispatcher.dispatch(sender_cid, dg)
    }

    pub fn enqueue_datagram(&self, cid: u32, dg: Datagram) -> VmciResult<u64> {
        self.contexts.enqueue_datagram(cid, dg)
    }

    pub fn dequeue_datagram(&self, cid: u32, max_size: u64) -> VmciResult<DequeueOutcome> {
        self.contexts.dequeue_datagram(cid, max_size)
    }

    /// Blocks until a datagram is available for `cid`, honoring the same
    /// `max_size` contract as [Self::dequeue_datagram]. Spurious wakeups are
    /// retried; concurrent consumers racing for the same datagram just loop
    /// again on an `Empty` outcome.
    pub async fn dequeue_datagram_blocking(&self, cid: u32, max_size: u64) -> VmciResult<Dequeued> {
        let ctx = self.contexts.get(cid).ok_or(VmciError::NotFound)?;
        let result = loop {
            match self.contexts.dequeue_datagram(cid, max_size)? {
                DequeueOutcome::Ready(d) => break Ok(d),
                DequeueOutcome::TooLarge { .. } => break Err(VmciError::NoMem),
                DequeueOutcome::Empty => ctx.wake().notified().await,
            }
        };
        self.contexts.release(ctx);
        result
    }

    // --- Events ----------------------------------------------------------

    pub fn event_subscribe(&self, kind: EventKind, callback: EventCallback) -> VmciResult<u64> {
        self.events.subscribe(kind, callback)
    }

    pub fn event_unsubscribe(&self, id: u64) -> VmciResult<()> {
        self.events.unsubscribe(id)
    }

    // --- Discovery ---------------------------------------------------------

    pub fn discovery_register(&self, name: &str, handle: Handle, ctx: u32) -> VmciResult<()> {
        self.discovery.register(name, handle, ctx)
    }

    pub fn discovery_unregister(&self, name: &str, ctx: u32) -> VmciResult<()> {
        self.discovery.unregister(name, ctx)
    }

    pub fn discovery_lookup(&self, name: &str) -> VmciResult<Handle> {
        self.discovery.lookup(name)
    }

    // --- Groups ------------------------------------------------------------

    pub fn group_create(&self, handle: Handle, owner: Handle) -> VmciResult<()> {
        self.groups.create_group(handle, owner)
    }

    pub fn group_add_member(&self, group: Handle, member_cid: u32, can_assign: bool) -> VmciResult<()> {
        self.groups.add_member(group, context_handle(member_cid), can_assign)
    }

    pub fn group_remove_member(&self, group: Handle, member_cid: u32) -> VmciResult<()> {
        self.groups.remove_member(group, context_handle(member_cid))
    }

    pub fn group_is_member(&self, group: Handle, member_cid: u32) -> VmciResult<bool> {
        self.groups.is_member(group, context_handle(member_cid))
    }

    // --- Queue pairs --------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn queue_pair_alloc(
        &self,
        handle: Handle,
        peer_cid: Option<u32>,
        flags: QueuePairFlags,
        priv_flags: PrivilegeFlags,
        produce_size: u64,
        consume_size: u64,
        caller_ctx: u32,
    ) -> VmciResult<AllocOutcome> {
        self.queue_pairs
            .alloc(handle, peer_cid, flags, priv_flags, produce_size, consume_size, caller_ctx)
    }

    pub fn queue_pair_set_page_store(&self, handle: Handle, page_store: PageStore, caller_ctx: u32) -> VmciResult<()> {
        self.queue_pairs.set_page_store(handle, page_store, caller_ctx)
    }

    pub fn queue_pair_detach(&self, handle: Handle, caller_ctx: u32) -> VmciResult<DetachOutcome> {
        self.queue_pairs.detach(handle, caller_ctx, true)
    }

    /// Accessor for callers (e.g. `vmci-ctl`) that need direct resource-table
    /// access beyond what this facade's operation surface covers, such as
    /// inspecting a client ACL for diagnostics.
    pub fn resources(&self) -> &Arc<ResourceTable> {
        &self.resources
    }

    /// Checks whether `client_ctx` holds `privilege` on `resource`, walking
    /// `client_ctx`'s own group memberships as the fallback the direct ACL
    /// lookup defers to.
    pub fn check_client_privilege(
        &self,
        resource: Handle,
        client_ctx: u32,
        privilege: Privilege,
    ) -> VmciResult<PrivilegeCheck> {
        let groups = match self.contexts.get(client_ctx) {
            Some(ctx) => {
                let groups = ctx.groups();
                self.contexts.release(ctx);
                groups
            }
            None => Vec::new(),
        };
        self.resources
            .check_client_privilege(resource, context_handle(client_ctx), privilege, &groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fabric() -> VmciFabric {
        VmciFabric::new(VmciConfig::default())
    }

    #[test]
    fn host_endpoint_round_trip_through_facade() {
        let fabric = fabric();
        let cid = fabric
            .init_context(50, PrivilegeFlags::empty(), 1)
            .unwrap();

        let received = Arc::new(parking_lot::Mutex::new(None));
        let received2 = received.clone();
        let handle = fabric
            .datagram_create(
                Some(200),
                0,
                PrivilegeFlags::empty(),
                context_handle(HOST_CONTEXT),
                Arc::new(move |dg: &Datagram| {
                    *received2.lock() = Some(dg.payload.clone());
                }),
            )
            .unwrap();

        let dg = Datagram {
            src: Handle::new(cid, 1),
            dst: handle,
            payload: vec![7, 7, 7],
        };
        fabric.datagram_dispatch(cid, dg).unwrap();
        assert_eq!(received.lock().clone(), Some(vec![7, 7, 7]));
    }

    #[test]
    fn discovery_round_trips_through_well_known_endpoint() {
        let fabric = fabric();
        let cid = fabric.init_context(55, PrivilegeFlags::TRUSTED, 1).unwrap();

        let target = Handle::new(cid, 9);
        fabric.discovery_register("svc.test", target, cid).unwrap();
        assert_eq!(fabric.discovery_lookup("svc.test"), Ok(target));

        let reply = Arc::new(parking_lot::Mutex::new(None));
        let reply2 = reply.clone();
        let requester = fabric
            .datagram_create(
                None,
                0,
                PrivilegeFlags::empty(),
                context_handle(cid),
                Arc::new(move |dg: &Datagram| {
                    let response: DiscoveryResponse = serde_json::from_slice(&dg.payload).unwrap();
                    *reply2.lock() = Some(response);
                }),
            )
            .unwrap();

        let request = DiscoveryRequest {
            action: crate::discovery::DiscoveryAction::Lookup,
            name: "svc.test".to_owned(),
            handle: Handle::INVALID,
        };
        let dg = Datagram {
            src: requester,
            dst: Handle::new(crate::handle::WELL_KNOWN_CONTEXT, DISCOVERY_WELL_KNOWN_ID),
            payload: serde_json::to_vec(&request).unwrap(),
        };
        fabric.datagram_dispatch(HOST_CONTEXT, dg).unwrap();

        assert_eq!(reply.lock().as_ref().unwrap().handle, target);
    }

    #[test]
    fn context_removal_fans_ctx_removed_out_to_watcher() {
        let fabric = fabric();
        let watcher = fabric.init_context(90, PrivilegeFlags::empty(), 1).unwrap();
        let removed = fabric.init_context(91, PrivilegeFlags::empty(), 1).unwrap();
        fabric.add_notification(watcher, removed).unwrap();

        fabric.release_context(removed).unwrap();

        match fabric.dequeue_datagram(watcher, 1024).unwrap() {
            DequeueOutcome::Ready(d) => {
                let payload: EventPayload = serde_json::from_slice(&d.datagram.payload).unwrap();
                assert_eq!(payload, EventPayload::CtxRemoved { context_id: removed });
            }
            _ => panic!("expected a queued CTX_REMOVED datagram"),
        }
    }

    #[test]
    fn context_removal_force_detaches_queue_pairs() {
        let fabric = fabric();
        let creator = fabric.init_context(80, PrivilegeFlags::empty(), 1).unwrap();
        let attacher = fabric.init_context(81, PrivilegeFlags::empty(), 1).unwrap();

        let handle = Handle::new(creator, 9);
        fabric
            .queue_pair_alloc(handle, Some(attacher), QueuePairFlags::empty(), PrivilegeFlags::empty(), 4096, 4096, creator)
            .unwrap();
        fabric
            .queue_pair_set_page_store(
                handle,
                PageStore {
                    produce_name: "p".into(),
                    consume_name: "c".into(),
                },
                creator,
            )
            .unwrap();
        fabric
            .queue_pair_alloc(handle, None, QueuePairFlags::empty(), PrivilegeFlags::empty(), 4096, 4096, attacher)
            .unwrap();

        fabric.release_context(creator).unwrap();

        // The creator's half was force-detached by teardown; the attacher
        // is now the sole remaining participant, so its own detach is the
        // last one.
        assert_eq!(
            fabric.queue_pair_detach(handle, attacher),
            Ok(DetachOutcome::LastDetach)
        );
    }

    #[test]
    fn group_membership_and_event_subscribe_both_work_through_facade() {
        let fabric = fabric();
        let owner = fabric.init_context(50, PrivilegeFlags::empty(), 1).unwrap();
        let group = Handle::new(crate::handle::WELL_KNOWN_CONTEXT, 7);
        fabric.group_create(group, context_handle(owner)).unwrap();
        fabric.group_add_member(group, 60, false).unwrap();
        assert!(fabric.group_is_member(group, 60).unwrap());

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        fabric
            .event_subscribe(
                EventKind::CtxRemoved,
                Arc::new(move |_| {
                    count2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        fabric.dispatcher.fire_event(HOST_CONTEXT, EventPayload::CtxRemoved { context_id: owner });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn checkpoint_state_round_trips_through_set_checkpoint_state() {
        let fabric = fabric();
        let cid = fabric.init_context(65, PrivilegeFlags::empty(), 1).unwrap();
        fabric.add_notification(cid, 1).unwrap();
        fabric.add_notification(cid, 2).unwrap();

        let saved = fabric.get_checkpoint_state(cid, CheckpointKind::Notifier).unwrap();

        let restored_cid = fabric.init_context(66, PrivilegeFlags::empty(), 1).unwrap();
        fabric
            .set_checkpoint_state(restored_cid, CheckpointKind::Notifier, &saved)
            .unwrap();
        let restored = fabric
            .get_checkpoint_state(restored_cid, CheckpointKind::Notifier)
            .unwrap();
        assert_eq!(restored, saved);
    }
}
