//! Black-box end-to-end scenarios against the public [VmciFabric] facade,
//! one per lifecycle or delivery path the fabric exposes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use vmci_core::config::VmciConfig;
use vmci_core::context::{CheckpointKind, DequeueOutcome};
use vmci_core::discovery::{DiscoveryAction, DiscoveryRequest, DiscoveryResponse};
use vmci_core::error::VmciError;
use vmci_core::fabric::VmciFabric;
use vmci_core::handle::{Handle, HOST_CONTEXT, WELL_KNOWN_CONTEXT};
use vmci_core::queuepair::{AllocOutcome, DetachOutcome, PageStore, QueuePairFlags};
use vmci_core::resource::{Privilege, PrivilegeCheck, ResourceKind};
use vmci_core::wire::{Datagram, EventKind, EventPayload, PrivilegeFlags};

fn fabric() -> VmciFabric {
    VmciFabric::new(VmciConfig::default())
}

#[test]
fn host_endpoint_round_trip() {
    let fabric = fabric();
    let guest = fabric.init_context(50, PrivilegeFlags::empty(), 1).unwrap();

    let received = Arc::new(parking_lot::Mutex::new(None));
    let received2 = received.clone();
    let endpoint = fabric
        .datagram_create(
            Some(300),
            0,
            PrivilegeFlags::empty(),
            Handle::new(HOST_CONTEXT, 0),
            Arc::new(move |dg: &Datagram| {
                *received2.lock() = Some(dg.payload.clone());
            }),
        )
        .unwrap();

    let dg = Datagram {
        src: Handle::new(guest, 1),
        dst: endpoint,
        payload: vec![1, 2, 3, 4, 5],
    };
    let size = fabric.datagram_dispatch(guest, dg).unwrap();
    assert_eq!(size, 24 + 5);
    assert_eq!(received.lock().clone(), Some(vec![1, 2, 3, 4, 5]));
}

#[test]
fn well_known_routing_reaches_owning_context() {
    let fabric = fabric();
    let owner = fabric.init_context(60, PrivilegeFlags::empty(), 1).unwrap();
    let sender = fabric.init_context(61, PrivilegeFlags::empty(), 1).unwrap();

    fabric
        .set_checkpoint_state(owner, CheckpointKind::WellKnown, &[4242])
        .unwrap();

    let dg = Datagram {
        src: Handle::new(sender, 1),
        dst: Handle::new(WELL_KNOWN_CONTEXT, 4242),
        payload: vec![9; 4],
    };
    fabric.datagram_dispatch(sender, dg).unwrap();

    match fabric.dequeue_datagram(owner, 1024).unwrap() {
        DequeueOutcome::Ready(d) => assert_eq!(d.datagram.dst, Handle::new(WELL_KNOWN_CONTEXT, 4242)),
        _ => panic!("expected a queued datagram at the well-known id's owner"),
    }
}

#[test]
fn acl_denies_restricted_context_talking_to_untrusted_endpoint() {
    let fabric = fabric();
    let restricted = fabric
        .init_context(70, PrivilegeFlags::RESTRICTED, 1)
        .unwrap();

    let called = Arc::new(AtomicUsize::new(0));
    let called2 = called.clone();
    let endpoint = fabric
        .datagram_create(
            Some(301),
            0,
            PrivilegeFlags::LEAST_PRIVILEGE,
            Handle::new(HOST_CONTEXT, 0),
            Arc::new(move |_| {
                called2.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    let dg = Datagram {
        src: Handle::new(restricted, 1),
        dst: endpoint,
        payload: vec![],
    };
    assert_eq!(fabric.datagram_dispatch(restricted, dg), Err(VmciError::NoAccess));
    assert_eq!(called.load(Ordering::SeqCst), 0);
}

#[test]
fn queue_pair_create_attach_detach_lifecycle() {
    let fabric = fabric();
    let creator = fabric.init_context(80, PrivilegeFlags::empty(), 1).unwrap();
    let attacher = fabric.init_context(81, PrivilegeFlags::empty(), 1).unwrap();

    let handle = Handle::new(creator, 9);
    let outcome = fabric
        .queue_pair_alloc(handle, Some(attacher), QueuePairFlags::empty(), PrivilegeFlags::empty(), 8192, 8192, creator)
        .unwrap();
    assert_eq!(outcome, AllocOutcome::Create);

    fabric
        .queue_pair_set_page_store(
            handle,
            PageStore {
                produce_name: "produce-q".into(),
                consume_name: "consume-q".into(),
            },
            creator,
        )
        .unwrap();

    let outcome = fabric
        .queue_pair_alloc(handle, None, QueuePairFlags::empty(), PrivilegeFlags::empty(), 8192, 8192, attacher)
        .unwrap();
    assert_eq!(outcome, AllocOutcome::Attach);

    assert_eq!(fabric.queue_pair_detach(handle, creator).unwrap(), DetachOutcome::Success);
    assert_eq!(fabric.queue_pair_detach(handle, attacher).unwrap(), DetachOutcome::LastDetach);
    assert_eq!(fabric.queue_pair_detach(handle, attacher), Err(VmciError::NotFound));
}

#[test]
fn context_release_fans_ctx_removed_to_every_watcher() {
    let fabric = fabric();
    let watcher_a = fabric.init_context(90, PrivilegeFlags::empty(), 1).unwrap();
    let watcher_b = fabric.init_context(91, PrivilegeFlags::empty(), 1).unwrap();
    let removed = fabric.init_context(92, PrivilegeFlags::empty(), 1).unwrap();

    fabric.add_notification(watcher_a, removed).unwrap();
    fabric.add_notification(watcher_b, removed).unwrap();

    fabric.release_context(removed).unwrap();

    for watcher in [watcher_a, watcher_b] {
        match fabric.dequeue_datagram(watcher, 1024).unwrap() {
            DequeueOutcome::Ready(d) => {
                let payload: EventPayload = serde_json::from_slice(&d.datagram.payload).unwrap();
                assert_eq!(payload, EventPayload::CtxRemoved { context_id: removed });
            }
            _ => panic!("watcher {watcher} missed the CTX_REMOVED fan-out"),
        }
    }
}

#[tokio::test]
async fn release_is_deferred_until_blocking_consumer_releases_its_reference() {
    let fabric = Arc::new(fabric());
    let watcher = fabric.init_context(100, PrivilegeFlags::empty(), 1).unwrap();
    let held = fabric.init_context(101, PrivilegeFlags::empty(), 1).unwrap();
    fabric.add_notification(watcher, held).unwrap();

    let fabric2 = fabric.clone();
    let blocking = tokio::spawn(async move { fabric2.dequeue_datagram_blocking(held, 4096).await });
    tokio::task::yield_now().await;

    fabric.release_context(held).unwrap();

    // The blocking consumer above still holds a reference, so teardown (and
    // the CTX_REMOVED fan-out it produces) hasn't run yet.
    assert!(matches!(
        fabric.dequeue_datagram(watcher, 4096).unwrap(),
        DequeueOutcome::Empty
    ));

    blocking.abort();
    let _ = blocking.await;
}

#[test]
fn double_release_of_the_same_context_is_rejected() {
    let fabric = fabric();
    let cid = fabric.init_context(101, PrivilegeFlags::empty(), 1).unwrap();
    fabric.release_context(cid).unwrap();
    assert_eq!(fabric.release_context(cid), Err(VmciError::NotFound));
}

#[test]
fn discovery_lookup_round_trips_through_well_known_endpoint() {
    let fabric = fabric();
    let owner = fabric.init_context(110, PrivilegeFlags::TRUSTED, 1).unwrap();
    let target = Handle::new(owner, 55);
    fabric.discovery_register("vmci-ctl.tests.echo", target, owner).unwrap();

    let reply = Arc::new(parking_lot::Mutex::new(None));
    let reply2 = reply.clone();
    let requester = fabric
        .datagram_create(
            None,
            0,
            PrivilegeFlags::empty(),
            Handle::new(owner, 0),
            Arc::new(move |dg: &Datagram| {
                *reply2.lock() = serde_json::from_slice::<DiscoveryResponse>(&dg.payload).ok();
            }),
        )
        .unwrap();

    let request = DiscoveryRequest {
        action: DiscoveryAction::Lookup,
        name: "vmci-ctl.tests.echo".to_owned(),
        handle: Handle::INVALID,
    };
    let dg = Datagram {
        src: requester,
        dst: Handle::new(WELL_KNOWN_CONTEXT, vmci_core::discovery::DISCOVERY_WELL_KNOWN_ID),
        payload: serde_json::to_vec(&request).unwrap(),
    };
    fabric.datagram_dispatch(owner, dg).unwrap();

    assert_eq!(reply.lock().as_ref().unwrap().handle, target);
}

#[test]
fn group_acl_grants_and_denies_assign_client() {
    let fabric = fabric();
    let owner = fabric.init_context(120, PrivilegeFlags::TRUSTED, 1).unwrap();
    let group = Handle::new(WELL_KNOWN_CONTEXT, 777);
    fabric.group_create(group, Handle::new(owner, 0)).unwrap();
    fabric.group_add_member(group, 130, true).unwrap();
    fabric.group_add_member(group, 131, false).unwrap();

    let granted = fabric
        .check_client_privilege(group, 130, Privilege::AssignClient)
        .unwrap();
    assert_eq!(granted, PrivilegeCheck::AccessGranted);

    let denied = fabric
        .check_client_privilege(group, 131, Privilege::AssignClient)
        .unwrap();
    assert_eq!(denied, PrivilegeCheck::NoAccess);
}

#[test]
fn group_membership_grants_access_on_an_unrelated_resource_via_fallback() {
    let fabric = fabric();
    let owner = fabric.init_context(140, PrivilegeFlags::TRUSTED, 1).unwrap();
    let member = fabric.init_context(141, PrivilegeFlags::empty(), 1).unwrap();

    let group = Handle::new(WELL_KNOWN_CONTEXT, 888);
    fabric.group_create(group, Handle::new(owner, 0)).unwrap();
    fabric.group_add_member(group, member, true).unwrap();

    let resource = Handle::new(owner, 50);
    fabric
        .resources()
        .add(resource, ResourceKind::Api, Handle::new(owner, 0), &[Privilege::AssignClient], Box::new(|| {}))
        .unwrap();

    // `member` has no direct ACL entry on `resource`; access is only
    // reachable by walking its group memberships, which requires
    // `group_add_member` to have recorded the membership on the context
    // itself (not just the group's own body).
    let check = fabric
        .check_client_privilege(resource, member, Privilege::AssignClient)
        .unwrap();
    assert_eq!(check, PrivilegeCheck::AccessGranted);
}

#[test]
fn event_bus_subscriber_sees_hypervisor_ctx_removed() {
    let fabric = fabric();
    let seen = Arc::new(AtomicUsize::new(0));
    let seen2 = seen.clone();
    fabric
        .event_subscribe(
            EventKind::CtxRemoved,
            Arc::new(move |payload| {
                if let EventPayload::CtxRemoved { context_id } = payload {
                    seen2.store(*context_id as usize, Ordering::SeqCst);
                }
            }),
        )
        .unwrap();

    // HOST_CONTEXT is never a context-registry member, so it can't be the
    // target of add_notification fan-out; it instead subscribes through the
    // event bus directly, reached here the same way the dispatcher's own
    // fire_event helper would address it.
    let dg = Datagram {
        src: Handle::new(vmci_core::handle::HYPERVISOR_CONTEXT, vmci_core::handle::CONTEXT_RESOURCE_ID),
        dst: Handle::new(HOST_CONTEXT, vmci_core::handle::EVENT_HANDLER_RESOURCE_ID),
        payload: serde_json::to_vec(&EventPayload::CtxRemoved { context_id: 777 }).unwrap(),
    };
    fabric
        .datagram_dispatch(vmci_core::handle::HYPERVISOR_CONTEXT, dg)
        .unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 777);
}
