//! Shared Region Integration Tests
//!
//! An owner heap collects the shared region on behalf of its clients. These
//! tests attach clients, let them reference shared objects and check that
//! the owner's collection keeps, moves and frees shared objects correctly.

use core_types::{Address, Tagged};
use mark_compact::{
    CollectorState, GcError, Heap, HeapConfig, HeapRole, MarkCompactCollector, ObjectKind,
    PageFlags, SpaceKind,
};
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn non_moving() -> HeapConfig {
    HeapConfig {
        compact: false,
        ..HeapConfig::single_threaded()
    }
}

fn shared_object(client: &Heap, fields: usize) -> Address {
    client
        .allocate(SpaceKind::Shared, ObjectKind::Plain, fields, 0)
        .expect("shared allocation failed")
}

/// Test: only an owner can accept clients
#[test]
fn test_clients_attach_to_owners_only() {
    let standalone = Heap::new(non_moving());
    assert_eq!(
        Heap::new_client(&standalone, non_moving()).unwrap_err(),
        GcError::NotSharedOwner
    );
    let owner = Heap::new_shared_owner(non_moving());
    let first = Heap::new_client(&owner, non_moving()).unwrap();
    let second = Heap::new_client(&owner, non_moving()).unwrap();
    assert_eq!(first.role(), HeapRole::Client);
    assert_ne!(first.id(), second.id());
    assert_eq!(owner.shared_region().unwrap().safepoint().client_count(), 2);
    drop(second);
    assert_eq!(owner.shared_region().unwrap().safepoint().client_count(), 1);
}

/// Test: client roots and client fields keep shared objects alive
#[test]
fn test_owner_collects_unreferenced_shared_objects() {
    init_logging();
    let owner = Heap::new_shared_owner(non_moving());
    let client = Heap::new_client(&owner, non_moving()).unwrap();
    let rooted = shared_object(&client, 0);
    let from_field = shared_object(&client, 0);
    let garbage = shared_object(&client, 0);
    let host = client.allocate(SpaceKind::Old, ObjectKind::Plain, 1, 0).unwrap();
    client.write_field(host, 0, Tagged::strong(from_field)).unwrap();
    let _roots = [
        client.roots().new_handle(Tagged::strong(rooted)),
        client.roots().new_handle(Tagged::strong(host)),
    ];

    let mut collector = MarkCompactCollector::new(Arc::clone(&owner));
    collector.collect_garbage().unwrap();
    assert_eq!(collector.state(), CollectorState::Idle);
    owner.ensure_sweeping_completed();

    assert!(owner.try_object(rooted).is_some());
    assert!(owner.try_object(from_field).is_some());
    assert!(owner.try_object(garbage).is_none());
    assert!(client.try_object(host).is_some(), "client objects are not swept by the owner");
}

/// Test: a client collection leaves the shared region alone
#[test]
fn test_client_collection_skips_shared_region() {
    init_logging();
    let owner = Heap::new_shared_owner(non_moving());
    let client = Heap::new_client(&owner, non_moving()).unwrap();
    let unreferenced = shared_object(&client, 0);
    let local_garbage = client.allocate(SpaceKind::Old, ObjectKind::Plain, 0, 0).unwrap();
    let host = client.allocate(SpaceKind::Old, ObjectKind::Plain, 1, 0).unwrap();
    client.write_field(host, 0, Tagged::strong(unreferenced)).unwrap();
    let _root = client.roots().new_handle(Tagged::strong(host));

    let mut collector = MarkCompactCollector::new(Arc::clone(&client));
    let stats = collector.collect_garbage().unwrap();
    client.ensure_sweeping_completed();

    assert_eq!(stats.marked_objects, 1);
    assert!(client.try_object(local_garbage).is_none());
    assert!(owner.try_object(unreferenced).is_some());
    assert!(!owner.is_marked(unreferenced));
    assert_eq!(client.read_field(host, 0).unwrap(), Tagged::strong(unreferenced));
}

/// Test: compacting the shared region updates client roots and fields
#[test]
fn test_shared_compaction_updates_clients() {
    init_logging();
    let owner = Heap::new_shared_owner(HeapConfig {
        manual_evacuation_candidates_selection: true,
        ..HeapConfig::single_threaded()
    });
    let client = Heap::new_client(&owner, non_moving()).unwrap();
    let rooted = shared_object(&client, 1);
    let from_field = shared_object(&client, 0);
    client.write_field(rooted, 0, Tagged::strong(from_field)).unwrap();
    let host = client.allocate(SpaceKind::Old, ObjectKind::Plain, 1, 0).unwrap();
    client.write_field(host, 0, Tagged::strong(from_field)).unwrap();
    let handle = client.roots().new_handle(Tagged::strong(rooted));
    let _host_root = client.roots().new_handle(Tagged::strong(host));
    owner
        .page_of(rooted)
        .unwrap()
        .set_flag(PageFlags::FORCE_EVACUATION_CANDIDATE_FOR_TESTING);

    let mut collector = MarkCompactCollector::new(Arc::clone(&owner));
    let stats = collector.collect_garbage().unwrap();
    assert_eq!(stats.evacuated_pages, 1);

    let new_rooted = handle.address().unwrap();
    let new_from_field = client.read_field(host, 0).unwrap().strong_ref().unwrap();
    assert_ne!(new_rooted, rooted);
    assert_ne!(new_from_field, from_field);
    assert!(owner.page_of(new_rooted).unwrap().in_shared_region());
    assert_eq!(
        owner.read_field(new_rooted, 0).unwrap(),
        Tagged::strong(new_from_field)
    );
    assert!(owner.try_object(rooted).is_none());
}
