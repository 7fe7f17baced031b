//! Weak Reference Clearing Integration Tests
//!
//! Checks what a full collection leaves behind in weak cells, finalization
//! registries, JS weak references and weak global handles once their
//! targets die.

use core_types::{Address, Tagged};
use mark_compact::layout::{finalization_registry, js_weak_ref, weak_cell};
use mark_compact::{Heap, HeapConfig, MarkCompactCollector, ObjectKind, SpaceKind};
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn heap() -> Arc<Heap> {
    Heap::new(HeapConfig {
        compact: false,
        ..HeapConfig::single_threaded()
    })
}

fn plain(heap: &Heap) -> Address {
    heap.allocate(SpaceKind::Old, ObjectKind::Plain, 0, 0)
        .expect("allocation failed")
}

fn collect(heap: &Arc<Heap>) {
    let mut collector = MarkCompactCollector::new(Arc::clone(heap));
    collector.collect_garbage().expect("collection failed");
    heap.ensure_sweeping_completed();
}

/// Test: two dead cells of one registry enqueue it exactly once
#[test]
fn test_scenario_d_registry_enqueued_once() {
    init_logging();
    let heap = heap();
    let registry = heap.new_finalization_registry().unwrap();
    let _root = heap.roots().new_handle(Tagged::strong(registry));
    let target = plain(&heap);
    let cells = [
        heap.register_weak_cell(registry, target, Tagged::smi(1), None)
            .unwrap(),
        heap.register_weak_cell(registry, target, Tagged::smi(2), None)
            .unwrap(),
    ];

    collect(&heap);

    assert!(heap.try_object(target).is_none());
    assert_eq!(heap.take_dirty_finalization_registries(), vec![registry]);
    for cell in cells {
        assert_eq!(heap.read_field(cell, weak_cell::TARGET).unwrap(), Tagged::UNDEFINED);
    }
    assert_eq!(
        heap.read_field(registry, finalization_registry::ACTIVE_CELLS).unwrap(),
        Tagged::UNDEFINED
    );
    assert!(heap
        .read_field(registry, finalization_registry::CLEARED_CELLS)
        .unwrap()
        .strong_ref()
        .is_some());

    collect(&heap);
    assert!(heap.take_dirty_finalization_registries().is_empty());
}

/// Test: cells with live targets are left alone
#[test]
fn test_live_weak_cell_target_is_kept() {
    init_logging();
    let heap = heap();
    let registry = heap.new_finalization_registry().unwrap();
    let target = plain(&heap);
    let _roots = [
        heap.roots().new_handle(Tagged::strong(registry)),
        heap.roots().new_handle(Tagged::strong(target)),
    ];
    let cell = heap
        .register_weak_cell(registry, target, Tagged::UNDEFINED, None)
        .unwrap();

    collect(&heap);

    assert!(heap.take_dirty_finalization_registries().is_empty());
    assert_eq!(heap.read_field(cell, weak_cell::TARGET).unwrap(), Tagged::strong(target));
}

/// Test: a JS weak reference does not keep its target alive
#[test]
fn test_js_weak_ref_is_cleared() {
    init_logging();
    let heap = heap();
    let dead = plain(&heap);
    let live = plain(&heap);
    let dead_ref = heap.new_js_weak_ref(dead).unwrap();
    let live_ref = heap.new_js_weak_ref(live).unwrap();
    let _roots = [
        heap.roots().new_handle(Tagged::strong(dead_ref)),
        heap.roots().new_handle(Tagged::strong(live_ref)),
        heap.roots().new_handle(Tagged::strong(live)),
    ];

    collect(&heap);

    assert!(heap.try_object(dead).is_none());
    assert_eq!(heap.read_field(dead_ref, js_weak_ref::TARGET).unwrap(), Tagged::UNDEFINED);
    assert_eq!(heap.read_field(live_ref, js_weak_ref::TARGET).unwrap(), Tagged::strong(live));
}

/// Test: weak global handles are reset when their target dies
#[test]
fn test_weak_global_handle_is_reset() {
    init_logging();
    let heap = heap();
    let dead = plain(&heap);
    let live = plain(&heap);
    let _strong = heap.roots().new_global_handle(Tagged::strong(live));
    let weak_dead = heap.roots().new_weak_global_handle(Tagged::strong(dead));
    let weak_live = heap.roots().new_weak_global_handle(Tagged::strong(live));

    collect(&heap);

    assert_eq!(weak_dead.get(), Tagged::UNDEFINED);
    assert_eq!(weak_live.get(), Tagged::strong(live));
}

/// Test: a weak field to a dead object is cleared, one to a live object kept
#[test]
fn test_weak_fields_are_cleared() {
    init_logging();
    let heap = heap();
    let holder = heap
        .allocate(SpaceKind::Old, ObjectKind::WeakArray, 2, 0)
        .unwrap();
    let dead = plain(&heap);
    let live = plain(&heap);
    heap.write_field(holder, 0, Tagged::weak(dead)).unwrap();
    heap.write_field(holder, 1, Tagged::weak(live)).unwrap();
    let _roots = [
        heap.roots().new_handle(Tagged::strong(holder)),
        heap.roots().new_handle(Tagged::strong(live)),
    ];

    let mut collector = MarkCompactCollector::new(Arc::clone(&heap));
    let stats = collector.collect_garbage().unwrap();

    assert!(stats.cleared_weak_references >= 1);
    assert_eq!(heap.read_field(holder, 0).unwrap(), Tagged::CLEARED);
    assert_eq!(heap.read_field(holder, 1).unwrap(), Tagged::weak(live));
}
