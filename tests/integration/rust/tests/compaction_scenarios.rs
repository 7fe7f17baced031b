//! Compaction Integration Tests
//!
//! Drives candidate selection, evacuation and pointer updating through full
//! collections and checks the heap afterwards: which pages were chosen,
//! where objects ended up and whether every reference followed them.

use core_types::{Address, Tagged, TAGGED_SIZE};
use mark_compact::{
    EvacuationHeuristics, FatalErrorHandler, Handle, Heap, HeapConfig, MarkCompactCollector,
    MemoryMode, ObjectKind, PageFlags, RememberedSetKind, SpaceKind, StartCompactionMode,
    PAGE_AREA_SIZE,
};
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn manual_selection() -> HeapConfig {
    HeapConfig {
        manual_evacuation_candidates_selection: true,
        ..HeapConfig::single_threaded()
    }
}

fn alloc(heap: &Heap, kind: ObjectKind, fields: usize) -> Address {
    heap.allocate(SpaceKind::Old, kind, fields, 0)
        .expect("allocation failed")
}

/// Test: a sparse page is selected and its neighbours are not
#[test]
fn test_scenario_a_sparse_page_is_selected() {
    init_logging();
    let heap = Heap::new(HeapConfig::single_threaded());
    let old = heap.space(SpaceKind::Old).unwrap();

    let sparse_page = old.expand().unwrap();
    let small_fields = PAGE_AREA_SIZE / 100 / TAGGED_SIZE - 1;
    let sparse: Vec<Address> = (0..10)
        .map(|_| alloc(&heap, ObjectKind::Plain, small_fields))
        .collect();
    let full_fields = PAGE_AREA_SIZE / TAGGED_SIZE - 1;
    let full_pages: Vec<_> = (0..2)
        .map(|_| {
            let page = old.expand().unwrap();
            let filler = alloc(&heap, ObjectKind::FixedArray, full_fields);
            assert_eq!(heap.page_of(filler).unwrap().id(), page.id());
            assert_eq!(page.free_bytes(), 0);
            (page, heap.roots().new_handle(Tagged::strong(filler)))
        })
        .collect();
    let handles: Vec<Handle> = sparse
        .iter()
        .map(|&a| {
            assert_eq!(heap.page_of(a).unwrap().id(), sparse_page.id());
            heap.roots().new_handle(Tagged::strong(a))
        })
        .collect();
    assert!(sparse_page.free_bytes() * 10 >= sparse_page.area_size() * 9);

    let mut collector = MarkCompactCollector::new(Arc::clone(&heap));
    assert!(collector.start_compaction(StartCompactionMode::Atomic).unwrap());
    let candidates: Vec<usize> = collector.evacuation_candidates().iter().map(|p| p.id()).collect();
    assert_eq!(candidates, vec![sparse_page.id()]);
    for (page, _) in &full_pages {
        assert!(!page.is_evacuation_candidate());
    }

    let stats = collector.collect_garbage().unwrap();
    assert_eq!(stats.evacuated_pages, 1);
    assert_eq!(stats.aborted_pages, 0);
    for (handle, &original) in handles.iter().zip(&sparse) {
        let moved = handle.address().unwrap();
        assert_ne!(moved, original);
        assert_ne!(heap.page_of(moved).unwrap().id(), sparse_page.id());
        assert!(heap.try_object(moved).is_some());
    }
    for (page, handle) in &full_pages {
        assert_eq!(heap.page_of(handle.address().unwrap()).unwrap().id(), page.id());
    }
}

fn quarter_full_pages(heap: &Heap, count: usize) {
    let old = heap.space(SpaceKind::Old).unwrap();
    let fields = PAGE_AREA_SIZE / 4 / TAGGED_SIZE - 1;
    for _ in 0..count {
        old.expand().unwrap();
        alloc(heap, ObjectKind::FixedArray, fields);
    }
}

/// Test: the live bytes of all candidates stay within the budget
#[test]
fn test_candidate_budget_is_respected() {
    init_logging();
    let heap = Heap::new(HeapConfig::single_threaded());
    quarter_full_pages(&heap, 100);
    let budget = EvacuationHeuristics::compute(MemoryMode::Regular, PAGE_AREA_SIZE, None).max_evacuated_bytes;

    let mut collector = MarkCompactCollector::new(Arc::clone(&heap));
    assert!(collector.start_compaction(StartCompactionMode::Atomic).unwrap());
    let selected = collector.evacuation_candidates().len();
    let live: usize = collector
        .evacuation_candidates()
        .iter()
        .map(|p| p.allocated_bytes())
        .sum();
    assert!(selected < 100);
    assert!(live <= budget, "{live} bytes selected, budget {budget}");

    let stats = collector.collect_garbage().unwrap();
    assert_eq!(stats.evacuation_candidates, selected);
}

/// Test: compacting on every full collection ignores the budget
#[test]
fn test_every_full_gc_override_ignores_budget() {
    let config = HeapConfig {
        compact_on_every_full_gc: true,
        ..HeapConfig::single_threaded()
    };
    let heap = Heap::new(config);
    quarter_full_pages(&heap, 100);
    let mut collector = MarkCompactCollector::new(Arc::clone(&heap));
    assert!(collector.start_compaction(StartCompactionMode::Atomic).unwrap());
    assert_eq!(collector.evacuation_candidates().len(), 100);
}

/// Test: an evacuation that runs out of memory leaves a consistent page
#[test]
fn test_aborted_evacuation_recovers() {
    init_logging();
    const OBJECTS: usize = 6;
    const COPIED: usize = 2;

    let heap = Heap::new(manual_selection());
    let referrer = alloc(&heap, ObjectKind::Plain, OBJECTS);
    let _referrer_root = heap.roots().new_handle(Tagged::strong(referrer));
    let page = heap.space(SpaceKind::Old).unwrap().expand().unwrap();
    let objects: Vec<Address> = (0..OBJECTS)
        .map(|_| alloc(&heap, ObjectKind::Plain, 1))
        .collect();
    for (index, &object) in objects.iter().enumerate() {
        assert_eq!(heap.page_of(object).unwrap().id(), page.id());
        heap.write_field(referrer, index, Tagged::strong(object)).unwrap();
        let next = objects[(index + 1) % OBJECTS];
        heap.write_field(object, 0, Tagged::strong(next)).unwrap();
    }
    let handles: Vec<Handle> = objects
        .iter()
        .map(|&a| heap.roots().new_handle(Tagged::strong(a)))
        .collect();
    page.set_flag(PageFlags::FORCE_EVACUATION_CANDIDATE_FOR_TESTING);
    heap.inject_evacuation_allocation_failure(COPIED);

    let mut collector = MarkCompactCollector::new(Arc::clone(&heap));
    let stats = collector.collect_garbage().unwrap();
    assert_eq!(stats.evacuation_candidates, 1);
    assert_eq!(stats.aborted_pages, 1);
    assert_eq!(stats.evacuated_pages, 0);
    assert!(!page.is_evacuation_candidate());

    let current: Vec<Address> = handles.iter().map(|h| h.address().unwrap()).collect();
    let moved = current.iter().zip(&objects).filter(|(c, o)| c != o).count();
    assert_eq!(moved, COPIED);
    for (index, &object) in current.iter().enumerate() {
        assert_eq!(heap.read_field(referrer, index).unwrap(), Tagged::strong(object));
        let next = current[(index + 1) % OBJECTS];
        assert_eq!(heap.read_field(object, 0).unwrap(), Tagged::strong(next));
    }

    heap.ensure_sweeping_completed();
    let stayed: usize = current
        .iter()
        .zip(&objects)
        .filter(|(c, o)| c == o)
        .map(|(&c, _)| heap.object(c).unwrap().size())
        .sum();
    assert_eq!(page.allocated_bytes(), stayed);
    assert_eq!(page.object_count(), OBJECTS - COPIED);
    for kind in RememberedSetKind::ALL {
        assert!(page.slots().is_empty(kind), "{kind:?} slots left behind");
    }

    // The injected failure only lasts one cycle.
    page.set_flag(PageFlags::FORCE_EVACUATION_CANDIDATE_FOR_TESTING);
    let stats = collector.collect_garbage().unwrap();
    assert_eq!(stats.aborted_pages, 0);
    assert_eq!(stats.evacuated_pages, 1);
}

/// Test: every kind of reference to a moved object is rewritten
#[test]
fn test_all_references_follow_moved_objects() {
    init_logging();
    let heap = Heap::new(manual_selection());
    let holder = alloc(&heap, ObjectKind::Plain, 3);
    let table = alloc(&heap, ObjectKind::EphemeronTable, 2);
    let _roots = [
        heap.roots().new_handle(Tagged::strong(holder)),
        heap.roots().new_handle(Tagged::strong(table)),
    ];
    let page = heap.space(SpaceKind::Old).unwrap().expand().unwrap();
    let target = alloc(&heap, ObjectKind::Plain, 0);
    let value = alloc(&heap, ObjectKind::Plain, 0);
    let young = heap.allocate(SpaceKind::New, ObjectKind::Plain, 1, 0).unwrap();
    heap.write_field(young, 0, Tagged::strong(target)).unwrap();
    heap.write_field(holder, 0, Tagged::strong(target)).unwrap();
    heap.write_field(holder, 1, Tagged::weak(target)).unwrap();
    heap.write_field(holder, 2, Tagged::strong(young)).unwrap();
    heap.write_field(table, 0, Tagged::strong(target)).unwrap();
    heap.write_field(table, 1, Tagged::strong(value)).unwrap();
    let global = heap.roots().new_global_handle(Tagged::strong(target));
    let weak_global = heap.roots().new_weak_global_handle(Tagged::strong(value));
    page.set_flag(PageFlags::FORCE_EVACUATION_CANDIDATE_FOR_TESTING);

    let mut collector = MarkCompactCollector::new(Arc::clone(&heap));
    let stats = collector.collect_garbage().unwrap();
    assert_eq!(stats.evacuated_pages, 1);
    assert!(stats.updated_slots > 0);

    let new_target = global.address().unwrap();
    let new_value = heap.read_field(table, 1).unwrap().strong_ref().unwrap();
    let new_young = heap.read_field(holder, 2).unwrap().strong_ref().unwrap();
    assert_ne!(new_target, target);
    assert_ne!(new_value, value);
    assert_ne!(new_young, young);
    assert_eq!(heap.read_field(holder, 0).unwrap(), Tagged::strong(new_target));
    assert_eq!(heap.read_field(holder, 1).unwrap(), Tagged::weak(new_target));
    assert_eq!(heap.read_field(table, 0).unwrap(), Tagged::strong(new_target));
    assert_eq!(heap.read_field(new_young, 0).unwrap(), Tagged::strong(new_target));
    assert_eq!(weak_global.address(), Some(new_value));
    assert_eq!(heap.page_of(new_young).unwrap().space(), SpaceKind::Old);
    for moved in [new_target, new_value, new_young] {
        assert!(heap.try_object(moved).is_some());
        assert!(!heap.object(moved).unwrap().is_forwarded());
    }
}

struct PanicOnOom;

impl FatalErrorHandler for PanicOnOom {
    fn fatal_out_of_memory(&self, location: &str) {
        panic!("fatal out of memory: {location}");
    }
}

/// Test: a young survivor that cannot be moved is a fatal error
#[test]
#[should_panic(expected = "fatal out of memory")]
fn test_failed_promotion_is_fatal() {
    let heap = Heap::new(HeapConfig {
        compact: false,
        ..HeapConfig::single_threaded()
    });
    heap.set_fatal_error_handler(Arc::new(PanicOnOom));
    let young = heap.allocate(SpaceKind::New, ObjectKind::Plain, 0, 0).unwrap();
    let _root = heap.roots().new_handle(Tagged::strong(young));
    heap.inject_evacuation_allocation_failure(0);

    let mut collector = MarkCompactCollector::new(heap);
    let _ = collector.collect_garbage();
}
