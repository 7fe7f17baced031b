//! Contract tests for the public collector API
//!
//! These tests pin down the guarantees other components build on: marking
//! is idempotent, forwarding is installed once, slots into candidates are
//! remembered and the collector steps run in a fixed order.

use core_types::Tagged;
use mark_compact::{
    record_object_slot, record_slot, CollectorState, GcError, Heap, HeapConfig,
    MarkCompactCollector, ObjectKind, PageFlags, RememberedSetKind, SlotIndex, SpaceKind,
    StartCompactionMode,
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

#[cfg(test)]
mod marking_contract_tests {
    use super::*;

    /// Contract: only the first TryMark reports the transition
    #[test]
    fn test_try_mark_is_idempotent() {
        let heap = Heap::new(HeapConfig::single_threaded());
        let address = heap.allocate(SpaceKind::Old, ObjectKind::Plain, 3, 0).unwrap();
        let object = heap.object(address).unwrap();
        let page = heap.page_of(address).unwrap();

        assert!(heap.marking_state().try_mark(&object));
        for _ in 0..5 {
            assert!(!heap.marking_state().try_mark(&object));
        }
        assert!(heap.is_marked(address));
        assert_eq!(page.live_bytes(), object.size());
    }

    /// Contract: objects outside the page table are never marked
    #[test]
    fn test_try_mark_ignores_foreign_objects() {
        let heap = Heap::new(HeapConfig::single_threaded());
        let other = Heap::new(HeapConfig::single_threaded());
        let address = other.allocate(SpaceKind::Old, ObjectKind::Plain, 0, 0).unwrap();
        let object = other.object(address).unwrap();
        assert!(!heap.marking_state().try_mark(&object));
    }
}

#[cfg(test)]
mod forwarding_contract_tests {
    use super::*;

    /// Contract: a forwarding address is installed once and never replaced
    #[test]
    fn test_forwarding_is_monotonic() {
        let heap = Heap::new(HeapConfig::single_threaded());
        let source = heap.allocate(SpaceKind::Old, ObjectKind::Plain, 1, 0).unwrap();
        let first = heap.allocate(SpaceKind::Old, ObjectKind::Plain, 1, 0).unwrap();
        let second = heap.allocate(SpaceKind::Old, ObjectKind::Plain, 1, 0).unwrap();
        let object = heap.object(source).unwrap();

        assert!(!object.is_forwarded());
        assert!(object.set_forwarding_address(first));
        assert!(!object.set_forwarding_address(second));
        assert!(!object.set_forwarding_address(first));
        assert_eq!(object.forwarding_address(), Some(first));
    }
}

#[cfg(test)]
mod slot_recording_contract_tests {
    use super::*;

    /// Contract: slots pointing into a candidate are remembered as old-to-old
    #[test]
    fn test_slot_into_candidate_is_recorded() {
        let heap = Heap::new(HeapConfig::single_threaded());
        let host = heap.allocate(SpaceKind::Old, ObjectKind::Plain, 2, 0).unwrap();
        heap.space(SpaceKind::Old).unwrap().expand().unwrap();
        let target = heap.allocate(SpaceKind::Old, ObjectKind::Plain, 0, 0).unwrap();
        let host_page = heap.page_of(host).unwrap();
        let target_page = heap.page_of(target).unwrap();
        assert_ne!(host_page.id(), target_page.id());

        let host_object = heap.object(host).unwrap();
        let slot = host_object.slot_address(SlotIndex::Field(0));
        let offset = host_page.offset_of(slot) as u32;

        record_slot(&host_page, slot, &target_page);
        assert!(!host_page.slots().contains(RememberedSetKind::OldToOld, offset));

        target_page.set_flag(PageFlags::EVACUATION_CANDIDATE);
        record_slot(&host_page, slot, &target_page);
        assert!(host_page.slots().contains(RememberedSetKind::OldToOld, offset));

        record_object_slot(heap.page_table(), &host_object, SlotIndex::Field(1), target);
        let second = host_page.offset_of(host_object.slot_address(SlotIndex::Field(1))) as u32;
        assert!(host_page.slots().contains(RememberedSetKind::OldToOld, second));
    }

    /// Contract: stores into old objects remember young targets
    #[test]
    fn test_write_barrier_records_old_to_new() {
        let heap = Heap::new(HeapConfig::single_threaded());
        let host = heap.allocate(SpaceKind::Old, ObjectKind::Plain, 1, 0).unwrap();
        let young = heap.allocate(SpaceKind::New, ObjectKind::Plain, 0, 0).unwrap();
        heap.write_field(host, 0, Tagged::strong(young)).unwrap();

        let page = heap.page_of(host).unwrap();
        let slot = heap.object(host).unwrap().slot_address(SlotIndex::Field(0));
        assert!(page
            .slots()
            .contains(RememberedSetKind::OldToNew, page.offset_of(slot) as u32));
    }
}

#[cfg(test)]
mod collector_contract_tests {
    use super::*;

    /// Contract: a step called out of order fails without changing state
    #[test]
    fn test_out_of_order_step_is_rejected() {
        let heap = Heap::new(non_moving());
        let mut collector = MarkCompactCollector::new(heap);
        let error = collector.evacuate().unwrap_err();
        assert_eq!(
            error,
            GcError::InvalidState {
                expected: "sweep_spaces",
                actual: "idle"
            }
        );
        assert_eq!(
            error.to_string(),
            "collector is in state idle, expected sweep_spaces"
        );
        assert_eq!(collector.state(), CollectorState::Idle);
    }

    /// Contract: candidates can only be chosen between cycles
    #[test]
    fn test_start_compaction_outside_idle_fails() {
        let heap = Heap::new(non_moving());
        let mut collector = MarkCompactCollector::new(heap);
        assert_eq!(collector.start_compaction(StartCompactionMode::Atomic), Ok(false));
        collector.prepare().unwrap();
        assert!(matches!(
            collector.start_compaction(StartCompactionMode::Atomic),
            Err(GcError::InvalidState { .. })
        ));
    }

    /// Contract: selection reports whether any page was chosen
    #[test]
    fn test_start_compaction_reports_selection() {
        let config = HeapConfig {
            manual_evacuation_candidates_selection: true,
            ..HeapConfig::single_threaded()
        };
        let heap = Heap::new(config);
        let object = heap.allocate(SpaceKind::Old, ObjectKind::Plain, 0, 0).unwrap();
        let mut collector = MarkCompactCollector::new(Arc::clone(&heap));
        assert_eq!(collector.start_compaction(StartCompactionMode::Atomic), Ok(false));

        heap.page_of(object)
            .unwrap()
            .set_flag(PageFlags::FORCE_EVACUATION_CANDIDATE_FOR_TESTING);
        assert_eq!(collector.start_compaction(StartCompactionMode::Atomic), Ok(true));
        assert_eq!(collector.evacuation_candidates().len(), 1);
    }

    /// Contract: every full collection gets the next cycle number and
    /// leaves the collector idle
    #[test]
    fn test_collect_garbage_numbers_cycles() {
        init_logging();
        let heap = Heap::new(non_moving());
        let mut collector = MarkCompactCollector::new(Arc::clone(&heap));
        let first = collector.collect_garbage().unwrap();
        let second = collector.collect_garbage().unwrap();
        assert_eq!(first.cycle + 1, second.cycle);
        assert_eq!(heap.gc_count(), 2);
        assert_eq!(collector.state(), CollectorState::Idle);
        assert!(collector.cycle_config().is_none());
        assert_eq!(heap.tracer().lock().history().count(), 2);
    }

    /// Contract: strong roots keep their referents alive and unchanged
    #[test]
    fn test_rooted_graph_survives() {
        init_logging();
        let heap = Heap::new(non_moving());
        let parent = heap.allocate(SpaceKind::Old, ObjectKind::Plain, 1, 0).unwrap();
        let child = heap.allocate(SpaceKind::Old, ObjectKind::Plain, 0, 0).unwrap();
        heap.write_field(parent, 0, Tagged::strong(child)).unwrap();
        let root = heap.roots().add_strong_root(Tagged::strong(parent));

        let mut collector = MarkCompactCollector::new(Arc::clone(&heap));
        let stats = collector.collect_garbage().unwrap();
        assert_eq!(stats.marked_objects, 2);
        assert_eq!(root.get(), Tagged::strong(parent));
        assert_eq!(heap.read_field(parent, 0).unwrap(), Tagged::strong(child));
    }
}
