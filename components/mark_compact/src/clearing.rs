//! Clearing of references to objects that did not survive marking.
//!
//! Runs after the transitive closure, once mark bits are final. Each weak
//! worklist filled during marking is drained exactly once. Severed links
//! get a canonical sentinel; surviving weak slots are recorded again in case
//! their target sits on an evacuation candidate. Clearing writes bypass the
//! write barrier, so every store of a reference records its slot here.

use crate::config::CycleConfig;
use crate::heap::Heap;
use crate::jobs::{JobDelegate, JobRuntime, JobTask, TaskPriority, WorkItems};
use crate::object::{layout, HeapObject, ObjectFlags, ObjectKind, SlotIndex};
use crate::page::PageTable;
use crate::policy::MarkingPolicy;
use crate::roots::{Root, RootSlot, RootVisitor};
use crate::safepoint::GlobalSafepointScope;
use crate::weak_objects::{drain, WeakObjects};
use crate::write_barrier::record_object_slot;
use core_types::{Address, Oddball, Tagged};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// What one clearing phase did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClearingStats {
    /// Weak slots, handles and table entries that were severed
    pub cleared_weak_references: usize,
    /// Bytecode arrays dropped from their function infos
    pub flushed_bytecode: usize,
    /// String table entries removed
    pub cleared_strings: usize,
    /// Code objects handed to the deoptimization handler
    pub deoptimized_code: usize,
}

/// Liveness as decided by marking: marked, or outside this collector's
/// responsibility.
#[derive(Clone, Copy)]
struct Liveness<'a> {
    page_table: &'a PageTable,
    policy: MarkingPolicy,
}

impl<'a> Liveness<'a> {
    fn new(heap: &'a Heap) -> Self {
        Liveness {
            page_table: heap.page_table(),
            policy: *heap.marking_policy(),
        }
    }

    fn is_live(&self, address: Address) -> bool {
        match self.page_table.page_for(address) {
            Some(page) => !self.policy.should_mark(&page) || page.is_marked(address),
            None => true,
        }
    }

    fn object(&self, address: Address) -> Option<Arc<HeapObject>> {
        self.page_table.page_for(address)?.object(address)
    }
}

#[derive(Debug, Clone, Copy)]
enum ClearingItem {
    StringTable,
    RetainedMaps,
}

/// Work that only touches heap-level tables, run beside the main thread.
struct ClearingJob<'a> {
    heap: &'a Heap,
    liveness: Liveness<'a>,
    items: WorkItems<ClearingItem>,
    cleared_strings: AtomicUsize,
}

impl JobTask for ClearingJob<'_> {
    fn run(&self, _delegate: &JobDelegate) {
        self.items.process(|item| match item {
            ClearingItem::StringTable => {
                if self.heap.owns_string_table() {
                    let cleared = self
                        .heap
                        .string_table()
                        .retain_live(|string| self.liveness.is_live(string));
                    self.cleared_strings.fetch_add(cleared, Ordering::Relaxed);
                }
            }
            ClearingItem::RetainedMaps => {
                let maps = self
                    .heap
                    .retained_maps()
                    .into_iter()
                    .filter(|(map, _)| map.heap_object().is_some_and(|m| self.liveness.is_live(m)))
                    .collect();
                self.heap.set_retained_maps(maps);
            }
        });
    }

    fn max_concurrency(&self, _worker_count: usize) -> usize {
        self.items.remaining().max(1)
    }
}

/// Resets weak global handles whose target died.
struct WeakHandleClearingVisitor<'a> {
    liveness: Liveness<'a>,
    shared_only: bool,
    cleared: usize,
}

impl RootVisitor for WeakHandleClearingVisitor<'_> {
    fn visit_root(&mut self, _root: Root, slot: &RootSlot) {
        let Some(target) = slot.get().heap_object() else {
            return;
        };
        if self.shared_only
            && !self
                .liveness
                .page_table
                .page_for(target)
                .is_some_and(|p| p.in_shared_region())
        {
            return;
        }
        if !self.liveness.is_live(target) {
            slot.set(Tagged::UNDEFINED);
            self.cleared += 1;
        }
    }
}

/// Main-thread part of the clearing phase.
struct WeakReferenceClearer<'a> {
    heap: &'a Heap,
    cycle: &'a CycleConfig,
    weak: &'a WeakObjects,
    liveness: Liveness<'a>,
    stats: ClearingStats,
}

impl<'a> WeakReferenceClearer<'a> {
    fn record(&self, host: &HeapObject, slot: SlotIndex) {
        if let Some(target) = host.load(slot).heap_object() {
            record_object_slot(self.liveness.page_table, host, slot, target);
        }
    }

    fn store(&self, host: &HeapObject, slot: SlotIndex, value: Tagged) {
        host.store(slot, value);
        self.record(host, slot);
    }

    fn clear_weak_global_handles(&mut self, clients: Option<&GlobalSafepointScope>) {
        let mut visitor = WeakHandleClearingVisitor {
            liveness: self.liveness,
            shared_only: false,
            cleared: 0,
        };
        self.heap.roots().iterate_weak_global_handles(&mut visitor);
        if let Some(scope) = clients {
            visitor.shared_only = true;
            scope.iterate_clients(|client| client.roots().iterate_weak_global_handles(&mut visitor));
        }
        self.stats.cleared_weak_references += visitor.cleared;
    }

    fn flush_bytecode(&mut self) {
        use layout::shared_function_info::FUNCTION_DATA;

        for sfi in drain(&self.weak.code_flushing_candidates) {
            let Some(sfi) = self.liveness.object(sfi) else {
                continue;
            };
            let slot = SlotIndex::Field(FUNCTION_DATA);
            let Some(data) = sfi.load(slot).strong_ref() else {
                continue;
            };
            if self.liveness.is_live(data) {
                self.record(&sfi, slot);
                continue;
            }
            sfi.store(slot, Tagged::oddball(Oddball::Uncompiled));
            sfi.set_bytecode_age(0);
            self.stats.flushed_bytecode += 1;
            log::trace!("flushed bytecode of {:?}", sfi.address());
        }
    }

    fn clear_flushed_js_functions(&mut self) {
        use layout::js_function::{CODE, SHARED};

        let uncompiled = Tagged::oddball(Oddball::Uncompiled);
        let lazy_compile = Tagged::oddball(Oddball::LazyCompile);
        for function in drain(&self.weak.flushed_js_functions) {
            let Some(function) = self.liveness.object(function) else {
                continue;
            };
            let flushed = function
                .field(SHARED)
                .strong_ref()
                .and_then(|sfi| self.liveness.object(sfi))
                .is_some_and(|sfi| sfi.field(layout::shared_function_info::FUNCTION_DATA) == uncompiled);
            if flushed && function.field(CODE) != lazy_compile {
                function.set_field(CODE, lazy_compile);
            }
        }
    }

    /// Trims the descriptors shared by `parent` and a dead child down to
    /// the ones `parent` owns, making `parent` their sole owner.
    fn trim_descriptor_array(&self, parent: &HeapObject, descriptors: &HeapObject) {
        let own = parent.number_of_own_descriptors();
        if own < descriptors.used_fields() {
            log::trace!(
                "trimming descriptors {:?} from {} to {}",
                descriptors.address(),
                descriptors.used_fields(),
                own
            );
            descriptors.right_trim(own);
        }
        parent.set_flags(ObjectFlags::OWNS_DESCRIPTORS);
    }

    fn descriptors_of(&self, map: &HeapObject) -> Option<Arc<HeapObject>> {
        map.field(layout::map::DESCRIPTORS)
            .strong_ref()
            .and_then(|d| self.liveness.object(d))
    }

    fn parent_map(&self, map: &HeapObject) -> Option<Arc<HeapObject>> {
        map.field(layout::map::BACK_POINTER)
            .strong_ref()
            .and_then(|p| self.liveness.object(p))
            .filter(|p| p.kind() == ObjectKind::Map)
    }

    fn clear_full_map_transitions(&mut self) {
        for array in drain(&self.weak.transition_arrays) {
            let Some(array) = self.liveness.object(array) else {
                continue;
            };
            let parent = array
                .field(layout::entry_value(0))
                .heap_object()
                .and_then(|first| self.liveness.object(first))
                .and_then(|first| self.parent_map(&first));
            let Some(parent) = parent else {
                continue;
            };
            let descriptors = self
                .liveness
                .is_live(parent.address())
                .then(|| self.descriptors_of(&parent))
                .flatten();
            if self.compact_transition_array(&array, descriptors.as_deref()) {
                if let Some(descriptors) = &descriptors {
                    self.trim_descriptor_array(&parent, descriptors);
                }
            }
        }
    }

    /// Drops transitions to dead maps. Returns true if one of them shared
    /// `descriptors` with the parent.
    fn compact_transition_array(&mut self, array: &HeapObject, descriptors: Option<&HeapObject>) -> bool {
        let entries = array.entry_count();
        let mut live = 0;
        let mut descriptors_owner_died = false;
        for entry in 0..entries {
            let key = array.field(layout::entry_key(entry));
            let target = array.field(layout::entry_value(entry));
            let target_live = target.heap_object().is_some_and(|t| self.liveness.is_live(t));
            if !target_live {
                let shared_descriptors = descriptors.is_some_and(|d| {
                    target
                        .heap_object()
                        .and_then(|t| self.liveness.object(t))
                        .is_some_and(|t| t.field(layout::map::DESCRIPTORS).strong_ref() == Some(d.address()))
                });
                descriptors_owner_died |= shared_descriptors;
                self.stats.cleared_weak_references += 1;
                continue;
            }
            if live != entry {
                self.store(array, SlotIndex::Field(layout::entry_key(live)), key);
                self.store(array, SlotIndex::Field(layout::entry_value(live)), target);
            }
            live += 1;
        }
        if live < entries {
            array.right_trim(2 * live);
        }
        descriptors_owner_died
    }

    /// Clears the simple transition from the parent of `dead_target` to it.
    fn clear_potential_simple_map_transition(&self, dead_target: &HeapObject) {
        let Some(parent) = self.parent_map(dead_target) else {
            return;
        };
        let transition = parent.field(layout::map::TRANSITIONS);
        if !self.liveness.is_live(parent.address())
            || transition.weak_ref() != Some(dead_target.address())
        {
            return;
        }
        parent.set_field(layout::map::TRANSITIONS, Tagged::CLEARED);
        let shared = dead_target.field(layout::map::DESCRIPTORS) == parent.field(layout::map::DESCRIPTORS);
        if let Some(descriptors) = self.descriptors_of(&parent).filter(|_| shared) {
            self.trim_descriptor_array(&parent, &descriptors);
        }
    }

    fn clear_weak_references(&mut self) {
        for entry in drain(&self.weak.weak_references) {
            let Some(host) = self.liveness.object(entry.host) else {
                continue;
            };
            let Some(target) = host.load(entry.slot).weak_ref() else {
                continue;
            };
            if self.liveness.is_live(target) {
                self.record(&host, entry.slot);
                continue;
            }
            if let Some(dead) = self
                .liveness
                .object(target)
                .filter(|t| t.kind() == ObjectKind::Map)
            {
                self.clear_potential_simple_map_transition(&dead);
            }
            host.store(entry.slot, Tagged::CLEARED);
            self.stats.cleared_weak_references += 1;
        }
    }

    fn clear_weak_collections(&mut self) {
        for table in drain(&self.weak.ephemeron_hash_tables) {
            let Some(table) = self.liveness.object(table) else {
                continue;
            };
            for entry in 0..table.entry_count() {
                let key_slot = SlotIndex::Field(layout::entry_key(entry));
                let Some(key) = table.load(key_slot).heap_object() else {
                    continue;
                };
                if !self.liveness.is_live(key) {
                    table.store(key_slot, Tagged::HOLE);
                    table.store(SlotIndex::Field(layout::entry_value(entry)), Tagged::HOLE);
                    self.stats.cleared_weak_references += 1;
                }
            }
        }
    }

    fn clear_js_weak_refs(&mut self) {
        use layout::js_weak_ref::TARGET;

        for weak_ref in drain(&self.weak.js_weak_refs) {
            let Some(weak_ref) = self.liveness.object(weak_ref) else {
                continue;
            };
            let slot = SlotIndex::Field(TARGET);
            let Some(target) = weak_ref.load(slot).heap_object() else {
                continue;
            };
            if self.liveness.is_live(target) {
                self.record(&weak_ref, slot);
            } else {
                weak_ref.store(slot, Tagged::UNDEFINED);
                self.stats.cleared_weak_references += 1;
            }
        }
        for cell in drain(&self.weak.weak_cells) {
            if let Some(cell) = self.liveness.object(cell) {
                self.clear_weak_cell(&cell);
            }
        }
    }

    fn clear_weak_cell(&mut self, cell: &HeapObject) {
        use layout::weak_cell::{REGISTRY, TARGET, UNREGISTER_TOKEN};

        let Some(registry) = cell
            .field(REGISTRY)
            .strong_ref()
            .and_then(|r| self.liveness.object(r))
        else {
            return;
        };
        let target_slot = SlotIndex::Field(TARGET);
        if let Some(target) = cell.load(target_slot).heap_object() {
            if self.liveness.is_live(target) {
                self.record(cell, target_slot);
            } else {
                if self.heap.enqueue_dirty_finalization_registry(&registry) {
                    log::trace!("finalization registry {:?} needs cleanup", registry.address());
                }
                self.nullify_weak_cell(cell, &registry);
                self.stats.cleared_weak_references += 1;
            }
        }
        let token_slot = SlotIndex::Field(UNREGISTER_TOKEN);
        if let Some(token) = cell.load(token_slot).heap_object() {
            if self.liveness.is_live(token) {
                self.record(cell, token_slot);
            } else if let Some(key_map) = registry.key_map() {
                let token_identity = self.liveness.object(token).map(|t| t.identity());
                if let Some(token_identity) = token_identity {
                    key_map.lock().remove(token_identity, cell.identity());
                }
                cell.store(token_slot, Tagged::UNDEFINED);
            }
        }
    }

    /// Severs the target of `cell` and moves it from the active to the
    /// cleared list of `registry`.
    fn nullify_weak_cell(&self, cell: &HeapObject, registry: &HeapObject) {
        use layout::finalization_registry::{ACTIVE_CELLS, CLEARED_CELLS};
        use layout::weak_cell::{NEXT, PREV, TARGET};

        cell.store(SlotIndex::Field(TARGET), Tagged::UNDEFINED);
        let prev = cell.field(PREV);
        let next = cell.field(NEXT);
        match prev.strong_ref().and_then(|p| self.liveness.object(p)) {
            Some(prev) => self.store(&prev, SlotIndex::Field(NEXT), next),
            None => self.store(registry, SlotIndex::Field(ACTIVE_CELLS), next),
        }
        if let Some(next) = next.strong_ref().and_then(|n| self.liveness.object(n)) {
            self.store(&next, SlotIndex::Field(PREV), prev);
        }

        let head = registry.field(CLEARED_CELLS);
        if let Some(head) = head.strong_ref().and_then(|h| self.liveness.object(h)) {
            self.store(&head, SlotIndex::Field(PREV), Tagged::strong(cell.address()));
        }
        cell.store(SlotIndex::Field(PREV), Tagged::UNDEFINED);
        self.store(cell, SlotIndex::Field(NEXT), head);
        self.store(registry, SlotIndex::Field(CLEARED_CELLS), Tagged::strong(cell.address()));
    }

    /// Severs dead objects embedded in optimized code and marks that code
    /// for deoptimization. Returns the code objects to deoptimize.
    fn mark_dependent_code_for_deoptimization(&mut self) -> Vec<Address> {
        let mut marked = Vec::new();
        for entry in drain(&self.weak.weak_objects_in_code) {
            if self.liveness.is_live(entry.object) {
                continue;
            }
            let Some(code) = self.liveness.object(entry.code) else {
                continue;
            };
            if code.has_flags(ObjectFlags::EMBEDDED_OBJECTS_CLEARED) {
                continue;
            }
            if !code.has_flags(ObjectFlags::MARKED_FOR_DEOPTIMIZATION) {
                code.set_flags(ObjectFlags::MARKED_FOR_DEOPTIMIZATION);
                marked.push(code.address());
            }
            for reloc in code.relocs() {
                let dead = reloc
                    .target()
                    .filter(|_| reloc.mode.is_heap_reference() && !reloc.mode.is_code_target())
                    .is_some_and(|t| !self.liveness.is_live(t));
                if dead {
                    code.set_reloc_value(reloc.offset, 0);
                }
            }
            code.set_flags(ObjectFlags::EMBEDDED_OBJECTS_CLEARED);
        }
        marked
    }

    fn run(&mut self, clients: Option<&GlobalSafepointScope>) {
        // Ephemerons left over from the closure have dead keys.
        for queue in [
            &self.weak.current_ephemerons,
            &self.weak.next_ephemerons,
            &self.weak.discovered_ephemerons,
        ] {
            drain(queue);
        }
        self.clear_weak_global_handles(clients);
        if self.cycle.flush_bytecode {
            self.flush_bytecode();
            self.clear_flushed_js_functions();
        } else {
            drain(&self.weak.code_flushing_candidates);
            drain(&self.weak.flushed_js_functions);
        }
        self.clear_full_map_transitions();
        self.clear_weak_references();
        self.clear_weak_collections();
        self.clear_js_weak_refs();
        let code = self.mark_dependent_code_for_deoptimization();
        if !code.is_empty() {
            self.stats.deoptimized_code = code.len();
            if let Some(handler) = self.heap.deoptimization_handler() {
                handler.deoptimize_marked_code(&code);
            }
        }
    }
}

/// Clears every reference to an unmarked object and drains the weak
/// worklists. `clients` is the safepoint scope of a shared-region owner.
pub(crate) fn clear_non_live_references(
    heap: &Heap,
    cycle: &CycleConfig,
    weak: &WeakObjects,
    clients: Option<&GlobalSafepointScope>,
) -> ClearingStats {
    let liveness = Liveness::new(heap);
    let job = ClearingJob {
        heap,
        liveness,
        items: WorkItems::new(vec![ClearingItem::StringTable, ClearingItem::RetainedMaps]),
        cleared_strings: AtomicUsize::new(0),
    };
    let mut clearer = WeakReferenceClearer {
        heap,
        cycle,
        weak,
        liveness,
        stats: ClearingStats::default(),
    };
    let run_job = || {
        JobRuntime::new(cycle.worker_threads)
            .create_job(TaskPriority::UserBlocking, &job)
            .join();
    };
    if cycle.worker_threads > 0 {
        let result = crossbeam::scope(|scope| {
            let background = scope.spawn(|_| run_job());
            clearer.run(clients);
            if let Err(payload) = background.join() {
                std::panic::resume_unwind(payload);
            }
        });
        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    } else {
        run_job();
        clearer.run(clients);
    }
    let mut stats = clearer.stats;
    stats.cleared_strings = job.cleared_strings.into_inner();
    debug_assert!(weak.is_empty(), "weak worklists left undrained");
    log::debug!(
        "clearing: {} weak references, {} strings, {} bytecode arrays, {} code objects deoptimized",
        stats.cleared_weak_references,
        stats.cleared_strings,
        stats.flushed_bytecode,
        stats.deoptimized_code
    );
    stats
}
