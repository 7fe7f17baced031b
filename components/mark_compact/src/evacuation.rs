//! Evacuation of candidate pages and the young generation.
//!
//! Every page to evacuate becomes one work item of a [`PageEvacuationJob`].
//! Each participant owns an [`Evacuator`] that copies live objects into
//! compaction pages private to it; those pages join their owner spaces once
//! the job is done. A candidate page whose copying runs out of memory is
//! aborted: objects copied so far stay forwarded, the rest stay in place,
//! and the page's slots are re-recorded on the main thread.

use crate::callbacks::MigrationObserver;
use crate::config::CycleConfig;
use crate::heap::Heap;
use crate::jobs::{JobDelegate, JobRuntime, JobTask, TaskPriority, WorkItems};
use crate::object::{layout, HeapObject, ObjectKind, RelocInfo, SlotIndex};
use crate::page::{EvacuationState, Page, PageFlags, PageTable, PAGE_SIZE};
use crate::space::{Space, SpaceKind};
use crate::visitor::{iterate_body, ObjectVisitor};
use crate::write_barrier::{record_migrated_reloc_slot, record_migrated_slot};
use core_types::Address;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

const ITEMS_PER_WORKER: usize = {
    let pages_per_mb = (1 << 20) / PAGE_SIZE;
    if pages_per_mb > 1 {
        pages_per_mb
    } else {
        1
    }
};

/// How a page is evacuated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvacuationMode {
    /// Copy the live objects of a young page into old space
    NewToOldObjects,
    /// Move a young page into old space as a whole
    NewToOldPage,
    /// Copy the live objects of a candidate page
    OldObjects,
}

struct EvacuationItem {
    page: Arc<Page>,
    mode: EvacuationMode,
}

/// Counters of one evacuation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EvacuationStats {
    pub evacuated_pages: usize,
    pub aborted_pages: usize,
    pub promoted_pages: usize,
    pub promoted_bytes: usize,
    pub compacted_bytes: usize,
    pub copied_objects: usize,
}

impl EvacuationStats {
    fn merge(&mut self, other: &EvacuationStats) {
        self.evacuated_pages += other.evacuated_pages;
        self.aborted_pages += other.aborted_pages;
        self.promoted_pages += other.promoted_pages;
        self.promoted_bytes += other.promoted_bytes;
        self.compacted_bytes += other.compacted_bytes;
        self.copied_objects += other.copied_objects;
    }
}

/// Pages touched by an evacuation, for the cleanup after pointer update.
#[derive(Debug, Default)]
pub(crate) struct EvacuationOutcome {
    pub stats: EvacuationStats,
    /// Candidates whose objects all left
    pub evacuated: Vec<Arc<Page>>,
    /// Candidates that keep some of their objects
    pub aborted: Vec<Arc<Page>>,
    /// Young pages whose survivors were copied out
    pub emptied_new_pages: Vec<Arc<Page>>,
    /// Young pages that became old pages
    pub promoted: Vec<Arc<Page>>,
}

/// Records the slots of `object`, which sits on `host_page`, in every set
/// their targets require.
struct RecordMigratedSlotVisitor<'a> {
    page_table: &'a PageTable,
    host_page: &'a Page,
}

impl ObjectVisitor for RecordMigratedSlotVisitor<'_> {
    fn visit_pointer(&mut self, host: &HeapObject, slot: SlotIndex) {
        let Some(target_page) = host
            .load(slot)
            .heap_object()
            .and_then(|target| self.page_table.page_for(target))
        else {
            return;
        };
        record_migrated_slot(self.host_page, host.slot_address(slot), &target_page);
    }

    fn visit_reloc(&mut self, host: &HeapObject, reloc: &RelocInfo) {
        let Some(target_page) = reloc
            .target()
            .filter(|_| reloc.mode.is_heap_reference())
            .and_then(|target| self.page_table.page_for(target))
        else {
            return;
        };
        record_migrated_reloc_slot(self.host_page, host, reloc, &target_page);
    }
}

pub(crate) fn record_migrated_slots(page_table: &PageTable, host_page: &Page, object: &HeapObject) {
    let mut visitor = RecordMigratedSlotVisitor {
        page_table,
        host_page,
    };
    iterate_body(object, &mut visitor);
}

/// Fresh pages an evacuator allocates into, added to `owner` at the end.
struct CompactionSpace<'a> {
    owner: &'a Space,
    pages: Vec<Arc<Page>>,
}

impl<'a> CompactionSpace<'a> {
    fn new(owner: &'a Space) -> Self {
        CompactionSpace {
            owner,
            pages: Vec::new(),
        }
    }

    fn allocate(&mut self, size: usize) -> Option<(Arc<Page>, Address)> {
        if let Some(page) = self.pages.last() {
            if let Some(address) = page.try_allocate(size) {
                return Some((Arc::clone(page), address));
            }
        }
        if !self.owner.can_expand(self.pages.len()) {
            return None;
        }
        let page = self.owner.new_page().ok()?;
        let address = page.try_allocate(size)?;
        self.pages.push(Arc::clone(&page));
        Some((page, address))
    }
}

/// Copies objects for one participant of the evacuation job.
struct Evacuator<'a> {
    heap: &'a Heap,
    cycle: &'a CycleConfig,
    spaces: Vec<CompactionSpace<'a>>,
    observers: Vec<Arc<dyn MigrationObserver>>,
    stats: EvacuationStats,
}

impl<'a> Evacuator<'a> {
    fn new(heap: &'a Heap, cycle: &'a CycleConfig) -> Self {
        Evacuator {
            heap,
            cycle,
            spaces: Vec::new(),
            observers: heap.migration_observers(),
            stats: EvacuationStats::default(),
        }
    }

    fn compaction_space(&mut self, kind: SpaceKind) -> Option<&mut CompactionSpace<'a>> {
        let index = match self.spaces.iter().position(|s| s.owner.kind() == kind) {
            Some(index) => index,
            None => {
                self.spaces.push(CompactionSpace::new(self.heap.space(kind)?));
                self.spaces.len() - 1
            }
        };
        self.spaces.get_mut(index)
    }

    fn allocate(&mut self, kind: SpaceKind, size: usize) -> Option<(Arc<Page>, Address)> {
        if !self.heap.evacuation_allocation_allowed() {
            return None;
        }
        self.compaction_space(kind)?.allocate(size)
    }

    fn target_space(&self, object: &HeapObject, source: &Page) -> SpaceKind {
        let to_shared = self.cycle.shared_string_table
            && object.kind().is_internalizable_string()
            && !source.in_shared_region()
            && self.heap.shared_region().is_some();
        if to_shared {
            return SpaceKind::Shared;
        }
        match source.space() {
            SpaceKind::Code => SpaceKind::Code,
            SpaceKind::Shared => SpaceKind::Shared,
            _ => SpaceKind::Old,
        }
    }

    /// Forwards a thin string straight to its actual string when the latter
    /// is not moving.
    fn try_evacuate_without_copy(&self, object: &HeapObject) -> bool {
        if object.kind() != ObjectKind::ThinString {
            return false;
        }
        let Some(actual) = object.field(layout::thin_string::ACTUAL).strong_ref() else {
            return false;
        };
        let stays = self
            .heap
            .page_of(actual)
            .is_some_and(|p| !p.in_young_generation() && !p.is_evacuation_candidate());
        stays && object.set_forwarding_address(actual)
    }

    fn migrate(&mut self, object: &HeapObject, source: &Page) -> Option<Address> {
        let kind = self.target_space(object, source);
        let (page, target) = self.allocate(kind, object.size())?;
        let copy = Arc::new(object.copy_to(target));
        for observer in &self.observers {
            observer.move_event(object.kind(), object.address(), target, object.size());
        }
        if self.heap.marking_policy().should_mark(&page) {
            self.heap.marking_state().try_mark_on(&page, &copy);
        }
        page.insert_object(Arc::clone(&copy));
        record_migrated_slots(self.heap.page_table(), &page, &copy);
        let installed = object.set_forwarding_address(target);
        debug_assert!(installed, "{:?} forwarded twice", object.address());
        self.stats.copied_objects += 1;
        Some(target)
    }

    fn evacuate_page(&mut self, item: &EvacuationItem, aborted: &SegQueue<(Arc<Page>, Address)>) {
        let page = &item.page;
        page.set_evacuation_state(EvacuationState::InProgress);
        match item.mode {
            EvacuationMode::NewToOldPage => self.promote_page(page),
            EvacuationMode::NewToOldObjects => {
                for object in page.marked_objects() {
                    if self.try_evacuate_without_copy(&object) {
                        continue;
                    }
                    if self.migrate(&object, page).is_none() {
                        self.heap
                            .fatal_process_out_of_memory("evacuation of young objects");
                    }
                    self.stats.promoted_bytes += object.size();
                }
                page.set_evacuation_state(EvacuationState::Succeeded);
            }
            EvacuationMode::OldObjects => {
                for object in page.marked_objects() {
                    if self.try_evacuate_without_copy(&object) {
                        continue;
                    }
                    if self.migrate(&object, page).is_none() {
                        page.set_evacuation_state(EvacuationState::AbortedOom);
                        aborted.push((Arc::clone(page), object.address()));
                        self.stats.aborted_pages += 1;
                        log::warn!(
                            "aborted evacuation of page {} at {:?}: target space exhausted",
                            page.id(),
                            object.address()
                        );
                        return;
                    }
                    self.stats.compacted_bytes += object.size();
                }
                page.set_evacuation_state(EvacuationState::Succeeded);
                self.stats.evacuated_pages += 1;
                log::trace!("evacuated page {} of {}", page.id(), page.space().name());
            }
        }
    }

    fn promote_page(&mut self, page: &Arc<Page>) {
        if let (Some(new_space), Some(old_space)) =
            (self.heap.space(SpaceKind::New), self.heap.space(SpaceKind::Old))
        {
            new_space.remove_page(page);
            page.clear_flag(PageFlags::NEW_SPACE);
            page.set_flag(PageFlags::PAGE_NEW_OLD_PROMOTION);
            old_space.add_page(Arc::clone(page));
        }
        for object in page.marked_objects() {
            record_migrated_slots(self.heap.page_table(), page, &object);
            self.stats.promoted_bytes += object.size();
        }
        page.set_evacuation_state(EvacuationState::Succeeded);
        self.stats.promoted_pages += 1;
        log::trace!("promoted page {} with {} live bytes", page.id(), page.live_bytes());
    }

    fn into_pages(self) -> (EvacuationStats, Vec<(SpaceKind, Arc<Page>)>) {
        let pages = self
            .spaces
            .into_iter()
            .flat_map(|space| {
                let kind = space.owner.kind();
                space.pages.into_iter().map(move |page| (kind, page))
            })
            .collect();
        (self.stats, pages)
    }
}

/// Evacuates pages in parallel, one page per work item.
struct PageEvacuationJob<'a> {
    heap: &'a Heap,
    cycle: &'a CycleConfig,
    items: WorkItems<EvacuationItem>,
    aborted: SegQueue<(Arc<Page>, Address)>,
    compaction_pages: Mutex<Vec<(SpaceKind, Arc<Page>)>>,
    stats: Mutex<EvacuationStats>,
}

impl JobTask for PageEvacuationJob<'_> {
    fn run(&self, delegate: &JobDelegate) {
        let mut evacuator = Evacuator::new(self.heap, self.cycle);
        self.items
            .process(|item| evacuator.evacuate_page(item, &self.aborted));
        let (stats, pages) = evacuator.into_pages();
        log::trace!(
            "evacuation task {} copied {} objects",
            delegate.task_id(),
            stats.copied_objects
        );
        self.stats.lock().merge(&stats);
        self.compaction_pages.lock().extend(pages);
    }

    fn max_concurrency(&self, _worker_count: usize) -> usize {
        (self.items.remaining() / ITEMS_PER_WORKER).max(1)
    }
}

fn should_move_page(page: &Page, cycle: &CycleConfig) -> bool {
    if page.has_flag(PageFlags::PINNED) {
        return true;
    }
    cycle.page_promotion && page.live_bytes() * 100 > cycle.page_promotion_threshold * page.area_size()
}

/// Copies the live objects of `candidates` and the young generation.
///
/// On return, forwarding addresses are installed, compaction pages belong
/// to their spaces and aborted candidates are ordinary pages again with
/// freshly recorded slots. Pointers are not updated yet.
pub(crate) fn evacuate(heap: &Heap, cycle: &CycleConfig, candidates: &[Arc<Page>]) -> EvacuationOutcome {
    let started = Instant::now();
    let mut outcome = EvacuationOutcome::default();
    let mut items = Vec::new();
    if let Some(new_space) = heap.space(SpaceKind::New) {
        for page in new_space.pages() {
            if page.live_bytes() == 0 {
                outcome.emptied_new_pages.push(page);
                continue;
            }
            let mode = if should_move_page(&page, cycle) {
                outcome.promoted.push(Arc::clone(&page));
                EvacuationMode::NewToOldPage
            } else {
                outcome.emptied_new_pages.push(Arc::clone(&page));
                EvacuationMode::NewToOldObjects
            };
            items.push(EvacuationItem { page, mode });
        }
    }

    let mut aborted_by_policy = Vec::new();
    let abort_for_stack = cycle.gc_with_stack && !cycle.compact_with_stack;
    for page in candidates {
        if abort_for_stack || page.has_flag(PageFlags::PINNED) {
            page.set_evacuation_state(EvacuationState::AbortedByPolicy);
            aborted_by_policy.push(Arc::clone(page));
            continue;
        }
        items.push(EvacuationItem {
            page: Arc::clone(page),
            mode: EvacuationMode::OldObjects,
        });
    }

    let job = PageEvacuationJob {
        heap,
        cycle,
        items: WorkItems::new(items),
        aborted: SegQueue::new(),
        compaction_pages: Mutex::new(Vec::new()),
        stats: Mutex::new(EvacuationStats::default()),
    };
    let workers = if cycle.parallel_compaction { cycle.worker_threads } else { 0 };
    JobRuntime::new(workers)
        .create_job(TaskPriority::UserBlocking, &job)
        .join();

    for (kind, page) in job.compaction_pages.into_inner() {
        if let Some(space) = heap.space(kind) {
            space.add_page(page);
        }
    }
    outcome.stats = job.stats.into_inner();
    outcome.stats.aborted_pages += aborted_by_policy.len();

    let mut aborted: Vec<Arc<Page>> = aborted_by_policy;
    aborted.extend(crate::weak_objects::drain(&job.aborted).into_iter().map(|(page, _)| page));
    post_process_aborted_candidates(heap, &aborted);
    outcome.evacuated = candidates
        .iter()
        .filter(|p| p.evacuation_state() == EvacuationState::Succeeded)
        .cloned()
        .collect();
    outcome.aborted = aborted;

    if outcome.stats.compacted_bytes > 0 {
        heap.tracer()
            .lock()
            .add_compaction_event(outcome.stats.compacted_bytes, started.elapsed());
    }
    log::debug!(
        "evacuation: {} pages evacuated, {} aborted, {} promoted, {} objects copied",
        outcome.stats.evacuated_pages,
        outcome.stats.aborted_pages,
        outcome.stats.promoted_pages,
        outcome.stats.copied_objects
    );
    outcome
}

/// Turns aborted candidates back into regular pages.
///
/// Objects that were copied before the abort lose their mark so the
/// sweeper reclaims them; the rest are re-scanned to rebuild the page's
/// remembered sets from scratch.
fn post_process_aborted_candidates(heap: &Heap, aborted: &[Arc<Page>]) {
    for page in aborted {
        page.set_flag(PageFlags::COMPACTION_WAS_ABORTED);
    }
    for page in aborted {
        let mut live_bytes = 0;
        for object in page.marked_objects() {
            if object.is_forwarded() {
                page.marking_bitmap().clear(page.offset_of(object.address()));
            } else {
                live_bytes += object.size();
            }
        }
        page.set_live_bytes(live_bytes);
        page.slots().remove_range_all(0, page.size() as u32);
        for object in page.marked_objects() {
            record_migrated_slots(heap.page_table(), page, &object);
        }
    }
    for page in aborted {
        page.clear_flag(PageFlags::EVACUATION_CANDIDATE);
    }
}

/// Releases evacuated pages and hands the pages that keep objects to the
/// sweeper. Runs after pointers were updated. Returns the released pages.
pub(crate) fn release_evacuated_pages(heap: &Heap, outcome: &EvacuationOutcome) -> usize {
    let mut released = 0;
    for page in &outcome.evacuated {
        if let Some(space) = heap.space(page.space()) {
            page.clear_flag(PageFlags::EVACUATION_CANDIDATE);
            space.release_page(page);
            released += 1;
        }
    }
    if let Some(new_space) = heap.space(SpaceKind::New) {
        for page in &outcome.emptied_new_pages {
            new_space.release_page(page);
            released += 1;
        }
    }
    for page in &outcome.promoted {
        page.clear_flag(PageFlags::PAGE_NEW_OLD_PROMOTION);
        heap.sweeper_for(SpaceKind::Old).add_page(Arc::clone(page));
    }
    for page in &outcome.aborted {
        heap.sweeper_for(page.space()).add_page(Arc::clone(page));
    }
    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::FatalErrorHandler;
    use crate::config::HeapConfig;
    use crate::policy::HeapRole;
    use crate::remembered_set::RememberedSetKind;
    use core_types::Tagged;

    fn cycle(heap: &Heap) -> CycleConfig {
        CycleConfig::new(heap.config(), HeapRole::Standalone, 1, true, false, false)
    }

    fn live_object(heap: &Heap, space: SpaceKind, kind: ObjectKind, fields: usize) -> Address {
        let address = heap.allocate(space, kind, fields, 0).unwrap();
        let object = heap.object(address).unwrap();
        heap.marking_state().try_mark(&object);
        address
    }

    fn candidate(heap: &Heap, address: Address) -> Arc<Page> {
        let page = heap.page_of(address).unwrap();
        page.set_flag(PageFlags::EVACUATION_CANDIDATE);
        page
    }

    #[test]
    fn test_objects_leave_candidate_page() {
        let heap = Heap::new(HeapConfig::single_threaded());
        let holder = live_object(&heap, SpaceKind::Old, ObjectKind::Plain, 1);
        heap.space(SpaceKind::Old).unwrap().expand().unwrap();
        let moved = live_object(&heap, SpaceKind::Old, ObjectKind::Plain, 1);
        heap.write_field(moved, 0, Tagged::strong(holder)).unwrap();
        let page = candidate(&heap, moved);

        let outcome = evacuate(&heap, &cycle(&heap), &[Arc::clone(&page)]);
        assert_eq!(outcome.evacuated.len(), 1);
        assert_eq!(page.evacuation_state(), EvacuationState::Succeeded);
        let target = heap.object(moved).unwrap().forwarding_address().unwrap();
        assert!(heap.is_marked(target));
        assert_eq!(heap.read_field(target, 0).unwrap(), Tagged::strong(holder));
        assert!(heap.page_of(target).unwrap().id() != page.id());
    }

    #[test]
    fn test_abort_keeps_unforwarded_objects() {
        let heap = Heap::new(HeapConfig::single_threaded());
        let objects: Vec<Address> = (0..5)
            .map(|_| live_object(&heap, SpaceKind::Old, ObjectKind::Plain, 2))
            .collect();
        let page = candidate(&heap, objects[0]);
        heap.inject_evacuation_allocation_failure(2);

        let outcome = evacuate(&heap, &cycle(&heap), &[Arc::clone(&page)]);
        assert_eq!(outcome.aborted.len(), 1);
        assert!(outcome.evacuated.is_empty());
        assert_eq!(page.evacuation_state(), EvacuationState::AbortedOom);
        assert!(page.has_flag(PageFlags::COMPACTION_WAS_ABORTED));
        assert!(!page.is_evacuation_candidate());

        let forwarded = objects
            .iter()
            .filter(|&&a| heap.object(a).unwrap().is_forwarded())
            .count();
        assert_eq!(forwarded, 2);
        let remaining: usize = objects
            .iter()
            .map(|&a| heap.object(a).unwrap())
            .filter(|o| !o.is_forwarded())
            .map(|o| o.size())
            .sum();
        assert_eq!(page.live_bytes(), remaining);
    }

    #[test]
    fn test_aborted_page_rerecords_young_slots() {
        let heap = Heap::new(HeapConfig::single_threaded());
        let young = live_object(&heap, SpaceKind::New, ObjectKind::Plain, 0);
        let host = live_object(&heap, SpaceKind::Old, ObjectKind::Plain, 1);
        let page = candidate(&heap, host);
        heap.write_field(host, 0, Tagged::strong(young)).unwrap();
        page.slots().remove_range_all(0, page.size() as u32);
        // The young survivor gets the only allocation left.
        heap.inject_evacuation_allocation_failure(1);
        let outcome = evacuate(&heap, &cycle(&heap), &[Arc::clone(&page)]);
        assert_eq!(outcome.aborted.len(), 1);
        let slot = heap.object(host).unwrap().slot_address(SlotIndex::Field(0));
        assert!(page
            .slots()
            .contains(RememberedSetKind::OldToNew, page.offset_of(slot) as u32));
    }

    #[test]
    fn test_dense_young_page_is_promoted() {
        let config = HeapConfig {
            page_promotion_threshold: 0,
            ..HeapConfig::single_threaded()
        };
        let heap = Heap::new(config);
        let young = live_object(&heap, SpaceKind::New, ObjectKind::Plain, 0);
        let page = heap.page_of(young).unwrap();

        let outcome = evacuate(&heap, &cycle(&heap), &[]);
        assert_eq!(outcome.promoted.len(), 1);
        assert!(!page.in_young_generation());
        assert_eq!(page.space(), SpaceKind::Old);
        assert!(!heap.object(young).unwrap().is_forwarded());
    }

    #[test]
    fn test_sparse_young_page_is_copied() {
        let heap = Heap::new(HeapConfig::single_threaded());
        let young = live_object(&heap, SpaceKind::New, ObjectKind::Plain, 0);

        let outcome = evacuate(&heap, &cycle(&heap), &[]);
        assert_eq!(outcome.stats.promoted_bytes, heap.object(young).unwrap().size());
        let target = heap.object(young).unwrap().forwarding_address().unwrap();
        assert_eq!(heap.page_of(target).unwrap().space(), SpaceKind::Old);
        assert_eq!(release_evacuated_pages(&heap, &outcome), 1);
        assert_eq!(heap.space(SpaceKind::New).unwrap().page_count(), 0);
    }

    #[test]
    fn test_thin_string_forwards_to_actual() {
        let heap = Heap::new(HeapConfig::single_threaded());
        let actual = live_object(&heap, SpaceKind::Old, ObjectKind::SeqString, 0);
        let thin = live_object(&heap, SpaceKind::New, ObjectKind::ThinString, 1);
        heap.write_field(thin, layout::thin_string::ACTUAL, Tagged::strong(actual))
            .unwrap();

        evacuate(&heap, &cycle(&heap), &[]);
        assert_eq!(heap.object(thin).unwrap().forwarding_address(), Some(actual));
    }

    struct PanicOnOom;

    impl FatalErrorHandler for PanicOnOom {
        fn fatal_out_of_memory(&self, location: &str) {
            panic!("fatal oom: {location}");
        }
    }

    #[test]
    #[should_panic(expected = "fatal oom")]
    fn test_young_promotion_failure_is_fatal() {
        let heap = Heap::new(HeapConfig::single_threaded());
        heap.set_fatal_error_handler(Arc::new(PanicOnOom));
        live_object(&heap, SpaceKind::New, ObjectKind::Plain, 0);
        heap.inject_evacuation_allocation_failure(0);
        evacuate(&heap, &cycle(&heap), &[]);
    }
}
