//! Rewrites references to evacuated objects.
//!
//! Every page that may hold recorded slots becomes one updating item, so a
//! page's slot sets are only ever touched by one thread. Roots, the
//! heap-level weak lists and, for the shared-region owner, the roots and
//! OLD_TO_SHARED slots of client heaps are updated on the main thread.

use crate::config::CycleConfig;
use crate::heap::Heap;
use crate::jobs::{JobDelegate, JobRuntime, JobTask, TaskPriority, WorkItems};
use crate::object::HeapObject;
use crate::page::{Page, PageTable};
use crate::remembered_set::{RememberedSetKind, SlotCallbackResult};
use crate::roots::{Root, RootSlot, RootVisitor, SkipRoot};
use crate::safepoint::GlobalSafepointScope;
use crate::space::SpaceKind;
use core_types::{Address, Tagged};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const MAX_POINTER_UPDATE_TASKS: usize = 8;

/// New location of the object at `target`, if it was evacuated.
#[inline]
fn forwarding_address(page_table: &PageTable, target: Address) -> Option<Address> {
    page_table.page_for(target)?.object(target)?.forwarding_address()
}

/// `value` rewritten to the new location of its target, if it moved.
fn forwarded_value(page_table: &PageTable, value: Tagged) -> Option<Tagged> {
    let target = value.heap_object()?;
    forwarding_address(page_table, target).map(|new| value.with_address(new))
}

/// What happens to a slot once its value is up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotFilter {
    /// Keep slots whose target is still young
    Young,
    /// Keep slots whose target is still in the shared region
    Shared,
    /// Keep every slot; the set is released afterwards
    All,
}

impl SlotFilter {
    fn for_kind(kind: RememberedSetKind) -> SlotFilter {
        match kind {
            RememberedSetKind::OldToNew => SlotFilter::Young,
            RememberedSetKind::OldToShared => SlotFilter::Shared,
            RememberedSetKind::OldToOld | RememberedSetKind::OldToCode => SlotFilter::All,
        }
    }

    fn check(self, page_table: &PageTable, target: Option<Address>) -> SlotCallbackResult {
        let keep = match self {
            SlotFilter::All => true,
            SlotFilter::Young => target
                .and_then(|t| page_table.page_for(t))
                .is_some_and(|p| p.in_young_generation()),
            SlotFilter::Shared => target
                .and_then(|t| page_table.page_for(t))
                .is_some_and(|p| p.in_shared_region()),
        };
        if keep {
            SlotCallbackResult::Keep
        } else {
            SlotCallbackResult::Remove
        }
    }
}

/// Updates the slots of one page.
struct PageSlotsUpdater<'a> {
    page_table: &'a PageTable,
    page: &'a Page,
    updated: usize,
}

impl PageSlotsUpdater<'_> {
    fn host(&self, offset: u32) -> Option<(Arc<HeapObject>, usize)> {
        let slot_address = self.page.start() + offset as usize;
        let host = self.page.object_containing(slot_address)?;
        let offset_in_host = (slot_address - host.address()) as usize;
        Some((host, offset_in_host))
    }

    fn update_slot(&mut self, offset: u32) -> Option<Address> {
        let (host, offset_in_host) = self.host(offset)?;
        let slot = host.slot_at_offset(offset_in_host)?;
        let value = host.load(slot);
        match forwarded_value(self.page_table, value) {
            Some(new_value) => {
                host.store(slot, new_value);
                self.updated += 1;
                new_value.heap_object()
            }
            None => value.heap_object(),
        }
    }

    fn update_typed_slot(&mut self, offset: u32) -> Option<Address> {
        let (host, offset_in_host) = self.host(offset)?;
        let target = host.reloc_at_offset(offset_in_host)?.target()?;
        match forwarding_address(self.page_table, target) {
            Some(new) => {
                host.set_reloc_value(offset_in_host, new.raw());
                self.updated += 1;
                Some(new)
            }
            None => Some(target),
        }
    }

    fn update(&mut self, kind: RememberedSetKind) {
        let filter = SlotFilter::for_kind(kind);
        let page_table = self.page_table;
        let page: &Page = self.page;
        let slots = page.slots();
        slots.iterate(kind, |offset| {
            let target = self.update_slot(offset);
            filter.check(page_table, target)
        });
        slots.iterate_typed(kind, |_, offset| {
            let target = self.update_typed_slot(offset);
            filter.check(page_table, target)
        });
    }
}

/// Updates the recorded slots of `page` of kinds `kinds`. Returns the
/// number of slots rewritten.
fn update_page_slots(page_table: &PageTable, page: &Page, kinds: &[RememberedSetKind]) -> usize {
    let mut updater = PageSlotsUpdater {
        page_table,
        page,
        updated: 0,
    };
    for &kind in kinds {
        updater.update(kind);
        if SlotFilter::for_kind(kind) == SlotFilter::All {
            page.slots().release(kind);
        }
    }
    updater.updated
}

struct UpdatingItem {
    page: Arc<Page>,
    kinds: &'static [RememberedSetKind],
}

const OWN_PAGE_KINDS: &[RememberedSetKind] = &[
    RememberedSetKind::OldToNew,
    RememberedSetKind::OldToOld,
    RememberedSetKind::OldToCode,
    RememberedSetKind::OldToShared,
];

const CLIENT_PAGE_KINDS: &[RememberedSetKind] = &[RememberedSetKind::OldToShared];

struct PointersUpdatingJob<'a> {
    page_table: &'a PageTable,
    items: WorkItems<UpdatingItem>,
    max_tasks: usize,
    updated: AtomicUsize,
}

impl JobTask for PointersUpdatingJob<'_> {
    fn run(&self, delegate: &JobDelegate) {
        let mut updated = 0;
        self.items.process(|item| {
            updated += update_page_slots(self.page_table, &item.page, item.kinds);
        });
        log::trace!("pointer update task {} rewrote {} slots", delegate.task_id(), updated);
        self.updated.fetch_add(updated, Ordering::Relaxed);
    }

    fn max_concurrency(&self, _worker_count: usize) -> usize {
        self.items.remaining().clamp(1, self.max_tasks)
    }
}

/// Rewrites root slots whose target moved.
struct RootUpdatingVisitor<'a> {
    page_table: &'a PageTable,
    updated: usize,
}

impl RootVisitor for RootUpdatingVisitor<'_> {
    fn visit_root(&mut self, _root: Root, slot: &RootSlot) {
        if let Some(value) = forwarded_value(self.page_table, slot.get()) {
            slot.set(value);
            self.updated += 1;
        }
    }
}

fn update_weak_lists(heap: &Heap) {
    let page_table = heap.page_table();
    if heap.owns_string_table() {
        heap.string_table()
            .update(|string| forwarding_address(page_table, string));
    }
    let maps = heap
        .retained_maps()
        .into_iter()
        .map(|(map, age)| (forwarded_value(page_table, map).unwrap_or(map), age))
        .collect();
    heap.set_retained_maps(maps);
    for registry in heap.dirty_registry_slots().iter_mut() {
        if let Some(value) = forwarded_value(page_table, *registry) {
            *registry = value;
        }
    }
}

fn update_roots(heap: &Heap) -> usize {
    let mut visitor = RootUpdatingVisitor {
        page_table: heap.page_table(),
        updated: 0,
    };
    heap.roots().iterate(SkipRoot::empty(), &mut visitor);
    update_weak_lists(heap);
    visitor.updated
}

fn updating_items(heap: &Heap, clients: Option<&GlobalSafepointScope>) -> Vec<UpdatingItem> {
    let mut items = Vec::new();
    for space in heap.collected_spaces() {
        if space.kind() == SpaceKind::New {
            continue;
        }
        items.extend(
            space
                .pages()
                .into_iter()
                .filter(|page| !page.is_evacuation_candidate())
                .map(|page| UpdatingItem {
                    page,
                    kinds: OWN_PAGE_KINDS,
                }),
        );
    }
    if let Some(scope) = clients {
        scope.iterate_clients(|client| {
            for space in client.collected_spaces() {
                items.extend(space.pages().into_iter().map(|page| UpdatingItem {
                    page,
                    kinds: CLIENT_PAGE_KINDS,
                }));
            }
        });
    }
    items
}

/// Updates every reference to an evacuated object. Returns the number of
/// slots rewritten.
///
/// `clients` is the safepoint scope of a shared-region owner; the roots and
/// shared slots of each client heap are updated with the owner's.
pub(crate) fn update_pointers_after_evacuation(
    heap: &Heap,
    cycle: &CycleConfig,
    clients: Option<&GlobalSafepointScope>,
) -> usize {
    let mut updated = update_roots(heap);
    if let Some(scope) = clients {
        for client in scope.clients() {
            updated += update_roots(client);
        }
    }

    let job = PointersUpdatingJob {
        page_table: heap.page_table(),
        items: WorkItems::new(updating_items(heap, clients)),
        max_tasks: if cycle.parallel_pointer_update {
            MAX_POINTER_UPDATE_TASKS
        } else {
            1
        },
        updated: AtomicUsize::new(0),
    };
    let pages = job.items.len();
    let workers = if cycle.parallel_pointer_update { cycle.worker_threads } else { 0 };
    JobRuntime::new(workers)
        .create_job(TaskPriority::UserBlocking, &job)
        .join();
    updated += job.updated.into_inner();
    log::debug!("pointer update: {} slots rewritten on {} pages", updated, pages);
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::evacuation::evacuate;
    use crate::object::{ObjectKind, RelocMode};
    use crate::page::PageFlags;
    use crate::policy::HeapRole;

    fn cycle(heap: &Heap) -> CycleConfig {
        CycleConfig::new(heap.config(), HeapRole::Standalone, 1, true, false, false)
    }

    fn live(heap: &Heap, space: SpaceKind, fields: usize) -> Address {
        let address = heap.allocate(space, ObjectKind::Plain, fields, 0).unwrap();
        heap.marking_state().try_mark(&heap.object(address).unwrap());
        address
    }

    /// Allocates a holder on the first old page and a target on a second
    /// page that becomes a candidate, with the holder's slot recorded.
    fn holder_and_candidate(heap: &Heap) -> (Address, Address, Arc<Page>) {
        let holder = live(heap, SpaceKind::Old, 1);
        heap.space(SpaceKind::Old).unwrap().expand().unwrap();
        let target = live(heap, SpaceKind::Old, 0);
        let page = heap.page_of(target).unwrap();
        page.set_flag(PageFlags::EVACUATION_CANDIDATE);
        heap.write_field(holder, 0, Tagged::strong(target)).unwrap();
        let holder_page = heap.page_of(holder).unwrap();
        let slot = heap.object(holder).unwrap().slot_address(crate::object::SlotIndex::Field(0));
        holder_page.record_slot(RememberedSetKind::OldToOld, slot);
        (holder, target, page)
    }

    #[test]
    fn test_recorded_slot_follows_forwarding() {
        let heap = Heap::new(HeapConfig::single_threaded());
        let (holder, target, page) = holder_and_candidate(&heap);
        let root = heap.roots().add_strong_root(Tagged::strong(target));

        evacuate(&heap, &cycle(&heap), &[page]);
        let new = heap.object(target).unwrap().forwarding_address().unwrap();
        let updated = update_pointers_after_evacuation(&heap, &cycle(&heap), None);

        assert_eq!(updated, 2);
        assert_eq!(heap.read_field(holder, 0).unwrap(), Tagged::strong(new));
        assert_eq!(root.get(), Tagged::strong(new));
        assert!(heap
            .page_of(holder)
            .unwrap()
            .slots()
            .is_empty(RememberedSetKind::OldToOld));
    }

    #[test]
    fn test_update_is_idempotent() {
        let heap = Heap::new(HeapConfig::single_threaded());
        let (holder, target, page) = holder_and_candidate(&heap);
        let holder_page = heap.page_of(holder).unwrap();
        let slot = heap.object(holder).unwrap().slot_address(crate::object::SlotIndex::Field(0));

        evacuate(&heap, &cycle(&heap), &[page]);
        update_pointers_after_evacuation(&heap, &cycle(&heap), None);
        let after_first = heap.read_field(holder, 0).unwrap();
        holder_page.record_slot(RememberedSetKind::OldToOld, slot);
        assert_eq!(update_pointers_after_evacuation(&heap, &cycle(&heap), None), 0);
        assert_eq!(heap.read_field(holder, 0).unwrap(), after_first);
        assert_ne!(after_first, Tagged::strong(target));
    }

    #[test]
    fn test_old_to_new_slots_dropped_after_promotion() {
        let heap = Heap::new(HeapConfig::single_threaded());
        let holder = live(&heap, SpaceKind::Old, 1);
        let young = live(&heap, SpaceKind::New, 0);
        heap.write_field(holder, 0, Tagged::weak(young)).unwrap();
        let holder_page = heap.page_of(holder).unwrap();
        assert!(!holder_page.slots().is_empty(RememberedSetKind::OldToNew));

        evacuate(&heap, &cycle(&heap), &[]);
        update_pointers_after_evacuation(&heap, &cycle(&heap), None);
        let new = heap.object(young).unwrap().forwarding_address().unwrap();
        assert_eq!(heap.read_field(holder, 0).unwrap(), Tagged::weak(new));
        assert!(holder_page.slots().is_empty(RememberedSetKind::OldToNew));
    }

    #[test]
    fn test_typed_slot_is_patched() {
        let heap = Heap::new(HeapConfig::single_threaded());
        let code = heap
            .allocate_code(0, 64, crate::object::ObjectFlags::empty())
            .unwrap();
        heap.marking_state().try_mark(&heap.object(code).unwrap());
        heap.space(SpaceKind::Old).unwrap().expand().unwrap();
        let target = live(&heap, SpaceKind::Old, 0);
        let page = heap.page_of(target).unwrap();
        page.set_flag(PageFlags::EVACUATION_CANDIDATE);
        let offset = heap.add_reloc(code, RelocMode::FullEmbeddedObject, target).unwrap();
        let code_object = heap.object(code).unwrap();
        let reloc = code_object.reloc_at_offset(offset).unwrap();
        crate::write_barrier::record_reloc_slot(&heap.page_of(code).unwrap(), &code_object, &reloc, &page);

        evacuate(&heap, &cycle(&heap), &[page]);
        update_pointers_after_evacuation(&heap, &cycle(&heap), None);
        let new = heap.object(target).unwrap().forwarding_address().unwrap();
        assert_eq!(code_object.reloc_at_offset(offset).unwrap().target(), Some(new));
    }

    #[test]
    fn test_retained_maps_and_string_table_follow() {
        let heap = Heap::new(HeapConfig::single_threaded());
        let string = heap.internalize_string("moved").unwrap();
        let map = heap
            .allocate(SpaceKind::Old, ObjectKind::Map, crate::object::layout::map::FIELD_COUNT, 0)
            .unwrap();
        for address in [string, map] {
            heap.marking_state().try_mark(&heap.object(address).unwrap());
        }
        let page = heap.page_of(string).unwrap();
        page.set_flag(PageFlags::EVACUATION_CANDIDATE);
        heap.add_retained_map(map);

        evacuate(&heap, &cycle(&heap), &[page]);
        update_pointers_after_evacuation(&heap, &cycle(&heap), None);
        let new_string = heap.object(string).unwrap().forwarding_address().unwrap();
        let new_map = heap.object(map).unwrap().forwarding_address().unwrap();
        assert_eq!(heap.string_table().lookup("moved"), Some(new_string));
        assert_eq!(heap.retained_maps()[0].0, Tagged::weak(new_map));
    }
}
