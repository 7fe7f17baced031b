//! Page sweeper.
//!
//! Pages that survive a collection without being compacted are handed to
//! the sweeper, which reclaims the memory of their unmarked objects. A
//! page waiting for sweeping accepts no allocations. Sweeping is lazy: the
//! heap sweeps a space before allocating in it, and the collector finishes
//! all pending work before the next cycle starts.

use crate::page::{Page, PageFlags, SweepingState, PAGE_HEADER_SIZE};
use crate::space::SpaceKind;
use parking_lot::Mutex;
use std::sync::Arc;

/// Outcome of sweeping one page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepResult {
    /// Bytes of objects kept
    pub live_bytes: usize,
    /// Bytes returned to the free list
    pub freed_bytes: usize,
    /// Objects removed
    pub freed_objects: usize,
}

/// Sweeps one page.
///
/// Unmarked objects are dropped, the gaps between survivors become free
/// ranges and slots recorded inside the gaps are removed. Leaves the page
/// with clean mark bits.
pub fn sweep_page(page: &Page) -> SweepResult {
    page.set_sweeping_state(SweepingState::InProgress);
    let before = page.allocated_bytes();
    let mut freed_objects = 0;
    page.retain_objects(|object| {
        let live = page.is_marked(object.address());
        if !live {
            freed_objects += 1;
        }
        live
    });

    let mut free_ranges = Vec::new();
    let mut cursor = PAGE_HEADER_SIZE;
    let mut live_bytes = 0;
    for object in page.objects() {
        let start = page.offset_of(object.address());
        if start > cursor {
            free_ranges.push((cursor, start));
        }
        live_bytes += object.size();
        cursor = start + object.size();
    }
    for &(start, end) in &free_ranges {
        page.slots().remove_range_all(start as u32, end as u32);
    }
    page.slots().remove_range_all(cursor as u32, page.size() as u32);
    page.reset_free_space(free_ranges, cursor, live_bytes);

    page.marking_bitmap().clear_all();
    page.set_live_bytes(0);
    page.clear_flag(PageFlags::COMPACTION_WAS_ABORTED);
    page.set_sweeping_state(SweepingState::Done);

    let result = SweepResult {
        live_bytes,
        freed_bytes: before.saturating_sub(live_bytes),
        freed_objects,
    };
    log::trace!(
        "swept page {}: {} live bytes, {} freed in {} objects",
        page.id(),
        result.live_bytes,
        result.freed_bytes,
        result.freed_objects
    );
    result
}

/// Pages waiting to be swept.
#[derive(Default)]
pub struct Sweeper {
    pending: Mutex<Vec<Arc<Page>>>,
}

impl Sweeper {
    /// Creates an idle sweeper.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `page` for sweeping.
    pub fn add_page(&self, page: Arc<Page>) {
        page.set_sweeping_state(SweepingState::Pending);
        self.pending.lock().push(page);
    }

    /// Returns true while pages wait for sweeping.
    pub fn sweeping_in_progress(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Number of pages waiting.
    pub fn pending_pages(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns true if a page of `space` waits for sweeping.
    pub fn has_pending(&self, space: SpaceKind) -> bool {
        self.pending.lock().iter().any(|p| p.space() == space)
    }

    /// Sweeps the pending pages of `space`.
    pub fn sweep_space(&self, space: SpaceKind) -> usize {
        let pages: Vec<Arc<Page>> = {
            let mut pending = self.pending.lock();
            let (selected, rest) = pending.drain(..).partition(|p| p.space() == space);
            *pending = rest;
            selected
        };
        pages.iter().map(|page| sweep_page(page).freed_bytes).sum()
    }

    /// Sweeps every pending page. Returns the bytes freed.
    pub fn ensure_completed(&self) -> usize {
        let pages = std::mem::take(&mut *self.pending.lock());
        if pages.is_empty() {
            return 0;
        }
        let freed = pages.iter().map(|page| sweep_page(page).freed_bytes).sum();
        log::debug!("completed sweeping of {} pages, freed {} bytes", pages.len(), freed);
        freed
    }

    /// Drops `page` from the pending list without sweeping it.
    pub fn remove_page(&self, page: &Page) {
        self.pending.lock().retain(|p| p.id() != page.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{HeapObject, ObjectKind};
    use crate::page::{HeapId, PageTable, PAGE_SIZE};
    use crate::remembered_set::RememberedSetKind;
    use core_types::Tagged;

    fn page_with_objects(count: usize) -> (Arc<Page>, Vec<Arc<HeapObject>>) {
        let table = PageTable::new();
        let page = table.allocate_page(HeapId(0), SpaceKind::Old, PageFlags::empty(), PAGE_SIZE);
        let objects = (0..count)
            .map(|_| {
                let address = page.try_allocate(24).unwrap();
                let object = Arc::new(HeapObject::new(address, ObjectKind::Plain, Tagged::UNDEFINED, 2, 0));
                page.insert_object(Arc::clone(&object));
                object
            })
            .collect();
        (page, objects)
    }

    fn mark(page: &Page, object: &HeapObject) {
        page.marking_bitmap().set(page.offset_of(object.address()));
        page.add_live_bytes(object.size());
    }

    #[test]
    fn test_sweep_frees_unmarked_objects() {
        let (page, objects) = page_with_objects(3);
        mark(&page, &objects[1]);
        let dead_slot = objects[0].slot_address(crate::object::SlotIndex::Field(0));
        page.record_slot(RememberedSetKind::OldToNew, dead_slot);

        let result = sweep_page(&page);
        assert_eq!(result.freed_objects, 2);
        assert_eq!(result.live_bytes, 24);
        assert_eq!(page.object_count(), 1);
        assert_eq!(page.allocated_bytes(), 24);
        assert!(page.slots().is_empty(RememberedSetKind::OldToNew));
        assert!(page.marking_bitmap().is_clean());
        assert!(page.sweeping_done());
    }

    #[test]
    fn test_freed_gap_is_reused() {
        let (page, objects) = page_with_objects(2);
        mark(&page, &objects[1]);
        sweep_page(&page);
        assert_eq!(page.try_allocate(24), Some(objects[0].address()));
    }

    #[test]
    fn test_lazy_sweeping_by_space() {
        let (page, objects) = page_with_objects(1);
        let sweeper = Sweeper::new();
        sweeper.add_page(Arc::clone(&page));
        assert!(!page.can_allocate());
        assert!(sweeper.has_pending(SpaceKind::Old));
        assert_eq!(sweeper.sweep_space(SpaceKind::Code), 0);
        assert_eq!(sweeper.sweep_space(SpaceKind::Old), objects[0].size());
        assert!(!sweeper.sweeping_in_progress());
        assert!(page.can_allocate());
    }
}
