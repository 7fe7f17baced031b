//! Pages and the page table.
//!
//! Regular pages are [`PAGE_SIZE`] bytes, aligned to their size, with a
//! [`PAGE_HEADER_SIZE`] byte header in front of the object area. Large
//! pages hold exactly one object and span as many page-table entries as
//! they need. The [`PageTable`] maps any interior address back to its page
//! and may be shared by several heaps attached to one shared region.

use crate::marking_bitmap::MarkingBitmap;
use crate::object::HeapObject;
use crate::remembered_set::{RememberedSet, RememberedSetKind, SlotType};
use crate::space::SpaceKind;
use bitflags::bitflags;
use core_types::Address;
use crossbeam::atomic::AtomicCell;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Log2 of the regular page size.
pub const PAGE_SIZE_LOG2: usize = 18;
/// Regular page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_LOG2;
/// Bytes reserved at the start of every page.
pub const PAGE_HEADER_SIZE: usize = 256;
/// Usable bytes of a regular page.
pub const PAGE_AREA_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Identifies the heap a page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(pub u32);

bitflags! {
    /// Page state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        /// Selected for evacuation in the current cycle
        const EVACUATION_CANDIDATE = 1 << 0;
        /// Never selected for evacuation
        const NEVER_EVACUATE = 1 << 1;
        /// Pinned for one cycle
        const PINNED = 1 << 2;
        /// Evacuation of this page was aborted
        const COMPACTION_WAS_ABORTED = 1 << 3;
        /// Becomes a candidate under manual selection
        const FORCE_EVACUATION_CANDIDATE_FOR_TESTING = 1 << 4;
        /// Young page promoted to old space as a whole
        const PAGE_NEW_OLD_PROMOTION = 1 << 5;
        /// Holds code
        const IS_EXECUTABLE = 1 << 6;
        /// Part of the shared region
        const IN_SHARED_HEAP = 1 << 7;
        /// Part of read-only space
        const READ_ONLY = 1 << 8;
        /// Part of the young generation
        const NEW_SPACE = 1 << 9;
        /// Holds a single large object
        const LARGE_PAGE = 1 << 10;
    }
}

/// Evacuation progress of a candidate page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvacuationState {
    /// Not yet picked up by an evacuator
    Pending,
    /// An evacuator is copying objects off the page
    InProgress,
    /// Every live object was copied
    Succeeded,
    /// Copying stopped because the target space was exhausted
    AbortedOom,
    /// Copying was skipped by policy
    AbortedByPolicy,
}

/// Sweeping progress of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepingState {
    /// Free space is known; the page can be allocated from
    Done,
    /// Queued for the sweeper
    Pending,
    /// Being swept
    InProgress,
}

struct PageAllocator {
    top: usize,
    free_ranges: Vec<(usize, usize)>,
}

/// A page of heap memory.
pub struct Page {
    id: usize,
    start: Address,
    size: usize,
    heap: HeapId,
    space: AtomicCell<SpaceKind>,
    flags: AtomicU32,
    evacuation_state: AtomicCell<EvacuationState>,
    sweeping_state: AtomicCell<SweepingState>,
    bitmap: MarkingBitmap,
    live_bytes: AtomicUsize,
    allocated_bytes: AtomicUsize,
    allocator: Mutex<PageAllocator>,
    objects: RwLock<BTreeMap<usize, Arc<HeapObject>>>,
    slots: RememberedSet,
}

impl Page {
    fn new(id: usize, size: usize, heap: HeapId, space: SpaceKind, flags: PageFlags) -> Self {
        Page {
            id,
            start: Address::new((id + 1) << PAGE_SIZE_LOG2),
            size,
            heap,
            space: AtomicCell::new(space),
            flags: AtomicU32::new(flags.bits()),
            evacuation_state: AtomicCell::new(EvacuationState::Pending),
            sweeping_state: AtomicCell::new(SweepingState::Done),
            bitmap: MarkingBitmap::new(size),
            live_bytes: AtomicUsize::new(0),
            allocated_bytes: AtomicUsize::new(0),
            allocator: Mutex::new(PageAllocator {
                top: PAGE_HEADER_SIZE,
                free_ranges: Vec::new(),
            }),
            objects: RwLock::new(BTreeMap::new()),
            slots: RememberedSet::new(),
        }
    }

    /// Page-table index.
    pub fn id(&self) -> usize {
        self.id
    }

    /// First byte of the page.
    pub fn start(&self) -> Address {
        self.start
    }

    /// First byte of the object area.
    pub fn area_start(&self) -> Address {
        self.start + PAGE_HEADER_SIZE
    }

    /// One past the last byte of the page.
    pub fn area_end(&self) -> Address {
        self.start + self.size
    }

    /// Usable bytes.
    pub fn area_size(&self) -> usize {
        self.size - PAGE_HEADER_SIZE
    }

    /// Total bytes including the header.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Owning heap.
    pub fn heap_id(&self) -> HeapId {
        self.heap
    }

    /// Owning space.
    pub fn space(&self) -> SpaceKind {
        self.space.load()
    }

    pub(crate) fn set_space(&self, space: SpaceKind) {
        self.space.store(space);
    }

    /// Returns true if `address` lies on this page.
    pub fn contains(&self, address: Address) -> bool {
        address >= self.start && address < self.area_end()
    }

    /// Byte offset of `address` from the page start.
    #[inline]
    pub fn offset_of(&self, address: Address) -> usize {
        address.raw() - self.start.raw()
    }

    /// Current flags.
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Returns true if all of `flags` are set.
    pub fn has_flag(&self, flags: PageFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Sets flags.
    pub fn set_flag(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clears flags.
    pub fn clear_flag(&self, flags: PageFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Selected for evacuation.
    #[inline]
    pub fn is_evacuation_candidate(&self) -> bool {
        self.has_flag(PageFlags::EVACUATION_CANDIDATE)
    }

    /// Holds code.
    #[inline]
    pub fn is_executable(&self) -> bool {
        self.has_flag(PageFlags::IS_EXECUTABLE)
    }

    /// Part of the shared region.
    #[inline]
    pub fn in_shared_region(&self) -> bool {
        self.has_flag(PageFlags::IN_SHARED_HEAP)
    }

    /// Part of read-only space.
    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.has_flag(PageFlags::READ_ONLY)
    }

    /// Part of the young generation.
    #[inline]
    pub fn in_young_generation(&self) -> bool {
        self.has_flag(PageFlags::NEW_SPACE)
    }

    /// Holds a single large object.
    #[inline]
    pub fn is_large(&self) -> bool {
        self.has_flag(PageFlags::LARGE_PAGE)
    }

    /// Slots of objects on this page are not recorded for evacuation.
    ///
    /// Pages whose compaction was aborted record again, since their objects
    /// stay where they are.
    #[inline]
    pub fn should_skip_evacuation_slot_recording(&self) -> bool {
        let flags = self.flags();
        flags.intersects(PageFlags::EVACUATION_CANDIDATE | PageFlags::NEW_SPACE)
            && !flags.contains(PageFlags::COMPACTION_WAS_ABORTED)
    }

    /// The page accepts new allocations.
    pub fn can_allocate(&self) -> bool {
        !self.is_evacuation_candidate() && self.sweeping_state() == SweepingState::Done
    }

    /// Evacuation progress.
    pub fn evacuation_state(&self) -> EvacuationState {
        self.evacuation_state.load()
    }

    /// Sets the evacuation progress.
    pub fn set_evacuation_state(&self, state: EvacuationState) {
        self.evacuation_state.store(state);
    }

    /// Sweeping progress.
    pub fn sweeping_state(&self) -> SweepingState {
        self.sweeping_state.load()
    }

    /// Sets the sweeping progress.
    pub fn set_sweeping_state(&self, state: SweepingState) {
        self.sweeping_state.store(state);
    }

    /// Returns true once sweeping finished.
    pub fn sweeping_done(&self) -> bool {
        self.sweeping_state() == SweepingState::Done
    }

    /// Mark bits.
    pub fn marking_bitmap(&self) -> &MarkingBitmap {
        &self.bitmap
    }

    /// Returns true if the object starting at `address` is marked.
    pub fn is_marked(&self, address: Address) -> bool {
        self.bitmap.is_set(self.offset_of(address))
    }

    /// Bytes of marked objects.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Adds to the live byte count.
    pub fn add_live_bytes(&self, bytes: usize) {
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Overwrites the live byte count.
    pub fn set_live_bytes(&self, bytes: usize) {
        self.live_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Bytes handed out to objects.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Bytes not handed out.
    pub fn free_bytes(&self) -> usize {
        self.area_size().saturating_sub(self.allocated_bytes())
    }

    /// Remembered sets.
    pub fn slots(&self) -> &RememberedSet {
        &self.slots
    }

    /// Records an untyped slot at `slot`.
    pub fn record_slot(&self, kind: RememberedSetKind, slot: Address) {
        self.slots.insert(kind, self.offset_of(slot) as u32);
    }

    /// Records a typed slot at `slot`.
    pub fn record_typed_slot(&self, kind: RememberedSetKind, slot_type: SlotType, slot: Address) {
        self.slots
            .insert_typed(kind, slot_type, self.offset_of(slot) as u32);
    }

    /// Carves `size` bytes out of the page.
    pub fn try_allocate(&self, size: usize) -> Option<Address> {
        let mut allocator = self.allocator.lock();
        let offset = if let Some(index) = allocator
            .free_ranges
            .iter()
            .position(|&(start, end)| end - start >= size)
        {
            let (start, end) = allocator.free_ranges[index];
            if end - start == size {
                allocator.free_ranges.swap_remove(index);
            } else {
                allocator.free_ranges[index].0 = start + size;
            }
            start
        } else if allocator.top + size <= self.size {
            let start = allocator.top;
            allocator.top += size;
            start
        } else {
            return None;
        };
        self.allocated_bytes.fetch_add(size, Ordering::Relaxed);
        Some(self.start + offset)
    }

    /// Replaces the free list after sweeping.
    pub(crate) fn reset_free_space(&self, free_ranges: Vec<(usize, usize)>, top: usize, allocated: usize) {
        let mut allocator = self.allocator.lock();
        allocator.free_ranges = free_ranges;
        allocator.top = top;
        self.allocated_bytes.store(allocated, Ordering::Relaxed);
    }

    /// Registers an object that was placed on this page.
    pub fn insert_object(&self, object: Arc<HeapObject>) {
        let offset = self.offset_of(object.address());
        self.objects.write().insert(offset, object);
    }

    /// Unregisters the object starting at `address`.
    pub fn remove_object(&self, address: Address) -> Option<Arc<HeapObject>> {
        self.objects.write().remove(&self.offset_of(address))
    }

    /// Object starting at `address`.
    pub fn object(&self, address: Address) -> Option<Arc<HeapObject>> {
        self.objects.read().get(&self.offset_of(address)).cloned()
    }

    /// Object whose extent covers `address`.
    pub fn object_containing(&self, address: Address) -> Option<Arc<HeapObject>> {
        let objects = self.objects.read();
        let (_, object) = objects.range(..=self.offset_of(address)).next_back()?;
        object.contains(address).then(|| Arc::clone(object))
    }

    /// All objects in address order.
    pub fn objects(&self) -> Vec<Arc<HeapObject>> {
        self.objects.read().values().cloned().collect()
    }

    /// Marked objects in address order.
    pub fn marked_objects(&self) -> Vec<Arc<HeapObject>> {
        self.objects
            .read()
            .iter()
            .filter(|(&offset, _)| self.bitmap.is_set(offset))
            .map(|(_, object)| Arc::clone(object))
            .collect()
    }

    /// Number of objects.
    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    pub(crate) fn retain_objects(&self, mut keep: impl FnMut(&Arc<HeapObject>) -> bool) {
        self.objects.write().retain(|_, object| keep(object));
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("space", &self.space())
            .field("flags", &self.flags())
            .field("live_bytes", &self.live_bytes())
            .field("allocated_bytes", &self.allocated_bytes())
            .finish()
    }
}

/// Address-to-page mapping shared by all heaps of one region.
#[derive(Default)]
pub struct PageTable {
    pages: RwLock<Vec<Option<Arc<Page>>>>,
    free_ids: Mutex<Vec<usize>>,
    next_heap: AtomicU32,
}

impl PageTable {
    /// Creates an empty table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hands out a fresh heap identifier.
    pub fn next_heap_id(&self) -> HeapId {
        HeapId(self.next_heap.fetch_add(1, Ordering::Relaxed))
    }

    /// Maps a new page of at least `size` bytes.
    pub fn allocate_page(
        &self,
        heap: HeapId,
        space: SpaceKind,
        flags: PageFlags,
        size: usize,
    ) -> Arc<Page> {
        let span = size.div_ceil(PAGE_SIZE).max(1);
        let mut pages = self.pages.write();
        let reused = if span == 1 {
            self.free_ids.lock().pop()
        } else {
            None
        };
        let id = match reused {
            Some(id) => id,
            None => {
                let id = pages.len();
                pages.resize(id + span, None);
                id
            }
        };
        let page = Arc::new(Page::new(id, span * PAGE_SIZE, heap, space, flags));
        for entry in pages.iter_mut().skip(id).take(span) {
            *entry = Some(Arc::clone(&page));
        }
        log::trace!("mapped page {} at {} ({:?}, {} bytes)", id, page.start(), space, page.size());
        page
    }

    /// Unmaps `page`. Addresses on it no longer resolve.
    pub fn release(&self, page: &Page) {
        let span = page.size() / PAGE_SIZE;
        let mut pages = self.pages.write();
        for entry in pages.iter_mut().skip(page.id()).take(span) {
            *entry = None;
        }
        self.free_ids.lock().extend(page.id()..page.id() + span);
        log::trace!("released page {} at {}", page.id(), page.start());
    }

    /// Page covering `address`.
    pub fn page_for(&self, address: Address) -> Option<Arc<Page>> {
        let id = (address.raw() >> PAGE_SIZE_LOG2).checked_sub(1)?;
        let page = self.pages.read().get(id)?.clone()?;
        page.contains(address).then_some(page)
    }

    /// Number of mapped pages.
    pub fn mapped_pages(&self) -> usize {
        let pages = self.pages.read();
        let mut seen = 0;
        let mut last = None;
        for page in pages.iter().flatten() {
            if last != Some(page.id()) {
                seen += 1;
                last = Some(page.id());
            }
        }
        seen
    }
}
