//! Mark bits of heap objects.
//!
//! Marking an object sets its bit in the owning page's bitmap and adds its
//! size to the page's live byte counter. Only the thread that flips the bit
//! accounts the bytes, so concurrent markers never double count.

use crate::object::HeapObject;
use crate::page::{Page, PageTable};
use core_types::Address;
use std::sync::Arc;

/// Whether mark bits are accessed with atomic read-modify-write operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Several threads may mark at once
    Atomic,
    /// A single thread owns all mark bits
    NonAtomic,
}

/// View of the mark bits of every page in a page table.
#[derive(Clone)]
pub struct MarkingState {
    page_table: Arc<PageTable>,
    mode: AccessMode,
}

impl MarkingState {
    /// Creates a view over `page_table`.
    pub fn new(page_table: Arc<PageTable>, mode: AccessMode) -> Self {
        MarkingState { page_table, mode }
    }

    /// Access mode of this view.
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Marks `object`, which lives on `page`.
    ///
    /// Returns true only for the caller that performed the transition.
    #[inline]
    pub fn try_mark_on(&self, page: &Page, object: &HeapObject) -> bool {
        let offset = page.offset_of(object.address());
        let bitmap = page.marking_bitmap();
        let marked = match self.mode {
            AccessMode::Atomic => bitmap.set(offset),
            AccessMode::NonAtomic => bitmap.set_non_atomic(offset),
        };
        if marked {
            page.add_live_bytes(object.size());
        }
        marked
    }

    /// Marks `object`. Returns false for objects outside the page table.
    pub fn try_mark(&self, object: &HeapObject) -> bool {
        match self.page_table.page_for(object.address()) {
            Some(page) => self.try_mark_on(&page, object),
            None => false,
        }
    }

    /// Returns true if the object starting at `address` is marked.
    #[inline]
    pub fn is_marked(&self, address: Address) -> bool {
        self.page_table
            .page_for(address)
            .is_some_and(|page| page.is_marked(address))
    }

    /// Returns true if the object starting at `address` is not marked.
    #[inline]
    pub fn is_unmarked(&self, address: Address) -> bool {
        !self.is_marked(address)
    }
}
