//! Spaces: named collections of pages with a common allocation policy.

use crate::error::{GcError, GcResult};
use crate::page::{HeapId, Page, PageFlags, PageTable, PAGE_AREA_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE};
use core_types::Address;
use parking_lot::RwLock;
use std::sync::Arc;

/// Space identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpaceKind {
    /// Immutable objects shared by every heap; never marked
    ReadOnly,
    /// Young generation
    New,
    /// Old generation
    Old,
    /// Executable code
    Code,
    /// Objects visible to every heap attached to a shared region
    Shared,
    /// Objects too large for a regular page, one page each
    LargeObject,
}

impl SpaceKind {
    /// Space name for logs.
    pub fn name(self) -> &'static str {
        match self {
            SpaceKind::ReadOnly => "read_only_space",
            SpaceKind::New => "new_space",
            SpaceKind::Old => "old_space",
            SpaceKind::Code => "code_space",
            SpaceKind::Shared => "shared_space",
            SpaceKind::LargeObject => "lo_space",
        }
    }

    /// Flags every page of the space carries.
    pub fn page_flags(self) -> PageFlags {
        match self {
            SpaceKind::ReadOnly => PageFlags::READ_ONLY | PageFlags::NEVER_EVACUATE,
            SpaceKind::New => PageFlags::NEW_SPACE,
            SpaceKind::Old => PageFlags::empty(),
            SpaceKind::Code => PageFlags::IS_EXECUTABLE,
            SpaceKind::Shared => PageFlags::IN_SHARED_HEAP,
            SpaceKind::LargeObject => PageFlags::LARGE_PAGE | PageFlags::NEVER_EVACUATE,
        }
    }

    /// Returns true for spaces whose pages may become evacuation candidates.
    pub fn is_compactable(self) -> bool {
        matches!(self, SpaceKind::Old | SpaceKind::Code | SpaceKind::Shared)
    }
}

/// A space of one heap.
pub struct Space {
    kind: SpaceKind,
    heap: HeapId,
    page_table: Arc<PageTable>,
    max_pages: usize,
    pages: RwLock<Vec<Arc<Page>>>,
}

impl Space {
    /// Creates an empty space.
    pub fn new(kind: SpaceKind, heap: HeapId, page_table: Arc<PageTable>, max_pages: usize) -> Self {
        Space {
            kind,
            heap,
            page_table,
            max_pages,
            pages: RwLock::new(Vec::new()),
        }
    }

    /// Space identity.
    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Owning heap.
    pub fn heap_id(&self) -> HeapId {
        self.heap
    }

    /// Usable bytes of a regular page of this space.
    pub fn area_size(&self) -> usize {
        PAGE_AREA_SIZE
    }

    /// Maps a fresh page and adds it to the space.
    pub fn expand(&self) -> GcResult<Arc<Page>> {
        let page = self.new_page()?;
        self.pages.write().push(Arc::clone(&page));
        Ok(page)
    }

    /// Maps a fresh page owned by this space without adding it to the page
    /// list. Used by compaction spaces, which merge their pages later.
    pub(crate) fn new_page(&self) -> GcResult<Arc<Page>> {
        if self.page_count() >= self.max_pages {
            return Err(GcError::OutOfMemory {
                space: self.kind,
                size: PAGE_SIZE,
            });
        }
        Ok(self
            .page_table
            .allocate_page(self.heap, self.kind, self.kind.page_flags(), PAGE_SIZE))
    }

    /// Returns true if another page may be mapped.
    pub fn can_expand(&self, extra_pages: usize) -> bool {
        self.page_count() + extra_pages < self.max_pages
    }

    /// Allocates `size` bytes on a regular page.
    pub fn allocate_raw(&self, size: usize) -> GcResult<Address> {
        if size > PAGE_AREA_SIZE {
            return Err(GcError::ObjectTooLarge {
                size,
                max: PAGE_AREA_SIZE,
            });
        }
        {
            let pages = self.pages.read();
            for page in pages.iter().rev().filter(|p| p.can_allocate()) {
                if let Some(address) = page.try_allocate(size) {
                    return Ok(address);
                }
            }
        }
        let page = self.expand()?;
        page.try_allocate(size).ok_or(GcError::OutOfMemory {
            space: self.kind,
            size,
        })
    }

    /// Maps a dedicated page for one object of `size` bytes.
    pub fn allocate_large(&self, size: usize, extra_flags: PageFlags) -> GcResult<(Arc<Page>, Address)> {
        if self.page_count() >= self.max_pages {
            return Err(GcError::OutOfMemory {
                space: self.kind,
                size,
            });
        }
        let page = self.page_table.allocate_page(
            self.heap,
            self.kind,
            self.kind.page_flags() | extra_flags,
            size + PAGE_HEADER_SIZE,
        );
        let address = page.try_allocate(size).ok_or(GcError::OutOfMemory {
            space: self.kind,
            size,
        })?;
        self.pages.write().push(Arc::clone(&page));
        Ok((page, address))
    }

    /// Adds a page that was filled elsewhere.
    pub fn add_page(&self, page: Arc<Page>) {
        page.set_space(self.kind);
        self.pages.write().push(page);
    }

    /// Removes `page` from the space without unmapping it.
    pub fn remove_page(&self, page: &Page) -> Option<Arc<Page>> {
        let mut pages = self.pages.write();
        let index = pages.iter().position(|p| p.id() == page.id())?;
        Some(pages.remove(index))
    }

    /// Removes and unmaps `page`.
    pub fn release_page(&self, page: &Page) {
        if self.remove_page(page).is_some() {
            self.page_table.release(page);
        }
    }

    /// Snapshot of the pages.
    pub fn pages(&self) -> Vec<Arc<Page>> {
        self.pages.read().clone()
    }

    /// Number of pages.
    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }

    /// Bytes handed out to objects.
    pub fn size(&self) -> usize {
        self.pages.read().iter().map(|p| p.allocated_bytes()).sum()
    }

    /// Returns true if `page` belongs to this space.
    pub fn contains_page(&self, page: &Page) -> bool {
        self.pages.read().iter().any(|p| p.id() == page.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(kind: SpaceKind, max_pages: usize) -> Space {
        Space::new(kind, HeapId(0), PageTable::new(), max_pages)
    }

    #[test]
    fn test_allocate_expands_on_demand() {
        let old = space(SpaceKind::Old, 4);
        let a = old.allocate_raw(PAGE_AREA_SIZE).unwrap();
        let b = old.allocate_raw(64).unwrap();
        assert_eq!(old.page_count(), 2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_allocate_respects_page_limit() {
        let old = space(SpaceKind::Old, 1);
        old.allocate_raw(PAGE_AREA_SIZE).unwrap();
        assert!(matches!(
            old.allocate_raw(64),
            Err(GcError::OutOfMemory { space: SpaceKind::Old, .. })
        ));
    }

    #[test]
    fn test_object_too_large_for_regular_page() {
        let old = space(SpaceKind::Old, 4);
        assert!(matches!(
            old.allocate_raw(PAGE_AREA_SIZE + 8),
            Err(GcError::ObjectTooLarge { .. })
        ));
    }

    #[test]
    fn test_code_pages_are_executable() {
        let code = space(SpaceKind::Code, 4);
        let page = code.expand().unwrap();
        assert!(page.is_executable());
        assert!(!page.in_young_generation());
    }

    #[test]
    fn test_large_object_gets_own_page() {
        let lo = space(SpaceKind::LargeObject, 4);
        let (page, address) = lo.allocate_large(PAGE_SIZE * 2, PageFlags::empty()).unwrap();
        assert!(page.is_large());
        assert_eq!(address, page.area_start());
        lo.release_page(&page);
        assert_eq!(lo.page_count(), 0);
    }
}
