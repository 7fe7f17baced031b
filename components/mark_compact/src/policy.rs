//! Which objects a collector of a given heap is responsible for.
//!
//! Read-only objects are never marked. Objects in the shared region are
//! marked only by the shared-region owner; collectors of client heaps treat
//! them as always live. Pages of other heaps attached to the same region are
//! never touched.

use crate::page::{HeapId, Page};

/// Role of a heap with respect to the shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapRole {
    /// No shared region attached
    Standalone,
    /// Owns the shared region and collects it together with its own heap
    SharedOwner,
    /// Allocates into the shared region but never collects it
    Client,
}

impl HeapRole {
    /// Returns true when the heap participates in a shared region.
    pub fn uses_shared_region(self) -> bool {
        !matches!(self, HeapRole::Standalone)
    }
}

/// Marking responsibility of one heap's collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkingPolicy {
    role: HeapRole,
    heap: HeapId,
}

impl MarkingPolicy {
    /// Creates the policy of heap `heap` acting as `role`.
    pub fn new(role: HeapRole, heap: HeapId) -> Self {
        MarkingPolicy { role, heap }
    }

    /// Role of the collecting heap.
    pub fn role(&self) -> HeapRole {
        self.role
    }

    /// Returns true if objects on `page` are marked by this collector.
    #[inline]
    pub fn should_mark(&self, page: &Page) -> bool {
        if page.is_read_only() {
            return false;
        }
        if page.in_shared_region() {
            return self.role == HeapRole::SharedOwner;
        }
        page.heap_id() == self.heap
    }

    /// Returns true if objects on `page` survive this collection without
    /// being marked.
    #[inline]
    pub fn is_always_live(&self, page: &Page) -> bool {
        !self.should_mark(page)
    }
}
