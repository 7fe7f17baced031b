//! Weak-reference worklists filled during marking and drained once during
//! clearing.

use crate::object::SlotIndex;
use core_types::Address;
use crossbeam::queue::SegQueue;

/// A conditional liveness edge: `value` is live iff `key` is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ephemeron {
    /// Key object
    pub key: Address,
    /// Value object
    pub value: Address,
}

/// A maybe-weak slot holding a weak reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapObjectAndSlot {
    /// Object containing the slot
    pub host: Address,
    /// The slot
    pub slot: SlotIndex,
}

/// An object embedded weakly in optimized code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapObjectAndCode {
    /// Embedded object
    pub object: Address,
    /// Code embedding it
    pub code: Address,
}

/// Worklists of weak references, one per category.
#[derive(Default)]
pub struct WeakObjects {
    /// Transition arrays with weak targets
    pub transition_arrays: SegQueue<Address>,
    /// Ephemeron tables whose dead entries must be removed
    pub ephemeron_hash_tables: SegQueue<Address>,
    /// Ephemerons processed in the current fixpoint iteration
    pub current_ephemerons: SegQueue<Ephemeron>,
    /// Ephemerons deferred to the next iteration
    pub next_ephemerons: SegQueue<Ephemeron>,
    /// Ephemerons found while draining the marking worklist
    pub discovered_ephemerons: SegQueue<Ephemeron>,
    /// Maybe-weak slots holding weak references
    pub weak_references: SegQueue<HeapObjectAndSlot>,
    /// Objects referenced weakly from optimized code
    pub weak_objects_in_code: SegQueue<HeapObjectAndCode>,
    /// Script-visible weak references
    pub js_weak_refs: SegQueue<Address>,
    /// Weak cells of finalization registries
    pub weak_cells: SegQueue<Address>,
    /// Shared function infos whose bytecode may be flushed
    pub code_flushing_candidates: SegQueue<Address>,
    /// Functions that may need resetting after bytecode flushing
    pub flushed_js_functions: SegQueue<Address>,
}

impl WeakObjects {
    /// Creates empty worklists.
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the deferred ephemerons into the current set.
    pub fn merge_next_into_current(&self) {
        while let Some(ephemeron) = self.next_ephemerons.pop() {
            self.current_ephemerons.push(ephemeron);
        }
    }

    /// Returns true if every worklist is empty.
    pub fn is_empty(&self) -> bool {
        self.transition_arrays.is_empty()
            && self.ephemeron_hash_tables.is_empty()
            && self.current_ephemerons.is_empty()
            && self.next_ephemerons.is_empty()
            && self.discovered_ephemerons.is_empty()
            && self.weak_references.is_empty()
            && self.weak_objects_in_code.is_empty()
            && self.js_weak_refs.is_empty()
            && self.weak_cells.is_empty()
            && self.code_flushing_candidates.is_empty()
            && self.flushed_js_functions.is_empty()
    }

    /// Empties every worklist.
    pub fn clear(&self) {
        drain(&self.transition_arrays);
        drain(&self.ephemeron_hash_tables);
        drain(&self.current_ephemerons);
        drain(&self.next_ephemerons);
        drain(&self.discovered_ephemerons);
        drain(&self.weak_references);
        drain(&self.weak_objects_in_code);
        drain(&self.js_weak_refs);
        drain(&self.weak_cells);
        drain(&self.code_flushing_candidates);
        drain(&self.flushed_js_functions);
    }
}

/// Pops every entry of `queue`.
pub fn drain<T>(queue: &SegQueue<T>) -> Vec<T> {
    let mut items = Vec::with_capacity(queue.len());
    while let Some(item) = queue.pop() {
        items.push(item);
    }
    items
}
