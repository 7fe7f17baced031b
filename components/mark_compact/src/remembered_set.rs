//! Remembered sets.
//!
//! Every page keeps, per [`RememberedSetKind`], the offsets of its slots
//! that hold interesting pointers. Untyped slots are ordinary tagged fields;
//! typed slots are relocation entries inside code whose encoding depends on
//! a [`SlotType`].
//!
//! Sets are created lazily and can be taken out of a page wholesale, which
//! lets pointer updating walk a page's slots without holding the page lock.

use crate::object::RelocMode;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

/// Kinds of recorded slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RememberedSetKind {
    /// Old object pointing into the young generation
    OldToNew,
    /// Pointer into an evacuation candidate page
    OldToOld,
    /// Pointer into an executable evacuation candidate page
    OldToCode,
    /// Pointer from a non-shared object into the shared region
    OldToShared,
}

impl RememberedSetKind {
    /// All kinds.
    pub const ALL: [RememberedSetKind; 4] = [
        RememberedSetKind::OldToNew,
        RememberedSetKind::OldToOld,
        RememberedSetKind::OldToCode,
        RememberedSetKind::OldToShared,
    ];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

/// Encoding of a typed slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotType {
    /// Call target in the instruction stream
    CodeEntry,
    /// Full-width embedded object pointer
    EmbeddedObjectFull,
    /// Compressed embedded object pointer
    EmbeddedObjectCompressed,
    /// Constant-pool full object pointer
    ConstPoolEmbeddedObjectFull,
    /// Constant-pool compressed object pointer
    ConstPoolEmbeddedObjectCompressed,
    /// Constant-pool call target
    ConstPoolCodeEntry,
}

impl SlotType {
    /// Slot type recorded for a relocation entry, if the entry references
    /// another heap object.
    pub fn from_reloc_mode(mode: RelocMode) -> Option<SlotType> {
        match mode {
            RelocMode::CodeTarget => Some(SlotType::CodeEntry),
            RelocMode::FullEmbeddedObject => Some(SlotType::EmbeddedObjectFull),
            RelocMode::CompressedEmbeddedObject => Some(SlotType::EmbeddedObjectCompressed),
            RelocMode::ConstPoolFullEmbeddedObject => Some(SlotType::ConstPoolEmbeddedObjectFull),
            RelocMode::ConstPoolCompressedEmbeddedObject => {
                Some(SlotType::ConstPoolEmbeddedObjectCompressed)
            }
            RelocMode::ConstPoolCodeTarget => Some(SlotType::ConstPoolCodeEntry),
            RelocMode::InternalReference => None,
        }
    }
}

/// Result of a slot callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotCallbackResult {
    /// Keep the slot in the set
    Keep,
    /// Drop the slot from the set
    Remove,
}

/// Set of untyped slot offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotSet {
    offsets: BTreeSet<u32>,
}

impl SlotSet {
    /// Records `offset`.
    pub fn insert(&mut self, offset: u32) -> bool {
        self.offsets.insert(offset)
    }

    /// Returns true if `offset` is recorded.
    pub fn contains(&self, offset: u32) -> bool {
        self.offsets.contains(&offset)
    }

    /// Drops every offset in `[start, end)`.
    pub fn remove_range(&mut self, start: u32, end: u32) {
        if start >= end {
            return;
        }
        let tail = self.offsets.split_off(&start);
        self.offsets.extend(tail.range(end..).copied());
    }

    /// Number of recorded offsets.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Returns true if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Recorded offsets in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.offsets.iter().copied()
    }
}

/// Set of typed slots keyed by offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypedSlotSet {
    slots: BTreeMap<u32, SlotType>,
}

impl TypedSlotSet {
    /// Records a typed slot.
    pub fn insert(&mut self, slot_type: SlotType, offset: u32) {
        self.slots.insert(offset, slot_type);
    }

    /// Returns the type recorded at `offset`.
    pub fn get(&self, offset: u32) -> Option<SlotType> {
        self.slots.get(&offset).copied()
    }

    /// Drops every slot in `[start, end)`.
    pub fn remove_range(&mut self, start: u32, end: u32) {
        if start >= end {
            return;
        }
        let tail = self.slots.split_off(&start);
        self.slots
            .extend(tail.range(end..).map(|(&offset, &ty)| (offset, ty)));
    }

    /// Number of recorded slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Recorded slots in ascending offset order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotType, u32)> + '_ {
        self.slots.iter().map(|(&offset, &ty)| (ty, offset))
    }
}

/// All remembered sets of one page.
#[derive(Default)]
pub struct RememberedSet {
    untyped: [Mutex<Option<SlotSet>>; 4],
    typed: [Mutex<Option<TypedSlotSet>>; 4],
}

impl RememberedSet {
    /// Creates empty sets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an untyped slot.
    pub fn insert(&self, kind: RememberedSetKind, offset: u32) {
        self.untyped[kind.index()]
            .lock()
            .get_or_insert_with(SlotSet::default)
            .insert(offset);
    }

    /// Records a typed slot.
    pub fn insert_typed(&self, kind: RememberedSetKind, slot_type: SlotType, offset: u32) {
        self.typed[kind.index()]
            .lock()
            .get_or_insert_with(TypedSlotSet::default)
            .insert(slot_type, offset);
    }

    /// Returns true if the untyped slot is recorded.
    pub fn contains(&self, kind: RememberedSetKind, offset: u32) -> bool {
        self.untyped[kind.index()]
            .lock()
            .as_ref()
            .is_some_and(|set| set.contains(offset))
    }

    /// Returns true if the typed slot is recorded.
    pub fn contains_typed(&self, kind: RememberedSetKind, offset: u32) -> bool {
        self.typed[kind.index()]
            .lock()
            .as_ref()
            .is_some_and(|set| set.get(offset).is_some())
    }

    /// Returns true if neither an untyped nor a typed set of `kind` exists.
    pub fn is_empty(&self, kind: RememberedSetKind) -> bool {
        self.untyped[kind.index()].lock().as_ref().map_or(true, SlotSet::is_empty)
            && self.typed[kind.index()]
                .lock()
                .as_ref()
                .map_or(true, TypedSlotSet::is_empty)
    }

    /// Drops untyped and typed slots of `kind` in `[start, end)`.
    pub fn remove_range(&self, kind: RememberedSetKind, start: u32, end: u32) {
        if let Some(set) = self.untyped[kind.index()].lock().as_mut() {
            set.remove_range(start, end);
        }
        if let Some(set) = self.typed[kind.index()].lock().as_mut() {
            set.remove_range(start, end);
        }
    }

    /// Drops slots of every kind in `[start, end)`.
    pub fn remove_range_all(&self, start: u32, end: u32) {
        for kind in RememberedSetKind::ALL {
            self.remove_range(kind, start, end);
        }
    }

    /// Frees both sets of `kind`.
    pub fn release(&self, kind: RememberedSetKind) {
        *self.untyped[kind.index()].lock() = None;
        *self.typed[kind.index()].lock() = None;
    }

    /// Copy of the untyped set of `kind`.
    pub fn snapshot(&self, kind: RememberedSetKind) -> SlotSet {
        self.untyped[kind.index()].lock().clone().unwrap_or_default()
    }

    /// Copy of the typed set of `kind`.
    pub fn snapshot_typed(&self, kind: RememberedSetKind) -> TypedSlotSet {
        self.typed[kind.index()].lock().clone().unwrap_or_default()
    }

    /// Calls `f` for every untyped slot of `kind`, dropping the slots for
    /// which it returns [`SlotCallbackResult::Remove`].
    ///
    /// The set is detached while `f` runs, so `f` may record slots of any
    /// kind on the same page. Returns the number of slots kept.
    pub fn iterate(
        &self,
        kind: RememberedSetKind,
        mut f: impl FnMut(u32) -> SlotCallbackResult,
    ) -> usize {
        let Some(set) = self.untyped[kind.index()].lock().take() else {
            return 0;
        };
        let kept: BTreeSet<u32> = set
            .offsets
            .into_iter()
            .filter(|&offset| f(offset) == SlotCallbackResult::Keep)
            .collect();
        let count = kept.len();
        if count > 0 {
            let mut guard = self.untyped[kind.index()].lock();
            guard
                .get_or_insert_with(SlotSet::default)
                .offsets
                .extend(kept);
        }
        count
    }

    /// Typed counterpart of [`RememberedSet::iterate`].
    pub fn iterate_typed(
        &self,
        kind: RememberedSetKind,
        mut f: impl FnMut(SlotType, u32) -> SlotCallbackResult,
    ) -> usize {
        let Some(set) = self.typed[kind.index()].lock().take() else {
            return 0;
        };
        let kept: BTreeMap<u32, SlotType> = set
            .slots
            .into_iter()
            .filter(|&(offset, ty)| f(ty, offset) == SlotCallbackResult::Keep)
            .collect();
        let count = kept.len();
        if count > 0 {
            let mut guard = self.typed[kind.index()].lock();
            guard
                .get_or_insert_with(TypedSlotSet::default)
                .slots
                .extend(kept);
        }
        count
    }
}
