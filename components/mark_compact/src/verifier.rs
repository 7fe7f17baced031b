//! Heap verification after marking.
//!
//! Only runs with `verify_heap` in debug builds. Every failure is a broken
//! collector invariant, so the public entry points assert; the collecting
//! functions exist so tests can look at the failures themselves.

use crate::heap::Heap;
use crate::object::{layout, HeapObject, ObjectKind, RelocInfo, SlotIndex};
use crate::policy::MarkingPolicy;
use crate::roots::{Root, RootSlot, RootVisitor, SkipRoot};
use crate::visitor::{iterate_body, ObjectVisitor};
use crate::weak_objects::{drain, WeakObjects};
use core_types::Address;
use std::fmt;

/// A reference the marker should have followed but did not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum VerificationFailure {
    /// A strong root points at an unmarked object.
    UnmarkedRoot { root: Root, target: Address },
    /// A marked object references an unmarked object strongly.
    UnmarkedField {
        host: Address,
        slot: SlotIndex,
        target: Address,
    },
    /// A reference that resolves to no page at all.
    Dangling { host: Option<Address>, target: Address },
    /// An ephemeron whose key is live but whose value is not marked.
    UnmarkedEphemeronValue { key: Address, value: Address },
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationFailure::UnmarkedRoot { root, target } => {
                write!(f, "root {:?} points at unmarked {}", root, target)
            }
            VerificationFailure::UnmarkedField { host, slot, target } => {
                write!(f, "{} slot {:?} points at unmarked {}", host, slot, target)
            }
            VerificationFailure::Dangling { host, target } => {
                write!(f, "reference from {:?} to unmapped {}", host, target)
            }
            VerificationFailure::UnmarkedEphemeronValue { key, value } => {
                write!(f, "ephemeron value {} unmarked although key {} is live", value, key)
            }
        }
    }
}

struct MarkingVerifier<'a> {
    heap: &'a Heap,
    policy: MarkingPolicy,
    failures: Vec<VerificationFailure>,
}

impl<'a> MarkingVerifier<'a> {
    fn new(heap: &'a Heap) -> Self {
        MarkingVerifier {
            heap,
            policy: *heap.marking_policy(),
            failures: Vec::new(),
        }
    }

    /// `None` for a reference that does not resolve to a page.
    fn is_live(&mut self, host: Option<Address>, target: Address) -> Option<bool> {
        let Some(page) = self.heap.page_of(target) else {
            self.failures.push(VerificationFailure::Dangling { host, target });
            return None;
        };
        Some(!self.policy.should_mark(&page) || page.is_marked(target))
    }

    fn check_ephemeron(&mut self, key: Address, value: Address) {
        if self.is_live(None, key) == Some(true) && self.is_live(None, value) == Some(false) {
            self.failures
                .push(VerificationFailure::UnmarkedEphemeronValue { key, value });
        }
    }

    /// Only plain containers are checked; other kinds hold references
    /// the marker is allowed to skip, such as old bytecode.
    fn verify_object(&mut self, object: &HeapObject) {
        if matches!(
            object.kind(),
            ObjectKind::Plain | ObjectKind::FixedArray | ObjectKind::WeakArray
        ) {
            iterate_body(object, self);
        }
    }
}

impl RootVisitor for MarkingVerifier<'_> {
    fn visit_root(&mut self, root: Root, slot: &RootSlot) {
        let Some(target) = slot.get().strong_ref() else {
            return;
        };
        if self.is_live(None, target) == Some(false) {
            self.failures.push(VerificationFailure::UnmarkedRoot { root, target });
        }
    }
}

impl ObjectVisitor for MarkingVerifier<'_> {
    fn visit_pointer(&mut self, host: &HeapObject, slot: SlotIndex) {
        let Some(target) = host.load(slot).strong_ref() else {
            return;
        };
        if self.is_live(Some(host.address()), target) == Some(false) {
            self.failures.push(VerificationFailure::UnmarkedField {
                host: host.address(),
                slot,
                target,
            });
        }
    }

    fn visit_reloc(&mut self, _host: &HeapObject, _reloc: &RelocInfo) {}
}

/// Strong roots and strong fields of marked plain objects that point at
/// unmarked objects.
pub(crate) fn marking_failures(heap: &Heap) -> Vec<VerificationFailure> {
    let mut verifier = MarkingVerifier::new(heap);
    heap.roots().iterate(SkipRoot::WEAK, &mut verifier);
    for space in heap.collected_spaces() {
        for page in space.pages() {
            if !verifier.policy.should_mark(&page) {
                continue;
            }
            for object in page.marked_objects() {
                verifier.verify_object(&object);
            }
        }
    }
    verifier.failures
}

/// Ephemerons with a live key and an unmarked value, both in marked
/// ephemeron tables and in the deferred ephemeron worklist.
pub(crate) fn ephemeron_failures(heap: &Heap, weak: &WeakObjects) -> Vec<VerificationFailure> {
    let mut verifier = MarkingVerifier::new(heap);
    for space in heap.collected_spaces() {
        for page in space.pages() {
            for table in page
                .marked_objects()
                .into_iter()
                .filter(|o| o.kind() == ObjectKind::EphemeronTable)
            {
                for entry in 0..table.entry_count() {
                    let key = table.field(layout::entry_key(entry)).heap_object();
                    let value = table.field(layout::entry_value(entry)).heap_object();
                    if let (Some(key), Some(value)) = (key, value) {
                        verifier.check_ephemeron(key, value);
                    }
                }
            }
        }
    }
    for ephemeron in drain(&weak.next_ephemerons) {
        weak.next_ephemerons.push(ephemeron);
        verifier.check_ephemeron(ephemeron.key, ephemeron.value);
    }
    verifier.failures
}

fn report(what: &str, failures: &[VerificationFailure]) {
    for failure in failures {
        log::error!("{} verification: {}", what, failure);
    }
    assert!(failures.is_empty(), "{} verification failed with {} errors", what, failures.len());
}

/// Asserts that marking reached everything strongly reachable.
pub(crate) fn verify_marking(heap: &Heap) {
    report("marking", &marking_failures(heap));
}

/// Asserts that no processable ephemeron survived the closure.
pub(crate) fn verify_ephemerons(heap: &Heap, weak: &WeakObjects) {
    report("ephemeron", &ephemeron_failures(heap, weak));
}
