//! Body iteration.
//!
//! [`iterate_body`] enumerates the reference slots of an object by its
//! [`ObjectKind`] and reports each to an [`ObjectVisitor`] through the
//! method matching the slot's reference strength. Visitors that treat all
//! references alike only implement [`ObjectVisitor::visit_pointer`] and
//! [`ObjectVisitor::visit_reloc`].

use crate::object::{layout, HeapObject, ObjectKind, RelocInfo, SlotIndex};

/// Receives the reference slots of an object.
pub trait ObjectVisitor {
    /// The header word.
    fn visit_map_pointer(&mut self, host: &HeapObject) {
        self.visit_pointer(host, SlotIndex::Map);
    }

    /// A slot that only ever holds strong references or non-references.
    fn visit_pointer(&mut self, host: &HeapObject, slot: SlotIndex);

    /// A slot that may hold a strong or a weak reference.
    fn visit_weak_pointer(&mut self, host: &HeapObject, slot: SlotIndex) {
        self.visit_pointer(host, slot);
    }

    /// A slot that is weak by the semantics of its host, whatever its tag.
    fn visit_custom_weak_pointer(&mut self, host: &HeapObject, slot: SlotIndex) {
        self.visit_pointer(host, slot);
    }

    /// Entry `entry` of an ephemeron table.
    fn visit_ephemeron(&mut self, host: &HeapObject, entry: usize) {
        self.visit_pointer(host, SlotIndex::Field(layout::entry_key(entry)));
        self.visit_pointer(host, SlotIndex::Field(layout::entry_value(entry)));
    }

    /// A relocation entry of a code object.
    fn visit_reloc(&mut self, host: &HeapObject, reloc: &RelocInfo);
}

fn visit_strong_range(
    host: &HeapObject,
    range: std::ops::Range<usize>,
    visitor: &mut impl ObjectVisitor,
) {
    for index in range {
        visitor.visit_pointer(host, SlotIndex::Field(index));
    }
}

fn visit_weak_range(
    host: &HeapObject,
    range: std::ops::Range<usize>,
    visitor: &mut impl ObjectVisitor,
) {
    for index in range {
        visitor.visit_weak_pointer(host, SlotIndex::Field(index));
    }
}

/// Visits every reference slot of `object`, header first.
pub fn iterate_body(object: &HeapObject, visitor: &mut impl ObjectVisitor) {
    visitor.visit_map_pointer(object);
    let used = object.used_fields().min(object.field_count());
    match object.kind() {
        ObjectKind::ByteArray
        | ObjectKind::BytecodeArray
        | ObjectKind::SeqString
        | ObjectKind::Filler => {}
        ObjectKind::Plain | ObjectKind::FixedArray | ObjectKind::WeakArray => {
            visit_weak_range(object, 0..used, visitor);
        }
        ObjectKind::EphemeronTable => {
            for entry in 0..object.entry_count() {
                visitor.visit_ephemeron(object, entry);
            }
        }
        ObjectKind::JsWeakRef => {
            visitor.visit_custom_weak_pointer(
                object,
                SlotIndex::Field(layout::js_weak_ref::TARGET),
            );
            visit_strong_range(object, layout::js_weak_ref::FIELD_COUNT..used, visitor);
        }
        ObjectKind::WeakCell => {
            for index in 0..used {
                let slot = SlotIndex::Field(index);
                if index == layout::weak_cell::TARGET
                    || index == layout::weak_cell::UNREGISTER_TOKEN
                {
                    visitor.visit_custom_weak_pointer(object, slot);
                } else {
                    visitor.visit_pointer(object, slot);
                }
            }
        }
        ObjectKind::Map => {
            for index in 0..used {
                let slot = SlotIndex::Field(index);
                if index == layout::map::TRANSITIONS {
                    visitor.visit_weak_pointer(object, slot);
                } else {
                    visitor.visit_pointer(object, slot);
                }
            }
        }
        ObjectKind::TransitionArray => {
            for entry in 0..object.entry_count() {
                visitor.visit_pointer(object, SlotIndex::Field(layout::entry_key(entry)));
                visitor.visit_custom_weak_pointer(
                    object,
                    SlotIndex::Field(layout::entry_value(entry)),
                );
            }
        }
        ObjectKind::Code => {
            visit_strong_range(object, 0..used, visitor);
            for reloc in object.relocs() {
                visitor.visit_reloc(object, &reloc);
            }
        }
        ObjectKind::FinalizationRegistry
        | ObjectKind::DescriptorArray
        | ObjectKind::SharedFunctionInfo
        | ObjectKind::JsFunction
        | ObjectKind::ThinString => {
            visit_strong_range(object, 0..used, visitor);
        }
    }
}
