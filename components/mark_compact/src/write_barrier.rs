//! Slot recording and the mutator write barrier.
//!
//! [`record_slot`] and [`record_reloc_slot`] are the entry points for
//! anything that writes a reference outside the collector's own passes:
//! they remember the slot if its target sits on an evacuation candidate so
//! the pointer-update pass can fix it. [`write_barrier`] combines them with
//! the generational and shared-region barriers and, while marking runs,
//! with the marking barrier.

use crate::heap::Heap;
use crate::object::{HeapObject, RelocInfo, SlotIndex};
use crate::page::{Page, PageTable};
use crate::remembered_set::{RememberedSetKind, SlotType};
use core_types::{Address, Tagged};

fn candidate_set_kind(target_page: &Page) -> RememberedSetKind {
    if target_page.is_executable() {
        RememberedSetKind::OldToCode
    } else {
        RememberedSetKind::OldToOld
    }
}

/// Records the slot at `slot_address` on `host_page` if it points to an
/// evacuation candidate.
#[inline]
pub fn record_slot(host_page: &Page, slot_address: Address, target_page: &Page) {
    if !target_page.is_evacuation_candidate()
        || host_page.should_skip_evacuation_slot_recording()
    {
        return;
    }
    host_page.record_slot(candidate_set_kind(target_page), slot_address);
}

/// Records the relocation entry `reloc` of `host` if its target sits on an
/// evacuation candidate.
pub fn record_reloc_slot(host_page: &Page, host: &HeapObject, reloc: &RelocInfo, target_page: &Page) {
    if !target_page.is_evacuation_candidate()
        || host_page.should_skip_evacuation_slot_recording()
    {
        return;
    }
    if let Some(slot_type) = SlotType::from_reloc_mode(reloc.mode) {
        host_page.record_typed_slot(
            candidate_set_kind(target_page),
            slot_type,
            host.address() + reloc.offset,
        );
    }
}

/// Resolves the pages of `host` and `target` and calls [`record_slot`].
pub fn record_object_slot(page_table: &PageTable, host: &HeapObject, slot: SlotIndex, target: Address) {
    let (Some(host_page), Some(target_page)) =
        (page_table.page_for(host.address()), page_table.page_for(target))
    else {
        return;
    };
    record_slot(&host_page, host.slot_address(slot), &target_page);
}

/// Slot kinds a store of a reference to `target_page` into `host_page`
/// must be remembered under, apart from evacuation slots.
fn remembered_kinds(host_page: &Page, target_page: &Page) -> impl Iterator<Item = RememberedSetKind> {
    let old_to_new = target_page.in_young_generation() && !host_page.in_young_generation();
    let old_to_shared = target_page.in_shared_region() && !host_page.in_shared_region();
    [
        old_to_new.then_some(RememberedSetKind::OldToNew),
        old_to_shared.then_some(RememberedSetKind::OldToShared),
    ]
    .into_iter()
    .flatten()
}

/// Records a slot of an object that was just migrated or re-scanned in
/// every set its target requires.
pub(crate) fn record_migrated_slot(host_page: &Page, slot_address: Address, target_page: &Page) {
    for kind in remembered_kinds(host_page, target_page) {
        host_page.record_slot(kind, slot_address);
    }
    record_slot(host_page, slot_address, target_page);
}

/// Typed counterpart of [`record_migrated_slot`].
pub(crate) fn record_migrated_reloc_slot(host_page: &Page, host: &HeapObject, reloc: &RelocInfo, target_page: &Page) {
    if let Some(slot_type) = SlotType::from_reloc_mode(reloc.mode) {
        for kind in remembered_kinds(host_page, target_page) {
            host_page.record_typed_slot(kind, slot_type, host.address() + reloc.offset);
        }
    }
    record_reloc_slot(host_page, host, reloc, target_page);
}

fn marking_barrier(heap: &Heap, target_page: &Page, target: Address) {
    if !heap.marking_policy().should_mark(target_page) {
        return;
    }
    if let Some(object) = target_page.object(target) {
        if heap.marking_state().try_mark_on(target_page, &object) {
            heap.marking_barrier().record(target);
        }
    }
}

/// Barrier for a store of `value` into `slot` of `host`.
///
/// Call after the store.
pub fn write_barrier(heap: &Heap, host: &HeapObject, slot: SlotIndex, value: Tagged) {
    let Some(target) = value.heap_object() else {
        return;
    };
    let page_table = heap.page_table();
    let (Some(host_page), Some(target_page)) =
        (page_table.page_for(host.address()), page_table.page_for(target))
    else {
        return;
    };
    let slot_address = host.slot_address(slot);
    for kind in remembered_kinds(&host_page, &target_page) {
        host_page.record_slot(kind, slot_address);
    }
    if heap.marking_barrier().is_activated() {
        marking_barrier(heap, &target_page, target);
        record_slot(&host_page, slot_address, &target_page);
    }
}

/// Barrier for a relocation entry written into `host`.
pub fn reloc_write_barrier(heap: &Heap, host: &HeapObject, reloc: &RelocInfo) {
    let Some(target) = reloc.target().filter(|_| reloc.mode.is_heap_reference()) else {
        return;
    };
    let page_table = heap.page_table();
    let (Some(host_page), Some(target_page)) =
        (page_table.page_for(host.address()), page_table.page_for(target))
    else {
        return;
    };
    if let Some(slot_type) = SlotType::from_reloc_mode(reloc.mode) {
        for kind in remembered_kinds(&host_page, &target_page) {
            host_page.record_typed_slot(kind, slot_type, host.address() + reloc.offset);
        }
    }
    if heap.marking_barrier().is_activated() {
        marking_barrier(heap, &target_page, target);
        record_reloc_slot(&host_page, host, reloc, &target_page);
    }
}
