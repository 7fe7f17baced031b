//! Marking: the object visitor, root marking and the parallel marking job.
//!
//! [`MarkingVisitor`] owns one thread's local worklists. Popping an object
//! visits its body: strong references are marked and pushed, weak
//! references are deferred to the [`WeakObjects`] worklists for the
//! clearing phase, and every slot pointing into an evacuation candidate is
//! recorded so pointer updating can find it.

use crate::config::CycleConfig;
use crate::heap::Heap;
use crate::jobs::{JobDelegate, JobTask};
use crate::marking_worklists::{LocalMarkingWorklists, MarkingWorklists, NativeContextStats};
use crate::object::{layout, HeapObject, ObjectFlags, ObjectKind, RelocInfo, SlotIndex};
use crate::page::{Page, PageFlags};
use crate::policy::MarkingPolicy;
use crate::remembered_set::{RememberedSetKind, SlotCallbackResult, SlotType};
use crate::roots::{Root, RootSlot, RootVisitor, SkipRoot};
use crate::safepoint::GlobalSafepointScope;
use crate::visitor::{iterate_body, ObjectVisitor};
use crate::weak_objects::{Ephemeron, HeapObjectAndCode, HeapObjectAndSlot, WeakObjects};
use crate::write_barrier::{record_reloc_slot, record_slot};
use core_types::{Address, Tagged};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const SHARE_WORK_INTERVAL: usize = 64;

/// Objects popped from the worklist while the linear ephemeron algorithm
/// runs. Overflows once `limit` objects were recorded.
#[derive(Debug, Default)]
pub(crate) struct NewlyDiscovered {
    objects: Vec<Address>,
    limit: usize,
    overflowed: bool,
}

impl NewlyDiscovered {
    pub(crate) fn new(limit: usize) -> Self {
        NewlyDiscovered {
            objects: Vec::new(),
            limit,
            overflowed: false,
        }
    }

    fn add(&mut self, object: Address) {
        if self.overflowed {
            return;
        }
        if self.objects.len() < self.limit {
            self.objects.push(object);
        } else {
            self.overflowed = true;
        }
    }

    pub(crate) fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub(crate) fn objects(&self) -> &[Address] {
        &self.objects
    }
}

/// Marks objects reachable from the objects it visits.
pub(crate) struct MarkingVisitor<'a> {
    heap: &'a Heap,
    cycle: &'a CycleConfig,
    weak_objects: &'a WeakObjects,
    policy: MarkingPolicy,
    local: LocalMarkingWorklists,
    host_page: Option<Arc<Page>>,
    context_stats: NativeContextStats,
    newly_discovered: Option<NewlyDiscovered>,
    defer_young: bool,
}

impl<'a> MarkingVisitor<'a> {
    pub(crate) fn new(
        heap: &'a Heap,
        cycle: &'a CycleConfig,
        worklists: Arc<MarkingWorklists>,
        weak_objects: &'a WeakObjects,
    ) -> Self {
        MarkingVisitor {
            heap,
            cycle,
            weak_objects,
            policy: *heap.marking_policy(),
            local: LocalMarkingWorklists::new(worklists, cycle.track_native_contexts),
            host_page: None,
            context_stats: NativeContextStats::new(),
            newly_discovered: None,
            defer_young: false,
        }
    }

    /// Parks young objects on the on-hold queue instead of visiting them.
    pub(crate) fn set_defer_young(&mut self, defer: bool) {
        self.defer_young = defer;
    }

    pub(crate) fn heap(&self) -> &'a Heap {
        self.heap
    }

    pub(crate) fn cycle(&self) -> &'a CycleConfig {
        self.cycle
    }

    pub(crate) fn weak_objects(&self) -> &'a WeakObjects {
        self.weak_objects
    }

    pub(crate) fn local(&mut self) -> &mut LocalMarkingWorklists {
        &mut self.local
    }

    pub(crate) fn is_worklist_empty(&self) -> bool {
        self.local.is_empty()
    }

    pub(crate) fn publish(&mut self) {
        self.local.publish();
    }

    pub(crate) fn take_context_stats(&mut self) -> NativeContextStats {
        std::mem::take(&mut self.context_stats)
    }

    pub(crate) fn merge_context_stats(&mut self, other: &NativeContextStats) {
        self.context_stats.merge(other);
    }

    pub(crate) fn start_tracking_newly_discovered(&mut self, limit: usize) {
        self.newly_discovered = Some(NewlyDiscovered::new(limit));
    }

    pub(crate) fn stop_tracking_newly_discovered(&mut self) -> NewlyDiscovered {
        self.newly_discovered.take().unwrap_or_default()
    }

    fn page_of(&self, address: Address) -> Option<Arc<Page>> {
        self.heap.page_table().page_for(address)
    }

    /// Returns true if the object at `address` survives this cycle as far
    /// as is known now: marked, or outside this collector's responsibility.
    pub(crate) fn is_live(&self, address: Address) -> bool {
        match self.page_of(address) {
            Some(page) => !self.policy.should_mark(&page) || page.is_marked(address),
            None => true,
        }
    }

    /// Returns true if the object at `address` is markable and unmarked.
    pub(crate) fn is_unmarked(&self, address: Address) -> bool {
        !self.is_live(address)
    }

    /// Marks the object at `target` and pushes it for visitation. Returns
    /// true if this call marked it.
    pub(crate) fn mark_object(&mut self, target: Address) -> bool {
        let Some(page) = self.page_of(target) else {
            return false;
        };
        if !self.policy.should_mark(&page) {
            return false;
        }
        let Some(object) = page.object(target) else {
            return false;
        };
        if !self.heap.marking_state().try_mark_on(&page, &object) {
            return false;
        }
        if self.defer_young && page.in_young_generation() {
            self.local.push_on_hold(target);
        } else {
            self.local.push(target);
        }
        true
    }

    fn record(&self, host: &HeapObject, slot: SlotIndex, target_page: &Page) {
        if let Some(host_page) = &self.host_page {
            record_slot(host_page, host.slot_address(slot), target_page);
        }
    }

    /// Applies ephemeron semantics to one pair. Returns true if the value
    /// was newly marked.
    pub(crate) fn process_ephemeron(&mut self, ephemeron: Ephemeron) -> bool {
        let Some(value_page) = self.page_of(ephemeron.value) else {
            return false;
        };
        if !self.policy.should_mark(&value_page) {
            return false;
        }
        if self.is_live(ephemeron.key) {
            return self.mark_object(ephemeron.value);
        }
        if !value_page.is_marked(ephemeron.value) {
            self.weak_objects.next_ephemerons.push(ephemeron);
        }
        false
    }

    /// Pops and visits objects until the worklists are empty or
    /// `max_objects` were visited. Returns the visited bytes and objects.
    pub(crate) fn drain(&mut self, max_objects: usize) -> (usize, usize) {
        self.drain_inner(max_objects, false)
    }

    fn drain_inner(&mut self, max_objects: usize, share_work: bool) -> (usize, usize) {
        let mut bytes = 0;
        let mut objects = 0;
        while objects < max_objects {
            let next = match self.local.pop() {
                Some(address) => Some(address),
                None if !self.defer_young => self.local.pop_on_hold(),
                None => None,
            };
            let Some(address) = next else {
                break;
            };
            let Some(page) = self.page_of(address) else {
                continue;
            };
            let Some(object) = page.object(address) else {
                continue;
            };
            if let Some(newly) = &mut self.newly_discovered {
                newly.add(address);
            }
            if self.local.tracks_contexts() {
                if let Some(context) = self.infer_native_context(&object) {
                    self.local.switch_to_context(context);
                }
            }
            let size = self.visit_object(&object, page);
            if self.local.tracks_contexts() {
                self.context_stats.increment(self.local.context(), size);
            }
            bytes += size;
            objects += 1;
            if share_work && objects % SHARE_WORK_INTERVAL == 0 {
                self.local.share_work();
            }
        }
        (bytes, objects)
    }

    /// Drains cooperatively with other participants of a parallel job until
    /// all of them run out of work.
    pub(crate) fn drain_with_termination(&mut self, terminator: &Terminator) -> usize {
        let mut visited = 0;
        loop {
            visited += self.drain_inner(usize::MAX, true).1;
            if terminator.try_terminate(self.local.global()) {
                return visited;
            }
        }
    }

    fn infer_native_context(&self, object: &HeapObject) -> Option<u64> {
        let map = object.map().strong_ref()?;
        let map = self.page_of(map)?.object(map)?;
        (map.kind() == ObjectKind::Map && map.native_context() != 0).then(|| map.native_context())
    }

    /// Visits the body of a marked object. Returns its size.
    pub(crate) fn visit_object(&mut self, object: &Arc<HeapObject>, page: Arc<Page>) -> usize {
        self.host_page = Some(page);
        let address = object.address();
        match object.kind() {
            ObjectKind::Filler => return 0,
            ObjectKind::TransitionArray => {
                self.weak_objects.transition_arrays.push(address);
                iterate_body(object, self);
            }
            ObjectKind::EphemeronTable => {
                self.weak_objects.ephemeron_hash_tables.push(address);
                iterate_body(object, self);
            }
            ObjectKind::JsWeakRef => {
                iterate_body(object, self);
                let target = object.field(layout::js_weak_ref::TARGET);
                if target.heap_object().is_some_and(|t| self.is_unmarked(t)) {
                    self.weak_objects.js_weak_refs.push(address);
                }
            }
            ObjectKind::WeakCell => {
                iterate_body(object, self);
                let target = object.field(layout::weak_cell::TARGET);
                let token = object.field(layout::weak_cell::UNREGISTER_TOKEN);
                if [target, token]
                    .iter()
                    .any(|v| v.heap_object().is_some_and(|t| self.is_unmarked(t)))
                {
                    self.weak_objects.weak_cells.push(address);
                }
            }
            ObjectKind::SharedFunctionInfo => self.visit_shared_function_info(object),
            ObjectKind::JsFunction => {
                iterate_body(object, self);
                if self.cycle.flush_bytecode {
                    self.weak_objects.flushed_js_functions.push(address);
                }
            }
            _ => iterate_body(object, self),
        }
        object.size()
    }

    fn visit_shared_function_info(&mut self, object: &HeapObject) {
        use layout::shared_function_info::FUNCTION_DATA;

        let age = object.bytecode_age().saturating_add(1);
        object.set_bytecode_age(age);
        let has_bytecode = object
            .field(FUNCTION_DATA)
            .strong_ref()
            .and_then(|data| self.page_of(data)?.object(data))
            .is_some_and(|data| data.kind() == ObjectKind::BytecodeArray);
        if !(self.cycle.flush_bytecode && has_bytecode && age >= self.cycle.bytecode_old_age) {
            iterate_body(object, self);
            return;
        }
        self.visit_map_pointer(object);
        let used = object.used_fields().min(object.field_count());
        for index in (0..used).filter(|&i| i != FUNCTION_DATA) {
            self.visit_pointer(object, SlotIndex::Field(index));
        }
        self.weak_objects
            .code_flushing_candidates
            .push(object.address());
    }
}

impl ObjectVisitor for MarkingVisitor<'_> {
    fn visit_pointer(&mut self, host: &HeapObject, slot: SlotIndex) {
        let Some(target) = host.load(slot).heap_object() else {
            return;
        };
        let Some(target_page) = self.page_of(target) else {
            return;
        };
        self.record(host, slot, &target_page);
        self.mark_object(target);
    }

    fn visit_weak_pointer(&mut self, host: &HeapObject, slot: SlotIndex) {
        let value = host.load(slot);
        if value.is_strong() {
            self.visit_pointer(host, slot);
            return;
        }
        let Some(target) = value.weak_ref() else {
            return;
        };
        let Some(target_page) = self.page_of(target) else {
            return;
        };
        if self.policy.should_mark(&target_page) && !target_page.is_marked(target) {
            self.weak_objects.weak_references.push(HeapObjectAndSlot {
                host: host.address(),
                slot,
            });
        } else {
            self.record(host, slot, &target_page);
        }
    }

    fn visit_custom_weak_pointer(&mut self, host: &HeapObject, slot: SlotIndex) {
        let Some(target) = host.load(slot).heap_object() else {
            return;
        };
        let Some(target_page) = self.page_of(target) else {
            return;
        };
        if !self.policy.should_mark(&target_page) || target_page.is_marked(target) {
            self.record(host, slot, &target_page);
        }
    }

    fn visit_ephemeron(&mut self, host: &HeapObject, entry: usize) {
        let key_slot = SlotIndex::Field(layout::entry_key(entry));
        let value_slot = SlotIndex::Field(layout::entry_value(entry));
        let Some(key) = host.load(key_slot).heap_object() else {
            self.visit_pointer(host, value_slot);
            return;
        };
        if let Some(key_page) = self.page_of(key) {
            self.record(host, key_slot, &key_page);
        }
        if self.is_live(key) {
            self.visit_pointer(host, value_slot);
            return;
        }
        let Some(value) = host.load(value_slot).heap_object() else {
            return;
        };
        let Some(value_page) = self.page_of(value) else {
            return;
        };
        self.record(host, value_slot, &value_page);
        if self.policy.should_mark(&value_page) && !value_page.is_marked(value) {
            self.weak_objects
                .discovered_ephemerons
                .push(Ephemeron { key, value });
        }
    }

    fn visit_reloc(&mut self, host: &HeapObject, reloc: &RelocInfo) {
        let Some(target) = reloc.target().filter(|_| reloc.mode.is_heap_reference()) else {
            return;
        };
        let Some(target_page) = self.page_of(target) else {
            return;
        };
        if !self.policy.should_mark(&target_page) {
            return;
        }
        if !target_page.is_marked(target) {
            let weak_in_code = host.has_flags(ObjectFlags::OPTIMIZED | ObjectFlags::CAN_DEOPTIMIZE)
                && !reloc.mode.is_code_target()
                && target_page
                    .object(target)
                    .is_some_and(|o| o.kind().is_weak_in_optimized_code());
            if weak_in_code {
                self.weak_objects
                    .weak_objects_in_code
                    .push(HeapObjectAndCode {
                        object: target,
                        code: host.address(),
                    });
            } else {
                self.mark_object(target);
            }
        }
        if let Some(host_page) = &self.host_page {
            record_reloc_slot(host_page, host, reloc, &target_page);
        }
    }
}

/// Marks the strong targets of root slots.
pub(crate) struct RootMarkingVisitor<'v, 'a> {
    visitor: &'v mut MarkingVisitor<'a>,
}

impl<'v, 'a> RootMarkingVisitor<'v, 'a> {
    pub(crate) fn new(visitor: &'v mut MarkingVisitor<'a>) -> Self {
        RootMarkingVisitor { visitor }
    }
}

impl RootVisitor for RootMarkingVisitor<'_, '_> {
    fn visit_root(&mut self, _root: Root, slot: &RootSlot) {
        if let Some(target) = slot.get().strong_ref() {
            self.visitor.mark_object(target);
        }
    }
}

/// Marks every reference of an object, weak ones included. Used for code
/// that is still running and cannot be deoptimized.
struct CustomRootBodyMarkingVisitor<'v, 'a> {
    visitor: &'v mut MarkingVisitor<'a>,
}

impl ObjectVisitor for CustomRootBodyMarkingVisitor<'_, '_> {
    fn visit_pointer(&mut self, host: &HeapObject, slot: SlotIndex) {
        if let Some(target) = host.load(slot).heap_object() {
            self.visitor.mark_object(target);
        }
    }

    fn visit_reloc(&mut self, _host: &HeapObject, reloc: &RelocInfo) {
        if let Some(target) = reloc.target().filter(|_| reloc.mode.is_heap_reference()) {
            self.visitor.mark_object(target);
        }
    }
}

/// Marks the precise roots of `heap` and the body of its topmost
/// optimized frame.
pub(crate) fn mark_roots(visitor: &mut MarkingVisitor<'_>, heap: &Heap) {
    heap.roots()
        .iterate(SkipRoot::WEAK, &mut RootMarkingVisitor::new(visitor));
    let registries: Vec<Address> = heap
        .dirty_registry_slots()
        .iter()
        .filter_map(|r| r.strong_ref())
        .collect();
    for registry in registries {
        visitor.mark_object(registry);
    }
    process_top_optimized_frame(visitor, heap);
}

fn process_top_optimized_frame(visitor: &mut MarkingVisitor<'_>, heap: &Heap) {
    let Some(code) = heap.roots().top_optimized_code_without_deopt() else {
        return;
    };
    let Some(object) = heap.page_table().page_for(code).and_then(|p| p.object(code)) else {
        return;
    };
    let mut body_visitor = CustomRootBodyMarkingVisitor { visitor };
    iterate_body(&object, &mut body_visitor);
}

/// Marks objects referenced from the conservatively scanned stack of
/// `heap` and pins their pages.
pub(crate) fn mark_roots_from_conservative_stack(visitor: &mut MarkingVisitor<'_>, heap: &Heap) -> usize {
    let mut found = 0;
    for word in heap.roots().conservative_stack() {
        let address = Address::new(word);
        let Some(page) = heap.page_table().page_for(address) else {
            continue;
        };
        if !visitor.policy.should_mark(&page) {
            continue;
        }
        let Some(object) = page.object_containing(address) else {
            continue;
        };
        if object.is_forwarded() {
            continue;
        }
        page.set_flag(PageFlags::PINNED);
        visitor.mark_object(object.address());
        found += 1;
    }
    found
}

/// Shared objects referenced from client heaps, collected under the
/// global safepoint and handed to the owner's marker as a batch.
#[derive(Debug, Default)]
pub(crate) struct ClientSlotBatch {
    targets: Vec<Address>,
}

impl ClientSlotBatch {
    /// Collects the shared targets of every client's OLD_TO_SHARED slots,
    /// dropping slots that no longer point into the shared region.
    pub(crate) fn collect(scope: &GlobalSafepointScope) -> Self {
        let mut targets = Vec::new();
        scope.iterate_clients(|client| {
            for space in client.collected_spaces() {
                for page in space.pages() {
                    collect_client_page(client, &page, &mut targets);
                }
            }
        });
        ClientSlotBatch { targets }
    }

    pub(crate) fn targets(&self) -> &[Address] {
        &self.targets
    }
}

fn collect_client_page(client: &Heap, page: &Page, targets: &mut Vec<Address>) {
    let page_table = client.page_table();
    let in_shared = |target: Address| {
        page_table
            .page_for(target)
            .is_some_and(|p| p.in_shared_region())
    };
    page.slots()
        .iterate(RememberedSetKind::OldToShared, |offset| {
            let slot_address = page.start() + offset as usize;
            let target = page.object_containing(slot_address).and_then(|host| {
                let slot = host.slot_at_offset((slot_address - host.address()) as usize)?;
                host.load(slot).heap_object()
            });
            match target.filter(|&t| in_shared(t)) {
                Some(target) => {
                    targets.push(target);
                    SlotCallbackResult::Keep
                }
                None => SlotCallbackResult::Remove,
            }
        });
    page.slots()
        .iterate_typed(RememberedSetKind::OldToShared, |_slot_type: SlotType, offset| {
            let slot_address = page.start() + offset as usize;
            let target = page.object_containing(slot_address).and_then(|host| {
                let reloc = host.reloc_at_offset((slot_address - host.address()) as usize)?;
                reloc.target()
            });
            match target.filter(|&t| in_shared(t)) {
                Some(target) => {
                    targets.push(target);
                    SlotCallbackResult::Keep
                }
                None => SlotCallbackResult::Remove,
            }
        });
}

/// Marks the roots of every client heap and the shared objects their
/// slots reference.
pub(crate) fn mark_objects_from_client_heaps(
    visitor: &mut MarkingVisitor<'_>,
    scope: &GlobalSafepointScope,
) -> ClientSlotBatch {
    for client in scope.clients() {
        client
            .roots()
            .iterate(SkipRoot::WEAK, &mut RootMarkingVisitor::new(visitor));
        process_top_optimized_frame(visitor, client);
    }
    let batch = ClientSlotBatch::collect(scope);
    for &target in batch.targets() {
        visitor.mark_object(target);
    }
    log::trace!(
        "marked from {} client heaps, {} shared slots",
        scope.clients().len(),
        batch.targets().len()
    );
    batch
}

/// Marks conservative stack roots of every client heap.
pub(crate) fn mark_client_conservative_stacks(visitor: &mut MarkingVisitor<'_>, scope: &GlobalSafepointScope) {
    for client in scope.clients() {
        mark_roots_from_conservative_stack(visitor, client);
    }
}

fn constructor_of(visitor: &MarkingVisitor<'_>, map: &HeapObject) -> Tagged {
    let mut constructor = map.field(layout::map::BACK_POINTER);
    while let Some(parent) = constructor
        .strong_ref()
        .and_then(|a| visitor.page_of(a)?.object(a))
        .filter(|o| o.kind() == ObjectKind::Map)
    {
        constructor = parent.field(layout::map::BACK_POINTER);
    }
    constructor
}

/// Keeps recently used maps alive while their constructor is, and ages
/// them when their prototype is unreachable.
pub(crate) fn retain_maps(visitor: &mut MarkingVisitor<'_>, heap: &Heap, cycle: &CycleConfig) {
    let should_retain_maps = !cycle.should_reduce_memory() && cycle.retain_maps_for_n_gc != 0;
    let mut maps = heap.retained_maps();
    let mut retained = 0;
    for (value, age) in maps.iter_mut() {
        let Some(map_address) = value.weak_ref() else {
            continue;
        };
        let Some(map) = visitor.page_of(map_address).and_then(|p| p.object(map_address)) else {
            continue;
        };
        if should_retain_maps && visitor.is_unmarked(map_address) {
            let constructor = constructor_of(visitor, &map);
            let constructor_alive = constructor
                .heap_object()
                .is_some_and(|c| visitor.is_live(c));
            if *age > 0 && constructor_alive {
                visitor.mark_object(map_address);
                retained += 1;
            }
            let prototype = map.field(layout::map::PROTOTYPE);
            if *age > 0 && prototype.heap_object().is_some_and(|p| visitor.is_unmarked(p)) {
                *age -= 1;
            }
        } else {
            *age = cycle.retain_maps_for_n_gc;
        }
    }
    heap.set_retained_maps(maps);
    if retained > 0 {
        log::trace!("retained {} maps", retained);
    }
}

/// Termination detection for cooperating markers.
///
/// Participants register when they start. A participant may only finish
/// once every registered participant is idle and the shared worklist is
/// empty. A participant that registers after others finished starts with
/// no work and finishes on its own.
#[derive(Debug, Default)]
pub(crate) struct Terminator {
    active: AtomicUsize,
    idle: AtomicUsize,
}

impl Terminator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    /// Called by a participant whose local worklist is empty. Returns true
    /// once every participant is idle and no shared work is left, false if
    /// work showed up in the meantime.
    pub(crate) fn try_terminate(&self, worklists: &MarkingWorklists) -> bool {
        self.idle.fetch_add(1, Ordering::SeqCst);
        let backoff = Backoff::new();
        loop {
            if !worklists.is_global_empty() {
                self.idle.fetch_sub(1, Ordering::SeqCst);
                return false;
            }
            if self.idle.load(Ordering::SeqCst) >= self.active.load(Ordering::SeqCst) {
                return true;
            }
            backoff.snooze();
        }
    }
}

/// One round of parallel marking: process current ephemerons, drain the
/// shared worklist to exhaustion, then process discovered ephemerons.
pub(crate) struct ParallelMarkingJob<'a> {
    heap: &'a Heap,
    cycle: &'a CycleConfig,
    worklists: &'a Arc<MarkingWorklists>,
    weak_objects: &'a WeakObjects,
    terminator: Terminator,
    another_ephemeron_iteration: AtomicBool,
    context_stats: Mutex<NativeContextStats>,
    visited: AtomicUsize,
}

impl<'a> ParallelMarkingJob<'a> {
    pub(crate) fn new(
        heap: &'a Heap,
        cycle: &'a CycleConfig,
        worklists: &'a Arc<MarkingWorklists>,
        weak_objects: &'a WeakObjects,
    ) -> Self {
        ParallelMarkingJob {
            heap,
            cycle,
            worklists,
            weak_objects,
            terminator: Terminator::new(),
            another_ephemeron_iteration: AtomicBool::new(false),
            context_stats: Mutex::new(NativeContextStats::new()),
            visited: AtomicUsize::new(0),
        }
    }

    /// True if any participant marked a value through an ephemeron.
    pub(crate) fn another_ephemeron_iteration(&self) -> bool {
        self.another_ephemeron_iteration.load(Ordering::Acquire)
    }

    pub(crate) fn visited_objects(&self) -> usize {
        self.visited.load(Ordering::Relaxed)
    }

    pub(crate) fn into_context_stats(self) -> NativeContextStats {
        self.context_stats.into_inner()
    }
}

impl JobTask for ParallelMarkingJob<'_> {
    fn run(&self, delegate: &JobDelegate) {
        self.terminator.register();
        let mut visitor = MarkingVisitor::new(
            self.heap,
            self.cycle,
            Arc::clone(self.worklists),
            self.weak_objects,
        );
        let mut another = false;
        while let Some(ephemeron) = self.weak_objects.current_ephemerons.pop() {
            another |= visitor.process_ephemeron(ephemeron);
        }
        let visited = visitor.drain_with_termination(&self.terminator);
        while let Some(ephemeron) = self.weak_objects.discovered_ephemerons.pop() {
            another |= visitor.process_ephemeron(ephemeron);
        }
        visitor.publish();
        if another {
            self.another_ephemeron_iteration.store(true, Ordering::Release);
        }
        self.visited.fetch_add(visited, Ordering::Relaxed);
        let stats = visitor.take_context_stats();
        if !stats.is_empty() {
            self.context_stats.lock().merge(&stats);
        }
        log::trace!("marking task {} visited {} objects", delegate.task_id(), visited);
    }

    fn max_concurrency(&self, _worker_count: usize) -> usize {
        self.cycle.worker_threads + 1
    }
}
