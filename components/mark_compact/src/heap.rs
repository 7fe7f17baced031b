//! The heap: spaces, roots, mutator entry points and the collector's
//! view of them.
//!
//! A heap is either standalone, the owner of a shared region, or a client
//! of one. Owner and clients share a [`PageTable`] so that any address
//! resolves to its page no matter which heap allocated it. Only the owner
//! collects the shared space; clients treat shared objects as always live.

use crate::callbacks::{
    DeoptimizationHandler, FatalErrorHandler, MigrationObserver, ObjectStatsCollector,
};
use crate::config::HeapConfig;
use crate::error::{GcError, GcResult};
use crate::incremental_marking::MarkingBarrier;
use crate::marking_state::{AccessMode, MarkingState};
use crate::marking_worklists::NativeContextStats;
use crate::object::{layout, object_size, HeapObject, ObjectFlags, ObjectKind, RelocInfo, RelocMode, SlotIndex};
use crate::page::{HeapId, Page, PageFlags, PageTable, PAGE_AREA_SIZE};
use crate::policy::{HeapRole, MarkingPolicy};
use crate::roots::Roots;
use crate::safepoint::GlobalSafepoint;
use crate::space::{Space, SpaceKind};
use crate::string_table::StringTable;
use crate::sweeper::Sweeper;
use crate::tracer::GcTracer;
use crate::write_barrier::{reloc_write_barrier, write_barrier};
use core_types::{Address, Tagged, TAGGED_SIZE};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, Ordering};
use std::sync::Arc;

/// State shared by the owner and the clients of a shared region.
pub struct SharedRegion {
    page_table: Arc<PageTable>,
    space: Space,
    sweeper: Sweeper,
    string_table: StringTable,
    safepoint: GlobalSafepoint,
}

impl SharedRegion {
    /// The shared space.
    pub fn space(&self) -> &Space {
        &self.space
    }

    /// Page table of the region.
    pub fn page_table(&self) -> &Arc<PageTable> {
        &self.page_table
    }

    /// Sweeper of the shared space.
    pub fn sweeper(&self) -> &Sweeper {
        &self.sweeper
    }

    /// Shared string table.
    pub fn string_table(&self) -> &StringTable {
        &self.string_table
    }

    /// Safepoint over the client heaps.
    pub fn safepoint(&self) -> &GlobalSafepoint {
        &self.safepoint
    }
}

#[derive(Default)]
struct Callbacks {
    deoptimization: Option<Arc<dyn DeoptimizationHandler>>,
    migration_observers: Vec<Arc<dyn MigrationObserver>>,
    object_stats: Option<Arc<dyn ObjectStatsCollector>>,
    fatal_error: Option<Arc<dyn FatalErrorHandler>>,
}

/// A garbage-collected heap.
pub struct Heap {
    id: HeapId,
    role: HeapRole,
    config: HeapConfig,
    page_table: Arc<PageTable>,
    shared: Option<Arc<SharedRegion>>,
    read_only_space: Space,
    new_space: Space,
    old_space: Space,
    code_space: Space,
    lo_space: Space,
    roots: Roots,
    string_table: StringTable,
    retained_maps: Mutex<Vec<(Tagged, u32)>>,
    dirty_registries: Mutex<Vec<Tagged>>,
    sweeper: Sweeper,
    tracer: Mutex<GcTracer>,
    marking_barrier: MarkingBarrier,
    marking_state: MarkingState,
    marking_policy: MarkingPolicy,
    native_context_stats: Mutex<NativeContextStats>,
    mutator_lock: Arc<RwLock<()>>,
    gc_count: AtomicU64,
    gc_in_progress: AtomicBool,
    callbacks: RwLock<Callbacks>,
    evacuation_allocation_budget: AtomicIsize,
}

impl Heap {
    fn with_region(
        config: HeapConfig,
        role: HeapRole,
        page_table: Arc<PageTable>,
        shared: Option<Arc<SharedRegion>>,
        id: HeapId,
    ) -> Heap {
        let max_pages = config.max_pages_per_space;
        let space = |kind| Space::new(kind, id, Arc::clone(&page_table), max_pages);
        Heap {
            id,
            role,
            read_only_space: space(SpaceKind::ReadOnly),
            new_space: space(SpaceKind::New),
            old_space: space(SpaceKind::Old),
            code_space: space(SpaceKind::Code),
            lo_space: space(SpaceKind::LargeObject),
            marking_barrier: MarkingBarrier::new(config.incremental.barrier_buffer_capacity),
            marking_state: MarkingState::new(Arc::clone(&page_table), AccessMode::Atomic),
            marking_policy: MarkingPolicy::new(role, id),
            config,
            page_table,
            shared,
            roots: Roots::new(),
            string_table: StringTable::new(),
            retained_maps: Mutex::new(Vec::new()),
            dirty_registries: Mutex::new(Vec::new()),
            sweeper: Sweeper::new(),
            tracer: Mutex::new(GcTracer::new()),
            native_context_stats: Mutex::new(NativeContextStats::new()),
            mutator_lock: Arc::new(RwLock::new(())),
            gc_count: AtomicU64::new(0),
            gc_in_progress: AtomicBool::new(false),
            callbacks: RwLock::new(Callbacks::default()),
            evacuation_allocation_budget: AtomicIsize::new(-1),
        }
    }

    /// Creates a standalone heap.
    pub fn new(config: HeapConfig) -> Arc<Heap> {
        let page_table = PageTable::new();
        let id = page_table.next_heap_id();
        Arc::new(Heap::with_region(config, HeapRole::Standalone, page_table, None, id))
    }

    /// Creates a heap that owns a fresh shared region.
    pub fn new_shared_owner(config: HeapConfig) -> Arc<Heap> {
        let page_table = PageTable::new();
        let id = page_table.next_heap_id();
        let region = Arc::new(SharedRegion {
            space: Space::new(
                SpaceKind::Shared,
                id,
                Arc::clone(&page_table),
                config.max_pages_per_space,
            ),
            page_table: Arc::clone(&page_table),
            sweeper: Sweeper::new(),
            string_table: StringTable::new(),
            safepoint: GlobalSafepoint::new(),
        });
        log::debug!("created shared region owned by heap {:?}", id);
        Arc::new(Heap::with_region(config, HeapRole::SharedOwner, page_table, Some(region), id))
    }

    /// Creates a client heap attached to the region of `owner`.
    pub fn new_client(owner: &Heap, config: HeapConfig) -> GcResult<Arc<Heap>> {
        let region = match (&owner.shared, owner.role) {
            (Some(region), HeapRole::SharedOwner) => Arc::clone(region),
            _ => return Err(GcError::NotSharedOwner),
        };
        let page_table = Arc::clone(&region.page_table);
        let id = page_table.next_heap_id();
        let heap = Arc::new(Heap::with_region(
            config,
            HeapRole::Client,
            page_table,
            Some(Arc::clone(&region)),
            id,
        ));
        region.safepoint.register_client(&heap);
        log::debug!("attached client heap {:?} to the region of {:?}", id, owner.id);
        Ok(heap)
    }

    /// Heap identity.
    pub fn id(&self) -> HeapId {
        self.id
    }

    /// Role with respect to the shared region.
    pub fn role(&self) -> HeapRole {
        self.role
    }

    /// Returns true for the owner of a shared region.
    pub fn is_shared_owner(&self) -> bool {
        self.role == HeapRole::SharedOwner
    }

    /// Heap configuration.
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Page table covering this heap (and its region, if any).
    pub fn page_table(&self) -> &Arc<PageTable> {
        &self.page_table
    }

    /// The attached shared region.
    pub fn shared_region(&self) -> Option<&Arc<SharedRegion>> {
        self.shared.as_ref()
    }

    /// Space `kind`. The shared space is only available with a region.
    pub fn space(&self, kind: SpaceKind) -> Option<&Space> {
        match kind {
            SpaceKind::ReadOnly => Some(&self.read_only_space),
            SpaceKind::New => Some(&self.new_space),
            SpaceKind::Old => Some(&self.old_space),
            SpaceKind::Code => Some(&self.code_space),
            SpaceKind::LargeObject => Some(&self.lo_space),
            SpaceKind::Shared => self.shared.as_ref().map(|region| &region.space),
        }
    }

    /// Spaces this heap's collector is responsible for.
    pub(crate) fn collected_spaces(&self) -> Vec<&Space> {
        let mut spaces = vec![&self.new_space, &self.old_space, &self.code_space, &self.lo_space];
        if self.is_shared_owner() {
            if let Some(region) = &self.shared {
                spaces.push(&region.space);
            }
        }
        spaces
    }

    /// Root table.
    pub fn roots(&self) -> &Roots {
        &self.roots
    }

    /// String table used for internalization.
    pub fn string_table(&self) -> &StringTable {
        match &self.shared {
            Some(region) if self.config.shared_string_table => &region.string_table,
            _ => &self.string_table,
        }
    }

    /// Returns true if this heap's collector owns the string table.
    pub(crate) fn owns_string_table(&self) -> bool {
        self.role != HeapRole::Client || !self.config.shared_string_table
    }

    /// Sweeper of the non-shared spaces.
    pub fn sweeper(&self) -> &Sweeper {
        &self.sweeper
    }

    /// Sweeper responsible for pages of `space`.
    pub(crate) fn sweeper_for(&self, space: SpaceKind) -> &Sweeper {
        match (&self.shared, space) {
            (Some(region), SpaceKind::Shared) => &region.sweeper,
            _ => &self.sweeper,
        }
    }

    /// Statistics collector.
    pub fn tracer(&self) -> &Mutex<GcTracer> {
        &self.tracer
    }

    /// Marking barrier shared with the mutator.
    pub fn marking_barrier(&self) -> &MarkingBarrier {
        &self.marking_barrier
    }

    /// Mark bits of every page reachable through the page table.
    pub fn marking_state(&self) -> &MarkingState {
        &self.marking_state
    }

    /// Which pages this heap's collector marks.
    pub fn marking_policy(&self) -> &MarkingPolicy {
        &self.marking_policy
    }

    /// Per-context live bytes of the last marking phase.
    pub fn native_context_stats(&self) -> NativeContextStats {
        self.native_context_stats.lock().clone()
    }

    pub(crate) fn set_native_context_stats(&self, stats: NativeContextStats) {
        *self.native_context_stats.lock() = stats;
    }

    /// Lock mutator threads hold shared while they run.
    pub fn mutator_lock(&self) -> &Arc<RwLock<()>> {
        &self.mutator_lock
    }

    /// Enters the heap as a mutator. Blocks while a safepoint is active.
    pub fn mutator_scope(&self) -> RwLockReadGuard<'_, ()> {
        self.mutator_lock.read()
    }

    /// Number of full collections started so far.
    pub fn gc_count(&self) -> u64 {
        self.gc_count.load(Ordering::Relaxed)
    }

    pub(crate) fn next_cycle(&self) -> u64 {
        self.gc_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns true between the first and the last step of a collection.
    pub fn gc_in_progress(&self) -> bool {
        self.gc_in_progress.load(Ordering::Acquire)
    }

    pub(crate) fn set_gc_in_progress(&self, value: bool) {
        self.gc_in_progress.store(value, Ordering::Release);
    }

    /// Allocates an object with `field_count` undefined fields and
    /// `payload_size` raw bytes in `space`.
    ///
    /// Objects too large for a regular page go to the large object space.
    /// Pages of the target space that wait for sweeping are swept first.
    pub fn allocate(
        &self,
        space: SpaceKind,
        kind: ObjectKind,
        field_count: usize,
        payload_size: usize,
    ) -> GcResult<Address> {
        let size = object_size(field_count, payload_size);
        let target = self.space(space).ok_or(GcError::NotSharedOwner)?;
        let (page, address) = if size > PAGE_AREA_SIZE {
            if space == SpaceKind::Shared {
                return Err(GcError::ObjectTooLarge {
                    size,
                    max: PAGE_AREA_SIZE,
                });
            }
            let extra = match space {
                SpaceKind::Code => PageFlags::IS_EXECUTABLE,
                _ => PageFlags::empty(),
            };
            self.lo_space.allocate_large(size, extra)?
        } else {
            if !self.gc_in_progress() {
                let sweeper = self.sweeper_for(space);
                if sweeper.has_pending(space) {
                    sweeper.sweep_space(space);
                }
            }
            let address = target.allocate_raw(size)?;
            let page = self
                .page_table
                .page_for(address)
                .ok_or(GcError::InvalidAddress(address))?;
            (page, address)
        };
        let object = Arc::new(HeapObject::new(
            address,
            kind,
            Tagged::UNDEFINED,
            field_count,
            payload_size,
        ));
        if self.marking_barrier.is_activated() && self.marking_policy.should_mark(&page) {
            self.marking_state.try_mark_on(&page, &object);
        }
        page.insert_object(object);
        Ok(address)
    }

    /// Allocates a code object with `field_count` fields and room for
    /// `instruction_size` bytes of instructions.
    pub fn allocate_code(
        &self,
        field_count: usize,
        instruction_size: usize,
        flags: ObjectFlags,
    ) -> GcResult<Address> {
        let address = self.allocate(SpaceKind::Code, ObjectKind::Code, field_count, instruction_size)?;
        self.object(address)?.set_flags(flags);
        Ok(address)
    }

    /// Object starting at `address`.
    pub fn object(&self, address: Address) -> GcResult<Arc<HeapObject>> {
        self.try_object(address).ok_or(GcError::InvalidAddress(address))
    }

    /// Object starting at `address`, if any.
    pub fn try_object(&self, address: Address) -> Option<Arc<HeapObject>> {
        self.page_table.page_for(address)?.object(address)
    }

    /// Page covering `address`.
    pub fn page_of(&self, address: Address) -> Option<Arc<Page>> {
        self.page_table.page_for(address)
    }

    /// Reads field `index` of the object at `object`.
    pub fn read_field(&self, object: Address, index: usize) -> GcResult<Tagged> {
        let host = self.object(object)?;
        check_field(&host, index)?;
        Ok(host.field(index))
    }

    /// Writes field `index` of the object at `object` through the write barrier.
    pub fn write_field(&self, object: Address, index: usize, value: Tagged) -> GcResult<()> {
        let host = self.object(object)?;
        check_field(&host, index)?;
        let slot = SlotIndex::Field(index);
        host.store(slot, value);
        write_barrier(self, &host, slot, value);
        Ok(())
    }

    /// Installs `map` as the map of `object`.
    pub fn set_map(&self, object: Address, map: Address) -> GcResult<()> {
        let host = self.object(object)?;
        let value = Tagged::strong(map);
        host.store(SlotIndex::Map, value);
        write_barrier(self, &host, SlotIndex::Map, value);
        Ok(())
    }

    /// Appends a relocation entry referencing `target` to the code object
    /// `code`. Returns the entry's byte offset.
    pub fn add_reloc(&self, code: Address, mode: RelocMode, target: Address) -> GcResult<usize> {
        let host = self.object(code)?;
        let body = host.code_body().ok_or(GcError::WrongKind {
            object: code,
            expected: ObjectKind::Code.name(),
            actual: host.kind().name(),
        })?;
        let reloc = {
            let mut body = body.lock();
            let offset = crate::object::HEADER_SIZE
                + host.field_count() * TAGGED_SIZE
                + body.relocs.len() * TAGGED_SIZE;
            if offset + TAGGED_SIZE > host.size() {
                return Err(GcError::FieldOutOfBounds {
                    object: code,
                    index: body.relocs.len(),
                    len: body.relocs.len(),
                });
            }
            let reloc = RelocInfo {
                mode,
                offset,
                value: target.raw(),
            };
            body.relocs.push(reloc);
            reloc
        };
        reloc_write_barrier(self, &host, &reloc);
        Ok(reloc.offset)
    }

    /// Creates a JS weak reference to `target`.
    pub fn new_js_weak_ref(&self, target: Address) -> GcResult<Address> {
        let weak_ref = self.allocate(
            SpaceKind::Old,
            ObjectKind::JsWeakRef,
            layout::js_weak_ref::FIELD_COUNT,
            0,
        )?;
        self.write_field(weak_ref, layout::js_weak_ref::TARGET, Tagged::strong(target))?;
        Ok(weak_ref)
    }

    /// Creates an empty finalization registry.
    pub fn new_finalization_registry(&self) -> GcResult<Address> {
        self.allocate(
            SpaceKind::Old,
            ObjectKind::FinalizationRegistry,
            layout::finalization_registry::FIELD_COUNT,
            0,
        )
    }

    /// Registers `target` with `registry` and returns the new weak cell.
    ///
    /// The cell is linked at the head of the registry's active list. A
    /// non-`None` `token` can later unregister the cell.
    pub fn register_weak_cell(
        &self,
        registry: Address,
        target: Address,
        holdings: Tagged,
        token: Option<Address>,
    ) -> GcResult<Address> {
        use layout::{finalization_registry as fr, weak_cell as wc};

        let registry_object = self.object(registry)?;
        let key_map = registry_object.key_map().ok_or(GcError::WrongKind {
            object: registry,
            expected: ObjectKind::FinalizationRegistry.name(),
            actual: registry_object.kind().name(),
        })?;
        let cell = self.allocate(SpaceKind::Old, ObjectKind::WeakCell, wc::FIELD_COUNT, 0)?;
        self.write_field(cell, wc::TARGET, Tagged::strong(target))?;
        self.write_field(cell, wc::REGISTRY, Tagged::strong(registry))?;
        self.write_field(cell, wc::HOLDINGS, holdings)?;
        if let Some(token) = token {
            self.write_field(cell, wc::UNREGISTER_TOKEN, Tagged::strong(token))?;
            let token_identity = self.object(token)?.identity();
            key_map.lock().insert(token_identity, self.object(cell)?.identity());
        }
        let head = registry_object.field(fr::ACTIVE_CELLS);
        if let Some(head) = head.strong_ref() {
            self.write_field(head, wc::PREV, Tagged::strong(cell))?;
        }
        self.write_field(cell, wc::NEXT, head)?;
        self.write_field(registry, fr::ACTIVE_CELLS, Tagged::strong(cell))?;
        Ok(cell)
    }

    /// Returns the internalized string for `contents`, allocating it if
    /// needed.
    pub fn internalize_string(&self, contents: &str) -> GcResult<Address> {
        let table = self.string_table();
        if let Some(existing) = table.lookup(contents) {
            return Ok(existing);
        }
        let space = if self.config.shared_string_table && self.shared.is_some() {
            SpaceKind::Shared
        } else {
            SpaceKind::Old
        };
        let string = self.allocate(space, ObjectKind::SeqString, 0, contents.len())?;
        table.insert(contents, string);
        Ok(string)
    }

    /// Keeps `map` alive for the configured number of collections.
    pub fn add_retained_map(&self, map: Address) {
        self.retained_maps
            .lock()
            .push((Tagged::weak(map), self.config.retain_maps_for_n_gc));
    }

    /// Retained maps and their remaining ages.
    pub fn retained_maps(&self) -> Vec<(Tagged, u32)> {
        self.retained_maps.lock().clone()
    }

    pub(crate) fn set_retained_maps(&self, maps: Vec<(Tagged, u32)>) {
        *self.retained_maps.lock() = maps;
    }

    pub(crate) fn dirty_registry_slots(&self) -> parking_lot::MutexGuard<'_, Vec<Tagged>> {
        self.dirty_registries.lock()
    }

    /// Queues `registry` for its cleanup task unless it already is.
    pub(crate) fn enqueue_dirty_finalization_registry(&self, registry: &HeapObject) -> bool {
        if registry.has_flags(ObjectFlags::SCHEDULED_FOR_CLEANUP) {
            return false;
        }
        registry.set_flags(ObjectFlags::SCHEDULED_FOR_CLEANUP);
        self.dirty_registries
            .lock()
            .push(Tagged::strong(registry.address()));
        true
    }

    /// Registries with cleared cells, in the order they became dirty.
    ///
    /// Taking them resets their scheduled state.
    pub fn take_dirty_finalization_registries(&self) -> Vec<Address> {
        let registries: Vec<Address> = std::mem::take(&mut *self.dirty_registries.lock())
            .into_iter()
            .filter_map(Tagged::strong_ref)
            .collect();
        for &registry in &registries {
            if let Some(object) = self.try_object(registry) {
                object.clear_flags(ObjectFlags::SCHEDULED_FOR_CLEANUP);
            }
        }
        registries
    }

    /// Assigns `map` to native context `context` for per-context accounting.
    pub fn set_native_context(&self, map: Address, context: u64) -> GcResult<()> {
        self.object(map)?.set_native_context(context);
        Ok(())
    }

    /// Returns true if the object at `address` is marked.
    pub fn is_marked(&self, address: Address) -> bool {
        self.marking_state.is_marked(address)
    }

    /// Clears the mark bits and live byte counters of every collected page.
    pub fn clear_marking_state(&self) {
        for space in self.collected_spaces() {
            for page in space.pages() {
                page.marking_bitmap().clear_all();
                page.set_live_bytes(0);
            }
        }
    }

    /// Finishes all pending sweeping work.
    pub fn ensure_sweeping_completed(&self) -> usize {
        let mut freed = self.sweeper.ensure_completed();
        if self.is_shared_owner() {
            if let Some(region) = &self.shared {
                freed += region.sweeper.ensure_completed();
            }
        }
        freed
    }

    /// Installs the handler that deoptimizes code with dead embedded objects.
    pub fn set_deoptimization_handler(&self, handler: Arc<dyn DeoptimizationHandler>) {
        self.callbacks.write().deoptimization = Some(handler);
    }

    /// Deoptimization handler, if installed.
    pub fn deoptimization_handler(&self) -> Option<Arc<dyn DeoptimizationHandler>> {
        self.callbacks.read().deoptimization.clone()
    }

    /// Adds an observer notified of every object move.
    pub fn add_migration_observer(&self, observer: Arc<dyn MigrationObserver>) {
        self.callbacks.write().migration_observers.push(observer);
    }

    /// Installed migration observers.
    pub fn migration_observers(&self) -> Vec<Arc<dyn MigrationObserver>> {
        self.callbacks.read().migration_observers.clone()
    }

    /// Installs the collector of live-object statistics.
    pub fn set_object_stats_collector(&self, collector: Arc<dyn ObjectStatsCollector>) {
        self.callbacks.write().object_stats = Some(collector);
    }

    /// Live-object statistics collector, if installed.
    pub fn object_stats_collector(&self) -> Option<Arc<dyn ObjectStatsCollector>> {
        self.callbacks.read().object_stats.clone()
    }

    /// Installs the handler called before the process aborts on fatal OOM.
    pub fn set_fatal_error_handler(&self, handler: Arc<dyn FatalErrorHandler>) {
        self.callbacks.write().fatal_error = Some(handler);
    }

    /// Reports an unrecoverable out-of-memory condition and aborts.
    pub fn fatal_process_out_of_memory(&self, location: &str) -> ! {
        log::error!("fatal out of memory in heap {:?}: {}", self.id, location);
        let handler = self.callbacks.read().fatal_error.clone();
        if let Some(handler) = handler {
            handler.fatal_out_of_memory(location);
        }
        std::process::abort()
    }

    /// Makes evacuation allocations fail after `after` more successes.
    pub fn inject_evacuation_allocation_failure(&self, after: usize) {
        let after = isize::try_from(after).unwrap_or(isize::MAX);
        self.evacuation_allocation_budget.store(after, Ordering::Release);
    }

    pub(crate) fn reset_evacuation_allocation_failure(&self) {
        self.evacuation_allocation_budget.store(-1, Ordering::Release);
    }

    /// Consumes one unit of the injected allocation budget.
    pub(crate) fn evacuation_allocation_allowed(&self) -> bool {
        let mut current = self.evacuation_allocation_budget.load(Ordering::Acquire);
        loop {
            if current < 0 {
                return true;
            }
            if current == 0 {
                return false;
            }
            match self.evacuation_allocation_budget.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

fn check_field(host: &HeapObject, index: usize) -> GcResult<()> {
    if index >= host.field_count() {
        return Err(GcError::FieldOutOfBounds {
            object: host.address(),
            index,
            len: host.field_count(),
        });
    }
    Ok(())
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("gc_count", &self.gc_count())
            .finish()
    }
}
