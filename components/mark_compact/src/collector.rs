//! The full-collection driver.
//!
//! [`MarkCompactCollector`] walks one heap through the phases of a full
//! collection:
//!
//! ```text
//! Idle -> PrepareGc -> MarkLiveObjects -> ClearNonLiveReferences -> SweepSpaces -> Evacuated -> Idle
//! ```
//!
//! Each step is a public method that fails with [`GcError::InvalidState`]
//! when called out of order; [`MarkCompactCollector::collect_garbage`] runs
//! them all. Marking may also start early through the incremental entry
//! points, in which case the atomic pause finalizes the marking that is
//! already under way.

use crate::candidates::start_compaction;
use crate::clearing::clear_non_live_references;
use crate::config::{CycleConfig, StartCompactionMode};
use crate::ephemeron::{mark_transitive_closure, ClosureStats};
use crate::error::{GcError, GcResult};
use crate::evacuation::{evacuate, release_evacuated_pages};
use crate::heap::Heap;
use crate::incremental_marking::IncrementalMarking;
use crate::marking::{
    mark_client_conservative_stacks, mark_objects_from_client_heaps, mark_roots,
    mark_roots_from_conservative_stack, retain_maps, MarkingVisitor,
};
use crate::marking_worklists::{MarkingWorklists, NativeContextStats};
use crate::page::Page;
use crate::pointer_update::update_pointers_after_evacuation;
use crate::safepoint::GlobalSafepointScope;
use crate::space::SpaceKind;
use crate::tracer::{GcStats, ScopeId, TraceScope};
use crate::verifier::{verify_ephemerons, verify_marking};
use crate::weak_objects::WeakObjects;
use std::sync::Arc;
use std::time::Instant;

/// Last completed step of the running collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectorState {
    /// No collection in progress
    #[default]
    Idle,
    /// Sweeping finished, candidates chosen, mark bits cleared
    PrepareGc,
    /// Transitive closure complete
    MarkLiveObjects,
    /// Weak references to dead objects severed
    ClearNonLiveReferences,
    /// Surviving pages handed to the sweeper
    SweepSpaces,
    /// Objects moved and pointers updated
    Evacuated,
}

impl CollectorState {
    /// Name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            CollectorState::Idle => "idle",
            CollectorState::PrepareGc => "prepare_gc",
            CollectorState::MarkLiveObjects => "mark_live_objects",
            CollectorState::ClearNonLiveReferences => "clear_non_live_references",
            CollectorState::SweepSpaces => "sweep_spaces",
            CollectorState::Evacuated => "evacuated",
        }
    }
}

/// Full mark-compact collector of one heap.
///
/// A collector of a shared-region owner pauses every client heap for the
/// duration of a cycle, so it must not run on a thread that is inside a
/// client's mutator scope.
pub struct MarkCompactCollector {
    heap: Arc<Heap>,
    state: CollectorState,
    cycle: Option<CycleConfig>,
    candidates: Vec<Arc<Page>>,
    worklists: Arc<MarkingWorklists>,
    weak_objects: WeakObjects,
    incremental: IncrementalMarking,
    incremental_context_stats: NativeContextStats,
    safepoint: Option<GlobalSafepointScope>,
}

impl MarkCompactCollector {
    /// Creates the collector of `heap`.
    pub fn new(heap: Arc<Heap>) -> Self {
        let incremental = IncrementalMarking::new(heap.config().incremental.clone());
        MarkCompactCollector {
            heap,
            state: CollectorState::Idle,
            cycle: None,
            candidates: Vec::new(),
            worklists: Arc::new(MarkingWorklists::new()),
            weak_objects: WeakObjects::new(),
            incremental,
            incremental_context_stats: NativeContextStats::new(),
            safepoint: None,
        }
    }

    /// The collected heap.
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Last completed step.
    pub fn state(&self) -> CollectorState {
        self.state
    }

    /// Incremental marking driver.
    pub fn incremental_marking(&self) -> &IncrementalMarking {
        &self.incremental
    }

    /// Settings of the running cycle.
    pub fn cycle_config(&self) -> Option<&CycleConfig> {
        self.cycle.as_ref()
    }

    /// Pages selected for evacuation in the running cycle.
    pub fn evacuation_candidates(&self) -> &[Arc<Page>] {
        &self.candidates
    }

    fn expect_state(&self, expected: CollectorState) -> GcResult<()> {
        if self.state != expected {
            return Err(GcError::InvalidState {
                expected: expected.name(),
                actual: self.state.name(),
            });
        }
        Ok(())
    }

    fn running_cycle(&self) -> GcResult<CycleConfig> {
        self.cycle.clone().ok_or(GcError::InvalidState {
            expected: CollectorState::PrepareGc.name(),
            actual: self.state.name(),
        })
    }

    /// Runs one full collection and returns its statistics.
    pub fn collect_garbage(&mut self) -> GcResult<GcStats> {
        self.prepare()?;
        self.mark_live_objects()?;
        self.clear_non_live_references()?;
        self.sweep()?;
        self.evacuate()?;
        self.finish()
    }

    /// Selects evacuation candidates ahead of the next cycle. Returns true
    /// if any page was selected.
    ///
    /// Once candidates exist, later calls keep them.
    pub fn start_compaction(&mut self, mode: StartCompactionMode) -> GcResult<bool> {
        self.expect_state(CollectorState::Idle)?;
        if self.candidates.is_empty() {
            self.candidates = start_compaction(&self.heap, mode);
        }
        Ok(!self.candidates.is_empty())
    }

    /// Starts marking ahead of the atomic pause.
    ///
    /// Finishes sweeping, selects candidates, activates the marking barrier
    /// and marks the roots. Does nothing if marking already runs.
    pub fn start_incremental_marking(&mut self) -> GcResult<()> {
        self.expect_state(CollectorState::Idle)?;
        if self.incremental.is_marking() {
            return Ok(());
        }
        let heap = Arc::clone(&self.heap);
        heap.ensure_sweeping_completed();
        heap.roots().prune_dead_handles();
        let number = heap.next_cycle();
        if self.candidates.is_empty() {
            self.candidates = start_compaction(&heap, StartCompactionMode::Incremental);
        }
        heap.clear_marking_state();
        let cycle = CycleConfig::new(
            heap.config(),
            heap.role(),
            number,
            !self.candidates.is_empty(),
            true,
            heap.roots().has_conservative_stack(),
        );
        heap.marking_barrier().activate();
        self.incremental.start();

        let mut visitor = MarkingVisitor::new(&heap, &cycle, Arc::clone(&self.worklists), &self.weak_objects);
        mark_roots(&mut visitor, &heap);
        visitor.publish();
        self.incremental_context_stats
            .merge(&visitor.take_context_stats());
        drop(visitor);

        log::debug!(
            "started incremental marking for gc #{} with {} evacuation candidates",
            number,
            self.candidates.len()
        );
        self.cycle = Some(cycle);
        Ok(())
    }

    /// Runs one bounded marking step. Returns true once the worklist is
    /// drained and the atomic pause can finalize.
    pub fn incremental_marking_step(&mut self) -> GcResult<bool> {
        if !self.incremental.is_marking() {
            return Err(GcError::InvalidState {
                expected: "incremental_marking",
                actual: self.state.name(),
            });
        }
        let heap = Arc::clone(&self.heap);
        let cycle = self.running_cycle()?;
        heap.marking_barrier().publish(&self.worklists);

        let started = Instant::now();
        let chunk = self.incremental.config().min_objects_per_slice.max(1);
        let mut visitor = MarkingVisitor::new(&heap, &cycle, Arc::clone(&self.worklists), &self.weak_objects);
        let mut objects = 0;
        loop {
            let (_, visited) = visitor.drain(chunk);
            objects += visited;
            if visitor.is_worklist_empty() || self.incremental.step_exhausted(objects, started.elapsed()) {
                break;
            }
        }
        let complete = visitor.is_worklist_empty();
        visitor.publish();
        self.incremental_context_stats
            .merge(&visitor.take_context_stats());
        drop(visitor);

        self.incremental.record_step(objects, started.elapsed(), complete);
        log::trace!("incremental step visited {} objects, complete: {}", objects, complete);
        Ok(complete)
    }

    /// Opens a cycle: finishes sweeping, prunes dead handles, selects
    /// evacuation candidates and clears mark bits. With incremental
    /// marking in progress only the cycle bookkeeping is done.
    pub fn prepare(&mut self) -> GcResult<()> {
        self.expect_state(CollectorState::Idle)?;
        let heap = Arc::clone(&self.heap);
        let was_marked_incrementally = self.incremental.is_marking();
        let number = match (&self.cycle, was_marked_incrementally) {
            (Some(cycle), true) => cycle.cycle,
            _ => heap.next_cycle(),
        };
        heap.tracer().lock().start_cycle(number);
        let _scope = TraceScope::new(heap.tracer(), ScopeId::Prepare);
        heap.set_gc_in_progress(true);
        if heap.is_shared_owner() {
            self.safepoint = heap.shared_region().map(|region| region.safepoint().enter());
        }
        heap.roots().prune_dead_handles();
        if !was_marked_incrementally {
            heap.ensure_sweeping_completed();
            if self.candidates.is_empty() {
                self.candidates = start_compaction(&heap, StartCompactionMode::Atomic);
            }
            heap.clear_marking_state();
        }
        self.cycle = Some(CycleConfig::new(
            heap.config(),
            heap.role(),
            number,
            !self.candidates.is_empty(),
            was_marked_incrementally,
            heap.roots().has_conservative_stack(),
        ));
        heap.tracer().lock().current().evacuation_candidates = self.candidates.len();
        log::debug!(
            "gc #{}: {} evacuation candidates, incremental: {}",
            number,
            self.candidates.len(),
            was_marked_incrementally
        );
        self.state = CollectorState::PrepareGc;
        Ok(())
    }

    /// Marks everything reachable from the roots of the heap and, for a
    /// shared-region owner, of its clients.
    pub fn mark_live_objects(&mut self) -> GcResult<()> {
        self.expect_state(CollectorState::PrepareGc)?;
        let heap = Arc::clone(&self.heap);
        let cycle = self.running_cycle()?;
        let _scope = TraceScope::new(heap.tracer(), ScopeId::Mark);

        if self.incremental.is_marking() {
            self.incremental.stop();
        } else {
            heap.marking_barrier().activate();
        }
        heap.marking_barrier().publish(&self.worklists);

        let mut visitor = MarkingVisitor::new(&heap, &cycle, Arc::clone(&self.worklists), &self.weak_objects);
        {
            let _scope = TraceScope::new(heap.tracer(), ScopeId::MarkRoots);
            mark_roots(&mut visitor, &heap);
        }
        if let Some(clients) = &self.safepoint {
            let _scope = TraceScope::new(heap.tracer(), ScopeId::MarkClientHeaps);
            mark_objects_from_client_heaps(&mut visitor, clients);
        }
        {
            let _scope = TraceScope::new(heap.tracer(), ScopeId::MarkRetainMaps);
            retain_maps(&mut visitor, &heap, &cycle);
        }
        let mut closure = ClosureStats::default();
        if cycle.parallel_marking {
            let _scope = TraceScope::new(heap.tracer(), ScopeId::MarkClosureParallel);
            closure = mark_transitive_closure(&mut visitor, true);
        }
        mark_roots_from_conservative_stack(&mut visitor, &heap);
        if let Some(clients) = &self.safepoint {
            mark_client_conservative_stacks(&mut visitor, clients);
        }
        {
            let _scope = TraceScope::new(heap.tracer(), ScopeId::MarkClosure);
            let last = mark_transitive_closure(&mut visitor, false);
            closure.iterations += last.iterations;
            closure.linear_fallback |= last.linear_fallback;
        }
        if cfg!(debug_assertions) && cycle.verify_heap {
            verify_ephemerons(&heap, &self.weak_objects);
            verify_marking(&heap);
        }
        let mut context_stats = visitor.take_context_stats();
        drop(visitor);
        heap.marking_barrier().deactivate();

        if cycle.track_native_contexts {
            context_stats.merge(&self.incremental_context_stats);
            heap.set_native_context_stats(context_stats);
        }
        self.incremental_context_stats.clear();
        self.record_marking_stats(closure);
        self.state = CollectorState::MarkLiveObjects;
        Ok(())
    }

    fn record_marking_stats(&self, closure: ClosureStats) {
        let policy = *self.heap.marking_policy();
        let stats_collector = self.heap.object_stats_collector();
        let mut marked_bytes = 0;
        let mut marked_objects = 0;
        for space in self.heap.collected_spaces() {
            for page in space.pages().iter().filter(|p| policy.should_mark(p)) {
                marked_bytes += page.live_bytes();
                let objects = page.marked_objects();
                marked_objects += objects.len();
                if let Some(collector) = &stats_collector {
                    for object in &objects {
                        collector.record_object(object.kind(), object.size());
                    }
                }
            }
        }
        let mut tracer = self.heap.tracer().lock();
        let current = tracer.current();
        current.marked_bytes = marked_bytes;
        current.marked_objects = marked_objects;
        current.ephemeron_iterations = closure.iterations;
        current.linear_ephemeron_fallback = closure.linear_fallback;
        log::debug!(
            "marking: {} objects, {} bytes, {} ephemeron iterations{}",
            marked_objects,
            marked_bytes,
            closure.iterations,
            if closure.linear_fallback { " (linear)" } else { "" }
        );
    }

    /// Severs references to unmarked objects and drains the weak worklists.
    pub fn clear_non_live_references(&mut self) -> GcResult<()> {
        self.expect_state(CollectorState::MarkLiveObjects)?;
        let cycle = self.running_cycle()?;
        let heap = Arc::clone(&self.heap);
        let stats = {
            let _scope = TraceScope::new(heap.tracer(), ScopeId::Clear);
            clear_non_live_references(&heap, &cycle, &self.weak_objects, self.safepoint.as_ref())
        };
        let mut tracer = heap.tracer().lock();
        let current = tracer.current();
        current.cleared_weak_references = stats.cleared_weak_references;
        current.flushed_bytecode = stats.flushed_bytecode;
        drop(tracer);
        self.state = CollectorState::ClearNonLiveReferences;
        Ok(())
    }

    /// Releases empty pages and hands the other surviving pages to the
    /// sweeper. Keeps one empty page per space; candidates are left to
    /// evacuation.
    pub fn sweep(&mut self) -> GcResult<()> {
        self.expect_state(CollectorState::ClearNonLiveReferences)?;
        let heap = Arc::clone(&self.heap);
        let _scope = TraceScope::new(heap.tracer(), ScopeId::Sweep);
        let policy = *heap.marking_policy();
        let mut released = 0;
        let mut swept_spaces = vec![SpaceKind::Old, SpaceKind::Code];
        if heap.is_shared_owner() {
            swept_spaces.push(SpaceKind::Shared);
        }
        for kind in swept_spaces {
            let Some(space) = heap.space(kind) else {
                continue;
            };
            let sweeper = heap.sweeper_for(kind);
            let mut kept_empty_page = false;
            for page in space.pages() {
                if page.is_evacuation_candidate() {
                    continue;
                }
                if page.live_bytes() == 0 {
                    if kept_empty_page {
                        space.release_page(&page);
                        released += 1;
                        continue;
                    }
                    kept_empty_page = true;
                }
                sweeper.add_page(page);
            }
        }
        if let Some(lo_space) = heap.space(SpaceKind::LargeObject) {
            for page in lo_space.pages() {
                if policy.should_mark(&page) && page.marked_objects().is_empty() {
                    lo_space.release_page(&page);
                    released += 1;
                }
            }
        }
        heap.tracer().lock().current().released_pages += released;
        log::debug!(
            "sweep: released {} pages, {} pages pending",
            released,
            heap.sweeper().pending_pages()
        );
        self.state = CollectorState::SweepSpaces;
        Ok(())
    }

    /// Moves live objects off candidates and out of the young generation,
    /// updates every pointer to them and releases the vacated pages.
    pub fn evacuate(&mut self) -> GcResult<()> {
        self.expect_state(CollectorState::SweepSpaces)?;
        let cycle = self.running_cycle()?;
        let heap = Arc::clone(&self.heap);
        let _scope = TraceScope::new(heap.tracer(), ScopeId::Evacuate);
        let outcome = {
            let _scope = TraceScope::new(heap.tracer(), ScopeId::EvacuateCopy);
            evacuate(&heap, &cycle, &self.candidates)
        };
        let updated = {
            let _scope = TraceScope::new(heap.tracer(), ScopeId::EvacuateUpdatePointers);
            update_pointers_after_evacuation(&heap, &cycle, self.safepoint.as_ref())
        };
        let released = {
            let _scope = TraceScope::new(heap.tracer(), ScopeId::EvacuateCleanUp);
            release_evacuated_pages(&heap, &outcome)
        };
        if outcome.stats.aborted_pages > 0 {
            log::warn!(
                "gc #{}: compaction aborted on {} of {} candidate pages",
                cycle.cycle,
                outcome.stats.aborted_pages,
                self.candidates.len()
            );
        }
        let mut tracer = heap.tracer().lock();
        let current = tracer.current();
        current.evacuated_pages = outcome.stats.evacuated_pages;
        current.aborted_pages = outcome.stats.aborted_pages;
        current.promoted_pages = outcome.stats.promoted_pages;
        current.promoted_bytes = outcome.stats.promoted_bytes;
        current.compacted_bytes = outcome.stats.compacted_bytes;
        current.updated_slots = updated;
        current.released_pages += released;
        drop(tracer);
        self.candidates.clear();
        self.state = CollectorState::Evacuated;
        Ok(())
    }

    /// Closes the cycle: clears the marks of surviving large objects, drops
    /// leftover work, resumes client heaps and returns the cycle's
    /// statistics.
    pub fn finish(&mut self) -> GcResult<GcStats> {
        self.expect_state(CollectorState::Evacuated)?;
        let heap = Arc::clone(&self.heap);
        {
            let _scope = TraceScope::new(heap.tracer(), ScopeId::Finish);
            if let Some(lo_space) = heap.space(SpaceKind::LargeObject) {
                for page in lo_space.pages() {
                    page.marking_bitmap().clear_all();
                    page.set_live_bytes(0);
                }
            }
            self.weak_objects.clear();
            self.worklists.clear();
            heap.reset_evacuation_allocation_failure();
            heap.set_gc_in_progress(false);
        }
        self.safepoint = None;
        self.cycle = None;
        self.state = CollectorState::Idle;
        let result = heap.tracer().lock().finish_cycle();
        Ok(result)
    }
}

impl std::fmt::Debug for MarkCompactCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkCompactCollector")
            .field("heap", &self.heap)
            .field("state", &self.state)
            .field("candidates", &self.candidates.len())
            .field("incremental", &self.incremental.phase())
            .finish()
    }
}
