//! Per-cycle statistics and phase timing.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

const COMPACTION_SAMPLES: usize = 10;
const STATS_HISTORY: usize = 16;

/// Timed phases of a full collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeId {
    /// Sweeping completion and candidate selection
    Prepare,
    /// Whole marking phase
    Mark,
    /// Root marking
    MarkRoots,
    /// Marking from client heaps
    MarkClientHeaps,
    /// Retained map handling
    MarkRetainMaps,
    /// Parallel transitive closure
    MarkClosureParallel,
    /// Final single-threaded closure
    MarkClosure,
    /// Weak reference clearing
    Clear,
    /// Sweep scheduling
    Sweep,
    /// Whole evacuation phase
    Evacuate,
    /// Object copying
    EvacuateCopy,
    /// Pointer update
    EvacuateUpdatePointers,
    /// Release and sweeper hand-off after evacuation
    EvacuateCleanUp,
    /// Cycle epilogue
    Finish,
}

/// Statistics of one full collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GcStats {
    /// Collection number
    pub cycle: u64,
    /// Bytes of marked objects
    pub marked_bytes: usize,
    /// Number of marked objects
    pub marked_objects: usize,
    /// Pages selected for evacuation
    pub evacuation_candidates: usize,
    /// Candidate pages fully evacuated
    pub evacuated_pages: usize,
    /// Candidate pages whose evacuation was aborted
    pub aborted_pages: usize,
    /// Young pages promoted as a whole
    pub promoted_pages: usize,
    /// Bytes of young objects moved to old space
    pub promoted_bytes: usize,
    /// Bytes of old objects copied off candidate pages
    pub compacted_bytes: usize,
    /// Slots rewritten by the pointer update pass
    pub updated_slots: usize,
    /// Weak references that were cleared
    pub cleared_weak_references: usize,
    /// Bytecode arrays flushed
    pub flushed_bytecode: usize,
    /// Pages returned to the page table
    pub released_pages: usize,
    /// Iterations of the ephemeron fixpoint
    pub ephemeron_iterations: usize,
    /// True when the linear ephemeron algorithm ran
    pub linear_ephemeron_fallback: bool,
    /// Wall time of the cycle
    pub duration: Duration,
}

/// Collects statistics across cycles.
#[derive(Debug, Default)]
pub struct GcTracer {
    current: GcStats,
    history: VecDeque<GcStats>,
    compaction_samples: VecDeque<(usize, Duration)>,
    scopes: HashMap<ScopeId, Duration>,
    started: Option<Instant>,
}

impl GcTracer {
    /// Creates an empty tracer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracing cycle `cycle`.
    pub fn start_cycle(&mut self, cycle: u64) {
        self.current = GcStats {
            cycle,
            ..GcStats::default()
        };
        self.scopes.clear();
        self.started = Some(Instant::now());
    }

    /// Statistics of the running cycle.
    pub fn current(&mut self) -> &mut GcStats {
        &mut self.current
    }

    /// Finishes the running cycle and returns its statistics.
    pub fn finish_cycle(&mut self) -> GcStats {
        if let Some(started) = self.started.take() {
            self.current.duration = started.elapsed();
        }
        let stats = self.current.clone();
        if self.history.len() == STATS_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(stats.clone());
        log::debug!(
            "full gc #{}: marked {} bytes in {} objects, evacuated {} pages ({} aborted), \
             promoted {} bytes, released {} pages, {:?}",
            stats.cycle,
            stats.marked_bytes,
            stats.marked_objects,
            stats.evacuated_pages,
            stats.aborted_pages,
            stats.promoted_bytes,
            stats.released_pages,
            stats.duration
        );
        stats
    }

    /// Statistics of recent cycles, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &GcStats> {
        self.history.iter()
    }

    /// Statistics of the last finished cycle.
    pub fn last_cycle(&self) -> Option<&GcStats> {
        self.history.back()
    }

    /// Adds the time spent in a phase.
    pub fn add_scope(&mut self, scope: ScopeId, elapsed: Duration) {
        *self.scopes.entry(scope).or_default() += elapsed;
        log::trace!("{:?} took {:?}", scope, elapsed);
    }

    /// Time spent in a phase of the running cycle.
    pub fn scope_time(&self, scope: ScopeId) -> Duration {
        self.scopes.get(&scope).copied().unwrap_or_default()
    }

    /// Records that an evacuator copied `bytes` in `elapsed`.
    pub fn add_compaction_event(&mut self, bytes: usize, elapsed: Duration) {
        if self.compaction_samples.len() == COMPACTION_SAMPLES {
            self.compaction_samples.pop_front();
        }
        self.compaction_samples.push_back((bytes, elapsed));
    }

    /// Average compaction throughput over the recent samples.
    pub fn compaction_speed_in_bytes_per_ms(&self) -> Option<f64> {
        let (bytes, elapsed) = self
            .compaction_samples
            .iter()
            .fold((0usize, Duration::ZERO), |(b, t), &(bytes, elapsed)| {
                (b + bytes, t + elapsed)
            });
        let ms = elapsed.as_secs_f64() * 1000.0;
        (bytes > 0 && ms > 0.0).then(|| bytes as f64 / ms)
    }
}

/// Adds the lifetime of the scope to a phase timer.
pub struct TraceScope<'a> {
    tracer: &'a Mutex<GcTracer>,
    scope: ScopeId,
    start: Instant,
}

impl<'a> TraceScope<'a> {
    /// Starts timing `scope`.
    pub fn new(tracer: &'a Mutex<GcTracer>, scope: ScopeId) -> Self {
        TraceScope {
            tracer,
            scope,
            start: Instant::now(),
        }
    }
}

impl Drop for TraceScope<'_> {
    fn drop(&mut self) {
        self.tracer.lock().add_scope(self.scope, self.start.elapsed());
    }
}
