//! Heap and collection configuration.
//!
//! [`HeapConfig`] is the long-lived, user-facing configuration of a heap.
//! [`CycleConfig`] is derived from it at the start of every full
//! collection and stays immutable until the cycle finishes, so all phases
//! and worker threads of one cycle agree on the same settings.

use crate::incremental_marking::IncrementalConfig;
use crate::policy::HeapRole;

/// Memory pressure mode used by the compaction heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryMode {
    /// Normal operation
    #[default]
    Regular,
    /// The embedder asked to keep the footprint small
    OptimizeMemory,
    /// The heap is under memory pressure and should shrink
    ReduceMemory,
}

/// How compaction is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartCompactionMode {
    /// Candidates are chosen when incremental marking starts
    Incremental,
    /// Candidates are chosen inside the atomic pause
    Atomic,
}

/// Configuration of a heap and its collector.
///
/// # Examples
///
/// ```
/// use mark_compact::{HeapConfig, MemoryMode};
///
/// let config = HeapConfig {
///     memory_mode: MemoryMode::ReduceMemory,
///     parallel_marking: false,
///     ..HeapConfig::default()
/// };
/// assert!(config.compact);
/// ```
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Enables evacuation of fragmented pages
    pub compact: bool,
    /// Allows code pages to become evacuation candidates
    pub compact_code_space: bool,
    /// Selects candidates regardless of the evacuation budget
    pub compact_on_every_full_gc: bool,
    /// Allows compaction while a conservative stack is present
    pub compact_with_stack: bool,
    /// Only pages flagged for testing become candidates
    pub manual_evacuation_candidates_selection: bool,
    /// Every other eligible page becomes a candidate
    pub stress_compaction: bool,
    /// Drains the marking worklist with helper threads
    pub parallel_marking: bool,
    /// Evacuates pages with helper threads
    pub parallel_compaction: bool,
    /// Updates remembered-set slots with helper threads
    pub parallel_pointer_update: bool,
    /// Number of helper threads for parallel jobs (the caller thread is extra)
    pub worker_threads: usize,
    /// Iteration bound of the ephemeron fixpoint before falling back to the linear algorithm
    pub ephemeron_fixpoint_iterations: usize,
    /// Upper bound of the newly-discovered object buffer of the linear algorithm
    pub newly_discovered_capacity: usize,
    /// Memory pressure mode
    pub memory_mode: MemoryMode,
    /// Enables flushing of old bytecode
    pub flush_bytecode: bool,
    /// Number of full collections after which unused bytecode is flushed
    pub bytecode_old_age: u8,
    /// Number of collections a retained map survives without other references
    pub retain_maps_for_n_gc: u32,
    /// Moves densely populated young pages to old space as a whole
    pub page_promotion: bool,
    /// Minimum live percentage of a young page for page promotion
    pub page_promotion_threshold: usize,
    /// Routes internalizable strings into the shared region during promotion
    pub shared_string_table: bool,
    /// Tracks live bytes per native context while marking
    pub track_native_contexts: bool,
    /// Runs the heap verifier after marking and after evacuation
    pub verify_heap: bool,
    /// Maximum number of pages per space
    pub max_pages_per_space: usize,
    /// Incremental marking configuration
    pub incremental: IncrementalConfig,
}

impl Default for HeapConfig {
    fn default() -> Self {
        let worker_threads = std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .min(7);
        HeapConfig {
            compact: true,
            compact_code_space: true,
            compact_on_every_full_gc: false,
            compact_with_stack: false,
            manual_evacuation_candidates_selection: false,
            stress_compaction: false,
            parallel_marking: true,
            parallel_compaction: true,
            parallel_pointer_update: true,
            worker_threads,
            ephemeron_fixpoint_iterations: 10,
            newly_discovered_capacity: 1 << 20,
            memory_mode: MemoryMode::Regular,
            flush_bytecode: true,
            bytecode_old_age: 5,
            retain_maps_for_n_gc: 2,
            page_promotion: true,
            page_promotion_threshold: 70,
            shared_string_table: false,
            track_native_contexts: false,
            verify_heap: false,
            max_pages_per_space: 1024,
            incremental: IncrementalConfig::default(),
        }
    }
}

impl HeapConfig {
    /// Configuration that never starts helper threads.
    pub fn single_threaded() -> Self {
        HeapConfig {
            parallel_marking: false,
            parallel_compaction: false,
            parallel_pointer_update: false,
            worker_threads: 0,
            ..HeapConfig::default()
        }
    }

    /// Returns true when any helper thread may be used.
    pub fn use_background_threads(&self) -> bool {
        self.worker_threads > 0
            && (self.parallel_marking || self.parallel_compaction || self.parallel_pointer_update)
    }
}

/// Settings frozen for the duration of one full collection.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// Collection counter of the owning heap when the cycle started
    pub cycle: u64,
    /// Role of the heap being collected
    pub role: HeapRole,
    /// Memory pressure mode
    pub memory_mode: MemoryMode,
    /// True when evacuation candidates were selected
    pub compacting: bool,
    /// True when marking started incrementally before the pause
    pub was_marked_incrementally: bool,
    /// True when the conservative stack holds any words
    pub gc_with_stack: bool,
    /// Mirrors [`HeapConfig::compact_with_stack`]
    pub compact_with_stack: bool,
    /// Helper threads available to jobs
    pub worker_threads: usize,
    /// Parallel marking enabled and helper threads available
    pub parallel_marking: bool,
    /// Parallel evacuation enabled and helper threads available
    pub parallel_compaction: bool,
    /// Parallel pointer update enabled and helper threads available
    pub parallel_pointer_update: bool,
    /// Ephemeron fixpoint iteration bound
    pub ephemeron_fixpoint_iterations: usize,
    /// Capacity of the newly-discovered buffer
    pub newly_discovered_capacity: usize,
    /// Bytecode flushing enabled
    pub flush_bytecode: bool,
    /// Age at which bytecode is considered old
    pub bytecode_old_age: u8,
    /// Retained map lifetime
    pub retain_maps_for_n_gc: u32,
    /// Page promotion enabled for this cycle
    pub page_promotion: bool,
    /// Live percentage threshold for page promotion
    pub page_promotion_threshold: usize,
    /// Shared string routing enabled
    pub shared_string_table: bool,
    /// Per-context accounting enabled
    pub track_native_contexts: bool,
    /// Heap verification enabled
    pub verify_heap: bool,
}

impl CycleConfig {
    /// Freezes `config` for a collection of a heap with the given role.
    pub fn new(
        config: &HeapConfig,
        role: HeapRole,
        cycle: u64,
        compacting: bool,
        was_marked_incrementally: bool,
        gc_with_stack: bool,
    ) -> Self {
        let background = config.use_background_threads();
        let reduce_memory = config.memory_mode == MemoryMode::ReduceMemory;
        CycleConfig {
            cycle,
            role,
            memory_mode: config.memory_mode,
            compacting,
            was_marked_incrementally,
            gc_with_stack,
            compact_with_stack: config.compact_with_stack,
            worker_threads: if background { config.worker_threads } else { 0 },
            parallel_marking: background && config.parallel_marking,
            parallel_compaction: background && config.parallel_compaction,
            parallel_pointer_update: background && config.parallel_pointer_update,
            ephemeron_fixpoint_iterations: config.ephemeron_fixpoint_iterations,
            newly_discovered_capacity: config.newly_discovered_capacity.max(1),
            flush_bytecode: config.flush_bytecode,
            bytecode_old_age: config.bytecode_old_age,
            retain_maps_for_n_gc: config.retain_maps_for_n_gc,
            page_promotion: config.page_promotion && !reduce_memory,
            page_promotion_threshold: config.page_promotion_threshold,
            shared_string_table: config.shared_string_table,
            track_native_contexts: config.track_native_contexts,
            verify_heap: config.verify_heap,
        }
    }

    /// Returns true when the heap should shrink.
    pub fn should_reduce_memory(&self) -> bool {
        self.memory_mode == MemoryMode::ReduceMemory
    }
}
