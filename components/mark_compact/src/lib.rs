//! Parallel mark-compact collector core.
//!
//! This crate implements the full (non-generational) collection of a paged,
//! garbage-collected heap:
//!
//! - [`Heap`] - Spaces, roots, allocation and field access through the write barrier
//! - [`MarkCompactCollector`] - The phase state machine of a full collection
//! - Marking - Root enumeration, parallel transitive closure and ephemeron resolution
//! - Evacuation - Compaction of fragmented pages with per-page abort on OOM
//! - Pointer updating - Remembered-set driven rewriting of moved references
//! - Clearing - Weak references, weak collections, finalization registries,
//!   bytecode flushing and map transitions
//!
//! Several heaps may share one region. The owner of the region collects it
//! under a global safepoint; clients only record their references into it.
//!
//! # Examples
//!
//! ```
//! use core_types::Tagged;
//! use mark_compact::{Heap, HeapConfig, MarkCompactCollector, ObjectKind, SpaceKind};
//!
//! let heap = Heap::new(HeapConfig::single_threaded());
//! let live = heap.allocate(SpaceKind::Old, ObjectKind::Plain, 1, 0).unwrap();
//! let handle = heap.roots().new_handle(Tagged::strong(live));
//! heap.allocate(SpaceKind::Old, ObjectKind::Plain, 1, 0).unwrap();
//!
//! let mut collector = MarkCompactCollector::new(heap.clone());
//! let stats = collector.collect_garbage().unwrap();
//! assert_eq!(stats.marked_objects, 1);
//! assert!(heap.try_object(handle.get().strong_ref().unwrap()).is_some());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod callbacks;
pub mod candidates;
mod clearing;
pub mod collector;
pub mod config;
mod ephemeron;
pub mod error;
mod evacuation;
pub mod heap;
pub mod incremental_marking;
pub mod jobs;
mod marking;
pub mod marking_bitmap;
pub mod marking_state;
pub mod marking_worklists;
pub mod object;
pub mod page;
mod pointer_update;
pub mod policy;
pub mod remembered_set;
pub mod roots;
pub mod safepoint;
pub mod space;
pub mod string_table;
pub mod sweeper;
pub mod tracer;
mod verifier;
pub mod visitor;
mod weak_objects;
pub mod write_barrier;

pub use callbacks::{DeoptimizationHandler, FatalErrorHandler, MigrationObserver, ObjectStatsCollector};
pub use candidates::{collect_evacuation_candidates, EvacuationHeuristics};
pub use collector::{CollectorState, MarkCompactCollector};
pub use config::{CycleConfig, HeapConfig, MemoryMode, StartCompactionMode};
pub use error::{GcError, GcResult};
pub use heap::{Heap, SharedRegion};
pub use incremental_marking::{
    GcPhase, IncrementalConfig, IncrementalMarking, IncrementalStats, MarkingBarrier, WriteBarrierBuffer,
};
pub use jobs::{JobDelegate, JobHandle, JobRuntime, JobTask, TaskPriority};
pub use marking_state::{AccessMode, MarkingState};
pub use marking_worklists::{ContextId, MarkingWorklists, NativeContextStats};
pub use object::{layout, HeapObject, MapWord, ObjectFlags, ObjectKind, RelocInfo, RelocMode, SlotIndex};
pub use page::{
    EvacuationState, HeapId, Page, PageFlags, PageTable, SweepingState, PAGE_AREA_SIZE, PAGE_SIZE,
};
pub use policy::{HeapRole, MarkingPolicy};
pub use remembered_set::{RememberedSetKind, SlotType};
pub use roots::{FrameKind, Handle, Root, RootSlot, RootVisitor, Roots, SkipRoot, StackFrame};
pub use safepoint::{GlobalSafepoint, GlobalSafepointScope};
pub use space::{Space, SpaceKind};
pub use sweeper::{SweepResult, Sweeper};
pub use tracer::{GcStats, GcTracer, ScopeId};
pub use write_barrier::{record_object_slot, record_reloc_slot, record_slot, write_barrier};
