//! Incremental marking driver.
//!
//! Marking may start ahead of the atomic pause and advance in bounded
//! steps between mutator turns. While it runs, the marking barrier keeps
//! the tri-color invariant: every reference the mutator stores into the
//! heap is marked and buffered, and the buffer is published into the
//! collector's worklists on the next step or at finalization.
//!
//! The collector finalizes an in-progress incremental cycle instead of
//! restarting marking; see
//! [`MarkCompactCollector::collect_garbage`](crate::MarkCompactCollector::collect_garbage).

use crate::marking_worklists::MarkingWorklists;
use core_types::Address;
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Phase of the incremental marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcPhase {
    /// No incremental marking in progress
    #[default]
    Idle,
    /// Marking steps are being interleaved with the mutator
    Marking,
    /// The worklist drained; the atomic pause can finalize
    Complete,
}

/// Configuration for incremental marking.
#[derive(Debug, Clone)]
pub struct IncrementalConfig {
    /// Target time slice for each marking step (microseconds)
    pub time_slice_us: u64,
    /// Maximum objects to mark per step (0 = unlimited)
    pub max_objects_per_slice: usize,
    /// Minimum objects to mark per step before the time slice is checked
    pub min_objects_per_slice: usize,
    /// Barrier buffer length that asks for an early step
    pub barrier_buffer_capacity: usize,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        IncrementalConfig {
            time_slice_us: 1000,
            max_objects_per_slice: 10000,
            min_objects_per_slice: 100,
            barrier_buffer_capacity: 256,
        }
    }
}

/// Statistics for incremental marking.
#[derive(Debug, Default, Clone)]
pub struct IncrementalStats {
    /// Number of marking steps performed
    pub increments: usize,
    /// Total objects visited
    pub objects_marked: usize,
    /// Total time spent marking (microseconds)
    pub total_mark_time_us: u64,
    /// Maximum single step time (microseconds)
    pub max_increment_time_us: u64,
    /// Average objects per step
    pub avg_objects_per_increment: f64,
}

/// Buffer of objects marked by the write barrier.
///
/// The objects are already marked; they only still need to be visited.
pub struct WriteBarrierBuffer {
    buffer: Mutex<Vec<Address>>,
    capacity: usize,
    flush_count: AtomicUsize,
}

impl WriteBarrierBuffer {
    /// Creates a buffer that reports itself full at `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        WriteBarrierBuffer {
            buffer: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            flush_count: AtomicUsize::new(0),
        }
    }

    /// Records an object. Returns true if the buffer should be flushed.
    pub fn record(&self, object: Address) -> bool {
        let mut buffer = self.buffer.lock();
        buffer.push(object);
        buffer.len() >= self.capacity
    }

    /// Moves every buffered object to the global worklist.
    pub fn flush(&self, worklists: &MarkingWorklists) {
        let drained: Vec<Address> = std::mem::take(&mut *self.buffer.lock());
        for object in drained {
            worklists.push_global(object);
        }
        self.flush_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of buffered objects.
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Number of flushes so far.
    pub fn flush_count(&self) -> usize {
        self.flush_count.load(Ordering::Relaxed)
    }

    /// Drops every buffered object.
    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}

impl Default for WriteBarrierBuffer {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Heap-side half of the marking barrier.
#[derive(Default)]
pub struct MarkingBarrier {
    active: AtomicBool,
    buffer: WriteBarrierBuffer,
}

impl MarkingBarrier {
    /// Creates an inactive barrier.
    pub fn new(capacity: usize) -> Self {
        MarkingBarrier {
            active: AtomicBool::new(false),
            buffer: WriteBarrierBuffer::new(capacity),
        }
    }

    /// Returns true while marking is in progress.
    #[inline]
    pub fn is_activated(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Turns the barrier on.
    pub fn activate(&self) {
        self.buffer.clear();
        self.active.store(true, Ordering::Release);
    }

    /// Turns the barrier off and drops anything buffered.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        self.buffer.clear();
    }

    /// Buffers an object the barrier just marked.
    pub fn record(&self, object: Address) -> bool {
        self.buffer.record(object)
    }

    /// Publishes buffered objects into `worklists`.
    pub fn publish(&self, worklists: &MarkingWorklists) {
        if !self.buffer.is_empty() {
            self.buffer.flush(worklists);
        }
    }

    /// The underlying buffer.
    pub fn buffer(&self) -> &WriteBarrierBuffer {
        &self.buffer
    }
}

/// Collector-side state of incremental marking.
pub struct IncrementalMarking {
    config: IncrementalConfig,
    phase: AtomicCell<GcPhase>,
    stats: Mutex<IncrementalStats>,
}

impl IncrementalMarking {
    /// Creates a stopped driver.
    pub fn new(config: IncrementalConfig) -> Self {
        IncrementalMarking {
            config,
            phase: AtomicCell::new(GcPhase::Idle),
            stats: Mutex::new(IncrementalStats::default()),
        }
    }

    /// Driver configuration.
    pub fn config(&self) -> &IncrementalConfig {
        &self.config
    }

    /// Current phase.
    pub fn phase(&self) -> GcPhase {
        self.phase.load()
    }

    /// Returns true between [`IncrementalMarking::start`] and
    /// [`IncrementalMarking::stop`].
    pub fn is_marking(&self) -> bool {
        self.phase.load() != GcPhase::Idle
    }

    /// Returns true when no incremental marking is in progress.
    pub fn is_stopped(&self) -> bool {
        self.phase.load() == GcPhase::Idle
    }

    /// Enters the marking phase.
    pub fn start(&self) {
        *self.stats.lock() = IncrementalStats::default();
        self.phase.store(GcPhase::Marking);
    }

    /// Leaves the marking phase.
    pub fn stop(&self) {
        self.phase.store(GcPhase::Idle);
    }

    /// Records a finished step. `complete` reports a drained worklist.
    pub fn record_step(&self, objects: usize, elapsed: Duration, complete: bool) {
        let elapsed_us = elapsed.as_micros() as u64;
        let mut stats = self.stats.lock();
        stats.increments += 1;
        stats.objects_marked += objects;
        stats.total_mark_time_us += elapsed_us;
        stats.max_increment_time_us = stats.max_increment_time_us.max(elapsed_us);
        stats.avg_objects_per_increment = stats.objects_marked as f64 / stats.increments as f64;
        if complete && self.phase.load() == GcPhase::Marking {
            self.phase.store(GcPhase::Complete);
        }
    }

    /// Returns true if a step that visited `objects` objects in `elapsed`
    /// should stop.
    pub fn step_exhausted(&self, objects: usize, elapsed: Duration) -> bool {
        if objects < self.config.min_objects_per_slice {
            return false;
        }
        elapsed >= Duration::from_micros(self.config.time_slice_us)
            || (self.config.max_objects_per_slice > 0
                && objects >= self.config.max_objects_per_slice)
    }

    /// Statistics of the current or last incremental cycle.
    pub fn stats(&self) -> IncrementalStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_write_barrier_buffer_reports_full() {
        let buffer = WriteBarrierBuffer::new(2);
        assert!(!buffer.record(Address::new(0x40100)));
        assert!(buffer.record(Address::new(0x40200)));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_buffer_flush_publishes_to_global() {
        let worklists = Arc::new(MarkingWorklists::new());
        let buffer = WriteBarrierBuffer::new(4);
        buffer.record(Address::new(0x40100));
        buffer.flush(&worklists);
        assert!(buffer.is_empty());
        assert_eq!(buffer.flush_count(), 1);
        assert!(!worklists.is_global_empty());
    }

    #[test]
    fn test_barrier_activation() {
        let barrier = MarkingBarrier::new(8);
        assert!(!barrier.is_activated());
        barrier.activate();
        assert!(barrier.is_activated());
        barrier.record(Address::new(0x40100));
        barrier.deactivate();
        assert!(barrier.buffer().is_empty());
    }

    #[test]
    fn test_phase_transitions() {
        let marking = IncrementalMarking::new(IncrementalConfig::default());
        assert!(marking.is_stopped());
        marking.start();
        assert!(marking.is_marking());
        marking.record_step(10, Duration::from_micros(5), false);
        assert_eq!(marking.phase(), GcPhase::Marking);
        marking.record_step(10, Duration::from_micros(5), true);
        assert_eq!(marking.phase(), GcPhase::Complete);
        assert!(marking.is_marking());
        marking.stop();
        assert!(marking.is_stopped());
        assert_eq!(marking.stats().increments, 2);
    }

    #[test]
    fn test_step_budget() {
        let marking = IncrementalMarking::new(IncrementalConfig {
            time_slice_us: 1_000_000,
            max_objects_per_slice: 50,
            min_objects_per_slice: 10,
            barrier_buffer_capacity: 16,
        });
        assert!(!marking.step_exhausted(5, Duration::from_secs(5)));
        assert!(!marking.step_exhausted(20, Duration::ZERO));
        assert!(marking.step_exhausted(50, Duration::ZERO));
    }
}
