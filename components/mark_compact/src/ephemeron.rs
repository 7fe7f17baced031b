//! Transitive closure with ephemeron semantics.
//!
//! The closure first iterates to a fixpoint: drain the worklist, then retry
//! every ephemeron whose key was unmarked last time. That is quadratic in
//! the worst case, so after a bounded number of iterations the
//! single-threaded closure switches to a linear algorithm that remembers,
//! per unmarked key, the values it would keep alive.

use crate::jobs::{JobRuntime, TaskPriority};
use crate::marking::{MarkingVisitor, ParallelMarkingJob};
use crate::weak_objects::Ephemeron;
use core_types::Address;
use std::collections::HashMap;
use std::sync::Arc;

/// What one transitive closure did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClosureStats {
    /// Fixpoint iterations run
    pub iterations: usize,
    /// True when the fixpoint gave up and the linear algorithm ran
    pub linear_fallback: bool,
}

/// Marks everything reachable from the worklist, honoring ephemerons.
///
/// With `parallel` set, helper threads join each fixpoint iteration and the
/// linear fallback is skipped; a later single-threaded closure finishes
/// whatever is left.
pub(crate) fn mark_transitive_closure(visitor: &mut MarkingVisitor<'_>, parallel: bool) -> ClosureStats {
    let mut stats = ClosureStats::default();
    if !mark_until_fixpoint(visitor, parallel, &mut stats) && !parallel {
        log::debug!(
            "ephemeron fixpoint gave up after {} iterations, switching to linear marking",
            stats.iterations
        );
        mark_linear(visitor);
        stats.linear_fallback = true;
    }
    stats
}

fn mark_until_fixpoint(visitor: &mut MarkingVisitor<'_>, parallel: bool, stats: &mut ClosureStats) -> bool {
    let max_iterations = visitor.cycle().ephemeron_fixpoint_iterations;
    let weak = visitor.weak_objects();
    loop {
        if stats.iterations >= max_iterations {
            return false;
        }
        weak.merge_next_into_current();
        let mut another = false;
        if parallel {
            another |= run_parallel_marking(visitor);
        }
        another |= process_ephemerons(visitor);
        stats.iterations += 1;
        if !another && visitor.is_worklist_empty() {
            return true;
        }
    }
}

fn run_parallel_marking(visitor: &mut MarkingVisitor<'_>) -> bool {
    visitor.publish();
    let worklists = Arc::clone(visitor.local().global());
    let cycle = visitor.cycle();
    let job = ParallelMarkingJob::new(visitor.heap(), cycle, &worklists, visitor.weak_objects());
    JobRuntime::new(cycle.worker_threads)
        .create_job(TaskPriority::UserBlocking, &job)
        .join();
    let another = job.another_ephemeron_iteration();
    log::trace!("parallel marking visited {} objects", job.visited_objects());
    visitor.merge_context_stats(&job.into_context_stats());
    another
}

/// One round over the current ephemerons, the worklist and the ephemerons
/// discovered while draining it. Returns true if anything was marked.
fn process_ephemerons(visitor: &mut MarkingVisitor<'_>) -> bool {
    let weak = visitor.weak_objects();
    let mut another = false;
    while let Some(ephemeron) = weak.current_ephemerons.pop() {
        another |= visitor.process_ephemeron(ephemeron);
    }
    let (_, objects) = visitor.drain(usize::MAX);
    if objects > 0 {
        another = true;
    }
    while let Some(ephemeron) = weak.discovered_ephemerons.pop() {
        another |= visitor.process_ephemeron(ephemeron);
    }
    another
}

#[derive(Default)]
struct KeyToValues {
    map: HashMap<Address, Vec<Address>>,
    pairs: usize,
}

impl KeyToValues {
    fn insert(&mut self, ephemeron: Ephemeron) {
        self.map.entry(ephemeron.key).or_default().push(ephemeron.value);
        self.pairs += 1;
    }

    fn values(&self, key: Address) -> &[Address] {
        self.map.get(&key).map_or(&[], Vec::as_slice)
    }
}

fn process_and_remember(visitor: &mut MarkingVisitor<'_>, ephemeron: Ephemeron, key_to_values: &mut KeyToValues) {
    visitor.process_ephemeron(ephemeron);
    if visitor.is_unmarked(ephemeron.value) {
        key_to_values.insert(ephemeron);
    }
}

fn mark_linear(visitor: &mut MarkingVisitor<'_>) {
    let weak = visitor.weak_objects();
    let capacity = visitor.cycle().newly_discovered_capacity;
    let mut key_to_values = KeyToValues::default();
    weak.merge_next_into_current();
    while let Some(ephemeron) = weak.current_ephemerons.pop() {
        process_and_remember(visitor, ephemeron, &mut key_to_values);
    }

    let mut rounds = 0;
    let mut work_to_do = true;
    while work_to_do {
        rounds += 1;
        visitor.start_tracking_newly_discovered(key_to_values.pairs.min(capacity));
        visitor.drain(usize::MAX);
        let newly_discovered = visitor.stop_tracking_newly_discovered();

        while let Some(ephemeron) = weak.discovered_ephemerons.pop() {
            process_and_remember(visitor, ephemeron, &mut key_to_values);
        }

        if newly_discovered.overflowed() {
            for ephemeron in crate::weak_objects::drain(&weak.next_ephemerons) {
                weak.next_ephemerons.push(ephemeron);
                if visitor.is_live(ephemeron.key) {
                    visitor.mark_object(ephemeron.value);
                }
            }
        } else {
            for &object in newly_discovered.objects() {
                for &value in key_to_values.values(object) {
                    visitor.mark_object(value);
                }
            }
        }
        // The worklist must not be drained here; its emptiness decides
        // whether another round is needed.
        work_to_do = !visitor.is_worklist_empty();
    }
    log::trace!(
        "linear ephemeron marking finished after {} rounds, {} pairs",
        rounds,
        key_to_values.pairs
    );
}
