//! Parallel job runtime.
//!
//! A job is a [`JobTask`] run by up to `max_concurrency` threads at once.
//! The thread calling [`JobHandle::join`] participates as task 0 and the
//! call returns once every participant has returned from
//! [`JobTask::run`]. Helper threads are scoped, so tasks may borrow from
//! the caller's stack.
//!
//! Page-granular jobs hand out their items through [`WorkItems`]: each item
//! is claimed by exactly one participant, and participants start at
//! different positions so they rarely contend for the same item.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Scheduling priority of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    /// The main thread waits for the job
    UserBlocking,
    /// The job produces results the user will see soon
    UserVisible,
    /// Background work
    BestEffort,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskPriority::UserBlocking => "blocking",
            TaskPriority::UserVisible => "visible",
            TaskPriority::BestEffort => "background",
        };
        f.write_str(name)
    }
}

/// Information passed to each participant of a job.
#[derive(Debug, Clone, Copy)]
pub struct JobDelegate {
    task_id: usize,
    is_joining_thread: bool,
}

impl JobDelegate {
    /// Index of this participant, 0 for the joining thread.
    pub fn task_id(&self) -> usize {
        self.task_id
    }

    /// Returns true on the thread that called [`JobHandle::join`].
    pub fn is_joining_thread(&self) -> bool {
        self.is_joining_thread
    }
}

/// Work that can be split across threads.
pub trait JobTask: Send + Sync {
    /// Performs work until none is left for this participant.
    fn run(&self, delegate: &JobDelegate);

    /// Number of participants the task could use given that
    /// `worker_count` already run it.
    fn max_concurrency(&self, worker_count: usize) -> usize;
}

/// Spawns jobs on scoped helper threads.
#[derive(Debug, Clone, Copy)]
pub struct JobRuntime {
    worker_threads: usize,
}

impl JobRuntime {
    /// Creates a runtime with `worker_threads` helpers besides the caller.
    pub fn new(worker_threads: usize) -> Self {
        JobRuntime { worker_threads }
    }

    /// Number of helper threads.
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Prepares `task` for execution.
    pub fn create_job<'a, T: JobTask>(&self, priority: TaskPriority, task: &'a T) -> JobHandle<'a, T> {
        JobHandle {
            runtime: *self,
            priority,
            task,
        }
    }
}

/// A job that runs when joined.
pub struct JobHandle<'a, T: JobTask> {
    runtime: JobRuntime,
    priority: TaskPriority,
    task: &'a T,
}

impl<T: JobTask> JobHandle<'_, T> {
    /// Runs the job and blocks until all participants are done.
    ///
    /// A panic in any participant is resumed on the joining thread.
    pub fn join(self) {
        let task = self.task;
        let participants = task
            .max_concurrency(0)
            .clamp(1, self.runtime.worker_threads + 1);
        let joining = JobDelegate {
            task_id: 0,
            is_joining_thread: true,
        };
        if participants == 1 {
            task.run(&joining);
            return;
        }
        let priority = self.priority;
        let result = crossbeam::scope(|scope| {
            let mut helpers = Vec::with_capacity(participants - 1);
            for task_id in 1..participants {
                let spawned = scope
                    .builder()
                    .name(format!("gc-{priority}-{task_id}"))
                    .spawn(move |_| {
                        task.run(&JobDelegate {
                            task_id,
                            is_joining_thread: false,
                        })
                    });
                match spawned {
                    Ok(handle) => helpers.push(handle),
                    Err(err) => {
                        log::warn!("failed to spawn gc helper {task_id}: {err}");
                        break;
                    }
                }
            }
            task.run(&joining);
            for helper in helpers {
                if let Err(payload) = helper.join() {
                    std::panic::resume_unwind(payload);
                }
            }
        });
        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    }
}

/// Claim flag of one work item.
#[derive(Debug, Default)]
pub struct ParallelWorkItem {
    acquired: AtomicBool,
}

impl ParallelWorkItem {
    /// Claims the item. Returns true for exactly one caller.
    pub fn try_acquire(&self) -> bool {
        !self.acquired.swap(true, Ordering::AcqRel)
    }

    /// Returns true once claimed.
    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::Acquire)
    }
}

/// Hands out start indices spread across a range.
///
/// The first index is 0; later ones bisect the largest remaining gaps.
pub struct IndexGenerator {
    first: AtomicBool,
    ranges: Mutex<VecDeque<(usize, usize)>>,
}

impl IndexGenerator {
    /// Creates a generator over `0..size`.
    pub fn new(size: usize) -> Self {
        let mut ranges = VecDeque::new();
        if size > 0 {
            ranges.push_back((0, size));
        }
        IndexGenerator {
            first: AtomicBool::new(true),
            ranges: Mutex::new(ranges),
        }
    }

    /// Next start index, or `None` once every index was handed out.
    pub fn next_index(&self) -> Option<usize> {
        let mut ranges = self.ranges.lock();
        let (start, end) = ranges.pop_front()?;
        if self.first.swap(false, Ordering::Relaxed) {
            if start + 1 < end {
                ranges.push_back((start + 1, end));
            }
            return Some(start);
        }
        let mid = start + (end - start) / 2;
        if start < mid {
            ranges.push_back((start, mid));
        }
        if mid + 1 < end {
            ranges.push_back((mid + 1, end));
        }
        Some(mid)
    }
}

/// Items of a page-granular job, each processed exactly once.
pub struct WorkItems<T> {
    items: Vec<(ParallelWorkItem, T)>,
    remaining: AtomicUsize,
    generator: IndexGenerator,
}

impl<T> WorkItems<T> {
    /// Wraps `items`.
    pub fn new(items: Vec<T>) -> Self {
        let len = items.len();
        WorkItems {
            items: items
                .into_iter()
                .map(|item| (ParallelWorkItem::default(), item))
                .collect(),
            remaining: AtomicUsize::new(len),
            generator: IndexGenerator::new(len),
        }
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if there are no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of unprocessed items.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Relaxed)
    }

    /// Claims and processes items until none are left unclaimed.
    ///
    /// Scanning starts at a fresh index from the generator and wraps around.
    pub fn process(&self, mut f: impl FnMut(&T)) {
        if self.items.is_empty() {
            return;
        }
        let start = self.generator.next_index().unwrap_or(0);
        let len = self.items.len();
        for offset in 0..len {
            if self.remaining() == 0 {
                return;
            }
            let (claim, item) = &self.items[(start + offset) % len];
            if claim.try_acquire() {
                f(item);
                self.remaining.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Consumes the wrapper and returns the items.
    pub fn into_inner(self) -> Vec<T> {
        self.items.into_iter().map(|(_, item)| item).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct CountingTask {
        items: WorkItems<usize>,
        processed: Mutex<Vec<usize>>,
        participants: Mutex<HashSet<usize>>,
    }

    impl JobTask for CountingTask {
        fn run(&self, delegate: &JobDelegate) {
            self.participants.lock().insert(delegate.task_id());
            self.items.process(|&item| self.processed.lock().push(item));
        }

        fn max_concurrency(&self, worker_count: usize) -> usize {
            self.items.remaining().max(worker_count)
        }
    }

    #[test]
    fn test_each_item_processed_once() {
        let task = CountingTask {
            items: WorkItems::new((0..100).collect()),
            processed: Mutex::new(Vec::new()),
            participants: Mutex::new(HashSet::new()),
        };
        JobRuntime::new(3)
            .create_job(TaskPriority::UserBlocking, &task)
            .join();
        let mut processed = task.processed.into_inner();
        processed.sort_unstable();
        assert_eq!(processed, (0..100).collect::<Vec<_>>());
        assert!(task.participants.lock().len() <= 4);
    }

    #[test]
    fn test_serial_runtime_uses_joining_thread() {
        let task = CountingTask {
            items: WorkItems::new(vec![1, 2, 3]),
            processed: Mutex::new(Vec::new()),
            participants: Mutex::new(HashSet::new()),
        };
        JobRuntime::new(0)
            .create_job(TaskPriority::UserBlocking, &task)
            .join();
        assert_eq!(task.processed.lock().len(), 3);
        assert_eq!(task.participants.lock().iter().copied().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_index_generator_covers_range() {
        let generator = IndexGenerator::new(7);
        let mut seen = Vec::new();
        while let Some(index) = generator.next_index() {
            seen.push(index);
        }
        assert_eq!(seen[0], 0);
        seen.sort_unstable();
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_work_item_claimed_once() {
        let item = ParallelWorkItem::default();
        assert!(item.try_acquire());
        assert!(!item.try_acquire());
        assert!(item.is_acquired());
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn test_panics_propagate_to_joiner() {
        struct Panicking;
        impl JobTask for Panicking {
            fn run(&self, delegate: &JobDelegate) {
                if !delegate.is_joining_thread() {
                    panic!("boom");
                }
            }
            fn max_concurrency(&self, _worker_count: usize) -> usize {
                2
            }
        }
        JobRuntime::new(1)
            .create_job(TaskPriority::UserBlocking, &Panicking)
            .join();
    }
}
