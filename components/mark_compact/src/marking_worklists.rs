//! Work queues of the marker.
//!
//! Objects that are marked but not yet visited sit in a worklist. Every
//! marking thread owns a [`LocalMarkingWorklists`] backed by a
//! work-stealing deque and exchanges work with the others through the
//! global [`MarkingWorklists`] injector.
//!
//! A separate on-hold queue parks objects whose fields cannot be read yet;
//! they are merged back before the final drain.
//!
//! When per-context accounting is enabled, each entry carries the native
//! context it was discovered from. This only affects
//! [`NativeContextStats`], never liveness.

use core_types::Address;
use crossbeam_deque::{Injector, Steal, Worker};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Identifier of a native context; 0 stands for "unattributed".
pub type ContextId = u64;

/// Context of objects that are not attributed to any native context.
pub const SHARED_CONTEXT: ContextId = 0;

const SHARE_WORK_THRESHOLD: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Entry {
    object: Address,
    context: ContextId,
}

/// Global, thread-safe part of the marking worklists.
#[derive(Default)]
pub struct MarkingWorklists {
    shared: Injector<Entry>,
    on_hold: Injector<Entry>,
    published: AtomicUsize,
}

impl MarkingWorklists {
    /// Creates empty worklists.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes an object to the global queue from any thread.
    pub fn push_global(&self, object: Address) {
        self.shared.push(Entry {
            object,
            context: SHARED_CONTEXT,
        });
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true if the global queue holds no work.
    pub fn is_global_empty(&self) -> bool {
        self.shared.is_empty()
    }

    /// Returns true if neither the global nor the on-hold queue holds work.
    pub fn is_empty(&self) -> bool {
        self.shared.is_empty() && self.on_hold.is_empty()
    }

    /// Number of entries published to the global queue so far.
    pub fn published(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }

    /// Drops all pending work.
    pub fn clear(&self) {
        while steal(&self.shared).is_some() {}
        while steal(&self.on_hold).is_some() {}
    }

    fn push_entry(&self, entry: Entry) {
        self.shared.push(entry);
        self.published.fetch_add(1, Ordering::Relaxed);
    }
}

fn steal(injector: &Injector<Entry>) -> Option<Entry> {
    loop {
        match injector.steal() {
            Steal::Success(entry) => return Some(entry),
            Steal::Empty => return None,
            Steal::Retry => continue,
        }
    }
}

/// Per-thread view of the marking worklists.
pub struct LocalMarkingWorklists {
    global: Arc<MarkingWorklists>,
    local: Worker<Entry>,
    context: ContextId,
    track_contexts: bool,
}

impl LocalMarkingWorklists {
    /// Creates a local view of `global`.
    pub fn new(global: Arc<MarkingWorklists>, track_contexts: bool) -> Self {
        LocalMarkingWorklists {
            global,
            local: Worker::new_lifo(),
            context: SHARED_CONTEXT,
            track_contexts,
        }
    }

    /// The global worklists.
    pub fn global(&self) -> &Arc<MarkingWorklists> {
        &self.global
    }

    /// Pushes an object for visitation.
    pub fn push(&mut self, object: Address) {
        self.local.push(Entry {
            object,
            context: self.context,
        });
    }

    /// Pops an object, stealing from the global queue when the local deque
    /// runs dry.
    pub fn pop(&mut self) -> Option<Address> {
        let entry = match self.local.pop() {
            Some(entry) => Some(entry),
            None => loop {
                match self.global.shared.steal_batch_and_pop(&self.local) {
                    Steal::Success(entry) => break Some(entry),
                    Steal::Empty => break None,
                    Steal::Retry => continue,
                }
            },
        }?;
        if self.track_contexts {
            self.context = entry.context;
        }
        Some(entry.object)
    }

    /// Parks an object whose fields cannot be visited yet.
    pub fn push_on_hold(&mut self, object: Address) {
        self.global.on_hold.push(Entry {
            object,
            context: self.context,
        });
    }

    /// Pops a parked object.
    pub fn pop_on_hold(&mut self) -> Option<Address> {
        steal(&self.global.on_hold).map(|entry| entry.object)
    }

    /// Moves all parked objects back to the regular queue.
    pub fn merge_on_hold(&mut self) {
        while let Some(entry) = steal(&self.global.on_hold) {
            self.local.push(entry);
        }
    }

    /// Moves every local entry to the global queue.
    pub fn publish(&mut self) {
        while let Some(entry) = self.local.pop() {
            self.global.push_entry(entry);
        }
    }

    /// Gives half of the local entries away if the global queue is empty.
    pub fn share_work(&mut self) {
        let local_len = self.local.len();
        if local_len < SHARE_WORK_THRESHOLD || !self.global.is_global_empty() {
            return;
        }
        for _ in 0..local_len / 2 {
            match self.local.pop() {
                Some(entry) => self.global.push_entry(entry),
                None => break,
            }
        }
    }

    /// Returns true if the local deque is empty.
    pub fn is_local_empty(&self) -> bool {
        self.local.is_empty()
    }

    /// Returns true if there is no work locally or globally.
    ///
    /// Termination checks must use this, not [`Self::is_local_empty`].
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.global.is_global_empty()
    }

    /// Context the next pushes are attributed to.
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Switches the context new pushes are attributed to.
    pub fn switch_to_context(&mut self, context: ContextId) {
        if self.track_contexts {
            self.context = context;
        }
    }

    /// Returns true when entries carry their native context.
    pub fn tracks_contexts(&self) -> bool {
        self.track_contexts
    }
}

/// Bytes of visited objects per native context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeContextStats {
    bytes: HashMap<ContextId, usize>,
}

impl NativeContextStats {
    /// Creates empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts `size` bytes to `context`.
    pub fn increment(&mut self, context: ContextId, size: usize) {
        *self.bytes.entry(context).or_default() += size;
    }

    /// Adds the counts of `other`.
    pub fn merge(&mut self, other: &NativeContextStats) {
        for (&context, &size) in &other.bytes {
            self.increment(context, size);
        }
    }

    /// Bytes accounted to `context`.
    pub fn bytes(&self, context: ContextId) -> usize {
        self.bytes.get(&context).copied().unwrap_or(0)
    }

    /// Total bytes accounted.
    pub fn total(&self) -> usize {
        self.bytes.values().sum()
    }

    /// Returns true if nothing was accounted.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Drops all counts.
    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Iterates over `(context, bytes)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (ContextId, usize)> + '_ {
        self.bytes.iter().map(|(&c, &b)| (c, b))
    }
}
