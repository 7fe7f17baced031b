//! Root slots.
//!
//! Roots are the slots outside the heap through which the mutator reaches
//! objects: handles held by native code, global handles (strong or weak),
//! the slots of interpreter and optimized stack frames, and raw words of a
//! conservatively scanned stack.

use bitflags::bitflags;
use core_types::{Address, Tagged};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A slot outside the heap holding a tagged value.
pub struct RootSlot(AtomicU64);

impl RootSlot {
    /// Creates a slot holding `value`.
    pub fn new(value: Tagged) -> Self {
        RootSlot(AtomicU64::new(value.raw()))
    }

    /// Reads the slot.
    pub fn get(&self) -> Tagged {
        Tagged::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Writes the slot.
    pub fn set(&self, value: Tagged) {
        self.0.store(value.raw(), Ordering::Release);
    }
}

impl fmt::Debug for RootSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RootSlot({:?})", self.get())
    }
}

/// A handle keeps its target alive and follows it when it moves.
///
/// The root table drops a handle once every clone outside of it is gone.
#[derive(Clone, Debug)]
pub struct Handle(Arc<RootSlot>);

impl Handle {
    /// Current value.
    pub fn get(&self) -> Tagged {
        self.0.get()
    }

    /// Current target address, if the value is a reference.
    pub fn address(&self) -> Option<Address> {
        self.0.get().heap_object()
    }

    /// Replaces the value.
    pub fn set(&self, value: Tagged) {
        self.0.set(value);
    }
}

/// Root categories reported to visitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Root {
    /// Embedder-registered strong roots
    StrongRoots,
    /// Local handles
    Handles,
    /// Strong global handles
    GlobalHandles,
    /// Weak global handles
    WeakGlobalHandles,
    /// Slots of a stack frame
    StackFrame,
    /// Entries of the string table
    StringTable,
    /// Maps kept alive for a few collections
    RetainedMaps,
    /// Registries waiting for their cleanup task
    FinalizationRegistries,
    /// Roots of a client heap visited by the shared-region owner
    ClientHeap,
}

bitflags! {
    /// Root categories a visitor wants skipped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SkipRoot: u32 {
        /// Weak global handles
        const WEAK = 1 << 0;
        /// Stack frames
        const STACK = 1 << 1;
    }
}

/// Receives root slots.
pub trait RootVisitor {
    /// Visits one root slot.
    fn visit_root(&mut self, root: Root, slot: &RootSlot);
}

/// Kind of a stack frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Runtime or builtin frame
    Native,
    /// Interpreter frame
    Interpreted,
    /// Frame of optimized code
    Optimized,
}

/// One frame of the mutator stack.
#[derive(Debug)]
pub struct StackFrame {
    /// Frame kind
    pub kind: FrameKind,
    /// Code object executing in the frame
    pub code: RootSlot,
    /// Tagged locals
    pub locals: Vec<RootSlot>,
    /// The frame's return address is a deoptimization point
    pub can_deopt_at_pc: bool,
}

impl StackFrame {
    /// Creates a frame running `code` with the given locals.
    pub fn new(kind: FrameKind, code: Tagged, locals: &[Tagged], can_deopt_at_pc: bool) -> Self {
        StackFrame {
            kind,
            code: RootSlot::new(code),
            locals: locals.iter().map(|&v| RootSlot::new(v)).collect(),
            can_deopt_at_pc,
        }
    }
}

/// Root table of one heap.
#[derive(Default)]
pub struct Roots {
    strong: RwLock<Vec<Arc<RootSlot>>>,
    handles: RwLock<Vec<Arc<RootSlot>>>,
    global_handles: RwLock<Vec<Arc<RootSlot>>>,
    weak_global_handles: RwLock<Vec<Arc<RootSlot>>>,
    frames: RwLock<Vec<StackFrame>>,
    conservative_stack: RwLock<Vec<usize>>,
}

impl Roots {
    /// Creates an empty root table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a permanent strong root.
    pub fn add_strong_root(&self, value: Tagged) -> Handle {
        let slot = Arc::new(RootSlot::new(value));
        self.strong.write().push(Arc::clone(&slot));
        Handle(slot)
    }

    /// Creates a local handle.
    pub fn new_handle(&self, value: Tagged) -> Handle {
        let slot = Arc::new(RootSlot::new(value));
        self.handles.write().push(Arc::clone(&slot));
        Handle(slot)
    }

    /// Creates a strong global handle.
    pub fn new_global_handle(&self, value: Tagged) -> Handle {
        let slot = Arc::new(RootSlot::new(value));
        self.global_handles.write().push(Arc::clone(&slot));
        Handle(slot)
    }

    /// Creates a weak global handle, reset to `undefined` when its target dies.
    pub fn new_weak_global_handle(&self, value: Tagged) -> Handle {
        let slot = Arc::new(RootSlot::new(value));
        self.weak_global_handles.write().push(Arc::clone(&slot));
        Handle(slot)
    }

    /// Drops handles nobody holds anymore.
    pub fn prune_dead_handles(&self) -> usize {
        let mut pruned = 0;
        for list in [&self.handles, &self.global_handles, &self.weak_global_handles] {
            let mut list = list.write();
            let before = list.len();
            list.retain(|slot| Arc::strong_count(slot) > 1);
            pruned += before - list.len();
        }
        pruned
    }

    /// Pushes a frame on the mutator stack.
    pub fn push_frame(&self, frame: StackFrame) {
        self.frames.write().push(frame);
    }

    /// Pops the top frame.
    pub fn pop_frame(&self) -> Option<StackFrame> {
        self.frames.write().pop()
    }

    /// Reads local `index` of the frame `depth` frames below the top.
    pub fn frame_local(&self, depth: usize, index: usize) -> Option<Tagged> {
        let frames = self.frames.read();
        let frame = frames.iter().rev().nth(depth)?;
        frame.locals.get(index).map(RootSlot::get)
    }

    /// Code of the frame `depth` frames below the top.
    pub fn frame_code(&self, depth: usize) -> Option<Tagged> {
        let frames = self.frames.read();
        frames.iter().rev().nth(depth).map(|frame| frame.code.get())
    }

    /// Code of the topmost optimized frame, if that frame cannot be
    /// deoptimized at its current return address.
    ///
    /// The walk stops at the first interpreted frame.
    pub fn top_optimized_code_without_deopt(&self) -> Option<Address> {
        let frames = self.frames.read();
        for frame in frames.iter().rev() {
            match frame.kind {
                FrameKind::Interpreted => return None,
                FrameKind::Optimized => {
                    if frame.can_deopt_at_pc {
                        return None;
                    }
                    return frame.code.get().strong_ref();
                }
                FrameKind::Native => continue,
            }
        }
        None
    }

    /// Replaces the words of the conservatively scanned stack.
    pub fn set_conservative_stack(&self, words: Vec<usize>) {
        *self.conservative_stack.write() = words;
    }

    /// Words of the conservatively scanned stack.
    pub fn conservative_stack(&self) -> Vec<usize> {
        self.conservative_stack.read().clone()
    }

    /// Returns true when a conservative stack must be considered.
    pub fn has_conservative_stack(&self) -> bool {
        !self.conservative_stack.read().is_empty()
    }

    /// Visits every precise root not excluded by `skip`.
    pub fn iterate(&self, skip: SkipRoot, visitor: &mut dyn RootVisitor) {
        for slot in self.strong.read().iter() {
            visitor.visit_root(Root::StrongRoots, slot);
        }
        for slot in self.handles.read().iter() {
            visitor.visit_root(Root::Handles, slot);
        }
        for slot in self.global_handles.read().iter() {
            visitor.visit_root(Root::GlobalHandles, slot);
        }
        if !skip.contains(SkipRoot::WEAK) {
            self.iterate_weak_global_handles(visitor);
        }
        if !skip.contains(SkipRoot::STACK) {
            for frame in self.frames.read().iter() {
                visitor.visit_root(Root::StackFrame, &frame.code);
                for local in &frame.locals {
                    visitor.visit_root(Root::StackFrame, local);
                }
            }
        }
    }

    /// Visits only the weak global handles.
    pub fn iterate_weak_global_handles(&self, visitor: &mut dyn RootVisitor) {
        for slot in self.weak_global_handles.read().iter() {
            visitor.visit_root(Root::WeakGlobalHandles, slot);
        }
    }
}
