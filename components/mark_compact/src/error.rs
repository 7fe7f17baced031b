//! Error types for heap and collector operations.
//!
//! Only recoverable conditions are represented here. Out-of-memory during a
//! mandatory promotion is fatal and goes through
//! [`Heap::fatal_process_out_of_memory`](crate::Heap::fatal_process_out_of_memory)
//! instead.

use crate::space::SpaceKind;
use core_types::Address;
use thiserror::Error;

/// Errors reported by the heap and the collector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GcError {
    /// The space could not provide `size` bytes.
    #[error("out of memory: cannot allocate {size} bytes in {space:?} space")]
    OutOfMemory {
        /// Space that was asked for memory
        space: SpaceKind,
        /// Requested size in bytes
        size: usize,
    },

    /// The object does not fit on a single page.
    #[error("object of {size} bytes exceeds the page area of {max} bytes")]
    ObjectTooLarge {
        /// Requested size in bytes
        size: usize,
        /// Largest supported object size
        max: usize,
    },

    /// No live object starts at the address.
    #[error("no object at address {0}")]
    InvalidAddress(Address),

    /// A field index outside the object's field range.
    #[error("field {index} out of bounds for object {object} with {len} fields")]
    FieldOutOfBounds {
        /// Object address
        object: Address,
        /// Requested field
        index: usize,
        /// Number of fields
        len: usize,
    },

    /// The object has the wrong category for the operation.
    #[error("object {object} is a {actual}, expected {expected}")]
    WrongKind {
        /// Object address
        object: Address,
        /// Expected category name
        expected: &'static str,
        /// Actual category name
        actual: &'static str,
    },

    /// A collector step was called out of order.
    #[error("collector is in state {actual}, expected {expected}")]
    InvalidState {
        /// State required by the step
        expected: &'static str,
        /// Current state
        actual: &'static str,
    },

    /// The operation needs a shared-region owner heap.
    #[error("heap is not a shared-region owner")]
    NotSharedOwner,
}

/// Result alias used across the crate.
pub type GcResult<T> = Result<T, GcError>;
