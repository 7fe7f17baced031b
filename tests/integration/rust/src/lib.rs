//! Integration test suite for the mark-compact collector
//!
//! This crate runs full collection cycles across component boundaries:
//! heap construction and mutation from `core_types` words, and the
//! collector phases of `mark_compact`.

/// Re-export components for test convenience
pub mod components {
    pub use core_types;
    pub use mark_compact;
}
