//! Narrow interfaces through which the collector talks to the embedder.

use crate::object::ObjectKind;
use core_types::Address;

/// Deoptimizes code objects whose embedded objects died.
pub trait DeoptimizationHandler: Send + Sync {
    /// Called once per cycle with every code object marked for deoptimization.
    fn deoptimize_marked_code(&self, code: &[Address]);
}

/// Observes object moves, e.g. for a heap profiler.
pub trait MigrationObserver: Send + Sync {
    /// Called while an object is copied from `source` to `target`.
    fn move_event(&self, kind: ObjectKind, source: Address, target: Address, size: usize);
}

/// Collects per-category statistics of live objects after marking.
pub trait ObjectStatsCollector: Send + Sync {
    /// Reports one live object.
    fn record_object(&self, kind: ObjectKind, size: usize);
}

/// Last chance to report an unrecoverable out-of-memory condition.
///
/// The process aborts once the handler returns.
pub trait FatalErrorHandler: Send + Sync {
    /// Reports an out-of-memory condition at `location`.
    fn fatal_out_of_memory(&self, location: &str);
}
