//! Global safepoint over the heaps attached to a shared region.
//!
//! Every heap has a mutator lock. Mutator threads hold it shared while they
//! touch the heap; a collector takes it exclusively. Entering the global
//! safepoint takes the exclusive lock of every registered client, so while
//! a [`GlobalSafepointScope`] is alive no client mutator runs.

use crate::heap::Heap;
use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{Mutex, RawRwLock};
use std::sync::{Arc, Weak};

/// Registry of client heaps.
#[derive(Default)]
pub struct GlobalSafepoint {
    clients: Mutex<Vec<Weak<Heap>>>,
}

impl GlobalSafepoint {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client heap.
    pub fn register_client(&self, client: &Arc<Heap>) {
        self.clients.lock().push(Arc::downgrade(client));
    }

    /// Live client heaps in registration order.
    pub fn clients(&self) -> Vec<Arc<Heap>> {
        let mut clients = self.clients.lock();
        clients.retain(|c| c.strong_count() > 0);
        clients.iter().filter_map(Weak::upgrade).collect()
    }

    /// Number of live clients.
    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    /// Pauses every client mutator until the returned scope is dropped.
    pub fn enter(&self) -> GlobalSafepointScope {
        let clients = self.clients();
        let guards = clients.iter().map(|c| c.mutator_lock().write_arc()).collect();
        log::trace!("entered global safepoint with {} clients", clients.len());
        GlobalSafepointScope {
            clients,
            _guards: guards,
        }
    }
}

/// Proof that all client mutators are paused.
pub struct GlobalSafepointScope {
    clients: Vec<Arc<Heap>>,
    _guards: Vec<ArcRwLockWriteGuard<RawRwLock, ()>>,
}

impl GlobalSafepointScope {
    /// Calls `f` once per paused client.
    pub fn iterate_clients(&self, mut f: impl FnMut(&Heap)) {
        for client in &self.clients {
            f(client);
        }
    }

    /// Paused clients.
    pub fn clients(&self) -> &[Arc<Heap>] {
        &self.clients
    }
}
