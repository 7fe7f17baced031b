//! Weak table of internalized strings.

use core_types::{Address, Tagged};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Maps string contents to the internalized string object.
///
/// Entries are weak: the collector drops entries whose string died and
/// rewrites entries whose string moved.
#[derive(Default)]
pub struct StringTable {
    entries: Mutex<HashMap<String, Tagged>>,
}

impl StringTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Internalized string for `contents`, if present.
    pub fn lookup(&self, contents: &str) -> Option<Address> {
        self.entries.lock().get(contents).and_then(|t| t.weak_ref())
    }

    /// Adds or replaces the entry for `contents`.
    pub fn insert(&self, contents: &str, string: Address) {
        self.entries
            .lock()
            .insert(contents.to_owned(), Tagged::weak(string));
    }

    /// Drops entries for which `is_live` returns false. Returns the number dropped.
    pub fn retain_live(&self, mut is_live: impl FnMut(Address) -> bool) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.weak_ref().is_some_and(&mut is_live));
        before - entries.len()
    }

    /// Rewrites entries through `forward`, which maps an address to its new location.
    pub fn update(&self, mut forward: impl FnMut(Address) -> Option<Address>) {
        for entry in self.entries.lock().values_mut() {
            if let Some(target) = entry.weak_ref().and_then(&mut forward) {
                *entry = Tagged::weak(target);
            }
        }
    }

    /// Addresses of all entries.
    pub fn strings(&self) -> Vec<Address> {
        self.entries
            .lock()
            .values()
            .filter_map(|t| t.weak_ref())
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
