use std::collections::BTreeMap;
use shared::types::{DedupKey, ServiceEntry};

/// Discovered entries of one browser, one per dedup key.
///
/// Only touched from the driver task, so no locking.
#[derive(Debug, Default)]
pub struct EntryTable {
    entries: BTreeMap<DedupKey, ServiceEntry>,
}

impl EntryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false, leaving the stored entry alone, if `key` is taken.
    pub fn insert_if_absent(&mut self, key: DedupKey, entry: ServiceEntry) -> bool {
        use std::collections::btree_map::Entry;

        match self.entries.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn remove(&mut self, key: &DedupKey) -> Option<ServiceEntry> {
        self.entries.remove(key)
    }

    /// Entries ordered by key.
    pub fn snapshot(&self) -> Vec<ServiceEntry> {
        self.entries.values().cloned().collect()
    }

    /// Empty the table, handing back what it held.
    pub fn drain(&mut self) -> Vec<ServiceEntry> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
