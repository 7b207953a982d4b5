use std::sync::{Mutex, MutexGuard, PoisonError};

use peerdrop_core::offer::{OfferDescriptor, RegistryEntry};
use peerdrop_core::transport::PeerId;

use crate::error::IndexOutOfRange;

/// An append-only, index-stable log of discovered offers.
///
/// Implementations must serialise `append` against every other call so that
/// indices are handed out exactly once, in completion order.
pub trait OfferLog: Send + Sync + 'static {
    /// Stores `offer` and returns the index it was assigned, which equals
    /// the number of entries held just before the call.
    fn append(&self, offer: OfferDescriptor, origin: PeerId) -> usize;

    /// Returns the entry at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexOutOfRange`] when `index >= self.len()`.
    fn get(&self, index: usize) -> Result<RegistryEntry, IndexOutOfRange>;

    /// Number of entries appended so far.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every entry, in index order.
    fn snapshot(&self) -> Vec<RegistryEntry>;
}

/// The process-wide [`OfferLog`], a `Vec` behind a single mutex.
#[derive(Debug, Default)]
pub struct OfferRegistry {
    entries: Mutex<Vec<RegistryEntry>>,
}

impl OfferRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // Entries are never left half-written, so a poisoned lock is still
    // consistent.
    fn lock(&self) -> MutexGuard<'_, Vec<RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OfferLog for OfferRegistry {
    fn append(&self, offer: OfferDescriptor, origin: PeerId) -> usize {
        let mut entries = self.lock();
        let index = entries.len();
        entries.push(RegistryEntry {
            index,
            offer,
            origin,
        });
        index
    }

    fn get(&self, index: usize) -> Result<RegistryEntry, IndexOutOfRange> {
        let entries = self.lock();
        entries.get(index).cloned().ok_or(IndexOutOfRange {
            index,
            len: entries.len(),
        })
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn snapshot(&self) -> Vec<RegistryEntry> {
        self.lock().clone()
    }
}
