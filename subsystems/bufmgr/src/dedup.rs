//! # Dedup Index
//!
//! Maps backing-object identity to the slot holding it, so two imports of
//! the same object share one slot and one set of mappings.
//!
//! Guarded by the table lock. A hit only names a candidate slot; the caller
//! must re-check the slot under its own lock, since it may have been torn
//! down in between.

use hashbrown::HashMap;

use crate::backend::Identity;

/// Identity to slot index map
#[derive(Debug, Default)]
pub struct DedupIndex {
    entries: HashMap<Identity, usize>,
}

impl DedupIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Create an index sized for `capacity` slots
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// Slot currently recorded for `identity`
    #[inline]
    pub fn find(&self, identity: Identity) -> Option<usize> {
        self.entries.get(&identity).copied()
    }

    /// Record `identity` at `index` unless it is already recorded
    ///
    /// Returns false if another slot already owns the identity.
    pub fn insert(&mut self, identity: Identity, index: usize) -> bool {
        match self.entries.get(&identity) {
            Some(&existing) => existing == index,
            None => {
                self.entries.insert(identity, index);
                true
            }
        }
    }

    /// Forget `identity` if it is recorded at `index`
    pub fn remove(&mut self, identity: Identity, index: usize) -> bool {
        if self.find(identity) == Some(index) {
            self.entries.remove(&identity);
            true
        } else {
            false
        }
    }

    /// Number of recorded identities
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the index empty?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_find() {
        let mut index = DedupIndex::new();
        assert!(index.insert(Identity(7), 3));
        assert_eq!(index.find(Identity(7)), Some(3));
        assert_eq!(index.find(Identity(8)), None);
    }

    #[test]
    fn test_insert_keeps_first_owner() {
        let mut index = DedupIndex::with_capacity(4);
        assert!(index.insert(Identity(7), 3));
        assert!(index.insert(Identity(7), 3));
        assert!(!index.insert(Identity(7), 4));
        assert_eq!(index.find(Identity(7)), Some(3));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_checks_owner() {
        let mut index = DedupIndex::new();
        index.insert(Identity(1), 2);
        assert!(!index.remove(Identity(1), 5));
        assert_eq!(index.find(Identity(1)), Some(2));
        assert!(index.remove(Identity(1), 2));
        assert!(index.is_empty());
    }
}
