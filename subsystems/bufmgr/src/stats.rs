//! Manager counters.

use core::sync::atomic::{AtomicU64, Ordering};

/// Manager statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Buffers allocated by the manager, including kernel buffers and regions
    pub allocations: u64,
    /// Imports that created a slot
    pub imports: u64,
    /// Imports coalesced onto an existing slot
    pub dedup_hits: u64,
    /// Slots torn down by the last reference going away
    pub teardowns: u64,
    /// Slots reclaimed by the shutdown sweep
    pub leaks_reclaimed: u64,
    /// Multi-context maps that failed and were rolled back
    pub map_failures: u64,
    /// Releases and puts refused as unbalanced
    pub unbalanced_releases: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub(crate) allocations: AtomicU64,
    pub(crate) imports: AtomicU64,
    pub(crate) dedup_hits: AtomicU64,
    pub(crate) teardowns: AtomicU64,
    pub(crate) leaks_reclaimed: AtomicU64,
    pub(crate) map_failures: AtomicU64,
    pub(crate) unbalanced_releases: AtomicU64,
}

impl StatCounters {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ManagerStats {
        ManagerStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            imports: self.imports.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            teardowns: self.teardowns.load(Ordering::Relaxed),
            leaks_reclaimed: self.leaks_reclaimed.load(Ordering::Relaxed),
            map_failures: self.map_failures.load(Ordering::Relaxed),
            unbalanced_releases: self.unbalanced_releases.load(Ordering::Relaxed),
        }
    }
}
