//! # Lease Accounting
//!
//! Per-slot reference counts and the rule deciding when a slot's mappings
//! must be torn down.
//!
//! A slot carries two kinds of interest:
//!
//! - **user references**, one per successful create or import, dropped by
//!   `release`;
//! - **kernel leases**, one per outstanding `get_kernel_pointer`, dropped by
//!   `put_kernel_pointer`.
//!
//! Buffers with kernel access also hold a creation-time kernel reference,
//! the *anchor*. The externally visible kernel refcount is therefore
//! `leases + anchor`, which starts at 1 for kernel-accessible buffers.
//!
//! | Policy       | Initial (k, u) | Tears down when                 |
//! |--------------|----------------|---------------------------------|
//! | `UserOnly`   | (0, 1)         | `u == 0`                        |
//! | `Shared`     | (1, 1)         | `k == 1 && u == 0`              |
//! | `KernelOnly` | (1, 0)         | anchor dropped and no leases    |
//!
//! Every decrement returns a [`Disposition`]. The caller holds the slot lock
//! across the decrement and the teardown it may demand, so at most one
//! caller ever sees [`Disposition::Teardown`] for a given slot lifetime.

use crate::error::{Error, Result};
use crate::flags::BufferFlags;

/// Teardown rule for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeasePolicy {
    /// No kernel access; the user side alone decides
    UserOnly,
    /// Kernel access; both sides must let go
    Shared,
    /// Kernel-owned; torn down when the kernel drops its anchor
    KernelOnly,
}

impl LeasePolicy {
    /// Policy for a user-requested buffer with the given flags
    #[inline]
    pub fn for_flags(flags: BufferFlags) -> Self {
        if flags.contains(BufferFlags::KERNEL_ACCESS) {
            Self::Shared
        } else {
            Self::UserOnly
        }
    }
}

/// Outcome of dropping a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Disposition {
    /// Other references remain
    Retain,
    /// Last reference gone; unmap and free the slot now
    Teardown,
}

/// Reference counts of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseCounts {
    policy: LeasePolicy,
    leases: u32,
    user: u32,
    anchored: bool,
}

impl LeaseCounts {
    /// Counts for a slot that is not in use
    pub const IDLE: Self = Self {
        policy: LeasePolicy::UserOnly,
        leases: 0,
        user: 0,
        anchored: false,
    };

    /// Initial counts for a freshly created slot
    pub const fn new(policy: LeasePolicy) -> Self {
        let (user, anchored) = match policy {
            LeasePolicy::UserOnly => (1, false),
            LeasePolicy::Shared => (1, true),
            LeasePolicy::KernelOnly => (0, true),
        };
        Self {
            policy,
            leases: 0,
            user,
            anchored,
        }
    }

    /// Get policy
    #[inline]
    pub fn policy(&self) -> LeasePolicy {
        self.policy
    }

    /// Kernel-side reference count, including the creation anchor
    #[inline]
    pub fn kernel_refcount(&self) -> u32 {
        self.leases + u32::from(self.anchored)
    }

    /// User-side reference count
    #[inline]
    pub fn user_refcount(&self) -> u32 {
        self.user
    }

    /// Outstanding kernel leases, excluding the anchor
    #[inline]
    pub fn outstanding_leases(&self) -> u32 {
        self.leases
    }

    /// Take another user reference (dedup hit on import)
    #[inline]
    pub fn acquire_user(&mut self) {
        self.user = self.user.saturating_add(1);
    }

    /// Take a kernel lease
    #[inline]
    pub fn acquire_kernel(&mut self) {
        self.leases = self.leases.saturating_add(1);
    }

    /// Drop a kernel lease
    pub fn put_kernel(&mut self) -> Result<Disposition> {
        if self.leases == 0 {
            return Err(Error::UnbalancedRelease);
        }
        self.leases -= 1;
        Ok(self.settle())
    }

    /// Drop a user reference
    pub fn release_user(&mut self) -> Result<Disposition> {
        if self.user == 0 {
            return Err(Error::UnbalancedRelease);
        }
        self.user -= 1;
        Ok(self.settle())
    }

    /// Drop the kernel anchor of a kernel-owned slot
    pub fn drop_anchor(&mut self) -> Result<Disposition> {
        if self.policy != LeasePolicy::KernelOnly || !self.anchored {
            return Err(Error::UnbalancedRelease);
        }
        self.anchored = false;
        Ok(self.settle())
    }

    fn settle(&self) -> Disposition {
        let idle = self.leases == 0 && self.user == 0;
        let held = self.policy == LeasePolicy::KernelOnly && self.anchored;
        if idle && !held {
            Disposition::Teardown
        } else {
            Disposition::Retain
        }
    }
}

impl Default for LeaseCounts {
    fn default() -> Self {
        Self::IDLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_counts() {
        let user = LeaseCounts::new(LeasePolicy::UserOnly);
        assert_eq!((user.kernel_refcount(), user.user_refcount()), (0, 1));

        let shared = LeaseCounts::new(LeasePolicy::Shared);
        assert_eq!((shared.kernel_refcount(), shared.user_refcount()), (1, 1));

        let kernel = LeaseCounts::new(LeasePolicy::KernelOnly);
        assert_eq!((kernel.kernel_refcount(), kernel.user_refcount()), (1, 0));
    }

    #[test]
    fn test_user_only_release() {
        let mut counts = LeaseCounts::new(LeasePolicy::UserOnly);
        counts.acquire_user();
        assert_eq!(counts.release_user(), Ok(Disposition::Retain));
        assert_eq!(counts.release_user(), Ok(Disposition::Teardown));
        assert_eq!(counts.release_user(), Err(Error::UnbalancedRelease));
    }

    #[test]
    fn test_shared_waits_for_kernel() {
        let mut counts = LeaseCounts::new(LeasePolicy::Shared);
        counts.acquire_kernel();
        assert_eq!(counts.kernel_refcount(), 2);

        assert_eq!(counts.release_user(), Ok(Disposition::Retain));
        assert_eq!(counts.put_kernel(), Ok(Disposition::Teardown));
        assert_eq!(counts.kernel_refcount(), 1);
    }

    #[test]
    fn test_shared_put_before_release() {
        let mut counts = LeaseCounts::new(LeasePolicy::Shared);
        counts.acquire_kernel();
        assert_eq!(counts.put_kernel(), Ok(Disposition::Retain));
        assert_eq!(counts.release_user(), Ok(Disposition::Teardown));
    }

    #[test]
    fn test_unbalanced_put_keeps_counts() {
        let mut counts = LeaseCounts::new(LeasePolicy::Shared);
        assert_eq!(counts.put_kernel(), Err(Error::UnbalancedRelease));
        assert_eq!(counts, LeaseCounts::new(LeasePolicy::Shared));
    }

    #[test]
    fn test_kernel_only_anchor() {
        let mut counts = LeaseCounts::new(LeasePolicy::KernelOnly);
        assert_eq!(counts.release_user(), Err(Error::UnbalancedRelease));

        counts.acquire_kernel();
        assert_eq!(counts.drop_anchor(), Ok(Disposition::Retain));
        assert_eq!(counts.drop_anchor(), Err(Error::UnbalancedRelease));
        assert_eq!(counts.put_kernel(), Ok(Disposition::Teardown));
    }

    #[test]
    fn test_anchor_only_for_kernel_policy() {
        let mut counts = LeaseCounts::new(LeasePolicy::Shared);
        assert_eq!(counts.drop_anchor(), Err(Error::UnbalancedRelease));
    }

    #[test]
    fn test_policy_for_flags() {
        assert_eq!(LeasePolicy::for_flags(BufferFlags::HW_READ_WRITE), LeasePolicy::UserOnly);
        assert_eq!(
            LeasePolicy::for_flags(BufferFlags::HW_READ_WRITE | BufferFlags::KERNEL_ACCESS),
            LeasePolicy::Shared
        );
    }
}
