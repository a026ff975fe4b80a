//! # Helix Buffer Manager
//!
//! Handle table for shared DMA buffers mapped into hardware translation
//! contexts (IOMMU/SMMU domains) on behalf of several client drivers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         BufferManager                           │
//! │   allocate / import / get+put kernel ptr / release / regions    │
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────────────┐  │
//! │  │  SlotTable   │  │ LeaseCounts  │  │    MappingEngine      │  │
//! │  │ bitmap+slots │  │ kernel/user  │  │ contexts, kernel view │  │
//! │  └──────┬───────┘  └──────────────┘  └───────────┬───────────┘  │
//! │         │                                        │              │
//! │  ┌──────┴───────┐  ┌──────────────┐              │              │
//! │  │  DedupIndex  │  │ BufferHandle │              │              │
//! │  └──────────────┘  └──────────────┘              │              │
//! └──────────────────────────────────────────────────┼──────────────┘
//!                                                    │
//!        BufferAllocator   ContextMapper   RemoteMapper   Clock
//! ```
//!
//! ## Lifetime Rules
//!
//! A slot lives while anyone holds interest in it. Users hold references
//! (create, import, release); the kernel holds leases (get/put kernel
//! pointer). Buffers created with kernel access also keep a creation-time
//! kernel reference, so they are torn down once the user side is gone and
//! no lease is outstanding. Teardown happens at most once, under the slot's
//! lock, by whichever caller dropped the last reference.
//!
//! `shutdown_sweep` reclaims whatever is still live when the subsystem goes
//! away and logs each buffer as a leak.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod backend;
pub mod config;
pub mod dedup;
pub mod error;
pub mod flags;
pub mod handle;
pub mod lease;
pub mod manager;
pub mod mapping;
pub mod slot;
pub mod stats;
pub mod table;

#[cfg(test)]
mod mock;

/// Maximum hardware contexts one buffer can be mapped into
pub const MAX_CONTEXTS: usize = 16;

// Re-exports
pub use backend::{
    BackingBuffer, Backends, BufferAllocator, Clock, ContextId, ContextMapper, Descriptor,
    DeviceMapping, Identity, KernelView, MapRequest, NullClock, RemoteMapper,
};
pub use config::TableConfig;
pub use error::{AllocError, Error, MapError, Result};
pub use flags::{AccessMode, BufferFlags, CacheOp, MappingClient, MemRegion, RegionKind};
pub use handle::BufferHandle;
pub use lease::{Disposition, LeaseCounts, LeasePolicy};
pub use manager::{BufferManager, DeviceAddress, KernelBuffer, KernelLease, RegionBuffer};
pub use slot::SlotInfo;
pub use stats::ManagerStats;
