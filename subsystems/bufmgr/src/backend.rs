//! # Collaborator Interfaces
//!
//! The buffer manager does not allocate memory or program page tables
//! itself. It drives three collaborators:
//!
//! ```text
//! BufferManager
//!    │
//!    ├── BufferAllocator  (backing objects, kernel views, cache ops)
//!    │
//!    ├── ContextMapper    (per-context IOVA install / remove)
//!    │
//!    └── RemoteMapper     (optional co-processor visibility)
//! ```
//!
//! All calls are synchronous and may block. None are cancelled.

use alloc::sync::Arc;
use core::fmt;

use crate::error::{AllocError, MapError};
use crate::flags::{AccessMode, BufferFlags, CacheOp, MappingClient, MemRegion, RegionKind};

/// Allocator result type
pub type AllocResult<T> = core::result::Result<T, AllocError>;
/// Mapper result type
pub type MapResult<T> = core::result::Result<T, MapError>;

// =============================================================================
// VALUE TYPES
// =============================================================================

/// Identity of an underlying shared buffer object
///
/// Stable for the object's lifetime. Two imports of the same object yield
/// the same identity, which is what deduplication keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Identity(pub u64);

/// External descriptor for a buffer object (e.g. a file descriptor)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Descriptor(pub i32);

/// Hardware address translation context (one IOMMU/SMMU domain)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ContextId(pub u32);

/// Reference to a backing buffer object held by the manager
///
/// Each value the allocator hands out stands for one reference that must be
/// returned through [`BufferAllocator::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingBuffer {
    /// Object identity
    pub identity: Identity,
    /// Exported descriptor, `None` for kernel-internal objects
    pub descriptor: Option<Descriptor>,
    /// Object size in bytes
    pub size: usize,
}

/// Kernel virtual mapping of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelView {
    /// Kernel virtual address
    pub addr: usize,
    /// Mapped length in bytes
    pub len: usize,
}

/// Result of installing a buffer in one context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMapping {
    /// Device address in the context
    pub iova: u64,
    /// Mapped extent in bytes
    pub len: usize,
}

/// Parameters for a single-context user mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    /// Target context
    pub context: ContextId,
    /// DMA direction
    pub access: AccessMode,
    /// Region inside the context
    pub region: MemRegion,
    /// Flags of the buffer being mapped
    pub flags: BufferFlags,
    /// Object was allocated by this manager
    pub internal: bool,
}

// =============================================================================
// ALLOCATOR
// =============================================================================

/// Produces and owns backing buffer objects
///
/// Flags are passed through unchanged; heap selection is the allocator's
/// business.
pub trait BufferAllocator: Send + Sync {
    /// Allocate a new object of at least `size` bytes
    fn allocate(&self, size: usize, flags: BufferFlags) -> AllocResult<BackingBuffer>;

    /// Take a reference to an existing object named by `descriptor`
    fn import(&self, descriptor: Descriptor) -> AllocResult<BackingBuffer>;

    /// Drop one reference
    fn release(&self, buffer: &BackingBuffer);

    /// Map the object for kernel read/write
    fn map_kernel(&self, buffer: &BackingBuffer) -> AllocResult<KernelView>;

    /// Remove a kernel mapping created by [`BufferAllocator::map_kernel`]
    fn unmap_kernel(&self, buffer: &BackingBuffer, view: KernelView);

    /// Clean and/or invalidate CPU caches for the object
    fn cache_maintenance(&self, buffer: &BackingBuffer, op: CacheOp) -> AllocResult<()>;
}

// =============================================================================
// CONTEXT MAPPER
// =============================================================================

/// Installs and removes buffer mappings in hardware contexts
pub trait ContextMapper: Send + Sync {
    /// Map for a user request
    fn map(&self, request: &MapRequest, buffer: &BackingBuffer) -> MapResult<DeviceMapping>;

    /// Map protected content (stage-2)
    fn map_secure(
        &self,
        context: ContextId,
        buffer: &BackingBuffer,
        access: AccessMode,
    ) -> MapResult<DeviceMapping>;

    /// Map for the kernel's own use
    fn map_kernel_iova(
        &self,
        context: ContextId,
        buffer: &BackingBuffer,
        region: MemRegion,
    ) -> MapResult<DeviceMapping>;

    /// Remove a user or kernel mapping
    fn unmap(
        &self,
        context: ContextId,
        buffer: &BackingBuffer,
        region: MemRegion,
        client: MappingClient,
    ) -> MapResult<()>;

    /// Remove a protected mapping
    fn unmap_secure(&self, context: ContextId, buffer: &BackingBuffer) -> MapResult<()>;

    /// Install a permanently resident region backed by `buffer`
    fn reserve_region(
        &self,
        context: ContextId,
        kind: RegionKind,
        buffer: &BackingBuffer,
    ) -> MapResult<DeviceMapping>;

    /// Tear down a region installed by [`ContextMapper::reserve_region`]
    fn release_region(&self, context: ContextId, kind: RegionKind) -> MapResult<()>;

    /// Does the context have a shared region?
    fn supports_shared_region(&self, _context: ContextId) -> bool {
        false
    }
}

// =============================================================================
// REMOTE MAPPER / CLOCK
// =============================================================================

/// Publishes buffers to a remote co-processor
pub trait RemoteMapper: Send + Sync {
    /// Make the buffer visible remotely; returns the remote address
    fn map(&self, buffer: &BackingBuffer) -> MapResult<u64>;

    /// Withdraw remote visibility
    fn unmap(&self, buffer: &BackingBuffer) -> MapResult<()>;
}

/// Monotonic time source for diagnostics
pub trait Clock: Send + Sync {
    /// Nanoseconds since an arbitrary epoch
    fn now_ns(&self) -> u64;
}

/// Clock that always reads zero
#[derive(Debug, Clone, Copy, Default)]
pub struct NullClock;

impl Clock for NullClock {
    fn now_ns(&self) -> u64 {
        0
    }
}

// =============================================================================
// BACKEND BUNDLE
// =============================================================================

/// The collaborators a manager is built from
#[derive(Clone)]
pub struct Backends {
    /// Backing object allocator
    pub allocator: Arc<dyn BufferAllocator>,
    /// Context mapper
    pub mapper: Arc<dyn ContextMapper>,
    /// Remote mapper, if a co-processor is present
    pub remote: Option<Arc<dyn RemoteMapper>>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl Backends {
    /// Bundle an allocator and mapper with no remote mapper and a null clock
    pub fn new(allocator: Arc<dyn BufferAllocator>, mapper: Arc<dyn ContextMapper>) -> Self {
        Self {
            allocator,
            mapper,
            remote: None,
            clock: Arc::new(NullClock),
        }
    }

    /// Attach a remote mapper
    pub fn with_remote(mut self, remote: Arc<dyn RemoteMapper>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Attach a clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends")
            .field("remote", &self.remote.is_some())
            .finish_non_exhaustive()
    }
}
