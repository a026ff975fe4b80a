//! # Buffer Flags
//!
//! Capability bits requested for a buffer, and the mapping parameters
//! derived from them.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::MAX_CONTEXTS;

bitflags! {
    /// Requested buffer capabilities
    ///
    /// Heap-selection bits (`CACHED`, `SECURE`, ...) are passed to the
    /// allocator unchanged.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u32 {
        /// Hardware may read and write
        const HW_READ_WRITE = 1 << 0;
        /// Hardware may only read
        const HW_READ_ONLY = 1 << 1;
        /// Hardware may only write
        const HW_WRITE_ONLY = 1 << 2;
        /// Kernel needs a CPU mapping
        const KERNEL_ACCESS = 1 << 3;
        /// User space needs a CPU mapping
        const USER_ACCESS = 1 << 4;
        /// Protected (secure) content
        const SECURE = 1 << 5;
        /// Command buffer
        const CMD_BUFFER = 1 << 6;
        /// Pixel data
        const PIXEL_BUFFER = 1 << 7;
        /// Statistics output
        const STATS_BUFFER = 1 << 8;
        /// Packet buffer
        const PACKET_BUFFER = 1 << 9;
        /// CPU-cached memory
        const CACHED = 1 << 10;
        /// Mapped into the shared region of each context
        const HW_SHARED = 1 << 11;
        /// Secure output consumed by the DSP
        const DSP_OUTPUT = 1 << 12;
        /// Ask the mapper not to defer the unmap
        const NO_DELAYED_UNMAP = 1 << 13;
        /// Mark as the kernel debug buffer
        const KERNEL_DEBUG = 1 << 14;
        /// Non-pixel protected data
        const NO_PIXEL = 1 << 15;
        /// Visible to a remote co-processor
        const REMOTE_ACCESS = 1 << 16;
    }
}

impl BufferFlags {
    /// Does the buffer need any hardware context mapping?
    #[inline]
    pub fn needs_hw_mapping(&self) -> bool {
        self.intersects(Self::HW_READ_WRITE | Self::HW_SHARED | Self::SECURE)
    }

    /// Does the buffer need hardware mapping on import?
    #[inline]
    pub fn needs_import_mapping(&self) -> bool {
        self.intersects(Self::HW_READ_WRITE | Self::SECURE)
    }

    /// Access mode implied by the hardware bits
    pub fn access_mode(&self) -> Option<AccessMode> {
        if self.contains(Self::HW_READ_ONLY) {
            Some(AccessMode::ToDevice)
        } else if self.contains(Self::HW_WRITE_ONLY) {
            Some(AccessMode::FromDevice)
        } else if self.intersects(Self::HW_READ_WRITE | Self::SECURE) {
            Some(AccessMode::Bidirectional)
        } else {
            None
        }
    }

    /// Default region for these flags; `HW_SHARED` takes precedence
    pub fn region(&self) -> MemRegion {
        if self.contains(Self::HW_SHARED) {
            MemRegion::Shared
        } else {
            MemRegion::Io
        }
    }
}

// =============================================================================
// DERIVED MAPPING PARAMETERS
// =============================================================================

/// DMA direction of a context mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Device reads
    ToDevice,
    /// Device writes
    FromDevice,
    /// Device reads and writes
    Bidirectional,
}

/// Address region inside a hardware context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemRegion {
    /// General I/O region
    Io,
    /// Region shared between firmware and host
    Shared,
}

/// Which side created a context mapping; decides the unmap call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingClient {
    /// Mapped on behalf of a user request
    User,
    /// Mapped by the kernel for its own use
    Kernel,
}

/// Kind of permanently resident region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Secondary heap carved out of a context
    SecondaryHeap,
    /// Uncached firmware scratch area
    FirmwareUncached,
}

impl RegionKind {
    /// Get kind name
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SecondaryHeap => "secheap",
            Self::FirmwareUncached => "fw-uncached",
        }
    }
}

/// Cache maintenance request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    /// Write back dirty lines
    Clean,
    /// Discard cached lines
    Invalidate,
    /// Write back then discard
    CleanInvalidate,
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Validate flags and context count for an allocation
pub fn check_alloc(flags: BufferFlags, num_contexts: usize) -> Result<()> {
    if num_contexts > MAX_CONTEXTS {
        log::error!("bufmgr: {} contexts exceed maximum {}", num_contexts, MAX_CONTEXTS);
        return Err(Error::TooManyContexts);
    }

    if flags.contains(BufferFlags::SECURE | BufferFlags::KERNEL_ACCESS) {
        log::error!("bufmgr: kernel mapping in secure mode not allowed");
        return Err(Error::InvalidFlags);
    }

    if flags.contains(BufferFlags::NO_PIXEL)
        && flags.intersects(BufferFlags::SECURE | BufferFlags::KERNEL_ACCESS)
    {
        log::error!("bufmgr: kernel mapping and secure mode not allowed for non-pixel data");
        return Err(Error::InvalidFlags);
    }

    if flags.contains(BufferFlags::REMOTE_ACCESS | BufferFlags::KERNEL_ACCESS) {
        log::error!("bufmgr: kernel mapping together with remote mapping not allowed");
        return Err(Error::InvalidFlags);
    }

    Ok(())
}

/// Validate flags and context count for an import
pub fn check_import(flags: BufferFlags, num_contexts: usize) -> Result<()> {
    if flags.is_empty() {
        log::error!("bufmgr: import without flags");
        return Err(Error::InvalidFlags);
    }

    if num_contexts > MAX_CONTEXTS {
        log::error!("bufmgr: {} contexts exceed maximum {}", num_contexts, MAX_CONTEXTS);
        return Err(Error::TooManyContexts);
    }

    if flags.contains(BufferFlags::SECURE | BufferFlags::KERNEL_ACCESS) {
        log::error!("bufmgr: kernel mapping in secure mode not allowed, flags={:#x}", flags.bits());
        return Err(Error::InvalidFlags);
    }

    if flags.contains(BufferFlags::HW_SHARED) {
        log::error!("bufmgr: shared region buffers cannot be imported");
        return Err(Error::InvalidFlags);
    }

    Ok(())
}

/// Bits an import cannot add to a buffer already in the table
const FIXED_AT_CREATION: BufferFlags = BufferFlags::KERNEL_ACCESS
    .union(BufferFlags::REMOTE_ACCESS)
    .union(BufferFlags::SECURE);

/// Validate an import that resolves to a buffer already in the table
///
/// Kernel, remote and secure mappings are set up when the buffer is
/// created, so a later import cannot ask for them. A secure buffer must
/// also be imported as secure.
pub fn check_join(requested: BufferFlags, existing: BufferFlags) -> Result<()> {
    let added = requested.difference(existing) & FIXED_AT_CREATION;
    if !added.is_empty() {
        log::error!(
            "bufmgr: import adds {:#x} to buffer created with {:#x}",
            added.bits(),
            existing.bits()
        );
        return Err(Error::InvalidFlags);
    }

    if existing.contains(BufferFlags::SECURE) && !requested.contains(BufferFlags::SECURE) {
        log::error!("bufmgr: secure buffer imported without secure flag");
        return Err(Error::InvalidFlags);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mode() {
        assert_eq!(BufferFlags::HW_READ_ONLY.access_mode(), Some(AccessMode::ToDevice));
        assert_eq!(BufferFlags::HW_WRITE_ONLY.access_mode(), Some(AccessMode::FromDevice));
        assert_eq!(BufferFlags::HW_READ_WRITE.access_mode(), Some(AccessMode::Bidirectional));
        assert_eq!(BufferFlags::SECURE.access_mode(), Some(AccessMode::Bidirectional));
        assert_eq!(BufferFlags::CACHED.access_mode(), None);
    }

    #[test]
    fn test_region_precedence() {
        let flags = BufferFlags::HW_READ_WRITE | BufferFlags::HW_SHARED;
        assert_eq!(flags.region(), MemRegion::Shared);
        assert_eq!(BufferFlags::HW_READ_WRITE.region(), MemRegion::Io);
    }

    #[test]
    fn test_alloc_flag_rules() {
        assert!(check_alloc(BufferFlags::HW_READ_WRITE, 2).is_ok());
        assert_eq!(
            check_alloc(BufferFlags::SECURE | BufferFlags::KERNEL_ACCESS, 1),
            Err(Error::InvalidFlags)
        );
        assert_eq!(
            check_alloc(BufferFlags::NO_PIXEL | BufferFlags::SECURE, 1),
            Err(Error::InvalidFlags)
        );
        assert_eq!(
            check_alloc(BufferFlags::REMOTE_ACCESS | BufferFlags::KERNEL_ACCESS, 1),
            Err(Error::InvalidFlags)
        );
        assert_eq!(
            check_alloc(BufferFlags::HW_READ_WRITE, MAX_CONTEXTS + 1),
            Err(Error::TooManyContexts)
        );
    }

    #[test]
    fn test_import_flag_rules() {
        assert_eq!(check_import(BufferFlags::empty(), 1), Err(Error::InvalidFlags));
        assert_eq!(
            check_import(BufferFlags::HW_READ_WRITE | BufferFlags::HW_SHARED, 1),
            Err(Error::InvalidFlags)
        );
        assert!(check_import(BufferFlags::HW_READ_WRITE | BufferFlags::KERNEL_ACCESS, 1).is_ok());
    }

    #[test]
    fn test_join_flag_rules() {
        let rw = BufferFlags::HW_READ_WRITE;
        let kernel = rw | BufferFlags::KERNEL_ACCESS;
        let secure = rw | BufferFlags::SECURE;

        assert!(check_join(rw, kernel).is_ok());
        assert!(check_join(rw | BufferFlags::CACHED, rw).is_ok());
        assert!(check_join(secure, secure).is_ok());
        assert_eq!(check_join(kernel, rw), Err(Error::InvalidFlags));
        assert_eq!(check_join(rw | BufferFlags::REMOTE_ACCESS, rw), Err(Error::InvalidFlags));
        assert_eq!(check_join(secure, rw), Err(Error::InvalidFlags));
        assert_eq!(check_join(rw, secure), Err(Error::InvalidFlags));
    }
}
