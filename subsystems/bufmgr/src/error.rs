//! # Buffer Manager Errors
//!
//! Error types for the buffer handle subsystem.
//!
//! Propagation policy:
//! - Partial multi-context map failures are rolled back before they surface
//! - Handle validation and table exhaustion always reach the caller
//! - Leaks found by the shutdown sweep are logged, never returned

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Buffer manager result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Buffer manager error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Table Errors
    // =========================================================================
    /// No free slot left in the table
    TableFull,
    /// Handle is stale, malformed, or out of range
    InvalidHandle,
    /// The manager has been swept and accepts no new work
    ShuttingDown,

    // =========================================================================
    // Request Errors
    // =========================================================================
    /// Flag combination is not allowed for this operation
    InvalidFlags,
    /// More hardware contexts than a slot can record
    TooManyContexts,
    /// Buffer was not created with kernel access
    KernelAccessDenied,
    /// Buffer has no mapping in the requested context
    ContextNotMapped,
    /// Fixed region freed with a context or kind it was not reserved with
    RegionMismatch,

    // =========================================================================
    // Mapping Errors
    // =========================================================================
    /// Same buffer already mapped with a different extent
    LengthMismatch,
    /// Context mapper refused the mapping
    MapFailed,
    /// Context mapper failed to remove a mapping
    UnmapFailed,
    /// Remote (co-processor) mapping failed
    RemoteMapFailed,

    // =========================================================================
    // Backing Object Errors
    // =========================================================================
    /// Allocator could not produce a backing buffer
    AllocationFailed(AllocError),
    /// Allocator rejected a cache maintenance request
    CacheOpFailed,

    // =========================================================================
    // Lease Errors
    // =========================================================================
    /// Reference count would drop below zero
    UnbalancedRelease,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Table
            Self::TableFull => write!(f, "buffer table full"),
            Self::InvalidHandle => write!(f, "invalid buffer handle"),
            Self::ShuttingDown => write!(f, "buffer manager shutting down"),

            // Request
            Self::InvalidFlags => write!(f, "invalid buffer flags"),
            Self::TooManyContexts => write!(f, "too many hardware contexts"),
            Self::KernelAccessDenied => write!(f, "buffer has no kernel access"),
            Self::ContextNotMapped => write!(f, "buffer not mapped in context"),
            Self::RegionMismatch => write!(f, "fixed region mismatch"),

            // Mapping
            Self::LengthMismatch => write!(f, "buffer already mapped with different length"),
            Self::MapFailed => write!(f, "context mapping failed"),
            Self::UnmapFailed => write!(f, "context unmapping failed"),
            Self::RemoteMapFailed => write!(f, "remote mapping failed"),

            // Backing
            Self::AllocationFailed(e) => write!(f, "allocation failed: {:?}", e),
            Self::CacheOpFailed => write!(f, "cache maintenance failed"),

            // Lease
            Self::UnbalancedRelease => write!(f, "unbalanced release"),
        }
    }
}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// Allocator failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No memory left in the selected heap
    OutOfMemory,
    /// No heap can satisfy the requested flags
    NoSuitableHeap,
    /// External descriptor does not name a buffer object
    BadDescriptor,
    /// Kernel virtual mapping could not be created
    KernelMapFailed,
}

/// Context mapper failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Buffer is already mapped in this context with the given extent
    AlreadyMapped {
        /// Extent recorded by the existing mapping
        len: usize,
    },
    /// Context id is unknown to the mapper
    NoSuchContext,
    /// Context address space exhausted
    OutOfSpace,
    /// Mapping does not exist
    NotMapped,
    /// Hardware or firmware fault
    Fault,
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<AllocError> for Error {
    fn from(e: AllocError) -> Self {
        Error::AllocationFailed(e)
    }
}

impl Error {
    /// Classify a map failure against the buffer's own extent
    pub fn from_map(e: MapError, buffer_len: usize) -> Self {
        match e {
            MapError::AlreadyMapped { len } if len != buffer_len => Error::LengthMismatch,
            _ => Error::MapFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_error_classification() {
        assert_eq!(
            Error::from_map(MapError::AlreadyMapped { len: 8192 }, 4096),
            Error::LengthMismatch
        );
        assert_eq!(
            Error::from_map(MapError::AlreadyMapped { len: 4096 }, 4096),
            Error::MapFailed
        );
        assert_eq!(Error::from_map(MapError::Fault, 4096), Error::MapFailed);
    }

    #[test]
    fn test_alloc_error_conversion() {
        let e: Error = AllocError::OutOfMemory.into();
        assert_eq!(e, Error::AllocationFailed(AllocError::OutOfMemory));
    }
}
