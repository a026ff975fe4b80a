//! # Table Configuration
//!
//! Fixed at manager construction; the table is never resized.

use crate::handle::MAX_INDEX;

/// Padding added to hardware-shared allocations when enabled
pub const SHARED_BUFFER_PAD: usize = 4 * 1024;

/// Default number of slots, including reserved slot 0
pub const DEFAULT_CAPACITY: usize = 1024;

/// Buffer table configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    /// Number of slots, including the reserved slot 0
    pub capacity: usize,
    /// Pad `HW_SHARED` allocations by [`SHARED_BUFFER_PAD`]
    pub shared_buffer_padding: bool,
    /// Log how long each allocation took
    pub profile_allocations: bool,
    /// Map command buffers into the shared region of capable contexts
    pub expanded_shared_region: bool,
}

impl TableConfig {
    /// Create a config with `capacity` slots and every option off
    ///
    /// Capacity is clamped to what a handle can address, and to at least one
    /// usable slot.
    pub const fn new(capacity: usize) -> Self {
        let capacity = if capacity > MAX_INDEX + 1 {
            MAX_INDEX + 1
        } else if capacity < 2 {
            2
        } else {
            capacity
        };
        Self {
            capacity,
            shared_buffer_padding: false,
            profile_allocations: false,
            expanded_shared_region: false,
        }
    }

    /// Config for camera-style pipelines: padded shared buffers and
    /// command buffers in the shared region
    pub const fn camera() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            shared_buffer_padding: true,
            profile_allocations: false,
            expanded_shared_region: true,
        }
    }

    /// Enable or disable shared buffer padding
    pub const fn with_shared_buffer_padding(mut self, enable: bool) -> Self {
        self.shared_buffer_padding = enable;
        self
    }

    /// Enable or disable allocation profiling
    pub const fn with_profiling(mut self, enable: bool) -> Self {
        self.profile_allocations = enable;
        self
    }

    /// Enable or disable the expanded shared region
    pub const fn with_expanded_shared_region(mut self, enable: bool) -> Self {
        self.expanded_shared_region = enable;
        self
    }

    /// Number of slots that can hold buffers
    #[inline]
    pub const fn usable_slots(&self) -> usize {
        self.capacity - 1
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_clamped() {
        assert_eq!(TableConfig::new(0).capacity, 2);
        assert_eq!(TableConfig::new(1 << 20).capacity, MAX_INDEX + 1);
        assert_eq!(TableConfig::new(64).usable_slots(), 63);
    }

    #[test]
    fn test_builders() {
        let config = TableConfig::default()
            .with_shared_buffer_padding(true)
            .with_profiling(true);
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert!(config.shared_buffer_padding);
        assert!(config.profile_allocations);
        assert!(!config.expanded_shared_region);
        assert!(TableConfig::camera().expanded_shared_region);
    }
}
