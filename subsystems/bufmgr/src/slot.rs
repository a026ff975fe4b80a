//! # Buffer Slots
//!
//! One table entry: the backing object, its mappings, and its lease counts.
//! Every field is guarded by the slot's own lock in [`crate::table`].

use arrayvec::ArrayVec;

use crate::backend::{BackingBuffer, ContextId, Descriptor, Identity, KernelView};
use crate::error::{Error, Result};
use crate::flags::{BufferFlags, MappingClient, MemRegion, RegionKind};
use crate::handle::{BufferHandle, TOKEN_MASK};
use crate::lease::{LeaseCounts, LeasePolicy};
use crate::MAX_CONTEXTS;

/// One installed context mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextMapping {
    /// Context the buffer is mapped in
    pub context: ContextId,
    /// Device address in that context
    pub iova: u64,
    /// Mapped extent
    pub len: usize,
    /// Region the mapping lives in
    pub region: MemRegion,
    /// Who requested it
    pub client: MappingClient,
    /// Installed through the protected mapping path
    pub secure: bool,
}

/// A permanently resident region installed for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedRegion {
    /// Owning context
    pub context: ContextId,
    /// Region kind
    pub kind: RegionKind,
    /// Device address of the region
    pub iova: u64,
    /// Region extent
    pub len: usize,
}

/// Table entry
#[derive(Debug)]
pub struct BufferSlot {
    pub(crate) active: bool,
    pub(crate) generation: u32,
    pub(crate) handle: Option<BufferHandle>,
    pub(crate) backing: Option<BackingBuffer>,
    pub(crate) flags: BufferFlags,
    pub(crate) length: usize,
    pub(crate) kernel_view: Option<KernelView>,
    pub(crate) mappings: ArrayVec<ContextMapping, MAX_CONTEXTS>,
    pub(crate) region: Option<FixedRegion>,
    pub(crate) remote_addr: Option<u64>,
    pub(crate) leases: LeaseCounts,
    pub(crate) imported: bool,
    pub(crate) created_internally: bool,
    pub(crate) created_ns: u64,
}

impl BufferSlot {
    /// Create an unused slot
    pub const fn new() -> Self {
        Self {
            active: false,
            generation: 0,
            handle: None,
            backing: None,
            flags: BufferFlags::empty(),
            length: 0,
            kernel_view: None,
            mappings: ArrayVec::new_const(),
            region: None,
            remote_addr: None,
            leases: LeaseCounts::IDLE,
            imported: false,
            created_internally: false,
            created_ns: 0,
        }
    }

    /// Bring a free slot into use and mint its handle
    pub(crate) fn activate(&mut self, index: usize, now_ns: u64) -> BufferHandle {
        self.generation = self.generation.wrapping_add(1) & TOKEN_MASK;
        let handle = BufferHandle::encode(index, self.generation);
        self.active = true;
        self.handle = Some(handle);
        self.created_ns = now_ns;
        handle
    }

    /// Return every field to its zero state
    ///
    /// The generation survives so the next handle for this index differs
    /// from every recent one.
    pub(crate) fn reset(&mut self) {
        let generation = self.generation;
        *self = Self::new();
        self.generation = generation;
    }

    /// Confirm `handle` still names this slot's current buffer
    pub(crate) fn validate(&self, handle: BufferHandle) -> Result<()> {
        if self.active && self.handle == Some(handle) {
            Ok(())
        } else {
            Err(Error::InvalidHandle)
        }
    }

    /// Is the slot live?
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Identity of the backing object, if any
    #[inline]
    pub fn identity(&self) -> Option<Identity> {
        self.backing.as_ref().map(|b| b.identity)
    }

    /// Descriptor of the backing object; `None` for kernel-internal buffers
    #[inline]
    pub fn descriptor(&self) -> Option<Descriptor> {
        self.backing.as_ref().and_then(|b| b.descriptor)
    }

    /// Mapping recorded for `context`
    pub fn mapping(&self, context: ContextId) -> Option<&ContextMapping> {
        self.mappings.iter().find(|m| m.context == context)
    }

    /// Is the buffer mapped in `context`?
    #[inline]
    pub fn has_context(&self, context: ContextId) -> bool {
        self.mapping(context).is_some()
    }

    /// Diagnostic record for this slot
    pub fn info(&self, index: usize) -> SlotInfo {
        SlotInfo {
            index,
            handle: self.handle,
            identity: self.identity(),
            descriptor: self.descriptor(),
            flags: self.flags,
            length: self.length,
            contexts: self.mappings.len() + usize::from(self.region.is_some()),
            kernel_mapped: self.kernel_view.is_some(),
            remote_addr: self.remote_addr,
            kernel_refcount: self.leases.kernel_refcount(),
            user_refcount: self.leases.user_refcount(),
            policy: self.leases.policy(),
            imported: self.imported,
            created_internally: self.created_internally,
            created_ns: self.created_ns,
        }
    }
}

impl Default for BufferSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of an active slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    /// Table index
    pub index: usize,
    /// Current handle
    pub handle: Option<BufferHandle>,
    /// Backing object identity
    pub identity: Option<Identity>,
    /// Backing descriptor
    pub descriptor: Option<Descriptor>,
    /// Requested flags
    pub flags: BufferFlags,
    /// Logical length
    pub length: usize,
    /// Number of context mappings
    pub contexts: usize,
    /// Kernel view present
    pub kernel_mapped: bool,
    /// Co-processor address, if published
    pub remote_addr: Option<u64>,
    /// Kernel-side refcount
    pub kernel_refcount: u32,
    /// User-side refcount
    pub user_refcount: u32,
    /// Teardown policy
    pub policy: LeasePolicy,
    /// Came from an external descriptor
    pub imported: bool,
    /// Allocated by the manager itself
    pub created_internally: bool,
    /// Creation timestamp
    pub created_ns: u64,
}
