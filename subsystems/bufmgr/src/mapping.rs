//! # Mapping Engine
//!
//! Installs a slot's backing object into hardware contexts, the kernel
//! address space and the remote co-processor, and takes it back out.
//!
//! Context lists are additive: a deduplicated import may append contexts to
//! a slot that earlier callers already mapped, and `unmap_all` always walks
//! the full recorded list. A failed multi-context map only rolls back the
//! contexts installed by that same call.

use alloc::sync::Arc;
use core::fmt;

use arrayvec::ArrayVec;

use crate::backend::{
    Backends, BackingBuffer, BufferAllocator, ContextId, ContextMapper, KernelView, MapRequest,
    RemoteMapper,
};
use crate::config::TableConfig;
use crate::error::{Error, Result};
use crate::flags::{AccessMode, BufferFlags, MappingClient, MemRegion, RegionKind};
use crate::slot::{BufferSlot, ContextMapping, FixedRegion};
use crate::MAX_CONTEXTS;

/// Device addresses returned by a multi-context map, in request order
pub type IovaList = ArrayVec<u64, MAX_CONTEXTS>;

/// Mapping engine
pub struct MappingEngine {
    allocator: Arc<dyn BufferAllocator>,
    mapper: Arc<dyn ContextMapper>,
    remote: Option<Arc<dyn RemoteMapper>>,
    expanded_shared_region: bool,
}

impl MappingEngine {
    /// Create an engine over the given collaborators
    pub fn new(backends: &Backends, config: &TableConfig) -> Self {
        Self {
            allocator: Arc::clone(&backends.allocator),
            mapper: Arc::clone(&backends.mapper),
            remote: backends.remote.clone(),
            expanded_shared_region: config.expanded_shared_region,
        }
    }

    /// Region a buffer with `flags` is placed in for `context`
    pub fn region_for(&self, flags: BufferFlags, context: ContextId) -> MemRegion {
        if flags.contains(BufferFlags::HW_SHARED) {
            MemRegion::Shared
        } else if self.expanded_shared_region
            && flags.contains(BufferFlags::CMD_BUFFER)
            && self.mapper.supports_shared_region(context)
        {
            MemRegion::Shared
        } else {
            MemRegion::Io
        }
    }

    // =========================================================================
    // Context Mappings
    // =========================================================================

    /// Map the slot's buffer into every context in `contexts`
    ///
    /// Contexts already recorded on the slot are not mapped again; their
    /// existing address is reported. On failure every context installed by
    /// this call is unmapped and the slot's list is left as it was.
    pub fn map_into_contexts(
        &self,
        slot: &mut BufferSlot,
        flags: BufferFlags,
        contexts: &[ContextId],
        client: MappingClient,
    ) -> Result<IovaList> {
        if contexts.len() > MAX_CONTEXTS {
            return Err(Error::TooManyContexts);
        }
        let fresh = contexts
            .iter()
            .enumerate()
            .filter(|&(i, c)| !slot.has_context(*c) && !contexts[..i].contains(c))
            .count();
        if slot.mappings.len() + fresh > MAX_CONTEXTS {
            log::error!(
                "bufmgr: {} mapped + {} new contexts exceed {}",
                slot.mappings.len(),
                fresh,
                MAX_CONTEXTS
            );
            return Err(Error::TooManyContexts);
        }

        let secure = flags.contains(BufferFlags::SECURE);
        let access = flags.access_mode();
        let user_access = match client {
            MappingClient::User => Some(access.ok_or_else(|| {
                log::error!("bufmgr: no hardware access mode in flags {:#x}", flags.bits());
                Error::InvalidFlags
            })?),
            MappingClient::Kernel => None,
        };

        let Some(backing) = slot.backing.as_ref() else {
            return Err(Error::InvalidHandle);
        };
        let length = slot.length;
        let start = slot.mappings.len();
        let mut iovas = IovaList::new();

        for &context in contexts {
            if let Some(existing) = slot.mappings.iter().find(|m| m.context == context) {
                iovas.push(existing.iova);
                continue;
            }

            let region = self.region_for(flags, context);
            let result = if secure {
                self.mapper
                    .map_secure(context, backing, access.unwrap_or(AccessMode::Bidirectional))
            } else if let Some(access) = user_access {
                let request = MapRequest {
                    context,
                    access,
                    region,
                    flags,
                    internal: slot.created_internally,
                };
                self.mapper.map(&request, backing)
            } else {
                self.mapper.map_kernel_iova(context, backing, region)
            };

            match result {
                Ok(mapping) => {
                    slot.mappings.push(ContextMapping {
                        context,
                        iova: mapping.iova,
                        len: mapping.len,
                        region,
                        client,
                        secure,
                    });
                    iovas.push(mapping.iova);
                }
                Err(e) => {
                    log::error!(
                        "bufmgr: map of {:?} into {:?} failed: {:?}, rolling back {} contexts",
                        backing.identity,
                        context,
                        e,
                        slot.mappings.len() - start
                    );
                    let added: ArrayVec<ContextMapping, MAX_CONTEXTS> =
                        slot.mappings.drain(start..).collect();
                    for mapping in added.iter().rev() {
                        // Rollback is best effort; the map error is what surfaces
                        let _ = self.unmap_one(backing, mapping);
                    }
                    return Err(Error::from_map(e, length));
                }
            }
        }

        Ok(iovas)
    }

    fn unmap_one(&self, backing: &BackingBuffer, mapping: &ContextMapping) -> Result<()> {
        let result = if mapping.secure {
            self.mapper.unmap_secure(mapping.context, backing)
        } else {
            self.mapper
                .unmap(mapping.context, backing, mapping.region, mapping.client)
        };
        result.map_err(|e| {
            log::error!(
                "bufmgr: unmap of {:?} from {:?} failed: {:?}",
                backing.identity,
                mapping.context,
                e
            );
            Error::UnmapFailed
        })
    }

    // =========================================================================
    // Kernel View / Remote
    // =========================================================================

    /// Map the buffer for kernel access; returns the existing view if any
    pub fn map_kernel_view(&self, slot: &mut BufferSlot) -> Result<KernelView> {
        if let Some(view) = slot.kernel_view {
            return Ok(view);
        }
        let backing = slot.backing.as_ref().ok_or(Error::InvalidHandle)?;
        let view = self.allocator.map_kernel(backing).map_err(|e| {
            log::error!("bufmgr: kernel map of {:?} failed: {:?}", backing.identity, e);
            Error::from(e)
        })?;
        slot.kernel_view = Some(view);
        Ok(view)
    }

    /// Publish the buffer to the remote co-processor
    pub fn map_remote(&self, slot: &mut BufferSlot) -> Result<u64> {
        if let Some(addr) = slot.remote_addr {
            return Ok(addr);
        }
        let Some(remote) = self.remote.as_ref() else {
            log::error!("bufmgr: remote access requested but no remote mapper");
            return Err(Error::RemoteMapFailed);
        };
        let backing = slot.backing.as_ref().ok_or(Error::InvalidHandle)?;
        let addr = remote.map(backing).map_err(|e| {
            log::error!("bufmgr: remote map of {:?} failed: {:?}", backing.identity, e);
            Error::RemoteMapFailed
        })?;
        slot.remote_addr = Some(addr);
        Ok(addr)
    }

    // =========================================================================
    // Fixed Regions
    // =========================================================================

    /// Install a fixed region in `context` backed by the slot's buffer
    pub fn install_region(
        &self,
        slot: &mut BufferSlot,
        context: ContextId,
        kind: RegionKind,
    ) -> Result<FixedRegion> {
        let backing = slot.backing.as_ref().ok_or(Error::InvalidHandle)?;
        let mapping = self
            .mapper
            .reserve_region(context, kind, backing)
            .map_err(|e| {
                log::error!("bufmgr: reserving {} region in {:?} failed: {:?}", kind.name(), context, e);
                Error::from_map(e, slot.length)
            })?;
        let region = FixedRegion {
            context,
            kind,
            iova: mapping.iova,
            len: mapping.len,
        };
        slot.region = Some(region);
        Ok(region)
    }

    /// Remove the slot's fixed region; it stays recorded if the mapper fails
    pub fn remove_region(&self, slot: &mut BufferSlot) -> Result<()> {
        let Some(region) = slot.region else {
            return Ok(());
        };
        self.mapper
            .release_region(region.context, region.kind)
            .map_err(|e| {
                log::error!("bufmgr: {} region release failed: {:?}", region.kind.name(), e);
                Error::UnmapFailed
            })?;
        slot.region = None;
        Ok(())
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Undo every mapping recorded on the slot
    ///
    /// Keeps going past individual failures so nothing is left recorded, and
    /// reports the first one. A slot with nothing mapped is a no-op.
    pub fn unmap_all(&self, slot: &mut BufferSlot) -> Result<()> {
        let Some(backing) = slot.backing.as_ref() else {
            slot.mappings.clear();
            slot.region = None;
            slot.kernel_view = None;
            slot.remote_addr = None;
            return Ok(());
        };
        let mut result = Ok(());

        if let Some(region) = slot.region.take() {
            if let Err(e) = self.mapper.release_region(region.context, region.kind) {
                log::error!("bufmgr: {} region release failed: {:?}", region.kind.name(), e);
                result = Err(Error::UnmapFailed);
            }
        }

        for mapping in slot.mappings.drain(..) {
            if let Err(e) = self.unmap_one(backing, &mapping) {
                result = result.and(Err(e));
            }
        }

        if slot.remote_addr.take().is_some() {
            if let Some(remote) = self.remote.as_ref() {
                if let Err(e) = remote.unmap(backing) {
                    log::error!("bufmgr: remote unmap of {:?} failed: {:?}", backing.identity, e);
                    result = result.and(Err(Error::RemoteMapFailed));
                }
            }
        }

        if let Some(view) = slot.kernel_view.take() {
            self.allocator.unmap_kernel(backing, view);
        }

        result
    }
}

impl fmt::Debug for MappingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingEngine")
            .field("remote", &self.remote.is_some())
            .field("expanded_shared_region", &self.expanded_shared_region)
            .finish_non_exhaustive()
    }
}
