//! # Buffer Manager
//!
//! Public lifecycle operations composed from the table, the mapping engine
//! and the lease rules.
//!
//! Every operation on an existing buffer locks the slot named by the handle,
//! re-validates the handle, and holds the slot lock until it returns. A
//! decrement that demands teardown therefore unmaps and frees the slot
//! before any other caller can look at it, and a racing caller finds the
//! slot inactive and gets [`Error::InvalidHandle`].

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::MutexGuard;

use crate::backend::{
    Backends, BackingBuffer, BufferAllocator, Clock, ContextId, Descriptor, Identity, KernelView,
};
use crate::config::{TableConfig, SHARED_BUFFER_PAD};
use crate::error::{Error, Result};
use crate::flags::{
    check_alloc, check_import, check_join, BufferFlags, CacheOp, MappingClient, RegionKind,
};
use crate::handle::BufferHandle;
use crate::lease::{Disposition, LeaseCounts, LeasePolicy};
use crate::mapping::MappingEngine;
use crate::slot::{BufferSlot, SlotInfo};
use crate::stats::{ManagerStats, StatCounters};
use crate::table::{Reservation, SlotTable};

// =============================================================================
// RESULT TYPES
// =============================================================================

/// Where a buffer lives in one context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAddress {
    /// Device address
    pub iova: u64,
    /// Mapped extent
    pub len: usize,
    /// Buffer flags
    pub flags: BufferFlags,
}

/// Buffer created for the kernel's own use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelBuffer {
    /// Buffer handle
    pub handle: BufferHandle,
    /// Kernel virtual address
    pub kernel_addr: usize,
    /// Device address in `context`
    pub iova: u64,
    /// Buffer length
    pub len: usize,
    /// Context the buffer is mapped in
    pub context: ContextId,
}

/// Permanently resident region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionBuffer {
    /// Buffer handle
    pub handle: BufferHandle,
    /// Owning context
    pub context: ContextId,
    /// Region kind
    pub kind: RegionKind,
    /// Device address of the region
    pub iova: u64,
    /// Region extent
    pub len: usize,
    /// Kernel virtual address, if kernel access was requested
    pub kernel_addr: Option<usize>,
}

enum ImportTarget<'a> {
    Existing(MutexGuard<'a, BufferSlot>),
    Fresh(usize, BufferHandle, MutexGuard<'a, BufferSlot>),
}

// =============================================================================
// BUFFER MANAGER
// =============================================================================

/// Buffer handle manager
pub struct BufferManager {
    config: TableConfig,
    table: SlotTable,
    engine: MappingEngine,
    allocator: Arc<dyn BufferAllocator>,
    clock: Arc<dyn Clock>,
    /// Raw handle of the kernel debug buffer, 0 if none
    debug_buffer: AtomicU32,
    stats: StatCounters,
}

impl BufferManager {
    /// Create a manager with an empty table
    pub fn new(config: TableConfig, backends: Backends) -> Self {
        let table = SlotTable::new(config.capacity);
        let engine = MappingEngine::new(&backends, &config);
        log::info!(
            "bufmgr: table initialised, {} slots, padding={} expanded_shared={}",
            config.usable_slots(),
            config.shared_buffer_padding,
            config.expanded_shared_region
        );
        Self {
            config,
            table,
            engine,
            allocator: backends.allocator,
            clock: backends.clock,
            debug_buffer: AtomicU32::new(0),
            stats: StatCounters::default(),
        }
    }

    /// Get config
    #[inline]
    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Is the manager accepting new buffers?
    pub fn is_running(&self) -> bool {
        !self.table.is_closing()
    }

    /// Number of live buffers
    pub fn in_use(&self) -> usize {
        self.table.in_use()
    }

    /// Counter snapshot
    pub fn stats(&self) -> ManagerStats {
        self.stats.snapshot()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.table.is_closing() {
            log::warn!("bufmgr: request after shutdown");
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    fn padded_size(&self, size: usize, flags: BufferFlags) -> usize {
        if self.config.shared_buffer_padding && flags.contains(BufferFlags::HW_SHARED) {
            size.saturating_add(SHARED_BUFFER_PAD)
        } else {
            size
        }
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Allocate a buffer and map it into `contexts`
    pub fn allocate_and_map(
        &self,
        size: usize,
        flags: BufferFlags,
        contexts: &[ContextId],
    ) -> Result<BufferHandle> {
        self.ensure_running()?;
        check_alloc(flags, contexts.len())?;

        let size = self.padded_size(size, flags);
        let started = self.clock.now_ns();
        let (index, handle, mut slot) = self.allocate_slot(size, flags, started)?;
        slot.leases = LeaseCounts::new(LeasePolicy::for_flags(flags));

        if let Err(e) = self.populate(&mut slot, flags, contexts, flags.needs_hw_mapping()) {
            self.discard(index, &mut slot);
            return Err(e);
        }

        let handle = self.publish(index, &mut slot, handle);
        if let Some(identity) = slot.identity() {
            self.table.index_identity(identity, index);
        }
        StatCounters::bump(&self.stats.allocations);

        if self.config.profile_allocations {
            log::info!(
                "bufmgr: allocated {} bytes in slot {} in {} ns",
                slot.length,
                index,
                self.clock.now_ns().saturating_sub(started)
            );
        }
        log::debug!(
            "bufmgr: allocated {:?} len={} flags={:#x} contexts={}",
            handle,
            slot.length,
            flags.bits(),
            contexts.len()
        );
        Ok(handle)
    }

    /// Import an external buffer and map it into `contexts`
    ///
    /// A buffer already held by the table is not imported twice: the
    /// existing slot gains a user reference and any contexts it is not yet
    /// mapped in. `len`, when given, must match the length recorded for such
    /// a slot. Such an import cannot add kernel, remote or secure access the
    /// buffer was created without, and fails with [`Error::InvalidFlags`].
    pub fn import_and_map(
        &self,
        descriptor: Descriptor,
        flags: BufferFlags,
        contexts: &[ContextId],
        len: Option<usize>,
    ) -> Result<BufferHandle> {
        self.ensure_running()?;
        check_import(flags, contexts.len())?;

        let backing = self.allocator.import(descriptor).map_err(|e| {
            log::error!("bufmgr: import of {:?} failed: {:?}", descriptor, e);
            Error::from(e)
        })?;

        let target = match self.locate(backing.identity) {
            Ok(target) => target,
            Err(e) => {
                self.allocator.release(&backing);
                return Err(e);
            }
        };

        match target {
            ImportTarget::Existing(mut slot) => {
                // The slot already holds a reference to this object
                self.allocator.release(&backing);
                self.join_existing(&mut slot, flags, contexts, len)
            }
            ImportTarget::Fresh(index, handle, mut slot) => {
                slot.length = backing.size;
                slot.backing = Some(backing);
                slot.flags = flags;
                slot.imported = true;
                slot.leases = LeaseCounts::new(LeasePolicy::for_flags(flags));

                if let Err(e) =
                    self.populate(&mut slot, flags, contexts, flags.needs_import_mapping())
                {
                    self.discard(index, &mut slot);
                    return Err(e);
                }

                let handle = self.publish(index, &mut slot, handle);
                StatCounters::bump(&self.stats.imports);
                log::debug!(
                    "bufmgr: imported {:?} as {:?} len={}",
                    descriptor,
                    handle,
                    slot.length
                );
                Ok(handle)
            }
        }
    }

    /// Find the slot holding `identity`, or reserve a new one for it
    fn locate(&self, identity: Identity) -> Result<ImportTarget<'_>> {
        loop {
            match self.table.find_or_reserve(identity, self.clock.now_ns())? {
                Reservation::Existing(index) => {
                    let slot = self.table.slot(index).ok_or(Error::InvalidHandle)?.lock();
                    if slot.is_active() && slot.identity() == Some(identity) {
                        return Ok(ImportTarget::Existing(slot));
                    }
                    // Torn down or rolled back after the lookup
                    log::debug!("bufmgr: slot {} went away during import, retrying", index);
                }
                Reservation::Fresh { index, handle, slot } => {
                    return Ok(ImportTarget::Fresh(index, handle, slot));
                }
            }
        }
    }

    fn join_existing(
        &self,
        slot: &mut BufferSlot,
        flags: BufferFlags,
        contexts: &[ContextId],
        len: Option<usize>,
    ) -> Result<BufferHandle> {
        let handle = slot.handle.ok_or(Error::InvalidHandle)?;
        check_join(flags, slot.flags)?;
        if let Some(len) = len {
            if len != slot.length {
                log::error!(
                    "bufmgr: {:?} imported with length {} but recorded with {}",
                    handle,
                    len,
                    slot.length
                );
                return Err(Error::LengthMismatch);
            }
        }

        if flags.needs_import_mapping() {
            self.engine
                .map_into_contexts(slot, flags, contexts, MappingClient::User)
                .map_err(|e| {
                    StatCounters::bump(&self.stats.map_failures);
                    e
                })?;
        }

        slot.leases.acquire_user();
        StatCounters::bump(&self.stats.dedup_hits);
        log::debug!(
            "bufmgr: {:?} already in table, user refs now {}",
            handle,
            slot.leases.user_refcount()
        );
        Ok(handle)
    }

    /// Allocate backing memory and bind it to a fresh slot
    fn allocate_slot(
        &self,
        size: usize,
        flags: BufferFlags,
        now_ns: u64,
    ) -> Result<(usize, BufferHandle, MutexGuard<'_, BufferSlot>)> {
        let backing = self.allocator.allocate(size, flags).map_err(|e| {
            log::error!("bufmgr: allocation of {} bytes failed: {:?}", size, e);
            self.log_table();
            Error::from(e)
        })?;

        let (index, handle, mut slot) = match self.table.acquire(now_ns) {
            Ok(acquired) => acquired,
            Err(e) => {
                self.allocator.release(&backing);
                self.log_table();
                return Err(e);
            }
        };

        slot.length = backing.size;
        slot.backing = Some(backing);
        slot.flags = flags;
        slot.created_internally = true;
        Ok((index, handle, slot))
    }

    fn populate(
        &self,
        slot: &mut BufferSlot,
        flags: BufferFlags,
        contexts: &[ContextId],
        map_hw: bool,
    ) -> Result<()> {
        if map_hw {
            self.engine
                .map_into_contexts(slot, flags, contexts, MappingClient::User)
                .map_err(|e| {
                    StatCounters::bump(&self.stats.map_failures);
                    e
                })?;
        }
        if flags.contains(BufferFlags::KERNEL_ACCESS) {
            self.engine.map_kernel_view(slot)?;
        }
        if flags.contains(BufferFlags::REMOTE_ACCESS) {
            self.engine.map_remote(slot)?;
        }
        Ok(())
    }

    /// Finalise the handle of a populated slot
    fn publish(&self, index: usize, slot: &mut BufferSlot, handle: BufferHandle) -> BufferHandle {
        let handle = handle.with_secure(slot.flags.contains(BufferFlags::SECURE));
        slot.handle = Some(handle);

        if slot.flags.contains(BufferFlags::KERNEL_DEBUG) {
            self.debug_buffer.store(handle.raw(), Ordering::Release);
            log::info!("bufmgr: slot {} marked as kernel debug buffer", index);
        }

        #[cfg(feature = "debug")]
        log::trace!("bufmgr: published {:?}", slot.info(index));

        handle
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Device address of the buffer in `context`
    pub fn device_address(&self, handle: BufferHandle, context: ContextId) -> Result<DeviceAddress> {
        let (_, slot) = self.table.lock(handle)?;
        if let Some(mapping) = slot.mapping(context) {
            return Ok(DeviceAddress {
                iova: mapping.iova,
                len: mapping.len,
                flags: slot.flags,
            });
        }
        if let Some(region) = slot.region.filter(|r| r.context == context) {
            return Ok(DeviceAddress {
                iova: region.iova,
                len: region.len,
                flags: slot.flags,
            });
        }
        log::debug!("bufmgr: {:?} not mapped in {:?}", handle, context);
        Err(Error::ContextNotMapped)
    }

    /// Address the co-processor sees the buffer at
    ///
    /// Fails with [`Error::ContextNotMapped`] unless the buffer was created
    /// with `REMOTE_ACCESS`.
    pub fn remote_address(&self, handle: BufferHandle) -> Result<u64> {
        let (_, slot) = self.table.lock(handle)?;
        slot.remote_addr.ok_or_else(|| {
            log::debug!("bufmgr: {:?} not visible to the co-processor", handle);
            Error::ContextNotMapped
        })
    }

    /// Clean or invalidate CPU caches for a cached buffer
    ///
    /// Uncached buffers need no maintenance and succeed immediately.
    pub fn cache_op(&self, handle: BufferHandle, op: CacheOp) -> Result<()> {
        let (_, slot) = self.table.lock(handle)?;
        if !slot.flags.contains(BufferFlags::CACHED) {
            log::debug!("bufmgr: {:?} is uncached, skipping {:?}", handle, op);
            return Ok(());
        }
        let backing = slot.backing.as_ref().ok_or(Error::InvalidHandle)?;
        self.allocator.cache_maintenance(backing, op).map_err(|e| {
            log::error!("bufmgr: {:?} on {:?} failed: {:?}", op, handle, e);
            Error::CacheOpFailed
        })
    }

    // =========================================================================
    // Kernel Leases
    // =========================================================================

    /// Take a kernel lease and return the kernel mapping
    pub fn get_kernel_pointer(&self, handle: BufferHandle) -> Result<KernelView> {
        let (_, mut slot) = self.table.lock(handle)?;
        if !slot.flags.contains(BufferFlags::KERNEL_ACCESS) {
            log::error!("bufmgr: {:?} has no kernel access", handle);
            return Err(Error::KernelAccessDenied);
        }
        let view = self.engine.map_kernel_view(&mut slot)?;
        slot.leases.acquire_kernel();
        log::debug!(
            "bufmgr: kernel get {:?}, kernel refs now {}",
            handle,
            slot.leases.kernel_refcount()
        );
        Ok(view)
    }

    /// Drop a kernel lease taken with [`BufferManager::get_kernel_pointer`]
    pub fn put_kernel_pointer(&self, handle: BufferHandle) -> Result<()> {
        let (index, mut slot) = self.table.lock(handle)?;
        if !slot.flags.contains(BufferFlags::KERNEL_ACCESS) {
            log::error!("bufmgr: {:?} has no kernel access", handle);
            return Err(Error::KernelAccessDenied);
        }
        let outcome = slot.leases.put_kernel();
        self.settle(index, &mut slot, handle, outcome)
    }

    /// Take a kernel lease that is dropped with the returned guard
    pub fn lease_kernel_pointer(&self, handle: BufferHandle) -> Result<KernelLease<'_>> {
        let view = self.get_kernel_pointer(handle)?;
        Ok(KernelLease {
            manager: self,
            handle,
            view,
        })
    }

    // =========================================================================
    // Release
    // =========================================================================

    /// Drop a user reference
    pub fn release(&self, handle: BufferHandle) -> Result<()> {
        let (index, mut slot) = self.table.lock(handle)?;
        let outcome = slot.leases.release_user();
        self.settle(index, &mut slot, handle, outcome)
    }

    /// Act on the result of a decrement
    fn settle(
        &self,
        index: usize,
        slot: &mut BufferSlot,
        handle: BufferHandle,
        outcome: Result<Disposition>,
    ) -> Result<()> {
        match outcome {
            Ok(Disposition::Retain) => Ok(()),
            Ok(Disposition::Teardown) => {
                log::debug!("bufmgr: last reference to {:?} dropped", handle);
                StatCounters::bump(&self.stats.teardowns);
                self.clear_slot(index, slot)
            }
            Err(e) => {
                log::warn!(
                    "bufmgr: unbalanced release of {:?} (kernel={}, user={})",
                    handle,
                    slot.leases.kernel_refcount(),
                    slot.leases.user_refcount()
                );
                StatCounters::bump(&self.stats.unbalanced_releases);
                Err(e)
            }
        }
    }

    /// Unmap everything, return the slot, and drop the backing reference
    ///
    /// The slot is freed even if an unmap fails; the first failure is
    /// returned.
    fn clear_slot(&self, index: usize, slot: &mut BufferSlot) -> Result<()> {
        let result = self.engine.unmap_all(slot);
        if let Some(handle) = slot.handle {
            let _ = self.debug_buffer.compare_exchange(
                handle.raw(),
                0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }

        let backing: Option<BackingBuffer> = slot.backing.take();
        slot.reset();
        self.table.release(index, backing.as_ref().map(|b| b.identity));
        if let Some(backing) = backing {
            self.allocator.release(&backing);
        }
        result
    }

    /// Unwind a creation that failed after the slot was acquired
    fn discard(&self, index: usize, slot: &mut BufferSlot) {
        if let Err(e) = self.clear_slot(index, slot) {
            log::error!("bufmgr: unwinding slot {} failed: {}", index, e);
        }
    }

    // =========================================================================
    // Kernel Buffers
    // =========================================================================

    /// Allocate a kernel-owned buffer mapped into the kernel and `context`
    ///
    /// The buffer is released only by [`BufferManager::release_kernel_buffer`].
    pub fn request_kernel_buffer(
        &self,
        size: usize,
        flags: BufferFlags,
        context: ContextId,
    ) -> Result<KernelBuffer> {
        self.ensure_running()?;
        if !flags.intersects(BufferFlags::HW_READ_WRITE | BufferFlags::HW_SHARED | BufferFlags::CACHED)
        {
            log::error!("bufmgr: kernel buffer flags {:#x} not supported", flags.bits());
            return Err(Error::InvalidFlags);
        }
        let flags = flags | BufferFlags::KERNEL_ACCESS;
        check_alloc(flags, 1)?;

        let size = self.padded_size(size, flags);
        let (index, handle, mut slot) = self.allocate_slot(size, flags, self.clock.now_ns())?;
        slot.leases = LeaseCounts::new(LeasePolicy::KernelOnly);

        let (view, iova) = match self.map_for_kernel(&mut slot, flags, context) {
            Ok(mapped) => mapped,
            Err(e) => {
                self.discard(index, &mut slot);
                return Err(e);
            }
        };

        let handle = self.publish(index, &mut slot, handle);
        if let Some(identity) = slot.identity() {
            self.table.index_identity(identity, index);
        }
        StatCounters::bump(&self.stats.allocations);
        log::debug!("bufmgr: kernel buffer {:?} in {:?} at {:#x}", handle, context, iova);

        Ok(KernelBuffer {
            handle,
            kernel_addr: view.addr,
            iova,
            len: slot.length,
            context,
        })
    }

    fn map_for_kernel(
        &self,
        slot: &mut BufferSlot,
        flags: BufferFlags,
        context: ContextId,
    ) -> Result<(KernelView, u64)> {
        let view = self.engine.map_kernel_view(slot)?;
        let iovas = self
            .engine
            .map_into_contexts(slot, flags, &[context], MappingClient::Kernel)?;
        let iova = iovas.first().copied().ok_or(Error::MapFailed)?;
        Ok((view, iova))
    }

    /// Release a buffer from [`BufferManager::request_kernel_buffer`]
    pub fn release_kernel_buffer(&self, handle: BufferHandle) -> Result<()> {
        let (index, mut slot) = self.table.lock(handle)?;
        if slot.leases.policy() != LeasePolicy::KernelOnly || slot.region.is_some() {
            log::error!("bufmgr: {:?} is not a kernel buffer", handle);
            return Err(Error::InvalidHandle);
        }
        let outcome = slot.leases.drop_anchor();
        self.settle(index, &mut slot, handle, outcome)
    }

    // =========================================================================
    // Fixed Regions
    // =========================================================================

    /// Back a fixed region of `context` with a new buffer of `size` bytes
    pub fn reserve_fixed_region(
        &self,
        context: ContextId,
        kind: RegionKind,
        size: usize,
        flags: BufferFlags,
    ) -> Result<RegionBuffer> {
        self.ensure_running()?;
        check_alloc(flags, 1)?;

        let (index, handle, mut slot) = self.allocate_slot(size, flags, self.clock.now_ns())?;
        slot.leases = LeaseCounts::new(LeasePolicy::KernelOnly);

        let kernel_addr = if flags.contains(BufferFlags::KERNEL_ACCESS) {
            match self.engine.map_kernel_view(&mut slot) {
                Ok(view) => Some(view.addr),
                Err(e) => {
                    self.discard(index, &mut slot);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let region = match self.engine.install_region(&mut slot, context, kind) {
            Ok(region) => region,
            Err(e) => {
                self.discard(index, &mut slot);
                return Err(e);
            }
        };
        slot.length = region.len;

        let handle = self.publish(index, &mut slot, handle);
        if let Some(identity) = slot.identity() {
            self.table.index_identity(identity, index);
        }
        StatCounters::bump(&self.stats.allocations);
        log::info!(
            "bufmgr: {} region in {:?} at {:#x} len {} as {:?}",
            kind.name(),
            context,
            region.iova,
            region.len,
            handle
        );

        Ok(RegionBuffer {
            handle,
            context,
            kind,
            iova: region.iova,
            len: region.len,
            kernel_addr,
        })
    }

    /// Release a fixed region
    ///
    /// `context` and `kind` must match the reservation. The region mapping
    /// goes away immediately; the buffer follows once no kernel lease
    /// remains.
    pub fn free_fixed_region(
        &self,
        handle: BufferHandle,
        context: ContextId,
        kind: RegionKind,
    ) -> Result<()> {
        let (index, mut slot) = self.table.lock(handle)?;
        match slot.region {
            Some(region) if region.context == context && region.kind == kind => {}
            Some(region) => {
                log::error!(
                    "bufmgr: {:?} holds {} region in {:?}, not {} in {:?}",
                    handle,
                    region.kind.name(),
                    region.context,
                    kind.name(),
                    context
                );
                return Err(Error::RegionMismatch);
            }
            None => {
                log::error!("bufmgr: {:?} holds no fixed region", handle);
                return Err(Error::RegionMismatch);
            }
        }

        self.engine.remove_region(&mut slot)?;
        let outcome = slot.leases.drop_anchor();
        self.settle(index, &mut slot, handle, outcome)
    }

    // =========================================================================
    // Sweeps and Diagnostics
    // =========================================================================

    /// Drop one user reference of every live co-processor-visible buffer
    ///
    /// Returns how many user references were dropped. A buffer still
    /// referenced elsewhere stays in the table.
    pub fn release_remote_buffers(&self) -> usize {
        let mut dropped = 0;
        for index in 1..self.table.capacity() {
            let Some(lock) = self.table.slot(index) else {
                break;
            };
            let mut slot = lock.lock();
            if !slot.is_active() || !slot.flags.contains(BufferFlags::REMOTE_ACCESS) {
                continue;
            }
            let Some(handle) = slot.handle else {
                continue;
            };
            let outcome = slot.leases.release_user();
            match self.settle(index, &mut slot, handle, outcome) {
                Ok(()) => dropped += 1,
                Err(e) => log::warn!("bufmgr: remote release of {:?} failed: {}", handle, e),
            }
        }
        log::debug!("bufmgr: dropped {} remote buffer references", dropped);
        dropped
    }

    /// Handle of the current kernel debug buffer
    pub fn debug_buffer(&self) -> Option<BufferHandle> {
        match self.debug_buffer.load(Ordering::Acquire) {
            0 => None,
            raw => Some(BufferHandle::from_raw(raw)),
        }
    }

    /// Records for every live slot, in index order
    pub fn snapshot(&self) -> Vec<SlotInfo> {
        (1..self.table.capacity())
            .filter_map(|index| {
                let slot = self.table.slot(index)?.lock();
                slot.is_active().then(|| slot.info(index))
            })
            .collect()
    }

    /// Log every live slot
    pub fn log_table(&self) {
        let live = self.snapshot();
        log::info!("bufmgr: {} of {} slots in use", live.len(), self.config.usable_slots());
        for info in &live {
            log::info!(
                "bufmgr:   [{}] {:?} len={} flags={:#x} contexts={} k={} u={} imported={} internal={} t={}",
                info.index,
                info.handle,
                info.length,
                info.flags.bits(),
                info.contexts,
                info.kernel_refcount,
                info.user_refcount,
                info.imported,
                info.created_internally,
                info.created_ns
            );
        }
    }

    /// Tear down every live buffer regardless of outstanding references
    ///
    /// Only for subsystem shutdown: handles held elsewhere become invalid
    /// and outstanding kernel pointers dangle. The manager refuses new
    /// buffers afterwards. Returns a record for each buffer reclaimed.
    pub fn shutdown_sweep(&self) -> Vec<SlotInfo> {
        if !self.table.close() {
            log::warn!("bufmgr: shutdown sweep already ran");
        }

        let mut leaked = Vec::new();
        for index in 1..self.table.capacity() {
            let Some(lock) = self.table.slot(index) else {
                break;
            };
            let mut slot = lock.lock();
            if !slot.is_active() {
                continue;
            }

            let info = slot.info(index);
            log::warn!(
                "bufmgr: leaked slot {} {:?} created at {} ns, len={} flags={:#x} descriptor={:?} internal={} imported={} k={} u={}",
                index,
                info.handle,
                info.created_ns,
                info.length,
                info.flags.bits(),
                info.descriptor,
                info.created_internally,
                info.imported,
                info.kernel_refcount,
                info.user_refcount
            );

            if let Err(e) = self.clear_slot(index, &mut slot) {
                log::error!("bufmgr: reclaiming slot {} failed: {}", index, e);
            }
            StatCounters::bump(&self.stats.leaks_reclaimed);
            leaked.push(info);
        }

        self.debug_buffer.store(0, Ordering::Release);
        log::info!("bufmgr: shutdown sweep reclaimed {} buffers", leaked.len());
        leaked
    }
}

impl fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("config", &self.config)
            .field("table", &self.table)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// KERNEL LEASE GUARD
// =============================================================================

/// Kernel lease released on drop
#[derive(Debug)]
#[must_use = "dropping the lease releases the kernel pointer immediately"]
pub struct KernelLease<'a> {
    manager: &'a BufferManager,
    handle: BufferHandle,
    view: KernelView,
}

impl KernelLease<'_> {
    /// Get handle
    #[inline]
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Kernel mapping the lease keeps alive
    #[inline]
    pub fn view(&self) -> KernelView {
        self.view
    }
}

impl Drop for KernelLease<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.put_kernel_pointer(self.handle) {
            log::warn!("bufmgr: kernel lease on {:?} not returned: {}", self.handle, e);
        }
    }
}
