//! Recording fakes for the collaborator traits.

use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use crate::backend::{
    AllocResult, BackingBuffer, BufferAllocator, Clock, ContextId, ContextMapper, Descriptor,
    DeviceMapping, Identity, KernelView, MapRequest, MapResult, RemoteMapper,
};
use crate::error::{AllocError, MapError};
use crate::flags::{AccessMode, BufferFlags, CacheOp, MappingClient, MemRegion, RegionKind};

const PAGE: usize = 4096;

// =============================================================================
// ALLOCATOR
// =============================================================================

#[derive(Debug, Default)]
struct AllocState {
    next_identity: u64,
    refs: HashMap<Identity, u32>,
    exported: HashMap<Descriptor, (Identity, usize)>,
    kernel_views: usize,
    cache_ops: usize,
    fail_allocations: bool,
    fail_kernel_maps: bool,
}

/// Allocator tracking references per object
#[derive(Debug, Default)]
pub struct FakeAllocator {
    state: Mutex<AllocState>,
}

impl FakeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an object outside the manager that can later be imported
    pub fn register(&self, descriptor: Descriptor, size: usize) -> Identity {
        let mut state = self.state.lock();
        state.next_identity += 1;
        let identity = Identity(0x1000 + state.next_identity);
        state.exported.insert(descriptor, (identity, size));
        identity
    }

    /// References the manager still holds on `identity`
    pub fn refs(&self, identity: Identity) -> u32 {
        self.state.lock().refs.get(&identity).copied().unwrap_or(0)
    }

    /// References held on all objects
    pub fn total_refs(&self) -> u32 {
        self.state.lock().refs.values().sum()
    }

    pub fn kernel_views(&self) -> usize {
        self.state.lock().kernel_views
    }

    pub fn cache_ops(&self) -> usize {
        self.state.lock().cache_ops
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.state.lock().fail_allocations = fail;
    }

    pub fn fail_kernel_maps(&self, fail: bool) {
        self.state.lock().fail_kernel_maps = fail;
    }
}

impl BufferAllocator for FakeAllocator {
    fn allocate(&self, size: usize, _flags: BufferFlags) -> AllocResult<BackingBuffer> {
        let mut state = self.state.lock();
        if state.fail_allocations {
            return Err(AllocError::OutOfMemory);
        }
        state.next_identity += 1;
        let identity = Identity(state.next_identity);
        state.refs.insert(identity, 1);
        Ok(BackingBuffer {
            identity,
            descriptor: Some(Descriptor(100 + state.next_identity as i32)),
            size: size.div_ceil(PAGE) * PAGE,
        })
    }

    fn import(&self, descriptor: Descriptor) -> AllocResult<BackingBuffer> {
        let mut state = self.state.lock();
        let (identity, size) = *state
            .exported
            .get(&descriptor)
            .ok_or(AllocError::BadDescriptor)?;
        *state.refs.entry(identity).or_insert(0) += 1;
        Ok(BackingBuffer {
            identity,
            descriptor: Some(descriptor),
            size,
        })
    }

    fn release(&self, buffer: &BackingBuffer) {
        let mut state = self.state.lock();
        let remaining = match state.refs.get_mut(&buffer.identity) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => panic!("release of unknown buffer {:?}", buffer.identity),
        };
        if remaining == 0 {
            state.refs.remove(&buffer.identity);
        }
    }

    fn map_kernel(&self, buffer: &BackingBuffer) -> AllocResult<KernelView> {
        let mut state = self.state.lock();
        if state.fail_kernel_maps {
            return Err(AllocError::KernelMapFailed);
        }
        state.kernel_views += 1;
        Ok(KernelView {
            addr: 0xffff_8000_0000_0000usize.wrapping_add((buffer.identity.0 as usize) << 24),
            len: buffer.size,
        })
    }

    fn unmap_kernel(&self, _buffer: &BackingBuffer, _view: KernelView) {
        self.state.lock().kernel_views -= 1;
    }

    fn cache_maintenance(&self, _buffer: &BackingBuffer, _op: CacheOp) -> AllocResult<()> {
        self.state.lock().cache_ops += 1;
        Ok(())
    }
}

// =============================================================================
// CONTEXT MAPPER
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Installed {
    mapping: DeviceMapping,
    secure: bool,
}

#[derive(Debug, Default)]
struct MapperState {
    next_iova: u64,
    installed: HashMap<(ContextId, Identity), Installed>,
    regions: HashMap<(ContextId, RegionKind), DeviceMapping>,
    failing: alloc::vec::Vec<ContextId>,
    shared: alloc::vec::Vec<ContextId>,
    last_request: Option<MapRequest>,
    map_calls: usize,
    unmap_calls: usize,
}

impl MapperState {
    fn install(
        &mut self,
        context: ContextId,
        buffer: &BackingBuffer,
        secure: bool,
    ) -> MapResult<DeviceMapping> {
        self.map_calls += 1;
        if self.failing.contains(&context) {
            return Err(MapError::Fault);
        }
        if let Some(existing) = self.installed.get(&(context, buffer.identity)) {
            return Err(MapError::AlreadyMapped {
                len: existing.mapping.len,
            });
        }
        let mapping = self.next_mapping(buffer.size);
        self.installed
            .insert((context, buffer.identity), Installed { mapping, secure });
        Ok(mapping)
    }

    fn remove(&mut self, context: ContextId, buffer: &BackingBuffer) -> MapResult<()> {
        self.unmap_calls += 1;
        self.installed
            .remove(&(context, buffer.identity))
            .map(|_| ())
            .ok_or(MapError::NotMapped)
    }

    fn next_mapping(&mut self, len: usize) -> DeviceMapping {
        self.next_iova += 0x10_0000;
        DeviceMapping {
            iova: 0x8000_0000 + self.next_iova,
            len,
        }
    }
}

/// Mapper handing out distinct addresses, with per-context failure injection
#[derive(Debug, Default)]
pub struct FakeMapper {
    state: Mutex<MapperState>,
}

impl FakeMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every map into `context` fail
    pub fn fail_context(&self, context: ContextId) {
        self.state.lock().failing.push(context);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    /// Pretend `identity` is already mapped into `context` with `len`
    pub fn preload(&self, context: ContextId, identity: Identity, len: usize) {
        let mut state = self.state.lock();
        let mapping = state.next_mapping(len);
        state.installed.insert(
            (context, identity),
            Installed {
                mapping,
                secure: false,
            },
        );
    }

    pub fn enable_shared_region(&self, context: ContextId) {
        self.state.lock().shared.push(context);
    }

    pub fn is_mapped(&self, context: ContextId, identity: Identity) -> bool {
        self.state.lock().installed.contains_key(&(context, identity))
    }

    pub fn live_mappings(&self) -> usize {
        self.state.lock().installed.len()
    }

    pub fn secure_mappings(&self) -> usize {
        self.state
            .lock()
            .installed
            .values()
            .filter(|i| i.secure)
            .count()
    }

    pub fn regions(&self) -> usize {
        self.state.lock().regions.len()
    }

    pub fn map_calls(&self) -> usize {
        self.state.lock().map_calls
    }

    pub fn unmap_calls(&self) -> usize {
        self.state.lock().unmap_calls
    }

    pub fn last_request(&self) -> Option<MapRequest> {
        self.state.lock().last_request
    }
}

impl ContextMapper for FakeMapper {
    fn map(&self, request: &MapRequest, buffer: &BackingBuffer) -> MapResult<DeviceMapping> {
        let mut state = self.state.lock();
        state.last_request = Some(*request);
        state.install(request.context, buffer, false)
    }

    fn map_secure(
        &self,
        context: ContextId,
        buffer: &BackingBuffer,
        _access: AccessMode,
    ) -> MapResult<DeviceMapping> {
        self.state.lock().install(context, buffer, true)
    }

    fn map_kernel_iova(
        &self,
        context: ContextId,
        buffer: &BackingBuffer,
        _region: MemRegion,
    ) -> MapResult<DeviceMapping> {
        self.state.lock().install(context, buffer, false)
    }

    fn unmap(
        &self,
        context: ContextId,
        buffer: &BackingBuffer,
        _region: MemRegion,
        _client: MappingClient,
    ) -> MapResult<()> {
        self.state.lock().remove(context, buffer)
    }

    fn unmap_secure(&self, context: ContextId, buffer: &BackingBuffer) -> MapResult<()> {
        self.state.lock().remove(context, buffer)
    }

    fn reserve_region(
        &self,
        context: ContextId,
        kind: RegionKind,
        buffer: &BackingBuffer,
    ) -> MapResult<DeviceMapping> {
        let mut state = self.state.lock();
        if state.failing.contains(&context) {
            return Err(MapError::Fault);
        }
        if state.regions.contains_key(&(context, kind)) {
            return Err(MapError::OutOfSpace);
        }
        let mapping = state.next_mapping(buffer.size);
        state.regions.insert((context, kind), mapping);
        Ok(mapping)
    }

    fn release_region(&self, context: ContextId, kind: RegionKind) -> MapResult<()> {
        self.state
            .lock()
            .regions
            .remove(&(context, kind))
            .map(|_| ())
            .ok_or(MapError::NotMapped)
    }

    fn supports_shared_region(&self, context: ContextId) -> bool {
        self.state.lock().shared.contains(&context)
    }
}

// =============================================================================
// REMOTE / CLOCK
// =============================================================================

/// Remote mapper counting published buffers
#[derive(Debug, Default)]
pub struct FakeRemote {
    published: Mutex<HashMap<Identity, u64>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> usize {
        self.published.lock().len()
    }
}

impl RemoteMapper for FakeRemote {
    fn map(&self, buffer: &BackingBuffer) -> MapResult<u64> {
        let addr = 0x4000_0000 + (buffer.identity.0 << 20);
        self.published.lock().insert(buffer.identity, addr);
        Ok(addr)
    }

    fn unmap(&self, buffer: &BackingBuffer) -> MapResult<()> {
        self.published
            .lock()
            .remove(&buffer.identity)
            .map(|_| ())
            .ok_or(MapError::NotMapped)
    }
}

/// Manually advanced clock
#[derive(Debug, Default)]
pub struct FakeClock {
    now: AtomicU64,
}

impl FakeClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::Relaxed);
    }
}

impl Clock for FakeClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}
