// Typed buffer allocator
//
// Creates vertex, index, uniform, storage, staging and indirect buffers,
// binds them to regions from the device memory pool and owns the
// canonical record of every allocation. Callers hold a BufferId; every
// state change (map, unmap, free) goes through the allocator.
//
// Two paths:
// - dedicated: one buffer bound to its own region, offset 0
// - pooled: one large buffer per pool, children are aligned sub-ranges
//   handed out by a bump pointer (no compaction on free)

use super::command::CommandStream;
use super::gpu::Gpu;
use super::memory::{DeviceMemoryPool, RegionId};
use crate::error::{CoreError, CoreResult};
use ash::vk;
use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};
use std::ptr::NonNull;
use std::sync::Arc;

new_key_type! {
    /// Handle to a buffer allocation owned by the allocator
    pub struct BufferId;
    /// Handle to a buffer pool owned by the allocator
    pub struct PoolId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferType {
    Vertex,
    Index,
    Uniform,
    Storage,
    Staging,
    Indirect,
}

impl BufferType {
    pub const ALL: [BufferType; 6] = [
        BufferType::Vertex,
        BufferType::Index,
        BufferType::Uniform,
        BufferType::Storage,
        BufferType::Staging,
        BufferType::Indirect,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferType::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            BufferType::Index => vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            BufferType::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            BufferType::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
            BufferType::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
            BufferType::Indirect => vk::BufferUsageFlags::INDIRECT_BUFFER,
        }
    }

    pub fn memory_properties(self) -> vk::MemoryPropertyFlags {
        match self {
            BufferType::Uniform | BufferType::Staging => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            _ => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }

    /// Uniform and staging buffers stay mapped for their whole life
    pub fn is_persistently_mapped(self) -> bool {
        matches!(self, BufferType::Uniform | BufferType::Staging)
    }

    fn default_alignment(self) -> vk::DeviceSize {
        match self {
            BufferType::Uniform => 256,
            _ => 1,
        }
    }

    pub fn default_pool_size(self) -> vk::DeviceSize {
        match self {
            BufferType::Uniform => 256 * 1024,
            BufferType::Vertex => 16 * 1024 * 1024,
            BufferType::Index => 4 * 1024 * 1024,
            BufferType::Storage => 64 * 1024 * 1024,
            BufferType::Staging => 16 * 1024 * 1024,
            BufferType::Indirect => 1024 * 1024,
        }
    }
}

/// Host pointer into mapped device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

// Mapped device memory may be written from any thread; ranges in use by
// the GPU are the caller's responsibility
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(MappedPtr)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Pointer `bytes` further into the same mapping
    fn offset(self, bytes: vk::DeviceSize) -> Self {
        // In bounds: callers only offset within the mapped region
        MappedPtr(unsafe { NonNull::new_unchecked(self.0.as_ptr().add(bytes as usize)) })
    }
}

/// Snapshot of an allocation; the allocator keeps the canonical copy
#[derive(Debug, Clone, Copy)]
pub struct BufferAllocation {
    pub buffer: vk::Buffer,
    pub region: RegionId,
    pub memory: vk::DeviceMemory,
    /// Zero for dedicated allocations, the sub-range start for pooled ones
    pub offset: vk::DeviceSize,
    /// Size rounded up to the type's alignment
    pub size: vk::DeviceSize,
    pub requested_size: vk::DeviceSize,
    pub ty: BufferType,
    pub usage: vk::BufferUsageFlags,
    pub properties: vk::MemoryPropertyFlags,
    pub mapped: Option<MappedPtr>,
    pub persistent: bool,
    pub pool: Option<PoolId>,
}

impl BufferAllocation {
    pub fn is_host_visible(&self) -> bool {
        self.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_host_coherent(&self) -> bool {
        self.properties.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

struct BufferPool {
    ty: BufferType,
    buffer: vk::Buffer,
    region: RegionId,
    memory: vk::DeviceMemory,
    total_size: vk::DeviceSize,
    used_size: vk::DeviceSize,
    alignment: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    properties: vk::MemoryPropertyFlags,
    mapped: Option<MappedPtr>,
    children: Vec<BufferId>,
}

/// Read-only view of a pool for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolInfo {
    pub ty: BufferType,
    pub total_size: vk::DeviceSize,
    pub used_size: vk::DeviceSize,
    pub children_size: vk::DeviceSize,
    pub child_count: usize,
    pub alignment: vk::DeviceSize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllocatorSettings {
    /// Route typed constructors through pools instead of dedicated memory
    pub enable_pool_allocator: bool,
}

struct AllocatorState {
    allocations: SlotMap<BufferId, BufferAllocation>,
    pools: SlotMap<PoolId, BufferPool>,
    alignments: [vk::DeviceSize; 6],
    total_allocated: vk::DeviceSize,
}

pub struct BufferAllocator {
    gpu: Arc<dyn Gpu>,
    memory: Arc<DeviceMemoryPool>,
    settings: AllocatorSettings,
    non_coherent_atom_size: vk::DeviceSize,
    inner: Mutex<Option<AllocatorState>>,
}

/// Round `value` up to `alignment`; sizes that cannot be represented are
/// reported as out of memory
fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> CoreResult<vk::DeviceSize> {
    value.checked_next_multiple_of(alignment).ok_or(CoreError::OutOfMemory)
}

/// True when `[offset, offset + len)` does not fit in `size` bytes
pub(crate) fn out_of_range(offset: vk::DeviceSize, len: vk::DeviceSize, size: vk::DeviceSize) -> bool {
    offset.checked_add(len).map_or(true, |end| end > size)
}

fn buffer_error(result: vk::Result) -> CoreError {
    CoreError::from_vk(result, |r| CoreError::BufferCreationFailed(format!("{:?}", r)))
}

impl BufferAllocator {
    pub fn new(gpu: Arc<dyn Gpu>, memory: Arc<DeviceMemoryPool>, settings: AllocatorSettings) -> Self {
        let limits = gpu.limits();

        // Alignments based on buffer type and device limits
        let mut alignments = [1; 6];
        for ty in BufferType::ALL {
            let device_minimum = match ty {
                BufferType::Storage => limits.min_storage_buffer_offset_alignment,
                _ => limits.min_uniform_buffer_offset_alignment,
            };
            alignments[ty.index()] = device_minimum.max(ty.default_alignment());
        }
        log::info!(
            "Buffer allocator ready (uniform alignment {}, storage alignment {}, pools {})",
            alignments[BufferType::Uniform.index()],
            alignments[BufferType::Storage.index()],
            if settings.enable_pool_allocator { "on" } else { "off" }
        );

        Self {
            gpu,
            memory,
            settings,
            non_coherent_atom_size: limits.non_coherent_atom_size.max(1),
            inner: Mutex::new(Some(AllocatorState {
                allocations: SlotMap::with_key(),
                pools: SlotMap::with_key(),
                alignments,
                total_allocated: 0,
            })),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut AllocatorState) -> CoreResult<R>) -> CoreResult<R> {
        let mut guard = self.inner.lock();
        let state = guard.as_mut().ok_or(CoreError::UninitializedAllocator)?;
        f(state)
    }

    pub fn alignment(&self, ty: BufferType) -> CoreResult<vk::DeviceSize> {
        self.with_state(|state| Ok(state.alignments[ty.index()]))
    }

    pub fn get(&self, id: BufferId) -> CoreResult<BufferAllocation> {
        self.with_state(|state| state.allocations.get(id).copied().ok_or(CoreError::UnknownBuffer))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Dedicated allocations
    // ─────────────────────────────────────────────────────────────────────

    /// Create a buffer with explicit usage and memory properties
    pub fn allocate(
        &self,
        ty: BufferType,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> CoreResult<BufferId> {
        self.with_state(|state| self.allocate_dedicated(state, ty, size, usage, properties))
    }

    fn allocate_dedicated(
        &self,
        state: &mut AllocatorState,
        ty: BufferType,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> CoreResult<BufferId> {
        if size == 0 {
            return Err(CoreError::BufferCreationFailed("zero-sized buffer".to_string()));
        }
        let aligned_size = align_up(size, state.alignments[ty.index()])?;
        let (buffer, region_id, memory, region_properties, mapped) =
            self.create_backed_buffer(aligned_size, usage, properties, ty.is_persistently_mapped())?;

        let allocation = BufferAllocation {
            buffer,
            region: region_id,
            memory,
            offset: 0,
            size: aligned_size,
            requested_size: size,
            ty,
            usage,
            properties: region_properties,
            mapped,
            persistent: mapped.is_some() && ty.is_persistently_mapped(),
            pool: None,
        };
        state.total_allocated += aligned_size;
        let id = state.allocations.insert(allocation);
        log::debug!("Allocated {:?} buffer: {} bytes (requested {})", ty, aligned_size, size);
        Ok(id)
    }

    /// create buffer -> region from the pool -> bind -> optional map.
    /// Anything created before a failing step is destroyed before returning.
    fn create_backed_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        map: bool,
    ) -> CoreResult<(vk::Buffer, RegionId, vk::DeviceMemory, vk::MemoryPropertyFlags, Option<MappedPtr>)> {
        let buffer = self.gpu.create_buffer(size, usage).map_err(buffer_error)?;

        let region_id = match self.memory.allocate_for_buffer(buffer, properties) {
            Ok(id) => id,
            Err(e) => {
                self.gpu.destroy_buffer(buffer);
                return Err(e);
            }
        };
        let release = |this: &Self| {
            this.gpu.destroy_buffer(buffer);
            let _ = this.memory.free_region(region_id);
        };

        let Some(region) = self.memory.region(region_id) else {
            release(self);
            return Err(CoreError::invalid("memory region vanished during allocation"));
        };

        if let Err(e) = self.gpu.bind_buffer_memory(buffer, region.memory, 0) {
            release(self);
            return Err(CoreError::from_vk(e, CoreError::BindFailed));
        }

        let mapped = if map && region.is_host_visible() {
            match self.gpu.map_memory(region.memory).map(MappedPtr::new) {
                Ok(Some(ptr)) => Some(ptr),
                Ok(None) => {
                    self.gpu.unmap_memory(region.memory);
                    release(self);
                    return Err(CoreError::MapFailed(vk::Result::ERROR_MEMORY_MAP_FAILED));
                }
                Err(e) => {
                    release(self);
                    return Err(CoreError::from_vk(e, CoreError::MapFailed));
                }
            }
        } else {
            None
        };

        Ok((buffer, region_id, region.memory, region.properties, mapped))
    }

    /// Destroy an allocation; pooled children are returned to their pool
    pub fn deallocate(&self, id: BufferId) -> CoreResult<()> {
        self.with_state(|state| {
            let allocation = state.allocations.get(id).copied().ok_or(CoreError::UnknownBuffer)?;
            if allocation.pool.is_some() {
                return Self::release_pool_child(state, id);
            }
            state.allocations.remove(id);
            state.total_allocated -= allocation.size;
            self.destroy_backed_buffer(allocation.buffer, allocation.region, allocation.memory, allocation.mapped);
            log::debug!("Deallocated {:?} buffer: {} bytes", allocation.ty, allocation.size);
            Ok(())
        })
    }

    fn destroy_backed_buffer(&self, buffer: vk::Buffer, region: RegionId, memory: vk::DeviceMemory, mapped: Option<MappedPtr>) {
        if mapped.is_some() {
            self.gpu.unmap_memory(memory);
        }
        self.gpu.destroy_buffer(buffer);
        if let Err(e) = self.memory.free_region(region) {
            log::warn!("Failed to free buffer memory: {}", e);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Typed constructors
    // ─────────────────────────────────────────────────────────────────────

    /// Create a buffer of `ty` with its standard usage and memory policy
    pub fn create_typed(&self, ty: BufferType, size: vk::DeviceSize) -> CoreResult<BufferId> {
        self.with_state(|state| {
            if self.settings.enable_pool_allocator {
                self.allocate_pooled_or_grow(state, ty, size)
            } else {
                self.allocate_dedicated(state, ty, size, ty.usage(), ty.memory_properties())
            }
        })
    }

    fn create_with_data(&self, ty: BufferType, size: vk::DeviceSize, initial: Option<&[u8]>) -> CoreResult<BufferId> {
        let id = self.create_typed(ty, size)?;
        if let Some(data) = initial {
            if let Err(e) = self.write(id, 0, data) {
                let _ = self.deallocate(id);
                return Err(e);
            }
        }
        Ok(id)
    }

    pub fn create_vertex_buffer(&self, size: vk::DeviceSize) -> CoreResult<BufferId> {
        self.create_typed(BufferType::Vertex, size)
    }

    pub fn create_index_buffer(&self, size: vk::DeviceSize) -> CoreResult<BufferId> {
        self.create_typed(BufferType::Index, size)
    }

    pub fn create_uniform_buffer(&self, size: vk::DeviceSize, initial: Option<&[u8]>) -> CoreResult<BufferId> {
        self.create_with_data(BufferType::Uniform, size, initial)
    }

    pub fn create_storage_buffer(&self, size: vk::DeviceSize) -> CoreResult<BufferId> {
        self.create_typed(BufferType::Storage, size)
    }

    pub fn create_staging_buffer(&self, size: vk::DeviceSize, initial: Option<&[u8]>) -> CoreResult<BufferId> {
        self.create_with_data(BufferType::Staging, size, initial)
    }

    pub fn create_indirect_buffer(&self, size: vk::DeviceSize) -> CoreResult<BufferId> {
        self.create_typed(BufferType::Indirect, size)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mapping
    // ─────────────────────────────────────────────────────────────────────

    /// Map an allocation; returns the stored pointer if it is already mapped
    pub fn map(&self, id: BufferId) -> CoreResult<MappedPtr> {
        self.with_state(|state| {
            let allocation = state.allocations.get_mut(id).ok_or(CoreError::UnknownBuffer)?;
            if let Some(ptr) = allocation.mapped {
                return Ok(ptr);
            }
            if !allocation.is_host_visible() {
                return Err(CoreError::MapFailed(vk::Result::ERROR_MEMORY_MAP_FAILED));
            }
            let base = self
                .gpu
                .map_memory(allocation.memory)
                .map_err(|e| CoreError::from_vk(e, CoreError::MapFailed))?;
            let ptr = MappedPtr::new(base)
                .ok_or(CoreError::MapFailed(vk::Result::ERROR_MEMORY_MAP_FAILED))?
                .offset(allocation.offset);
            allocation.mapped = Some(ptr);
            Ok(ptr)
        })
    }

    /// Unmap a mapped, non-persistent allocation
    pub fn unmap(&self, id: BufferId) -> CoreResult<()> {
        self.with_state(|state| {
            let allocation = state.allocations.get_mut(id).ok_or(CoreError::UnknownBuffer)?;
            if allocation.mapped.is_none() {
                return Err(CoreError::invalid("unmap of an allocation that is not mapped"));
            }
            if allocation.persistent {
                return Err(CoreError::invalid("unmap of a persistently mapped allocation"));
            }
            self.gpu.unmap_memory(allocation.memory);
            allocation.mapped = None;
            Ok(())
        })
    }

    /// Make host writes visible to the device. No-op on coherent memory.
    pub fn flush(&self, id: BufferId, offset: vk::DeviceSize, size: vk::DeviceSize) -> CoreResult<()> {
        let allocation = self.get(id)?;
        if allocation.is_host_coherent() {
            return Ok(());
        }
        let (start, len) = self.mapped_range(&allocation, offset, size)?;
        self.gpu
            .flush_mapped_range(allocation.memory, start, len)
            .map_err(CoreError::from)
    }

    /// Make device writes visible to the host. No-op on coherent memory.
    pub fn invalidate(&self, id: BufferId, offset: vk::DeviceSize, size: vk::DeviceSize) -> CoreResult<()> {
        let allocation = self.get(id)?;
        if allocation.is_host_coherent() {
            return Ok(());
        }
        let (start, len) = self.mapped_range(&allocation, offset, size)?;
        self.gpu
            .invalidate_mapped_range(allocation.memory, start, len)
            .map_err(CoreError::from)
    }

    /// Memory-relative range widened to the non-coherent atom size
    fn mapped_range(
        &self,
        allocation: &BufferAllocation,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> CoreResult<(vk::DeviceSize, vk::DeviceSize)> {
        if allocation.mapped.is_none() {
            return Err(CoreError::invalid("flush or invalidate of an unmapped allocation"));
        }
        let size = if size == vk::WHOLE_SIZE {
            allocation.size.saturating_sub(offset)
        } else {
            size
        };
        if out_of_range(offset, size, allocation.size) {
            return Err(CoreError::invalid("mapped range exceeds the allocation"));
        }
        let region_size = self
            .memory
            .region(allocation.region)
            .map(|r| r.size)
            .unwrap_or(allocation.offset + allocation.size);
        let atom = self.non_coherent_atom_size;
        let start = (allocation.offset + offset) / atom * atom;
        let end = align_up(allocation.offset + offset + size, atom)?.min(region_size);
        Ok((start, end - start))
    }

    /// Copy bytes into a host-visible allocation, flushing when needed
    pub fn write(&self, id: BufferId, offset: vk::DeviceSize, bytes: &[u8]) -> CoreResult<()> {
        let ptr = self.map(id)?;
        let allocation = self.get(id)?;
        if out_of_range(offset, bytes.len() as vk::DeviceSize, allocation.size) {
            return Err(CoreError::invalid(format!(
                "write of {} bytes at {} overruns {} byte buffer",
                bytes.len(),
                offset,
                allocation.size
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr().add(offset as usize), bytes.len());
        }
        self.flush(id, offset, bytes.len() as vk::DeviceSize)
    }

    /// Typed convenience over `write`
    pub fn write_pod<T: bytemuck::Pod>(&self, id: BufferId, offset: vk::DeviceSize, data: &[T]) -> CoreResult<()> {
        self.write(id, offset, bytemuck::cast_slice(data))
    }

    /// Copy bytes out of a host-visible allocation, invalidating when needed
    pub fn read(&self, id: BufferId, offset: vk::DeviceSize, len: usize) -> CoreResult<Vec<u8>> {
        let ptr = self.map(id)?;
        let allocation = self.get(id)?;
        if out_of_range(offset, len as vk::DeviceSize, allocation.size) {
            return Err(CoreError::invalid("read past the end of the allocation"));
        }
        self.invalidate(id, offset, len as vk::DeviceSize)?;
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr().add(offset as usize), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    pub fn descriptor_info(&self, id: BufferId) -> CoreResult<vk::DescriptorBufferInfo> {
        let allocation = self.get(id)?;
        Ok(vk::DescriptorBufferInfo {
            buffer: allocation.buffer,
            offset: allocation.offset,
            range: allocation.size,
        })
    }

    /// Record a copy between two allocations, honouring both offsets
    pub fn record_copy(&self, stream: &mut CommandStream, src: BufferId, dst: BufferId, size: vk::DeviceSize) -> CoreResult<()> {
        let src = self.get(src)?;
        let dst = self.get(dst)?;
        if size > src.size || size > dst.size {
            return Err(CoreError::invalid("copy larger than its source or destination"));
        }
        stream.copy_buffer(src.buffer, src.offset, dst.buffer, dst.offset, size)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pools
    // ─────────────────────────────────────────────────────────────────────

    pub fn create_pool(&self, ty: BufferType, size: vk::DeviceSize) -> CoreResult<PoolId> {
        self.with_state(|state| self.create_pool_locked(state, ty, size))
    }

    fn create_pool_locked(&self, state: &mut AllocatorState, ty: BufferType, size: vk::DeviceSize) -> CoreResult<PoolId> {
        if size == 0 {
            return Err(CoreError::BufferCreationFailed("zero-sized buffer pool".to_string()));
        }
        let alignment = state.alignments[ty.index()];
        let total_size = align_up(size, alignment)?;
        let usage = ty.usage();
        // Host-visible pools are mapped once and children share the mapping
        let (buffer, region, memory, properties, mapped) =
            self.create_backed_buffer(total_size, usage, ty.memory_properties(), true)?;

        state.total_allocated += total_size;
        let id = state.pools.insert(BufferPool {
            ty,
            buffer,
            region,
            memory,
            total_size,
            used_size: 0,
            alignment,
            usage,
            properties,
            mapped,
            children: Vec::new(),
        });
        log::debug!("Created {:?} buffer pool: {} bytes", ty, total_size);
        Ok(id)
    }

    /// Carve `size` bytes out of the first pool of `ty` with room for it
    pub fn allocate_from_pool(&self, ty: BufferType, size: vk::DeviceSize) -> CoreResult<BufferId> {
        self.with_state(|state| Self::allocate_from_pool_locked(state, ty, size))
    }

    fn allocate_from_pool_locked(state: &mut AllocatorState, ty: BufferType, size: vk::DeviceSize) -> CoreResult<BufferId> {
        if size == 0 {
            return Err(CoreError::BufferCreationFailed("zero-sized buffer".to_string()));
        }
        let aligned_size = align_up(size, state.alignments[ty.index()])?;

        let Some((pool_id, pool)) = state
            .pools
            .iter_mut()
            .find(|(_, pool)| pool.ty == ty && pool.total_size - pool.used_size >= aligned_size)
        else {
            return Err(CoreError::OutOfMemory);
        };

        let offset = pool.used_size;
        pool.used_size += aligned_size;
        let allocation = BufferAllocation {
            buffer: pool.buffer,
            region: pool.region,
            memory: pool.memory,
            offset,
            size: aligned_size,
            requested_size: size,
            ty,
            usage: pool.usage,
            properties: pool.properties,
            mapped: pool.mapped.map(|ptr| ptr.offset(offset)),
            persistent: pool.mapped.is_some(),
            pool: Some(pool_id),
        };
        let id = state.allocations.insert(allocation);
        if let Some(pool) = state.pools.get_mut(pool_id) {
            pool.children.push(id);
        }
        log::trace!("Pooled {:?} allocation: {} bytes at offset {}", ty, aligned_size, offset);
        Ok(id)
    }

    fn allocate_pooled_or_grow(&self, state: &mut AllocatorState, ty: BufferType, size: vk::DeviceSize) -> CoreResult<BufferId> {
        match Self::allocate_from_pool_locked(state, ty, size) {
            Err(CoreError::OutOfMemory) => {
                let needed = align_up(size, state.alignments[ty.index()])?;
                self.create_pool_locked(state, ty, ty.default_pool_size().max(needed))?;
                Self::allocate_from_pool_locked(state, ty, size)
            }
            other => other,
        }
    }

    /// Drop a child from its pool. The bump pointer does not move back.
    pub fn deallocate_from_pool(&self, id: BufferId) -> CoreResult<()> {
        self.with_state(|state| Self::release_pool_child(state, id))
    }

    fn release_pool_child(state: &mut AllocatorState, id: BufferId) -> CoreResult<()> {
        let allocation = state.allocations.get(id).copied().ok_or(CoreError::UnknownBuffer)?;
        let pool_id = allocation
            .pool
            .ok_or_else(|| CoreError::invalid("allocation does not belong to a pool"))?;
        let pool = state
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| CoreError::invalid("allocation refers to a destroyed pool"))?;
        pool.children.retain(|child| *child != id);
        state.allocations.remove(id);
        Ok(())
    }

    /// Destroy an empty pool
    pub fn destroy_pool(&self, id: PoolId) -> CoreResult<()> {
        self.with_state(|state| {
            let pool = state.pools.get(id).ok_or_else(|| CoreError::invalid("unknown buffer pool"))?;
            if !pool.children.is_empty() {
                return Err(CoreError::invalid("buffer pool still has live allocations"));
            }
            if let Some(pool) = state.pools.remove(id) {
                state.total_allocated -= pool.total_size;
                self.destroy_backed_buffer(pool.buffer, pool.region, pool.memory, pool.mapped);
            }
            Ok(())
        })
    }

    pub fn pool_info(&self, id: PoolId) -> CoreResult<BufferPoolInfo> {
        self.with_state(|state| {
            let pool = state.pools.get(id).ok_or_else(|| CoreError::invalid("unknown buffer pool"))?;
            let children_size = pool
                .children
                .iter()
                .filter_map(|child| state.allocations.get(*child))
                .map(|child| child.size)
                .sum();
            Ok(BufferPoolInfo {
                ty: pool.ty,
                total_size: pool.total_size,
                used_size: pool.used_size,
                children_size,
                child_count: pool.children.len(),
                alignment: pool.alignment,
            })
        })
    }

    pub fn pools(&self) -> CoreResult<Vec<PoolId>> {
        self.with_state(|state| Ok(state.pools.keys().collect()))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stats + teardown
    // ─────────────────────────────────────────────────────────────────────

    /// Bytes held in dedicated buffers and pools
    pub fn total_allocated(&self) -> vk::DeviceSize {
        self.inner.lock().as_ref().map(|s| s.total_allocated).unwrap_or(0)
    }

    /// Live GPU buffer objects (dedicated buffers plus pool buffers)
    pub fn buffer_count(&self) -> usize {
        self.inner
            .lock()
            .as_ref()
            .map(|s| s.allocations.values().filter(|a| a.pool.is_none()).count() + s.pools.len())
            .unwrap_or(0)
    }

    /// Live allocations, pooled children included
    pub fn allocation_count(&self) -> usize {
        self.inner.lock().as_ref().map(|s| s.allocations.len()).unwrap_or(0)
    }

    pub fn log_stats(&self) {
        log::info!("Buffer allocator:");
        log::info!("  Total allocated: {} KB", self.total_allocated() / 1024);
        log::info!("  Buffers: {}", self.buffer_count());
        log::info!("  Allocations: {}", self.allocation_count());
    }

    /// Destroy every buffer and pool; later calls fail with UninitializedAllocator
    pub fn shutdown(&self) {
        let Some(mut state) = self.inner.lock().take() else {
            return;
        };
        let dedicated: Vec<BufferAllocation> = state
            .allocations
            .drain()
            .map(|(_, a)| a)
            .filter(|a| a.pool.is_none())
            .collect();
        if !dedicated.is_empty() {
            log::debug!("Releasing {} buffers at shutdown", dedicated.len());
        }
        for allocation in dedicated {
            self.destroy_backed_buffer(allocation.buffer, allocation.region, allocation.memory, allocation.mapped);
        }
        for (_, pool) in state.pools.drain() {
            self.destroy_backed_buffer(pool.buffer, pool.region, pool.memory, pool.mapped);
        }
        log::info!("Buffer allocator shut down");
    }
}

impl Drop for BufferAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessConfig, HeadlessGpu};

    fn allocator_with(config: HeadlessConfig, settings: AllocatorSettings) -> (Arc<HeadlessGpu>, Arc<DeviceMemoryPool>, BufferAllocator) {
        let gpu = Arc::new(HeadlessGpu::with_config(config));
        let memory = Arc::new(DeviceMemoryPool::new(gpu.clone()));
        let allocator = BufferAllocator::new(gpu.clone(), memory.clone(), settings);
        (gpu, memory, allocator)
    }

    fn allocator() -> (Arc<HeadlessGpu>, Arc<DeviceMemoryPool>, BufferAllocator) {
        allocator_with(HeadlessConfig::default(), AllocatorSettings::default())
    }

    /// Type table: usage bits and memory properties per buffer type
    #[test]
    fn test_type_policy_table() {
        assert_eq!(
            BufferType::Vertex.usage(),
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        );
        assert_eq!(BufferType::Storage.usage(), vk::BufferUsageFlags::STORAGE_BUFFER);
        assert_eq!(BufferType::Staging.usage(), vk::BufferUsageFlags::TRANSFER_SRC);
        assert_eq!(BufferType::Indirect.memory_properties(), vk::MemoryPropertyFlags::DEVICE_LOCAL);
        assert!(BufferType::Uniform
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT));
        assert!(BufferType::Staging.is_persistently_mapped());
        assert!(!BufferType::Vertex.is_persistently_mapped());
    }

    /// Alignment is max(device minimum, type default)
    #[test]
    fn test_alignments_follow_device_limits() {
        let (_gpu, _memory, allocator) = allocator();
        assert_eq!(allocator.alignment(BufferType::Uniform).unwrap(), 256);
        assert_eq!(allocator.alignment(BufferType::Vertex).unwrap(), 64);
        assert_eq!(allocator.alignment(BufferType::Storage).unwrap(), 16);

        let (_gpu, _memory, allocator) = allocator_with(
            HeadlessConfig {
                min_uniform_buffer_offset_alignment: 512,
                ..Default::default()
            },
            AllocatorSettings::default(),
        );
        assert_eq!(allocator.alignment(BufferType::Uniform).unwrap(), 512);
    }

    #[test]
    fn test_sizes_round_up_to_alignment() {
        let (_gpu, memory, allocator) = allocator();
        let id = allocator.create_uniform_buffer(100, None).unwrap();
        let allocation = allocator.get(id).unwrap();
        assert_eq!(allocation.size, 256);
        assert_eq!(allocation.requested_size, 100);
        assert_eq!(allocation.offset, 0);
        let region = memory.region(allocation.region).unwrap();
        assert!(allocation.size <= region.size - allocation.offset);
    }

    #[test]
    fn test_zero_size_fails() {
        let (_gpu, _memory, allocator) = allocator();
        let result = allocator.allocate(
            BufferType::Vertex,
            0,
            BufferType::Vertex.usage(),
            BufferType::Vertex.memory_properties(),
        );
        assert!(matches!(result, Err(CoreError::BufferCreationFailed(_))));
        assert!(matches!(
            allocator.allocate_from_pool(BufferType::Vertex, 0),
            Err(CoreError::BufferCreationFailed(_))
        ));
    }

    /// Exhausted memory fails cleanly: no buffer or region survives
    #[test]
    fn test_out_of_memory_leaves_no_partial_state() {
        let (gpu, memory, allocator) = allocator_with(
            HeadlessConfig {
                device_heap_size: 64 * 1024,
                ..Default::default()
            },
            AllocatorSettings::default(),
        );
        let result = allocator.create_vertex_buffer(1024 * 1024);
        assert_eq!(result, Err(CoreError::OutOfMemory));
        assert_eq!(gpu.live_objects().buffers, 0);
        assert_eq!(memory.allocation_count(), 0);
        assert_eq!(allocator.allocation_count(), 0);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    /// Persistent allocations are mapped from creation until deallocation
    #[test]
    fn test_persistent_mapping_lifetime() {
        let (gpu, _memory, allocator) = allocator();
        let id = allocator.create_staging_buffer(64, Some(&[1u8; 64])).unwrap();
        let allocation = allocator.get(id).unwrap();
        assert!(allocation.persistent);
        assert!(allocation.mapped.is_some());

        assert_eq!(allocator.map(id).unwrap(), allocation.mapped.unwrap());
        assert!(matches!(allocator.unmap(id), Err(CoreError::InvalidOperation { .. })));

        allocator.deallocate(id).unwrap();
        assert_eq!(allocator.get(id).unwrap_err(), CoreError::UnknownBuffer);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    /// map; unmap; map gives a usable pointer for non-persistent allocations
    #[test]
    fn test_map_unmap_map_round_trip() {
        let (gpu, _memory, allocator) = allocator();
        let visible = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let id = allocator
            .allocate(BufferType::Vertex, 128, BufferType::Vertex.usage(), visible)
            .unwrap();
        assert!(allocator.get(id).unwrap().mapped.is_none());

        let first = allocator.map(id).unwrap();
        assert_eq!(allocator.map(id).unwrap(), first);
        allocator.write(id, 0, &[9u8; 16]).unwrap();
        allocator.unmap(id).unwrap();
        assert!(matches!(allocator.unmap(id), Err(CoreError::InvalidOperation { .. })));

        allocator.map(id).unwrap();
        assert_eq!(allocator.read(id, 0, 16).unwrap(), vec![9u8; 16]);
        allocator.deallocate(id).unwrap();
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    #[test]
    fn test_device_local_map_fails() {
        let (_gpu, _memory, allocator) = allocator();
        let id = allocator.create_vertex_buffer(64).unwrap();
        assert!(matches!(allocator.map(id), Err(CoreError::MapFailed(_))));
    }

    /// Coherent memory never reaches the driver's flush; non-coherent does
    #[test]
    fn test_flush_is_noop_on_coherent_memory() {
        let (gpu, _memory, allocator) = allocator();
        let coherent = allocator.create_uniform_buffer(64, None).unwrap();
        allocator.write(coherent, 0, &[1, 2, 3, 4]).unwrap();
        allocator.flush(coherent, 0, 4).unwrap();
        allocator.invalidate(coherent, 0, 4).unwrap();
        assert_eq!(gpu.stats().flushes, 0);
        assert_eq!(gpu.stats().invalidations, 0);

        let cached = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED;
        let id = allocator
            .allocate(BufferType::Storage, 100, vk::BufferUsageFlags::STORAGE_BUFFER, cached)
            .unwrap();
        allocator.write(id, 10, &[5u8; 20]).unwrap();
        assert_eq!(gpu.stats().flushes, 1);
        assert_eq!(allocator.read(id, 10, 20).unwrap(), vec![5u8; 20]);
        assert_eq!(gpu.stats().invalidations, 1);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    #[test]
    fn test_descriptor_info_covers_allocation() {
        let (_gpu, _memory, allocator) = allocator();
        let id = allocator.create_uniform_buffer(64, None).unwrap();
        let info = allocator.descriptor_info(id).unwrap();
        let allocation = allocator.get(id).unwrap();
        assert_eq!(info.buffer, allocation.buffer);
        assert_eq!(info.offset, 0);
        assert_eq!(info.range, 256);
    }

    /// Children are aligned and bounded: sum(children) <= used <= total
    #[test]
    fn test_pool_children_invariants() {
        let (_gpu, memory, allocator) = allocator();
        let pool = allocator.create_pool(BufferType::Uniform, 4096).unwrap();
        let ids: Vec<_> = [10u64, 300, 256, 1]
            .iter()
            .map(|s| allocator.allocate_from_pool(BufferType::Uniform, *s).unwrap())
            .collect();

        let mut previous_end = 0;
        for id in &ids {
            let a = allocator.get(*id).unwrap();
            assert_eq!(a.offset % 256, 0);
            assert!(a.offset >= previous_end);
            previous_end = a.offset + a.size;
            let region = memory.region(a.region).unwrap();
            assert!(a.size <= region.size - a.offset);
            assert!(a.mapped.is_some());
        }

        allocator.deallocate_from_pool(ids[1]).unwrap();
        let info = allocator.pool_info(pool).unwrap();
        assert!(info.children_size <= info.used_size);
        assert!(info.used_size <= info.total_size);
        // No compaction: the freed range stays consumed
        assert_eq!(info.used_size, 256 + 512 + 256 + 256);
        assert_eq!(info.child_count, 3);
    }

    #[test]
    fn test_pool_children_share_the_pool_mapping() {
        let (_gpu, _memory, allocator) = allocator();
        allocator.create_pool(BufferType::Staging, 1024).unwrap();
        let a = allocator.allocate_from_pool(BufferType::Staging, 64).unwrap();
        let b = allocator.allocate_from_pool(BufferType::Staging, 64).unwrap();
        allocator.write(a, 0, &[1u8; 64]).unwrap();
        allocator.write(b, 0, &[2u8; 64]).unwrap();
        assert_eq!(allocator.read(a, 0, 64).unwrap(), vec![1u8; 64]);
        assert_eq!(allocator.read(b, 0, 64).unwrap(), vec![2u8; 64]);
        assert_eq!(allocator.get(a).unwrap().buffer, allocator.get(b).unwrap().buffer);
    }

    #[test]
    fn test_destroy_pool_requires_no_children() {
        let (gpu, _memory, allocator) = allocator();
        let pool = allocator.create_pool(BufferType::Index, 1024).unwrap();
        let child = allocator.allocate_from_pool(BufferType::Index, 128).unwrap();
        assert!(matches!(allocator.destroy_pool(pool), Err(CoreError::InvalidOperation { .. })));
        allocator.deallocate(child).unwrap();
        allocator.destroy_pool(pool).unwrap();
        assert_eq!(gpu.live_objects().buffers, 0);
        assert_eq!(allocator.total_allocated(), 0);
    }

    /// With pooling enabled, typed constructors carve from pools and grow them
    #[test]
    fn test_pool_allocator_routing() {
        let (gpu, _memory, allocator) = allocator_with(
            HeadlessConfig::default(),
            AllocatorSettings {
                enable_pool_allocator: true,
            },
        );
        let a = allocator.create_uniform_buffer(64, Some(&[3u8; 64])).unwrap();
        let b = allocator.create_uniform_buffer(64, None).unwrap();
        assert_eq!(allocator.pools().unwrap().len(), 1);
        assert_eq!(allocator.get(b).unwrap().offset, 256);
        assert_eq!(allocator.read(a, 0, 64).unwrap(), vec![3u8; 64]);

        // Larger than the default uniform pool: a dedicated-size pool is added
        allocator.create_uniform_buffer(512 * 1024, None).unwrap();
        assert_eq!(allocator.pools().unwrap().len(), 2);
        assert_eq!(allocator.buffer_count(), 2);
        assert_eq!(gpu.live_objects().buffers, 2);
    }

    #[test]
    fn test_shutdown_uninitializes() {
        let (gpu, memory, allocator) = allocator();
        allocator.create_vertex_buffer(256).unwrap();
        allocator.create_pool(BufferType::Uniform, 1024).unwrap();
        allocator.shutdown();
        assert_eq!(
            allocator.create_vertex_buffer(16).unwrap_err(),
            CoreError::UninitializedAllocator
        );
        assert_eq!(memory.allocation_count(), 0);
        assert_eq!(gpu.live_objects().buffers, 0);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    fn pooled() -> (Arc<HeadlessGpu>, Arc<DeviceMemoryPool>, BufferAllocator) {
        allocator_with(
            HeadlessConfig::default(),
            AllocatorSettings {
                enable_pool_allocator: true,
            },
        )
    }

    /// A new pool is max(default pool size, aligned request) for every type
    #[test]
    fn test_pool_growth_sizes() {
        let (gpu, _memory, allocator) = pooled();
        for ty in [
            BufferType::Vertex,
            BufferType::Index,
            BufferType::Storage,
            BufferType::Staging,
            BufferType::Indirect,
        ] {
            let alignment = allocator.alignment(ty).unwrap();
            let small = allocator.create_typed(ty, 100).unwrap();
            let first = allocator.get(small).unwrap().pool.unwrap();
            assert_eq!(allocator.pool_info(first).unwrap().total_size, ty.default_pool_size(), "{:?}", ty);

            let large_size = ty.default_pool_size() + 1;
            let large = allocator.create_typed(ty, large_size).unwrap();
            let second = allocator.get(large).unwrap().pool.unwrap();
            assert_ne!(first, second);
            let info = allocator.pool_info(second).unwrap();
            assert_eq!(info.total_size, large_size.next_multiple_of(alignment), "{:?}", ty);
            assert_eq!(info.used_size, info.total_size);
        }
        assert_eq!(allocator.pools().unwrap().len(), 10);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    #[test]
    fn test_routed_pool_keeps_live_children() {
        let (_gpu, _memory, allocator) = pooled();
        let id = allocator.create_vertex_buffer(512).unwrap();
        let pool = allocator.get(id).unwrap().pool.unwrap();
        assert!(matches!(allocator.destroy_pool(pool), Err(CoreError::InvalidOperation { .. })));
        assert_eq!(allocator.pool_info(pool).unwrap().child_count, 1);

        allocator.deallocate(id).unwrap();
        allocator.destroy_pool(pool).unwrap();
        assert!(allocator.pools().unwrap().is_empty());
        assert_eq!(allocator.total_allocated(), 0);
    }

    #[test]
    fn test_record_copy_rejects_oversized_copy() {
        let (gpu, _memory, allocator) = allocator();
        let src = allocator.create_staging_buffer(64, None).unwrap();
        let dst = allocator.create_vertex_buffer(256).unwrap();
        let mut pool = crate::backend::command::CommandPool::new(gpu.clone()).unwrap();
        let (_, stream) = pool.acquire().unwrap();
        stream.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();

        let staged = allocator.get(src).unwrap().size;
        assert!(matches!(
            allocator.record_copy(stream, src, dst, staged + 1),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert!(matches!(
            allocator.record_copy(stream, dst, src, 256),
            Err(CoreError::InvalidOperation { .. })
        ));
        allocator.record_copy(stream, src, dst, staged).unwrap();
        stream.end().unwrap();
    }

    /// Sizes too large to align report OutOfMemory instead of overflowing
    #[test]
    fn test_unrepresentable_sizes_are_out_of_memory() {
        let (gpu, memory, allocator) = allocator();
        let huge = u64::MAX - 8;
        assert_eq!(
            allocator.allocate(
                BufferType::Vertex,
                huge,
                BufferType::Vertex.usage(),
                BufferType::Vertex.memory_properties()
            ),
            Err(CoreError::OutOfMemory)
        );
        allocator.create_pool(BufferType::Vertex, 1024).unwrap();
        assert_eq!(allocator.allocate_from_pool(BufferType::Vertex, huge), Err(CoreError::OutOfMemory));
        assert_eq!(allocator.create_pool(BufferType::Index, huge), Err(CoreError::OutOfMemory));
        assert_eq!(allocator.allocation_count(), 0);
        assert_eq!(memory.allocation_count(), 1);
        assert_eq!(gpu.live_objects().buffers, 1);

        let (_gpu, _memory, routed) = pooled();
        assert_eq!(routed.create_storage_buffer(huge), Err(CoreError::OutOfMemory));
        assert!(routed.pools().unwrap().is_empty());
    }

    /// Offsets near u64::MAX are range errors, not arithmetic overflow
    #[test]
    fn test_offsets_past_the_end_are_rejected() {
        let (_gpu, _memory, allocator) = allocator();
        let id = allocator.create_uniform_buffer(64, None).unwrap();
        assert!(matches!(
            allocator.write(id, u64::MAX, &[1]),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert!(matches!(
            allocator.read(id, u64::MAX - 1, 4),
            Err(CoreError::InvalidOperation { .. })
        ));
        let cached = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED;
        let non_coherent = allocator
            .allocate(BufferType::Storage, 128, vk::BufferUsageFlags::STORAGE_BUFFER, cached)
            .unwrap();
        allocator.map(non_coherent).unwrap();
        assert!(matches!(
            allocator.flush(non_coherent, u64::MAX, 2),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert!(matches!(
            allocator.invalidate(non_coherent, 1, u64::MAX - 1),
            Err(CoreError::InvalidOperation { .. })
        ));
    }
}

