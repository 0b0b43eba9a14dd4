// Device memory pool
//
// Owns every raw device memory allocation. Buffers and images never call
// allocate_memory themselves; they ask for a region here and bind to it.

use super::gpu::Gpu;
use crate::error::{CoreError, CoreResult};
use ash::vk;
use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};
use std::sync::Arc;

new_key_type! {
    /// Opaque handle to a region owned by the pool
    pub struct RegionId;
}

/// One contiguous device memory allocation
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub memory_type_index: u32,
    pub properties: vk::MemoryPropertyFlags,
}

impl MemoryRegion {
    pub fn is_host_visible(&self) -> bool {
        self.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_host_coherent(&self) -> bool {
        self.properties.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

struct PoolState {
    regions: SlotMap<RegionId, MemoryRegion>,
    total_allocated: vk::DeviceSize,
}

pub struct DeviceMemoryPool {
    gpu: Arc<dyn Gpu>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    state: Mutex<PoolState>,
}

impl DeviceMemoryPool {
    pub fn new(gpu: Arc<dyn Gpu>) -> Self {
        let memory_properties = gpu.memory_properties();
        log::debug!(
            "Device memory pool: {} memory types, {} heaps",
            memory_properties.memory_type_count,
            memory_properties.memory_heap_count
        );
        Self {
            gpu,
            memory_properties,
            state: Mutex::new(PoolState {
                regions: SlotMap::with_key(),
                total_allocated: 0,
            }),
        }
    }

    /// Find a suitable memory type index.
    ///
    /// Walks the reported types in order and returns the first one that is
    /// allowed by `type_filter` and carries every requested property bit.
    pub fn find_memory_type(&self, type_filter: u32, properties: vk::MemoryPropertyFlags) -> CoreResult<u32> {
        let count = self.memory_properties.memory_type_count.min(32);
        for i in 0..count {
            let has_type = (type_filter & (1 << i)) != 0;
            let has_properties = self.memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties);

            if has_type && has_properties {
                return Ok(i);
            }
        }

        Err(CoreError::NoSuitableMemoryType {
            type_filter,
            properties,
        })
    }

    /// Allocate a region of `size` bytes from a type matching filter and properties
    pub fn allocate_region(
        &self,
        size: vk::DeviceSize,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> CoreResult<RegionId> {
        if size == 0 {
            return Err(CoreError::invalid("zero-sized memory region"));
        }
        let memory_type_index = self.find_memory_type(type_filter, properties)?;
        let memory = self
            .gpu
            .allocate_memory(size, memory_type_index)
            .map_err(|e| CoreError::from_vk(e, CoreError::Api))?;

        let region = MemoryRegion {
            memory,
            size,
            memory_type_index,
            // Record what the type actually provides, not just what was asked for
            properties: self.memory_properties.memory_types[memory_type_index as usize].property_flags,
        };

        let mut state = self.state.lock();
        state.total_allocated += size;
        let id = state.regions.insert(region);
        log::debug!("Allocated memory region: {} bytes (type {})", size, memory_type_index);
        Ok(id)
    }

    /// Allocate a region that satisfies a buffer's memory requirements
    pub fn allocate_for_buffer(&self, buffer: vk::Buffer, properties: vk::MemoryPropertyFlags) -> CoreResult<RegionId> {
        let requirements = self.gpu.buffer_memory_requirements(buffer);
        self.allocate_region(requirements.size, requirements.memory_type_bits, properties)
    }

    /// Allocate a region that satisfies an image's memory requirements
    pub fn allocate_for_image(&self, image: vk::Image, properties: vk::MemoryPropertyFlags) -> CoreResult<RegionId> {
        let requirements = self.gpu.image_memory_requirements(image);
        self.allocate_region(requirements.size, requirements.memory_type_bits, properties)
    }

    pub fn free_region(&self, id: RegionId) -> CoreResult<()> {
        let region = {
            let mut state = self.state.lock();
            let region = state
                .regions
                .remove(id)
                .ok_or_else(|| CoreError::invalid("free of unknown memory region"))?;
            state.total_allocated -= region.size;
            region
        };
        self.gpu.free_memory(region.memory);
        log::debug!("Freed memory region: {} bytes", region.size);
        Ok(())
    }

    pub fn region(&self, id: RegionId) -> Option<MemoryRegion> {
        self.state.lock().regions.get(id).copied()
    }

    pub fn total_allocated(&self) -> vk::DeviceSize {
        self.state.lock().total_allocated
    }

    pub fn allocation_count(&self) -> usize {
        self.state.lock().regions.len()
    }

    /// Release everything still held (shutdown path)
    pub fn free_all(&self) {
        let regions: Vec<MemoryRegion> = {
            let mut state = self.state.lock();
            state.total_allocated = 0;
            state.regions.drain().map(|(_, region)| region).collect()
        };
        if !regions.is_empty() {
            log::warn!("Freeing {} memory regions still alive at shutdown", regions.len());
        }
        for region in regions {
            self.gpu.free_memory(region.memory);
        }
    }

    pub fn log_stats(&self) {
        let state = self.state.lock();
        log::info!("Device memory pool:");
        log::info!("  Total allocated: {} KB", state.total_allocated / 1024);
        log::info!("  Regions: {}", state.regions.len());
    }
}

impl Drop for DeviceMemoryPool {
    fn drop(&mut self) {
        self.free_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessConfig, HeadlessGpu};

    fn pool() -> (Arc<HeadlessGpu>, DeviceMemoryPool) {
        let gpu = Arc::new(HeadlessGpu::new());
        let pool = DeviceMemoryPool::new(gpu.clone());
        (gpu, pool)
    }

    /// First type in order that matches both filter and properties wins
    #[test]
    fn test_find_memory_type_first_match() {
        let (_gpu, pool) = pool();
        assert_eq!(pool.find_memory_type(0b1111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(), 0);
        assert_eq!(pool.find_memory_type(0b1110, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(), 3);
        let visible = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(pool.find_memory_type(0b1111, visible).unwrap(), 1);
    }

    #[test]
    fn test_no_suitable_memory_type() {
        let (_gpu, pool) = pool();
        let result = pool.find_memory_type(0b0001, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert!(matches!(result, Err(CoreError::NoSuitableMemoryType { .. })));
    }

    /// Tracked total always equals the sum of live region sizes
    #[test]
    fn test_total_matches_live_regions() {
        let (gpu, pool) = pool();
        let sizes = [256u64, 1024, 4096, 512];
        let ids: Vec<_> = sizes
            .iter()
            .map(|s| pool.allocate_region(*s, 0b1111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap())
            .collect();
        assert_eq!(pool.total_allocated(), sizes.iter().sum::<u64>());
        assert_eq!(pool.allocation_count(), 4);

        pool.free_region(ids[1]).unwrap();
        pool.free_region(ids[3]).unwrap();
        let live: u64 = [ids[0], ids[2]].iter().map(|id| pool.region(*id).unwrap().size).sum();
        assert_eq!(pool.total_allocated(), live);
        assert_eq!(gpu.heap_usage(0), live);
    }

    #[test]
    fn test_out_of_memory_leaves_no_region() {
        let gpu = Arc::new(HeadlessGpu::with_config(HeadlessConfig {
            device_heap_size: 4096,
            ..Default::default()
        }));
        let pool = DeviceMemoryPool::new(gpu.clone());
        let result = pool.allocate_region(8192, 0b1111, vk::MemoryPropertyFlags::DEVICE_LOCAL);
        assert_eq!(result, Err(CoreError::OutOfMemory));
        assert_eq!(pool.allocation_count(), 0);
        assert_eq!(pool.total_allocated(), 0);
    }

    #[test]
    fn test_free_all_releases_device_memory() {
        let (gpu, pool) = pool();
        pool.allocate_region(128, 0b1111, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap();
        pool.allocate_region(128, 0b1111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        pool.free_all();
        assert_eq!(gpu.live_objects().memories, 0);
        assert_eq!(pool.total_allocated(), 0);
    }
}
