// Headless GPU - software implementation of the Gpu trait
//
// Runs the whole core without a driver:
// - device memory is host memory, budgeted per heap
// - the graphics queue executes lazily: batches stay pending until a
//   fence wait, queue idle or device idle retires them, so frames really
//   are "in flight" between submit and wait
// - buffer copies execute on retirement, against the bound memory
// - fences, semaphores, command buffer states, image layouts and
//   swapchain image ownership are tracked and misuse is recorded as a
//   violation instead of undefined behaviour
//
// Tests drive surface size and fault injection through the inherent API.

use super::gpu::{Gpu, GpuCommand, ImageDesc, QueueFamilies, Submission, SwapchainDesc};
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::alloc::{self, Layout};
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;

const MEMORY_BLOCK_ALIGNMENT: usize = 256;
const BUFFER_ALIGNMENT: vk::DeviceSize = 16;
const IMAGE_ALIGNMENT: vk::DeviceSize = 256;

/// Shape of the simulated device and surface
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    pub device_heap_size: vk::DeviceSize,
    pub host_heap_size: vk::DeviceSize,
    pub min_uniform_buffer_offset_alignment: vk::DeviceSize,
    pub min_storage_buffer_offset_alignment: vk::DeviceSize,
    pub non_coherent_atom_size: vk::DeviceSize,
    pub surface_extent: vk::Extent2D,
    /// When false the surface reports the "any extent" marker and the
    /// swapchain falls back to the window size
    pub fixed_surface_extent: bool,
    pub surface_formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    pub min_image_count: u32,
    pub max_image_count: u32,
    pub queue_families: QueueFamilies,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            device_heap_size: 256 * 1024 * 1024,
            host_heap_size: 256 * 1024 * 1024,
            min_uniform_buffer_offset_alignment: 64,
            min_storage_buffer_offset_alignment: 16,
            non_coherent_atom_size: 64,
            surface_extent: vk::Extent2D { width: 800, height: 600 },
            fixed_surface_extent: true,
            surface_formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            min_image_count: 1,
            max_image_count: 3,
            queue_families: QueueFamilies { graphics: 0, present: 0 },
        }
    }
}

/// Counters exposed for tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub submissions: u64,
    pub presents: u64,
    pub acquires: u64,
    pub draws: u64,
    pub copies: u64,
    pub blits: u64,
    pub flushes: u64,
    pub invalidations: u64,
    pub max_pending_submissions: usize,
}

/// Objects currently alive on the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub memories: usize,
    pub buffers: usize,
    pub images: usize,
    pub image_views: usize,
    pub command_pools: usize,
    pub fences: usize,
    pub semaphores: usize,
    pub swapchains: usize,
    pub render_passes: usize,
    pub framebuffers: usize,
}

impl LiveObjects {
    pub fn is_empty(&self) -> bool {
        *self == LiveObjects::default()
    }
}

struct MemoryBlock {
    data: NonNull<u8>,
    layout: Layout,
    size: vk::DeviceSize,
    type_index: u32,
    mapped: bool,
}

// The block is only reached through the device mutex or through pointers
// the caller obtained from map_memory
unsafe impl Send for MemoryBlock {}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.data.as_ptr(), self.layout) };
    }
}

struct BufferRecord {
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    binding: Option<(u64, vk::DeviceSize)>,
}

struct ImageRecord {
    desc: ImageDesc,
    binding: Option<(u64, vk::DeviceSize)>,
    layout: vk::ImageLayout,
    swapchain: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CbState {
    Initial,
    Recording,
    Executable,
    Pending,
}

struct CommandBufferRecord {
    pool: u64,
    state: CbState,
    one_time: bool,
    in_render_pass: bool,
    commands: Vec<GpuCommand>,
}

struct FramebufferRecord {
    attachments: Vec<u64>,
    extent: vk::Extent2D,
}

struct SwapchainRecord {
    desc: SwapchainDesc,
    images: Vec<u64>,
    held: Vec<bool>,
    next_image: usize,
}

enum QueueOp {
    Batch {
        command_buffers: Vec<u64>,
        wait: Vec<u64>,
        signal: Vec<u64>,
        fence: Option<u64>,
    },
    Present {
        swapchain: u64,
        image_index: u32,
        wait: u64,
    },
}

#[derive(Default)]
struct Faults {
    acquire: Option<vk::Result>,
    present: Option<vk::Result>,
    submit: Option<vk::Result>,
    fence_wait: Option<vk::Result>,
    device_lost: bool,
}

struct HeadlessState {
    next_handle: u64,
    surface: u64,
    surface_extent: vk::Extent2D,
    heap_usage: [vk::DeviceSize; 2],
    memories: HashMap<u64, MemoryBlock>,
    buffers: HashMap<u64, BufferRecord>,
    images: HashMap<u64, ImageRecord>,
    image_views: HashMap<u64, u64>,
    command_pools: HashMap<u64, Vec<u64>>,
    command_buffers: HashMap<u64, CommandBufferRecord>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, bool>,
    render_passes: HashMap<u64, (vk::Format, Option<vk::Format>)>,
    framebuffers: HashMap<u64, FramebufferRecord>,
    swapchains: HashMap<u64, SwapchainRecord>,
    last_swapchain_desc: Option<SwapchainDesc>,
    queue: VecDeque<QueueOp>,
    faults: Faults,
    stats: HeadlessStats,
    violations: Vec<String>,
}

/// Software device. Cheap to construct, one per test.
pub struct HeadlessGpu {
    config: HeadlessConfig,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: vk::PhysicalDeviceLimits,
    state: Mutex<HeadlessState>,
}

impl Default for HeadlessGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessGpu {
    pub fn new() -> Self {
        Self::with_config(HeadlessConfig::default())
    }

    pub fn with_config(config: HeadlessConfig) -> Self {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties::default();
        memory_properties.memory_heap_count = 2;
        memory_properties.memory_heaps[0] = vk::MemoryHeap {
            size: config.device_heap_size,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory_properties.memory_heaps[1] = vk::MemoryHeap {
            size: config.host_heap_size,
            flags: vk::MemoryHeapFlags::empty(),
        };

        // Ordered the way discrete GPUs usually report them
        let types = [
            (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
            (
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                1,
            ),
            (
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
                1,
            ),
            (
                vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                0,
            ),
        ];
        memory_properties.memory_type_count = types.len() as u32;
        for (i, (flags, heap)) in types.iter().enumerate() {
            memory_properties.memory_types[i] = vk::MemoryType {
                property_flags: *flags,
                heap_index: *heap,
            };
        }

        let limits = vk::PhysicalDeviceLimits {
            min_uniform_buffer_offset_alignment: config.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: config.min_storage_buffer_offset_alignment,
            non_coherent_atom_size: config.non_coherent_atom_size,
            max_memory_allocation_count: 4096,
            max_framebuffer_width: 16384,
            max_framebuffer_height: 16384,
            ..Default::default()
        };

        let state = HeadlessState {
            next_handle: 0x1000,
            surface: 0xface,
            surface_extent: config.surface_extent,
            heap_usage: [0; 2],
            memories: HashMap::new(),
            buffers: HashMap::new(),
            images: HashMap::new(),
            image_views: HashMap::new(),
            command_pools: HashMap::new(),
            command_buffers: HashMap::new(),
            fences: HashMap::new(),
            semaphores: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            swapchains: HashMap::new(),
            last_swapchain_desc: None,
            queue: VecDeque::new(),
            faults: Faults::default(),
            stats: HeadlessStats::default(),
            violations: Vec::new(),
        };

        Self {
            config,
            memory_properties,
            limits,
            state: Mutex::new(state),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Test controls
    // ─────────────────────────────────────────────────────────────────────

    /// The single presentation surface this device exposes
    pub fn surface(&self) -> vk::SurfaceKHR {
        vk::SurfaceKHR::from_raw(self.state.lock().surface)
    }

    /// Simulate a window resize (0x0 is a minimized window)
    pub fn set_surface_extent(&self, width: u32, height: u32) {
        self.state.lock().surface_extent = vk::Extent2D { width, height };
    }

    pub fn fail_next_acquire(&self, result: vk::Result) {
        self.state.lock().faults.acquire = Some(result);
    }

    pub fn fail_next_present(&self, result: vk::Result) {
        self.state.lock().faults.present = Some(result);
    }

    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.lock().faults.submit = Some(result);
    }

    /// The next fence wait returns `result` without retiring any work
    pub fn fail_next_fence_wait(&self, result: vk::Result) {
        self.state.lock().faults.fence_wait = Some(result);
    }

    /// Every queue and wait operation reports ERROR_DEVICE_LOST from now on
    pub fn lose_device(&self) {
        self.state.lock().faults.device_lost = true;
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn stats(&self) -> HeadlessStats {
        self.state.lock().stats
    }

    pub fn pending_submissions(&self) -> usize {
        self.state
            .lock()
            .queue
            .iter()
            .filter(|op| matches!(op, QueueOp::Batch { .. }))
            .count()
    }

    pub fn unsignaled_fences(&self) -> usize {
        self.state.lock().fences.values().filter(|signaled| !**signaled).count()
    }

    pub fn heap_usage(&self, heap: usize) -> vk::DeviceSize {
        self.state.lock().heap_usage.get(heap).copied().unwrap_or(0)
    }

    pub fn last_swapchain_desc(&self) -> Option<SwapchainDesc> {
        self.state.lock().last_swapchain_desc.clone()
    }

    pub fn image_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.state.lock().images.get(&image.as_raw()).map(|i| i.layout)
    }

    /// Put an image straight into `layout`, as if an earlier pass had left it there
    pub fn set_image_layout(&self, image: vk::Image, layout: vk::ImageLayout) {
        if let Some(record) = self.state.lock().images.get_mut(&image.as_raw()) {
            record.layout = layout;
        }
    }

    pub fn live_objects(&self) -> LiveObjects {
        let state = self.state.lock();
        LiveObjects {
            memories: state.memories.len(),
            buffers: state.buffers.len(),
            images: state.images.values().filter(|i| i.swapchain.is_none()).count(),
            image_views: state.image_views.len(),
            command_pools: state.command_pools.len(),
            fences: state.fences.len(),
            semaphores: state.semaphores.len(),
            swapchains: state.swapchains.len(),
            render_passes: state.render_passes.len(),
            framebuffers: state.framebuffers.len(),
        }
    }

    /// Read buffer contents directly, bypassing the queue
    pub fn peek_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, len: usize) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let record = state.buffers.get(&buffer.as_raw())?;
        let (memory, bind_offset) = record.binding?;
        if offset + len as vk::DeviceSize > record.size {
            return None;
        }
        let block = state.memories.get(&memory)?;
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(
                block.data.as_ptr().add((bind_offset + offset) as usize),
                out.as_mut_ptr(),
                len,
            );
        }
        Some(out)
    }
}

impl HeadlessState {
    fn next<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }

    fn violation(&mut self, message: String) {
        log::warn!("[headless] {}", message);
        self.violations.push(message);
    }

    fn pending_batches(&self) -> usize {
        self.queue
            .iter()
            .filter(|op| matches!(op, QueueOp::Batch { .. }))
            .count()
    }

    fn fence_pending(&self, fence: u64) -> bool {
        self.queue
            .iter()
            .any(|op| matches!(op, QueueOp::Batch { fence: Some(f), .. } if *f == fence))
    }

    fn buffer_in_flight(&self, buffer: u64) -> bool {
        self.queue.iter().any(|op| match op {
            QueueOp::Batch { command_buffers, .. } => command_buffers.iter().any(|cb| {
                self.command_buffers.get(cb).is_some_and(|record| {
                    record.commands.iter().any(|command| match command {
                        GpuCommand::CopyBuffer { src, dst, .. } => {
                            src.as_raw() == buffer || dst.as_raw() == buffer
                        }
                        GpuCommand::BindVertexBuffer { buffer: b, .. }
                        | GpuCommand::BindIndexBuffer { buffer: b, .. } => b.as_raw() == buffer,
                        GpuCommand::CopyBufferToImage { src, .. } => src.as_raw() == buffer,
                        _ => false,
                    })
                })
            }),
            QueueOp::Present { .. } => false,
        })
    }

    fn command_buffer_pending(&self, cb: u64) -> bool {
        self.command_buffers
            .get(&cb)
            .is_some_and(|record| record.state == CbState::Pending)
    }

    fn retire_all(&mut self) {
        while let Some(op) = self.queue.pop_front() {
            self.retire(op);
        }
    }

    fn retire_front(&mut self) -> bool {
        match self.queue.pop_front() {
            Some(op) => {
                self.retire(op);
                true
            }
            None => false,
        }
    }

    fn retire(&mut self, op: QueueOp) {
        match op {
            QueueOp::Batch {
                command_buffers,
                wait,
                signal,
                fence,
            } => {
                for semaphore in wait {
                    match self.semaphores.get(&semaphore).copied() {
                        Some(true) => {
                            self.semaphores.insert(semaphore, false);
                        }
                        Some(false) => self.violation(format!(
                            "batch waited on semaphore {:#x} that was never signaled",
                            semaphore
                        )),
                        None => self.violation(format!("batch waited on destroyed semaphore {:#x}", semaphore)),
                    }
                }
                for cb in command_buffers {
                    self.execute(cb);
                }
                for semaphore in signal {
                    match self.semaphores.get(&semaphore).copied() {
                        Some(false) => {
                            self.semaphores.insert(semaphore, true);
                        }
                        Some(true) => self.violation(format!(
                            "batch signaled semaphore {:#x} that was already signaled",
                            semaphore
                        )),
                        None => self.violation(format!("batch signaled destroyed semaphore {:#x}", semaphore)),
                    }
                }
                if let Some(fence) = fence {
                    if let Some(signaled) = self.fences.get_mut(&fence) {
                        *signaled = true;
                    }
                }
            }
            QueueOp::Present {
                swapchain,
                image_index,
                wait,
            } => {
                match self.semaphores.get(&wait).copied() {
                    Some(true) => {
                        self.semaphores.insert(wait, false);
                    }
                    _ => self.violation(format!(
                        "present waited on semaphore {:#x} that was never signaled",
                        wait
                    )),
                }
                let image = self
                    .swapchains
                    .get(&swapchain)
                    .and_then(|sc| sc.images.get(image_index as usize).copied());
                if let Some(image) = image {
                    let layout = self.images.get(&image).map(|i| i.layout);
                    if layout != Some(vk::ImageLayout::PRESENT_SRC_KHR) {
                        self.violation(format!(
                            "presented image {} in layout {:?}",
                            image_index, layout
                        ));
                    }
                }
                if let Some(sc) = self.swapchains.get_mut(&swapchain) {
                    if let Some(held) = sc.held.get_mut(image_index as usize) {
                        *held = false;
                    }
                }
            }
        }
    }

    fn execute(&mut self, cb: u64) {
        let (commands, one_time) = match self.command_buffers.get(&cb) {
            Some(record) => (record.commands.clone(), record.one_time),
            None => {
                self.violation(format!("executed freed command buffer {:#x}", cb));
                return;
            }
        };

        let mut framebuffer = None;
        for command in &commands {
            match command {
                GpuCommand::CopyBuffer { src, dst, region } => {
                    let src_ptr = self.buffer_ptr(
                        src.as_raw(),
                        region.src_offset,
                        region.size,
                        vk::BufferUsageFlags::TRANSFER_SRC,
                        "copy source",
                    );
                    let dst_ptr = self.buffer_ptr(
                        dst.as_raw(),
                        region.dst_offset,
                        region.size,
                        vk::BufferUsageFlags::TRANSFER_DST,
                        "copy destination",
                    );
                    if let (Some(s), Some(d)) = (src_ptr, dst_ptr) {
                        unsafe { std::ptr::copy(s, d, region.size as usize) };
                        self.stats.copies += 1;
                    }
                }
                GpuCommand::CopyBufferToImage {
                    src,
                    dst,
                    dst_layout,
                    region,
                } => {
                    let extent = region.image_extent;
                    let len = extent.width as vk::DeviceSize
                        * extent.height as vk::DeviceSize
                        * extent.depth.max(1) as vk::DeviceSize
                        * 4;
                    let src_ptr = self.buffer_ptr(
                        src.as_raw(),
                        region.buffer_offset,
                        len,
                        vk::BufferUsageFlags::TRANSFER_SRC,
                        "image copy source",
                    );
                    let dst_ptr = self.image_ptr(dst.as_raw(), *dst_layout, len);
                    if let (Some(s), Some(d)) = (src_ptr, dst_ptr) {
                        unsafe { std::ptr::copy(s, d, len as usize) };
                        self.stats.copies += 1;
                    }
                }
                GpuCommand::ImageBarrier {
                    image,
                    old_layout,
                    new_layout,
                    ..
                } => {
                    let current = self.images.get(&image.as_raw()).map(|i| i.layout);
                    match current {
                        None => self.violation(format!("barrier on unknown image {:#x}", image.as_raw())),
                        Some(current) => {
                            if *old_layout != vk::ImageLayout::UNDEFINED && current != *old_layout {
                                self.violation(format!(
                                    "barrier expected layout {:?} but image is in {:?}",
                                    old_layout, current
                                ));
                            }
                            if let Some(record) = self.images.get_mut(&image.as_raw()) {
                                record.layout = *new_layout;
                            }
                        }
                    }
                }
                GpuCommand::BeginRenderPass {
                    framebuffer: fb,
                    render_area,
                    ..
                } => {
                    match self.framebuffers.get(&fb.as_raw()) {
                        Some(record) => {
                            let right = render_area.offset.x.max(0) as u32 + render_area.extent.width;
                            let bottom = render_area.offset.y.max(0) as u32 + render_area.extent.height;
                            if right > record.extent.width || bottom > record.extent.height {
                                let message = format!(
                                    "render area {}x{} exceeds framebuffer {}x{}",
                                    right, bottom, record.extent.width, record.extent.height
                                );
                                self.violation(message);
                            }
                        }
                        None => self.violation(format!("render pass began on unknown framebuffer {:#x}", fb.as_raw())),
                    }
                    framebuffer = Some(fb.as_raw());
                }
                GpuCommand::EndRenderPass => {
                    // Color ends in PRESENT_SRC, depth in its attachment layout
                    let attachments = framebuffer
                        .take()
                        .and_then(|fb| self.framebuffers.get(&fb))
                        .map(|record| record.attachments.clone())
                        .unwrap_or_default();
                    for (i, view) in attachments.iter().enumerate() {
                        let image = self.image_views.get(view).copied();
                        if let Some(record) = image.and_then(|image| self.images.get_mut(&image)) {
                            record.layout = if i == 0 {
                                vk::ImageLayout::PRESENT_SRC_KHR
                            } else {
                                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                            };
                        }
                    }
                }
                GpuCommand::BindVertexBuffer { buffer, .. } => {
                    self.check_buffer_usage(buffer.as_raw(), vk::BufferUsageFlags::VERTEX_BUFFER, "vertex binding");
                }
                GpuCommand::BindIndexBuffer { buffer, .. } => {
                    self.check_buffer_usage(buffer.as_raw(), vk::BufferUsageFlags::INDEX_BUFFER, "index binding");
                }
                GpuCommand::Draw { .. } | GpuCommand::DrawIndexed { .. } => {
                    self.stats.draws += 1;
                }
                GpuCommand::BlitImage {
                    src,
                    src_layout,
                    dst,
                    dst_layout,
                    ..
                } => {
                    let src_ok = self.check_blit_image(src.as_raw(), *src_layout, vk::ImageUsageFlags::TRANSFER_SRC);
                    let dst_ok = self.check_blit_image(dst.as_raw(), *dst_layout, vk::ImageUsageFlags::TRANSFER_DST);
                    if src_ok && dst_ok {
                        self.stats.blits += 1;
                    }
                }
                _ => {}
            }
        }

        if let Some(record) = self.command_buffers.get_mut(&cb) {
            record.state = if one_time {
                CbState::Initial
            } else {
                CbState::Executable
            };
        }
    }

    fn check_buffer_usage(&mut self, buffer: u64, usage: vk::BufferUsageFlags, what: &str) {
        match self.buffers.get(&buffer) {
            Some(record) if record.usage.contains(usage) => {}
            Some(record) => {
                let message = format!("{} buffer {:#x} lacks usage {:?} (has {:?})", what, buffer, usage, record.usage);
                self.violation(message);
            }
            None => self.violation(format!("{} on unknown buffer {:#x}", what, buffer)),
        }
    }

    fn buffer_ptr(
        &mut self,
        buffer: u64,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        what: &str,
    ) -> Option<*mut u8> {
        self.check_buffer_usage(buffer, usage, what);
        let (size, binding, has_usage) = match self.buffers.get(&buffer) {
            Some(record) => (record.size, record.binding, record.usage.contains(usage)),
            None => return None,
        };
        if !has_usage {
            return None;
        }
        if offset + len > size {
            self.violation(format!(
                "{} range {}..{} outside buffer of {} bytes",
                what,
                offset,
                offset + len,
                size
            ));
            return None;
        }
        let Some((memory, bind_offset)) = binding else {
            self.violation(format!("{} buffer {:#x} has no memory bound", what, buffer));
            return None;
        };
        let block = self.memories.get(&memory)?;
        Some(unsafe { block.data.as_ptr().add((bind_offset + offset) as usize) })
    }

    fn check_blit_image(&mut self, image: u64, layout: vk::ImageLayout, usage: vk::ImageUsageFlags) -> bool {
        let Some(record) = self.images.get(&image) else {
            self.violation(format!("blit with unknown image {:#x}", image));
            return false;
        };
        let (current, bound, flags) = (record.layout, record.binding.is_some() || record.swapchain.is_some(), record.desc.usage);
        if !flags.contains(usage) {
            self.violation(format!("blit image {:#x} lacks {:?} usage", image, usage));
            return false;
        }
        if !bound {
            self.violation(format!("blit with image {:#x} that has no memory", image));
            return false;
        }
        if current != layout {
            self.violation(format!("blit expected layout {:?} but image is in {:?}", layout, current));
            return false;
        }
        true
    }

    fn image_ptr(&mut self, image: u64, layout: vk::ImageLayout, len: vk::DeviceSize) -> Option<*mut u8> {
        let (current, binding, usage) = match self.images.get(&image) {
            Some(record) => (record.layout, record.binding, record.desc.usage),
            None => {
                self.violation(format!("copy into unknown image {:#x}", image));
                return None;
            }
        };
        if !usage.contains(vk::ImageUsageFlags::TRANSFER_DST) {
            self.violation(format!("copy into image {:#x} without TRANSFER_DST usage", image));
            return None;
        }
        if current != layout || layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
            self.violation(format!(
                "copy into image in layout {:?} (declared {:?})",
                current, layout
            ));
            return None;
        }
        let (memory, offset) = binding?;
        let block = self.memories.get(&memory)?;
        if offset + len > block.size {
            self.violation(format!("image copy of {} bytes overruns its memory", len));
            return None;
        }
        Some(unsafe { block.data.as_ptr().add(offset as usize) })
    }
}

/// Saturates so oversized requests fail the heap budget check
fn round_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    value.checked_next_multiple_of(alignment).unwrap_or(vk::DeviceSize::MAX)
}

fn format_size(format: vk::Format) -> vk::DeviceSize {
    match format {
        vk::Format::R8_UNORM => 1,
        vk::Format::R16G16B16A16_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => 4,
    }
}

impl Gpu for HeadlessGpu {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.memory_properties
    }

    fn limits(&self) -> vk::PhysicalDeviceLimits {
        self.limits
    }

    fn queue_families(&self) -> QueueFamilies {
        self.config.queue_families
    }

    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> VkResult<vk::DeviceMemory> {
        let mut state = self.state.lock();
        if memory_type_index >= self.memory_properties.memory_type_count {
            state.violation(format!("allocation from invalid memory type {}", memory_type_index));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        if size == 0 {
            state.violation("zero-sized memory allocation".to_string());
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let heap = self.memory_properties.memory_types[memory_type_index as usize].heap_index as usize;
        let budget = self.memory_properties.memory_heaps[heap].size;
        if state.heap_usage[heap].checked_add(size).map_or(true, |total| total > budget) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }

        let layout = Layout::from_size_align(size as usize, MEMORY_BLOCK_ALIGNMENT)
            .map_err(|_| vk::Result::ERROR_OUT_OF_HOST_MEMORY)?;
        let data = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)?;

        let memory: vk::DeviceMemory = state.next();
        state.heap_usage[heap] += size;
        state.memories.insert(
            memory.as_raw(),
            MemoryBlock {
                data,
                layout,
                size,
                type_index: memory_type_index,
                mapped: false,
            },
        );
        Ok(memory)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        let raw = memory.as_raw();
        let still_bound = state.buffers.values().any(|b| b.binding.is_some_and(|(m, _)| m == raw))
            || state.images.values().any(|i| i.binding.is_some_and(|(m, _)| m == raw));
        if still_bound {
            state.violation(format!("freed memory {:#x} while a resource is still bound to it", raw));
        }
        match state.memories.remove(&raw) {
            Some(block) => {
                let heap = self.memory_properties.memory_types[block.type_index as usize].heap_index as usize;
                state.heap_usage[heap] -= block.size;
            }
            None => state.violation(format!("freed unknown memory {:#x}", raw)),
        }
    }

    fn map_memory(&self, memory: vk::DeviceMemory) -> VkResult<*mut u8> {
        let mut state = self.state.lock();
        let properties = self.memory_properties.memory_types;
        let Some(block) = state.memories.get_mut(&memory.as_raw()) else {
            state.violation(format!("mapped unknown memory {:#x}", memory.as_raw()));
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        };
        let flags = properties[block.type_index as usize].property_flags;
        if !flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        if block.mapped {
            state.violation(format!("memory {:#x} mapped twice", memory.as_raw()));
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        block.mapped = true;
        Ok(block.data.as_ptr())
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        match state.memories.get_mut(&memory.as_raw()) {
            Some(block) if block.mapped => block.mapped = false,
            _ => state.violation(format!("unmapped memory {:#x} that was not mapped", memory.as_raw())),
        }
    }

    fn flush_mapped_range(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<()> {
        let mut state = self.state.lock();
        let ok = state
            .memories
            .get(&memory.as_raw())
            .is_some_and(|b| b.mapped && (size == vk::WHOLE_SIZE || offset + size <= b.size));
        if !ok {
            state.violation(format!("flush of unmapped or out-of-range memory {:#x}", memory.as_raw()));
        }
        state.stats.flushes += 1;
        Ok(())
    }

    fn invalidate_mapped_range(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<()> {
        let mut state = self.state.lock();
        let ok = state
            .memories
            .get(&memory.as_raw())
            .is_some_and(|b| b.mapped && (size == vk::WHOLE_SIZE || offset + size <= b.size));
        if !ok {
            state.violation(format!("invalidate of unmapped or out-of-range memory {:#x}", memory.as_raw()));
        }
        state.stats.invalidations += 1;
        Ok(())
    }

    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer> {
        let mut state = self.state.lock();
        if size == 0 || usage.is_empty() {
            state.violation(format!("buffer created with size {} and usage {:?}", size, usage));
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let buffer: vk::Buffer = state.next();
        state.buffers.insert(
            buffer.as_raw(),
            BufferRecord {
                size,
                usage,
                binding: None,
            },
        );
        Ok(buffer)
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let state = self.state.lock();
        let size = state.buffers.get(&buffer.as_raw()).map(|b| b.size).unwrap_or(0);
        vk::MemoryRequirements {
            size: round_up(size, BUFFER_ALIGNMENT),
            alignment: BUFFER_ALIGNMENT,
            memory_type_bits: (1 << self.memory_properties.memory_type_count) - 1,
        }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> VkResult<()> {
        let mut state = self.state.lock();
        let memory_size = match state.memories.get(&memory.as_raw()) {
            Some(block) => block.size,
            None => {
                state.violation(format!("bind to unknown memory {:#x}", memory.as_raw()));
                return Err(vk::Result::ERROR_UNKNOWN);
            }
        };
        let Some(record) = state.buffers.get_mut(&buffer.as_raw()) else {
            state.violation(format!("bind of unknown buffer {:#x}", buffer.as_raw()));
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        if record.binding.is_some() {
            state.violation(format!("buffer {:#x} bound twice", buffer.as_raw()));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let required = round_up(record.size, BUFFER_ALIGNMENT);
        if offset % BUFFER_ALIGNMENT != 0 || offset + required > memory_size {
            let message = format!(
                "buffer of {} bytes bound at offset {} into memory of {} bytes",
                record.size, offset, memory_size
            );
            state.violation(message);
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        record.binding = Some((memory.as_raw(), offset));
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        if state.buffer_in_flight(buffer.as_raw()) {
            state.violation(format!("destroyed buffer {:#x} still used by pending work", buffer.as_raw()));
        }
        if state.buffers.remove(&buffer.as_raw()).is_none() {
            state.violation(format!("destroyed unknown buffer {:#x}", buffer.as_raw()));
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image> {
        let mut state = self.state.lock();
        if desc.extent.width == 0 || desc.extent.height == 0 {
            state.violation("zero-sized image".to_string());
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let image: vk::Image = state.next();
        state.images.insert(
            image.as_raw(),
            ImageRecord {
                desc: *desc,
                binding: None,
                layout: vk::ImageLayout::UNDEFINED,
                swapchain: None,
            },
        );
        Ok(image)
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let state = self.state.lock();
        let size = state
            .images
            .get(&image.as_raw())
            .map(|i| {
                i.desc.extent.width as vk::DeviceSize
                    * i.desc.extent.height as vk::DeviceSize
                    * format_size(i.desc.format)
            })
            .unwrap_or(0);
        vk::MemoryRequirements {
            size: round_up(size, IMAGE_ALIGNMENT),
            alignment: IMAGE_ALIGNMENT,
            // Device-local types only
            memory_type_bits: 0b1001,
        }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> VkResult<()> {
        let mut state = self.state.lock();
        if !state.memories.contains_key(&memory.as_raw()) {
            state.violation(format!("bind to unknown memory {:#x}", memory.as_raw()));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        match state.images.get_mut(&image.as_raw()) {
            Some(record) if record.binding.is_none() && record.swapchain.is_none() => {
                record.binding = Some((memory.as_raw(), offset));
                Ok(())
            }
            _ => {
                state.violation(format!("invalid bind of image {:#x}", image.as_raw()));
                Err(vk::Result::ERROR_UNKNOWN)
            }
        }
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.lock();
        match state.images.get(&image.as_raw()) {
            Some(record) if record.swapchain.is_some() => {
                state.violation(format!("destroyed swapchain-owned image {:#x}", image.as_raw()));
            }
            Some(_) => {
                state.images.remove(&image.as_raw());
            }
            None => state.violation(format!("destroyed unknown image {:#x}", image.as_raw())),
        }
    }

    fn create_image_view(&self, image: vk::Image, _format: vk::Format, _aspect: vk::ImageAspectFlags) -> VkResult<vk::ImageView> {
        let mut state = self.state.lock();
        if !state.images.contains_key(&image.as_raw()) {
            state.violation(format!("view of unknown image {:#x}", image.as_raw()));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let view: vk::ImageView = state.next();
        state.image_views.insert(view.as_raw(), image.as_raw());
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.lock();
        if state.image_views.remove(&view.as_raw()).is_none() {
            state.violation(format!("destroyed unknown image view {:#x}", view.as_raw()));
        }
    }

    fn create_command_pool(&self, _flags: vk::CommandPoolCreateFlags) -> VkResult<vk::CommandPool> {
        let mut state = self.state.lock();
        let pool: vk::CommandPool = state.next();
        state.command_pools.insert(pool.as_raw(), Vec::new());
        Ok(pool)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        let mut state = self.state.lock();
        let Some(buffers) = state.command_pools.get(&pool.as_raw()).cloned() else {
            state.violation(format!("reset of unknown command pool {:#x}", pool.as_raw()));
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        if buffers.iter().any(|cb| state.command_buffer_pending(*cb)) {
            state.violation("command pool reset while a command buffer is pending".to_string());
        }
        for cb in buffers {
            if let Some(record) = state.command_buffers.get_mut(&cb) {
                record.state = CbState::Initial;
                record.in_render_pass = false;
                record.commands.clear();
            }
        }
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        let Some(buffers) = state.command_pools.remove(&pool.as_raw()) else {
            state.violation(format!("destroyed unknown command pool {:#x}", pool.as_raw()));
            return;
        };
        if buffers.iter().any(|cb| state.command_buffer_pending(*cb)) {
            state.violation("command pool destroyed while a command buffer is pending".to_string());
        }
        for cb in buffers {
            state.command_buffers.remove(&cb);
        }
    }

    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        if !state.command_pools.contains_key(&pool.as_raw()) {
            state.violation(format!("allocation from unknown command pool {:#x}", pool.as_raw()));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let cb: vk::CommandBuffer = state.next();
            state.command_buffers.insert(
                cb.as_raw(),
                CommandBufferRecord {
                    pool: pool.as_raw(),
                    state: CbState::Initial,
                    one_time: false,
                    in_render_pass: false,
                    commands: Vec::new(),
                },
            );
            if let Some(buffers) = state.command_pools.get_mut(&pool.as_raw()) {
                buffers.push(cb.as_raw());
            }
            out.push(cb);
        }
        Ok(out)
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> VkResult<()> {
        let mut state = self.state.lock();
        let Some(record) = state.command_buffers.get_mut(&buffer.as_raw()) else {
            state.violation(format!("begin on unknown command buffer {:#x}", buffer.as_raw()));
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        match record.state {
            CbState::Initial | CbState::Executable => {
                record.state = CbState::Recording;
                record.one_time = flags.contains(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                record.in_render_pass = false;
                record.commands.clear();
                Ok(())
            }
            other => {
                state.violation(format!("begin on command buffer in state {:?}", other));
                Err(vk::Result::ERROR_UNKNOWN)
            }
        }
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        let Some(record) = state.command_buffers.get_mut(&buffer.as_raw()) else {
            state.violation(format!("end on unknown command buffer {:#x}", buffer.as_raw()));
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        if record.state != CbState::Recording || record.in_render_pass {
            let message = format!(
                "end on command buffer in state {:?} (inside render pass: {})",
                record.state, record.in_render_pass
            );
            state.violation(message);
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        record.state = CbState::Executable;
        Ok(())
    }

    fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        if state.command_buffer_pending(buffer.as_raw()) {
            state.violation(format!("reset of pending command buffer {:#x}", buffer.as_raw()));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        match state.command_buffers.get_mut(&buffer.as_raw()) {
            Some(record) => {
                record.state = CbState::Initial;
                record.in_render_pass = false;
                record.commands.clear();
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn record(&self, buffer: vk::CommandBuffer, command: &GpuCommand) {
        let mut state = self.state.lock();
        let Some(record) = state.command_buffers.get_mut(&buffer.as_raw()) else {
            state.violation(format!("record into unknown command buffer {:#x}", buffer.as_raw()));
            return;
        };
        if record.state != CbState::Recording {
            let message = format!("record into command buffer in state {:?}", record.state);
            state.violation(message);
            return;
        }
        if command.requires_render_pass() && !record.in_render_pass {
            state.violation("draw recorded outside a render pass".to_string());
            return;
        }
        if command.forbidden_in_render_pass() && record.in_render_pass {
            state.violation("transfer or nested pass recorded inside a render pass".to_string());
            return;
        }
        match command {
            GpuCommand::BeginRenderPass { .. } => record.in_render_pass = true,
            GpuCommand::EndRenderPass => {
                if !record.in_render_pass {
                    state.violation("end render pass without a matching begin".to_string());
                    return;
                }
                record.in_render_pass = false;
            }
            _ => {}
        }
        record.commands.push(command.clone());
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence: vk::Fence = state.next();
        state.fences.insert(fence.as_raw(), signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        if state.fence_pending(fence.as_raw()) {
            state.violation(format!("destroyed fence {:#x} with pending work", fence.as_raw()));
        }
        if state.fences.remove(&fence.as_raw()).is_none() {
            state.violation(format!("destroyed unknown fence {:#x}", fence.as_raw()));
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        if state.faults.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        if let Some(result) = state.faults.fence_wait.take() {
            return Err(result);
        }
        loop {
            match state.fences.get(&fence.as_raw()).copied() {
                Some(true) => return Ok(()),
                Some(false) => {
                    if !state.retire_front() {
                        state.violation(format!(
                            "waited on fence {:#x} that no pending work will signal",
                            fence.as_raw()
                        ));
                        return Err(vk::Result::TIMEOUT);
                    }
                }
                None => {
                    state.violation(format!("waited on unknown fence {:#x}", fence.as_raw()));
                    return Err(vk::Result::ERROR_UNKNOWN);
                }
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        if state.fence_pending(fence.as_raw()) {
            state.violation(format!("reset fence {:#x} with pending work", fence.as_raw()));
        }
        match state.fences.get_mut(&fence.as_raw()) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool> {
        let state = self.state.lock();
        if state.faults.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        state
            .fences
            .get(&fence.as_raw())
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore: vk::Semaphore = state.next();
        state.semaphores.insert(semaphore.as_raw(), false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        if state.semaphores.remove(&semaphore.as_raw()).is_none() {
            state.violation(format!("destroyed unknown semaphore {:#x}", semaphore.as_raw()));
        }
    }

    fn queue_submit(&self, submission: &Submission<'_>) -> VkResult<()> {
        let mut state = self.state.lock();
        if state.faults.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        if let Some(result) = state.faults.submit.take() {
            return Err(result);
        }
        if submission.wait_semaphores.len() != submission.wait_stages.len() {
            state.violation("wait semaphore and stage counts differ".to_string());
        }
        for cb in submission.command_buffers {
            match state.command_buffers.get_mut(&cb.as_raw()) {
                Some(record) if record.state == CbState::Executable => record.state = CbState::Pending,
                Some(record) => {
                    let message = format!("submitted command buffer in state {:?}", record.state);
                    state.violation(message);
                }
                None => state.violation(format!("submitted unknown command buffer {:#x}", cb.as_raw())),
            }
        }
        let fence = if submission.fence == vk::Fence::null() {
            None
        } else {
            let raw = submission.fence.as_raw();
            if state.fence_pending(raw) {
                state.violation(format!("fence {:#x} reused while its previous submission is pending", raw));
            } else if state.fences.get(&raw).copied() != Some(false) {
                state.violation(format!("submitted with fence {:#x} that is not reset", raw));
            }
            Some(raw)
        };
        state.queue.push_back(QueueOp::Batch {
            command_buffers: submission.command_buffers.iter().map(|cb| cb.as_raw()).collect(),
            wait: submission.wait_semaphores.iter().map(|s| s.as_raw()).collect(),
            signal: submission.signal_semaphores.iter().map(|s| s.as_raw()).collect(),
            fence,
        });
        state.stats.submissions += 1;
        let pending = state.pending_batches();
        state.stats.max_pending_submissions = state.stats.max_pending_submissions.max(pending);
        Ok(())
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.lock();
        if state.faults.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        state.retire_all();
        Ok(())
    }

    fn surface_capabilities(&self, surface: vk::SurfaceKHR) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        let state = self.state.lock();
        if surface.as_raw() != state.surface {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        let extent = state.surface_extent;
        let current_extent = if self.config.fixed_surface_extent {
            extent
        } else {
            vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            }
        };
        let max_image_extent = if self.config.fixed_surface_extent {
            extent
        } else {
            vk::Extent2D {
                width: 4096,
                height: 4096,
            }
        };
        Ok(vk::SurfaceCapabilitiesKHR {
            min_image_count: self.config.min_image_count,
            max_image_count: self.config.max_image_count,
            current_extent,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent,
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
        })
    }

    fn surface_formats(&self, _surface: vk::SurfaceKHR) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        Ok(self.config.surface_formats.clone())
    }

    fn surface_present_modes(&self, _surface: vk::SurfaceKHR) -> VkResult<Vec<vk::PresentModeKHR>> {
        Ok(self.config.present_modes.clone())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        if desc.extent.width == 0 || desc.extent.height == 0 {
            state.violation("swapchain created with zero extent".to_string());
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        if desc.min_image_count < self.config.min_image_count
            || (self.config.max_image_count > 0 && desc.min_image_count > self.config.max_image_count)
        {
            let message = format!("swapchain image count {} outside surface limits", desc.min_image_count);
            state.violation(message);
        }
        let format_supported = self.config.surface_formats.iter().any(|f| {
            f.format == desc.surface_format.format && f.color_space == desc.surface_format.color_space
        });
        if !format_supported {
            state.violation(format!("unsupported surface format {:?}", desc.surface_format.format));
        }
        if !self.config.present_modes.contains(&desc.present_mode) {
            state.violation(format!("unsupported present mode {:?}", desc.present_mode));
        }
        if !state.swapchains.is_empty() {
            state.violation("surface already has a live swapchain".to_string());
        }

        let swapchain: vk::SwapchainKHR = state.next();
        let mut images = Vec::with_capacity(desc.min_image_count as usize);
        for _ in 0..desc.min_image_count {
            let image: vk::Image = state.next();
            state.images.insert(
                image.as_raw(),
                ImageRecord {
                    desc: ImageDesc {
                        extent: desc.extent,
                        format: desc.surface_format.format,
                        usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
                    },
                    binding: None,
                    layout: vk::ImageLayout::UNDEFINED,
                    swapchain: Some(swapchain.as_raw()),
                },
            );
            images.push(image.as_raw());
        }
        let held = vec![false; images.len()];
        state.swapchains.insert(
            swapchain.as_raw(),
            SwapchainRecord {
                desc: desc.clone(),
                images,
                held,
                next_image: 0,
            },
        );
        state.last_swapchain_desc = Some(desc.clone());
        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        let Some(record) = state.swapchains.remove(&swapchain.as_raw()) else {
            state.violation(format!("destroyed unknown swapchain {:#x}", swapchain.as_raw()));
            return;
        };
        let views_alive = state.image_views.values().any(|image| record.images.contains(image));
        if views_alive {
            state.violation("swapchain destroyed before its image views".to_string());
        }
        let present_pending = state.queue.iter().any(
            |op| matches!(op, QueueOp::Present { swapchain: sc, .. } if *sc == swapchain.as_raw()),
        );
        if present_pending {
            state.violation("swapchain destroyed with a pending present".to_string());
        }
        for image in record.images {
            state.images.remove(&image);
        }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let state = self.state.lock();
        state
            .swapchains
            .get(&swapchain.as_raw())
            .map(|sc| sc.images.iter().map(|raw| vk::Image::from_raw(*raw)).collect())
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn acquire_next_image(&self, swapchain: vk::SwapchainKHR, _timeout: u64, semaphore: vk::Semaphore) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        if state.faults.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let mut suboptimal = false;
        match state.faults.acquire.take() {
            Some(vk::Result::SUBOPTIMAL_KHR) => suboptimal = true,
            Some(result) => return Err(result),
            None => {}
        }
        let surface_extent = state.surface_extent;
        if surface_extent.width == 0 || surface_extent.height == 0 {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        let Some(extent) = state.swapchains.get(&swapchain.as_raw()).map(|sc| sc.desc.extent) else {
            state.violation(format!("acquire on unknown swapchain {:#x}", swapchain.as_raw()));
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        };
        if self.config.fixed_surface_extent
            && (extent.width != surface_extent.width || extent.height != surface_extent.height)
        {
            suboptimal = true;
        }
        if state.semaphores.get(&semaphore.as_raw()).copied() != Some(false) {
            state.violation(format!(
                "acquire signaled semaphore {:#x} that is signaled or unknown",
                semaphore.as_raw()
            ));
        }

        // Blocks until the presentation engine hands an image back
        let index = loop {
            let free = state.swapchains.get(&swapchain.as_raw()).and_then(|sc| {
                let n = sc.images.len();
                (0..n).map(|k| (sc.next_image + k) % n).find(|i| !sc.held[*i])
            });
            if let Some(index) = free {
                break index;
            }
            if !state.retire_front() {
                state.violation("acquired more images than the swapchain holds".to_string());
                return Err(vk::Result::TIMEOUT);
            }
        };

        if let Some(sc) = state.swapchains.get_mut(&swapchain.as_raw()) {
            sc.held[index] = true;
            sc.next_image = (index + 1) % sc.images.len();
        }
        state.semaphores.insert(semaphore.as_raw(), true);
        state.stats.acquires += 1;
        Ok((index as u32, suboptimal))
    }

    fn queue_present(&self, swapchain: vk::SwapchainKHR, image_index: u32, wait_semaphore: vk::Semaphore) -> VkResult<bool> {
        let mut state = self.state.lock();
        if state.faults.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let fault = state.faults.present.take();
        let Some(record) = state.swapchains.get(&swapchain.as_raw()) else {
            state.violation(format!("present on unknown swapchain {:#x}", swapchain.as_raw()));
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        };
        let held = record.held.get(image_index as usize).copied().unwrap_or(false);
        let extent = record.desc.extent;
        if !held {
            state.violation(format!("presented image {} that was not acquired", image_index));
        }

        // Out-of-date presents still consume the wait semaphore
        state.queue.push_back(QueueOp::Present {
            swapchain: swapchain.as_raw(),
            image_index,
            wait: wait_semaphore.as_raw(),
        });
        state.stats.presents += 1;

        let surface_extent = state.surface_extent;
        let resized = self.config.fixed_surface_extent
            && (extent.width != surface_extent.width || extent.height != surface_extent.height);
        match fault {
            Some(vk::Result::SUBOPTIMAL_KHR) => Ok(true),
            Some(result) => Err(result),
            None if resized => Err(vk::Result::ERROR_OUT_OF_DATE_KHR),
            None => Ok(false),
        }
    }

    fn create_render_pass(&self, color_format: vk::Format, depth_format: Option<vk::Format>) -> VkResult<vk::RenderPass> {
        let mut state = self.state.lock();
        let render_pass: vk::RenderPass = state.next();
        state.render_passes.insert(render_pass.as_raw(), (color_format, depth_format));
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        let mut state = self.state.lock();
        if state.render_passes.remove(&render_pass.as_raw()).is_none() {
            state.violation(format!("destroyed unknown render pass {:#x}", render_pass.as_raw()));
        }
    }

    fn create_framebuffer(&self, render_pass: vk::RenderPass, attachments: &[vk::ImageView], extent: vk::Extent2D) -> VkResult<vk::Framebuffer> {
        let mut state = self.state.lock();
        if !state.render_passes.contains_key(&render_pass.as_raw()) {
            state.violation(format!("framebuffer for unknown render pass {:#x}", render_pass.as_raw()));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        for view in attachments {
            let image_extent = state
                .image_views
                .get(&view.as_raw())
                .and_then(|image| state.images.get(image))
                .map(|record| record.desc.extent);
            match image_extent {
                Some(e) if e.width >= extent.width && e.height >= extent.height => {}
                _ => {
                    state.violation(format!("framebuffer attachment {:#x} smaller than framebuffer", view.as_raw()));
                    return Err(vk::Result::ERROR_UNKNOWN);
                }
            }
        }
        let framebuffer: vk::Framebuffer = state.next();
        state.framebuffers.insert(
            framebuffer.as_raw(),
            FramebufferRecord {
                attachments: attachments.iter().map(|v| v.as_raw()).collect(),
                extent,
            },
        );
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state.lock();
        if state.framebuffers.remove(&framebuffer.as_raw()).is_none() {
            state.violation(format!("destroyed unknown framebuffer {:#x}", framebuffer.as_raw()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_buffer(gpu: &HeadlessGpu, size: vk::DeviceSize, usage: vk::BufferUsageFlags, type_index: u32) -> vk::Buffer {
        let buffer = gpu.create_buffer(size, usage).unwrap();
        let req = gpu.buffer_memory_requirements(buffer);
        let memory = gpu.allocate_memory(req.size, type_index).unwrap();
        gpu.bind_buffer_memory(buffer, memory, 0).unwrap();
        buffer
    }

    /// Copies only land once the submission is retired by a wait
    #[test]
    fn test_copy_executes_on_retirement() {
        let gpu = HeadlessGpu::new();
        let src = bound_buffer(&gpu, 16, vk::BufferUsageFlags::TRANSFER_SRC, 1);
        let dst = bound_buffer(&gpu, 16, vk::BufferUsageFlags::TRANSFER_DST, 0);

        let memory = gpu.state.lock().buffers[&src.as_raw()].binding.unwrap().0;
        let ptr = gpu.map_memory(vk::DeviceMemory::from_raw(memory)).unwrap();
        unsafe { std::ptr::copy_nonoverlapping([7u8; 16].as_ptr(), ptr, 16) };

        let pool = gpu.create_command_pool(vk::CommandPoolCreateFlags::empty()).unwrap();
        let cb = gpu.allocate_command_buffers(pool, 1).unwrap()[0];
        gpu.begin_command_buffer(cb, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        gpu.record(
            cb,
            &GpuCommand::CopyBuffer {
                src,
                dst,
                region: vk::BufferCopy { src_offset: 0, dst_offset: 0, size: 16 },
            },
        );
        gpu.end_command_buffer(cb).unwrap();

        let fence = gpu.create_fence(false).unwrap();
        gpu.queue_submit(&Submission {
            command_buffers: &[cb],
            wait_semaphores: &[],
            wait_stages: &[],
            signal_semaphores: &[],
            fence,
        })
        .unwrap();

        assert_eq!(gpu.peek_buffer(dst, 0, 16).unwrap(), vec![0u8; 16]);
        assert_eq!(gpu.pending_submissions(), 1);
        gpu.wait_for_fence(fence, u64::MAX).unwrap();
        assert_eq!(gpu.peek_buffer(dst, 0, 16).unwrap(), vec![7u8; 16]);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    /// Waiting on a fence nothing will signal is reported instead of hanging
    #[test]
    fn test_orphan_fence_wait_is_a_violation() {
        let gpu = HeadlessGpu::new();
        let fence = gpu.create_fence(false).unwrap();
        assert_eq!(gpu.wait_for_fence(fence, u64::MAX), Err(vk::Result::TIMEOUT));
        assert_eq!(gpu.violations().len(), 1);
    }

    #[test]
    fn test_heap_budget_is_enforced() {
        let gpu = HeadlessGpu::with_config(HeadlessConfig {
            device_heap_size: 1024,
            ..Default::default()
        });
        let first = gpu.allocate_memory(1024, 0).unwrap();
        assert_eq!(gpu.allocate_memory(16, 0), Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        gpu.free_memory(first);
        assert_eq!(gpu.heap_usage(0), 0);
    }

    #[test]
    fn test_device_local_memory_cannot_be_mapped() {
        let gpu = HeadlessGpu::new();
        let memory = gpu.allocate_memory(256, 0).unwrap();
        assert_eq!(gpu.map_memory(memory), Err(vk::Result::ERROR_MEMORY_MAP_FAILED));
    }

    #[test]
    fn test_zero_extent_surface_reports_out_of_date() {
        let gpu = HeadlessGpu::new();
        gpu.set_surface_extent(0, 0);
        let semaphore = gpu.create_semaphore().unwrap();
        let result = gpu.acquire_next_image(vk::SwapchainKHR::from_raw(1), u64::MAX, semaphore);
        assert_eq!(result, Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
    }
}
