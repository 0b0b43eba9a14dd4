// Renderer - per-frame driver
//
// Owns the frame-orchestration core and runs one frame per draw_frame():
// 1. wait for the frame slot, reset its fence
// 2. acquire a swapchain image (out-of-date: drop the frame, recreate)
// 3. record the frame into the slot's command pool
// 4. submit: wait image-available at color output, signal render-finished
// 5. present (out-of-date or suboptimal: recreate)
// 6. release the slot and advance the cursor
//
// Field order is teardown order: swapchain, sync objects, command pools,
// uploader, buffer allocator, memory pool.

use crate::backend::buffer::{AllocatorSettings, BufferAllocator, BufferId};
use crate::backend::command::{CommandPool, CommandStream};
use crate::backend::gpu::Gpu;
use crate::backend::memory::DeviceMemoryPool;
use crate::backend::swapchain::{AcquireOutcome, PresentOutcome, SwapchainManager, SwapchainSettings};
use crate::backend::sync::FrameSynchronizer;
use crate::backend::targets::RenderTargets;
use crate::backend::upload::StagingUploader;
use crate::error::{CoreError, CoreResult};
use ash::vk;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct RendererSettings {
    pub max_frames_in_flight: usize,
    pub swapchain: SwapchainSettings,
    pub allocator: AllocatorSettings,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            swapchain: SwapchainSettings::default(),
            allocator: AllocatorSettings::default(),
        }
    }
}

/// One draw recorded inside the frame's render pass
#[derive(Debug, Clone)]
pub struct DrawItem {
    /// Null skips the bind and reuses whatever is bound
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_sets: Vec<vk::DescriptorSet>,
    pub vertex_buffer: Option<BufferId>,
    pub index_buffer: Option<(BufferId, vk::IndexType)>,
    /// Vertex count, or index count when an index buffer is set
    pub count: u32,
    pub instance_count: u32,
}

impl DrawItem {
    pub fn vertices(pipeline: vk::Pipeline, vertex_buffer: BufferId, vertex_count: u32) -> Self {
        Self {
            pipeline,
            layout: vk::PipelineLayout::null(),
            descriptor_sets: Vec::new(),
            vertex_buffer: Some(vertex_buffer),
            index_buffer: None,
            count: vertex_count,
            instance_count: 1,
        }
    }

    pub fn indexed(
        pipeline: vk::Pipeline,
        vertex_buffer: BufferId,
        index_buffer: BufferId,
        index_type: vk::IndexType,
        index_count: u32,
    ) -> Self {
        Self {
            index_buffer: Some((index_buffer, index_type)),
            ..Self::vertices(pipeline, vertex_buffer, index_count)
        }
    }

    pub fn with_descriptor_sets(mut self, layout: vk::PipelineLayout, sets: Vec<vk::DescriptorSet>) -> Self {
        self.layout = layout;
        self.descriptor_sets = sets;
        self
    }

    pub fn with_instances(mut self, instance_count: u32) -> Self {
        self.instance_count = instance_count;
        self
    }
}

/// What happened to one draw_frame() call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented { image_index: u32 },
    /// The swapchain was rebuilt during this frame
    SwapchainRecreated,
    /// No swapchain to render into (zero-sized window)
    Skipped,
}

pub struct FrameRenderer {
    gpu: Arc<dyn Gpu>,
    swapchain: SwapchainManager,
    sync: FrameSynchronizer,
    /// One pool per frame slot; a slot's pool is reset only after its fence wait
    command_pools: Vec<CommandPool>,
    uploader: StagingUploader,
    allocator: Arc<BufferAllocator>,
    memory: Arc<DeviceMemoryPool>,

    window_extent: vk::Extent2D,
    needs_recreate: bool,
    lost: bool,
    frames_presented: u64,
    swapchain_recreations: u64,
}

impl FrameRenderer {
    /// Build the core for a surface. Render targets are built by the caller
    /// against `swapchain()` once this returns.
    pub fn new(
        gpu: Arc<dyn Gpu>,
        surface: vk::SurfaceKHR,
        settings: RendererSettings,
        window_extent: vk::Extent2D,
    ) -> CoreResult<Self> {
        log::info!("Initializing frame renderer...");

        let memory = Arc::new(DeviceMemoryPool::new(gpu.clone()));
        let allocator = Arc::new(BufferAllocator::new(gpu.clone(), memory.clone(), settings.allocator));
        let uploader = StagingUploader::new(gpu.clone(), allocator.clone())?;

        let sync = FrameSynchronizer::new(gpu.clone(), settings.max_frames_in_flight)?;
        let command_pools = (0..settings.max_frames_in_flight)
            .map(|_| CommandPool::new(gpu.clone()))
            .collect::<CoreResult<Vec<_>>>()?;

        let mut swapchain = SwapchainManager::new(gpu.clone(), surface, settings.swapchain);
        swapchain.create(window_extent)?;

        log::info!("Frame renderer ready ({} frames in flight)", settings.max_frames_in_flight);
        Ok(Self {
            gpu,
            swapchain,
            sync,
            command_pools,
            uploader,
            allocator,
            memory,
            window_extent,
            needs_recreate: false,
            lost: false,
            frames_presented: 0,
            swapchain_recreations: 0,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────

    pub fn swapchain(&self) -> &SwapchainManager {
        &self.swapchain
    }

    pub fn sync(&self) -> &FrameSynchronizer {
        &self.sync
    }

    pub fn allocator(&self) -> &Arc<BufferAllocator> {
        &self.allocator
    }

    pub fn memory(&self) -> &Arc<DeviceMemoryPool> {
        &self.memory
    }

    pub fn uploader(&self) -> &StagingUploader {
        &self.uploader
    }

    /// Slot the next draw_frame() will use
    pub fn current_frame(&self) -> usize {
        self.sync.current_frame()
    }

    pub fn max_frames_in_flight(&self) -> usize {
        self.sync.max_frames_in_flight()
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn swapchain_recreations(&self) -> u64 {
        self.swapchain_recreations
    }

    pub fn is_lost(&self) -> bool {
        self.lost
    }

    pub fn needs_recreate(&self) -> bool {
        self.needs_recreate
    }

    // ─────────────────────────────────────────────────────────────────────
    // Swapchain lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Window was resized; the swapchain is rebuilt before the next frame
    pub fn resize(&mut self, width: u32, height: u32) {
        self.window_extent = vk::Extent2D { width, height };
        self.needs_recreate = true;
    }

    pub fn request_recreate(&mut self) {
        self.needs_recreate = true;
    }

    /// Wait for in-flight frames, rebuild the swapchain and its targets
    pub fn recreate_swapchain(&mut self, targets: &mut dyn RenderTargets) -> CoreResult<()> {
        self.ensure_alive()?;
        let result = self.rebuild_swapchain(targets);
        self.note_fatal(result)
    }

    fn rebuild_swapchain(&mut self, targets: &mut dyn RenderTargets) -> CoreResult<()> {
        self.sync.wait_all()?;
        for pool in &mut self.command_pools {
            pool.complete_submitted();
        }
        targets.release();
        self.swapchain.recreate(self.window_extent)?;
        // recreate idled the device, so acquire signals have landed
        self.sync.release_retired();
        targets.rebuild(&self.swapchain)?;
        self.needs_recreate = false;
        self.swapchain_recreations += 1;
        log::info!(
            "Swapchain recreated ({} so far): {:?}",
            self.swapchain_recreations,
            self.swapchain.extent()
        );
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Frame loop
    // ─────────────────────────────────────────────────────────────────────

    /// Block until the slot the next frame uses has retired, so per-slot
    /// host data (uniform ranges) can be rewritten. Returns that slot.
    pub fn wait_for_current_frame(&mut self) -> CoreResult<usize> {
        self.ensure_alive()?;
        let result = self.sync.wait_for_frame();
        self.note_fatal(result)?;
        Ok(self.sync.current_frame())
    }

    /// Render and present one frame
    pub fn draw_frame(&mut self, targets: &mut dyn RenderTargets, draws: &[DrawItem]) -> CoreResult<FrameStatus> {
        self.ensure_alive()?;
        let result = self.run_frame(targets, draws);
        self.note_fatal(result)
    }

    fn ensure_alive(&self) -> CoreResult<()> {
        if self.lost {
            return Err(CoreError::DeviceLost);
        }
        Ok(())
    }

    fn note_fatal<T>(&mut self, result: CoreResult<T>) -> CoreResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() && !self.lost {
                log::error!("Device lost, renderer refuses further work");
                self.lost = true;
            }
        }
        result
    }

    fn run_frame(&mut self, targets: &mut dyn RenderTargets, draws: &[DrawItem]) -> CoreResult<FrameStatus> {
        if self.needs_recreate {
            self.rebuild_swapchain(targets)?;
        }
        if !self.swapchain.is_valid() {
            return Ok(FrameStatus::Skipped);
        }

        // STEP 1: Wait for the slot's previous frame
        self.sync.begin_frame()?;

        // STEP 2: Acquire next swapchain image
        let image_index = match self.swapchain.acquire_next(self.sync.image_available()) {
            Ok(AcquireOutcome::Image { index, suboptimal }) => {
                if suboptimal {
                    // Still presentable; rebuild before the next frame
                    self.needs_recreate = true;
                }
                index
            }
            Ok(AcquireOutcome::OutOfDate) => {
                log::debug!("Acquire reported out of date, dropping frame");
                self.sync.abandon_frame()?;
                self.rebuild_swapchain(targets)?;
                return Ok(FrameStatus::SwapchainRecreated);
            }
            Err(e) => {
                self.abandon_after_error();
                return Err(e);
            }
        };

        // STEP 3 + 4: Record and submit
        if let Err(e) = self.record_and_submit(targets, draws, image_index) {
            // The acquired image can't be handed back; a fresh swapchain releases it
            self.abandon_after_error();
            self.needs_recreate = true;
            return Err(e);
        }

        // STEP 5: Present
        let presented = self.swapchain.present(image_index, self.sync.render_finished());

        // STEP 6: The submission owns the slot fence now
        self.sync.end_frame()?;
        self.sync.next_frame();

        match presented? {
            PresentOutcome::Presented => {
                self.frames_presented += 1;
                log::trace!("Presented image {}", image_index);
                Ok(FrameStatus::Presented { image_index })
            }
            outcome => {
                if outcome == PresentOutcome::Suboptimal {
                    self.frames_presented += 1;
                }
                log::debug!("Present reported {:?}, recreating swapchain", outcome);
                self.rebuild_swapchain(targets)?;
                Ok(FrameStatus::SwapchainRecreated)
            }
        }
    }

    fn abandon_after_error(&mut self) {
        if let Err(e) = self.sync.abandon_frame() {
            log::warn!("Failed to abandon frame: {}", e);
        }
    }

    fn record_and_submit(
        &mut self,
        targets: &mut dyn RenderTargets,
        draws: &[DrawItem],
        image_index: u32,
    ) -> CoreResult<()> {
        let extent = self
            .swapchain
            .extent()
            .ok_or_else(|| CoreError::invalid("recording without a swapchain"))?;
        let framebuffer = targets
            .framebuffer(image_index)
            .ok_or_else(|| CoreError::invalid(format!("no framebuffer for swapchain image {}", image_index)))?;
        let image_available = self.sync.image_available();
        let render_finished = self.sync.render_finished();
        let fence = self.sync.in_flight_fence();

        // The slot fence was waited on in begin_frame, so nothing here is in flight
        let pool = &mut self.command_pools[self.sync.current_frame()];
        pool.complete_submitted();
        pool.reset()?;
        let (_, stream) = pool.acquire()?;

        record_frame(&self.allocator, stream, targets, framebuffer, extent, draws)?;

        stream.submit(
            &[(image_available, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)],
            &[render_finished],
            fence,
        )
    }

    // ─────────────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────────────

    pub fn wait_idle(&self) -> CoreResult<()> {
        self.gpu.device_wait_idle().map_err(CoreError::from)
    }

    /// Idle the device and tear everything down in order: render targets,
    /// swapchain, sync objects, command pools, buffer allocator, memory pool
    pub fn shutdown(self, targets: &mut dyn RenderTargets) {
        log::info!(
            "Shutting down renderer ({} frames presented, {} swapchain recreations)",
            self.frames_presented,
            self.swapchain_recreations
        );
        if let Err(e) = self.wait_idle() {
            log::warn!("Device wait before shutdown failed: {}", e);
        }
        targets.release();

        let FrameRenderer {
            swapchain,
            sync,
            command_pools,
            uploader,
            allocator,
            memory,
            ..
        } = self;
        drop(swapchain);
        drop(sync);
        drop(command_pools);
        drop(uploader);
        allocator.log_stats();
        allocator.shutdown();
        drop(allocator);
        memory.free_all();
        log::info!("Renderer shut down");
    }
}

/// Record one frame: optional target preparation, then a render pass
/// over the whole swapchain image with every draw item
fn record_frame(
    allocator: &BufferAllocator,
    stream: &mut CommandStream,
    targets: &mut dyn RenderTargets,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    draws: &[DrawItem],
) -> CoreResult<()> {
    stream.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
    targets.prepare(stream)?;

    let render_area = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    stream.begin_pass(targets.render_pass(), framebuffer, render_area, &targets.clear_values())?;
    stream.set_full_viewport(extent)?;

    for item in draws {
        if item.pipeline != vk::Pipeline::null() {
            stream.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, item.pipeline)?;
        }
        if !item.descriptor_sets.is_empty() {
            stream.bind_descriptor_sets(
                vk::PipelineBindPoint::GRAPHICS,
                item.layout,
                0,
                &item.descriptor_sets,
                &[],
            )?;
        }
        if let Some(id) = item.vertex_buffer {
            let vertices = allocator.get(id)?;
            stream.bind_vertex_buffer(0, vertices.buffer, vertices.offset)?;
        }
        match item.index_buffer {
            Some((id, index_type)) => {
                let indices = allocator.get(id)?;
                stream.bind_index_buffer(indices.buffer, indices.offset, index_type)?;
                stream.draw_indexed(item.count, item.instance_count, 0, 0, 0)?;
            }
            None => stream.draw(item.count, item.instance_count, 0, 0)?,
        }
    }

    stream.end_pass()?;
    stream.end()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::buffer::BufferType;
    use crate::backend::headless::HeadlessGpu;
    use crate::backend::targets::PresentTargets;

    fn setup(frames: usize) -> (Arc<HeadlessGpu>, FrameRenderer, PresentTargets) {
        let gpu = Arc::new(HeadlessGpu::new());
        let settings = RendererSettings {
            max_frames_in_flight: frames,
            ..RendererSettings::default()
        };
        let renderer =
            FrameRenderer::new(gpu.clone(), gpu.surface(), settings, vk::Extent2D { width: 800, height: 600 }).unwrap();
        let format = renderer.swapchain().format().unwrap().format;
        let mut targets =
            PresentTargets::new(gpu.clone(), renderer.memory().clone(), format, true, [0.0, 0.0, 0.0, 1.0]).unwrap();
        targets.rebuild(renderer.swapchain()).unwrap();
        (gpu, renderer, targets)
    }

    fn triangle(renderer: &FrameRenderer) -> DrawItem {
        let vertices = renderer
            .uploader()
            .create_buffer_with_data(BufferType::Vertex, &[0u8; 72])
            .unwrap();
        DrawItem::vertices(vk::Pipeline::null(), vertices, 3)
    }

    /// One settings value configures several renderers
    #[test]
    fn test_settings_are_copied_into_each_renderer() {
        let settings = RendererSettings {
            allocator: AllocatorSettings {
                enable_pool_allocator: true,
            },
            ..RendererSettings::default()
        };
        let extent = vk::Extent2D { width: 320, height: 240 };
        for _ in 0..2 {
            let gpu = Arc::new(HeadlessGpu::new());
            let renderer = FrameRenderer::new(gpu.clone(), gpu.surface(), settings, extent).unwrap();
            let id = renderer.allocator().create_uniform_buffer(64, None).unwrap();
            assert!(renderer.allocator().get(id).unwrap().pool.is_some());
            assert_eq!(renderer.max_frames_in_flight(), settings.max_frames_in_flight);
        }
    }

    #[test]
    fn test_frames_present_and_rotate_slots() {
        let (gpu, mut renderer, mut targets) = setup(2);
        let draw = triangle(&renderer);
        for i in 0..5 {
            assert_eq!(renderer.current_frame(), i % 2);
            let status = renderer.draw_frame(&mut targets, std::slice::from_ref(&draw)).unwrap();
            assert!(matches!(status, FrameStatus::Presented { .. }));
        }
        assert_eq!(renderer.frames_presented(), 5);
        renderer.wait_idle().unwrap();
        assert_eq!(gpu.stats().draws, 5);
        assert!(gpu.stats().max_pending_submissions <= 2);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
        renderer.shutdown(&mut targets);
    }

    #[test]
    fn test_indexed_draw_binds_both_buffers() {
        let (gpu, mut renderer, mut targets) = setup(2);
        let uploader = renderer.uploader();
        let vertices = uploader.create_buffer_with_data(BufferType::Vertex, &[0u8; 96]).unwrap();
        let indices = uploader
            .create_buffer_with_data(BufferType::Index, bytemuck::cast_slice(&[0u16, 1, 2, 2, 3, 0]))
            .unwrap();
        let draw = DrawItem::indexed(vk::Pipeline::null(), vertices, indices, vk::IndexType::UINT16, 6);
        renderer.draw_frame(&mut targets, &[draw]).unwrap();
        renderer.wait_idle().unwrap();
        assert_eq!(gpu.stats().draws, 1);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    #[test]
    fn test_submit_failure_abandons_frame() {
        let (gpu, mut renderer, mut targets) = setup(2);
        gpu.fail_next_submit(vk::Result::ERROR_INITIALIZATION_FAILED);
        let err = renderer.draw_frame(&mut targets, &[]).unwrap_err();
        assert!(matches!(err, CoreError::SubmitFailed(_)));
        assert!(!renderer.is_lost());
        assert_eq!(renderer.sync().in_flight_count(), 0);
        // The acquire's semaphore is held until the device idles
        assert_eq!(renderer.sync().retired_count(), 1);
        let semaphores = gpu.live_objects().semaphores;

        // Next frame rebuilds the swapchain and carries on
        let status = renderer.draw_frame(&mut targets, &[]).unwrap();
        assert!(matches!(status, FrameStatus::Presented { .. }));
        assert_eq!(renderer.swapchain_recreations(), 1);
        assert_eq!(renderer.sync().retired_count(), 0);
        assert_eq!(gpu.live_objects().semaphores, semaphores - 1);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    #[test]
    fn test_device_lost_is_terminal() {
        let (gpu, mut renderer, mut targets) = setup(2);
        renderer.draw_frame(&mut targets, &[]).unwrap();
        gpu.lose_device();
        assert_eq!(renderer.draw_frame(&mut targets, &[]), Err(CoreError::DeviceLost));
        assert!(renderer.is_lost());
        assert_eq!(renderer.draw_frame(&mut targets, &[]), Err(CoreError::DeviceLost));
        assert_eq!(
            renderer.recreate_swapchain(&mut targets),
            Err(CoreError::DeviceLost)
        );
    }

    #[test]
    fn test_zero_extent_skips_until_resized() {
        let (gpu, mut renderer, mut targets) = setup(2);
        gpu.set_surface_extent(0, 0);
        renderer.resize(0, 0);
        assert_eq!(renderer.draw_frame(&mut targets, &[]).unwrap(), FrameStatus::Skipped);
        assert!(!renderer.swapchain().is_valid());
        assert_eq!(renderer.draw_frame(&mut targets, &[]).unwrap(), FrameStatus::Skipped);

        gpu.set_surface_extent(640, 480);
        renderer.resize(640, 480);
        let status = renderer.draw_frame(&mut targets, &[]).unwrap();
        assert!(matches!(status, FrameStatus::Presented { .. }));
        assert_eq!(renderer.swapchain().extent().map(|e| (e.width, e.height)), Some((640, 480)));
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (gpu, mut renderer, mut targets) = setup(3);
        let draw = triangle(&renderer);
        for _ in 0..4 {
            renderer.draw_frame(&mut targets, std::slice::from_ref(&draw)).unwrap();
        }
        renderer.shutdown(&mut targets);
        drop(targets);
        let live = gpu.live_objects();
        assert_eq!(live.memories, 0);
        assert_eq!(live.buffers, 0);
        assert_eq!(live.swapchains, 0);
        assert_eq!(live.fences, 0);
        assert_eq!(live.semaphores, 0);
        assert_eq!(live.command_pools, 0);
        assert!(live.is_empty(), "{:?}", live);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }
}
