// Render targets
//
// What the driver renders into each frame: a render pass plus one
// framebuffer per swapchain image. Everything sized by the swapchain is
// released before the swapchain is recreated and rebuilt afterwards.

use super::command::CommandStream;
use super::gpu::{Gpu, ImageDesc};
use super::memory::{DeviceMemoryPool, RegionId};
use super::swapchain::SwapchainManager;
use crate::error::{CoreError, CoreResult};
use ash::vk;
use std::sync::Arc;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Seam between the driver and whatever owns render passes and framebuffers
pub trait RenderTargets {
    fn render_pass(&self) -> vk::RenderPass;
    fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer>;
    fn clear_values(&self) -> Vec<vk::ClearValue>;
    /// Recorded before the render pass begins
    fn prepare(&mut self, _stream: &mut CommandStream) -> CoreResult<()> {
        Ok(())
    }
    /// Destroy everything sized by the swapchain
    fn release(&mut self);
    /// Recreate swapchain-sized resources for the current swapchain
    fn rebuild(&mut self, swapchain: &SwapchainManager) -> CoreResult<()>;
}

struct DepthAttachment {
    image: vk::Image,
    region: RegionId,
    view: vk::ImageView,
    initialized: bool,
}

/// Swapchain color attachment plus an optional depth buffer
pub struct PresentTargets {
    gpu: Arc<dyn Gpu>,
    memory: Arc<DeviceMemoryPool>,
    color_format: vk::Format,
    use_depth: bool,
    clear_color: [f32; 4],
    render_pass: vk::RenderPass,
    depth: Option<DepthAttachment>,
    framebuffers: Vec<vk::Framebuffer>,
}

impl PresentTargets {
    pub fn new(
        gpu: Arc<dyn Gpu>,
        memory: Arc<DeviceMemoryPool>,
        color_format: vk::Format,
        use_depth: bool,
        clear_color: [f32; 4],
    ) -> CoreResult<Self> {
        let depth_format = use_depth.then_some(DEPTH_FORMAT);
        let render_pass = gpu.create_render_pass(color_format, depth_format)?;
        Ok(Self {
            gpu,
            memory,
            color_format,
            use_depth,
            clear_color,
            render_pass,
            depth: None,
            framebuffers: Vec::new(),
        })
    }

    pub fn set_clear_color(&mut self, clear_color: [f32; 4]) {
        self.clear_color = clear_color;
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn depth_image(&self) -> Option<vk::Image> {
        self.depth.as_ref().map(|d| d.image)
    }

    /// Create a depth buffer image, memory, and view
    fn create_depth_attachment(&self, extent: vk::Extent2D) -> CoreResult<DepthAttachment> {
        let image = self
            .gpu
            .create_image(&ImageDesc {
                extent,
                format: DEPTH_FORMAT,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            })
            .map_err(|e| CoreError::from_vk(e, |r| CoreError::ImageCreationFailed(format!("depth image: {:?}", r))))?;

        let region = match self.memory.allocate_for_image(image, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Ok(region) => region,
            Err(e) => {
                self.gpu.destroy_image(image);
                return Err(e);
            }
        };
        let release = |this: &Self| {
            this.gpu.destroy_image(image);
            let _ = this.memory.free_region(region);
        };

        let Some(memory) = self.memory.region(region).map(|r| r.memory) else {
            release(self);
            return Err(CoreError::invalid("depth memory region vanished"));
        };
        if let Err(e) = self.gpu.bind_image_memory(image, memory, 0) {
            release(self);
            return Err(CoreError::from_vk(e, CoreError::BindFailed));
        }

        let view = match self.gpu.create_image_view(image, DEPTH_FORMAT, vk::ImageAspectFlags::DEPTH) {
            Ok(view) => view,
            Err(e) => {
                release(self);
                return Err(CoreError::from_vk(e, |r| CoreError::ImageCreationFailed(format!("depth view: {:?}", r))));
            }
        };

        Ok(DepthAttachment {
            image,
            region,
            view,
            initialized: false,
        })
    }
}

impl RenderTargets for PresentTargets {
    fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(image_index as usize).copied()
    }

    fn clear_values(&self) -> Vec<vk::ClearValue> {
        let mut values = vec![vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];
        if self.use_depth {
            values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            });
        }
        values
    }

    /// First frame after a rebuild moves the new depth image into its
    /// attachment layout
    fn prepare(&mut self, stream: &mut CommandStream) -> CoreResult<()> {
        if let Some(depth) = self.depth.as_mut() {
            if !depth.initialized {
                stream.transition_image(
                    depth.image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                )?;
                depth.initialized = true;
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            self.gpu.destroy_framebuffer(framebuffer);
        }
        if let Some(depth) = self.depth.take() {
            self.gpu.destroy_image_view(depth.view);
            self.gpu.destroy_image(depth.image);
            if let Err(e) = self.memory.free_region(depth.region) {
                log::warn!("Failed to free depth memory: {}", e);
            }
        }
    }

    fn rebuild(&mut self, swapchain: &SwapchainManager) -> CoreResult<()> {
        self.release();
        let Some(state) = swapchain.state() else {
            return Ok(());
        };

        if state.surface_format.format != self.color_format {
            log::info!(
                "Swapchain format changed {:?} -> {:?}, rebuilding render pass",
                self.color_format,
                state.surface_format.format
            );
            let depth_format = self.use_depth.then_some(DEPTH_FORMAT);
            let render_pass = self.gpu.create_render_pass(state.surface_format.format, depth_format)?;
            self.gpu.destroy_render_pass(self.render_pass);
            self.render_pass = render_pass;
            self.color_format = state.surface_format.format;
        }

        if self.use_depth {
            self.depth = Some(self.create_depth_attachment(state.extent)?);
        }
        let depth_view = self.depth.as_ref().map(|d| d.view);

        for &view in &state.image_views {
            let mut attachments = vec![view];
            attachments.extend(depth_view);
            match self.gpu.create_framebuffer(self.render_pass, &attachments, state.extent) {
                Ok(framebuffer) => self.framebuffers.push(framebuffer),
                Err(e) => {
                    self.release();
                    return Err(e.into());
                }
            }
        }
        log::debug!(
            "Render targets rebuilt: {} framebuffers at {}x{}",
            self.framebuffers.len(),
            state.extent.width,
            state.extent.height
        );
        Ok(())
    }
}

impl Drop for PresentTargets {
    fn drop(&mut self) {
        self.release();
        self.gpu.destroy_render_pass(self.render_pass);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessGpu;
    use crate::backend::swapchain::SwapchainSettings;

    fn setup() -> (Arc<HeadlessGpu>, Arc<DeviceMemoryPool>, SwapchainManager) {
        let gpu = Arc::new(HeadlessGpu::new());
        let memory = Arc::new(DeviceMemoryPool::new(gpu.clone()));
        let mut swapchain = SwapchainManager::new(gpu.clone(), gpu.surface(), SwapchainSettings::default());
        swapchain
            .create(vk::Extent2D { width: 800, height: 600 })
            .unwrap();
        (gpu, memory, swapchain)
    }

    #[test]
    fn test_rebuild_creates_framebuffer_per_image() {
        let (gpu, memory, swapchain) = setup();
        let format = swapchain.format().unwrap().format;
        let mut targets = PresentTargets::new(gpu.clone(), memory.clone(), format, true, [0.0; 4]).unwrap();
        targets.rebuild(&swapchain).unwrap();

        assert_eq!(targets.framebuffer_count(), swapchain.image_count());
        assert!(targets.framebuffer(0).is_some());
        assert!(targets.framebuffer(swapchain.image_count() as u32).is_none());
        assert_eq!(targets.clear_values().len(), 2);
        assert_eq!(memory.allocation_count(), 1);

        targets.release();
        assert_eq!(gpu.live_objects().framebuffers, 0);
        assert_eq!(gpu.live_objects().images, 0);
        assert_eq!(memory.allocation_count(), 0);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    #[test]
    fn test_rebuild_without_swapchain_is_empty() {
        let gpu = Arc::new(HeadlessGpu::new());
        let memory = Arc::new(DeviceMemoryPool::new(gpu.clone()));
        let swapchain = SwapchainManager::new(gpu.clone(), gpu.surface(), SwapchainSettings::default());
        let mut targets =
            PresentTargets::new(gpu.clone(), memory, vk::Format::B8G8R8A8_SRGB, false, [0.0; 4]).unwrap();
        targets.rebuild(&swapchain).unwrap();
        assert_eq!(targets.framebuffer_count(), 0);
        assert_eq!(targets.clear_values().len(), 1);
    }

    #[test]
    fn test_format_change_rebuilds_render_pass() {
        let (gpu, memory, swapchain) = setup();
        let mut targets =
            PresentTargets::new(gpu.clone(), memory, vk::Format::R8G8B8A8_UNORM, false, [0.0; 4]).unwrap();
        let before = targets.render_pass();
        targets.rebuild(&swapchain).unwrap();
        assert!(targets.render_pass() != before);
        assert_eq!(gpu.live_objects().render_passes, 1);
    }
}
