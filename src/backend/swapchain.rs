// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen:
// - picks format, present mode, extent and image count from the surface
// - owns the swapchain handle and one color view per image (images are
//   owned by the presentation engine)
// - acquire/present translate out-of-date and suboptimal into outcomes the
//   driver reacts to; recreate waits for the device to go idle first

use super::gpu::{Gpu, SwapchainDesc};
use crate::error::{CoreError, CoreResult};
use ash::vk;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct SwapchainSettings {
    pub prefer_mailbox: bool,
    pub min_image_count: u32,
    pub preferred_format: vk::SurfaceFormatKHR,
}

impl Default for SwapchainSettings {
    fn default() -> Self {
        Self {
            prefer_mailbox: true,
            min_image_count: 2,
            preferred_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    OutOfDate,
    Suboptimal,
}

impl PresentOutcome {
    pub fn needs_recreate(self) -> bool {
        !matches!(self, PresentOutcome::Presented)
    }
}

/// Live swapchain and its views
pub struct SwapchainState {
    pub handle: vk::SwapchainKHR,
    pub surface_format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
}

/// Preferred format if the surface reports it, else the first one
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
        .or_else(|| formats.first())
        .copied()
}

/// MAILBOX when wanted and reported; FIFO is always supported
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], prefer_mailbox: bool) -> vk::PresentModeKHR {
    if prefer_mailbox && modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Fixed surface extent when reported, else the window size clamped to limits
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: window
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: window
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let mut count = requested.max(caps.min_image_count + 1);
    if caps.max_image_count > 0 && count > caps.max_image_count {
        count = caps.max_image_count;
    }
    count
}

pub struct SwapchainManager {
    gpu: Arc<dyn Gpu>,
    surface: vk::SurfaceKHR,
    settings: SwapchainSettings,
    state: Option<SwapchainState>,
}

impl SwapchainManager {
    pub fn new(gpu: Arc<dyn Gpu>, surface: vk::SurfaceKHR, settings: SwapchainSettings) -> Self {
        Self {
            gpu,
            surface,
            settings,
            state: None,
        }
    }

    /// Build the swapchain for the current surface. A zero-sized surface
    /// (minimized window) leaves the manager without a swapchain.
    pub fn create(&mut self, window_extent: vk::Extent2D) -> CoreResult<()> {
        if self.state.is_some() {
            return Err(CoreError::invalid("create on a manager that already holds a swapchain"));
        }

        let caps = self.gpu.surface_capabilities(self.surface)?;
        let formats = self.gpu.surface_formats(self.surface)?;
        let present_modes = self.gpu.surface_present_modes(self.surface)?;

        let extent = choose_extent(&caps, window_extent);
        if extent.width == 0 || extent.height == 0 {
            log::info!("Surface is zero-sized, deferring swapchain creation");
            return Ok(());
        }

        let surface_format = choose_surface_format(&formats, self.settings.preferred_format)
            .ok_or_else(|| CoreError::Initialization("Surface reports no formats".to_string()))?;
        let present_mode = choose_present_mode(&present_modes, self.settings.prefer_mailbox);
        let image_count = choose_image_count(&caps, self.settings.min_image_count);

        let families = self.gpu.queue_families();
        let (sharing_mode, queue_family_indices) = if families.is_shared() {
            (vk::SharingMode::EXCLUSIVE, Vec::new())
        } else {
            (vk::SharingMode::CONCURRENT, vec![families.graphics, families.present])
        };

        let desc = SwapchainDesc {
            surface: self.surface,
            min_image_count: image_count,
            surface_format,
            extent,
            present_mode,
            pre_transform: caps.current_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            sharing_mode,
            queue_family_indices,
            clipped: true,
        };

        let handle = self.gpu.create_swapchain(&desc)?;
        let images = match self.gpu.swapchain_images(handle) {
            Ok(images) => images,
            Err(e) => {
                self.gpu.destroy_swapchain(handle);
                return Err(e.into());
            }
        };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            match self
                .gpu
                .create_image_view(image, surface_format.format, vk::ImageAspectFlags::COLOR)
            {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    for view in image_views {
                        self.gpu.destroy_image_view(view);
                    }
                    self.gpu.destroy_swapchain(handle);
                    return Err(CoreError::from_vk(e, |r| CoreError::ImageCreationFailed(format!("{:?}", r))));
                }
            }
        }

        log::info!(
            "Created swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            images.len(),
            surface_format.format,
            present_mode
        );

        self.state = Some(SwapchainState {
            handle,
            surface_format,
            extent,
            present_mode,
            images,
            image_views,
        });
        Ok(())
    }

    /// Wait for the device to idle, tear down, rebuild
    pub fn recreate(&mut self, window_extent: vk::Extent2D) -> CoreResult<()> {
        self.gpu.device_wait_idle()?;
        self.destroy();
        self.create(window_extent)
    }

    /// Image views first, then the swapchain
    pub fn destroy(&mut self) {
        if let Some(state) = self.state.take() {
            for view in state.image_views {
                self.gpu.destroy_image_view(view);
            }
            self.gpu.destroy_swapchain(state.handle);
            log::debug!("Destroyed swapchain");
        }
    }

    /// Acquire next image for rendering (infinite timeout)
    pub fn acquire_next(&self, image_available: vk::Semaphore) -> CoreResult<AcquireOutcome> {
        let Some(state) = &self.state else {
            return Ok(AcquireOutcome::OutOfDate);
        };
        match self.gpu.acquire_next_image(state.handle, u64::MAX, image_available) {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(CoreError::from(e)),
        }
    }

    /// Present rendered image to screen
    pub fn present(&self, image_index: u32, render_finished: vk::Semaphore) -> CoreResult<PresentOutcome> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| CoreError::invalid("present without a swapchain"))?;
        match self.gpu.queue_present(state.handle, image_index, render_finished) {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(CoreError::from_vk(e, CoreError::PresentFailed)),
        }
    }

    pub fn state(&self) -> Option<&SwapchainState> {
        self.state.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.state.is_some()
    }

    pub fn extent(&self) -> Option<vk::Extent2D> {
        self.state.as_ref().map(|s| s.extent)
    }

    pub fn format(&self) -> Option<vk::SurfaceFormatKHR> {
        self.state.as_ref().map(|s| s.surface_format)
    }

    pub fn present_mode(&self) -> Option<vk::PresentModeKHR> {
        self.state.as_ref().map(|s| s.present_mode)
    }

    pub fn image_count(&self) -> usize {
        self.state.as_ref().map(|s| s.images.len()).unwrap_or(0)
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        self.state.as_ref().map(|s| s.image_views.as_slice()).unwrap_or(&[])
    }
}

impl Drop for SwapchainManager {
    fn drop(&mut self) {
        self.destroy();
    }
}
