// =============================================================================
// VKFRAME DEMO - Frame-orchestration core driving a window or a headless device
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Demo App (winit window, or headless loop)                      │
// │    └── FrameRenderer (per-frame driver)                         │
// │          ├── SwapchainManager + PresentTargets                  │
// │          ├── FrameSynchronizer (fences, semaphores)             │
// │          ├── CommandPool per frame slot                         │
// │          └── BufferAllocator + StagingUploader                  │
// │                └── DeviceMemoryPool                             │
// └─────────────────────────────────────────────────────────────────┘
//
// The windowing backend is picked at build time by the `windowed` feature.
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::time::Instant;
use vkframe::backend::{BufferAllocator, BufferId, BufferType};
use vkframe::config::Config;
use vkframe::window::WindowingBackend;
use vkframe::{logging, DrawItem, FrameRenderer};

#[cfg(not(feature = "windowed"))]
use headless::run;
#[cfg(feature = "windowed")]
use windowed::run;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    // Initialize logging (flushed when the guard drops)
    let _logging = logging::init_logging(&config.debug);
    log::info!("Starting vkframe ({} backend)", WindowingBackend::selected().name());
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Frames in flight: {}", config.graphics.max_frames_in_flight);

    run(config)
}

// =============================================================================
// DEMO SCENE
// =============================================================================

/// Triangle vertex: position + color
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    pos: Vec3,
    color: Vec3,
}

/// Per-frame uniform block
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Uniforms {
    model: Mat4,
}

const TRIANGLE: [Vertex; 3] = [
    Vertex {
        pos: Vec3::new(0.0, -0.5, 0.0),
        color: Vec3::new(1.0, 0.0, 0.0),
    },
    Vertex {
        pos: Vec3::new(0.5, 0.5, 0.0),
        color: Vec3::new(0.0, 1.0, 0.0),
    },
    Vertex {
        pos: Vec3::new(-0.5, 0.5, 0.0),
        color: Vec3::new(0.0, 0.0, 1.0),
    },
];

/// Device-local triangle plus one uniform range per frame slot
struct DemoScene {
    vertices: BufferId,
    uniforms: BufferId,
    uniform_stride: vk::DeviceSize,
}

impl DemoScene {
    fn new(renderer: &FrameRenderer) -> Result<Self> {
        let vertices = renderer
            .uploader()
            .create_buffer_with_data(BufferType::Vertex, bytemuck::cast_slice(&TRIANGLE))
            .context("Failed to upload triangle")?;

        // Slot i writes range i; the slot fence keeps the GPU off that range
        let allocator = renderer.allocator();
        let alignment = allocator.alignment(BufferType::Uniform)?;
        let size = std::mem::size_of::<Uniforms>() as vk::DeviceSize;
        let uniform_stride = size.div_ceil(alignment) * alignment;
        let uniforms = allocator
            .create_uniform_buffer(uniform_stride * renderer.max_frames_in_flight() as vk::DeviceSize, None)
            .context("Failed to create uniform buffer")?;

        log::info!(
            "Demo scene: {} vertices, {} uniform ranges of {} bytes",
            TRIANGLE.len(),
            renderer.max_frames_in_flight(),
            uniform_stride
        );
        Ok(Self {
            vertices,
            uniforms,
            uniform_stride,
        })
    }

    /// Write this slot's uniform range. Call after the slot has been waited on.
    fn update(&self, allocator: &BufferAllocator, slot: usize, seconds: f32) -> vkframe::CoreResult<()> {
        let uniforms = Uniforms {
            model: Mat4::from_rotation_z(seconds),
        };
        allocator.write_pod(self.uniforms, self.uniform_stride * slot as vk::DeviceSize, &[uniforms])
    }

    #[cfg_attr(feature = "windowed", allow(dead_code))]
    fn draws(&self) -> Vec<DrawItem> {
        // Pipelines come from the embedding application; none is bound here
        vec![DrawItem::vertices(vk::Pipeline::null(), self.vertices, TRIANGLE.len() as u32)]
    }
}

// =============================================================================
// FPS TRACKING
// =============================================================================

struct FpsCounter {
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl FpsCounter {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    /// Returns (fps, frame time in ms) once per second
    fn tick(&mut self) -> Option<(f32, f32)> {
        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed < 1.0 {
            return None;
        }
        let fps = self.frame_count as f32 / elapsed;
        self.frame_count = 0;
        self.last_fps_update = now;
        Some((fps, frame_time * 1000.0))
    }
}

// =============================================================================
// HEADLESS RUN
// =============================================================================

#[cfg(not(feature = "windowed"))]
mod headless {
    use super::*;
    use std::sync::Arc;
    use vkframe::backend::{HeadlessConfig, HeadlessGpu, PresentTargets, RenderTargets};
    use vkframe::FrameStatus;

    /// Render `debug.headless_frames` frames on the in-process device
    pub fn run(config: Config) -> Result<()> {
        let extent = vk::Extent2D {
            width: config.window.width,
            height: config.window.height,
        };
        let gpu = Arc::new(HeadlessGpu::with_config(HeadlessConfig {
            surface_extent: extent,
            ..HeadlessConfig::default()
        }));

        let mut renderer = FrameRenderer::new(gpu.clone(), gpu.surface(), config.renderer_settings(), extent)
            .context("Failed to initialize renderer")?;
        let format = renderer
            .swapchain()
            .format()
            .map(|f| f.format)
            .unwrap_or(config.get_surface_format().format);
        let mut targets = PresentTargets::new(
            gpu.clone(),
            renderer.memory().clone(),
            format,
            config.graphics.use_depth,
            config.graphics.clear_color,
        )?;
        targets.rebuild(renderer.swapchain())?;

        let scene = DemoScene::new(&renderer)?;
        let draws = scene.draws();
        let mut fps = FpsCounter::new();
        let start = Instant::now();

        for _ in 0..config.debug.headless_frames {
            let slot = renderer.wait_for_current_frame()?;
            scene.update(renderer.allocator(), slot, start.elapsed().as_secs_f32())?;
            match renderer.draw_frame(&mut targets, &draws)? {
                FrameStatus::Presented { .. } => {
                    if let Some((rate, ms)) = fps.tick() {
                        if config.debug.show_fps {
                            log::info!("{:.0} FPS ({:.2}ms)", rate, ms);
                        }
                    }
                }
                status => log::debug!("Frame status: {:?}", status),
            }
        }

        renderer.wait_idle()?;
        renderer.allocator().log_stats();
        let stats = gpu.stats();
        log::info!(
            "Headless run finished: {} frames presented, {} submissions, {} draws",
            renderer.frames_presented(),
            stats.submissions,
            stats.draws
        );
        for violation in gpu.violations() {
            log::warn!("Device protocol violation: {}", violation);
        }

        renderer.shutdown(&mut targets);
        Ok(())
    }
}

// =============================================================================
// WINDOWED RUN
// =============================================================================

#[cfg(feature = "windowed")]
mod windowed {
    use super::*;
    use std::sync::Arc;
    use vkframe::backend::{PresentTargets, RenderTargets, VulkanDevice};
    use vkframe::window;
    use winit::{
        application::ApplicationHandler,
        event::WindowEvent,
        event_loop::{ActiveEventLoop, EventLoop},
        window::{Fullscreen, Window, WindowAttributes},
    };

    pub fn run(config: Config) -> Result<()> {
        let event_loop = EventLoop::new()?;
        let mut app = App::new(config);
        event_loop.run_app(&mut app)?;
        Ok(())
    }

    /// Application state.
    ///
    /// Teardown goes through `shutdown()`: scene buffers, render targets and
    /// the renderer are released before the device.
    struct App {
        config: Config,

        // ─────────────────────────────────────────────────────────────────────
        // WINDOW
        // ─────────────────────────────────────────────────────────────────────
        window: Option<Arc<Window>>,
        is_fullscreen: bool,

        // ─────────────────────────────────────────────────────────────────────
        // VULKAN
        // ─────────────────────────────────────────────────────────────────────
        renderer: Option<FrameRenderer>,
        targets: Option<PresentTargets>,
        scene: Option<DemoScene>,
        device: Option<Arc<VulkanDevice>>,

        // ─────────────────────────────────────────────────────────────────────
        // FPS TRACKING
        // ─────────────────────────────────────────────────────────────────────
        fps: FpsCounter,
        start: Instant,
    }

    impl App {
        fn new(config: Config) -> Self {
            let is_fullscreen = config.window.fullscreen;
            Self {
                config,
                window: None,
                is_fullscreen,
                renderer: None,
                targets: None,
                scene: None,
                device: None,
                fps: FpsCounter::new(),
                start: Instant::now(),
            }
        }

        /// Device, renderer, render targets and demo scene
        fn init_vulkan(&mut self, window: &Window) -> Result<()> {
            log::info!("Initializing Vulkan...");

            // Enable validation layers based on config (and debug build)
            let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
            let target = window::present_target(window)?;
            let device = VulkanDevice::new(&self.config.window.title, enable_validation, Some(target))
                .context("Failed to create Vulkan device")?;
            let surface = device.surface().context("Device has no presentation surface")?;

            let size = window.inner_size();
            let extent = vk::Extent2D {
                width: size.width,
                height: size.height,
            };
            let renderer = FrameRenderer::new(device.clone(), surface, self.config.renderer_settings(), extent)
                .context("Failed to initialize renderer")?;

            let format = renderer
                .swapchain()
                .format()
                .map(|f| f.format)
                .unwrap_or(self.config.get_surface_format().format);
            let mut targets = PresentTargets::new(
                device.clone(),
                renderer.memory().clone(),
                format,
                self.config.graphics.use_depth,
                self.config.graphics.clear_color,
            )?;
            targets.rebuild(renderer.swapchain())?;

            self.scene = Some(DemoScene::new(&renderer)?);
            self.targets = Some(targets);
            self.renderer = Some(renderer);
            self.device = Some(device);

            log::info!("Vulkan initialized successfully!");
            Ok(())
        }

        // =====================================================================
        // RENDER LOOP
        // =====================================================================

        fn render_frame(&mut self) -> Result<()> {
            let (Some(renderer), Some(targets), Some(scene)) =
                (self.renderer.as_mut(), self.targets.as_mut(), self.scene.as_ref())
            else {
                return Ok(());
            };

            let slot = renderer.wait_for_current_frame()?;
            scene.update(renderer.allocator(), slot, self.start.elapsed().as_secs_f32())?;

            // Without a pipeline the frame is the render pass clear
            renderer.draw_frame(targets, &[])?;

            if let Some((fps, ms)) = self.fps.tick() {
                if self.config.debug.show_fps {
                    if let Some(window) = &self.window {
                        let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                        window.set_title(&format!(
                            "{} - {:.0} FPS ({:.2}ms) [{}]",
                            self.config.window.title, fps, ms, mode
                        ));
                    }
                }
            }
            Ok(())
        }

        fn toggle_fullscreen(&mut self) {
            if let Some(ref window) = self.window {
                self.is_fullscreen = !self.is_fullscreen;

                if self.is_fullscreen {
                    window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                    log::info!("Entered fullscreen mode");
                } else {
                    window.set_fullscreen(None);
                    log::info!("Exited fullscreen mode");
                }
                // Resized follows and triggers the swapchain rebuild
            }
        }

        // =====================================================================
        // CLEANUP
        // =====================================================================

        fn shutdown(&mut self) {
            if let (Some(renderer), Some(mut targets)) = (self.renderer.take(), self.targets.take()) {
                log::info!("Cleaning up Vulkan resources...");
                self.scene = None;
                renderer.shutdown(&mut targets);
                drop(targets);
            }
            // Device goes last
            self.device = None;
        }
    }

    // =========================================================================
    // EVENT HANDLING
    // =========================================================================

    impl ApplicationHandler for App {
        /// Called when the application is ready to create windows.
        fn resumed(&mut self, event_loop: &ActiveEventLoop) {
            if self.window.is_some() {
                return;
            }

            // Create window with settings from config
            let mut window_attributes = WindowAttributes::default()
                .with_title(&self.config.window.title)
                .with_inner_size(winit::dpi::PhysicalSize::new(
                    self.config.window.width,
                    self.config.window.height,
                ));

            if self.config.window.fullscreen {
                window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
            }

            let window = match event_loop.create_window(window_attributes) {
                Ok(w) => Arc::new(w),
                Err(e) => {
                    log::error!("Failed to create window: {:?}", e);
                    event_loop.exit();
                    return;
                }
            };

            if let Err(e) = self.init_vulkan(&window) {
                log::error!("Failed to initialize Vulkan: {:#}", e);
                self.shutdown();
                event_loop.exit();
                return;
            }

            self.window = Some(window);
        }

        fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
            match event {
                WindowEvent::CloseRequested => {
                    log::info!("Close requested, shutting down...");
                    event_loop.exit();
                }

                WindowEvent::Resized(size) => {
                    log::debug!("Window resized to {}x{}", size.width, size.height);
                    if let Some(renderer) = self.renderer.as_mut() {
                        renderer.resize(size.width, size.height);
                    }
                }

                WindowEvent::RedrawRequested => {
                    if let Err(e) = self.render_frame() {
                        log::error!("Render error: {:#}", e);
                        if self.renderer.as_ref().is_some_and(|r| r.is_lost()) {
                            event_loop.exit();
                        }
                    }
                }

                WindowEvent::KeyboardInput { event, .. } => {
                    use winit::keyboard::PhysicalKey;

                    if event.state.is_pressed() {
                        if let PhysicalKey::Code(key) = event.physical_key {
                            let name = format!("{:?}", key);
                            if name == self.config.controls.quit_key {
                                log::info!("{} pressed, exiting...", name);
                                event_loop.exit();
                            } else if name == self.config.controls.fullscreen_key {
                                self.toggle_fullscreen();
                            }
                        }
                    }
                }

                _ => {}
            }
        }

        /// Request continuous redraws
        fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
            if let Some(ref window) = self.window {
                window.request_redraw();
            }
        }

        fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
            self.shutdown();
            log::info!("Cleanup complete");
        }
    }
}
