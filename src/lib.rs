// vkframe - GPU resource and frame-orchestration core
//
// Typed buffer sub-allocation over device memory, staging uploads, command
// recording, swapchain lifecycle and the fence/semaphore frame protocol,
// driven by a per-frame renderer. Runs on Vulkan through ash or on the
// headless device for tests.

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod renderer;
pub mod window;

pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use renderer::{DrawItem, FrameRenderer, FrameStatus, RendererSettings};
