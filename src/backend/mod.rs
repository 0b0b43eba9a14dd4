// Backend module - Vulkan abstraction layer
//
// Design: everything above `gpu` is written against the `Gpu` trait, so the
// same memory, buffer, command, swapchain and sync code runs on a real
// device (ash) or on the in-process headless device.

pub mod buffer;
pub mod command;
pub mod device;
pub mod gpu;
pub mod headless;
pub mod memory;
pub mod swapchain;
pub mod sync;
pub mod targets;
pub mod upload;

pub use buffer::{AllocatorSettings, BufferAllocator, BufferId, BufferType, PoolId};
pub use command::{CommandPool, CommandStream, StreamState};
pub use device::{PresentTarget, VulkanDevice};
pub use gpu::Gpu;
pub use headless::{HeadlessConfig, HeadlessGpu};
pub use memory::{DeviceMemoryPool, RegionId};
pub use swapchain::{AcquireOutcome, PresentOutcome, SwapchainManager, SwapchainSettings};
pub use sync::FrameSynchronizer;
pub use targets::{PresentTargets, RenderTargets};
pub use upload::StagingUploader;
