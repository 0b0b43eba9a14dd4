// Error taxonomy for the GPU resource and frame core
//
// Library code returns CoreResult; the demo binary and config loading
// stay on anyhow like the rest of the application layer.

use ash::vk;
use thiserror::Error;

/// Every failure the core can surface to its caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Out of device memory")]
    OutOfMemory,

    #[error("No memory type matches filter {type_filter:#b} with properties {properties:?}")]
    NoSuitableMemoryType {
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("Buffer creation failed: {0}")]
    BufferCreationFailed(String),

    #[error("Image creation failed: {0}")]
    ImageCreationFailed(String),

    #[error("Binding memory failed: {0:?}")]
    BindFailed(vk::Result),

    #[error("Mapping memory failed: {0:?}")]
    MapFailed(vk::Result),

    #[error("Unsupported image layout transition {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("Swapchain is out of date")]
    SwapchainOutOfDate,

    #[error("Swapchain is suboptimal")]
    SwapchainSuboptimal,

    #[error("Queue submission failed: {0:?}")]
    SubmitFailed(vk::Result),

    #[error("Presentation failed: {0:?}")]
    PresentFailed(vk::Result),

    #[error("Device lost")]
    DeviceLost,

    #[error("Buffer allocator is not initialized")]
    UninitializedAllocator,

    #[error("Unknown buffer allocation")]
    UnknownBuffer,

    #[error("Invalid operation: {reason}")]
    InvalidOperation { reason: String },

    #[error("Vulkan error: {0:?}")]
    Api(vk::Result),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        CoreError::InvalidOperation {
            reason: reason.into(),
        }
    }

    /// Classify a raw driver result, picking `fallback` when nothing more specific applies
    pub fn from_vk(result: vk::Result, fallback: impl FnOnce(vk::Result) -> CoreError) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                CoreError::OutOfMemory
            }
            vk::Result::ERROR_DEVICE_LOST => CoreError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => CoreError::SwapchainOutOfDate,
            other => fallback(other),
        }
    }

    /// Fatal errors put the renderer into its terminal state
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::DeviceLost)
    }
}

impl From<vk::Result> for CoreError {
    fn from(result: vk::Result) -> Self {
        CoreError::from_vk(result, CoreError::Api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Memory exhaustion and device loss map to their own kinds in every path
    #[test]
    fn test_vk_result_classification() {
        assert_eq!(
            CoreError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            CoreError::OutOfMemory
        );
        assert_eq!(
            CoreError::from_vk(vk::Result::ERROR_OUT_OF_HOST_MEMORY, CoreError::SubmitFailed),
            CoreError::OutOfMemory
        );
        assert_eq!(
            CoreError::from_vk(vk::Result::ERROR_DEVICE_LOST, CoreError::PresentFailed),
            CoreError::DeviceLost
        );
        assert_eq!(
            CoreError::from_vk(vk::Result::ERROR_INITIALIZATION_FAILED, CoreError::SubmitFailed),
            CoreError::SubmitFailed(vk::Result::ERROR_INITIALIZATION_FAILED)
        );
    }

    #[test]
    fn test_only_device_lost_is_fatal() {
        assert!(CoreError::DeviceLost.is_fatal());
        assert!(!CoreError::SwapchainOutOfDate.is_fatal());
        assert!(!CoreError::OutOfMemory.is_fatal());
    }
}
