//! RHI-specific error types.

use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] ash::vk::Result),

    /// Failed to load Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// Configuration rejected at startup
    #[error("Config error: {0}")]
    ConfigError(#[from] ember_core::Error),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Shader module error
    #[error("Shader error: {0}")]
    ShaderError(String),

    /// Surface creation error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// The swapchain no longer matches the surface and must be rebuilt
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Pipeline creation error
    #[error("Pipeline error: {0}")]
    PipelineError(String),

    /// Render pass description is malformed or the pass is stale
    #[error("Render pass error: {0}")]
    RenderPassError(String),

    /// A descriptor pool ran out of sets; pool sizes are fixed at creation
    #[error("Descriptor pool exhausted: {0}")]
    DescriptorPoolExhausted(String),

    /// A transient uniform ring buffer ran out of space for this frame
    #[error("Uniform ring exhausted: requested {requested} bytes, {available} available")]
    RingBufferExhausted { requested: u64, available: u64 },

    /// Bound resources do not match the binding layout
    #[error("Binding mismatch: {0}")]
    BindingMismatch(String),

    /// A host wait did not complete within its timeout
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// The device was lost; unrecoverable
    #[error("Device lost")]
    DeviceLost,
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;
