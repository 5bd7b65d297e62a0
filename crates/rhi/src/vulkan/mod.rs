//! Vulkan backend.
//!
//! [`VulkanDevice`] implements [`GpuDevice`](crate::device::GpuDevice) on top
//! of `ash`, with memory from `gpu-allocator` and surfaces from `ash-window`.

mod convert;
mod device;
mod instance;
mod physical_device;
mod swapchain;

pub use device::VulkanDevice;
pub use instance::Instance;
pub use physical_device::{
    PhysicalDeviceInfo, QueueFamilyIndices, find_queue_families, select_physical_device,
};
pub use swapchain::{Swapchain, SwapchainSupportDetails};
