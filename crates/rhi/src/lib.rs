//! Render hardware interface.
//!
//! The RHI core sits between renderer code and an explicit graphics API.
//! It owns:
//! - fence and semaphore pools, binary and timeline
//! - per-queue command buffer managers with fence-gated reuse
//! - hash-keyed caches of immutable state objects
//! - shader binding layouts and instances on frame and persistent pools
//! - render passes with a framebuffer and final-state bookkeeping
//! - explicit resource state transitions
//! - frame orchestration over the swapchain
//!
//! Native calls go through the [`device::GpuDevice`] trait, implemented by
//! [`vulkan::VulkanDevice`] and by [`headless::HeadlessDevice`] for tests.

mod error;

pub mod barrier;
pub mod binding;
pub mod command;
pub mod context;
pub mod deferred;
pub mod descriptor;
pub mod device;
pub mod frame;
pub mod headless;
pub mod pipeline;
pub mod query;
pub mod registry;
pub mod render_pass;
pub mod resource;
pub mod ring_buffer;
pub mod shader;
pub mod state;
pub mod sync;
pub mod types;
pub mod vulkan;

pub use context::RhiContext;
pub use error::{RhiError, RhiResult};

pub use ash::vk;
