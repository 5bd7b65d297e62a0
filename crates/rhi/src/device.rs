//! The backend contract.
//!
//! [`GpuDevice`] is the narrow set of native operations the RHI core needs
//! from an explicit graphics API: queues, command buffers, fences,
//! semaphores, descriptor tables, pipeline objects and explicit resource
//! state. Everything above this trait (pools, caches, barriers, render
//! passes, frame orchestration) is backend-independent.
//!
//! Two implementations ship with the crate:
//! - [`VulkanDevice`](crate::vulkan::VulkanDevice) drives a real GPU through `ash`.
//! - [`HeadlessDevice`](crate::headless::HeadlessDevice) simulates one for tests and tools.
//!
//! Handles are plain `ash::vk` handles. Ownership of every handle stays with
//! the RHI object that created it; backends never destroy anything on their
//! own except at their own teardown.

use ash::vk;

use crate::binding::BindingShape;
use crate::error::RhiResult;
use crate::pipeline::{ComputePipelineDesc, GraphicsPipelineDesc, PushConstantRange};
use crate::render_pass::RenderPassLayout;
use crate::state::sampler::SamplerStateDesc;
use crate::types::{
    AcquireOutcome, BufferDesc, DescriptorPoolDesc, DescriptorWrite, DeviceCapabilities,
    NativeBuffer, NativeTexture, PipelineBarrier, PresentOutcome, QueueType, RenderPassBegin,
    SemaphoreKind, SubmitInfo, SwapchainInfo, TextureDesc,
};

/// Native operations required by the RHI core.
///
/// All methods take `&self`; implementations guard their own mutable state.
/// Recording methods (`cmd_*`) are only ever called by the single thread
/// recording that command buffer.
pub trait GpuDevice: Send + Sync {
    /// Device properties the core adapts to.
    fn capabilities(&self) -> &DeviceCapabilities;

    // ===== Fences =====

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Returns `true` if the fence is signaled.
    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool>;
    /// Blocks until every fence is signaled or `timeout_ns` elapses.
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> RhiResult<()>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()>;

    // ===== Semaphores =====

    fn create_semaphore(&self, kind: SemaphoreKind) -> RhiResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    /// Current counter of a timeline semaphore.
    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> RhiResult<u64>;
    /// Host-side signal of a timeline semaphore.
    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> RhiResult<()>;
    /// Host-side wait until a timeline semaphore reaches `value`.
    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64)
    -> RhiResult<()>;

    // ===== Command pools and buffers =====

    fn create_command_pool(&self, queue: QueueType) -> RhiResult<vk::CommandPool>;
    /// Destroys the pool and every command buffer allocated from it.
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> RhiResult<vk::CommandBuffer>;
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> RhiResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RhiResult<()>;
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> RhiResult<()>;

    // ===== Recording =====

    fn cmd_pipeline_barrier(&self, cmd: vk::CommandBuffer, barrier: &PipelineBarrier);
    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, begin: &RenderPassBegin);
    fn cmd_next_subpass(&self, cmd: vk::CommandBuffer);
    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer);
    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    );
    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );
    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport);
    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D);
    fn cmd_bind_vertex_buffers(
        &self,
        cmd: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
    );
    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    );
    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_draw_indirect(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    );
    fn cmd_draw_indexed_indirect(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    );
    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32);
    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    );
    /// Copies tightly packed texels into mip 0, layer 0 of `image`,
    /// which must be in `TRANSFER_DST_OPTIMAL`.
    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        extent: vk::Extent2D,
    );
    fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32);
    fn cmd_write_timestamp(
        &self,
        cmd: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        query: u32,
    );

    // ===== Submission =====

    fn queue_submit(&self, queue: QueueType, submit: &SubmitInfo<'_>) -> RhiResult<()>;
    fn queue_wait_idle(&self, queue: QueueType) -> RhiResult<()>;
    /// Drains every queue.
    fn wait_idle(&self) -> RhiResult<()>;

    // ===== State objects =====

    fn create_sampler(&self, desc: &SamplerStateDesc) -> RhiResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);
    fn create_shader_module(&self, code: &[u32]) -> RhiResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[PushConstantRange],
    ) -> RhiResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        layout: vk::PipelineLayout,
    ) -> RhiResult<vk::Pipeline>;
    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
        layout: vk::PipelineLayout,
    ) -> RhiResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
    fn create_render_pass(&self, layout: &RenderPassLayout) -> RhiResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> RhiResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // ===== Descriptors =====

    fn create_descriptor_set_layout(
        &self,
        shapes: &[BindingShape],
    ) -> RhiResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc) -> RhiResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    /// Allocates one set. Returns [`RhiError::DescriptorPoolExhausted`](crate::RhiError::DescriptorPoolExhausted)
    /// when the pool has no room left.
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        variable_count: Option<u32>,
    ) -> RhiResult<vk::DescriptorSet>;
    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) -> RhiResult<()>;
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()>;
    /// Applies every write in one native update call.
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    // ===== Resources =====

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<NativeTexture>;
    fn destroy_texture(&self, texture: NativeTexture);
    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<NativeBuffer>;
    /// Copies `data` into a host-visible buffer at `offset`.
    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> RhiResult<()>;
    fn destroy_buffer(&self, buffer: vk::Buffer);

    // ===== Queries =====

    fn create_timestamp_query_pool(&self, count: u32) -> RhiResult<vk::QueryPool>;
    fn destroy_query_pool(&self, pool: vk::QueryPool);
    /// Reads `out.len()` results starting at `first`. Returns `false` if any
    /// result is not available yet.
    fn query_results(&self, pool: vk::QueryPool, first: u32, out: &mut [u64]) -> RhiResult<bool>;

    // ===== Swapchain =====

    fn swapchain_info(&self) -> SwapchainInfo;
    /// Acquires the next presentable image, signaling `signal` when it is ready.
    fn acquire_next_image(&self, signal: vk::Semaphore) -> RhiResult<AcquireOutcome>;
    /// Queues `image_index` for presentation once `wait` is signaled.
    fn queue_present(&self, image_index: u32, wait: vk::Semaphore) -> RhiResult<PresentOutcome>;
    /// Rebuilds the swapchain at `extent`. The device must be idle.
    fn recreate_swapchain(&self, extent: vk::Extent2D) -> RhiResult<SwapchainInfo>;
}
