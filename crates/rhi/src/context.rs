//! The RHI context: one object owning every pool, cache and the frame loop.
//!
//! [`RhiContext`] is what a renderer talks to. It owns the
//! [`ResourcePoolRegistry`], the fence and semaphore managers, one
//! [`CommandBufferManager`] per queue, the shared multi-frame descriptor
//! pool and the [`FrameOrchestrator`], and exposes the resource creation
//! verbs on top of them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ember_core::RhiConfig;
//! use ember_rhi::context::RhiContext;
//! use ember_rhi::headless::HeadlessDevice;
//!
//! # fn example() -> Result<(), ember_rhi::RhiError> {
//! let mut rhi = RhiContext::new(Arc::new(HeadlessDevice::new()), RhiConfig::default())?;
//! if let Some(frame) = rhi.begin_render_frame()? {
//!     rhi.end_render_frame(frame)?;
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use ember_core::RhiConfig;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::barrier;
use crate::binding::{AllocationScope, ShaderBindingArray, ShaderBindingInstance, ShaderBindingLayout};
use crate::command::{CommandBuffer, CommandBufferManager};
use crate::deferred::DeferredDeletionQueue;
use crate::descriptor::MultiFrameDescriptorPool;
use crate::device::GpuDevice;
use crate::error::{RhiError, RhiResult};
use crate::frame::{FrameContext, FrameOrchestrator, FramePhase, FrameStats};
use crate::pipeline::{ComputePipelineDesc, GraphicsPipelineDesc, PipelineState};
use crate::registry::{RegistryStats, ResourcePoolRegistry};
use crate::render_pass::{RenderPass, RenderPassDesc};
use crate::resource::{Buffer, BufferState, BufferUsage, ResourceState, Texture};
use crate::shader::{ShaderDesc, ShaderModule, ShaderStage};
use crate::state::fixed_function::{
    BlendState, BlendStateDesc, DepthStencilState, DepthStencilStateDesc, RasterizationState,
    RasterizationStateDesc,
};
use crate::state::sampler::{SamplerState, SamplerStateDesc};
use crate::sync::{FenceManager, SemaphoreManager};
use crate::types::{QueueType, TextureDesc};

/// Snapshot of the context's bookkeeping.
#[derive(Clone, Copy, Debug, Default)]
pub struct ContextStats {
    pub frame: FrameStats,
    pub registry: RegistryStats,
    pub pending_deletions: usize,
    pub persistent_descriptor_sets: u32,
    pub fences_in_use: usize,
    pub semaphores_in_use: usize,
}

/// Owner of the RHI core.
///
/// Field order is teardown order.
pub struct RhiContext {
    frames: FrameOrchestrator,
    commands: Vec<Mutex<CommandBufferManager>>,
    persistent_pool: Arc<MultiFrameDescriptorPool>,
    registry: Arc<ResourcePoolRegistry>,
    semaphores: Arc<SemaphoreManager>,
    fences: Arc<FenceManager>,
    deletion: Arc<DeferredDeletionQueue>,
    config: RhiConfig,
    device: Arc<dyn GpuDevice>,
}

impl RhiContext {
    /// Builds the context on top of an initialized device.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ConfigError`] for an invalid configuration, or the
    /// first device error hit while creating pools and frame slots.
    pub fn new(device: Arc<dyn GpuDevice>, config: RhiConfig) -> RhiResult<Self> {
        config.validate()?;
        info!(
            "Creating RHI context on '{}' ({} samples, validation {})",
            device.capabilities().device_name,
            config.sample_count,
            config.validation
        );

        let deletion = Arc::new(DeferredDeletionQueue::new());
        let fences = Arc::new(FenceManager::new(Arc::clone(&device)));
        let semaphores = Arc::new(SemaphoreManager::new(Arc::clone(&device)));
        let registry = Arc::new(ResourcePoolRegistry::new(
            Arc::clone(&device),
            Arc::clone(&deletion),
        ));

        let commands = QueueType::ALL
            .iter()
            .map(|&queue| {
                CommandBufferManager::create_pool(Arc::clone(&device), queue, Arc::clone(&fences))
                    .map(Mutex::new)
            })
            .collect::<RhiResult<Vec<_>>>()?;

        let persistent_pool = MultiFrameDescriptorPool::new(
            Arc::clone(&device),
            Arc::clone(&deletion),
            config.max_persistent_descriptor_sets,
        )?;

        let frames = FrameOrchestrator::new(
            Arc::clone(&device),
            Arc::clone(&deletion),
            Arc::clone(&fences),
            Arc::clone(&semaphores),
            Arc::clone(&registry),
            &config,
        )?;

        Ok(Self {
            frames,
            commands,
            persistent_pool,
            registry,
            semaphores,
            fences,
            deletion,
            config,
            device,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn config(&self) -> &RhiConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ResourcePoolRegistry> {
        &self.registry
    }

    pub fn semaphores(&self) -> &Arc<SemaphoreManager> {
        &self.semaphores
    }

    pub fn frames(&self) -> &FrameOrchestrator {
        &self.frames
    }

    /// The command buffer manager of `queue`. Recording for a queue happens
    /// on one thread at a time; the lock enforces that.
    pub fn command_buffers(&self, queue: QueueType) -> MutexGuard<'_, CommandBufferManager> {
        self.commands[queue.index()].lock()
    }

    // =========================================================================
    // Frame Loop
    // =========================================================================

    /// See [`FrameOrchestrator::begin_render_frame`]. `Ok(None)` means the
    /// swapchain was rebuilt and this frame is skipped.
    pub fn begin_render_frame(&mut self) -> RhiResult<Option<FrameContext>> {
        let mut graphics = self.commands[QueueType::Graphics.index()].lock();
        self.frames.begin_render_frame(&mut graphics)
    }

    pub fn end_render_frame(&mut self, frame: FrameContext) -> RhiResult<()> {
        let mut graphics = self.commands[QueueType::Graphics.index()].lock();
        self.frames.end_render_frame(&mut graphics, frame)
    }

    /// Rebuilds the swapchain at `extent` before the next frame.
    pub fn request_resize(&mut self, extent: vk::Extent2D) {
        self.frames.request_resize(extent);
    }

    /// Blocks until every queue has drained.
    pub fn flush(&self) -> RhiResult<()> {
        for queue in QueueType::ALL {
            self.device.queue_wait_idle(queue)?;
        }
        Ok(())
    }

    /// Drains the device and runs every deferred release.
    ///
    /// # Errors
    ///
    /// Fails while a frame is being recorded, since its resources are still
    /// referenced by the open command buffer.
    pub fn finish(&self) -> RhiResult<()> {
        if self.frames.phase() != FramePhase::Idle {
            return Err(RhiError::InvalidHandle(format!(
                "finish called while a frame is {:?}",
                self.frames.phase()
            )));
        }
        self.device.wait_idle()?;
        let released = self.deletion.flush();
        debug!("Finish released {} deferred objects", released);
        Ok(())
    }

    // =========================================================================
    // Resources
    // =========================================================================

    pub fn create_vertex_buffer(&self, name: &str, data: &[u8]) -> RhiResult<Arc<Buffer>> {
        self.create_buffer_with_data(BufferUsage::Vertex, name, data)
    }

    pub fn create_index_buffer(&self, name: &str, data: &[u8]) -> RhiResult<Arc<Buffer>> {
        self.create_buffer_with_data(BufferUsage::Index, name, data)
    }

    /// A persistent uniform buffer of `size` bytes, written with [`Buffer::write`].
    pub fn create_uniform_buffer(&self, name: &str, size: u64) -> RhiResult<Arc<Buffer>> {
        Buffer::create(
            Arc::clone(&self.device),
            Arc::clone(&self.deletion),
            BufferUsage::Uniform.desc(name, size),
        )
    }

    /// A buffer of `usage` holding `data`.
    ///
    /// Host-visible buffers are written directly; device-local ones are
    /// filled through a staging copy on the graphics queue. Either way the
    /// buffer is left in the usage's steady state.
    pub fn create_buffer_with_data(
        &self,
        usage: BufferUsage,
        name: &str,
        data: &[u8],
    ) -> RhiResult<Arc<Buffer>> {
        let size = data.len() as u64;
        let buffer = Buffer::create(
            Arc::clone(&self.device),
            Arc::clone(&self.deletion),
            usage.desc(name, size),
        )?;

        if buffer.is_host_visible() {
            buffer.write(0, data)?;
            buffer.set_state(usage.steady_state());
            return Ok(buffer);
        }

        let staging = self.staging_buffer(name, data)?;
        self.upload(|cmd| {
            barrier::transition_buffer(cmd, &buffer, BufferState::TransferDst);
            cmd.copy_buffer(&staging, &buffer, size);
            barrier::transition_buffer(cmd, &buffer, usage.steady_state());
        })?;
        Ok(buffer)
    }

    /// Creates a texture and, if `data` is given, uploads it and leaves the
    /// texture shader-readable.
    pub fn create_texture(&self, desc: TextureDesc, data: Option<&[u8]>) -> RhiResult<Arc<Texture>> {
        let Some(data) = data else {
            return Texture::create(Arc::clone(&self.device), Arc::clone(&self.deletion), desc);
        };

        let desc = TextureDesc {
            usage: desc.usage | vk::ImageUsageFlags::TRANSFER_DST,
            ..desc
        };
        let staging = self.staging_buffer(&desc.name, data)?;
        let texture = Texture::create(Arc::clone(&self.device), Arc::clone(&self.deletion), desc)?;
        self.upload(|cmd| {
            barrier::transition_texture(cmd, &texture, ResourceState::TransferDst);
            cmd.copy_buffer_to_texture(&staging, &texture);
            barrier::transition_texture(cmd, &texture, ResourceState::ShaderReadOnly);
        })?;
        Ok(texture)
    }

    /// A render target sized to the swapchain. It is resized whenever the
    /// swapchain is rebuilt, which invalidates the render passes using it.
    pub fn create_render_target(
        &mut self,
        name: &str,
        format: vk::Format,
        samples: u32,
    ) -> RhiResult<Arc<Texture>> {
        let desc = TextureDesc::render_target(name, self.frames.extent(), format, samples);
        let texture = Texture::create(Arc::clone(&self.device), Arc::clone(&self.deletion), desc)?;
        self.frames.track_extent_dependent(&texture);
        Ok(texture)
    }

    /// A cached shader module for SPIR-V `code`.
    pub fn create_shader(
        &self,
        stage: ShaderStage,
        code: &[u32],
        entry_point: &str,
    ) -> RhiResult<Arc<ShaderModule>> {
        self.registry
            .get_or_create_shader(&ShaderDesc::new(stage, code.to_vec()).with_entry_point(entry_point))
    }

    fn staging_buffer(&self, name: &str, data: &[u8]) -> RhiResult<Arc<Buffer>> {
        let staging = Buffer::create(
            Arc::clone(&self.device),
            Arc::clone(&self.deletion),
            BufferUsage::Staging.desc(format!("{} staging", name), data.len() as u64),
        )?;
        staging.write(0, data)?;
        Ok(staging)
    }

    /// Records `record` into a one-shot graphics command buffer and waits for it.
    fn upload(&self, record: impl FnOnce(&mut CommandBuffer)) -> RhiResult<()> {
        let mut manager = self.command_buffers(QueueType::Graphics);
        let mut cmd = manager.get_or_create_command_buffer()?;
        record(&mut cmd);
        let result = manager.submit_and_wait(&mut cmd);
        manager.return_command_buffer(cmd);
        result
    }

    // =========================================================================
    // Cached State
    // =========================================================================

    pub fn get_or_create_sampler(&self, desc: &SamplerStateDesc) -> RhiResult<Arc<SamplerState>> {
        self.registry.get_or_create_sampler(desc)
    }

    pub fn get_or_create_rasterization_state(
        &self,
        desc: &RasterizationStateDesc,
    ) -> RhiResult<Arc<RasterizationState>> {
        self.registry.get_or_create_rasterization_state(desc)
    }

    pub fn get_or_create_blend_state(&self, desc: &BlendStateDesc) -> RhiResult<Arc<BlendState>> {
        self.registry.get_or_create_blend_state(desc)
    }

    pub fn get_or_create_depth_stencil_state(
        &self,
        desc: &DepthStencilStateDesc,
    ) -> RhiResult<Arc<DepthStencilState>> {
        self.registry.get_or_create_depth_stencil_state(desc)
    }

    pub fn get_or_create_binding_layout(
        &self,
        bindings: &ShaderBindingArray,
    ) -> RhiResult<Arc<ShaderBindingLayout>> {
        self.registry.get_or_create_binding_layout(bindings)
    }

    pub fn get_or_create_render_pass(&self, desc: &RenderPassDesc) -> RhiResult<Arc<RenderPass>> {
        self.registry.get_or_create_render_pass(desc)
    }

    pub fn get_or_create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
    ) -> RhiResult<Arc<PipelineState>> {
        self.registry.get_or_create_graphics_pipeline(desc)
    }

    pub fn get_or_create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
    ) -> RhiResult<Arc<PipelineState>> {
        self.registry.get_or_create_compute_pipeline(desc)
    }

    // =========================================================================
    // Bindings and Transitions
    // =========================================================================

    /// Allocates a binding instance for `layout` and writes `bindings` into it.
    ///
    /// # Errors
    ///
    /// [`RhiError::BindingMismatch`] if `bindings` does not fit `layout`,
    /// [`RhiError::DescriptorPoolExhausted`] if the chosen pool is full.
    pub fn create_shader_binding_instance(
        &self,
        layout: &Arc<ShaderBindingLayout>,
        bindings: &ShaderBindingArray,
        scope: AllocationScope<'_>,
    ) -> RhiResult<ShaderBindingInstance> {
        match scope {
            AllocationScope::Frame(frame) => ShaderBindingInstance::allocate_single_frame(
                Arc::clone(&self.device),
                frame.descriptor_pool(),
                layout,
                bindings,
            ),
            AllocationScope::Persistent => ShaderBindingInstance::allocate_multi_frame(
                Arc::clone(&self.device),
                &self.persistent_pool,
                layout,
                bindings,
            ),
        }
    }

    /// Moves `texture` into `state`. Returns `false` if it already was there.
    pub fn transition_layout(
        &self,
        cmd: &mut CommandBuffer,
        texture: &Texture,
        state: ResourceState,
    ) -> bool {
        barrier::transition_texture(cmd, texture, state)
    }

    pub fn transition_buffer(&self, cmd: &mut CommandBuffer, buffer: &Buffer, state: BufferState) -> bool {
        barrier::transition_buffer(cmd, buffer, state)
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            frame: self.frames.stats(),
            registry: self.registry.stats(),
            pending_deletions: self.deletion.len(),
            persistent_descriptor_sets: self.persistent_pool.live_count(),
            fences_in_use: self.fences.in_use_count(),
            semaphores_in_use: self.semaphores.in_use_count(),
        }
    }
}

impl Drop for RhiContext {
    fn drop(&mut self) {
        if let Err(err) = self.device.wait_idle() {
            warn!("Failed to drain device before RHI teardown: {}", err);
        }
        self.registry.clear();
        let released = self.deletion.flush();
        info!("RHI context destroyed ({} deferred releases flushed)", released);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{DeviceEvent, HeadlessDevice};

    fn context() -> (Arc<HeadlessDevice>, RhiContext) {
        let headless = Arc::new(HeadlessDevice::new());
        let config = RhiConfig {
            timestamp_queries: 0,
            ..RhiConfig::default()
        };
        let rhi = RhiContext::new(headless.clone(), config).unwrap();
        (headless, rhi)
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = RhiConfig {
            sample_count: 3,
            ..RhiConfig::default()
        };
        assert!(matches!(
            RhiContext::new(Arc::new(HeadlessDevice::new()), config),
            Err(RhiError::ConfigError(_))
        ));
    }

    #[test]
    fn test_texture_upload_ends_shader_readable() {
        let (headless, rhi) = context();
        let extent = vk::Extent2D {
            width: 2,
            height: 2,
        };
        let texture = rhi
            .create_texture(
                TextureDesc::sampled("checker", extent, vk::Format::R8G8B8A8_UNORM),
                Some(&[255u8; 16]),
            )
            .unwrap();

        assert_eq!(texture.current_state(), ResourceState::ShaderReadOnly);
        let copies = headless
            .events()
            .iter()
            .filter(|e| matches!(e, DeviceEvent::CopyBufferToImage { image, .. } if *image == texture.handle()))
            .count();
        assert_eq!(copies, 1);
    }

    #[test]
    fn test_device_local_buffer_goes_through_staging() {
        let (headless, rhi) = context();
        let buffer = rhi
            .create_buffer_with_data(BufferUsage::Storage, "particles", &[1u8; 64])
            .unwrap();

        assert_eq!(buffer.current_state(), BufferState::ShaderRead);
        assert!(headless.events().iter().any(|e| matches!(
            e,
            DeviceEvent::CopyBuffer { dst, size: 64, .. } if *dst == buffer.handle()
        )));
    }

    #[test]
    fn test_host_visible_buffer_is_written_directly() {
        let (headless, rhi) = context();
        let buffer = rhi.create_vertex_buffer("triangle", &[7u8; 12]).unwrap();
        assert_eq!(headless.read_buffer(buffer.handle()), Some(vec![7u8; 12]));
        assert_eq!(buffer.current_state(), BufferState::VertexBuffer);
    }

    #[test]
    fn test_shader_is_cached() {
        let (_, rhi) = context();
        let code = [0x0723_0203u32, 0x0001_0000, 0, 1, 0];
        let a = rhi.create_shader(ShaderStage::Vertex, &code, "main").unwrap();
        let b = rhi.create_shader(ShaderStage::Vertex, &code, "main").unwrap();
        let c = rhi.create_shader(ShaderStage::Vertex, &code, "vs_main").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_finish_rejected_mid_frame() {
        let (_, mut rhi) = context();
        let frame = rhi.begin_render_frame().unwrap().unwrap();
        assert!(rhi.finish().is_err());
        rhi.end_render_frame(frame).unwrap();
        rhi.finish().unwrap();
        assert_eq!(rhi.stats().pending_deletions, 0);
    }

    #[test]
    fn test_render_target_follows_resize() {
        let (_, mut rhi) = context();
        let depth = rhi
            .create_render_target("depth", vk::Format::D32_SFLOAT, 1)
            .unwrap();
        assert_eq!(depth.extent().width, 800);

        rhi.request_resize(vk::Extent2D {
            width: 1024,
            height: 768,
        });
        let frame = rhi.begin_render_frame().unwrap().unwrap();
        rhi.end_render_frame(frame).unwrap();
        assert_eq!(depth.extent().width, 1024);
        assert_eq!(depth.generation(), 1);
    }
}
