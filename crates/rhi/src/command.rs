//! Command buffer recording and per-queue command buffer pools.
//!
//! # Overview
//!
//! - [`CommandBufferManager`] owns one native command pool for one
//!   [`QueueType`] and recycles the command buffers allocated from it
//! - [`CommandBuffer`] wraps a native command buffer together with the fence
//!   that tracks its last submission
//!
//! A buffer moves through `in use → pending → in use`. The manager only hands
//! a pending buffer out again once its fence is observed signaled, so a
//! buffer the GPU may still be executing is never reset.
//!
//! A buffer dropped while checked out is logged and queued back to its
//! manager, which moves it to pending on the next request.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ember_rhi::command::CommandBufferManager;
//! use ember_rhi::headless::HeadlessDevice;
//! use ember_rhi::sync::FenceManager;
//! use ember_rhi::types::QueueType;
//!
//! # fn example() -> Result<(), ember_rhi::RhiError> {
//! let device = Arc::new(HeadlessDevice::new());
//! let fences = Arc::new(FenceManager::new(device.clone()));
//! let mut manager = CommandBufferManager::create_pool(device, QueueType::Graphics, fences)?;
//!
//! let mut cmd = manager.get_or_create_command_buffer()?;
//! cmd.dispatch(8, 8, 1);
//! manager.submit(&mut cmd, &[], &[])?;
//! manager.return_command_buffer(cmd);
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::binding::ShaderBindingInstance;
use crate::device::GpuDevice;
use crate::error::{RhiError, RhiResult};
use crate::pipeline::PipelineState;
use crate::resource::{Buffer, Texture};
use crate::sync::{FenceManager, WAIT_FOREVER};
use crate::types::{PipelineBarrier, QueueType, SemaphoreSignal, SemaphoreWait, SubmitInfo};

/// A recordable command buffer and its completion fence.
///
/// The native handle is owned by the [`CommandBufferManager`] that allocated
/// it and is freed only when that manager's pool is destroyed.
pub struct CommandBuffer {
    device: Arc<dyn GpuDevice>,
    buffer: vk::CommandBuffer,
    queue: QueueType,
    fence: vk::Fence,
    is_open: bool,
    /// Layout and bind point of the last bound pipeline, used for descriptor binding.
    bound_layout: Option<(vk::PipelineBindPoint, vk::PipelineLayout)>,
    /// Set while the buffer is handed out by its manager.
    checked_out: bool,
    orphans: Arc<Mutex<Vec<vk::CommandBuffer>>>,
}

impl CommandBuffer {
    fn new(
        device: Arc<dyn GpuDevice>,
        buffer: vk::CommandBuffer,
        queue: QueueType,
        fence: vk::Fence,
        orphans: Arc<Mutex<Vec<vk::CommandBuffer>>>,
    ) -> Self {
        Self {
            device,
            buffer,
            queue,
            fence,
            is_open: false,
            bound_layout: None,
            checked_out: false,
            orphans,
        }
    }

    /// Returns the native command buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    #[inline]
    pub fn queue(&self) -> QueueType {
        self.queue
    }

    /// Fence signaled when the last submission of this buffer completes.
    #[inline]
    pub fn fence(&self) -> vk::Fence {
        self.fence
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    // =========================================================================
    // Recording Control
    // =========================================================================

    /// Begins recording. A no-op if the buffer is already open.
    pub fn begin(&mut self) -> RhiResult<()> {
        if self.is_open {
            return Ok(());
        }
        self.device.begin_command_buffer(self.buffer)?;
        self.is_open = true;
        Ok(())
    }

    /// Ends recording. A no-op if the buffer is already closed.
    pub fn end(&mut self) -> RhiResult<()> {
        if !self.is_open {
            return Ok(());
        }
        self.device.end_command_buffer(self.buffer)?;
        self.is_open = false;
        Ok(())
    }

    /// Resets the buffer to the initial state so it can be re-recorded.
    pub fn reset(&mut self) -> RhiResult<()> {
        self.device.reset_command_buffer(self.buffer)?;
        self.is_open = false;
        self.bound_layout = None;
        Ok(())
    }

    /// Raw access to the device for modules that record on this buffer.
    pub(crate) fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    fn debug_check_open(&self) {
        debug_assert!(self.is_open, "recording into a closed command buffer");
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Records a pipeline barrier. Empty barriers are skipped.
    pub fn pipeline_barrier(&mut self, barrier: &PipelineBarrier) {
        self.debug_check_open();
        if barrier.is_empty() {
            return;
        }
        self.device.cmd_pipeline_barrier(self.buffer, barrier);
    }

    // =========================================================================
    // Pipeline Binding
    // =========================================================================

    /// Binds a cached pipeline state.
    pub fn bind_pipeline(&mut self, pipeline: &PipelineState) {
        self.debug_check_open();
        self.device
            .cmd_bind_pipeline(self.buffer, pipeline.bind_point(), pipeline.handle());
        self.bound_layout = Some((pipeline.bind_point(), pipeline.layout()));
    }

    /// Binds binding instances to consecutive sets starting at `first_set`,
    /// against the layout of the last bound pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::PipelineError`] if no pipeline is bound.
    pub fn bind_shader_binding_instances(
        &mut self,
        first_set: u32,
        instances: &[&ShaderBindingInstance],
        dynamic_offsets: &[u32],
    ) -> RhiResult<()> {
        self.debug_check_open();
        let (bind_point, layout) = self.bound_layout.ok_or_else(|| {
            RhiError::PipelineError("binding instances without a bound pipeline".into())
        })?;

        let sets: Vec<vk::DescriptorSet> = instances
            .iter()
            .map(|instance| {
                debug_assert!(
                    !instance.is_stale(),
                    "single-frame binding instance used after its pool was reset"
                );
                instance.handle()
            })
            .collect();

        self.device.cmd_bind_descriptor_sets(
            self.buffer,
            bind_point,
            layout,
            first_set,
            &sets,
            dynamic_offsets,
        );
        Ok(())
    }

    /// Uploads push constants for the last bound pipeline.
    pub fn push_constants(&mut self, stages: vk::ShaderStageFlags, offset: u32, data: &[u8]) {
        self.debug_check_open();
        if let Some((_, layout)) = self.bound_layout {
            self.device
                .cmd_push_constants(self.buffer, layout, stages, offset, data);
        } else {
            warn!("push_constants without a bound pipeline ignored");
        }
    }

    /// Binds vertex buffers starting at `first_binding`, each at offset 0.
    pub fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[&Buffer]) {
        self.debug_check_open();
        let handles: Vec<vk::Buffer> = buffers.iter().map(|b| b.handle()).collect();
        let offsets = vec![0; handles.len()];
        self.device
            .cmd_bind_vertex_buffers(self.buffer, first_binding, &handles, &offsets);
    }

    pub fn bind_index_buffer(&mut self, buffer: &Buffer, offset: u64, index_type: vk::IndexType) {
        self.debug_check_open();
        self.device
            .cmd_bind_index_buffer(self.buffer, buffer.handle(), offset, index_type);
    }

    // =========================================================================
    // Dynamic State
    // =========================================================================

    /// Sets a viewport covering `extent` with depth range 0..1.
    pub fn set_viewport(&mut self, extent: vk::Extent2D) {
        self.debug_check_open();
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        self.device.cmd_set_viewport(self.buffer, viewport);
    }

    pub fn set_scissor(&mut self, offset: vk::Offset2D, extent: vk::Extent2D) {
        self.debug_check_open();
        self.device
            .cmd_set_scissor(self.buffer, vk::Rect2D { offset, extent });
    }

    // =========================================================================
    // Draw / Dispatch
    // =========================================================================

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.debug_check_open();
        self.device.cmd_draw(
            self.buffer,
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        );
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.debug_check_open();
        self.device.cmd_draw_indexed(
            self.buffer,
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        );
    }

    /// Draws `draw_count` non-indexed draws whose arguments live in `buffer`.
    pub fn draw_indirect(&mut self, buffer: &Buffer, offset: u64, draw_count: u32) {
        self.debug_check_open();
        self.device.cmd_draw_indirect(
            self.buffer,
            buffer.handle(),
            offset,
            draw_count,
            std::mem::size_of::<vk::DrawIndirectCommand>() as u32,
        );
    }

    /// Draws `draw_count` indexed draws whose arguments live in `buffer`.
    pub fn draw_indexed_indirect(&mut self, buffer: &Buffer, offset: u64, draw_count: u32) {
        self.debug_check_open();
        self.device.cmd_draw_indexed_indirect(
            self.buffer,
            buffer.handle(),
            offset,
            draw_count,
            std::mem::size_of::<vk::DrawIndexedIndirectCommand>() as u32,
        );
    }

    pub fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) {
        self.debug_check_open();
        self.device
            .cmd_dispatch(self.buffer, groups_x, groups_y, groups_z);
    }

    // =========================================================================
    // Transfer
    // =========================================================================

    pub fn copy_buffer(&mut self, src: &Buffer, dst: &Buffer, size: u64) {
        self.debug_check_open();
        self.device
            .cmd_copy_buffer(self.buffer, src.handle(), dst.handle(), 0, 0, size);
    }

    /// Copies tightly packed texels from `src` into mip 0 of `dst`, which
    /// must already be in [`ResourceState::TransferDst`](crate::resource::ResourceState::TransferDst).
    pub fn copy_buffer_to_texture(&mut self, src: &Buffer, dst: &Texture) {
        self.debug_check_open();
        self.device.cmd_copy_buffer_to_image(
            self.buffer,
            src.handle(),
            dst.handle(),
            dst.aspect(),
            dst.extent(),
        );
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if self.checked_out {
            warn!(
                "{:?} command buffer {:?} dropped without being returned",
                self.queue, self.buffer
            );
            self.orphans.lock().push(self.buffer);
        }
    }
}

/// Per-queue pool of recyclable command buffers.
///
/// # Thread Safety
///
/// A manager is driven by the single thread recording for its queue.
/// Managers for different queues share nothing but the fence pool and may
/// record in parallel.
pub struct CommandBufferManager {
    device: Arc<dyn GpuDevice>,
    queue: QueueType,
    pool: vk::CommandPool,
    fences: Arc<FenceManager>,
    /// Every buffer ever allocated and its fence.
    allocated: HashMap<vk::CommandBuffer, vk::Fence>,
    in_use: Vec<vk::CommandBuffer>,
    pending: VecDeque<CommandBuffer>,
    /// Never-submitted buffers, reusable without a fence check.
    ready: Vec<CommandBuffer>,
    /// Handles of checked-out buffers that were dropped.
    orphans: Arc<Mutex<Vec<vk::CommandBuffer>>>,
}

impl CommandBufferManager {
    /// Creates the native command pool for `queue`.
    ///
    /// # Errors
    ///
    /// Returns an error if pool creation fails; callers treat this as fatal.
    pub fn create_pool(
        device: Arc<dyn GpuDevice>,
        queue: QueueType,
        fences: Arc<FenceManager>,
    ) -> RhiResult<Self> {
        let pool = device.create_command_pool(queue)?;
        info!("Command pool created for {:?} queue", queue);

        Ok(Self {
            device,
            queue,
            pool,
            fences,
            allocated: HashMap::new(),
            in_use: Vec::new(),
            pending: VecDeque::new(),
            ready: Vec::new(),
            orphans: Arc::new(Mutex::new(Vec::new())),
        })
    }

    #[inline]
    pub fn queue(&self) -> QueueType {
        self.queue
    }

    /// Returns a buffer open for recording.
    ///
    /// Reclaims the first pending buffer whose fence is signaled (resetting
    /// and reopening it), otherwise allocates a new buffer and fence pair.
    pub fn get_or_create_command_buffer(&mut self) -> RhiResult<CommandBuffer> {
        self.adopt_orphans();

        if let Some(mut buffer) = self.ready.pop() {
            buffer.reset()?;
            buffer.begin()?;
            return Ok(self.check_out(buffer));
        }

        let mut reclaim = None;
        for (index, buffer) in self.pending.iter().enumerate() {
            if self.fences.is_signaled(buffer.fence())? {
                reclaim = Some(index);
                break;
            }
        }

        if let Some(mut buffer) = reclaim.and_then(|index| self.pending.remove(index)) {
            buffer.reset()?;
            buffer.begin()?;
            return Ok(self.check_out(buffer));
        }

        let handle = self.device.allocate_command_buffer(self.pool)?;
        let fence = self.fences.get_or_create()?;
        self.allocated.insert(handle, fence);

        let mut buffer = self.wrap(handle, fence);
        buffer.begin()?;

        debug!(
            "Allocated {:?} command buffer {:?} ({} total)",
            self.queue,
            handle,
            self.allocated.len()
        );
        Ok(self.check_out(buffer))
    }

    fn wrap(&self, handle: vk::CommandBuffer, fence: vk::Fence) -> CommandBuffer {
        CommandBuffer::new(
            Arc::clone(&self.device),
            handle,
            self.queue,
            fence,
            Arc::clone(&self.orphans),
        )
    }

    fn check_out(&mut self, mut buffer: CommandBuffer) -> CommandBuffer {
        buffer.checked_out = true;
        self.in_use.push(buffer.handle());
        buffer
    }

    /// Removes `buffer` from the in-use set. Returns `false` if it belongs to
    /// another manager.
    fn check_in(&mut self, buffer: &mut CommandBuffer) -> bool {
        let Some(position) = self.in_use.iter().position(|h| *h == buffer.handle()) else {
            warn!(
                "Command buffer {:?} returned to the wrong {:?} manager",
                buffer.handle(),
                self.queue
            );
            return false;
        };
        self.in_use.swap_remove(position);
        buffer.checked_out = false;
        true
    }

    /// Moves dropped buffers back to pending, where their fence still guards reuse.
    fn adopt_orphans(&mut self) {
        let orphans = std::mem::take(&mut *self.orphans.lock());
        for handle in orphans {
            let Some(&fence) = self.allocated.get(&handle) else {
                continue;
            };
            self.in_use.retain(|h| *h != handle);
            let buffer = self.wrap(handle, fence);
            self.pending.push_back(buffer);
            debug!("Recovered dropped {:?} command buffer {:?}", self.queue, handle);
        }
    }

    /// Moves a buffer from in-use to pending. It is reclaimed by a later
    /// [`get_or_create_command_buffer`](Self::get_or_create_command_buffer)
    /// once its fence is signaled.
    pub fn return_command_buffer(&mut self, mut buffer: CommandBuffer) {
        if !self.check_in(&mut buffer) {
            return;
        }

        if buffer.is_open() {
            // Closed so a later reset starts from the executable state.
            if let Err(err) = buffer.end() {
                warn!("Failed to close returned command buffer: {}", err);
            }
        }
        self.pending.push_back(buffer);
    }

    /// Takes back a buffer that was never submitted, or whose submission
    /// failed. It is handed out again without waiting on its fence.
    pub fn discard_command_buffer(&mut self, mut buffer: CommandBuffer) {
        if self.check_in(&mut buffer) {
            self.ready.push(buffer);
        }
    }

    /// Submits `buffer` to this manager's queue.
    ///
    /// Ends the buffer if it is still open, resets its fence and submits with
    /// the given semaphore waits and signals; the fence is signaled when the
    /// GPU finishes.
    pub fn submit(
        &self,
        buffer: &mut CommandBuffer,
        waits: &[SemaphoreWait],
        signals: &[SemaphoreSignal],
    ) -> RhiResult<()> {
        debug_assert_eq!(buffer.queue(), self.queue);
        buffer.end()?;
        self.fences.reset(buffer.fence())?;

        let command_buffers = [buffer.handle()];
        self.device.queue_submit(
            self.queue,
            &SubmitInfo {
                command_buffers: &command_buffers,
                waits,
                signals,
                fence: buffer.fence(),
            },
        )
    }

    /// Submits `buffer` and blocks until it completes. Used for uploads.
    pub fn submit_and_wait(&self, buffer: &mut CommandBuffer) -> RhiResult<()> {
        self.submit(buffer, &[], &[])?;
        self.fences.wait(buffer.fence(), WAIT_FOREVER)
    }

    /// Number of buffers allocated over the manager's life.
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len() + self.ready.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }
}

impl Drop for CommandBufferManager {
    fn drop(&mut self) {
        if !self.in_use.is_empty() {
            warn!(
                "{:?} command pool destroyed with {} buffers still in use",
                self.queue,
                self.in_use.len()
            );
        }
        self.pending.clear();
        self.ready.clear();
        for (_, fence) in self.allocated.drain() {
            self.fences.return_fence(fence);
        }
        self.device.destroy_command_pool(self.pool);
        info!("Command pool destroyed for {:?} queue", self.queue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{DeviceFault, HeadlessDevice};

    fn setup() -> (Arc<HeadlessDevice>, CommandBufferManager) {
        let headless = Arc::new(HeadlessDevice::new());
        let device: Arc<dyn GpuDevice> = headless.clone();
        let fences = Arc::new(FenceManager::new(Arc::clone(&device)));
        let manager = CommandBufferManager::create_pool(device, QueueType::Graphics, fences).unwrap();
        (headless, manager)
    }

    #[test]
    fn test_new_buffer_is_open() {
        let (_, mut manager) = setup();
        let cmd = manager.get_or_create_command_buffer().unwrap();
        assert!(cmd.is_open());
        assert_eq!(cmd.queue(), QueueType::Graphics);
        assert_eq!(manager.in_use_count(), 1);
    }

    #[test]
    fn test_begin_end_are_idempotent() {
        let (headless, mut manager) = setup();
        let mut cmd = manager.get_or_create_command_buffer().unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();
        cmd.end().unwrap();
        assert!(!cmd.is_open());
        assert_eq!(headless.stats().command_buffers_begun, 1);
    }

    #[test]
    fn test_unsubmitted_buffer_is_reclaimed_immediately() {
        let (_, mut manager) = setup();
        let cmd = manager.get_or_create_command_buffer().unwrap();
        let handle = cmd.handle();
        manager.return_command_buffer(cmd);

        let again = manager.get_or_create_command_buffer().unwrap();
        assert_eq!(again.handle(), handle);
        assert_eq!(manager.allocated_count(), 1);
    }

    #[test]
    fn test_in_flight_buffer_is_not_reclaimed() {
        let (headless, mut manager) = setup();
        headless.set_auto_complete(false);

        let mut cmd = manager.get_or_create_command_buffer().unwrap();
        let first = cmd.handle();
        manager.submit(&mut cmd, &[], &[]).unwrap();
        manager.return_command_buffer(cmd);

        let second = manager.get_or_create_command_buffer().unwrap();
        assert_ne!(second.handle(), first);
        assert_eq!(manager.allocated_count(), 2);
        manager.return_command_buffer(second);

        headless.complete_all();
        let third = manager.get_or_create_command_buffer().unwrap();
        assert_eq!(third.handle(), first);
    }

    #[test]
    fn test_reclaimed_buffer_has_signaled_fence() {
        let (headless, mut manager) = setup();
        headless.set_auto_complete(false);

        for _ in 0..4 {
            let mut cmd = manager.get_or_create_command_buffer().unwrap();
            assert!(headless.fence_signaled(cmd.fence()));
            manager.submit(&mut cmd, &[], &[]).unwrap();
            manager.return_command_buffer(cmd);
            headless.complete_next();
        }
        assert_eq!(manager.allocated_count(), 1);
    }

    #[test]
    fn test_submit_and_wait_completes() {
        let (headless, mut manager) = setup();
        headless.set_auto_complete(false);
        let mut cmd = manager.get_or_create_command_buffer().unwrap();
        manager.submit_and_wait(&mut cmd).unwrap();
        assert!(headless.fence_signaled(cmd.fence()));
        assert!(!cmd.is_open());
    }

    #[test]
    fn test_foreign_buffer_is_rejected() {
        let (headless, mut manager) = setup();
        let device: Arc<dyn GpuDevice> = headless;
        let fences = Arc::new(FenceManager::new(Arc::clone(&device)));
        let mut other = CommandBufferManager::create_pool(device, QueueType::Compute, fences).unwrap();

        let foreign = other.get_or_create_command_buffer().unwrap();
        manager.return_command_buffer(foreign);
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn test_dropped_buffer_is_recovered() {
        let (_, mut manager) = setup();
        let cmd = manager.get_or_create_command_buffer().unwrap();
        let handle = cmd.handle();
        drop(cmd);
        assert_eq!(manager.in_use_count(), 1);

        let again = manager.get_or_create_command_buffer().unwrap();
        assert_eq!(again.handle(), handle);
        assert_eq!(manager.in_use_count(), 1);
        assert_eq!(manager.allocated_count(), 1);
    }

    #[test]
    fn test_dropped_in_flight_buffer_waits_for_its_fence() {
        let (headless, mut manager) = setup();
        headless.set_auto_complete(false);

        let mut cmd = manager.get_or_create_command_buffer().unwrap();
        let first = cmd.handle();
        manager.submit(&mut cmd, &[], &[]).unwrap();
        drop(cmd);

        let second = manager.get_or_create_command_buffer().unwrap();
        assert_ne!(second.handle(), first);
        manager.return_command_buffer(second);

        headless.complete_all();
        let third = manager.get_or_create_command_buffer().unwrap();
        assert_eq!(third.handle(), first);
    }

    #[test]
    fn test_failed_submit_buffer_is_reusable() {
        let (headless, mut manager) = setup();
        headless.inject_device_fault(DeviceFault::SubmitFails);

        let mut cmd = manager.get_or_create_command_buffer().unwrap();
        let handle = cmd.handle();
        assert!(manager.submit(&mut cmd, &[], &[]).is_err());
        manager.discard_command_buffer(cmd);
        assert_eq!(manager.in_use_count(), 0);

        let mut again = manager.get_or_create_command_buffer().unwrap();
        assert_eq!(again.handle(), handle);
        assert!(again.is_open());
        manager.submit(&mut again, &[], &[]).unwrap();
        assert_eq!(headless.stats().submissions, 1);
    }

    #[test]
    fn test_binding_without_pipeline_fails() {
        let (_, mut manager) = setup();
        let mut cmd = manager.get_or_create_command_buffer().unwrap();
        let result = cmd.bind_shader_binding_instances(0, &[], &[]);
        assert!(matches!(result, Err(RhiError::PipelineError(_))));
    }
}
