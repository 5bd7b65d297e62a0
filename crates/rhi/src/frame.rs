//! Frame orchestration.
//!
//! [`FrameOrchestrator`] drives the per-frame loop against the swapchain:
//!
//! ```text
//! Idle ─► Acquired ─► Recording ─► Submitted ─► Presented ─► Idle
//!   begin_render_frame()            end_render_frame()
//! ```
//!
//! # Frames in flight
//!
//! There is one [`FrameSlot`] per swapchain image. A slot owns the resources
//! a frame scribbles on while recording: its single-frame descriptor pool,
//! its transient uniform ring, its image-available semaphore and its
//! timestamp queries. Before a slot is reused, `begin_render_frame` waits on
//! the fence of the submission that last used it, which bounds how far the
//! CPU can run ahead of the GPU to the swapchain depth.
//!
//! # Synchronization Flow
//!
//! ```text
//! 1. Wait on the slot's last fence (CPU waits for frame N - K)
//! 2. Acquire swapchain image (signals image_available[slot])
//! 3. Reset the slot's descriptor pool and uniform ring
//! 4. Record into a command buffer from the graphics manager
//! 5. Submit:
//!    - Wait on image_available[slot] at COLOR_ATTACHMENT_OUTPUT
//!    - Signal render_finished[image]
//!    - Signal the command buffer's fence
//! 6. Present (waits on render_finished[image])
//! ```
//!
//! # Swapchain recreation
//!
//! An out-of-date acquire, a suboptimal acquire or present, or an explicit
//! [`FrameOrchestrator::request_resize`] rebuilds the swapchain after
//! draining every queue. Extent-dependent render targets are resized and
//! every cached render pass and pipeline tied to the old swapchain is
//! evicted. The only effect visible to the caller is that
//! `begin_render_frame` may return `Ok(None)` for one frame.
//!
//! # Failed frames
//!
//! A device error after the image was acquired abandons the frame: the
//! orchestrator returns to `Idle`, hands the command buffer back and
//! rebuilds the swapchain at the start of the next frame, releasing the
//! image that was never presented.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use ash::vk;
use ember_core::{RhiConfig, Timer};
use tracing::{debug, error, info, warn};

use crate::barrier::transition_texture;
use crate::command::{CommandBuffer, CommandBufferManager};
use crate::deferred::DeferredDeletionQueue;
use crate::descriptor::SingleFrameDescriptorPool;
use crate::device::GpuDevice;
use crate::error::{RhiError, RhiResult};
use crate::query::TimestampQueries;
use crate::registry::ResourcePoolRegistry;
use crate::resource::{Buffer, BufferUsage, ResourceState, Texture};
use crate::ring_buffer::UniformRingBuffer;
use crate::sync::{FenceManager, SemaphoreManager, WAIT_FOREVER};
use crate::types::{AcquireOutcome, PresentOutcome, SemaphoreSignal, SemaphoreWait, SwapchainInfo};

/// Where a frame is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Acquired,
    Recording,
    Submitted,
    Presented,
}

/// Everything needed to record one frame.
///
/// Returned by [`FrameOrchestrator::begin_render_frame`] and consumed by
/// [`FrameOrchestrator::end_render_frame`].
pub struct FrameContext {
    serial: u64,
    slot: usize,
    image_index: u32,
    phase: FramePhase,
    command_buffer: CommandBuffer,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    descriptor_pool: Arc<SingleFrameDescriptorPool>,
    uniforms: Arc<UniformRingBuffer>,
    backbuffer: Arc<Texture>,
}

impl FrameContext {
    /// Monotonic frame number, starting at 1.
    #[inline]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Index of the frame slot whose resources this frame uses.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Swapchain image being rendered.
    #[inline]
    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    #[inline]
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn command_buffer(&self) -> &CommandBuffer {
        &self.command_buffer
    }

    pub fn command_buffer_mut(&mut self) -> &mut CommandBuffer {
        &mut self.command_buffer
    }

    /// Semaphore the frame's submission waits on before writing the image.
    #[inline]
    pub fn image_available(&self) -> vk::Semaphore {
        self.image_available
    }

    /// Semaphore the frame's submission signals and presentation waits on.
    #[inline]
    pub fn render_finished(&self) -> vk::Semaphore {
        self.render_finished
    }

    pub fn descriptor_pool(&self) -> &SingleFrameDescriptorPool {
        &self.descriptor_pool
    }

    /// Transient uniform memory, valid for this frame only.
    pub fn uniforms(&self) -> &UniformRingBuffer {
        &self.uniforms
    }

    /// The acquired swapchain image.
    pub fn backbuffer(&self) -> &Arc<Texture> {
        &self.backbuffer
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.backbuffer.extent()
    }
}

impl std::fmt::Debug for FrameContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameContext")
            .field("serial", &self.serial)
            .field("slot", &self.slot)
            .field("image_index", &self.image_index)
            .field("phase", &self.phase)
            .finish()
    }
}

/// Per-slot resources, reused once the slot's last submission completed.
struct FrameSlot {
    image_available: vk::Semaphore,
    descriptor_pool: Arc<SingleFrameDescriptorPool>,
    uniforms: Arc<UniformRingBuffer>,
    timestamps: Option<TimestampQueries>,
    /// Fence and serial of the last submission recorded in this slot.
    last_submission: Option<(vk::Fence, u64)>,
}

/// Counters exposed for overlays and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameStats {
    pub frames_presented: u64,
    pub skipped_frames: u64,
    /// Frames abandoned after a device error.
    pub failed_frames: u64,
    pub swapchain_recreations: u64,
    pub last_cpu_frame_time: Duration,
    pub average_cpu_frame_time: Duration,
    /// GPU time of the most recent frame whose timestamps were read back.
    pub last_gpu_frame_ms: Option<f64>,
}

/// Per-frame capacities taken from [`RhiConfig`].
#[derive(Clone, Copy, Debug)]
struct SlotSettings {
    max_descriptor_sets: u32,
    uniform_ring_size: u64,
    timestamp_queries: u32,
}

/// Owner of the frame loop, the swapchain images and the frame slots.
pub struct FrameOrchestrator {
    device: Arc<dyn GpuDevice>,
    deletion: Arc<DeferredDeletionQueue>,
    fences: Arc<FenceManager>,
    semaphores: Arc<SemaphoreManager>,
    registry: Arc<ResourcePoolRegistry>,
    settings: SlotSettings,

    slots: Vec<FrameSlot>,
    current_slot: usize,
    backbuffers: Vec<Arc<Texture>>,
    render_finished: Vec<vk::Semaphore>,
    extent: vk::Extent2D,
    format: vk::Format,

    /// Serial of the submission each fence was last handed to.
    fence_owner: HashMap<vk::Fence, u64>,
    next_serial: u64,
    completed_serial: u64,
    phase: FramePhase,

    resize_requested: Option<vk::Extent2D>,
    recreate_pending: bool,
    extent_dependent: Vec<Weak<Texture>>,

    timer: Timer,
    stats: FrameStats,
}

impl FrameOrchestrator {
    /// Wraps the device's current swapchain and creates one slot per image.
    ///
    /// # Errors
    ///
    /// Returns an error if any per-slot resource cannot be created.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        deletion: Arc<DeferredDeletionQueue>,
        fences: Arc<FenceManager>,
        semaphores: Arc<SemaphoreManager>,
        registry: Arc<ResourcePoolRegistry>,
        config: &RhiConfig,
    ) -> RhiResult<Self> {
        let settings = SlotSettings {
            max_descriptor_sets: config.max_descriptor_sets_per_frame,
            uniform_ring_size: config.uniform_ring_size,
            timestamp_queries: config.timestamp_queries,
        };

        let mut orchestrator = Self {
            device,
            deletion,
            fences,
            semaphores,
            registry,
            settings,
            slots: Vec::new(),
            current_slot: 0,
            backbuffers: Vec::new(),
            render_finished: Vec::new(),
            extent: vk::Extent2D::default(),
            format: vk::Format::UNDEFINED,
            fence_owner: HashMap::new(),
            next_serial: 1,
            completed_serial: 0,
            phase: FramePhase::Idle,
            resize_requested: None,
            recreate_pending: false,
            extent_dependent: Vec::new(),
            timer: Timer::new(),
            stats: FrameStats::default(),
        };

        let info = orchestrator.device.swapchain_info();
        orchestrator.adopt_swapchain(info)?;
        info!(
            "Frame orchestrator ready: {} frames in flight at {}x{}",
            orchestrator.slots.len(),
            orchestrator.extent.width,
            orchestrator.extent.height
        );
        Ok(orchestrator)
    }

    // =========================================================================
    // Frame Loop
    // =========================================================================

    /// Starts a frame.
    ///
    /// Waits until the slot's previous submission completed, acquires the
    /// next swapchain image and resets the slot's transient pools. Returns
    /// `Ok(None)` if the swapchain had to be rebuilt instead; the caller just
    /// skips the frame.
    ///
    /// # Errors
    ///
    /// Fails if a frame is already open or on device errors.
    pub fn begin_render_frame(
        &mut self,
        commands: &mut CommandBufferManager,
    ) -> RhiResult<Option<FrameContext>> {
        if self.phase != FramePhase::Idle {
            return Err(RhiError::InvalidHandle(format!(
                "begin_render_frame called while frame {} is {:?}",
                self.next_serial, self.phase
            )));
        }

        if let Some(extent) = self.resize_requested.take() {
            debug!("Resize requested, recreating swapchain before acquire");
            self.recreate(extent)?;
        } else if self.recreate_pending {
            debug!("Recreating swapchain left over from an earlier frame");
            self.recreate(self.extent)?;
        }

        let slot_index = self.current_slot;
        self.wait_for_slot(slot_index)?;

        let serial = self.next_serial;
        self.deletion.begin_frame(serial);
        // Native objects of evicted passes are released once this frame retires.
        self.registry.evict_invalidated();

        let image_available = self.slots[slot_index].image_available;
        let image_index = match self.device.acquire_next_image(image_available)? {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    debug!("Acquire returned suboptimal, recreating after present");
                    self.recreate_pending = true;
                }
                image_index
            }
            AcquireOutcome::OutOfDate => {
                warn!("Swapchain out of date on acquire, skipping frame {}", serial);
                self.recreate(self.extent)?;
                self.stats.skipped_frames += 1;
                return Ok(None);
            }
        };
        self.phase = FramePhase::Acquired;

        match self.open_frame(commands, serial, slot_index, image_index, image_available) {
            Ok(frame) => {
                self.phase = FramePhase::Recording;
                Ok(Some(frame))
            }
            Err(err) => Err(self.abandon_frame(serial, err)),
        }
    }

    /// Resets the slot's transient pools and opens a command buffer for an
    /// acquired image.
    fn open_frame(
        &mut self,
        commands: &mut CommandBufferManager,
        serial: u64,
        slot_index: usize,
        image_index: u32,
        image_available: vk::Semaphore,
    ) -> RhiResult<FrameContext> {
        let backbuffer = self
            .backbuffers
            .get(image_index as usize)
            .cloned()
            .ok_or_else(|| {
                RhiError::SwapchainError(format!("acquired image {} out of range", image_index))
            })?;
        let render_finished = self.render_finished[image_index as usize];

        let slot = &mut self.slots[slot_index];
        slot.descriptor_pool.reset()?;
        slot.uniforms.reset();

        let mut command_buffer = commands.get_or_create_command_buffer()?;
        if let Some(queries) = slot.timestamps.as_mut() {
            queries.reset(&mut command_buffer);
            queries.write_timestamp(&mut command_buffer, vk::PipelineStageFlags::TOP_OF_PIPE);
        }

        Ok(FrameContext {
            serial,
            slot: slot_index,
            image_index,
            phase: FramePhase::Recording,
            command_buffer,
            image_available,
            render_finished,
            descriptor_pool: Arc::clone(&slot.descriptor_pool),
            uniforms: Arc::clone(&slot.uniforms),
            backbuffer,
        })
    }

    /// Submits the frame's commands and presents its image.
    ///
    /// The backbuffer is transitioned to [`ResourceState::Present`] first if
    /// the recorded work left it in any other state.
    pub fn end_render_frame(
        &mut self,
        commands: &mut CommandBufferManager,
        frame: FrameContext,
    ) -> RhiResult<()> {
        let FrameContext {
            serial,
            slot,
            image_index,
            mut command_buffer,
            image_available,
            render_finished,
            backbuffer,
            ..
        } = frame;

        if backbuffer.current_state() != ResourceState::Present {
            transition_texture(&mut command_buffer, &backbuffer, ResourceState::Present);
        }
        if let Some(queries) = self.slots[slot].timestamps.as_mut() {
            queries.write_timestamp(&mut command_buffer, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        }

        let waits = [SemaphoreWait::binary(
            image_available,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        )];
        let signals = [SemaphoreSignal::binary(render_finished)];
        if let Err(err) = commands.submit(&mut command_buffer, &waits, &signals) {
            commands.discard_command_buffer(command_buffer);
            return Err(self.abandon_frame(serial, err));
        }

        let fence = command_buffer.fence();
        self.fence_owner.insert(fence, serial);
        self.slots[slot].last_submission = Some((fence, serial));
        commands.return_command_buffer(command_buffer);
        self.next_serial += 1;
        self.current_slot = (slot + 1) % self.slots.len();
        self.phase = FramePhase::Submitted;

        let outcome = match self.device.queue_present(image_index, render_finished) {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.abandon_frame(serial, err)),
        };
        match outcome {
            PresentOutcome::Presented => {}
            PresentOutcome::Suboptimal => {
                debug!("Present returned suboptimal");
                self.recreate_pending = true;
            }
            PresentOutcome::OutOfDate => {
                debug!("Present returned out of date");
                self.recreate_pending = true;
            }
        }
        self.phase = FramePhase::Presented;

        self.stats.frames_presented += 1;
        self.stats.last_cpu_frame_time = self.timer.tick();
        self.stats.average_cpu_frame_time = self.timer.average_frame_time();

        self.phase = FramePhase::Idle;
        if self.recreate_pending {
            // Retried at the next begin_render_frame if this fails.
            self.recreate(self.extent)?;
        }
        Ok(())
    }

    /// Returns to `Idle` after a failed frame and schedules a swapchain
    /// rebuild to release its image.
    fn abandon_frame(&mut self, serial: u64, err: RhiError) -> RhiError {
        error!("Frame {} abandoned in {:?}: {}", serial, self.phase, err);
        self.phase = FramePhase::Idle;
        self.recreate_pending = true;
        self.stats.failed_frames += 1;
        err
    }

    /// Flags a resize. The swapchain is rebuilt at the start of the next
    /// frame; zero-sized extents (minimized windows) are ignored.
    pub fn request_resize(&mut self, extent: vk::Extent2D) {
        if extent.width == 0 || extent.height == 0 {
            debug!("Ignoring resize to zero dimensions");
            return;
        }
        if extent.width == self.extent.width && extent.height == self.extent.height {
            return;
        }
        debug!(
            "Resize triggered: {}x{} -> {}x{}",
            self.extent.width, self.extent.height, extent.width, extent.height
        );
        self.resize_requested = Some(extent);
    }

    /// Resizes `texture` along with the swapchain from now on.
    pub fn track_extent_dependent(&mut self, texture: &Arc<Texture>) {
        self.extent_dependent.push(Arc::downgrade(texture));
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn wait_for_slot(&mut self, slot_index: usize) -> RhiResult<()> {
        let Some((fence, serial)) = self.slots[slot_index].last_submission.take() else {
            return Ok(());
        };

        // A fence handed to a later submission means the command buffer was
        // reclaimed, which only happens after this frame completed.
        if self.fence_owner.get(&fence) == Some(&serial) {
            self.fences.wait(fence, WAIT_FOREVER)?;
            self.fence_owner.remove(&fence);
        }

        self.completed_serial = self.completed_serial.max(serial);
        self.deletion.retire(self.completed_serial);

        if let Some(queries) = &self.slots[slot_index].timestamps
            && let Some(ms) = queries.elapsed_ms()?
        {
            self.stats.last_gpu_frame_ms = Some(ms);
        }
        Ok(())
    }

    /// Drains the device and rebuilds the swapchain and everything sized to it.
    fn recreate(&mut self, extent: vk::Extent2D) -> RhiResult<()> {
        warn!(
            "Recreating swapchain (was {}x{}, requested {}x{})",
            self.extent.width, self.extent.height, extent.width, extent.height
        );
        self.device.wait_idle()?;

        self.completed_serial = self.next_serial.saturating_sub(1);
        self.fence_owner.clear();
        for slot in &mut self.slots {
            slot.last_submission = None;
        }
        self.deletion.flush();

        for backbuffer in self.backbuffers.drain(..) {
            backbuffer.destroy();
        }

        let info = self.device.recreate_swapchain(extent)?;
        self.adopt_swapchain(info)?;

        let new_extent = self.extent;
        let mut resized = 0;
        self.extent_dependent.retain(|weak| weak.strong_count() > 0);
        for texture in self.extent_dependent.iter().filter_map(Weak::upgrade) {
            if !texture.is_destroyed() {
                texture.resize(new_extent)?;
                resized += 1;
            }
        }

        let evicted = self.registry.invalidate_swapchain_dependent();

        self.recreate_pending = false;
        self.current_slot = 0;
        self.stats.swapchain_recreations += 1;
        info!(
            "Swapchain recreated at {}x{}: {} render target(s) resized, {} cached object(s) evicted",
            new_extent.width, new_extent.height, resized, evicted
        );
        Ok(())
    }

    /// Wraps the swapchain images and sizes the slot and semaphore arrays
    /// to the image count.
    fn adopt_swapchain(&mut self, info: SwapchainInfo) -> RhiResult<()> {
        self.extent = info.extent;
        self.format = info.format;
        self.backbuffers = info
            .images
            .iter()
            .enumerate()
            .map(|(index, native)| {
                Texture::from_swapchain(
                    Arc::clone(&self.device),
                    Arc::clone(&self.deletion),
                    *native,
                    info.extent,
                    info.format,
                    index,
                )
            })
            .collect();

        let image_count = info.images.len();
        if image_count == 0 {
            return Err(RhiError::SwapchainError("swapchain has no images".into()));
        }

        while self.render_finished.len() < image_count {
            self.render_finished.push(self.semaphores.get_or_create()?);
        }
        for semaphore in self.render_finished.drain(image_count..) {
            self.semaphores.return_semaphore(semaphore);
        }

        while self.slots.len() < image_count {
            let slot = self.create_slot(self.slots.len())?;
            self.slots.push(slot);
        }
        for slot in self.slots.drain(image_count..) {
            self.semaphores.return_semaphore(slot.image_available);
        }
        Ok(())
    }

    fn create_slot(&self, index: usize) -> RhiResult<FrameSlot> {
        let descriptor_pool = Arc::new(SingleFrameDescriptorPool::new(
            Arc::clone(&self.device),
            self.settings.max_descriptor_sets,
        )?);

        let ring = Buffer::create(
            Arc::clone(&self.device),
            Arc::clone(&self.deletion),
            BufferUsage::Uniform.desc(format!("uniform ring {}", index), self.settings.uniform_ring_size),
        )?;
        let alignment = self.device.capabilities().min_uniform_buffer_offset_alignment;
        let uniforms = Arc::new(UniformRingBuffer::new(ring, alignment));

        let timestamps = if self.settings.timestamp_queries > 0
            && self.device.capabilities().timestamp_period > 0.0
        {
            Some(TimestampQueries::new(
                Arc::clone(&self.device),
                self.settings.timestamp_queries,
            )?)
        } else {
            None
        };

        debug!("Created frame slot {}", index);
        Ok(FrameSlot {
            image_available: self.semaphores.get_or_create()?,
            descriptor_pool,
            uniforms,
            timestamps,
            last_submission: None,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// Number of frames that may be in flight, equal to the swapchain image count.
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn backbuffers(&self) -> &[Arc<Texture>] {
        &self.backbuffers
    }

    /// Serial the next frame will carry.
    pub fn next_serial(&self) -> u64 {
        self.next_serial
    }

    /// Highest serial known to have finished on the GPU.
    pub fn completed_serial(&self) -> u64 {
        self.completed_serial
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }
}

impl Drop for FrameOrchestrator {
    fn drop(&mut self) {
        if let Err(err) = self.device.wait_idle() {
            warn!("Failed to drain device before frame teardown: {}", err);
        }
        for slot in self.slots.drain(..) {
            self.semaphores.return_semaphore(slot.image_available);
        }
        for semaphore in self.render_finished.drain(..) {
            self.semaphores.return_semaphore(semaphore);
        }
        for backbuffer in self.backbuffers.drain(..) {
            backbuffer.destroy();
        }
        info!("Frame orchestrator destroyed after {} frames", self.stats.frames_presented);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{DeviceEvent, HeadlessDevice, SwapchainFault};
    use crate::types::QueueType;

    struct Harness {
        headless: Arc<HeadlessDevice>,
        commands: CommandBufferManager,
        orchestrator: FrameOrchestrator,
    }

    fn harness() -> Harness {
        let headless = Arc::new(HeadlessDevice::new());
        let device: Arc<dyn GpuDevice> = headless.clone();
        let deletion = Arc::new(DeferredDeletionQueue::new());
        let fences = Arc::new(FenceManager::new(Arc::clone(&device)));
        let semaphores = Arc::new(SemaphoreManager::new(Arc::clone(&device)));
        let registry = Arc::new(ResourcePoolRegistry::new(
            Arc::clone(&device),
            Arc::clone(&deletion),
        ));
        let commands =
            CommandBufferManager::create_pool(Arc::clone(&device), QueueType::Graphics, Arc::clone(&fences))
                .unwrap();
        let config = RhiConfig {
            timestamp_queries: 0,
            ..RhiConfig::default()
        };
        let orchestrator =
            FrameOrchestrator::new(device, deletion, fences, semaphores, registry, &config).unwrap();
        Harness {
            headless,
            commands,
            orchestrator,
        }
    }

    impl Harness {
        fn frame(&mut self) -> Option<u64> {
            let frame = self.orchestrator.begin_render_frame(&mut self.commands).unwrap()?;
            let serial = frame.serial();
            self.orchestrator
                .end_render_frame(&mut self.commands, frame)
                .unwrap();
            Some(serial)
        }
    }

    #[test]
    fn test_one_slot_per_swapchain_image() {
        let h = harness();
        assert_eq!(h.orchestrator.frames_in_flight(), 3);
        assert_eq!(h.orchestrator.backbuffers().len(), 3);
        assert_eq!(h.orchestrator.phase(), FramePhase::Idle);
    }

    #[test]
    fn test_frame_context_is_recording() {
        let mut h = harness();
        let frame = h.orchestrator.begin_render_frame(&mut h.commands).unwrap().unwrap();
        assert_eq!(frame.phase(), FramePhase::Recording);
        assert_eq!(frame.serial(), 1);
        assert!(frame.command_buffer().is_open());
        assert_eq!(frame.extent().width, 800);
        assert_eq!(h.orchestrator.phase(), FramePhase::Recording);

        assert!(h.orchestrator.begin_render_frame(&mut h.commands).is_err());
        h.orchestrator.end_render_frame(&mut h.commands, frame).unwrap();
        assert_eq!(h.orchestrator.phase(), FramePhase::Idle);
    }

    #[test]
    fn test_untouched_backbuffer_is_transitioned_for_present() {
        let mut h = harness();
        let frame = h.orchestrator.begin_render_frame(&mut h.commands).unwrap().unwrap();
        let backbuffer = Arc::clone(frame.backbuffer());
        h.orchestrator.end_render_frame(&mut h.commands, frame).unwrap();
        assert_eq!(backbuffer.current_state(), ResourceState::Present);
    }

    #[test]
    fn test_slots_rotate() {
        let mut h = harness();
        let mut slots = Vec::new();
        for _ in 0..4 {
            let frame = h.orchestrator.begin_render_frame(&mut h.commands).unwrap().unwrap();
            slots.push(frame.slot());
            h.orchestrator.end_render_frame(&mut h.commands, frame).unwrap();
        }
        assert_eq!(slots, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_out_of_date_acquire_skips_one_frame() {
        let mut h = harness();
        h.frame().unwrap();
        h.headless.inject_swapchain_fault(SwapchainFault::OutOfDateOnAcquire);

        assert_eq!(h.frame(), None);
        assert_eq!(h.orchestrator.stats().skipped_frames, 1);
        assert_eq!(h.orchestrator.stats().swapchain_recreations, 1);
        assert_eq!(h.frame(), Some(2));
    }

    #[test]
    fn test_suboptimal_present_recreates_after_frame() {
        let mut h = harness();
        h.headless.inject_swapchain_fault(SwapchainFault::SuboptimalOnPresent);
        assert_eq!(h.frame(), Some(1));
        assert_eq!(h.orchestrator.stats().swapchain_recreations, 1);
        assert!(h
            .headless
            .events()
            .iter()
            .any(|e| matches!(e, DeviceEvent::WaitIdle)));
    }

    #[test]
    fn test_resize_request_rebuilds_before_acquire() {
        let mut h = harness();
        h.orchestrator.request_resize(vk::Extent2D {
            width: 0,
            height: 600,
        });
        h.frame().unwrap();
        assert_eq!(h.orchestrator.stats().swapchain_recreations, 0);

        h.orchestrator.request_resize(vk::Extent2D {
            width: 1024,
            height: 768,
        });
        let frame = h.orchestrator.begin_render_frame(&mut h.commands).unwrap().unwrap();
        assert_eq!(frame.extent().width, 1024);
        h.orchestrator.end_render_frame(&mut h.commands, frame).unwrap();
        assert_eq!(h.orchestrator.extent().height, 768);
        assert_eq!(h.orchestrator.stats().swapchain_recreations, 1);
    }

    #[test]
    fn test_tracked_targets_follow_swapchain_extent() {
        let mut h = harness();
        let deletion = Arc::new(DeferredDeletionQueue::new());
        let device: Arc<dyn GpuDevice> = h.headless.clone();
        let depth = Texture::create(
            device,
            deletion,
            crate::types::TextureDesc::render_target(
                "depth",
                h.orchestrator.extent(),
                vk::Format::D32_SFLOAT,
                1,
            ),
        )
        .unwrap();
        h.orchestrator.track_extent_dependent(&depth);

        h.orchestrator.request_resize(vk::Extent2D {
            width: 640,
            height: 480,
        });
        h.frame().unwrap();
        assert_eq!(depth.extent().width, 640);
        assert_eq!(depth.generation(), 1);
    }
}
