//! A simulated GPU.
//!
//! [`HeadlessDevice`] implements [`GpuDevice`] without touching any driver.
//! It mints handles, keeps fence, semaphore and descriptor pool state,
//! executes submissions in queue order, fakes a three-image swapchain and
//! logs every interesting call as a [`DeviceEvent`]. Tests drive it to
//! observe exactly what the RHI core asked the GPU to do.
//!
//! # Completion model
//!
//! Submissions complete in the order they were queued. With auto-complete
//! on (the default) each submission completes immediately; with it off they
//! stay pending until [`HeadlessDevice::complete_next`] or
//! [`HeadlessDevice::complete_all`] is called, or until a host wait needs
//! them. A host wait on an unsignaled fence retires pending submissions one
//! by one until the fence signals, and is logged as blocking.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ember_rhi::device::GpuDevice;
//! use ember_rhi::headless::HeadlessDevice;
//!
//! let device = Arc::new(HeadlessDevice::new());
//! device.set_auto_complete(false);
//! let fence = device.create_fence(false).unwrap();
//! assert!(!device.fence_signaled(fence));
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::binding::BindingShape;
use crate::device::GpuDevice;
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{ComputePipelineDesc, GraphicsPipelineDesc, PushConstantRange};
use crate::render_pass::RenderPassLayout;
use crate::state::sampler::SamplerStateDesc;
use crate::types::{
    AcquireOutcome, BufferDesc, DescriptorPoolDesc, DescriptorWrite, DeviceCapabilities,
    NativeBuffer, NativeTexture, PipelineBarrier, PresentOutcome, QueueType, RenderPassBegin,
    SemaphoreKind, SemaphoreSignal, SemaphoreWait, SubmitInfo, SwapchainInfo, TextureDesc,
};

/// Ticks added per timestamp write.
const TICKS_PER_TIMESTAMP: u64 = 1000;

/// One observable call into the device.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceEvent {
    Submit {
        queue: QueueType,
        command_buffers: Vec<vk::CommandBuffer>,
        waits: Vec<SemaphoreWait>,
        signals: Vec<SemaphoreSignal>,
        fence: vk::Fence,
    },
    /// A host wait on a fence; `blocked` if the fence was not yet signaled.
    FenceWait { fence: vk::Fence, blocked: bool },
    Barrier {
        cmd: vk::CommandBuffer,
        barrier: PipelineBarrier,
    },
    BeginRenderPass {
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        width: u32,
        height: u32,
    },
    NextSubpass { cmd: vk::CommandBuffer },
    EndRenderPass { cmd: vk::CommandBuffer },
    BindPipeline {
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSets {
        cmd: vk::CommandBuffer,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
    UpdateDescriptorSet {
        set: vk::DescriptorSet,
        write_count: usize,
    },
    Draw {
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
    },
    DrawIndirect {
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        draw_count: u32,
        indexed: bool,
    },
    Dispatch {
        cmd: vk::CommandBuffer,
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: u64,
    },
    CopyBufferToImage {
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        image: vk::Image,
    },
    Acquire {
        image_index: u32,
        signal: vk::Semaphore,
    },
    Present {
        image_index: u32,
        wait: vk::Semaphore,
    },
    SwapchainRecreated { width: u32, height: u32 },
    WaitIdle,
}

/// Presentation failure injected into the next acquire or present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapchainFault {
    OutOfDateOnAcquire,
    SuboptimalOnAcquire,
    OutOfDateOnPresent,
    SuboptimalOnPresent,
}

/// Device error injected into the next submit or present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceFault {
    SubmitFails,
    PresentFails,
}

/// Object counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub fences_created: usize,
    pub fences_destroyed: usize,
    pub semaphores_created: usize,
    pub semaphores_destroyed: usize,
    pub command_pools_created: usize,
    pub command_pools_destroyed: usize,
    pub command_buffers_allocated: usize,
    pub command_buffers_begun: usize,
    pub submissions: usize,
    pub samplers_created: usize,
    pub samplers_destroyed: usize,
    pub shader_modules_created: usize,
    pub shader_modules_destroyed: usize,
    pub pipeline_layouts_created: usize,
    pub pipeline_layouts_destroyed: usize,
    pub pipelines_created: usize,
    pub pipelines_destroyed: usize,
    pub render_passes_created: usize,
    pub render_passes_destroyed: usize,
    pub framebuffers_created: usize,
    pub framebuffers_destroyed: usize,
    pub descriptor_set_layouts_created: usize,
    pub descriptor_set_layouts_destroyed: usize,
    pub descriptor_pools_created: usize,
    pub descriptor_pools_destroyed: usize,
    pub descriptor_sets_allocated: usize,
    pub descriptor_sets_freed: usize,
    pub descriptor_updates: usize,
    pub textures_created: usize,
    pub textures_destroyed: usize,
    pub buffers_created: usize,
    pub buffers_destroyed: usize,
    pub swapchain_recreations: usize,
}

/// Work recorded into a command buffer that changes device state when the
/// buffer executes.
#[derive(Clone, Copy, Debug)]
enum RecordedOp {
    ResetQueries {
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    },
    Timestamp {
        pool: vk::QueryPool,
        query: u32,
    },
}

struct Submission {
    command_buffers: Vec<vk::CommandBuffer>,
    signals: Vec<SemaphoreSignal>,
    fence: vk::Fence,
}

struct DescriptorPoolState {
    max_sets: u32,
    free_individual_sets: bool,
    sets: HashSet<vk::DescriptorSet>,
}

struct HostBuffer {
    host_visible: bool,
    data: Vec<u8>,
}

struct State {
    auto_complete: bool,
    fences: HashMap<vk::Fence, bool>,
    binary_semaphores: HashMap<vk::Semaphore, bool>,
    timeline_semaphores: HashMap<vk::Semaphore, u64>,
    command_pools: HashMap<vk::CommandPool, Vec<vk::CommandBuffer>>,
    recorded: HashMap<vk::CommandBuffer, Vec<RecordedOp>>,
    pending: VecDeque<Submission>,
    descriptor_pools: HashMap<vk::DescriptorPool, DescriptorPoolState>,
    buffers: HashMap<vk::Buffer, HostBuffer>,
    query_pools: HashMap<vk::QueryPool, Vec<Option<u64>>>,
    gpu_ticks: u64,
    swapchain: SwapchainInfo,
    image_count: usize,
    surface_extent: Option<vk::Extent2D>,
    next_image: u32,
    acquire_fault: Option<SwapchainFault>,
    present_fault: Option<SwapchainFault>,
    submit_fails: bool,
    present_fails: bool,
    events: Vec<DeviceEvent>,
    stats: HeadlessStats,
}

impl State {
    /// Executes the oldest pending submission. Returns `false` if none was pending.
    fn complete_next(&mut self) -> bool {
        let Some(submission) = self.pending.pop_front() else {
            return false;
        };

        for cmd in &submission.command_buffers {
            let Some(ops) = self.recorded.get(cmd) else {
                continue;
            };
            for op in ops {
                match *op {
                    RecordedOp::ResetQueries { pool, first, count } => {
                        if let Some(results) = self.query_pools.get_mut(&pool) {
                            let end = (first + count) as usize;
                            for slot in results.iter_mut().take(end).skip(first as usize) {
                                *slot = None;
                            }
                        }
                    }
                    RecordedOp::Timestamp { pool, query } => {
                        self.gpu_ticks += TICKS_PER_TIMESTAMP;
                        if let Some(slot) = self
                            .query_pools
                            .get_mut(&pool)
                            .and_then(|results| results.get_mut(query as usize))
                        {
                            *slot = Some(self.gpu_ticks);
                        }
                    }
                }
            }
        }

        for signal in &submission.signals {
            if let Some(value) = self.timeline_semaphores.get_mut(&signal.semaphore) {
                *value = (*value).max(signal.value);
            } else {
                self.binary_semaphores.insert(signal.semaphore, true);
            }
        }
        if submission.fence != vk::Fence::null() {
            self.fences.insert(submission.fence, true);
        }
        true
    }

    fn complete_all(&mut self) -> usize {
        let mut count = 0;
        while self.complete_next() {
            count += 1;
        }
        count
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool> {
        self.fences
            .get(&fence)
            .copied()
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown fence {:?}", fence)))
    }

    fn record(&mut self, cmd: vk::CommandBuffer, op: RecordedOp) {
        self.recorded.entry(cmd).or_default().push(op);
    }

    fn surface_mismatch(&self) -> bool {
        self.surface_extent
            .is_some_and(|extent| extent != self.swapchain.extent)
    }
}

/// A [`GpuDevice`] that simulates execution on the host.
pub struct HeadlessDevice {
    capabilities: DeviceCapabilities,
    next_handle: AtomicU64,
    state: Mutex<State>,
}

impl HeadlessDevice {
    /// A device with [`HeadlessDevice::default_capabilities`] and an
    /// 800x600, three-image `B8G8R8A8_SRGB` swapchain.
    pub fn new() -> Self {
        Self::with_capabilities(Self::default_capabilities())
    }

    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        let device = Self {
            capabilities,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(State {
                auto_complete: true,
                fences: HashMap::new(),
                binary_semaphores: HashMap::new(),
                timeline_semaphores: HashMap::new(),
                command_pools: HashMap::new(),
                recorded: HashMap::new(),
                pending: VecDeque::new(),
                descriptor_pools: HashMap::new(),
                buffers: HashMap::new(),
                query_pools: HashMap::new(),
                gpu_ticks: 0,
                swapchain: SwapchainInfo {
                    extent: vk::Extent2D::default(),
                    format: vk::Format::B8G8R8A8_SRGB,
                    images: Vec::new(),
                },
                image_count: 3,
                surface_extent: None,
                next_image: 0,
                acquire_fault: None,
                present_fault: None,
                submit_fails: false,
                present_fails: false,
                events: Vec::new(),
                stats: HeadlessStats::default(),
            }),
        };
        device.rebuild_swapchain(
            vk::Extent2D {
                width: 800,
                height: 600,
            },
            3,
        );
        device
    }

    /// Replaces the simulated swapchain before the device is shared.
    pub fn with_swapchain(self, extent: vk::Extent2D, image_count: usize) -> Self {
        self.rebuild_swapchain(extent, image_count);
        self
    }

    pub fn default_capabilities() -> DeviceCapabilities {
        DeviceCapabilities {
            device_name: "Headless".to_string(),
            timestamp_period: 1.0,
            whole_query_readback: true,
            timeline_semaphores: true,
            acceleration_structures: false,
            min_uniform_buffer_offset_alignment: 256,
            max_bound_descriptor_sets: 8,
            framebuffer_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_2
                | vk::SampleCountFlags::TYPE_4
                | vk::SampleCountFlags::TYPE_8,
        }
    }

    fn mint<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn rebuild_swapchain(&self, extent: vk::Extent2D, image_count: usize) {
        let images = (0..image_count)
            .map(|_| NativeTexture {
                image: self.mint(),
                view: self.mint(),
            })
            .collect();
        let mut state = self.state.lock();
        state.swapchain.extent = extent;
        state.swapchain.images = images;
        state.image_count = image_count;
        state.next_image = 0;
    }

    // =========================================================================
    // Simulation Control
    // =========================================================================

    /// Whether submissions complete as soon as they are queued.
    pub fn set_auto_complete(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.auto_complete = enabled;
        if enabled {
            state.complete_all();
        }
    }

    /// Completes the oldest pending submission. Returns `false` if none was pending.
    pub fn complete_next(&self) -> bool {
        self.state.lock().complete_next()
    }

    /// Completes every pending submission and returns how many there were.
    pub fn complete_all(&self) -> usize {
        self.state.lock().complete_all()
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().fence_signaled(fence).unwrap_or(false)
    }

    pub fn semaphore_signaled(&self, semaphore: vk::Semaphore) -> bool {
        self.state
            .lock()
            .binary_semaphores
            .get(&semaphore)
            .copied()
            .unwrap_or(false)
    }

    /// Makes the next acquire or present (depending on the fault) fail.
    pub fn inject_swapchain_fault(&self, fault: SwapchainFault) {
        let mut state = self.state.lock();
        match fault {
            SwapchainFault::OutOfDateOnAcquire | SwapchainFault::SuboptimalOnAcquire => {
                state.acquire_fault = Some(fault)
            }
            SwapchainFault::OutOfDateOnPresent | SwapchainFault::SuboptimalOnPresent => {
                state.present_fault = Some(fault)
            }
        }
    }

    /// Makes the next submit or present return a device error.
    pub fn inject_device_fault(&self, fault: DeviceFault) {
        let mut state = self.state.lock();
        match fault {
            DeviceFault::SubmitFails => state.submit_fails = true,
            DeviceFault::PresentFails => state.present_fails = true,
        }
    }

    /// Simulates a window resize: acquire and present report out-of-date
    /// until the swapchain is rebuilt, which then adopts `extent`.
    pub fn resize_surface(&self, extent: vk::Extent2D) {
        self.state.lock().surface_extent = Some(extent);
    }

    /// Every event logged since creation or the last [`clear_events`](Self::clear_events).
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn stats(&self) -> HeadlessStats {
        self.state.lock().stats
    }

    /// Contents of a host-visible buffer.
    pub fn read_buffer(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state
            .lock()
            .buffers
            .get(&buffer)
            .filter(|b| b.host_visible)
            .map(|b| b.data.clone())
    }

    /// Sets currently allocated from `pool`.
    pub fn live_descriptor_sets(&self, pool: vk::DescriptorPool) -> Option<usize> {
        self.state
            .lock()
            .descriptor_pools
            .get(&pool)
            .map(|p| p.sets.len())
    }

    fn log(&self, event: DeviceEvent) {
        self.state.lock().events.push(event);
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for HeadlessDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    // ===== Fences =====

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let fence = self.mint();
        let mut state = self.state.lock();
        state.fences.insert(fence, signaled);
        state.stats.fences_created += 1;
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        if state.fences.remove(&fence).is_some() {
            state.stats.fences_destroyed += 1;
        }
    }

    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool> {
        self.state.lock().fence_signaled(fence)
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> RhiResult<()> {
        let mut state = self.state.lock();
        for &fence in fences {
            let mut blocked = false;
            while !state.fence_signaled(fence)? {
                blocked = true;
                if timeout_ns == 0 || !state.complete_next() {
                    return Err(RhiError::Timeout(format!("fence {:?}", fence)));
                }
            }
            state.events.push(DeviceEvent::FenceWait { fence, blocked });
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()> {
        let mut state = self.state.lock();
        for fence in fences {
            match state.fences.get_mut(fence) {
                Some(signaled) => *signaled = false,
                None => return Err(RhiError::InvalidHandle(format!("unknown fence {:?}", fence))),
            }
        }
        Ok(())
    }

    // ===== Semaphores =====

    fn create_semaphore(&self, kind: SemaphoreKind) -> RhiResult<vk::Semaphore> {
        let semaphore = self.mint();
        let mut state = self.state.lock();
        match kind {
            SemaphoreKind::Binary => {
                state.binary_semaphores.insert(semaphore, false);
            }
            SemaphoreKind::Timeline { initial_value } => {
                state.timeline_semaphores.insert(semaphore, initial_value);
            }
        }
        state.stats.semaphores_created += 1;
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        let known = state.binary_semaphores.remove(&semaphore).is_some()
            || state.timeline_semaphores.remove(&semaphore).is_some();
        if known {
            state.stats.semaphores_destroyed += 1;
        }
    }

    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> RhiResult<u64> {
        self.state
            .lock()
            .timeline_semaphores
            .get(&semaphore)
            .copied()
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?} is not a timeline", semaphore)))
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> RhiResult<()> {
        let mut state = self.state.lock();
        let current = state
            .timeline_semaphores
            .get_mut(&semaphore)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?} is not a timeline", semaphore)))?;
        if value <= *current {
            return Err(RhiError::InvalidHandle(format!(
                "timeline {:?} signaled with {} but is already at {}",
                semaphore, value, current
            )));
        }
        *current = value;
        Ok(())
    }

    fn wait_semaphore(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout_ns: u64,
    ) -> RhiResult<()> {
        let mut state = self.state.lock();
        loop {
            let current = state
                .timeline_semaphores
                .get(&semaphore)
                .copied()
                .ok_or_else(|| {
                    RhiError::InvalidHandle(format!("{:?} is not a timeline", semaphore))
                })?;
            if current >= value {
                return Ok(());
            }
            if timeout_ns == 0 || !state.complete_next() {
                return Err(RhiError::Timeout(format!(
                    "timeline {:?} to reach {}",
                    semaphore, value
                )));
            }
        }
    }

    // ===== Command pools and buffers =====

    fn create_command_pool(&self, _queue: QueueType) -> RhiResult<vk::CommandPool> {
        let pool = self.mint();
        let mut state = self.state.lock();
        state.command_pools.insert(pool, Vec::new());
        state.stats.command_pools_created += 1;
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        if let Some(buffers) = state.command_pools.remove(&pool) {
            for cmd in buffers {
                state.recorded.remove(&cmd);
            }
            state.stats.command_pools_destroyed += 1;
        }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> RhiResult<vk::CommandBuffer> {
        let cmd = self.mint();
        let mut state = self.state.lock();
        state
            .command_pools
            .get_mut(&pool)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown command pool {:?}", pool)))?
            .push(cmd);
        state.stats.command_buffers_allocated += 1;
        Ok(cmd)
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.recorded.insert(cmd, Vec::new());
        state.stats.command_buffers_begun += 1;
        Ok(())
    }

    fn end_command_buffer(&self, _cmd: vk::CommandBuffer) -> RhiResult<()> {
        Ok(())
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        self.state.lock().recorded.remove(&cmd);
        Ok(())
    }

    // ===== Recording =====

    fn cmd_pipeline_barrier(&self, cmd: vk::CommandBuffer, barrier: &PipelineBarrier) {
        self.log(DeviceEvent::Barrier {
            cmd,
            barrier: barrier.clone(),
        });
    }

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, begin: &RenderPassBegin) {
        self.log(DeviceEvent::BeginRenderPass {
            cmd,
            render_pass: begin.render_pass,
            framebuffer: begin.framebuffer,
            width: begin.area.extent.width,
            height: begin.area.extent.height,
        });
    }

    fn cmd_next_subpass(&self, cmd: vk::CommandBuffer) {
        self.log(DeviceEvent::NextSubpass { cmd });
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        self.log(DeviceEvent::EndRenderPass { cmd });
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.log(DeviceEvent::BindPipeline {
            cmd,
            bind_point,
            pipeline,
        });
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        _dynamic_offsets: &[u32],
    ) {
        self.log(DeviceEvent::BindDescriptorSets {
            cmd,
            first_set,
            sets: sets.to_vec(),
        });
    }

    fn cmd_push_constants(
        &self,
        _cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        _offset: u32,
        _data: &[u8],
    ) {
    }

    fn cmd_set_viewport(&self, _cmd: vk::CommandBuffer, _viewport: vk::Viewport) {}

    fn cmd_set_scissor(&self, _cmd: vk::CommandBuffer, _scissor: vk::Rect2D) {}

    fn cmd_bind_vertex_buffers(
        &self,
        _cmd: vk::CommandBuffer,
        _first_binding: u32,
        _buffers: &[vk::Buffer],
        _offsets: &[u64],
    ) {
    }

    fn cmd_bind_index_buffer(
        &self,
        _cmd: vk::CommandBuffer,
        _buffer: vk::Buffer,
        _offset: u64,
        _index_type: vk::IndexType,
    ) {
    }

    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.log(DeviceEvent::Draw {
            cmd,
            vertex_count,
            instance_count,
        });
    }

    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.log(DeviceEvent::DrawIndexed {
            cmd,
            index_count,
            instance_count,
        });
    }

    fn cmd_draw_indirect(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: u64,
        draw_count: u32,
        _stride: u32,
    ) {
        self.log(DeviceEvent::DrawIndirect {
            cmd,
            buffer,
            draw_count,
            indexed: false,
        });
    }

    fn cmd_draw_indexed_indirect(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: u64,
        draw_count: u32,
        _stride: u32,
    ) {
        self.log(DeviceEvent::DrawIndirect {
            cmd,
            buffer,
            draw_count,
            indexed: true,
        });
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.log(DeviceEvent::Dispatch { cmd, x, y, z });
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) {
        let mut state = self.state.lock();
        // Copies land at record time; the simulation has no memory hazards.
        let bytes = state.buffers.get(&src).and_then(|b| {
            b.data
                .get(src_offset as usize..(src_offset + size) as usize)
                .map(<[u8]>::to_vec)
        });
        if let (Some(bytes), Some(destination)) = (bytes, state.buffers.get_mut(&dst))
            && let Some(target) = destination
                .data
                .get_mut(dst_offset as usize..(dst_offset + size) as usize)
        {
            target.copy_from_slice(&bytes);
        }
        state.events.push(DeviceEvent::CopyBuffer {
            cmd,
            src,
            dst,
            size,
        });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        image: vk::Image,
        _aspect: vk::ImageAspectFlags,
        _extent: vk::Extent2D,
    ) {
        self.log(DeviceEvent::CopyBufferToImage { cmd, src, image });
    }

    fn cmd_reset_query_pool(
        &self,
        cmd: vk::CommandBuffer,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    ) {
        self.state
            .lock()
            .record(cmd, RecordedOp::ResetQueries { pool, first, count });
    }

    fn cmd_write_timestamp(
        &self,
        cmd: vk::CommandBuffer,
        _stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        query: u32,
    ) {
        self.state
            .lock()
            .record(cmd, RecordedOp::Timestamp { pool, query });
    }

    // ===== Submission =====

    fn queue_submit(&self, queue: QueueType, submit: &SubmitInfo<'_>) -> RhiResult<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.submit_fails) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into());
        }
        if submit.fence != vk::Fence::null() && state.fence_signaled(submit.fence)? {
            warn!("Submitting with fence {:?} still signaled", submit.fence);
        }
        for wait in submit.waits {
            if let Some(signaled) = state.binary_semaphores.get_mut(&wait.semaphore) {
                *signaled = false;
            }
        }

        state.events.push(DeviceEvent::Submit {
            queue,
            command_buffers: submit.command_buffers.to_vec(),
            waits: submit.waits.to_vec(),
            signals: submit.signals.to_vec(),
            fence: submit.fence,
        });
        state.stats.submissions += 1;
        state.pending.push_back(Submission {
            command_buffers: submit.command_buffers.to_vec(),
            signals: submit.signals.to_vec(),
            fence: submit.fence,
        });

        if state.auto_complete {
            state.complete_all();
        }
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: QueueType) -> RhiResult<()> {
        self.state.lock().complete_all();
        Ok(())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.complete_all();
        state.events.push(DeviceEvent::WaitIdle);
        Ok(())
    }

    // ===== State objects =====

    fn create_sampler(&self, _desc: &SamplerStateDesc) -> RhiResult<vk::Sampler> {
        self.state.lock().stats.samplers_created += 1;
        Ok(self.mint())
    }

    fn destroy_sampler(&self, _sampler: vk::Sampler) {
        self.state.lock().stats.samplers_destroyed += 1;
    }

    fn create_shader_module(&self, code: &[u32]) -> RhiResult<vk::ShaderModule> {
        if code.is_empty() {
            return Err(RhiError::ShaderError("empty SPIR-V".into()));
        }
        self.state.lock().stats.shader_modules_created += 1;
        Ok(self.mint())
    }

    fn destroy_shader_module(&self, _module: vk::ShaderModule) {
        self.state.lock().stats.shader_modules_destroyed += 1;
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constants: &[PushConstantRange],
    ) -> RhiResult<vk::PipelineLayout> {
        self.state.lock().stats.pipeline_layouts_created += 1;
        Ok(self.mint())
    }

    fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {
        self.state.lock().stats.pipeline_layouts_destroyed += 1;
    }

    fn create_graphics_pipeline(
        &self,
        _desc: &GraphicsPipelineDesc,
        _layout: vk::PipelineLayout,
    ) -> RhiResult<vk::Pipeline> {
        self.state.lock().stats.pipelines_created += 1;
        Ok(self.mint())
    }

    fn create_compute_pipeline(
        &self,
        _desc: &ComputePipelineDesc,
        _layout: vk::PipelineLayout,
    ) -> RhiResult<vk::Pipeline> {
        self.state.lock().stats.pipelines_created += 1;
        Ok(self.mint())
    }

    fn destroy_pipeline(&self, _pipeline: vk::Pipeline) {
        self.state.lock().stats.pipelines_destroyed += 1;
    }

    fn create_render_pass(&self, layout: &RenderPassLayout) -> RhiResult<vk::RenderPass> {
        debug!(
            "Headless render pass: {} attachment(s), {} subpass(es)",
            layout.attachments.len(),
            layout.subpasses.len()
        );
        self.state.lock().stats.render_passes_created += 1;
        Ok(self.mint())
    }

    fn destroy_render_pass(&self, _render_pass: vk::RenderPass) {
        self.state.lock().stats.render_passes_destroyed += 1;
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _views: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> RhiResult<vk::Framebuffer> {
        self.state.lock().stats.framebuffers_created += 1;
        Ok(self.mint())
    }

    fn destroy_framebuffer(&self, _framebuffer: vk::Framebuffer) {
        self.state.lock().stats.framebuffers_destroyed += 1;
    }

    // ===== Descriptors =====

    fn create_descriptor_set_layout(
        &self,
        _shapes: &[BindingShape],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        self.state.lock().stats.descriptor_set_layouts_created += 1;
        Ok(self.mint())
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {
        self.state.lock().stats.descriptor_set_layouts_destroyed += 1;
    }

    fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc) -> RhiResult<vk::DescriptorPool> {
        let pool = self.mint();
        let mut state = self.state.lock();
        state.descriptor_pools.insert(
            pool,
            DescriptorPoolState {
                max_sets: desc.max_sets,
                free_individual_sets: desc.free_individual_sets,
                sets: HashSet::new(),
            },
        );
        state.stats.descriptor_pools_created += 1;
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        if state.descriptor_pools.remove(&pool).is_some() {
            state.stats.descriptor_pools_destroyed += 1;
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
        _variable_count: Option<u32>,
    ) -> RhiResult<vk::DescriptorSet> {
        let set = self.mint();
        let mut state = self.state.lock();
        let entry = state.descriptor_pools.get_mut(&pool).ok_or_else(|| {
            RhiError::InvalidHandle(format!("unknown descriptor pool {:?}", pool))
        })?;
        if entry.sets.len() as u32 >= entry.max_sets {
            return Err(RhiError::DescriptorPoolExhausted(format!(
                "pool {:?} holds {} sets",
                pool, entry.max_sets
            )));
        }
        entry.sets.insert(set);
        state.stats.descriptor_sets_allocated += 1;
        Ok(set)
    }

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) -> RhiResult<()> {
        let mut state = self.state.lock();
        let entry = state.descriptor_pools.get_mut(&pool).ok_or_else(|| {
            RhiError::InvalidHandle(format!("unknown descriptor pool {:?}", pool))
        })?;
        if !entry.free_individual_sets {
            return Err(RhiError::InvalidHandle(format!(
                "descriptor pool {:?} does not free individual sets",
                pool
            )));
        }
        if !entry.sets.remove(&set) {
            return Err(RhiError::InvalidHandle(format!(
                "descriptor set {:?} is not allocated from {:?}",
                set, pool
            )));
        }
        state.stats.descriptor_sets_freed += 1;
        Ok(())
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()> {
        let mut state = self.state.lock();
        state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown descriptor pool {:?}", pool)))?
            .sets
            .clear();
        Ok(())
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let mut state = self.state.lock();
        state.stats.descriptor_updates += 1;
        state.events.push(DeviceEvent::UpdateDescriptorSet {
            set,
            write_count: writes.len(),
        });
    }

    // ===== Resources =====

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<NativeTexture> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(RhiError::InvalidHandle(format!(
                "texture '{}' has an empty extent",
                desc.name
            )));
        }
        let texture = NativeTexture {
            image: self.mint(),
            view: self.mint(),
        };
        self.state.lock().stats.textures_created += 1;
        Ok(texture)
    }

    fn destroy_texture(&self, _texture: NativeTexture) {
        self.state.lock().stats.textures_destroyed += 1;
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<NativeBuffer> {
        if desc.size == 0 {
            return Err(RhiError::InvalidHandle(format!(
                "buffer '{}' has zero size",
                desc.name
            )));
        }
        let buffer = self.mint();
        let mut state = self.state.lock();
        state.buffers.insert(
            buffer,
            HostBuffer {
                host_visible: desc.host_visible,
                data: vec![0; desc.size as usize],
            },
        );
        state.stats.buffers_created += 1;
        Ok(NativeBuffer {
            buffer,
            size: desc.size,
        })
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown buffer {:?}", buffer)))?;
        if !entry.host_visible {
            return Err(RhiError::InvalidHandle(format!(
                "buffer {:?} is not host-visible",
                buffer
            )));
        }
        let range = offset as usize..offset as usize + data.len();
        let target = entry
            .data
            .get_mut(range)
            .ok_or_else(|| RhiError::InvalidHandle(format!("write out of bounds of {:?}", buffer)))?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer).is_some() {
            state.stats.buffers_destroyed += 1;
        }
    }

    // ===== Queries =====

    fn create_timestamp_query_pool(&self, count: u32) -> RhiResult<vk::QueryPool> {
        let pool = self.mint();
        self.state
            .lock()
            .query_pools
            .insert(pool, vec![None; count as usize]);
        Ok(pool)
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        self.state.lock().query_pools.remove(&pool);
    }

    fn query_results(&self, pool: vk::QueryPool, first: u32, out: &mut [u64]) -> RhiResult<bool> {
        let state = self.state.lock();
        let results = state
            .query_pools
            .get(&pool)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown query pool {:?}", pool)))?;
        let range = first as usize..first as usize + out.len();
        let slice = results
            .get(range)
            .ok_or_else(|| RhiError::InvalidHandle(format!("query range out of bounds of {:?}", pool)))?;
        for (value, result) in out.iter_mut().zip(slice) {
            match result {
                Some(ticks) => *value = *ticks,
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    // ===== Swapchain =====

    fn swapchain_info(&self) -> SwapchainInfo {
        self.state.lock().swapchain.clone()
    }

    fn acquire_next_image(&self, signal: vk::Semaphore) -> RhiResult<AcquireOutcome> {
        let mut state = self.state.lock();
        let fault = state.acquire_fault.take();
        if fault == Some(SwapchainFault::OutOfDateOnAcquire) || state.surface_mismatch() {
            return Ok(AcquireOutcome::OutOfDate);
        }

        let image_index = state.next_image;
        state.next_image = (image_index + 1) % state.image_count as u32;
        state.binary_semaphores.insert(signal, true);
        state.events.push(DeviceEvent::Acquire {
            image_index,
            signal,
        });
        Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal: fault == Some(SwapchainFault::SuboptimalOnAcquire),
        })
    }

    fn queue_present(&self, image_index: u32, wait: vk::Semaphore) -> RhiResult<PresentOutcome> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.present_fails) {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR.into());
        }
        if let Some(signaled) = state.binary_semaphores.get_mut(&wait) {
            *signaled = false;
        }
        state.events.push(DeviceEvent::Present { image_index, wait });

        let outcome = match state.present_fault.take() {
            Some(SwapchainFault::OutOfDateOnPresent) => PresentOutcome::OutOfDate,
            Some(SwapchainFault::SuboptimalOnPresent) => PresentOutcome::Suboptimal,
            _ if state.surface_mismatch() => PresentOutcome::OutOfDate,
            _ => PresentOutcome::Presented,
        };
        Ok(outcome)
    }

    fn recreate_swapchain(&self, extent: vk::Extent2D) -> RhiResult<SwapchainInfo> {
        let (extent, image_count) = {
            let mut state = self.state.lock();
            if !state.pending.is_empty() {
                warn!(
                    "Swapchain recreated with {} submission(s) still pending",
                    state.pending.len()
                );
            }
            let extent = state.surface_extent.unwrap_or(extent);
            state.stats.swapchain_recreations += 1;
            state.events.push(DeviceEvent::SwapchainRecreated {
                width: extent.width,
                height: extent.height,
            });
            (extent, state.image_count)
        };
        self.rebuild_swapchain(extent, image_count);
        info!(
            "Headless swapchain recreated: {}x{}, {} images",
            extent.width, extent.height, image_count
        );
        Ok(self.swapchain_info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_completion_signals_in_order() {
        let device = HeadlessDevice::new();
        device.set_auto_complete(false);
        let first = device.create_fence(false).unwrap();
        let second = device.create_fence(false).unwrap();
        for fence in [first, second] {
            device
                .queue_submit(
                    QueueType::Graphics,
                    &SubmitInfo {
                        command_buffers: &[],
                        waits: &[],
                        signals: &[],
                        fence,
                    },
                )
                .unwrap();
        }

        assert_eq!(device.pending_submissions(), 2);
        assert!(device.complete_next());
        assert!(device.fence_signaled(first));
        assert!(!device.fence_signaled(second));
        assert_eq!(device.complete_all(), 1);
        assert!(device.fence_signaled(second));
    }

    #[test]
    fn test_wait_on_unsignaled_fence_blocks_and_retires() {
        let device = HeadlessDevice::new();
        device.set_auto_complete(false);
        let fence = device.create_fence(false).unwrap();
        device
            .queue_submit(
                QueueType::Graphics,
                &SubmitInfo {
                    command_buffers: &[],
                    waits: &[],
                    signals: &[],
                    fence,
                },
            )
            .unwrap();

        device.wait_for_fences(&[fence], u64::MAX).unwrap();
        assert_eq!(
            device.events().last(),
            Some(&DeviceEvent::FenceWait {
                fence,
                blocked: true
            })
        );
    }

    #[test]
    fn test_wait_without_work_times_out() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        assert!(matches!(
            device.wait_for_fences(&[fence], u64::MAX),
            Err(RhiError::Timeout(_))
        ));
    }

    #[test]
    fn test_descriptor_pool_capacity() {
        let device = HeadlessDevice::new();
        let pool = device
            .create_descriptor_pool(&DescriptorPoolDesc::for_sets(2, false))
            .unwrap();
        let layout = vk::DescriptorSetLayout::null();
        device.allocate_descriptor_set(pool, layout, None).unwrap();
        device.allocate_descriptor_set(pool, layout, None).unwrap();
        assert!(matches!(
            device.allocate_descriptor_set(pool, layout, None),
            Err(RhiError::DescriptorPoolExhausted(_))
        ));
        device.reset_descriptor_pool(pool).unwrap();
        assert_eq!(device.live_descriptor_sets(pool), Some(0));
    }

    #[test]
    fn test_swapchain_cycles_images() {
        let device = HeadlessDevice::new();
        let semaphore = device.create_semaphore(SemaphoreKind::Binary).unwrap();
        let indices: Vec<u32> = (0..4)
            .map(|_| match device.acquire_next_image(semaphore).unwrap() {
                AcquireOutcome::Acquired { image_index, .. } => image_index,
                AcquireOutcome::OutOfDate => panic!("unexpected out of date"),
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0]);
        assert!(device.semaphore_signaled(semaphore));
    }

    #[test]
    fn test_surface_resize_reports_out_of_date_until_rebuilt() {
        let device = HeadlessDevice::new();
        let semaphore = device.create_semaphore(SemaphoreKind::Binary).unwrap();
        let extent = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        device.resize_surface(extent);
        assert_eq!(
            device.acquire_next_image(semaphore).unwrap(),
            AcquireOutcome::OutOfDate
        );

        let info = device
            .recreate_swapchain(vk::Extent2D {
                width: 1,
                height: 1,
            })
            .unwrap();
        assert_eq!(info.extent, extent);
        assert!(matches!(
            device.acquire_next_image(semaphore).unwrap(),
            AcquireOutcome::Acquired { .. }
        ));
    }

    #[test]
    fn test_host_buffer_roundtrip() {
        let device = HeadlessDevice::new();
        let buffer = device
            .create_buffer(&BufferDesc {
                name: "staging".into(),
                size: 8,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                host_visible: true,
            })
            .unwrap();
        device.write_buffer(buffer.buffer, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(device.read_buffer(buffer.buffer), Some(vec![0, 0, 0, 0, 1, 2, 3, 4]));
        assert!(device.write_buffer(buffer.buffer, 6, &[0; 4]).is_err());
    }
}
