//! Resource state transitions.
//!
//! Every [`Texture`] and [`Buffer`] remembers the state it was last
//! transitioned into. A transition looks up the pipeline stages and access
//! masks for the `(old, new)` pair in a fixed table, records one pipeline
//! barrier and updates the tracked state. Transitioning into the current
//! state records nothing.
//!
//! [`BarrierBatch`] collects several transitions and records them as a
//! single barrier command.
//!
//! The table is written for the graphics queue. On compute and copy queues
//! the masks are narrowed to what that queue supports; a side left with no
//! supported stage degrades to the top or bottom of the pipe, with the
//! cross-queue ordering carried by the submission's semaphores.
//!
//! # Example
//!
//! ```no_run
//! use ember_rhi::barrier::transition_texture;
//! use ember_rhi::command::CommandBuffer;
//! use ember_rhi::resource::{ResourceState, Texture};
//!
//! fn upload(cmd: &mut CommandBuffer, texture: &Texture) {
//!     transition_texture(cmd, texture, ResourceState::TransferDst);
//!     // ... copy ...
//!     transition_texture(cmd, texture, ResourceState::ShaderReadOnly);
//! }
//! ```

use std::sync::Arc;

use ash::vk;

use crate::command::CommandBuffer;
use crate::resource::{Buffer, BufferState, ResourceState, Texture};
use crate::types::{BufferBarrier, ImageBarrier, PipelineBarrier, QueueType};

/// Where a state is used and which accesses it performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessInfo {
    pub stage: vk::PipelineStageFlags,
    /// Accesses that read the resource.
    pub read: vk::AccessFlags,
    /// Accesses that write the resource and must be made available.
    pub write: vk::AccessFlags,
}

impl AccessInfo {
    const fn new(stage: vk::PipelineStageFlags, read: vk::AccessFlags, write: vk::AccessFlags) -> Self {
        Self { stage, read, write }
    }

    /// Masks for the source half of a barrier: only writes need to be made available.
    pub fn as_source(self) -> (vk::PipelineStageFlags, vk::AccessFlags) {
        (self.stage, self.write)
    }

    /// Masks for the destination half of a barrier.
    pub fn as_destination(self) -> (vk::PipelineStageFlags, vk::AccessFlags) {
        (self.stage, self.read | self.write)
    }

    /// Narrows the masks to what `queue` supports.
    pub fn on_queue(self, queue: QueueType, as_source: bool) -> Self {
        let stage = self.stage & queue.pipeline_stages();
        if stage.is_empty() {
            let edge = if as_source {
                vk::PipelineStageFlags::TOP_OF_PIPE
            } else {
                vk::PipelineStageFlags::BOTTOM_OF_PIPE
            };
            return Self::new(edge, vk::AccessFlags::empty(), vk::AccessFlags::empty());
        }
        let access = queue.access_flags();
        Self::new(stage, self.read & access, self.write & access)
    }
}

const SHADER_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw()
        | vk::PipelineStageFlags::COMPUTE_SHADER.as_raw(),
);

const FRAGMENT_TESTS: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS.as_raw()
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS.as_raw(),
);

/// Access table for texture states.
pub fn texture_access(state: ResourceState, as_source: bool) -> AccessInfo {
    use vk::AccessFlags as A;
    use vk::PipelineStageFlags as S;

    match state {
        ResourceState::Undefined => AccessInfo::new(S::TOP_OF_PIPE, A::empty(), A::empty()),
        ResourceState::General => AccessInfo::new(S::ALL_COMMANDS, A::MEMORY_READ, A::MEMORY_WRITE),
        ResourceState::ColorAttachment => AccessInfo::new(
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_READ,
            A::COLOR_ATTACHMENT_WRITE,
        ),
        ResourceState::DepthStencilAttachment => AccessInfo::new(
            FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ,
            A::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        ResourceState::DepthStencilReadOnly => AccessInfo::new(
            FRAGMENT_TESTS | S::FRAGMENT_SHADER,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::SHADER_READ,
            A::empty(),
        ),
        ResourceState::ShaderReadOnly => AccessInfo::new(
            SHADER_STAGES,
            A::SHADER_READ | A::INPUT_ATTACHMENT_READ,
            A::empty(),
        ),
        ResourceState::TransferSrc => AccessInfo::new(S::TRANSFER, A::TRANSFER_READ, A::empty()),
        ResourceState::TransferDst => AccessInfo::new(S::TRANSFER, A::empty(), A::TRANSFER_WRITE),
        // Leaving present chains onto the acquire semaphore wait stage;
        // entering it only needs prior writes made available.
        ResourceState::Present if as_source => {
            AccessInfo::new(S::COLOR_ATTACHMENT_OUTPUT, A::empty(), A::empty())
        }
        ResourceState::Present => AccessInfo::new(S::BOTTOM_OF_PIPE, A::empty(), A::empty()),
    }
}

/// Access table for buffer states.
pub fn buffer_access(state: BufferState) -> AccessInfo {
    use vk::AccessFlags as A;
    use vk::PipelineStageFlags as S;

    match state {
        BufferState::Undefined => AccessInfo::new(S::TOP_OF_PIPE, A::empty(), A::empty()),
        BufferState::TransferSrc => AccessInfo::new(S::TRANSFER, A::TRANSFER_READ, A::empty()),
        BufferState::TransferDst => AccessInfo::new(S::TRANSFER, A::empty(), A::TRANSFER_WRITE),
        BufferState::VertexBuffer => {
            AccessInfo::new(S::VERTEX_INPUT, A::VERTEX_ATTRIBUTE_READ, A::empty())
        }
        BufferState::IndexBuffer => AccessInfo::new(S::VERTEX_INPUT, A::INDEX_READ, A::empty()),
        BufferState::UniformBuffer => AccessInfo::new(SHADER_STAGES, A::UNIFORM_READ, A::empty()),
        BufferState::ShaderRead => AccessInfo::new(SHADER_STAGES, A::SHADER_READ, A::empty()),
        BufferState::ShaderWrite => {
            AccessInfo::new(SHADER_STAGES, A::SHADER_READ, A::SHADER_WRITE)
        }
        BufferState::IndirectArgument => {
            AccessInfo::new(S::DRAW_INDIRECT, A::INDIRECT_COMMAND_READ, A::empty())
        }
        BufferState::HostRead => AccessInfo::new(S::HOST, A::HOST_READ, A::empty()),
    }
}

fn image_barrier(
    queue: QueueType,
    texture: &Texture,
    old: ResourceState,
    new: ResourceState,
) -> (vk::PipelineStageFlags, vk::PipelineStageFlags, ImageBarrier) {
    let (src_stage, src_access) = texture_access(old, true).on_queue(queue, true).as_source();
    let (dst_stage, dst_access) = texture_access(new, false)
        .on_queue(queue, false)
        .as_destination();
    let desc = texture.desc();
    let barrier = ImageBarrier {
        image: texture.handle(),
        aspect: texture.aspect(),
        old_layout: old.layout(),
        new_layout: new.layout(),
        src_access,
        dst_access,
        mip_levels: desc.mip_levels,
        array_layers: desc.array_layers,
    };
    (src_stage, dst_stage, barrier)
}

fn buffer_barrier(
    queue: QueueType,
    buffer: &Buffer,
    old: BufferState,
    new: BufferState,
) -> (vk::PipelineStageFlags, vk::PipelineStageFlags, BufferBarrier) {
    let (src_stage, src_access) = buffer_access(old).on_queue(queue, true).as_source();
    let (dst_stage, dst_access) = buffer_access(new).on_queue(queue, false).as_destination();
    let barrier = BufferBarrier {
        buffer: buffer.handle(),
        offset: 0,
        size: vk::WHOLE_SIZE,
        src_access,
        dst_access,
    };
    (src_stage, dst_stage, barrier)
}

/// Transitions `texture` into `new_state`, recording one barrier into `cmd`.
///
/// Returns `false` (and records nothing) if the texture is already in
/// `new_state`.
pub fn transition_texture(cmd: &mut CommandBuffer, texture: &Texture, new_state: ResourceState) -> bool {
    let old_state = texture.current_state();
    if old_state == new_state {
        return false;
    }

    let (src_stage, dst_stage, barrier) = image_barrier(cmd.queue(), texture, old_state, new_state);
    cmd.pipeline_barrier(&PipelineBarrier {
        src_stage,
        dst_stage,
        images: vec![barrier],
        buffers: Vec::new(),
    });
    texture.set_state(new_state);
    true
}

/// Buffer counterpart of [`transition_texture`].
pub fn transition_buffer(cmd: &mut CommandBuffer, buffer: &Buffer, new_state: BufferState) -> bool {
    let old_state = buffer.current_state();
    if old_state == new_state {
        return false;
    }

    let (src_stage, dst_stage, barrier) = buffer_barrier(cmd.queue(), buffer, old_state, new_state);
    cmd.pipeline_barrier(&PipelineBarrier {
        src_stage,
        dst_stage,
        images: Vec::new(),
        buffers: vec![barrier],
    });
    buffer.set_state(new_state);
    true
}

/// Accumulates transitions and records them as one barrier command.
///
/// Repeated transitions of the same resource merge into one `(first old,
/// last new)` pair; a resource that ends where it started drops out.
/// Tracked states change only when the batch is flushed.
#[derive(Default)]
pub struct BarrierBatch {
    textures: Vec<(Arc<Texture>, ResourceState, ResourceState)>,
    buffers: Vec<(Arc<Buffer>, BufferState, BufferState)>,
}

impl BarrierBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_texture(&mut self, texture: &Arc<Texture>, new_state: ResourceState) {
        if let Some(index) = self.textures.iter().position(|(t, _, _)| t.id() == texture.id()) {
            let old_state = self.textures[index].1;
            if old_state == new_state {
                self.textures.swap_remove(index);
            } else {
                self.textures[index].2 = new_state;
            }
            return;
        }

        let old_state = texture.current_state();
        if old_state != new_state {
            self.textures.push((Arc::clone(texture), old_state, new_state));
        }
    }

    pub fn add_buffer(&mut self, buffer: &Arc<Buffer>, new_state: BufferState) {
        if let Some(index) = self.buffers.iter().position(|(b, _, _)| b.id() == buffer.id()) {
            let old_state = self.buffers[index].1;
            if old_state == new_state {
                self.buffers.swap_remove(index);
            } else {
                self.buffers[index].2 = new_state;
            }
            return;
        }

        let old_state = buffer.current_state();
        if old_state != new_state {
            self.buffers.push((Arc::clone(buffer), old_state, new_state));
        }
    }

    /// Number of resources with a pending transition.
    pub fn len(&self) -> usize {
        self.textures.len() + self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records all pending transitions as a single barrier and updates the
    /// tracked states. Returns `false` if there was nothing to record.
    pub fn flush(&mut self, cmd: &mut CommandBuffer) -> bool {
        if self.is_empty() {
            return false;
        }

        let queue = cmd.queue();
        let mut barrier = PipelineBarrier::default();
        for (texture, old, new) in self.textures.drain(..) {
            let (src, dst, image) = image_barrier(queue, &texture, old, new);
            barrier.src_stage |= src;
            barrier.dst_stage |= dst;
            barrier.images.push(image);
            texture.set_state(new);
        }
        for (buffer, old, new) in self.buffers.drain(..) {
            let (src, dst, range) = buffer_barrier(queue, &buffer, old, new);
            barrier.src_stage |= src;
            barrier.dst_stage |= dst;
            barrier.buffers.push(range);
            buffer.set_state(new);
        }

        cmd.pipeline_barrier(&barrier);
        true
    }
}

impl Drop for BarrierBatch {
    fn drop(&mut self) {
        if !self.is_empty() {
            tracing::warn!("Barrier batch dropped with {} unflushed transitions", self.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undefined_to_transfer_dst_waits_on_nothing() {
        let (stage, access) = texture_access(ResourceState::Undefined, true).as_source();
        assert_eq!(stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert!(access.is_empty());

        let (stage, access) = texture_access(ResourceState::TransferDst, false).as_destination();
        assert_eq!(stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(access, vk::AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn test_transfer_dst_to_shader_read_waits_for_writes() {
        let (src_stage, src_access) = texture_access(ResourceState::TransferDst, true).as_source();
        let (dst_stage, dst_access) =
            texture_access(ResourceState::ShaderReadOnly, false).as_destination();
        assert_eq!(src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert!(dst_stage.contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
        assert!(dst_access.contains(vk::AccessFlags::SHADER_READ));
    }

    #[test]
    fn test_color_to_present_makes_writes_available() {
        let (src_stage, src_access) = texture_access(ResourceState::ColorAttachment, true).as_source();
        let (dst_stage, dst_access) = texture_access(ResourceState::Present, false).as_destination();
        assert_eq!(src_stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(src_access, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert_eq!(dst_stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        assert!(dst_access.is_empty());
    }

    #[test]
    fn test_read_states_have_no_source_access() {
        for state in [
            ResourceState::ShaderReadOnly,
            ResourceState::TransferSrc,
            ResourceState::DepthStencilReadOnly,
        ] {
            assert!(texture_access(state, true).as_source().1.is_empty(), "{:?}", state);
        }
        for state in [BufferState::VertexBuffer, BufferState::UniformBuffer, BufferState::ShaderRead] {
            assert!(buffer_access(state).as_source().1.is_empty(), "{:?}", state);
        }
    }

    #[test]
    fn test_shader_write_buffer_flushes_writes() {
        let info = buffer_access(BufferState::ShaderWrite);
        assert_eq!(info.as_source().1, vk::AccessFlags::SHADER_WRITE);
        let (stage, access) = buffer_access(BufferState::IndirectArgument).as_destination();
        assert_eq!(stage, vk::PipelineStageFlags::DRAW_INDIRECT);
        assert_eq!(access, vk::AccessFlags::INDIRECT_COMMAND_READ);
    }

    #[test]
    fn test_compute_queue_drops_graphics_stages() {
        let info = texture_access(ResourceState::ShaderReadOnly, false).on_queue(QueueType::Compute, false);
        assert_eq!(info.stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(info.read, vk::AccessFlags::SHADER_READ);

        let info = buffer_access(BufferState::UniformBuffer).on_queue(QueueType::Compute, false);
        assert_eq!(info.stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(info.read, vk::AccessFlags::UNIFORM_READ);
    }

    #[test]
    fn test_graphics_only_state_degrades_to_pipe_edges() {
        let info = texture_access(ResourceState::ColorAttachment, true).on_queue(QueueType::Compute, true);
        assert_eq!(info.stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert!(info.write.is_empty());

        let info = texture_access(ResourceState::ShaderReadOnly, false).on_queue(QueueType::Copy, false);
        assert_eq!(info.stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        assert!(info.read.is_empty());

        let info = texture_access(ResourceState::TransferDst, false).on_queue(QueueType::Copy, false);
        assert_eq!(info.stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(info.write, vk::AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn test_graphics_queue_keeps_the_table() {
        let info = texture_access(ResourceState::DepthStencilReadOnly, false);
        assert_eq!(info.on_queue(QueueType::Graphics, false), info);
    }

    #[test]
    fn test_every_state_maps_to_a_layout() {
        for state in [
            ResourceState::Undefined,
            ResourceState::General,
            ResourceState::ColorAttachment,
            ResourceState::DepthStencilAttachment,
            ResourceState::DepthStencilReadOnly,
            ResourceState::ShaderReadOnly,
            ResourceState::TransferSrc,
            ResourceState::TransferDst,
            ResourceState::Present,
        ] {
            let stage = texture_access(state, false).stage;
            assert!(!stage.is_empty(), "{:?}", state);
        }
    }
}
