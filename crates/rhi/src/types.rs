//! Plain data exchanged between the RHI core and a [`GpuDevice`](crate::device::GpuDevice) backend.
//!
//! Everything here is backend-neutral: handles are `ash::vk` handles (which a
//! simulated backend can mint with [`vk::Handle::from_raw`]) and descriptions
//! are owned values so they can be logged, hashed and compared in tests.

use ash::vk;

/// Hardware queue a command buffer is recorded for and submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueType {
    Graphics,
    Compute,
    Copy,
}

impl QueueType {
    /// All queue types, in index order.
    pub const ALL: [QueueType; 3] = [QueueType::Graphics, QueueType::Compute, QueueType::Copy];

    /// Dense index for per-queue arrays.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            QueueType::Graphics => 0,
            QueueType::Compute => 1,
            QueueType::Copy => 2,
        }
    }

    /// Pipeline stages a barrier recorded on this queue may name.
    pub fn pipeline_stages(self) -> vk::PipelineStageFlags {
        use vk::PipelineStageFlags as S;

        let common = S::TOP_OF_PIPE | S::BOTTOM_OF_PIPE | S::TRANSFER | S::HOST | S::ALL_COMMANDS;
        match self {
            QueueType::Graphics => S::from_raw(!0),
            QueueType::Compute => common | S::COMPUTE_SHADER | S::DRAW_INDIRECT,
            QueueType::Copy => common,
        }
    }

    /// Access types a barrier recorded on this queue may name.
    pub fn access_flags(self) -> vk::AccessFlags {
        use vk::AccessFlags as A;

        let common = A::TRANSFER_READ
            | A::TRANSFER_WRITE
            | A::HOST_READ
            | A::HOST_WRITE
            | A::MEMORY_READ
            | A::MEMORY_WRITE;
        match self {
            QueueType::Graphics => A::from_raw(!0),
            QueueType::Compute => {
                common | A::SHADER_READ | A::SHADER_WRITE | A::UNIFORM_READ | A::INDIRECT_COMMAND_READ
            }
            QueueType::Copy => common,
        }
    }
}

/// Semaphore flavor requested at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreKind {
    /// Single signal/wait pairing.
    Binary,
    /// Monotonic 64-bit counter starting at `initial_value`.
    Timeline { initial_value: u64 },
}

/// A semaphore a submission waits on before `stage` may execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags,
    /// Target value for timeline semaphores, ignored for binary ones.
    pub value: u64,
}

impl SemaphoreWait {
    pub fn binary(semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) -> Self {
        Self {
            semaphore,
            stage,
            value: 0,
        }
    }
}

/// A semaphore a submission signals on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreSignal {
    pub semaphore: vk::Semaphore,
    /// Value written for timeline semaphores, ignored for binary ones.
    pub value: u64,
}

impl SemaphoreSignal {
    pub fn binary(semaphore: vk::Semaphore) -> Self {
        Self {
            semaphore,
            value: 0,
        }
    }
}

/// One queue submission.
#[derive(Debug, Clone, Copy)]
pub struct SubmitInfo<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub waits: &'a [SemaphoreWait],
    pub signals: &'a [SemaphoreSignal],
    /// Signaled when every command buffer completes. May be null.
    pub fence: vk::Fence,
}

/// Properties of the device the RHI adapts to.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub device_name: String,
    /// Nanoseconds per timestamp tick.
    pub timestamp_period: f32,
    /// Whether a query range can be read back in one call.
    pub whole_query_readback: bool,
    pub timeline_semaphores: bool,
    pub acceleration_structures: bool,
    pub min_uniform_buffer_offset_alignment: u64,
    pub max_bound_descriptor_sets: u32,
    pub framebuffer_sample_counts: vk::SampleCountFlags,
}

/// Result of asking the presentation engine for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// `signal` will be signaled once the image at `image_index` is ready.
    Acquired { image_index: u32, suboptimal: bool },
    /// The swapchain must be rebuilt before anything else can be acquired.
    OutOfDate,
}

/// Result of queueing an image for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// Native image and its default view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeTexture {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

/// Native buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeBuffer {
    pub buffer: vk::Buffer,
    pub size: u64,
}

/// Current swapchain shape and its images.
#[derive(Debug, Clone)]
pub struct SwapchainInfo {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub images: Vec<NativeTexture>,
}

/// Creation parameters for a 2D texture.
#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub name: String,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub array_layers: u32,
    /// Samples per pixel, 1 for single-sampled.
    pub samples: u32,
    pub usage: vk::ImageUsageFlags,
}

impl TextureDesc {
    /// A single-mip, single-layer render target.
    pub fn render_target(
        name: impl Into<String>,
        extent: vk::Extent2D,
        format: vk::Format,
        samples: u32,
    ) -> Self {
        let usage = if is_depth_format(format) {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::INPUT_ATTACHMENT
        };
        Self {
            name: name.into(),
            extent,
            format,
            mip_levels: 1,
            array_layers: 1,
            samples,
            usage: usage | vk::ImageUsageFlags::SAMPLED,
        }
    }

    /// A sampled texture that receives its contents through a copy.
    pub fn sampled(name: impl Into<String>, extent: vk::Extent2D, format: vk::Format) -> Self {
        Self {
            name: name.into(),
            extent,
            format,
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        }
    }

    /// Sample count as a Vulkan flag.
    pub fn sample_flags(&self) -> vk::SampleCountFlags {
        sample_count_flags(self.samples)
    }
}

/// Creation parameters for a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub name: String,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    /// Host-visible, persistently mapped memory instead of device-local.
    pub host_visible: bool,
}

/// Image memory barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
}

/// Buffer memory barrier over `offset..offset + size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

/// One `vkCmdPipelineBarrier` worth of barriers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineBarrier {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub images: Vec<ImageBarrier>,
    pub buffers: Vec<BufferBarrier>,
}

impl PipelineBarrier {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.buffers.is_empty()
    }
}

/// Clear value for one attachment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub const BLACK: ClearValue = ClearValue::Color([0.0, 0.0, 0.0, 1.0]);
    pub const DEPTH_ONE: ClearValue = ClearValue::DepthStencil {
        depth: 1.0,
        stencil: 0,
    };

    pub(crate) fn bits(&self) -> [u32; 4] {
        match *self {
            ClearValue::Color(c) => c.map(f32::to_bits),
            ClearValue::DepthStencil { depth, stencil } => [depth.to_bits(), stencil, 0, u32::MAX],
        }
    }

    pub fn to_vk(self) -> vk::ClearValue {
        match self {
            ClearValue::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

impl std::hash::Hash for ClearValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.bits().hash(state);
    }
}

/// Parameters for `cmd_begin_render_pass`.
#[derive(Debug, Clone)]
pub struct RenderPassBegin {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub area: vk::Rect2D,
    pub clear_values: Vec<ClearValue>,
}

/// Pool sizing for descriptor pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorPoolDesc {
    pub max_sets: u32,
    pub sizes: Vec<(vk::DescriptorType, u32)>,
    /// Allows returning individual sets (multi-frame pools).
    pub free_individual_sets: bool,
}

impl DescriptorPoolDesc {
    /// Sizes a pool for `max_sets` typical material/pass sets.
    pub fn for_sets(max_sets: u32, free_individual_sets: bool) -> Self {
        let sizes = vec![
            (vk::DescriptorType::UNIFORM_BUFFER, max_sets * 4),
            (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, max_sets),
            (vk::DescriptorType::STORAGE_BUFFER, max_sets * 2),
            (vk::DescriptorType::SAMPLED_IMAGE, max_sets * 4),
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, max_sets * 4),
            (vk::DescriptorType::STORAGE_IMAGE, max_sets),
            (vk::DescriptorType::SAMPLER, max_sets * 2),
            (vk::DescriptorType::INPUT_ATTACHMENT, max_sets),
        ];
        Self {
            max_sets,
            sizes,
            free_individual_sets,
        }
    }
}

/// Buffer range written into a buffer descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBufferRange {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub range: u64,
}

/// Image view (and optional sampler) written into an image or sampler descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorImage {
    pub sampler: vk::Sampler,
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
}

/// Payload of one descriptor write.
#[derive(Debug, Clone, PartialEq)]
pub enum DescriptorWriteData {
    Buffers(Vec<DescriptorBufferRange>),
    Images(Vec<DescriptorImage>),
    AccelerationStructures(Vec<vk::AccelerationStructureKHR>),
}

impl DescriptorWriteData {
    pub fn len(&self) -> usize {
        match self {
            DescriptorWriteData::Buffers(v) => v.len(),
            DescriptorWriteData::Images(v) => v.len(),
            DescriptorWriteData::AccelerationStructures(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writes `data` into `binding` of a descriptor set starting at array element 0.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub data: DescriptorWriteData,
}

/// Whether `format` carries a depth aspect.
pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Whether `format` carries a stencil aspect.
pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Aspect mask covering every aspect of `format`.
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match (is_depth_format(format), has_stencil(format)) {
        (true, true) => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        (true, false) => vk::ImageAspectFlags::DEPTH,
        (false, true) => vk::ImageAspectFlags::STENCIL,
        (false, false) => vk::ImageAspectFlags::COLOR,
    }
}

/// Converts a sample count to its flag, clamping unsupported counts to 1.
pub fn sample_count_flags(samples: u32) -> vk::SampleCountFlags {
    match samples {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        32 => vk::SampleCountFlags::TYPE_32,
        64 => vk::SampleCountFlags::TYPE_64,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_indices_are_dense() {
        for (i, queue) in QueueType::ALL.iter().enumerate() {
            assert_eq!(queue.index(), i);
        }
    }

    #[test]
    fn test_depth_aspects() {
        assert_eq!(aspect_mask(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_mask(vk::Format::B8G8R8A8_SRGB), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn test_render_target_usage_follows_format() {
        let extent = vk::Extent2D {
            width: 4,
            height: 4,
        };
        let depth = TextureDesc::render_target("depth", extent, vk::Format::D32_SFLOAT, 1);
        assert!(depth.usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));
        assert!(!depth.usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));

        let color = TextureDesc::render_target("color", extent, vk::Format::R8G8B8A8_UNORM, 4);
        assert!(color.usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
        assert_eq!(color.sample_flags(), vk::SampleCountFlags::TYPE_4);
    }

    #[test]
    fn test_sample_count_flags_clamps_unknown() {
        assert_eq!(sample_count_flags(3), vk::SampleCountFlags::TYPE_1);
        assert_eq!(sample_count_flags(8), vk::SampleCountFlags::TYPE_8);
    }

    #[test]
    fn test_clear_value_hash_distinguishes_values() {
        assert_ne!(ClearValue::BLACK.bits(), ClearValue::Color([1.0, 0.0, 0.0, 1.0]).bits());
        assert_ne!(ClearValue::BLACK.bits(), ClearValue::DEPTH_ONE.bits());
    }
}
