//! Shader binding layouts and instances.
//!
//! A [`ShaderBindingLayout`] is the immutable shape of a binding table: for
//! each slot its [`BindingType`], visible stages, descriptor count and whether
//! it is a bindless (variable-count) array. Layouts are hashed on shape alone
//! and cached by the [`ResourcePoolRegistry`](crate::registry::ResourcePoolRegistry).
//!
//! A [`ShaderBindingInstance`] is a layout realized with concrete resources.
//! It lives in one of two descriptor pools:
//!
//! - single-frame: allocated from the current frame's pool, reclaimed when the
//!   slot's pool is reset, never freed explicitly
//! - multi-frame: allocated from the shared pool, freed through the deferred
//!   deletion queue when dropped or [`free`](ShaderBindingInstance::free)d
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use ember_rhi::binding::{ShaderBinding, ShaderBindingArray};
//! use ember_rhi::resource::{Buffer, Texture};
//! use ember_rhi::state::sampler::SamplerState;
//!
//! # fn example(ubo: Arc<Buffer>, albedo: Arc<Texture>, sampler: Arc<SamplerState>) {
//! let bindings = ShaderBindingArray::new()
//!     .with(ShaderBinding::uniform_buffer(0, vk::ShaderStageFlags::VERTEX, &ubo))
//!     .with(ShaderBinding::texture(1, vk::ShaderStageFlags::FRAGMENT, &albedo, Some(&sampler)));
//! assert_eq!(bindings.len(), 2);
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::descriptor::{MultiFrameDescriptorPool, PoolEpoch, SingleFrameDescriptorPool};
use crate::device::GpuDevice;
use crate::error::{RhiError, RhiResult};
use crate::frame::FrameContext;
use crate::resource::{Buffer, Texture};
use crate::state::description_hash;
use crate::state::sampler::SamplerState;
use crate::types::{
    DescriptorBufferRange, DescriptorImage, DescriptorWrite, DescriptorWriteData, is_depth_format,
};

/// Kind of resource a binding slot accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingType {
    UniformBuffer,
    UniformBufferDynamic,
    StorageBuffer,
    /// Sampled image without a sampler.
    SampledTexture,
    /// Sampled image with its sampler.
    TextureSampler,
    StorageTexture,
    Sampler,
    InputAttachment,
    AccelerationStructure,
}

impl BindingType {
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            BindingType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            BindingType::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            BindingType::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            BindingType::SampledTexture => vk::DescriptorType::SAMPLED_IMAGE,
            BindingType::TextureSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            BindingType::StorageTexture => vk::DescriptorType::STORAGE_IMAGE,
            BindingType::Sampler => vk::DescriptorType::SAMPLER,
            BindingType::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
            BindingType::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        }
    }

    fn is_buffer(self) -> bool {
        matches!(
            self,
            BindingType::UniformBuffer
                | BindingType::UniformBufferDynamic
                | BindingType::StorageBuffer
        )
    }
}

/// Shape of one binding slot, without resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindingShape {
    pub slot: u32,
    pub binding_type: BindingType,
    pub stages: vk::ShaderStageFlags,
    /// Descriptor count; the upper bound for bindless slots.
    pub count: u32,
    pub bindless: bool,
}

/// One concrete resource bound to a slot.
#[derive(Clone, Debug)]
pub enum BindingResource {
    Buffer {
        buffer: Arc<Buffer>,
        offset: u64,
        range: u64,
    },
    Texture {
        texture: Arc<Texture>,
        sampler: Option<Arc<SamplerState>>,
    },
    Sampler(Arc<SamplerState>),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

impl BindingResource {
    fn accepted_by(&self, binding_type: BindingType) -> bool {
        match self {
            BindingResource::Buffer { .. } => binding_type.is_buffer(),
            BindingResource::Texture { sampler, .. } => match binding_type {
                BindingType::TextureSampler => sampler.is_some(),
                BindingType::SampledTexture
                | BindingType::StorageTexture
                | BindingType::InputAttachment => true,
                _ => false,
            },
            BindingResource::Sampler(_) => binding_type == BindingType::Sampler,
            BindingResource::AccelerationStructure(_) => {
                binding_type == BindingType::AccelerationStructure
            }
        }
    }
}

/// A binding slot together with the resources bound to it.
#[derive(Clone, Debug)]
pub struct ShaderBinding {
    pub shape: BindingShape,
    pub resources: Vec<BindingResource>,
}

impl ShaderBinding {
    fn single(
        slot: u32,
        binding_type: BindingType,
        stages: vk::ShaderStageFlags,
        resource: BindingResource,
    ) -> Self {
        Self {
            shape: BindingShape {
                slot,
                binding_type,
                stages,
                count: 1,
                bindless: false,
            },
            resources: vec![resource],
        }
    }

    /// Whole-buffer uniform binding.
    pub fn uniform_buffer(slot: u32, stages: vk::ShaderStageFlags, buffer: &Arc<Buffer>) -> Self {
        Self::buffer_range(slot, BindingType::UniformBuffer, stages, buffer, 0, buffer.size())
    }

    /// Uniform binding whose offset is supplied at bind time, `range` bytes wide.
    pub fn dynamic_uniform_buffer(
        slot: u32,
        stages: vk::ShaderStageFlags,
        buffer: &Arc<Buffer>,
        range: u64,
    ) -> Self {
        Self::buffer_range(slot, BindingType::UniformBufferDynamic, stages, buffer, 0, range)
    }

    pub fn storage_buffer(slot: u32, stages: vk::ShaderStageFlags, buffer: &Arc<Buffer>) -> Self {
        Self::buffer_range(slot, BindingType::StorageBuffer, stages, buffer, 0, buffer.size())
    }

    pub fn buffer_range(
        slot: u32,
        binding_type: BindingType,
        stages: vk::ShaderStageFlags,
        buffer: &Arc<Buffer>,
        offset: u64,
        range: u64,
    ) -> Self {
        Self::single(
            slot,
            binding_type,
            stages,
            BindingResource::Buffer {
                buffer: Arc::clone(buffer),
                offset,
                range,
            },
        )
    }

    /// Sampled texture; combined with `sampler` when one is given.
    pub fn texture(
        slot: u32,
        stages: vk::ShaderStageFlags,
        texture: &Arc<Texture>,
        sampler: Option<&Arc<SamplerState>>,
    ) -> Self {
        let binding_type = if sampler.is_some() {
            BindingType::TextureSampler
        } else {
            BindingType::SampledTexture
        };
        Self::single(
            slot,
            binding_type,
            stages,
            BindingResource::Texture {
                texture: Arc::clone(texture),
                sampler: sampler.cloned(),
            },
        )
    }

    pub fn storage_texture(slot: u32, stages: vk::ShaderStageFlags, texture: &Arc<Texture>) -> Self {
        Self::single(
            slot,
            BindingType::StorageTexture,
            stages,
            BindingResource::Texture {
                texture: Arc::clone(texture),
                sampler: None,
            },
        )
    }

    pub fn sampler(slot: u32, stages: vk::ShaderStageFlags, sampler: &Arc<SamplerState>) -> Self {
        Self::single(
            slot,
            BindingType::Sampler,
            stages,
            BindingResource::Sampler(Arc::clone(sampler)),
        )
    }

    /// Subpass input read by the fragment stage.
    pub fn input_attachment(slot: u32, texture: &Arc<Texture>) -> Self {
        Self::single(
            slot,
            BindingType::InputAttachment,
            vk::ShaderStageFlags::FRAGMENT,
            BindingResource::Texture {
                texture: Arc::clone(texture),
                sampler: None,
            },
        )
    }

    pub fn acceleration_structure(
        slot: u32,
        stages: vk::ShaderStageFlags,
        handle: vk::AccelerationStructureKHR,
    ) -> Self {
        Self::single(
            slot,
            BindingType::AccelerationStructure,
            stages,
            BindingResource::AccelerationStructure(handle),
        )
    }

    /// Variable-count array of up to `max_count` resources of one type.
    pub fn bindless(
        slot: u32,
        binding_type: BindingType,
        stages: vk::ShaderStageFlags,
        max_count: u32,
        resources: Vec<BindingResource>,
    ) -> Self {
        Self {
            shape: BindingShape {
                slot,
                binding_type,
                stages,
                count: max_count,
                bindless: true,
            },
            resources,
        }
    }

    /// A slot with no resources, for declaring layouts up front.
    pub fn shape_only(
        slot: u32,
        binding_type: BindingType,
        stages: vk::ShaderStageFlags,
        count: u32,
    ) -> Self {
        Self {
            shape: BindingShape {
                slot,
                binding_type,
                stages,
                count,
                bindless: false,
            },
            resources: Vec::new(),
        }
    }
}

/// Ordered list of bindings making up one binding table.
#[derive(Clone, Debug, Default)]
pub struct ShaderBindingArray {
    bindings: Vec<ShaderBinding>,
}

impl ShaderBindingArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, binding: ShaderBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn push(&mut self, binding: ShaderBinding) {
        self.bindings.push(binding);
    }

    /// The resource-free shape of every binding.
    pub fn shapes(&self) -> Vec<BindingShape> {
        self.bindings.iter().map(|b| b.shape).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShaderBinding> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl From<Vec<ShaderBinding>> for ShaderBindingArray {
    fn from(bindings: Vec<ShaderBinding>) -> Self {
        Self { bindings }
    }
}

/// Immutable, cacheable binding table layout.
pub struct ShaderBindingLayout {
    device: Arc<dyn GpuDevice>,
    shapes: Vec<BindingShape>,
    hash: u64,
    handle: vk::DescriptorSetLayout,
}

impl ShaderBindingLayout {
    /// Hash of the shape of `bindings`; concrete resources are ignored.
    pub fn shape_hash(bindings: &ShaderBindingArray) -> u64 {
        description_hash(&bindings.shapes())
    }

    /// Builds the native layout for the shape of `bindings`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::BindingMismatch`] if a slot repeats or a bindless
    /// slot is not the last one, or the native error if creation fails.
    pub fn initialize(device: Arc<dyn GpuDevice>, bindings: &ShaderBindingArray) -> RhiResult<Self> {
        let shapes = bindings.shapes();
        validate_shapes(&shapes)?;
        let hash = description_hash(&shapes);
        let handle = device.create_descriptor_set_layout(&shapes)?;
        debug!(
            "Created shader binding layout {:016x} with {} binding(s)",
            hash,
            shapes.len()
        );
        Ok(Self {
            device,
            shapes,
            hash,
            handle,
        })
    }

    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    pub fn shapes(&self) -> &[BindingShape] {
        &self.shapes
    }

    fn bindless_shape(&self) -> Option<&BindingShape> {
        self.shapes.last().filter(|shape| shape.bindless)
    }
}

impl Drop for ShaderBindingLayout {
    fn drop(&mut self) {
        self.device.destroy_descriptor_set_layout(self.handle);
    }
}

impl std::fmt::Debug for ShaderBindingLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderBindingLayout")
            .field("hash", &format_args!("{:016x}", self.hash))
            .field("shapes", &self.shapes)
            .finish()
    }
}

fn validate_shapes(shapes: &[BindingShape]) -> RhiResult<()> {
    for (index, shape) in shapes.iter().enumerate() {
        if shapes[..index].iter().any(|other| other.slot == shape.slot) {
            return Err(RhiError::BindingMismatch(format!(
                "slot {} declared twice",
                shape.slot
            )));
        }
        if shape.bindless && index + 1 != shapes.len() {
            return Err(RhiError::BindingMismatch(format!(
                "bindless slot {} must be the last binding",
                shape.slot
            )));
        }
        if shape.count == 0 {
            return Err(RhiError::BindingMismatch(format!(
                "slot {} has a descriptor count of zero",
                shape.slot
            )));
        }
    }
    Ok(())
}

/// Where a binding instance is allocated.
pub enum AllocationScope<'a> {
    /// The frame's single-frame pool; valid for that frame only.
    Frame(&'a FrameContext),
    /// The shared multi-frame pool.
    Persistent,
}

/// Lifetime class of a [`ShaderBindingInstance`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceLifetime {
    SingleFrame,
    MultiFrame,
}

enum Storage {
    SingleFrame(PoolEpoch),
    MultiFrame(Arc<MultiFrameDescriptorPool>),
}

/// A binding table filled with concrete resources.
pub struct ShaderBindingInstance {
    device: Arc<dyn GpuDevice>,
    layout: Arc<ShaderBindingLayout>,
    set: vk::DescriptorSet,
    storage: Storage,
    /// Keeps bound resources alive as long as the set may be used.
    bindings: ShaderBindingArray,
}

impl ShaderBindingInstance {
    /// Allocates from a frame's pool and writes `bindings`.
    pub fn allocate_single_frame(
        device: Arc<dyn GpuDevice>,
        pool: &SingleFrameDescriptorPool,
        layout: &Arc<ShaderBindingLayout>,
        bindings: &ShaderBindingArray,
    ) -> RhiResult<Self> {
        validate_bindings(layout, bindings)?;
        let (set, epoch) = pool.allocate(layout.handle(), variable_count(layout, bindings))?;
        let mut instance = Self {
            device,
            layout: Arc::clone(layout),
            set,
            storage: Storage::SingleFrame(epoch),
            bindings: ShaderBindingArray::new(),
        };
        instance.update_shader_bindings(bindings)?;
        Ok(instance)
    }

    /// Allocates from the shared pool and writes `bindings`.
    pub fn allocate_multi_frame(
        device: Arc<dyn GpuDevice>,
        pool: &Arc<MultiFrameDescriptorPool>,
        layout: &Arc<ShaderBindingLayout>,
        bindings: &ShaderBindingArray,
    ) -> RhiResult<Self> {
        validate_bindings(layout, bindings)?;
        let set = pool.allocate(layout.handle(), variable_count(layout, bindings))?;
        let mut instance = Self {
            device,
            layout: Arc::clone(layout),
            set,
            storage: Storage::MultiFrame(Arc::clone(pool)),
            bindings: ShaderBindingArray::new(),
        };
        instance.update_shader_bindings(bindings)?;
        Ok(instance)
    }

    /// Rewrites every binding with the resources in `bindings`, in one
    /// native update.
    ///
    /// Sampled textures must already be in a shader-readable state.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::BindingMismatch`] if `bindings` does not match the
    /// layout in count, slot, type or descriptor count.
    pub fn update_shader_bindings(&mut self, bindings: &ShaderBindingArray) -> RhiResult<()> {
        validate_bindings(&self.layout, bindings)?;

        let writes: Vec<DescriptorWrite> = bindings
            .iter()
            .filter(|binding| !binding.resources.is_empty())
            .map(descriptor_write)
            .collect();
        self.device.update_descriptor_set(self.set, &writes);
        self.bindings = bindings.clone();
        Ok(())
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorSet {
        self.set
    }

    pub fn layout(&self) -> &Arc<ShaderBindingLayout> {
        &self.layout
    }

    pub fn bindings(&self) -> &ShaderBindingArray {
        &self.bindings
    }

    pub fn lifetime(&self) -> InstanceLifetime {
        match self.storage {
            Storage::SingleFrame(_) => InstanceLifetime::SingleFrame,
            Storage::MultiFrame(_) => InstanceLifetime::MultiFrame,
        }
    }

    /// A single-frame instance whose pool has since been reset.
    pub fn is_stale(&self) -> bool {
        match &self.storage {
            Storage::SingleFrame(epoch) => !epoch.is_current(),
            Storage::MultiFrame(_) => false,
        }
    }

    /// Releases the instance. Single-frame sets go back with their pool's
    /// next reset; multi-frame sets are freed once in-flight frames complete.
    pub fn free(self) {}
}

impl Drop for ShaderBindingInstance {
    fn drop(&mut self) {
        if let Storage::MultiFrame(pool) = &self.storage {
            pool.free_deferred(self.set);
        }
    }
}

impl std::fmt::Debug for ShaderBindingInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderBindingInstance")
            .field("set", &self.set)
            .field("layout", &format_args!("{:016x}", self.layout.hash()))
            .field("lifetime", &self.lifetime())
            .finish()
    }
}

fn variable_count(layout: &ShaderBindingLayout, bindings: &ShaderBindingArray) -> Option<u32> {
    let shape = layout.bindless_shape()?;
    let bound = bindings
        .iter()
        .find(|binding| binding.shape.slot == shape.slot)
        .map_or(0, |binding| binding.resources.len() as u32);
    Some(bound.max(1))
}

fn validate_bindings(layout: &ShaderBindingLayout, bindings: &ShaderBindingArray) -> RhiResult<()> {
    if bindings.len() != layout.shapes().len() {
        return Err(RhiError::BindingMismatch(format!(
            "layout {:016x} has {} bindings, got {}",
            layout.hash(),
            layout.shapes().len(),
            bindings.len()
        )));
    }

    for (expected, binding) in layout.shapes().iter().zip(bindings.iter()) {
        let actual = &binding.shape;
        if actual.slot != expected.slot || actual.binding_type != expected.binding_type {
            return Err(RhiError::BindingMismatch(format!(
                "slot {} expects {:?}, got slot {} {:?}",
                expected.slot, expected.binding_type, actual.slot, actual.binding_type
            )));
        }

        let count = binding.resources.len() as u32;
        let count_ok = if expected.bindless {
            count <= expected.count
        } else {
            count == expected.count
        };
        if !count_ok {
            return Err(RhiError::BindingMismatch(format!(
                "slot {} expects {} descriptor(s), got {}",
                expected.slot, expected.count, count
            )));
        }

        if let Some(bad) = binding
            .resources
            .iter()
            .find(|resource| !resource.accepted_by(expected.binding_type))
        {
            return Err(RhiError::BindingMismatch(format!(
                "slot {} of type {:?} cannot hold {:?}",
                expected.slot, expected.binding_type, bad
            )));
        }
    }
    Ok(())
}

fn read_layout(texture: &Texture) -> vk::ImageLayout {
    if is_depth_format(texture.format()) {
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
    } else {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    }
}

fn descriptor_write(binding: &ShaderBinding) -> DescriptorWrite {
    let binding_type = binding.shape.binding_type;
    let data = match binding_type {
        BindingType::UniformBuffer
        | BindingType::UniformBufferDynamic
        | BindingType::StorageBuffer => DescriptorWriteData::Buffers(
            binding
                .resources
                .iter()
                .filter_map(|resource| match resource {
                    BindingResource::Buffer {
                        buffer,
                        offset,
                        range,
                    } => Some(DescriptorBufferRange {
                        buffer: buffer.handle(),
                        offset: *offset,
                        range: *range,
                    }),
                    _ => None,
                })
                .collect(),
        ),
        BindingType::AccelerationStructure => DescriptorWriteData::AccelerationStructures(
            binding
                .resources
                .iter()
                .filter_map(|resource| match resource {
                    BindingResource::AccelerationStructure(handle) => Some(*handle),
                    _ => None,
                })
                .collect(),
        ),
        _ => DescriptorWriteData::Images(
            binding
                .resources
                .iter()
                .filter_map(|resource| image_descriptor(binding_type, resource))
                .collect(),
        ),
    };

    DescriptorWrite {
        binding: binding.shape.slot,
        descriptor_type: binding_type.to_vk(),
        data,
    }
}

fn image_descriptor(binding_type: BindingType, resource: &BindingResource) -> Option<DescriptorImage> {
    match resource {
        BindingResource::Texture { texture, sampler } => {
            let layout = match binding_type {
                BindingType::StorageTexture => vk::ImageLayout::GENERAL,
                BindingType::SampledTexture | BindingType::TextureSampler => {
                    debug_assert!(
                        texture.current_state().is_shader_readable(),
                        "texture '{}' bound for sampling in state {:?}",
                        texture.name(),
                        texture.current_state()
                    );
                    read_layout(texture)
                }
                _ => read_layout(texture),
            };
            Some(DescriptorImage {
                sampler: sampler
                    .as_ref()
                    .map_or(vk::Sampler::null(), |sampler| sampler.handle()),
                view: texture.view(),
                layout,
            })
        }
        BindingResource::Sampler(sampler) => Some(DescriptorImage {
            sampler: sampler.handle(),
            view: vk::ImageView::null(),
            layout: vk::ImageLayout::UNDEFINED,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(slot: u32, binding_type: BindingType) -> ShaderBinding {
        ShaderBinding::shape_only(slot, binding_type, vk::ShaderStageFlags::ALL_GRAPHICS, 1)
    }

    #[test]
    fn test_binding_type_to_vk() {
        assert_eq!(
            BindingType::TextureSampler.to_vk(),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(
            BindingType::UniformBufferDynamic.to_vk(),
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        );
        assert_eq!(
            BindingType::AccelerationStructure.to_vk(),
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
        );
    }

    #[test]
    fn test_shape_hash_ignores_resources() {
        let declared = ShaderBindingArray::new().with(shape(0, BindingType::UniformBuffer));
        let same = ShaderBindingArray::new().with(shape(0, BindingType::UniformBuffer));
        let other = ShaderBindingArray::new().with(shape(0, BindingType::StorageBuffer));
        assert_eq!(
            ShaderBindingLayout::shape_hash(&declared),
            ShaderBindingLayout::shape_hash(&same)
        );
        assert_ne!(
            ShaderBindingLayout::shape_hash(&declared),
            ShaderBindingLayout::shape_hash(&other)
        );
    }

    #[test]
    fn test_duplicate_slot_rejected() {
        let shapes = [
            shape(0, BindingType::UniformBuffer).shape,
            shape(0, BindingType::Sampler).shape,
        ];
        assert!(matches!(
            validate_shapes(&shapes),
            Err(RhiError::BindingMismatch(_))
        ));
    }

    #[test]
    fn test_bindless_must_be_last() {
        let bindless = ShaderBinding::bindless(
            0,
            BindingType::SampledTexture,
            vk::ShaderStageFlags::FRAGMENT,
            128,
            Vec::new(),
        );
        let shapes = [bindless.shape, shape(1, BindingType::Sampler).shape];
        assert!(validate_shapes(&shapes).is_err());

        let shapes = [shape(1, BindingType::Sampler).shape, bindless.shape];
        assert!(validate_shapes(&shapes).is_ok());
    }

    #[test]
    fn test_resource_type_acceptance() {
        let as_resource = BindingResource::AccelerationStructure(vk::AccelerationStructureKHR::null());
        assert!(as_resource.accepted_by(BindingType::AccelerationStructure));
        assert!(!as_resource.accepted_by(BindingType::UniformBuffer));
    }
}
