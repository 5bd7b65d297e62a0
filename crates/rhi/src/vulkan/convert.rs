//! Translation of backend-neutral descriptions into Vulkan create infos.
//!
//! Builders in `ash` borrow their arrays, so every function here that needs
//! nested arrays first collects them into owned storage and then builds the
//! create info inside a closure that sees that storage.

use ash::vk;

use crate::binding::BindingShape;
use crate::render_pass::{RenderPassLayout, SubpassDependency};
use crate::state::fixed_function::{DepthStencilStateDesc, RasterizationStateDesc};
use crate::state::sampler::SamplerStateDesc;
use crate::types::{BufferBarrier, ImageBarrier, sample_count_flags};

pub(super) fn image_barrier(barrier: &ImageBarrier) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .old_layout(barrier.old_layout)
        .new_layout(barrier.new_layout)
        .src_access_mask(barrier.src_access)
        .dst_access_mask(barrier.dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(barrier.image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(barrier.aspect)
                .base_mip_level(0)
                .level_count(barrier.mip_levels)
                .base_array_layer(0)
                .layer_count(barrier.array_layers),
        )
}

pub(super) fn buffer_barrier(barrier: &BufferBarrier) -> vk::BufferMemoryBarrier<'static> {
    vk::BufferMemoryBarrier::default()
        .src_access_mask(barrier.src_access)
        .dst_access_mask(barrier.dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(barrier.buffer)
        .offset(barrier.offset)
        .size(barrier.size)
}

pub(super) fn subpass_dependency(dependency: &SubpassDependency) -> vk::SubpassDependency {
    vk::SubpassDependency::default()
        .src_subpass(dependency.src.to_vk())
        .dst_subpass(dependency.dst.to_vk())
        .src_stage_mask(dependency.src_stage)
        .dst_stage_mask(dependency.dst_stage)
        .src_access_mask(dependency.src_access)
        .dst_access_mask(dependency.dst_access)
        .dependency_flags(if dependency.by_region {
            vk::DependencyFlags::BY_REGION
        } else {
            vk::DependencyFlags::empty()
        })
}

pub(super) fn attachment_descriptions(layout: &RenderPassLayout) -> Vec<vk::AttachmentDescription> {
    layout
        .attachments
        .iter()
        .map(|a| {
            vk::AttachmentDescription::default()
                .format(a.format)
                .samples(sample_count_flags(a.samples))
                .load_op(a.load_op)
                .store_op(a.store_op)
                .stencil_load_op(a.stencil_load_op)
                .stencil_store_op(a.stencil_store_op)
                .initial_layout(a.initial_layout)
                .final_layout(a.final_layout)
        })
        .collect()
}

/// Attachment references of one subpass, kept alive while the subpass
/// descriptions borrow them.
pub(super) struct SubpassReferences {
    pub inputs: Vec<vk::AttachmentReference>,
    pub colors: Vec<vk::AttachmentReference>,
    pub depth: Option<vk::AttachmentReference>,
    pub resolves: Vec<vk::AttachmentReference>,
}

pub(super) fn subpass_references(layout: &RenderPassLayout) -> Vec<SubpassReferences> {
    let convert = |r: &crate::render_pass::AttachmentReference| {
        vk::AttachmentReference::default()
            .attachment(r.attachment)
            .layout(r.layout)
    };
    layout
        .subpasses
        .iter()
        .map(|subpass| SubpassReferences {
            inputs: subpass.inputs.iter().map(convert).collect(),
            colors: subpass.colors.iter().map(convert).collect(),
            depth: subpass.depth.as_ref().map(convert),
            resolves: subpass.resolves.iter().map(convert).collect(),
        })
        .collect()
}

pub(super) fn subpass_description(refs: &SubpassReferences) -> vk::SubpassDescription<'_> {
    let mut description = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .input_attachments(&refs.inputs)
        .color_attachments(&refs.colors);
    if !refs.resolves.is_empty() {
        description = description.resolve_attachments(&refs.resolves);
    }
    if let Some(depth) = &refs.depth {
        description = description.depth_stencil_attachment(depth);
    }
    description
}

pub(super) fn sampler_info(
    desc: &SamplerStateDesc,
    max_supported_anisotropy: Option<f32>,
) -> vk::SamplerCreateInfo<'static> {
    let anisotropy = desc
        .max_anisotropy
        .zip(max_supported_anisotropy)
        .map(|(requested, limit)| requested.min(limit));

    vk::SamplerCreateInfo::default()
        .mag_filter(desc.mag_filter)
        .min_filter(desc.min_filter)
        .mipmap_mode(desc.mipmap_mode)
        .address_mode_u(desc.address_u)
        .address_mode_v(desc.address_v)
        .address_mode_w(desc.address_w)
        .mip_lod_bias(desc.mip_lod_bias)
        .anisotropy_enable(anisotropy.is_some())
        .max_anisotropy(anisotropy.unwrap_or(1.0))
        .compare_enable(desc.compare_op.is_some())
        .compare_op(desc.compare_op.map_or(vk::CompareOp::ALWAYS, |op| op.to_vk()))
        .min_lod(desc.min_lod)
        .max_lod(desc.max_lod)
        .border_color(desc.border_color)
}

pub(super) fn rasterization_info(
    desc: &RasterizationStateDesc,
) -> vk::PipelineRasterizationStateCreateInfo<'static> {
    let bias = desc.depth_bias;
    vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(desc.depth_clamp)
        .rasterizer_discard_enable(false)
        .polygon_mode(desc.polygon_mode.to_vk())
        .cull_mode(desc.cull_mode.to_vk())
        .front_face(desc.front_face.to_vk())
        .depth_bias_enable(bias.is_some())
        .depth_bias_constant_factor(bias.map_or(0.0, |b| b.constant_factor))
        .depth_bias_clamp(bias.map_or(0.0, |b| b.clamp))
        .depth_bias_slope_factor(bias.map_or(0.0, |b| b.slope_factor))
        .line_width(desc.line_width)
}

pub(super) fn multisample_info(
    desc: &RasterizationStateDesc,
) -> vk::PipelineMultisampleStateCreateInfo<'static> {
    vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(sample_count_flags(desc.sample_count))
        .sample_shading_enable(desc.sample_shading.is_some())
        .min_sample_shading(desc.sample_shading.unwrap_or(0.0))
        .alpha_to_coverage_enable(desc.alpha_to_coverage)
}

pub(super) fn depth_stencil_info(
    desc: &DepthStencilStateDesc,
) -> vk::PipelineDepthStencilStateCreateInfo<'static> {
    let [min_bounds, max_bounds] = desc.depth_bounds.unwrap_or([0.0, 1.0]);
    let mut info = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(desc.depth_test)
        .depth_write_enable(desc.depth_write)
        .depth_compare_op(desc.compare_op.to_vk())
        .depth_bounds_test_enable(desc.depth_bounds.is_some())
        .min_depth_bounds(min_bounds)
        .max_depth_bounds(max_bounds)
        .stencil_test_enable(desc.stencil.is_some());
    if let Some((front, back)) = &desc.stencil {
        info = info.front(front.to_vk()).back(back.to_vk());
    }
    info
}

/// Layout bindings plus the per-binding flags enabling a trailing bindless slot.
pub(super) fn descriptor_set_layout_bindings(
    shapes: &[BindingShape],
) -> (Vec<vk::DescriptorSetLayoutBinding<'static>>, Vec<vk::DescriptorBindingFlags>) {
    let bindings = shapes
        .iter()
        .map(|shape| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(shape.slot)
                .descriptor_type(shape.binding_type.to_vk())
                .descriptor_count(shape.count)
                .stage_flags(shape.stages)
        })
        .collect();
    let flags = shapes
        .iter()
        .map(|shape| {
            if shape.bindless {
                vk::DescriptorBindingFlags::PARTIALLY_BOUND
                    | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
            } else {
                vk::DescriptorBindingFlags::empty()
            }
        })
        .collect();
    (bindings, flags)
}

pub(super) fn is_pool_exhaustion(result: vk::Result) -> bool {
    matches!(
        result,
        vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BindingType;
    use crate::render_pass::{AttachmentReference, SubpassLayout, SubpassRef};

    #[test]
    fn test_sampler_anisotropy_clamped_to_device_limit() {
        let desc = SamplerStateDesc::linear_repeat().with_anisotropy(16.0);
        let info = sampler_info(&desc, Some(8.0));
        assert_eq!(info.anisotropy_enable, vk::TRUE);
        assert_eq!(info.max_anisotropy, 8.0);

        let unsupported = sampler_info(&desc, None);
        assert_eq!(unsupported.anisotropy_enable, vk::FALSE);
    }

    #[test]
    fn test_shadow_sampler_enables_compare() {
        let info = sampler_info(&SamplerStateDesc::shadow(), None);
        assert_eq!(info.compare_enable, vk::TRUE);
        assert_eq!(info.compare_op, vk::CompareOp::LESS_OR_EQUAL);
    }

    #[test]
    fn test_bindless_slot_gets_variable_count_flag() {
        let shapes = [
            BindingShape {
                slot: 0,
                binding_type: BindingType::UniformBuffer,
                stages: vk::ShaderStageFlags::VERTEX,
                count: 1,
                bindless: false,
            },
            BindingShape {
                slot: 1,
                binding_type: BindingType::SampledTexture,
                stages: vk::ShaderStageFlags::FRAGMENT,
                count: 1024,
                bindless: true,
            },
        ];
        let (bindings, flags) = descriptor_set_layout_bindings(&shapes);
        assert_eq!(bindings[1].descriptor_count, 1024);
        assert!(flags[0].is_empty());
        assert!(flags[1].contains(vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT));
    }

    #[test]
    fn test_subpass_without_depth_or_resolve() {
        let layout = RenderPassLayout {
            attachments: Vec::new(),
            subpasses: vec![SubpassLayout {
                inputs: Vec::new(),
                colors: vec![AttachmentReference {
                    attachment: 0,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                }],
                depth: None,
                resolves: Vec::new(),
            }],
            dependencies: Vec::new(),
        };
        let refs = subpass_references(&layout);
        let description = subpass_description(&refs[0]);
        assert_eq!(description.color_attachment_count, 1);
        assert!(description.p_depth_stencil_attachment.is_null());
        assert!(description.p_resolve_attachments.is_null());
    }

    #[test]
    fn test_external_dependency_maps_to_subpass_external() {
        let dependency = SubpassDependency {
            src: SubpassRef::External,
            dst: SubpassRef::Index(0),
            src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            by_region: true,
        };
        let vk_dependency = subpass_dependency(&dependency);
        assert_eq!(vk_dependency.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(vk_dependency.dependency_flags, vk::DependencyFlags::BY_REGION);
    }
}
