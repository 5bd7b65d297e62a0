//! Graphics and compute pipeline states.
//!
//! A pipeline description refers to its shaders, fixed-function blocks,
//! binding layouts and render pass by their cached identities, so the
//! description hash is cheap to compute and two descriptions built from the
//! same cached objects always hash equally.
//!
//! Pipelines built against a render pass are tied to it: when the pass is
//! invalidated (for instance after a swapchain resize), the pipeline is
//! evicted together with it.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use crate::binding::ShaderBindingLayout;
use crate::deferred::DeferredDeletionQueue;
use crate::device::GpuDevice;
use crate::error::{RhiError, RhiResult};
use crate::render_pass::RenderPass;
use crate::shader::{ShaderModule, ShaderStage};
use crate::state::fixed_function::{
    BlendState, DepthStencilState, PrimitiveTopology, RasterizationState,
};

/// One vertex buffer binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub per_instance: bool,
}

/// One vertex attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// Vertex input layout of a graphics pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexInputDesc {
    pub bindings: Vec<VertexBinding>,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexInputDesc {
    /// No vertex buffers; vertices are generated in the shader.
    pub fn none() -> Self {
        Self::default()
    }

    /// One interleaved per-vertex buffer with tightly packed attributes at
    /// consecutive locations.
    pub fn interleaved(formats: &[vk::Format]) -> Self {
        let mut offset = 0;
        let attributes = formats
            .iter()
            .enumerate()
            .map(|(location, &format)| {
                let attribute = VertexAttribute {
                    location: location as u32,
                    binding: 0,
                    format,
                    offset,
                };
                offset += format_size(format);
                attribute
            })
            .collect();
        Self {
            bindings: vec![VertexBinding {
                binding: 0,
                stride: offset,
                per_instance: false,
            }],
            attributes,
        }
    }

    pub fn binding_descriptions(&self) -> Vec<vk::VertexInputBindingDescription> {
        self.bindings
            .iter()
            .map(|b| {
                vk::VertexInputBindingDescription::default()
                    .binding(b.binding)
                    .stride(b.stride)
                    .input_rate(if b.per_instance {
                        vk::VertexInputRate::INSTANCE
                    } else {
                        vk::VertexInputRate::VERTEX
                    })
            })
            .collect()
    }

    pub fn attribute_descriptions(&self) -> Vec<vk::VertexInputAttributeDescription> {
        self.attributes
            .iter()
            .map(|a| {
                vk::VertexInputAttributeDescription::default()
                    .location(a.location)
                    .binding(a.binding)
                    .format(a.format)
                    .offset(a.offset)
            })
            .collect()
    }
}

/// Size in bytes of common vertex formats.
fn format_size(format: vk::Format) -> u32 {
    match format {
        vk::Format::R32_SFLOAT | vk::Format::R32_UINT | vk::Format::R8G8B8A8_UNORM => 4,
        vk::Format::R32G32_SFLOAT | vk::Format::R16G16B16A16_SFLOAT => 8,
        vk::Format::R32G32B32_SFLOAT => 12,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => 16,
    }
}

/// A push constant range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PushConstantRange {
    pub stages: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

/// Full description of a graphics pipeline.
#[derive(Clone, Debug)]
pub struct GraphicsPipelineDesc {
    pub vertex_shader: Arc<ShaderModule>,
    pub fragment_shader: Option<Arc<ShaderModule>>,
    pub vertex_input: VertexInputDesc,
    pub topology: PrimitiveTopology,
    pub rasterization: Arc<RasterizationState>,
    pub blend: Arc<BlendState>,
    pub depth_stencil: Arc<DepthStencilState>,
    pub binding_layouts: Vec<Arc<ShaderBindingLayout>>,
    pub push_constants: Vec<PushConstantRange>,
    pub render_pass: Arc<RenderPass>,
    pub subpass: u32,
}

impl Hash for GraphicsPipelineDesc {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.vertex_shader.hash().hash(state);
        self.fragment_shader.as_ref().map(|s| s.hash()).hash(state);
        self.vertex_input.hash(state);
        self.topology.hash(state);
        self.rasterization.hash().hash(state);
        self.blend.hash().hash(state);
        self.depth_stencil.hash().hash(state);
        for layout in &self.binding_layouts {
            layout.hash().hash(state);
        }
        self.push_constants.hash(state);
        self.render_pass.hash().hash(state);
        self.subpass.hash(state);
    }
}

impl GraphicsPipelineDesc {
    fn validate(&self) -> RhiResult<()> {
        let fail = |msg: String| Err(RhiError::PipelineError(msg));

        if self.vertex_shader.stage() != ShaderStage::Vertex {
            return fail(format!(
                "vertex slot holds a {} shader",
                self.vertex_shader.stage()
            ));
        }
        if let Some(fragment) = &self.fragment_shader
            && fragment.stage() != ShaderStage::Fragment
        {
            return fail(format!("fragment slot holds a {} shader", fragment.stage()));
        }
        if self.subpass >= self.render_pass.subpass_count() {
            return fail(format!(
                "subpass {} out of range ({} subpasses)",
                self.subpass,
                self.render_pass.subpass_count()
            ));
        }

        let colors = self.render_pass.color_count(self.subpass);
        let blends = self.blend.desc().attachments.len();
        if blends != colors {
            return fail(format!(
                "{} blend attachment(s) for {} color attachment(s) in subpass {}",
                blends, colors, self.subpass
            ));
        }

        let samples = self.render_pass.sample_count(self.subpass);
        let rasterization = self.rasterization.desc().sample_count;
        if rasterization != samples {
            return fail(format!(
                "rasterization uses {} sample(s), subpass {} has {}",
                rasterization, self.subpass, samples
            ));
        }
        Ok(())
    }
}

/// Full description of a compute pipeline.
#[derive(Clone, Debug)]
pub struct ComputePipelineDesc {
    pub shader: Arc<ShaderModule>,
    pub binding_layouts: Vec<Arc<ShaderBindingLayout>>,
    pub push_constants: Vec<PushConstantRange>,
}

impl Hash for ComputePipelineDesc {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shader.hash().hash(state);
        for layout in &self.binding_layouts {
            layout.hash().hash(state);
        }
        self.push_constants.hash(state);
    }
}

/// A cached pipeline with its pipeline layout.
pub struct PipelineState {
    device: Arc<dyn GpuDevice>,
    deletion: Arc<DeferredDeletionQueue>,
    hash: u64,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
    render_pass: Option<Arc<RenderPass>>,
}

impl PipelineState {
    /// # Errors
    ///
    /// Returns [`RhiError::PipelineError`] if shader stages, blend attachment
    /// count or sample count disagree with the render pass, or the native
    /// error if creation fails.
    pub(crate) fn create_graphics(
        device: Arc<dyn GpuDevice>,
        deletion: Arc<DeferredDeletionQueue>,
        desc: &GraphicsPipelineDesc,
        hash: u64,
    ) -> RhiResult<Self> {
        desc.validate()?;

        let layout = create_layout(device.as_ref(), &desc.binding_layouts, &desc.push_constants)?;
        let pipeline = match device.create_graphics_pipeline(desc, layout) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                device.destroy_pipeline_layout(layout);
                return Err(err);
            }
        };
        info!(
            "Graphics pipeline {:016x} created for render pass {:016x}, subpass {}",
            hash,
            desc.render_pass.hash(),
            desc.subpass
        );

        Ok(Self {
            device,
            deletion,
            hash,
            pipeline,
            layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            render_pass: Some(Arc::clone(&desc.render_pass)),
        })
    }

    pub(crate) fn create_compute(
        device: Arc<dyn GpuDevice>,
        deletion: Arc<DeferredDeletionQueue>,
        desc: &ComputePipelineDesc,
        hash: u64,
    ) -> RhiResult<Self> {
        if desc.shader.stage() != ShaderStage::Compute {
            return Err(RhiError::PipelineError(format!(
                "compute pipeline given a {} shader",
                desc.shader.stage()
            )));
        }

        let layout = create_layout(device.as_ref(), &desc.binding_layouts, &desc.push_constants)?;
        let pipeline = match device.create_compute_pipeline(desc, layout) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                device.destroy_pipeline_layout(layout);
                return Err(err);
            }
        };
        info!("Compute pipeline {:016x} created", hash);

        Ok(Self {
            device,
            deletion,
            hash,
            pipeline,
            layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
            render_pass: None,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    #[inline]
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    #[inline]
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn render_pass(&self) -> Option<&Arc<RenderPass>> {
        self.render_pass.as_ref()
    }

    /// Whether the render pass this pipeline was built for is invalidated.
    pub fn is_invalidated(&self) -> bool {
        self.render_pass
            .as_ref()
            .is_some_and(|render_pass| render_pass.is_invalidated())
    }
}

fn create_layout(
    device: &dyn GpuDevice,
    binding_layouts: &[Arc<ShaderBindingLayout>],
    push_constants: &[PushConstantRange],
) -> RhiResult<vk::PipelineLayout> {
    let set_layouts: Vec<vk::DescriptorSetLayout> =
        binding_layouts.iter().map(|layout| layout.handle()).collect();
    let layout = device.create_pipeline_layout(&set_layouts, push_constants)?;
    debug!(
        "Created pipeline layout with {} binding layout(s) and {} push constant range(s)",
        set_layouts.len(),
        push_constants.len()
    );
    Ok(layout)
}

impl Drop for PipelineState {
    fn drop(&mut self) {
        let device = Arc::clone(&self.device);
        let (pipeline, layout) = (self.pipeline, self.layout);
        self.deletion.defer(move || {
            device.destroy_pipeline(pipeline);
            device.destroy_pipeline_layout(layout);
        });
        debug!("Pipeline {:016x} queued for destruction", self.hash);
    }
}

impl std::fmt::Debug for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineState")
            .field("hash", &format_args!("{:016x}", self.hash))
            .field("bind_point", &self.bind_point)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleaved_vertex_input() {
        let input = VertexInputDesc::interleaved(&[
            vk::Format::R32G32B32_SFLOAT,
            vk::Format::R32G32B32_SFLOAT,
            vk::Format::R32G32_SFLOAT,
        ]);
        assert_eq!(input.bindings.len(), 1);
        assert_eq!(input.bindings[0].stride, 32);
        let offsets: Vec<u32> = input.attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24]);
        let locations: Vec<u32> = input.attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, vec![0, 1, 2]);
    }

    #[test]
    fn test_vertex_descriptions_to_vk() {
        let input = VertexInputDesc {
            bindings: vec![VertexBinding {
                binding: 1,
                stride: 16,
                per_instance: true,
            }],
            attributes: vec![VertexAttribute {
                location: 4,
                binding: 1,
                format: vk::Format::R32G32B32A32_SFLOAT,
                offset: 0,
            }],
        };
        let bindings = input.binding_descriptions();
        assert_eq!(bindings[0].input_rate, vk::VertexInputRate::INSTANCE);
        assert_eq!(bindings[0].stride, 16);
        let attributes = input.attribute_descriptions();
        assert_eq!(attributes[0].location, 4);
        assert_eq!(attributes[0].format, vk::Format::R32G32B32A32_SFLOAT);
    }

    #[test]
    fn test_empty_vertex_input() {
        let input = VertexInputDesc::none();
        assert!(input.bindings.is_empty());
        assert!(input.binding_descriptions().is_empty());
    }
}
