//! The render pipeline capability interface.
//!
//! A [`RenderPipeline`] owns the passes and targets of one way of drawing a
//! [`Scene`]. Variants are independent structs selected by [`PipelineKind`];
//! the [`Renderer`](crate::Renderer) drives whichever one is active through
//! `setup`, `draw` and `teardown`.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use ember_rhi::binding::{AllocationScope, ShaderBinding, ShaderBindingArray, ShaderBindingInstance};
use ember_rhi::command::CommandBuffer;
use ember_rhi::frame::FrameContext;
use ember_rhi::pipeline::PushConstantRange;
use ember_rhi::shader::{ShaderDesc, ShaderModule, ShaderStage};
use ember_rhi::vk;
use ember_rhi::{RhiContext, RhiError, RhiResult};

use crate::deferred::DeferredPipeline;
use crate::forward::ForwardPipeline;
use crate::scene::Scene;
use crate::uniforms::{FrameUniforms, ObjectConstants};

/// Format of the depth target shared by both pipelines.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// A complete strategy for turning a [`Scene`] into a presented image.
pub trait RenderPipeline: Send {
    fn kind(&self) -> PipelineKind;

    /// Creates the pipeline's render targets and shader modules.
    ///
    /// Render targets come from [`RhiContext::create_render_target`] and
    /// follow the swapchain size from then on.
    fn setup(&mut self, rhi: &mut RhiContext) -> RhiResult<()>;

    /// Records every pass for `scene` into the frame's command buffer.
    fn draw(&mut self, rhi: &RhiContext, frame: &mut FrameContext, scene: &Scene) -> RhiResult<()>;

    /// Releases everything `setup` created. The GPU is idle when this runs.
    fn teardown(&mut self, rhi: &RhiContext);
}

/// Available pipeline variants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    /// One subpass shading every mesh directly into the backbuffer.
    #[default]
    Forward,
    /// A G-buffer subpass followed by a fullscreen lighting subpass.
    Deferred,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 2] = [PipelineKind::Forward, PipelineKind::Deferred];

    pub fn name(self) -> &'static str {
        match self {
            PipelineKind::Forward => "forward",
            PipelineKind::Deferred => "deferred",
        }
    }

    /// Instantiates the variant. Nothing is created on the device until
    /// [`RenderPipeline::setup`].
    pub fn create(self, shaders: &ShaderSet) -> Box<dyn RenderPipeline> {
        match self {
            PipelineKind::Forward => Box::new(ForwardPipeline::new(shaders)),
            PipelineKind::Deferred => Box::new(DeferredPipeline::new(shaders)),
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PipelineKind {
    type Err = RhiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "forward" => Ok(PipelineKind::Forward),
            "deferred" => Ok(PipelineKind::Deferred),
            other => Err(RhiError::PipelineError(format!(
                "unknown render pipeline '{}'",
                other
            ))),
        }
    }
}

/// SPIR-V for every shader the pipelines use.
#[derive(Clone, Debug, Default)]
pub struct ShaderSet {
    /// Transforms position and normal by the model and view-projection matrices.
    pub mesh_vertex: Vec<u32>,
    /// Lambert shading, used by the forward pipeline.
    pub mesh_fragment: Vec<u32>,
    /// Writes albedo and normal, used by the deferred geometry subpass.
    pub gbuffer_fragment: Vec<u32>,
    /// Emits a fullscreen triangle from the vertex index.
    pub fullscreen_vertex: Vec<u32>,
    /// Reads the G-buffer input attachments and shades.
    pub lighting_fragment: Vec<u32>,
}

impl ShaderSet {
    /// Loads the compiled shaders from `dir`.
    ///
    /// Expects `mesh.vert.spv`, `mesh.frag.spv`, `gbuffer.frag.spv`,
    /// `fullscreen.vert.spv` and `lighting.frag.spv`.
    pub fn load(dir: &Path) -> RhiResult<Self> {
        let load = |stage: ShaderStage, file: &str| -> RhiResult<Vec<u32>> {
            Ok(ShaderDesc::from_spirv_file(stage, &dir.join(file))?.code)
        };
        Ok(Self {
            mesh_vertex: load(ShaderStage::Vertex, "mesh.vert.spv")?,
            mesh_fragment: load(ShaderStage::Fragment, "mesh.frag.spv")?,
            gbuffer_fragment: load(ShaderStage::Fragment, "gbuffer.frag.spv")?,
            fullscreen_vertex: load(ShaderStage::Vertex, "fullscreen.vert.spv")?,
            lighting_fragment: load(ShaderStage::Fragment, "lighting.frag.spv")?,
        })
    }
}

/// Stages that read [`FrameUniforms`].
pub(crate) const FRAME_UNIFORM_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::VERTEX.as_raw() | vk::ShaderStageFlags::FRAGMENT.as_raw(),
);

/// Bindings of set 0: the frame uniforms as a dynamic uniform buffer over
/// the frame's ring.
pub(crate) fn frame_bindings(frame: &FrameContext) -> ShaderBindingArray {
    ShaderBindingArray::new().with(ShaderBinding::dynamic_uniform_buffer(
        0,
        FRAME_UNIFORM_STAGES,
        frame.uniforms().buffer(),
        FrameUniforms::SIZE,
    ))
}

/// Pushes the scene's frame uniforms and allocates set 0 for this frame.
///
/// Returns the instance with the dynamic offset to bind it at.
pub(crate) fn frame_binding_instance(
    rhi: &RhiContext,
    frame: &FrameContext,
    scene: &Scene,
) -> RhiResult<(ShaderBindingInstance, u32)> {
    let allocation = frame.uniforms().push(&scene.uniforms)?;
    let bindings = frame_bindings(frame);
    let layout = rhi.get_or_create_binding_layout(&bindings)?;
    let instance =
        rhi.create_shader_binding_instance(&layout, &bindings, AllocationScope::Frame(frame))?;
    Ok((instance, allocation.dynamic_offset()))
}

/// The per-draw model matrix, pushed to the vertex stage.
pub(crate) const OBJECT_PUSH_CONSTANTS: PushConstantRange = PushConstantRange {
    stages: vk::ShaderStageFlags::VERTEX,
    offset: 0,
    size: ObjectConstants::SIZE,
};

/// Binds each mesh's buffers and issues one indexed draw per mesh.
///
/// Expects a pipeline using [`OBJECT_PUSH_CONSTANTS`] to be bound.
pub(crate) fn draw_meshes(cmd: &mut CommandBuffer, scene: &Scene) {
    for mesh in scene.meshes() {
        let constants = ObjectConstants {
            model: mesh.transform,
        };
        cmd.push_constants(
            OBJECT_PUSH_CONSTANTS.stages,
            0,
            bytemuck::bytes_of(&constants),
        );
        cmd.bind_vertex_buffers(0, &[mesh.vertex_buffer()]);
        cmd.bind_index_buffer(mesh.index_buffer(), 0, vk::IndexType::UINT32);
        cmd.draw_indexed(mesh.index_count(), 1, 0, 0, 0);
    }
}

/// Viewport and scissor covering the whole frame.
pub(crate) fn set_full_viewport(cmd: &mut CommandBuffer, extent: vk::Extent2D) {
    cmd.set_viewport(extent);
    cmd.set_scissor(vk::Offset2D::default(), extent);
}

pub(crate) fn shader(
    rhi: &RhiContext,
    stage: ShaderStage,
    code: &[u32],
) -> RhiResult<Arc<ShaderModule>> {
    rhi.create_shader(stage, code, "main")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parses_case_insensitively() {
        assert_eq!("Forward".parse::<PipelineKind>().ok(), Some(PipelineKind::Forward));
        assert_eq!("DEFERRED".parse::<PipelineKind>().ok(), Some(PipelineKind::Deferred));
        assert!("raytraced".parse::<PipelineKind>().is_err());
    }

    #[test]
    fn test_kind_display_round_trips() {
        for kind in PipelineKind::ALL {
            assert_eq!(kind.to_string().parse::<PipelineKind>().ok(), Some(kind));
        }
    }

    #[test]
    fn test_created_pipeline_reports_its_kind() {
        let shaders = ShaderSet::default();
        for kind in PipelineKind::ALL {
            assert_eq!(kind.create(&shaders).kind(), kind);
        }
    }

    #[test]
    fn test_load_missing_directory_fails() {
        let err = ShaderSet::load(Path::new("/nonexistent/shader/dir"));
        assert!(matches!(err, Err(RhiError::ShaderError(_))));
    }
}
