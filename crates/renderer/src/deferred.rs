//! Deferred rendering in one render pass with two subpasses.
//!
//! Subpass 0 rasterizes the scene into the G-buffer (albedo and normal plus
//! depth). Subpass 1 reads the G-buffer back as input attachments and shades
//! a fullscreen triangle into the backbuffer. Keeping both in a single pass
//! lets tiled GPUs resolve the G-buffer on chip.

use std::sync::Arc;

use ember_rhi::binding::{AllocationScope, ShaderBinding, ShaderBindingArray};
use ember_rhi::frame::FrameContext;
use ember_rhi::pipeline::{GraphicsPipelineDesc, PipelineState, VertexInputDesc};
use ember_rhi::render_pass::{
    Attachment, LoadStorePolicy, RenderPass, RenderPassDesc, Subpass, SubpassOrdering,
};
use ember_rhi::resource::Texture;
use ember_rhi::shader::{ShaderModule, ShaderStage};
use ember_rhi::state::fixed_function::{
    BlendStateDesc, CullMode, DepthStencilStateDesc, PrimitiveTopology, RasterizationStateDesc,
};
use ember_rhi::types::ClearValue;
use ember_rhi::vk;
use ember_rhi::{RhiContext, RhiError, RhiResult};
use tracing::{debug, info};

use crate::pipeline::{
    DEPTH_FORMAT, OBJECT_PUSH_CONSTANTS, PipelineKind, RenderPipeline, ShaderSet, draw_meshes,
    frame_binding_instance, frame_bindings, set_full_viewport, shader,
};
use crate::scene::Scene;

pub const ALBEDO_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
pub const NORMAL_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

const GEOMETRY_SUBPASS: u32 = 0;
const LIGHTING_SUBPASS: u32 = 1;

struct GBuffer {
    albedo: Arc<Texture>,
    normal: Arc<Texture>,
    depth: Arc<Texture>,
}

struct DeferredShaders {
    mesh_vertex: Arc<ShaderModule>,
    gbuffer_fragment: Arc<ShaderModule>,
    fullscreen_vertex: Arc<ShaderModule>,
    lighting_fragment: Arc<ShaderModule>,
}

/// G-buffer plus lighting renderer.
pub struct DeferredPipeline {
    shaders: ShaderSet,
    gbuffer: Option<GBuffer>,
    modules: Option<DeferredShaders>,
}

impl DeferredPipeline {
    pub fn new(shaders: &ShaderSet) -> Self {
        Self {
            shaders: shaders.clone(),
            gbuffer: None,
            modules: None,
        }
    }

    fn resources(&self) -> RhiResult<(&GBuffer, &DeferredShaders)> {
        match (&self.gbuffer, &self.modules) {
            (Some(gbuffer), Some(modules)) => Ok((gbuffer, modules)),
            _ => Err(RhiError::PipelineError(
                "deferred pipeline used before setup".into(),
            )),
        }
    }

    /// Attachments: 0 backbuffer, 1 albedo, 2 normal, 3 depth.
    fn render_pass(
        rhi: &RhiContext,
        frame: &FrameContext,
        gbuffer: &GBuffer,
        scene: &Scene,
    ) -> RhiResult<Arc<RenderPass>> {
        let desc = RenderPassDesc::new(frame.extent())
            .attachment(Attachment::present(
                frame.backbuffer(),
                LoadStorePolicy::ClearStore,
                ClearValue::Color(scene.clear_color),
            ))
            .attachment(Attachment::color(
                &gbuffer.albedo,
                LoadStorePolicy::ClearDontCare,
                ClearValue::BLACK,
            ))
            .attachment(Attachment::color(
                &gbuffer.normal,
                LoadStorePolicy::ClearDontCare,
                ClearValue::Color([0.0; 4]),
            ))
            .attachment(Attachment::depth(
                &gbuffer.depth,
                LoadStorePolicy::ClearDontCare,
                ClearValue::DEPTH_ONE,
            ))
            .subpass(Subpass::new().color(1).color(2).depth(3))
            .subpass(Subpass::new().input(1).input(2).color(0))
            .ordering(SubpassOrdering::Explicit(vec![(
                GEOMETRY_SUBPASS,
                LIGHTING_SUBPASS,
            )]));
        rhi.get_or_create_render_pass(&desc)
    }

    fn gbuffer_bindings(gbuffer: &GBuffer) -> ShaderBindingArray {
        ShaderBindingArray::new()
            .with(ShaderBinding::input_attachment(0, &gbuffer.albedo))
            .with(ShaderBinding::input_attachment(1, &gbuffer.normal))
    }

    fn geometry_pipeline(
        rhi: &RhiContext,
        frame: &FrameContext,
        modules: &DeferredShaders,
        render_pass: &Arc<RenderPass>,
    ) -> RhiResult<Arc<PipelineState>> {
        rhi.get_or_create_graphics_pipeline(&GraphicsPipelineDesc {
            vertex_shader: Arc::clone(&modules.mesh_vertex),
            fragment_shader: Some(Arc::clone(&modules.gbuffer_fragment)),
            vertex_input: VertexInputDesc::interleaved(&[
                vk::Format::R32G32B32_SFLOAT,
                vk::Format::R32G32B32_SFLOAT,
            ]),
            topology: PrimitiveTopology::TriangleList,
            rasterization: rhi.get_or_create_rasterization_state(&RasterizationStateDesc::default())?,
            blend: rhi.get_or_create_blend_state(&BlendStateDesc::opaque(2))?,
            depth_stencil: rhi.get_or_create_depth_stencil_state(&DepthStencilStateDesc::depth_less())?,
            binding_layouts: vec![rhi.get_or_create_binding_layout(&frame_bindings(frame))?],
            push_constants: vec![OBJECT_PUSH_CONSTANTS],
            render_pass: Arc::clone(render_pass),
            subpass: GEOMETRY_SUBPASS,
        })
    }

    fn lighting_pipeline(
        rhi: &RhiContext,
        frame: &FrameContext,
        gbuffer: &GBuffer,
        modules: &DeferredShaders,
        render_pass: &Arc<RenderPass>,
    ) -> RhiResult<Arc<PipelineState>> {
        rhi.get_or_create_graphics_pipeline(&GraphicsPipelineDesc {
            vertex_shader: Arc::clone(&modules.fullscreen_vertex),
            fragment_shader: Some(Arc::clone(&modules.lighting_fragment)),
            vertex_input: VertexInputDesc::none(),
            topology: PrimitiveTopology::TriangleList,
            rasterization: rhi.get_or_create_rasterization_state(&RasterizationStateDesc {
                cull_mode: CullMode::None,
                ..Default::default()
            })?,
            blend: rhi.get_or_create_blend_state(&BlendStateDesc::opaque(1))?,
            depth_stencil: rhi.get_or_create_depth_stencil_state(&DepthStencilStateDesc::disabled())?,
            binding_layouts: vec![
                rhi.get_or_create_binding_layout(&frame_bindings(frame))?,
                rhi.get_or_create_binding_layout(&Self::gbuffer_bindings(gbuffer))?,
            ],
            push_constants: Vec::new(),
            render_pass: Arc::clone(render_pass),
            subpass: LIGHTING_SUBPASS,
        })
    }
}

impl RenderPipeline for DeferredPipeline {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Deferred
    }

    fn setup(&mut self, rhi: &mut RhiContext) -> RhiResult<()> {
        if rhi.config().sample_count > 1 {
            debug!("Deferred pipeline renders without MSAA");
        }

        self.gbuffer = Some(GBuffer {
            albedo: rhi.create_render_target("gbuffer albedo", ALBEDO_FORMAT, 1)?,
            normal: rhi.create_render_target("gbuffer normal", NORMAL_FORMAT, 1)?,
            depth: rhi.create_render_target("gbuffer depth", DEPTH_FORMAT, 1)?,
        });
        self.modules = Some(DeferredShaders {
            mesh_vertex: shader(rhi, ShaderStage::Vertex, &self.shaders.mesh_vertex)?,
            gbuffer_fragment: shader(rhi, ShaderStage::Fragment, &self.shaders.gbuffer_fragment)?,
            fullscreen_vertex: shader(rhi, ShaderStage::Vertex, &self.shaders.fullscreen_vertex)?,
            lighting_fragment: shader(rhi, ShaderStage::Fragment, &self.shaders.lighting_fragment)?,
        });
        info!("Deferred pipeline ready");
        Ok(())
    }

    fn draw(&mut self, rhi: &RhiContext, frame: &mut FrameContext, scene: &Scene) -> RhiResult<()> {
        let (gbuffer, modules) = self.resources()?;
        let render_pass = Self::render_pass(rhi, frame, gbuffer, scene)?;
        let geometry = Self::geometry_pipeline(rhi, frame, modules, &render_pass)?;
        let lighting = Self::lighting_pipeline(rhi, frame, gbuffer, modules, &render_pass)?;

        let (frame_set, offset) = frame_binding_instance(rhi, frame, scene)?;
        let gbuffer_bindings = Self::gbuffer_bindings(gbuffer);
        let gbuffer_layout = rhi.get_or_create_binding_layout(&gbuffer_bindings)?;
        let gbuffer_set = rhi.create_shader_binding_instance(
            &gbuffer_layout,
            &gbuffer_bindings,
            AllocationScope::Frame(frame),
        )?;

        let extent = frame.extent();
        let cmd = frame.command_buffer_mut();
        render_pass.begin_render_pass(cmd)?;
        set_full_viewport(cmd, extent);

        cmd.bind_pipeline(&geometry);
        cmd.bind_shader_binding_instances(0, &[&frame_set], &[offset])?;
        draw_meshes(cmd, scene);

        render_pass.next_subpass(cmd);
        cmd.bind_pipeline(&lighting);
        cmd.bind_shader_binding_instances(0, &[&frame_set, &gbuffer_set], &[offset])?;
        cmd.draw(3, 1, 0, 0);

        render_pass.end_render_pass(cmd);
        Ok(())
    }

    fn teardown(&mut self, _rhi: &RhiContext) {
        self.modules = None;
        if let Some(gbuffer) = self.gbuffer.take() {
            debug!("Releasing G-buffer");
            for texture in [&gbuffer.albedo, &gbuffer.normal, &gbuffer.depth] {
                texture.destroy();
            }
        }
    }
}
