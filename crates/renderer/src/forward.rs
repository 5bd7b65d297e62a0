//! Forward rendering: every mesh is shaded straight into the backbuffer.

use std::sync::Arc;

use ember_rhi::frame::FrameContext;
use ember_rhi::pipeline::{GraphicsPipelineDesc, PipelineState, VertexInputDesc};
use ember_rhi::render_pass::{Attachment, LoadStorePolicy, RenderPass, RenderPassDesc, Subpass};
use ember_rhi::resource::{ResourceState, Texture};
use ember_rhi::shader::{ShaderModule, ShaderStage};
use ember_rhi::state::fixed_function::{
    BlendStateDesc, DepthStencilStateDesc, PrimitiveTopology, RasterizationStateDesc,
};
use ember_rhi::types::{ClearValue, sample_count_flags};
use ember_rhi::vk;
use ember_rhi::{RhiContext, RhiError, RhiResult};
use tracing::{debug, info, warn};

use crate::pipeline::{
    DEPTH_FORMAT, OBJECT_PUSH_CONSTANTS, PipelineKind, RenderPipeline, ShaderSet, draw_meshes,
    frame_binding_instance, frame_bindings, set_full_viewport, shader,
};
use crate::scene::Scene;

/// Targets and shaders created by [`ForwardPipeline::setup`].
struct ForwardTargets {
    depth: Arc<Texture>,
    /// Multisampled color target resolved into the backbuffer.
    msaa_color: Option<Arc<Texture>>,
    vertex: Arc<ShaderModule>,
    fragment: Arc<ShaderModule>,
}

/// Single-subpass forward renderer with optional MSAA.
pub struct ForwardPipeline {
    shaders: ShaderSet,
    samples: u32,
    targets: Option<ForwardTargets>,
}

impl ForwardPipeline {
    pub fn new(shaders: &ShaderSet) -> Self {
        Self {
            shaders: shaders.clone(),
            samples: 1,
            targets: None,
        }
    }

    /// Effective sample count after `setup`.
    pub fn samples(&self) -> u32 {
        self.samples
    }

    fn targets(&self) -> RhiResult<&ForwardTargets> {
        self.targets
            .as_ref()
            .ok_or_else(|| RhiError::PipelineError("forward pipeline used before setup".into()))
    }

    fn render_pass(
        &self,
        rhi: &RhiContext,
        frame: &FrameContext,
        scene: &Scene,
    ) -> RhiResult<Arc<RenderPass>> {
        let targets = self.targets()?;
        let clear = ClearValue::Color(scene.clear_color);
        let depth = Attachment::depth(
            &targets.depth,
            LoadStorePolicy::ClearDontCare,
            ClearValue::DEPTH_ONE,
        );

        let desc = match &targets.msaa_color {
            Some(msaa) => RenderPassDesc::new(frame.extent())
                .attachment(
                    Attachment::color(msaa, LoadStorePolicy::ClearDontCare, clear)
                        .with_final_state(ResourceState::ColorAttachment),
                )
                .attachment(depth)
                .attachment(Attachment::present(
                    frame.backbuffer(),
                    LoadStorePolicy::DontCareStore,
                    clear,
                ))
                .subpass(Subpass::new().color(0).depth(1).resolve(2)),
            None => RenderPassDesc::new(frame.extent())
                .attachment(Attachment::present(
                    frame.backbuffer(),
                    LoadStorePolicy::ClearStore,
                    clear,
                ))
                .attachment(depth)
                .subpass(Subpass::new().color(0).depth(1)),
        };
        rhi.get_or_create_render_pass(&desc)
    }

    fn pipeline_state(
        &self,
        rhi: &RhiContext,
        frame: &FrameContext,
        render_pass: &Arc<RenderPass>,
    ) -> RhiResult<Arc<PipelineState>> {
        let targets = self.targets()?;
        let frame_layout = rhi.get_or_create_binding_layout(&frame_bindings(frame))?;
        rhi.get_or_create_graphics_pipeline(&GraphicsPipelineDesc {
            vertex_shader: Arc::clone(&targets.vertex),
            fragment_shader: Some(Arc::clone(&targets.fragment)),
            vertex_input: VertexInputDesc::interleaved(&[
                vk::Format::R32G32B32_SFLOAT,
                vk::Format::R32G32B32_SFLOAT,
            ]),
            topology: PrimitiveTopology::TriangleList,
            rasterization: rhi.get_or_create_rasterization_state(&RasterizationStateDesc {
                sample_count: self.samples,
                ..Default::default()
            })?,
            blend: rhi.get_or_create_blend_state(&BlendStateDesc::opaque(1))?,
            depth_stencil: rhi.get_or_create_depth_stencil_state(&DepthStencilStateDesc::depth_less())?,
            binding_layouts: vec![frame_layout],
            push_constants: vec![OBJECT_PUSH_CONSTANTS],
            render_pass: Arc::clone(render_pass),
            subpass: 0,
        })
    }
}

impl RenderPipeline for ForwardPipeline {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Forward
    }

    fn setup(&mut self, rhi: &mut RhiContext) -> RhiResult<()> {
        let requested = rhi.config().sample_count;
        let supported = rhi.device().capabilities().framebuffer_sample_counts;
        self.samples = if supported.contains(sample_count_flags(requested)) {
            requested
        } else {
            warn!(
                "{}x MSAA not supported by the device, forward pipeline falls back to 1x",
                requested
            );
            1
        };

        let format = rhi.frames().format();
        let depth = rhi.create_render_target("forward depth", DEPTH_FORMAT, self.samples)?;
        let msaa_color = if self.samples > 1 {
            Some(rhi.create_render_target("forward msaa color", format, self.samples)?)
        } else {
            None
        };

        self.targets = Some(ForwardTargets {
            depth,
            msaa_color,
            vertex: shader(rhi, ShaderStage::Vertex, &self.shaders.mesh_vertex)?,
            fragment: shader(rhi, ShaderStage::Fragment, &self.shaders.mesh_fragment)?,
        });
        info!("Forward pipeline ready ({}x MSAA)", self.samples);
        Ok(())
    }

    fn draw(&mut self, rhi: &RhiContext, frame: &mut FrameContext, scene: &Scene) -> RhiResult<()> {
        let render_pass = self.render_pass(rhi, frame, scene)?;
        let pipeline = self.pipeline_state(rhi, frame, &render_pass)?;
        let (frame_set, offset) = frame_binding_instance(rhi, frame, scene)?;

        let extent = frame.extent();
        let cmd = frame.command_buffer_mut();
        render_pass.begin_render_pass(cmd)?;
        set_full_viewport(cmd, extent);
        cmd.bind_pipeline(&pipeline);
        cmd.bind_shader_binding_instances(0, &[&frame_set], &[offset])?;
        draw_meshes(cmd, scene);
        render_pass.end_render_pass(cmd);
        Ok(())
    }

    fn teardown(&mut self, _rhi: &RhiContext) {
        if let Some(targets) = self.targets.take() {
            debug!("Releasing forward pipeline targets");
            targets.depth.destroy();
            if let Some(msaa) = targets.msaa_color {
                msaa.destroy();
            }
        }
    }
}
