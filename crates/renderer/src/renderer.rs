//! Main renderer orchestration.
//!
//! [`Renderer`] owns the [`RhiContext`] and the active [`RenderPipeline`],
//! and drives one frame per [`Renderer::render_frame`] call.

use std::sync::Arc;

use ember_core::RhiConfig;
use ember_rhi::device::GpuDevice;
use ember_rhi::vk;
use ember_rhi::vulkan::VulkanDevice;
use ember_rhi::{RhiContext, RhiResult};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{error, info};

use crate::pipeline::{PipelineKind, RenderPipeline, ShaderSet};
use crate::scene::Scene;

/// Drives a [`RenderPipeline`] over an [`RhiContext`].
///
/// # Resource Destruction Order
///
/// On drop the renderer waits for the GPU, tears the pipeline down and only
/// then releases the context, which destroys pools, caches and the device.
pub struct Renderer {
    pipeline: Box<dyn RenderPipeline>,
    shaders: ShaderSet,
    rhi: RhiContext,
}

impl Renderer {
    /// Creates a renderer on `device` and sets up the `kind` pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be created or the pipeline
    /// fails to set up.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        config: RhiConfig,
        kind: PipelineKind,
        shaders: ShaderSet,
    ) -> RhiResult<Self> {
        let mut rhi = RhiContext::new(device, config)?;
        let mut pipeline = kind.create(&shaders);
        pipeline.setup(&mut rhi)?;
        info!("Renderer ready with the {} pipeline", kind);
        Ok(Self {
            pipeline,
            shaders,
            rhi,
        })
    }

    /// Creates a Vulkan renderer presenting to `window`.
    pub fn for_window<W>(
        window: &W,
        config: RhiConfig,
        kind: PipelineKind,
        shaders: ShaderSet,
    ) -> RhiResult<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let device = VulkanDevice::new(window, &config)?;
        Self::new(device, config, kind, shaders)
    }

    pub fn kind(&self) -> PipelineKind {
        self.pipeline.kind()
    }

    pub fn rhi(&self) -> &RhiContext {
        &self.rhi
    }

    pub fn rhi_mut(&mut self) -> &mut RhiContext {
        &mut self.rhi
    }

    /// Records, submits and presents one frame of `scene`.
    ///
    /// Returns `false` if the frame was skipped because the swapchain had to
    /// be rebuilt. The frame is still submitted when drawing fails, so the
    /// frame loop stays consistent; the draw error is returned afterwards.
    pub fn render_frame(&mut self, scene: &Scene) -> RhiResult<bool> {
        let Some(mut frame) = self.rhi.begin_render_frame()? else {
            return Ok(false);
        };
        let drawn = self.pipeline.draw(&self.rhi, &mut frame, scene);
        if let Err(e) = &drawn {
            error!("Frame {} failed to draw: {}", frame.serial(), e);
        }
        self.rhi.end_render_frame(frame)?;
        drawn.map(|()| true)
    }

    /// Schedules a swapchain rebuild at the start of the next frame.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.rhi.request_resize(vk::Extent2D { width, height });
    }

    /// Replaces the active pipeline. A no-op if `kind` is already active.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting for the GPU fails or the new pipeline
    /// fails to set up. The renderer keeps no pipeline targets in that case
    /// and the previous pipeline is not restored.
    pub fn switch_pipeline(&mut self, kind: PipelineKind) -> RhiResult<()> {
        if self.pipeline.kind() == kind {
            return Ok(());
        }
        info!("Switching render pipeline: {} -> {}", self.pipeline.kind(), kind);

        self.rhi.finish()?;
        self.pipeline.teardown(&self.rhi);
        let mut pipeline = kind.create(&self.shaders);
        let result = pipeline.setup(&mut self.rhi);
        self.pipeline = pipeline;
        result
    }

    /// Blocks until all submitted work has completed.
    pub fn wait_idle(&self) -> RhiResult<()> {
        self.rhi.finish()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.rhi.finish() {
            error!("Failed to wait for the GPU during shutdown: {}", e);
        }
        self.pipeline.teardown(&self.rhi);
        info!("Renderer destroyed");
    }
}
