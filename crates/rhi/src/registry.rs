//! The registry of every content-addressed cache.
//!
//! One [`ResourcePoolRegistry`] is owned by the RHI context. It hands out
//! shared, immutable state objects keyed by the hash of their description:
//! the same description always yields the same `Arc`.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::binding::{ShaderBindingArray, ShaderBindingLayout};
use crate::deferred::DeferredDeletionQueue;
use crate::device::GpuDevice;
use crate::error::RhiResult;
use crate::pipeline::{ComputePipelineDesc, GraphicsPipelineDesc, PipelineState};
use crate::render_pass::{RenderPass, RenderPassDesc};
use crate::shader::{ShaderDesc, ShaderModule};
use crate::state::StateCache;
use crate::state::fixed_function::{
    BlendState, BlendStateDesc, DepthStencilState, DepthStencilStateDesc, FixedFunctionState,
    RasterizationState, RasterizationStateDesc,
};
use crate::state::sampler::{SamplerState, SamplerStateDesc};

/// Entry counts of every cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub samplers: usize,
    pub rasterization_states: usize,
    pub blend_states: usize,
    pub depth_stencil_states: usize,
    pub shaders: usize,
    pub binding_layouts: usize,
    pub render_passes: usize,
    pub graphics_pipelines: usize,
    pub compute_pipelines: usize,
}

/// Owner of all state caches.
pub struct ResourcePoolRegistry {
    device: Arc<dyn GpuDevice>,
    deletion: Arc<DeferredDeletionQueue>,
    samplers: StateCache<SamplerState>,
    rasterization: StateCache<RasterizationState>,
    blend: StateCache<BlendState>,
    depth_stencil: StateCache<DepthStencilState>,
    shaders: StateCache<ShaderModule>,
    binding_layouts: StateCache<ShaderBindingLayout>,
    render_passes: StateCache<RenderPass>,
    graphics_pipelines: StateCache<PipelineState>,
    compute_pipelines: StateCache<PipelineState>,
}

impl ResourcePoolRegistry {
    pub fn new(device: Arc<dyn GpuDevice>, deletion: Arc<DeferredDeletionQueue>) -> Self {
        Self {
            device,
            deletion,
            samplers: StateCache::new("sampler"),
            rasterization: StateCache::new("rasterization"),
            blend: StateCache::new("blend"),
            depth_stencil: StateCache::new("depth-stencil"),
            shaders: StateCache::new("shader"),
            binding_layouts: StateCache::new("binding layout"),
            render_passes: StateCache::new("render pass"),
            graphics_pipelines: StateCache::new("graphics pipeline"),
            compute_pipelines: StateCache::new("compute pipeline"),
        }
    }

    pub fn get_or_create_sampler(&self, desc: &SamplerStateDesc) -> RhiResult<Arc<SamplerState>> {
        self.samplers
            .get_or_create(desc, |hash| SamplerState::create(Arc::clone(&self.device), desc, hash))
    }

    pub fn get_or_create_rasterization_state(
        &self,
        desc: &RasterizationStateDesc,
    ) -> RhiResult<Arc<RasterizationState>> {
        self.rasterization
            .get_or_create(desc, |hash| Ok(FixedFunctionState::new(desc.clone(), hash)))
    }

    pub fn get_or_create_blend_state(&self, desc: &BlendStateDesc) -> RhiResult<Arc<BlendState>> {
        self.blend
            .get_or_create(desc, |hash| Ok(FixedFunctionState::new(desc.clone(), hash)))
    }

    pub fn get_or_create_depth_stencil_state(
        &self,
        desc: &DepthStencilStateDesc,
    ) -> RhiResult<Arc<DepthStencilState>> {
        self.depth_stencil
            .get_or_create(desc, |hash| Ok(FixedFunctionState::new(desc.clone(), hash)))
    }

    pub fn get_or_create_shader(&self, desc: &ShaderDesc) -> RhiResult<Arc<ShaderModule>> {
        self.shaders
            .get_or_create(desc, |hash| ShaderModule::create(Arc::clone(&self.device), desc, hash))
    }

    /// Layout for the shape of `bindings`; resources in `bindings` are ignored.
    pub fn get_or_create_binding_layout(
        &self,
        bindings: &ShaderBindingArray,
    ) -> RhiResult<Arc<ShaderBindingLayout>> {
        let hash = ShaderBindingLayout::shape_hash(bindings);
        self.binding_layouts.get_or_create_hashed(hash, || {
            ShaderBindingLayout::initialize(Arc::clone(&self.device), bindings)
        })
    }

    pub fn get_or_create_render_pass(&self, desc: &RenderPassDesc) -> RhiResult<Arc<RenderPass>> {
        self.render_passes.get_or_create(desc, |hash| {
            RenderPass::build(
                Arc::clone(&self.device),
                Arc::clone(&self.deletion),
                desc,
                hash,
            )
        })
    }

    pub fn get_or_create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
    ) -> RhiResult<Arc<PipelineState>> {
        self.graphics_pipelines.get_or_create(desc, |hash| {
            PipelineState::create_graphics(
                Arc::clone(&self.device),
                Arc::clone(&self.deletion),
                desc,
                hash,
            )
        })
    }

    pub fn get_or_create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
    ) -> RhiResult<Arc<PipelineState>> {
        self.compute_pipelines.get_or_create(desc, |hash| {
            PipelineState::create_compute(
                Arc::clone(&self.device),
                Arc::clone(&self.deletion),
                desc,
                hash,
            )
        })
    }

    /// Drops render passes whose attachments were destroyed or resized, and
    /// the pipelines built against them. Returns how many objects went away.
    pub fn evict_invalidated(&self) -> usize {
        let passes = self.render_passes.evict_where(|pass| pass.is_invalidated());
        let pipelines = self.evict_pipelines_of(&passes);
        if !passes.is_empty() {
            debug!(
                "Evicted {} invalidated render pass(es) and {} pipeline(s)",
                passes.len(),
                pipelines
            );
        }
        passes.len() + pipelines
    }

    /// Drops every cached object tied to the swapchain: render passes that
    /// target a swapchain image or are invalidated, plus the pipelines built
    /// against them. Offscreen passes survive unless a tracked target they
    /// use was resized.
    ///
    /// Native destruction is deferred; the caller drains the GPU first.
    pub fn invalidate_swapchain_dependent(&self) -> usize {
        let passes = self
            .render_passes
            .evict_where(|pass| pass.targets_swapchain() || pass.is_invalidated());
        let pipelines = self.evict_pipelines_of(&passes);
        info!(
            "Swapchain invalidation dropped {} render pass(es) and {} pipeline(s)",
            passes.len(),
            pipelines
        );
        passes.len() + pipelines
    }

    fn evict_pipelines_of(&self, passes: &[Arc<RenderPass>]) -> usize {
        let hashes: HashSet<u64> = passes.iter().map(|pass| pass.hash()).collect();
        self.graphics_pipelines
            .evict_where(|pipeline| {
                pipeline.is_invalidated()
                    || pipeline
                        .render_pass()
                        .is_some_and(|pass| hashes.contains(&pass.hash()))
            })
            .len()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            samplers: self.samplers.len(),
            rasterization_states: self.rasterization.len(),
            blend_states: self.blend.len(),
            depth_stencil_states: self.depth_stencil.len(),
            shaders: self.shaders.len(),
            binding_layouts: self.binding_layouts.len(),
            render_passes: self.render_passes.len(),
            graphics_pipelines: self.graphics_pipelines.len(),
            compute_pipelines: self.compute_pipelines.len(),
        }
    }

    /// Drops every cached object, dependents first.
    pub fn clear(&self) {
        self.graphics_pipelines.clear();
        self.compute_pipelines.clear();
        self.render_passes.clear();
        self.binding_layouts.clear();
        self.shaders.clear();
        self.samplers.clear();
        self.rasterization.clear();
        self.blend.clear();
        self.depth_stencil.clear();
    }
}

impl Drop for ResourcePoolRegistry {
    fn drop(&mut self) {
        self.clear();
        debug!("Resource pool registry destroyed");
    }
}
