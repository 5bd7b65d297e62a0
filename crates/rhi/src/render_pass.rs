//! Render passes, subpass graphs and their framebuffers.
//!
//! # Overview
//!
//! - [`RenderPassDesc`] lists the logical [`Attachment`]s, the [`Subpass`]es
//!   referencing them and how subpasses are ordered
//! - [`RenderPass`] is the native render pass plus the one framebuffer bound to
//!   the attachment views, built by [`RenderPass::build`]
//!
//! A render pass holds only weak references to its attachment textures. When
//! any of them is destroyed or resized the pass reports
//! [`RenderPass::is_invalidated`] and must be rebuilt; the
//! [`ResourcePoolRegistry`](crate::registry::ResourcePoolRegistry) does this
//! transparently because the texture generation is part of the description hash.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use ember_rhi::render_pass::{Attachment, LoadStorePolicy, RenderPassDesc, Subpass};
//! use ember_rhi::resource::Texture;
//! use ember_rhi::types::ClearValue;
//!
//! # fn example(color: Arc<Texture>, depth: Arc<Texture>) {
//! let desc = RenderPassDesc::new(vk::Extent2D { width: 800, height: 600 })
//!     .attachment(Attachment::color(&color, LoadStorePolicy::ClearStore, ClearValue::BLACK))
//!     .attachment(Attachment::depth(&depth, LoadStorePolicy::ClearDontCare, ClearValue::DEPTH_ONE))
//!     .subpass(Subpass::new().color(0).depth(1));
//! # }
//! ```

use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use ash::vk;
use tracing::debug;

use crate::barrier;
use crate::command::CommandBuffer;
use crate::deferred::DeferredDeletionQueue;
use crate::device::GpuDevice;
use crate::error::{RhiError, RhiResult};
use crate::resource::{ResourceState, Texture};
use crate::types::{ClearValue, RenderPassBegin, is_depth_format};

/// Load and store operations of one aspect of an attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadStorePolicy {
    ClearStore,
    ClearDontCare,
    LoadStore,
    LoadDontCare,
    DontCareStore,
    DontCareDontCare,
}

impl LoadStorePolicy {
    pub fn load_op(self) -> vk::AttachmentLoadOp {
        match self {
            LoadStorePolicy::ClearStore | LoadStorePolicy::ClearDontCare => {
                vk::AttachmentLoadOp::CLEAR
            }
            LoadStorePolicy::LoadStore | LoadStorePolicy::LoadDontCare => {
                vk::AttachmentLoadOp::LOAD
            }
            LoadStorePolicy::DontCareStore | LoadStorePolicy::DontCareDontCare => {
                vk::AttachmentLoadOp::DONT_CARE
            }
        }
    }

    pub fn store_op(self) -> vk::AttachmentStoreOp {
        match self {
            LoadStorePolicy::ClearStore
            | LoadStorePolicy::LoadStore
            | LoadStorePolicy::DontCareStore => vk::AttachmentStoreOp::STORE,
            _ => vk::AttachmentStoreOp::DONT_CARE,
        }
    }

    /// Whether previous contents are read.
    pub fn loads(self) -> bool {
        matches!(self, LoadStorePolicy::LoadStore | LoadStorePolicy::LoadDontCare)
    }
}

/// A logical attachment of a render pass.
#[derive(Clone, Debug)]
pub struct Attachment {
    pub texture: Arc<Texture>,
    /// Policy for the color aspect, or the depth aspect of depth formats.
    pub color_policy: LoadStorePolicy,
    pub stencil_policy: LoadStorePolicy,
    pub clear: ClearValue,
    pub initial_state: ResourceState,
    pub final_state: ResourceState,
}

impl Attachment {
    /// Color target, left readable by shaders after the pass.
    pub fn color(texture: &Arc<Texture>, policy: LoadStorePolicy, clear: ClearValue) -> Self {
        Self {
            texture: Arc::clone(texture),
            color_policy: policy,
            stencil_policy: LoadStorePolicy::DontCareDontCare,
            clear,
            initial_state: if policy.loads() {
                ResourceState::ColorAttachment
            } else {
                ResourceState::Undefined
            },
            final_state: ResourceState::ShaderReadOnly,
        }
    }

    /// Swapchain image, ready for presentation after the pass.
    pub fn present(texture: &Arc<Texture>, policy: LoadStorePolicy, clear: ClearValue) -> Self {
        Self {
            final_state: ResourceState::Present,
            ..Self::color(texture, policy, clear)
        }
    }

    /// Depth (and stencil) target.
    pub fn depth(texture: &Arc<Texture>, policy: LoadStorePolicy, clear: ClearValue) -> Self {
        Self {
            texture: Arc::clone(texture),
            color_policy: policy,
            stencil_policy: LoadStorePolicy::DontCareDontCare,
            clear,
            initial_state: if policy.loads() {
                ResourceState::DepthStencilAttachment
            } else {
                ResourceState::Undefined
            },
            final_state: ResourceState::DepthStencilAttachment,
        }
    }

    pub fn with_stencil(mut self, policy: LoadStorePolicy) -> Self {
        self.stencil_policy = policy;
        self
    }

    pub fn with_states(mut self, initial: ResourceState, final_state: ResourceState) -> Self {
        self.initial_state = initial;
        self.final_state = final_state;
        self
    }

    pub fn with_final_state(mut self, final_state: ResourceState) -> Self {
        self.final_state = final_state;
        self
    }
}

impl Hash for Attachment {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.texture.id().hash(state);
        self.texture.generation().hash(state);
        self.texture.format().hash(state);
        self.texture.samples().hash(state);
        self.color_policy.hash(state);
        self.stencil_policy.hash(state);
        self.clear.hash(state);
        self.initial_state.hash(state);
        self.final_state.hash(state);
    }
}

/// Attachment indices used by one subpass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Subpass {
    pub inputs: Vec<u32>,
    pub colors: Vec<u32>,
    pub depth: Option<u32>,
    /// One resolve target per color attachment, or none.
    pub resolves: Vec<u32>,
}

impl Subpass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, attachment: u32) -> Self {
        self.inputs.push(attachment);
        self
    }

    pub fn color(mut self, attachment: u32) -> Self {
        self.colors.push(attachment);
        self
    }

    pub fn depth(mut self, attachment: u32) -> Self {
        self.depth = Some(attachment);
        self
    }

    pub fn resolve(mut self, attachment: u32) -> Self {
        self.resolves.push(attachment);
        self
    }
}

/// Execution ordering between subpasses.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum SubpassOrdering {
    /// Subpass `i` depends on subpass `i - 1`.
    #[default]
    Linear,
    /// Caller-supplied `(src, dst)` edges. `src < dst` keeps the graph acyclic.
    Explicit(Vec<(u32, u32)>),
}

/// Endpoint of a subpass dependency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubpassRef {
    External,
    Index(u32),
}

impl SubpassRef {
    pub fn to_vk(self) -> u32 {
        match self {
            SubpassRef::External => vk::SUBPASS_EXTERNAL,
            SubpassRef::Index(index) => index,
        }
    }
}

/// An execution and memory dependency between two subpasses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubpassDependency {
    pub src: SubpassRef,
    pub dst: SubpassRef,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub by_region: bool,
}

const ATTACHMENT_WRITE_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT.as_raw()
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS.as_raw()
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS.as_raw(),
);

const ATTACHMENT_WRITES: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
);

const ATTACHMENT_READS: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::INPUT_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags::COLOR_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ.as_raw(),
);

impl SubpassDependency {
    /// Later subpass reads or overwrites what an earlier one wrote.
    fn internal(src: u32, dst: u32) -> Self {
        Self {
            src: SubpassRef::Index(src),
            dst: SubpassRef::Index(dst),
            src_stage: ATTACHMENT_WRITE_STAGES,
            dst_stage: ATTACHMENT_WRITE_STAGES | vk::PipelineStageFlags::FRAGMENT_SHADER,
            src_access: ATTACHMENT_WRITES,
            dst_access: ATTACHMENT_WRITES | ATTACHMENT_READS,
            by_region: true,
        }
    }

    /// Serializes the first subpass against earlier use of the attachments.
    fn from_external(first: u32) -> Self {
        Self {
            src: SubpassRef::External,
            dst: SubpassRef::Index(first),
            src_stage: ATTACHMENT_WRITE_STAGES | vk::PipelineStageFlags::FRAGMENT_SHADER,
            dst_stage: ATTACHMENT_WRITE_STAGES,
            src_access: ATTACHMENT_WRITES,
            dst_access: ATTACHMENT_WRITES | ATTACHMENT_READS,
            by_region: false,
        }
    }

    /// Makes the last subpass's writes visible to later use of the attachments.
    fn to_external(last: u32) -> Self {
        Self {
            src: SubpassRef::Index(last),
            dst: SubpassRef::External,
            src_stage: ATTACHMENT_WRITE_STAGES,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::TRANSFER
                | vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            src_access: ATTACHMENT_WRITES,
            dst_access: vk::AccessFlags::SHADER_READ | vk::AccessFlags::TRANSFER_READ,
            by_region: false,
        }
    }
}

/// Everything needed to build a [`RenderPass`].
#[derive(Clone, Debug)]
pub struct RenderPassDesc {
    pub attachments: Vec<Attachment>,
    pub subpasses: Vec<Subpass>,
    pub ordering: SubpassOrdering,
    pub offset: vk::Offset2D,
    pub extent: vk::Extent2D,
}

impl RenderPassDesc {
    pub fn new(extent: vk::Extent2D) -> Self {
        Self {
            attachments: Vec::new(),
            subpasses: Vec::new(),
            ordering: SubpassOrdering::Linear,
            offset: vk::Offset2D::default(),
            extent,
        }
    }

    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn subpass(mut self, subpass: Subpass) -> Self {
        self.subpasses.push(subpass);
        self
    }

    pub fn ordering(mut self, ordering: SubpassOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn offset(mut self, offset: vk::Offset2D) -> Self {
        self.offset = offset;
        self
    }

    /// Extent of the framebuffer: the render area plus its offset.
    pub fn framebuffer_extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width + self.offset.x.max(0) as u32,
            height: self.extent.height + self.offset.y.max(0) as u32,
        }
    }

    fn validate(&self) -> RhiResult<()> {
        let fail = |msg: String| Err(RhiError::RenderPassError(msg));
        let count = self.attachments.len() as u32;

        if self.subpasses.is_empty() {
            return fail("render pass has no subpasses".into());
        }
        if self.extent.width == 0 || self.extent.height == 0 {
            return fail("render pass extent is empty".into());
        }
        if self.offset.x < 0 || self.offset.y < 0 {
            return fail("render pass offset is negative".into());
        }

        let framebuffer = self.framebuffer_extent();
        for attachment in &self.attachments {
            let texture = &attachment.texture;
            if texture.is_destroyed() {
                return fail(format!("attachment '{}' is destroyed", texture.name()));
            }
            let extent = texture.extent();
            if extent.width < framebuffer.width || extent.height < framebuffer.height {
                return fail(format!(
                    "attachment '{}' ({}x{}) is smaller than the framebuffer ({}x{})",
                    texture.name(),
                    extent.width,
                    extent.height,
                    framebuffer.width,
                    framebuffer.height
                ));
            }
        }

        let presents = self
            .attachments
            .iter()
            .any(|a| a.final_state == ResourceState::Present);
        let mut referenced = vec![false; self.attachments.len()];
        for (index, subpass) in self.subpasses.iter().enumerate() {
            let all = subpass
                .inputs
                .iter()
                .chain(&subpass.colors)
                .chain(subpass.depth.iter())
                .chain(&subpass.resolves);
            for &attachment in all {
                if attachment >= count {
                    return fail(format!(
                        "subpass {} references attachment {} of {}",
                        index, attachment, count
                    ));
                }
                referenced[attachment as usize] = true;
            }

            for &color in &subpass.colors {
                if is_depth_format(self.attachments[color as usize].texture.format()) {
                    return fail(format!("subpass {} uses depth attachment {} as color", index, color));
                }
            }
            if let Some(depth) = subpass.depth
                && !is_depth_format(self.attachments[depth as usize].texture.format())
            {
                return fail(format!("subpass {} uses color attachment {} as depth", index, depth));
            }

            let mut samples = subpass
                .colors
                .iter()
                .chain(subpass.depth.iter())
                .map(|&a| self.attachments[a as usize].texture.samples());
            if let Some(first) = samples.next()
                && samples.any(|s| s != first)
            {
                return fail(format!("subpass {} mixes sample counts", index));
            }

            let multisampled = subpass
                .colors
                .iter()
                .any(|&a| self.attachments[a as usize].texture.samples() > 1);
            if presents && multisampled && subpass.resolves.is_empty() {
                return fail(format!(
                    "subpass {} renders multisampled color for presentation without a resolve target",
                    index
                ));
            }

            if !subpass.resolves.is_empty() {
                if subpass.resolves.len() != subpass.colors.len() {
                    return fail(format!(
                        "subpass {} has {} resolve targets for {} color attachments",
                        index,
                        subpass.resolves.len(),
                        subpass.colors.len()
                    ));
                }
                for (&color, &resolve) in subpass.colors.iter().zip(&subpass.resolves) {
                    let source = &self.attachments[color as usize].texture;
                    let target = &self.attachments[resolve as usize].texture;
                    if source.samples() <= 1 || target.samples() != 1 {
                        return fail(format!(
                            "subpass {} resolves attachment {} ({} samples) into {} ({} samples)",
                            index,
                            color,
                            source.samples(),
                            resolve,
                            target.samples()
                        ));
                    }
                }
            }
        }

        if let Some(unused) = referenced.iter().position(|used| !used) {
            return fail(format!("attachment {} is not referenced by any subpass", unused));
        }

        for (index, attachment) in self.attachments.iter().enumerate() {
            let index = index as u32;
            let written = self
                .subpasses
                .iter()
                .any(|s| s.colors.contains(&index) || s.resolves.contains(&index));
            if attachment.final_state == ResourceState::Present && !written {
                return fail(format!(
                    "presented attachment {} is never written as color or resolve target",
                    index
                ));
            }
        }

        if let SubpassOrdering::Explicit(edges) = &self.ordering {
            let subpasses = self.subpasses.len() as u32;
            for &(src, dst) in edges {
                if src >= dst || dst >= subpasses {
                    return fail(format!(
                        "invalid subpass edge {} -> {} ({} subpasses)",
                        src, dst, subpasses
                    ));
                }
            }
        }
        Ok(())
    }

    /// Internal edges plus the two boundary edges.
    pub fn dependencies(&self) -> Vec<SubpassDependency> {
        let last = self.subpasses.len().saturating_sub(1) as u32;
        let mut dependencies = vec![SubpassDependency::from_external(0)];
        match &self.ordering {
            SubpassOrdering::Linear => {
                dependencies.extend((1..=last).map(|dst| SubpassDependency::internal(dst - 1, dst)));
            }
            SubpassOrdering::Explicit(edges) => {
                dependencies.extend(
                    edges
                        .iter()
                        .map(|&(src, dst)| SubpassDependency::internal(src, dst)),
                );
            }
        }
        dependencies.push(SubpassDependency::to_external(last));
        dependencies
    }

    /// Native description consumed by [`GpuDevice::create_render_pass`].
    pub fn layout(&self) -> RenderPassLayout {
        let attachments = self
            .attachments
            .iter()
            .map(|attachment| AttachmentLayout {
                format: attachment.texture.format(),
                samples: attachment.texture.samples(),
                load_op: attachment.color_policy.load_op(),
                store_op: attachment.color_policy.store_op(),
                stencil_load_op: attachment.stencil_policy.load_op(),
                stencil_store_op: attachment.stencil_policy.store_op(),
                initial_layout: attachment.initial_state.layout(),
                final_layout: attachment.final_state.layout(),
            })
            .collect();

        let reference = |attachment: u32, layout: vk::ImageLayout| AttachmentReference {
            attachment,
            layout,
        };
        let read_layout = |attachment: u32| {
            if is_depth_format(self.attachments[attachment as usize].texture.format()) {
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
            } else {
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            }
        };

        let subpasses = self
            .subpasses
            .iter()
            .map(|subpass| SubpassLayout {
                inputs: subpass
                    .inputs
                    .iter()
                    .map(|&a| reference(a, read_layout(a)))
                    .collect(),
                colors: subpass
                    .colors
                    .iter()
                    .map(|&a| reference(a, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
                    .collect(),
                depth: subpass
                    .depth
                    .map(|a| reference(a, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)),
                resolves: subpass
                    .resolves
                    .iter()
                    .map(|&a| reference(a, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
                    .collect(),
            })
            .collect();

        RenderPassLayout {
            attachments,
            subpasses,
            dependencies: self.dependencies(),
        }
    }
}

impl Hash for RenderPassDesc {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.attachments.hash(state);
        self.subpasses.hash(state);
        self.ordering.hash(state);
        (self.offset.x, self.offset.y).hash(state);
        (self.extent.width, self.extent.height).hash(state);
    }
}

/// Native description of one attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AttachmentLayout {
    pub format: vk::Format,
    pub samples: u32,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AttachmentReference {
    pub attachment: u32,
    pub layout: vk::ImageLayout,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubpassLayout {
    pub inputs: Vec<AttachmentReference>,
    pub colors: Vec<AttachmentReference>,
    pub depth: Option<AttachmentReference>,
    pub resolves: Vec<AttachmentReference>,
}

/// Native render pass description.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RenderPassLayout {
    pub attachments: Vec<AttachmentLayout>,
    pub subpasses: Vec<SubpassLayout>,
    pub dependencies: Vec<SubpassDependency>,
}

struct TrackedAttachment {
    texture: Weak<Texture>,
    generation: u64,
    initial_state: ResourceState,
    final_state: ResourceState,
}

/// A built render pass with its framebuffer.
pub struct RenderPass {
    device: Arc<dyn GpuDevice>,
    deletion: Arc<DeferredDeletionQueue>,
    hash: u64,
    handle: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    attachments: Vec<TrackedAttachment>,
    clear_values: Vec<ClearValue>,
    layout: RenderPassLayout,
    offset: vk::Offset2D,
    extent: vk::Extent2D,
}

impl RenderPass {
    /// Validates `desc`, creates the native render pass and one framebuffer
    /// over the attachment views.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::RenderPassError`] for invalid attachment references,
    /// sample mismatches, bad resolve targets, cyclic or out-of-range edges and
    /// attachments smaller than the framebuffer.
    pub fn build(
        device: Arc<dyn GpuDevice>,
        deletion: Arc<DeferredDeletionQueue>,
        desc: &RenderPassDesc,
        hash: u64,
    ) -> RhiResult<Self> {
        desc.validate()?;

        let layout = desc.layout();
        let handle = device.create_render_pass(&layout)?;

        let views: Vec<vk::ImageView> = desc.attachments.iter().map(|a| a.texture.view()).collect();
        let framebuffer = match device.create_framebuffer(handle, &views, desc.framebuffer_extent()) {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                device.destroy_render_pass(handle);
                return Err(err);
            }
        };

        debug!(
            "Built render pass {:016x}: {} attachment(s), {} subpass(es), {}x{}",
            hash,
            desc.attachments.len(),
            desc.subpasses.len(),
            desc.extent.width,
            desc.extent.height
        );

        Ok(Self {
            device,
            deletion,
            hash,
            handle,
            framebuffer,
            attachments: desc
                .attachments
                .iter()
                .map(|a| TrackedAttachment {
                    texture: Arc::downgrade(&a.texture),
                    generation: a.texture.generation(),
                    initial_state: a.initial_state,
                    final_state: a.final_state,
                })
                .collect(),
            clear_values: desc.attachments.iter().map(|a| a.clear).collect(),
            layout,
            offset: desc.offset,
            extent: desc.extent,
        })
    }

    /// Whether an attachment was dropped, destroyed or resized since the build.
    pub fn is_invalidated(&self) -> bool {
        self.attachments.iter().any(|tracked| match tracked.texture.upgrade() {
            Some(texture) => texture.is_destroyed() || texture.generation() != tracked.generation,
            None => true,
        })
    }

    /// Whether any attachment is a swapchain image.
    pub fn targets_swapchain(&self) -> bool {
        self.attachments.iter().any(|tracked| {
            tracked
                .texture
                .upgrade()
                .is_some_and(|texture| texture.is_swapchain_image())
        })
    }

    /// Begins the pass on `cmd`. Attachments that load their contents are
    /// first transitioned into their declared initial state.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::RenderPassError`] if the pass is invalidated.
    pub fn begin_render_pass(&self, cmd: &mut CommandBuffer) -> RhiResult<()> {
        let textures = self.live_attachments()?;
        for (tracked, texture) in self.attachments.iter().zip(&textures) {
            if tracked.initial_state != ResourceState::Undefined {
                barrier::transition_texture(cmd, texture, tracked.initial_state);
            }
        }

        cmd.device().cmd_begin_render_pass(
            cmd.handle(),
            &RenderPassBegin {
                render_pass: self.handle,
                framebuffer: self.framebuffer,
                area: vk::Rect2D {
                    offset: self.offset,
                    extent: self.extent,
                },
                clear_values: self.clear_values.clone(),
            },
        );
        Ok(())
    }

    pub fn next_subpass(&self, cmd: &mut CommandBuffer) {
        cmd.device().cmd_next_subpass(cmd.handle());
    }

    /// Ends the pass and records every attachment's final state.
    pub fn end_render_pass(&self, cmd: &mut CommandBuffer) {
        cmd.device().cmd_end_render_pass(cmd.handle());
        for tracked in &self.attachments {
            if let Some(texture) = tracked.texture.upgrade() {
                texture.set_state(tracked.final_state);
            }
        }
    }

    fn live_attachments(&self) -> RhiResult<Vec<Arc<Texture>>> {
        if self.is_invalidated() {
            return Err(RhiError::RenderPassError(format!(
                "render pass {:016x} is invalidated and must be rebuilt",
                self.hash
            )));
        }
        self.attachments
            .iter()
            .map(|tracked| {
                tracked.texture.upgrade().ok_or_else(|| {
                    RhiError::RenderPassError("render pass attachment was dropped".into())
                })
            })
            .collect()
    }

    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    #[inline]
    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    #[inline]
    pub fn framebuffer(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn offset(&self) -> vk::Offset2D {
        self.offset
    }

    pub fn layout(&self) -> &RenderPassLayout {
        &self.layout
    }

    pub fn subpass_count(&self) -> u32 {
        self.layout.subpasses.len() as u32
    }

    /// Number of color attachments written by `subpass`.
    pub fn color_count(&self, subpass: u32) -> usize {
        self.layout
            .subpasses
            .get(subpass as usize)
            .map_or(0, |s| s.colors.len())
    }

    /// Sample count of the attachments written by `subpass`.
    pub fn sample_count(&self, subpass: u32) -> u32 {
        self.layout
            .subpasses
            .get(subpass as usize)
            .and_then(|s| s.colors.first().or(s.depth.as_ref()))
            .map_or(1, |r| self.layout.attachments[r.attachment as usize].samples)
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        let device = Arc::clone(&self.device);
        let (render_pass, framebuffer) = (self.handle, self.framebuffer);
        self.deletion.defer(move || {
            device.destroy_framebuffer(framebuffer);
            device.destroy_render_pass(render_pass);
        });
    }
}

impl std::fmt::Debug for RenderPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPass")
            .field("hash", &format_args!("{:016x}", self.hash))
            .field("handle", &self.handle)
            .field("extent", &(self.extent.width, self.extent.height))
            .field("subpasses", &self.layout.subpasses.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_ops() {
        assert_eq!(LoadStorePolicy::ClearStore.load_op(), vk::AttachmentLoadOp::CLEAR);
        assert_eq!(LoadStorePolicy::ClearStore.store_op(), vk::AttachmentStoreOp::STORE);
        assert_eq!(
            LoadStorePolicy::ClearDontCare.store_op(),
            vk::AttachmentStoreOp::DONT_CARE
        );
        assert_eq!(LoadStorePolicy::LoadDontCare.load_op(), vk::AttachmentLoadOp::LOAD);
        assert!(LoadStorePolicy::LoadStore.loads());
        assert!(!LoadStorePolicy::DontCareStore.loads());
    }

    #[test]
    fn test_subpass_ref_to_vk() {
        assert_eq!(SubpassRef::External.to_vk(), vk::SUBPASS_EXTERNAL);
        assert_eq!(SubpassRef::Index(2).to_vk(), 2);
    }

    #[test]
    fn test_internal_dependency_covers_input_reads() {
        let dep = SubpassDependency::internal(0, 1);
        assert!(dep.dst_access.contains(vk::AccessFlags::INPUT_ATTACHMENT_READ));
        assert!(dep.dst_stage.contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
        assert!(dep.by_region);
    }
}
