//! Rasterization, blend and depth-stencil state descriptions.
//!
//! These have no native object of their own in Vulkan; they are baked into
//! pipelines. They are still cached by hash so that pipeline descriptions
//! can reference them by identity and hash cheaply.

use std::hash::{Hash, Hasher};

use ash::vk;

/// Primitive topology for input assembly.
///
/// Defines how vertices are assembled into primitives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    /// Independent points.
    PointList,
    /// Independent lines.
    LineList,
    /// Connected lines with each vertex after the first starting a new line.
    LineStrip,
    /// Independent triangles.
    #[default]
    TriangleList,
    /// Connected triangles with shared edges.
    TriangleStrip,
    /// Triangles with shared first vertex (fan).
    TriangleFan,
}

impl PrimitiveTopology {
    /// Converts to Vulkan primitive topology.
    pub fn to_vk(self) -> vk::PrimitiveTopology {
        match self {
            PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
            PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
            PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            PrimitiveTopology::TriangleFan => vk::PrimitiveTopology::TRIANGLE_FAN,
        }
    }
}

/// Polygon rasterization mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
    Point,
}

impl PolygonMode {
    pub fn to_vk(self) -> vk::PolygonMode {
        match self {
            PolygonMode::Fill => vk::PolygonMode::FILL,
            PolygonMode::Line => vk::PolygonMode::LINE,
            PolygonMode::Point => vk::PolygonMode::POINT,
        }
    }
}

/// Face culling mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
    FrontAndBack,
}

impl CullMode {
    pub fn to_vk(self) -> vk::CullModeFlags {
        match self {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::Back => vk::CullModeFlags::BACK,
            CullMode::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
        }
    }
}

/// Front face winding order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

impl FrontFace {
    pub fn to_vk(self) -> vk::FrontFace {
        match self {
            FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
            FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
        }
    }
}

/// Comparison used by depth, stencil and sampler compare.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    #[default]
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

impl CompareOp {
    pub fn to_vk(self) -> vk::CompareOp {
        match self {
            CompareOp::Never => vk::CompareOp::NEVER,
            CompareOp::Less => vk::CompareOp::LESS,
            CompareOp::Equal => vk::CompareOp::EQUAL,
            CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
            CompareOp::Greater => vk::CompareOp::GREATER,
            CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
            CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
            CompareOp::Always => vk::CompareOp::ALWAYS,
        }
    }
}

/// Blend factor for color blending.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    ConstantColor,
    OneMinusConstantColor,
}

impl BlendFactor {
    pub fn to_vk(self) -> vk::BlendFactor {
        match self {
            BlendFactor::Zero => vk::BlendFactor::ZERO,
            BlendFactor::One => vk::BlendFactor::ONE,
            BlendFactor::SrcColor => vk::BlendFactor::SRC_COLOR,
            BlendFactor::OneMinusSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
            BlendFactor::DstColor => vk::BlendFactor::DST_COLOR,
            BlendFactor::OneMinusDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
            BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
            BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
            BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
            BlendFactor::ConstantColor => vk::BlendFactor::CONSTANT_COLOR,
            BlendFactor::OneMinusConstantColor => vk::BlendFactor::ONE_MINUS_CONSTANT_COLOR,
        }
    }
}

/// Blend operation for color blending.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

impl BlendOp {
    pub fn to_vk(self) -> vk::BlendOp {
        match self {
            BlendOp::Add => vk::BlendOp::ADD,
            BlendOp::Subtract => vk::BlendOp::SUBTRACT,
            BlendOp::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
            BlendOp::Min => vk::BlendOp::MIN,
            BlendOp::Max => vk::BlendOp::MAX,
        }
    }
}

/// Blend configuration of one color attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ColorBlendAttachment {
    pub blend_enable: bool,
    pub src_color_blend_factor: BlendFactor,
    pub dst_color_blend_factor: BlendFactor,
    pub color_blend_op: BlendOp,
    pub src_alpha_blend_factor: BlendFactor,
    pub dst_alpha_blend_factor: BlendFactor,
    pub alpha_blend_op: BlendOp,
    pub color_write_mask: vk::ColorComponentFlags,
}

impl Default for ColorBlendAttachment {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color_blend_factor: BlendFactor::One,
            dst_color_blend_factor: BlendFactor::Zero,
            color_blend_op: BlendOp::Add,
            src_alpha_blend_factor: BlendFactor::One,
            dst_alpha_blend_factor: BlendFactor::Zero,
            alpha_blend_op: BlendOp::Add,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }
    }
}

impl ColorBlendAttachment {
    /// Standard alpha blending: `src * src_alpha + dst * (1 - src_alpha)`.
    pub fn alpha_blend() -> Self {
        Self {
            blend_enable: true,
            src_color_blend_factor: BlendFactor::SrcAlpha,
            dst_color_blend_factor: BlendFactor::OneMinusSrcAlpha,
            ..Self::default()
        }
    }

    pub fn to_vk(&self) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(self.blend_enable)
            .src_color_blend_factor(self.src_color_blend_factor.to_vk())
            .dst_color_blend_factor(self.dst_color_blend_factor.to_vk())
            .color_blend_op(self.color_blend_op.to_vk())
            .src_alpha_blend_factor(self.src_alpha_blend_factor.to_vk())
            .dst_alpha_blend_factor(self.dst_alpha_blend_factor.to_vk())
            .alpha_blend_op(self.alpha_blend_op.to_vk())
            .color_write_mask(self.color_write_mask)
    }
}

/// Constant, clamp and slope-scaled depth bias.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthBias {
    pub constant_factor: f32,
    pub clamp: f32,
    pub slope_factor: f32,
}

/// Rasterizer and multisample state.
#[derive(Clone, Debug, PartialEq)]
pub struct RasterizationStateDesc {
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_clamp: bool,
    pub depth_bias: Option<DepthBias>,
    pub line_width: f32,
    pub sample_count: u32,
    /// Minimum sample shading fraction; `None` disables sample shading.
    pub sample_shading: Option<f32>,
    pub alpha_to_coverage: bool,
}

impl Default for RasterizationStateDesc {
    fn default() -> Self {
        Self {
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            depth_clamp: false,
            depth_bias: None,
            line_width: 1.0,
            sample_count: 1,
            sample_shading: None,
            alpha_to_coverage: false,
        }
    }
}

impl Hash for RasterizationStateDesc {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.polygon_mode.hash(state);
        self.cull_mode.hash(state);
        self.front_face.hash(state);
        self.depth_clamp.hash(state);
        self.depth_bias
            .map(|b| [b.constant_factor.to_bits(), b.clamp.to_bits(), b.slope_factor.to_bits()])
            .hash(state);
        self.line_width.to_bits().hash(state);
        self.sample_count.hash(state);
        self.sample_shading.map(f32::to_bits).hash(state);
        self.alpha_to_coverage.hash(state);
    }
}

/// Color blend state for every color attachment of a subpass.
#[derive(Clone, Debug, PartialEq)]
pub struct BlendStateDesc {
    pub attachments: Vec<ColorBlendAttachment>,
    pub constants: [f32; 4],
}

impl BlendStateDesc {
    /// Blending disabled on `count` attachments.
    pub fn opaque(count: usize) -> Self {
        Self {
            attachments: vec![ColorBlendAttachment::default(); count],
            constants: [0.0; 4],
        }
    }
}

impl Hash for BlendStateDesc {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.attachments.hash(state);
        self.constants.map(f32::to_bits).hash(state);
    }
}

/// Stencil operations for one face.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StencilFace {
    pub fail_op: vk::StencilOp,
    pub pass_op: vk::StencilOp,
    pub depth_fail_op: vk::StencilOp,
    pub compare_op: CompareOp,
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
}

impl StencilFace {
    pub fn to_vk(&self) -> vk::StencilOpState {
        vk::StencilOpState::default()
            .fail_op(self.fail_op)
            .pass_op(self.pass_op)
            .depth_fail_op(self.depth_fail_op)
            .compare_op(self.compare_op.to_vk())
            .compare_mask(self.compare_mask)
            .write_mask(self.write_mask)
            .reference(self.reference)
    }
}

/// Depth and stencil test state.
#[derive(Clone, Debug, PartialEq)]
pub struct DepthStencilStateDesc {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare_op: CompareOp,
    /// Depth bounds test range; `None` disables the test.
    pub depth_bounds: Option<[f32; 2]>,
    /// Front and back stencil faces; `None` disables stencil testing.
    pub stencil: Option<(StencilFace, StencilFace)>,
}

impl DepthStencilStateDesc {
    /// Depth test and write with `LESS`.
    pub fn depth_less() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            compare_op: CompareOp::Less,
            depth_bounds: None,
            stencil: None,
        }
    }

    /// No depth or stencil testing.
    pub fn disabled() -> Self {
        Self {
            depth_test: false,
            depth_write: false,
            compare_op: CompareOp::Always,
            depth_bounds: None,
            stencil: None,
        }
    }
}

impl Hash for DepthStencilStateDesc {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.depth_test.hash(state);
        self.depth_write.hash(state);
        self.compare_op.hash(state);
        self.depth_bounds.map(|b| b.map(f32::to_bits)).hash(state);
        self.stencil.hash(state);
    }
}

/// A cached fixed-function state block.
#[derive(Debug)]
pub struct FixedFunctionState<D> {
    desc: D,
    hash: u64,
}

impl<D> FixedFunctionState<D> {
    pub(crate) fn new(desc: D, hash: u64) -> Self {
        Self { desc, hash }
    }

    #[inline]
    pub fn desc(&self) -> &D {
        &self.desc
    }

    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

pub type RasterizationState = FixedFunctionState<RasterizationStateDesc>;
pub type BlendState = FixedFunctionState<BlendStateDesc>;
pub type DepthStencilState = FixedFunctionState<DepthStencilStateDesc>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::description_hash;

    #[test]
    fn test_rasterization_hash_tracks_float_fields() {
        let base = RasterizationStateDesc::default();
        let biased = RasterizationStateDesc {
            depth_bias: Some(DepthBias {
                constant_factor: 1.25,
                clamp: 0.0,
                slope_factor: 1.75,
            }),
            ..base.clone()
        };
        let wide = RasterizationStateDesc {
            line_width: 2.0,
            ..base.clone()
        };
        assert_eq!(description_hash(&base), description_hash(&base.clone()));
        assert_ne!(description_hash(&base), description_hash(&biased));
        assert_ne!(description_hash(&base), description_hash(&wide));
    }

    #[test]
    fn test_blend_hash_tracks_attachments_and_constants() {
        let opaque = BlendStateDesc::opaque(1);
        let two = BlendStateDesc::opaque(2);
        let alpha = BlendStateDesc {
            attachments: vec![ColorBlendAttachment::alpha_blend()],
            constants: [0.0; 4],
        };
        let tinted = BlendStateDesc {
            constants: [0.5, 0.0, 0.0, 1.0],
            ..BlendStateDesc::opaque(1)
        };
        let hashes = [
            description_hash(&opaque),
            description_hash(&two),
            description_hash(&alpha),
            description_hash(&tinted),
        ];
        for i in 0..hashes.len() {
            for j in i + 1..hashes.len() {
                assert_ne!(hashes[i], hashes[j]);
            }
        }
    }

    #[test]
    fn test_depth_stencil_presets_differ() {
        assert_ne!(
            description_hash(&DepthStencilStateDesc::depth_less()),
            description_hash(&DepthStencilStateDesc::disabled())
        );
    }

    #[test]
    fn test_alpha_blend_to_vk() {
        let state = ColorBlendAttachment::alpha_blend().to_vk();
        assert_eq!(state.blend_enable, vk::TRUE);
        assert_eq!(state.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(state.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        assert_eq!(state.color_write_mask, vk::ColorComponentFlags::RGBA);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(PrimitiveTopology::TriangleList.to_vk(), vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(CullMode::None.to_vk(), vk::CullModeFlags::NONE);
        assert_eq!(FrontFace::Clockwise.to_vk(), vk::FrontFace::CLOCKWISE);
        assert_eq!(CompareOp::LessOrEqual.to_vk(), vk::CompareOp::LESS_OR_EQUAL);
        assert_eq!(PolygonMode::Line.to_vk(), vk::PolygonMode::LINE);
    }
}
