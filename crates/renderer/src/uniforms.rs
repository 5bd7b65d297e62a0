//! Shader-visible data layouts.
//!
//! Everything here is `#[repr(C)]` and `Pod` so it can be pushed into the
//! per-frame uniform ring or sent as push constants without copies.

use bytemuck::{Pod, Zeroable};

/// Column-major 4x4 matrix.
pub type Mat4 = [[f32; 4]; 4];

pub const IDENTITY: Mat4 = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Per-frame camera and light data, bound at set 0, binding 0.
///
/// # Memory Layout
///
/// - Offset 0: view-projection matrix (64 bytes)
/// - Offset 64: camera position + padding (16 bytes)
/// - Offset 80: light direction + intensity (16 bytes)
/// - Offset 96: light color + ambient (16 bytes)
/// - Total size: 112 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    pub view_projection: Mat4,
    pub camera_position: [f32; 4],
    /// xyz direction towards the light, w intensity.
    pub light_direction: [f32; 4],
    /// rgb color, a ambient term.
    pub light_color: [f32; 4],
}

impl FrameUniforms {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
}

impl Default for FrameUniforms {
    fn default() -> Self {
        Self {
            view_projection: IDENTITY,
            camera_position: [0.0, 0.0, 0.0, 1.0],
            light_direction: [0.0, 1.0, 0.0, 1.0],
            light_color: [1.0, 1.0, 1.0, 0.1],
        }
    }
}

/// Per-draw push constants.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct ObjectConstants {
    pub model: Mat4,
}

impl ObjectConstants {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

impl Default for ObjectConstants {
    fn default() -> Self {
        Self { model: IDENTITY }
    }
}

/// Interleaved mesh vertex: position then normal.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_uniforms_layout() {
        assert_eq!(FrameUniforms::SIZE, 112);
        assert_eq!(std::mem::align_of::<FrameUniforms>(), 4);
    }

    #[test]
    fn test_object_constants_fit_push_constant_minimum() {
        assert!(ObjectConstants::SIZE <= 128);
    }

    #[test]
    fn test_vertex_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 24);
    }
}
