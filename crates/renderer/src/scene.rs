//! Drawable scene content.

use std::sync::Arc;

use ember_rhi::resource::Buffer;
use ember_rhi::{RhiContext, RhiError, RhiResult};
use tracing::debug;

use crate::uniforms::{FrameUniforms, IDENTITY, Mat4, Vertex};

/// Indexed triangle geometry resident on the GPU.
pub struct Mesh {
    name: String,
    vertex_buffer: Arc<Buffer>,
    index_buffer: Arc<Buffer>,
    index_count: u32,
    /// Model matrix, pushed per draw.
    pub transform: Mat4,
}

impl Mesh {
    /// Uploads `vertices` and `indices` into device-local buffers.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidHandle`] if either slice is empty or an
    /// index points past the vertex data.
    pub fn upload(
        rhi: &RhiContext,
        name: &str,
        vertices: &[Vertex],
        indices: &[u32],
    ) -> RhiResult<Self> {
        if vertices.is_empty() || indices.is_empty() {
            return Err(RhiError::InvalidHandle(format!("mesh '{}' has no geometry", name)));
        }
        if let Some(&index) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(RhiError::InvalidHandle(format!(
                "mesh '{}' index {} out of range ({} vertices)",
                name,
                index,
                vertices.len()
            )));
        }

        let vertex_buffer =
            rhi.create_vertex_buffer(&format!("{} vertices", name), bytemuck::cast_slice(vertices))?;
        let index_buffer =
            rhi.create_index_buffer(&format!("{} indices", name), bytemuck::cast_slice(indices))?;
        debug!(
            "Uploaded mesh '{}': {} vertices, {} indices",
            name,
            vertices.len(),
            indices.len()
        );

        Ok(Self {
            name: name.to_string(),
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
            transform: IDENTITY,
        })
    }

    /// A unit cube centered at the origin with per-face normals.
    pub fn cube(rhi: &RhiContext) -> RhiResult<Self> {
        let (vertices, indices) = cube_geometry();
        Self::upload(rhi, "cube", &vertices, &indices)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertex_buffer(&self) -> &Buffer {
        &self.vertex_buffer
    }

    pub fn index_buffer(&self) -> &Buffer {
        &self.index_buffer
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}

/// What a [`RenderPipeline`](crate::RenderPipeline) draws each frame.
#[derive(Default)]
pub struct Scene {
    pub uniforms: FrameUniforms,
    pub clear_color: [f32; 4],
    meshes: Vec<Mesh>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mesh(&mut self, mesh: Mesh) {
        self.meshes.push(mesh);
    }

    pub fn meshes(&self) -> &[Mesh] {
        &self.meshes
    }

    pub fn meshes_mut(&mut self) -> &mut [Mesh] {
        &mut self.meshes
    }
}

fn cube_geometry() -> (Vec<Vertex>, Vec<u32>) {
    const FACES: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        // normal, u axis, v axis
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, u, v) in FACES {
        let base = vertices.len() as u32;
        for (su, sv) in [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)] {
            let position = std::array::from_fn(|i| normal[i] * 0.5 + u[i] * su + v[i] * sv);
            vertices.push(Vertex { position, normal });
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (vertices, indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_geometry() {
        let (vertices, indices) = cube_geometry();
        assert_eq!(vertices.len(), 24);
        assert_eq!(indices.len(), 36);
        assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));
        for vertex in &vertices {
            assert!(vertex.position.iter().all(|c| c.abs() <= 0.5 + f32::EPSILON));
        }
    }

    #[test]
    fn test_cube_faces_wind_counter_clockwise() {
        let (vertices, indices) = cube_geometry();
        for tri in indices.chunks_exact(3) {
            let [a, b, c] = [0, 1, 2].map(|k| vertices[tri[k] as usize].position);
            let e1 = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
            let e2 = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
            let cross = [
                e1[1] * e2[2] - e1[2] * e2[1],
                e1[2] * e2[0] - e1[0] * e2[2],
                e1[0] * e2[1] - e1[1] * e2[0],
            ];
            let normal = vertices[tri[0] as usize].normal;
            let dot: f32 = (0..3).map(|i| cross[i] * normal[i]).sum();
            assert!(dot > 0.0);
        }
    }
}
