//! Scene data drawn by every iteration.
//!
//! A yellow triangle on a blue background, or an octahedron whose faces are
//! tessellated and pushed out onto a sphere.

use crate::driver::{Extent, PipelineDesc, PolygonMode};
use crate::modes::TestMode;
use bytemuck::{Pod, Zeroable};

/// Size of the render target.
pub const RENDER_EXTENT: Extent = Extent::new(256, 256);

/// Clear colour of every iteration.
pub const CLEAR_COLOR: [f32; 4] = [0.125, 0.25, 0.75, 1.0];

/// Colour written by the fragment stage.
pub const DRAW_COLOR: [f32; 4] = [1.0, 1.0, 0.0, 1.0];

/// Tessellation level read by the sphere pipeline from its storage buffer.
pub const TESS_LEVEL: f32 = 16.0;

/// One vertex: a clip-space position.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 4],
}

const fn v(x: f32, y: f32, z: f32) -> Vertex {
    Vertex {
        position: [x, y, z, 1.0],
    }
}

/// Uniform block of the fragment stage.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ColorUniform {
    pub color: [f32; 4],
}

pub const TRIANGLE_VERTICES: [Vertex; 3] = [v(-0.5, -0.5, 0.0), v(0.5, -0.5, 0.0), v(0.0, 0.5, 0.0)];

pub const TRIANGLE_INDICES: [u32; 3] = [0, 1, 2];

pub const SPHERE_VERTICES: [Vertex; 6] = [
    v(0.0, 0.0, 1.0),
    v(0.0, 1.0, 0.0),
    v(1.0, 0.0, 0.0),
    v(0.0, 0.0, -1.0),
    v(0.0, -1.0, 0.0),
    v(-1.0, 0.0, 0.0),
];

pub const SPHERE_INDICES: [u32; 24] = [
    0, 1, 2, 2, 1, 3, 3, 1, 5, 5, 1, 0, 0, 2, 4, 2, 3, 4, 3, 5, 4, 5, 0, 4,
];

/// Which geometry an iteration draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneKind {
    Triangle,
    Sphere { line_fill: bool },
}

/// Geometry and pipeline state for one test mode.
#[derive(Debug, Clone, Copy)]
pub struct Scene {
    pub kind: SceneKind,
    pub vertices: &'static [Vertex],
    pub indices: &'static [u32],
}

impl Scene {
    pub fn for_mode(mode: TestMode) -> Self {
        if mode.tessellation() {
            Self {
                kind: SceneKind::Sphere {
                    line_fill: mode.line_fill(),
                },
                vertices: &SPHERE_VERTICES,
                indices: &SPHERE_INDICES,
            }
        } else {
            Self {
                kind: SceneKind::Triangle,
                vertices: &TRIANGLE_VERTICES,
                indices: &TRIANGLE_INDICES,
            }
        }
    }

    pub fn is_tessellated(&self) -> bool {
        matches!(self.kind, SceneKind::Sphere { .. })
    }

    pub fn pipeline(&self) -> PipelineDesc {
        match self.kind {
            SceneKind::Triangle => PipelineDesc::default(),
            SceneKind::Sphere { line_fill } => PipelineDesc {
                tessellated: true,
                polygon_mode: if line_fill {
                    PolygonMode::Line
                } else {
                    PolygonMode::Fill
                },
            },
        }
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    pub fn vertex_bytes(&self) -> &'static [u8] {
        bytemuck::cast_slice(self.vertices)
    }

    pub fn index_bytes(&self) -> &'static [u8] {
        bytemuck::cast_slice(self.indices)
    }
}

/// Bytes of the fragment uniform block.
pub fn color_bytes() -> Vec<u8> {
    bytemuck::bytes_of(&ColorUniform { color: DRAW_COLOR }).to_vec()
}

/// Bytes of the tessellation-level storage block.
pub fn tess_level_bytes() -> Vec<u8> {
    bytemuck::bytes_of(&TESS_LEVEL).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_for_mode() {
        let tri = Scene::for_mode(TestMode::SFR);
        assert_eq!(tri.kind, SceneKind::Triangle);
        assert_eq!(tri.index_count(), 3);
        assert!(!tri.pipeline().tessellated);

        let sphere = Scene::for_mode(TestMode::AFR | TestMode::TESSELLATION | TestMode::LINE_FILL);
        assert_eq!(sphere.kind, SceneKind::Sphere { line_fill: true });
        assert_eq!(sphere.index_count(), 24);
        assert_eq!(sphere.pipeline().polygon_mode, PolygonMode::Line);
    }

    #[test]
    fn test_byte_views() {
        let tri = Scene::for_mode(TestMode::SFR);
        assert_eq!(tri.vertex_bytes().len(), 3 * 16);
        assert_eq!(tri.index_bytes().len(), 12);
        assert_eq!(color_bytes().len(), 16);
        assert_eq!(tess_level_bytes(), 16.0f32.to_ne_bytes().to_vec());
    }

    #[test]
    fn test_sphere_indices_in_range() {
        assert!(SPHERE_INDICES
            .iter()
            .all(|&i| (i as usize) < SPHERE_VERTICES.len()));
        assert_eq!(SPHERE_INDICES.len() % 3, 0);
    }
}
