//! Full-screen quad geometry with rotation applied to texture coordinates

use crate::orientation::Rotation;

/// Clip-space corners in triangle-strip order
pub const QUAD_POSITIONS: [[f32; 2]; 4] = [[-1.0, -1.0], [1.0, -1.0], [-1.0, 1.0], [1.0, 1.0]];

/// Unrotated texture coordinates matching `QUAD_POSITIONS`
pub const QUAD_TEX_COORDS: [[f32; 2]; 4] = [[0.0, 1.0], [1.0, 1.0], [0.0, 0.0], [1.0, 0.0]];

/// Four-vertex triangle strip covering the whole target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quad {
    pub positions: [[f32; 2]; 4],
    pub tex_coords: [[f32; 2]; 4],
}

/// One clockwise quarter turn of the sampled image
#[inline]
fn rotate_uv([u, v]: [f32; 2]) -> [f32; 2] {
    [v, 1.0 - u]
}

impl Quad {
    pub const VERTEX_COUNT: u32 = 4;

    pub fn full_screen(rotation: Rotation) -> Self {
        let mut tex_coords = QUAD_TEX_COORDS;
        for _ in 0..rotation.quarter_turns() {
            tex_coords = tex_coords.map(rotate_uv);
        }
        Self {
            positions: QUAD_POSITIONS,
            tex_coords,
        }
    }
}
