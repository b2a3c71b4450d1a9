//! CPU-side data the renderer uploads.

use bytemuck::{Pod, Zeroable};

// ── per-object constants ──────────────────────────────────────────────────

/// Shader constants for one object slot.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct ObjectConstants {
    pub world_view_proj: [[f32; 4]; 4],
}

impl ObjectConstants {
    pub const IDENTITY: ObjectConstants = ObjectConstants {
        world_view_proj: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };
}

impl Default for ObjectConstants {
    fn default() -> Self {
        Self::IDENTITY
    }
}

// ── geometry ──────────────────────────────────────────────────────────────

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
}

/// The static triangle, in clip space.
pub const TRIANGLE: [Vertex; 3] = [
    Vertex {
        position: [0.0, 0.25, 0.0],
        color: [1.0, 0.0, 0.0, 1.0],
    },
    Vertex {
        position: [0.25, -0.25, 0.0],
        color: [0.0, 1.0, 0.0, 1.0],
    },
    Vertex {
        position: [-0.25, -0.25, 0.0],
        color: [0.0, 0.0, 1.0, 1.0],
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_match_shader_expectations() {
        assert_eq!(size_of::<Vertex>(), 28);
        assert_eq!(size_of::<ObjectConstants>(), 64);
        assert_eq!(bytemuck::cast_slice::<Vertex, u8>(&TRIANGLE).len(), 84);
    }
}
