//! Pipeline data types shared between component crates.

use glam::Vec4;

/// Index of the position attribute inside a vertex attribute array.
pub const POSITION_ATTRIBUTE: usize = 0;

/// Winding order that counts as front-facing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaceMode {
    Cw,
    Ccw,
}

/// One vertex: a variable-length set of 4-component attributes, position
/// first.
pub type VertexAttributes = Vec<Vec4>;

/// A transformed triangle on its way from primitive assembly to setup.
#[derive(Clone, Debug)]
pub struct TriangleSetupInput {
    /// Triangle identifier assigned by primitive assembly.
    pub id: u32,
    /// Attribute arrays of the three vertices.
    pub vertices: [VertexAttributes; 3],
    /// Marks the last triangle of the current batch.
    pub last_in_batch: bool,
}

impl TriangleSetupInput {
    pub fn new(id: u32, v1: VertexAttributes, v2: VertexAttributes, v3: VertexAttributes) -> Self {
        TriangleSetupInput {
            id,
            vertices: [v1, v2, v3],
            last_in_batch: false,
        }
    }

    /// Position attribute of vertex `v`.
    pub fn position(&self, v: usize) -> Vec4 {
        self.vertices[v][POSITION_ATTRIBUTE]
    }
}
