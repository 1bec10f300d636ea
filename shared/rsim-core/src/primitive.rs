//! Vertex, triangle and shader traffic packets.

use crate::stamp::{Quad, Stamp, TriangleId};

/// Attribute slots per vertex; slot 0 is the window-space position.
pub const MAX_VERTEX_ATTRIBUTES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub attributes: [Quad; MAX_VERTEX_ATTRIBUTES],
}

impl Vertex {
    /// Vertex at window position `(x, y)` with depth `z` in `[0, 1]`.
    pub fn at(x: f32, y: f32, z: f32) -> Self {
        let mut attributes = [[0.0; 4]; MAX_VERTEX_ATTRIBUTES];
        attributes[0] = [x, y, z, 1.0];
        Self { attributes }
    }

    pub fn with_attribute(mut self, slot: usize, value: Quad) -> Self {
        self.attributes[slot] = value;
        self
    }

    pub fn position(&self) -> Quad {
        self.attributes[0]
    }
}

/// A vertex travelling to or from the unified shader.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexInput {
    /// Index in the draw's vertex stream.
    pub index: u32,
    pub vertex: Vertex,
    pub last: bool,
}

/// Triangle handed from primitive assembly to setup. `vertices` is `None`
/// only for the end marker of an empty draw.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupInput {
    pub index: u32,
    pub vertices: Option<[Vertex; 3]>,
    pub last: bool,
}

/// Setup result flowing from TriangleSetup to TriangleTraversal.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupTriangle {
    /// Emulator handle; `None` for the end marker of an empty draw.
    pub id: Option<TriangleId>,
    pub index: u32,
    /// Signed area after any facing inversion, in pixels.
    pub area: f64,
    pub culled: bool,
    pub last: bool,
}

impl SetupTriangle {
    pub fn end_marker(index: u32) -> Self {
        Self {
            id: None,
            index,
            area: 0.0,
            culled: true,
            last: true,
        }
    }
}

/// Which reorder structure a shader result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderTag {
    Vertex { entry: crate::reorder::Slot },
    Triangle { entry: crate::reorder::Slot },
    Fragment { unit: usize, entry: crate::reorder::Slot },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShaderPayload {
    Vertex(VertexInput),
    Triangle(TriangleShaderInput),
    Fragment(Box<Stamp>),
}

/// One item of shader work; the tag comes back unchanged in the output.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderWork {
    pub tag: ShaderTag,
    pub payload: ShaderPayload,
}

/// Triangle setup delegated to the unified shader.
#[derive(Debug, Clone, PartialEq)]
pub struct TriangleShaderInput {
    /// Entry in TriangleSetup's shader reorder queue.
    pub entry: crate::reorder::Slot,
    pub triangle: SetupTriangle,
}

/// Shader result for a delegated triangle setup.
pub type TriangleShaderOutput = TriangleShaderInput;

/// Conservative depth refresh for one HZ block, sent by a Z/Stencil unit
/// when it writes a block back to memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HzUpdate {
    pub block: u32,
    /// Maximum depth stored in the block.
    pub z: u32,
}
