//! Command scripts for the simulator: register state, draws and buffer
//! operations in submission order.

use rsim_core::primitive::Vertex;
use rsim_core::stamp::{Quad, COLOR_ATTRIBUTE};
use rsim_core::{CompareFunction, CullMode, GpuRegData, GpuRegister, RasterizerCommand, StencilUpdate};

use crate::RunError;

/// An indexed triangle list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrawCall {
    pub vertices: Vec<Vertex>,
    pub triangles: Vec<[u32; 3]>,
}

impl DrawCall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn indexed(vertices: Vec<Vertex>, triangles: Vec<[u32; 3]>) -> Self {
        Self { vertices, triangles }
    }

    /// Append a triangle with its own three vertices.
    pub fn triangle(mut self, vertices: [Vertex; 3]) -> Self {
        let base = self.vertices.len() as u32;
        self.vertices.extend(vertices);
        self.triangles.push([base, base + 1, base + 2]);
        self
    }

    /// Triangle `i` with its vertices resolved.
    pub fn resolve(&self, i: usize) -> [Vertex; 3] {
        self.triangles[i].map(|v| self.vertices[v as usize])
    }

    fn validate(&self) -> Result<(), String> {
        let n = self.vertices.len();
        for (i, t) in self.triangles.iter().enumerate() {
            if let Some(v) = t.iter().find(|&&v| v as usize >= n) {
                return Err(format!("triangle {i} uses vertex {v} of {n}"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SceneOp {
    /// Sent to the Rasterizer as is.
    Command(RasterizerCommand),
    /// Streamed in, then started with `Draw`.
    Draw(DrawCall),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub name: String,
    pub ops: Vec<SceneOp>,
}

fn colored(x: f32, y: f32, z: f32, color: Quad) -> Vertex {
    Vertex::at(x, y, z).with_attribute(COLOR_ATTRIBUTE, color)
}

const RED: Quad = [1.0, 0.0, 0.0, 1.0];
const GREEN: Quad = [0.0, 1.0, 0.0, 1.0];
const BLUE: Quad = [0.0, 0.0, 1.0, 1.0];

impl Scene {
    /// Names accepted by [`Scene::builtin`].
    pub const BUILTIN: &'static [&'static str] = &["triangle", "overlap", "culling", "stencil", "grid", "empty"];

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ops: Vec::new(),
        }
    }

    pub fn command(mut self, command: RasterizerCommand) -> Self {
        self.ops.push(SceneOp::Command(command));
        self
    }

    pub fn write(self, reg: GpuRegister, subreg: u32, data: GpuRegData) -> Self {
        self.command(RasterizerCommand::write(reg, subreg, data))
    }

    pub fn draw(mut self, draw: DrawCall) -> Self {
        self.ops.push(SceneOp::Draw(draw));
        self
    }

    /// Resolution and a full-screen viewport, with the color attribute
    /// enabled for fragment shading.
    pub fn screen(self, width: u32, height: u32) -> Self {
        self.write(GpuRegister::Resolution, 0, GpuRegData::Uint(width))
            .write(GpuRegister::Resolution, 1, GpuRegData::Uint(height))
            .write(GpuRegister::Viewport, 0, GpuRegData::Int(0))
            .write(GpuRegister::Viewport, 1, GpuRegData::Int(0))
            .write(GpuRegister::Viewport, 2, GpuRegData::Int(width as i32))
            .write(GpuRegister::Viewport, 3, GpuRegData::Int(height as i32))
            .write(GpuRegister::FragmentInputAttributes, COLOR_ATTRIBUTE as u32, GpuRegData::Bool(true))
    }

    /// Depth test with `function`, hierarchical Z on.
    pub fn depth_test(self, function: CompareFunction) -> Self {
        self.write(GpuRegister::DepthTest, 0, GpuRegData::Bool(true))
            .write(GpuRegister::DepthFunction, 0, GpuRegData::Compare(function))
            .write(GpuRegister::HierarchicalZ, 0, GpuRegData::Bool(true))
    }

    pub fn draws(&self) -> usize {
        self.ops.iter().filter(|op| matches!(op, SceneOp::Draw(_))).count()
    }

    pub fn validate(&self) -> Result<(), RunError> {
        for (i, op) in self.ops.iter().enumerate() {
            if let SceneOp::Draw(d) = op {
                d.validate()
                    .map_err(|e| RunError::InvalidScene(format!("{}: op {i}: {e}", self.name)))?;
            }
        }
        Ok(())
    }

    /// One of the [`Scene::BUILTIN`] scenes for a `width` x `height` screen.
    pub fn builtin(name: &str, width: u32, height: u32) -> Option<Self> {
        let (w, h) = (width as f32, height as f32);
        let base = Scene::new(name).screen(width, height);
        let scene = match name {
            "triangle" => base
                .command(RasterizerCommand::ClearZStencil)
                .depth_test(CompareFunction::Less)
                .draw(DrawCall::new().triangle([
                    colored(0.1 * w, 0.1 * h, 0.5, RED),
                    colored(0.9 * w, 0.2 * h, 0.5, GREEN),
                    colored(0.3 * w, 0.9 * h, 0.5, BLUE),
                ]))
                .command(RasterizerCommand::Flush),
            // The far triangle is drawn second and mostly hidden.
            "overlap" => base
                .command(RasterizerCommand::ClearZStencil)
                .depth_test(CompareFunction::Less)
                .draw(DrawCall::new().triangle([
                    colored(0.0, 0.0, 0.2, RED),
                    colored(w, 0.0, 0.2, RED),
                    colored(0.0, h, 0.2, RED),
                ]))
                .draw(DrawCall::new().triangle([
                    colored(0.0, 0.0, 0.8, GREEN),
                    colored(w, 0.0, 0.8, GREEN),
                    colored(0.0, h, 0.8, GREEN),
                ]))
                .command(RasterizerCommand::Flush),
            "culling" => {
                let mut draw = DrawCall::new();
                for i in 0..4 {
                    let x = (i as f32 + 0.1) * w / 4.0;
                    let s = 0.2 * w;
                    let tri = [colored(x, 0.1 * h, 0.5, RED), colored(x, 0.1 * h + s, 0.5, RED), colored(x + s, 0.1 * h, 0.5, RED)];
                    // Even triangles face away.
                    draw = draw.triangle(if i % 2 == 0 { tri } else { [tri[0], tri[2], tri[1]] });
                }
                base.write(GpuRegister::Culling, 0, GpuRegData::Cull(CullMode::Back))
                    .draw(draw)
            }
            "stencil" => base
                .command(RasterizerCommand::ClearZStencil)
                .write(GpuRegister::StencilTest, 0, GpuRegData::Bool(true))
                .write(GpuRegister::StencilFunction, 0, GpuRegData::Compare(CompareFunction::Always))
                .write(GpuRegister::StencilReference, 0, GpuRegData::Uint(1))
                .write(GpuRegister::DepthPass, 0, GpuRegData::Stencil(StencilUpdate::Replace))
                .draw(DrawCall::new().triangle([
                    colored(0.0, 0.0, 0.5, RED),
                    colored(0.5 * w, 0.0, 0.5, RED),
                    colored(0.0, 0.5 * h, 0.5, RED),
                ]))
                .write(GpuRegister::StencilFunction, 0, GpuRegData::Compare(CompareFunction::Equal))
                .write(GpuRegister::DepthPass, 0, GpuRegData::Stencil(StencilUpdate::Keep))
                .draw(DrawCall::new().triangle([
                    colored(0.0, 0.0, 0.5, BLUE),
                    colored(w, 0.0, 0.5, BLUE),
                    colored(0.0, h, 0.5, BLUE),
                ]))
                .command(RasterizerCommand::Flush),
            "grid" => {
                let n = 8u32;
                let mut vertices = Vec::new();
                for j in 0..=n {
                    for i in 0..=n {
                        let (x, y) = (i as f32 * w / n as f32, j as f32 * h / n as f32);
                        let z = (i + j) as f32 / (2 * n) as f32;
                        vertices.push(colored(x, y, z, [x / w, y / h, 0.5, 1.0]));
                    }
                }
                let mut triangles = Vec::new();
                for j in 0..n {
                    for i in 0..n {
                        let v = j * (n + 1) + i;
                        triangles.push([v, v + 1, v + n + 1]);
                        triangles.push([v + 1, v + n + 2, v + n + 1]);
                    }
                }
                base.command(RasterizerCommand::ClearZStencil)
                    .depth_test(CompareFunction::Lequal)
                    .draw(DrawCall::indexed(vertices, triangles))
                    .command(RasterizerCommand::Flush)
            }
            "empty" => base.draw(DrawCall::new()),
            _ => return None,
        };
        Some(scene)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn every_builtin_scene_is_valid() {
        for name in Scene::BUILTIN {
            let scene = Scene::builtin(name, 64, 64).unwrap();
            scene.validate().unwrap();
            assert_eq!(scene.name, *name);
        }
        assert!(Scene::builtin("teapot", 64, 64).is_none());
    }

    #[test]
    fn triangles_share_indexed_vertices() {
        let draw = DrawCall::new()
            .triangle([Vertex::at(0.0, 0.0, 0.0), Vertex::at(1.0, 0.0, 0.0), Vertex::at(0.0, 1.0, 0.0)])
            .triangle([Vertex::at(2.0, 0.0, 0.0), Vertex::at(3.0, 0.0, 0.0), Vertex::at(2.0, 1.0, 0.0)]);
        assert_eq!(draw.triangles, vec![[0, 1, 2], [3, 4, 5]]);
        assert_eq!(draw.resolve(1)[0].position()[0], 2.0);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let scene = Scene::new("bad").draw(DrawCall::indexed(vec![Vertex::at(0.0, 0.0, 0.0)], vec![[0, 0, 1]]));
        let err = scene.validate().unwrap_err();
        assert!(err.to_string().contains("uses vertex 1 of 1"));
    }

    #[test]
    fn grid_counts_draws() {
        let scene = Scene::builtin("grid", 64, 64).unwrap();
        assert_eq!(scene.draws(), 1);
        let d = scene
            .ops
            .iter()
            .find_map(|op| match op {
                SceneOp::Draw(d) => Some(d),
                SceneOp::Command(_) => None,
            })
            .unwrap();
        assert_eq!(d.triangles.len(), 128);
        assert_eq!(d.vertices.len(), 81);
    }

    proptest! {
        #[test]
        fn validation_matches_index_range(
            n in 1usize..16,
            tris in prop::collection::vec([0u32..20, 0u32..20, 0u32..20], 0..8),
        ) {
            let vertices = (0..n).map(|i| Vertex::at(i as f32, 0.0, 0.0)).collect();
            let in_range = tris.iter().all(|t| t.iter().all(|&v| (v as usize) < n));
            let scene = Scene::new("p").draw(DrawCall::indexed(vertices, tris));
            prop_assert_eq!(scene.validate().is_ok(), in_range);
        }
    }
}
