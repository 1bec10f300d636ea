use std::collections::HashMap;

use rsim_core::primitive::Vertex;
use rsim_core::stamp::{
    Stamp, TriangleId, BACK_COLOR_ATTRIBUTE, COLOR_ATTRIBUTE, MAX_FRAGMENT_ATTRIBUTES,
    POSITION_ATTRIBUTE,
};

use crate::msaa::sample_positions;
use crate::{AttributeSet, RasterizerEmulator, Rect};

#[derive(Debug, Clone)]
struct SetupData {
    vertices: [Vertex; 3],
    /// Edge `i` is opposite vertex `i`: `a*x + b*y + c`.
    edges: [[f64; 3]; 3],
    /// Twice the signed area, same sign convention as `edges`.
    area2: f64,
}

impl SetupData {
    fn new(vertices: [Vertex; 3]) -> Self {
        let p: Vec<(f64, f64)> = vertices
            .iter()
            .map(|v| (v.attributes[0][0] as f64, v.attributes[0][1] as f64))
            .collect();
        let mut edges = [[0.0; 3]; 3];
        for (i, edge) in edges.iter_mut().enumerate() {
            let (xj, yj) = p[(i + 1) % 3];
            let (xk, yk) = p[(i + 2) % 3];
            *edge = [yj - yk, xk - xj, xj * yk - xk * yj];
        }
        let (x0, y0) = p[0];
        let area2 = edges[0][0] * x0 + edges[0][1] * y0 + edges[0][2];
        Self {
            vertices,
            edges,
            area2,
        }
    }

    fn eval(&self, i: usize, x: f64, y: f64) -> f64 {
        let e = self.edges[i];
        e[0] * x + e[1] * y + e[2]
    }

    /// Orientation-independent inside test with a top-left fill rule.
    fn covers(&self, x: f64, y: f64) -> bool {
        if self.area2 == 0.0 {
            return false;
        }
        let s = self.area2.signum();
        (0..3).all(|i| {
            let v = s * self.eval(i, x, y);
            if v > 0.0 {
                true
            } else if v == 0.0 {
                let a = s * self.edges[i][0];
                let b = s * self.edges[i][1];
                a > 0.0 || (a == 0.0 && b > 0.0)
            } else {
                false
            }
        })
    }

    fn barycentric(&self, x: f64, y: f64) -> [f64; 3] {
        if self.area2 == 0.0 {
            return [1.0, 0.0, 0.0];
        }
        [
            self.eval(0, x, y) / self.area2,
            self.eval(1, x, y) / self.area2,
            self.eval(2, x, y) / self.area2,
        ]
    }

    fn depth(&self, x: f64, y: f64) -> f64 {
        let l = self.barycentric(x, y);
        (0..3)
            .map(|i| l[i] * self.vertices[i].attributes[POSITION_ATTRIBUTE][2] as f64)
            .sum()
    }
}

/// Floating-point edge-equation emulator.
#[derive(Debug, Clone)]
pub struct EdgeEmulator {
    triangles: HashMap<TriangleId, SetupData>,
    next_id: u32,
    viewport: Rect,
    depth_bits: u32,
}

impl EdgeEmulator {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            triangles: HashMap::new(),
            next_id: 1,
            viewport: Rect::new(0, 0, width, height),
            depth_bits: 24,
        }
    }

    fn data(&self, id: TriangleId) -> &SetupData {
        match self.triangles.get(&id) {
            Some(d) => d,
            None => panic!("rasterizer emulator: unknown triangle {}", id.0),
        }
    }

    fn max_depth(&self) -> f64 {
        ((1u64 << self.depth_bits) - 1) as f64
    }
}

impl RasterizerEmulator for EdgeEmulator {
    fn set_viewport(&mut self, viewport: Rect) {
        self.viewport = viewport;
    }

    fn viewport(&self) -> Rect {
        self.viewport
    }

    fn set_depth_precision(&mut self, bits: u32) {
        assert!((1..=24).contains(&bits), "depth precision {bits} out of range");
        self.depth_bits = bits;
    }

    fn setup_triangle(&mut self, vertices: &[Vertex; 3]) -> TriangleId {
        let id = TriangleId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.triangles.insert(id, SetupData::new(*vertices));
        log::trace!("emulator: setup triangle {}", id.0);
        id
    }

    fn triangle_area(&self, id: TriangleId) -> f64 {
        self.data(id).area2 / 2.0
    }

    fn invert_triangle(&mut self, id: TriangleId) {
        if let Some(d) = self.triangles.get_mut(&id) {
            for e in &mut d.edges {
                for c in e.iter_mut() {
                    *c = -*c;
                }
            }
            d.area2 = -d.area2;
        }
    }

    fn select_back_color(&mut self, id: TriangleId) {
        if let Some(d) = self.triangles.get_mut(&id) {
            for v in &mut d.vertices {
                v.attributes[COLOR_ATTRIBUTE] = v.attributes[BACK_COLOR_ATTRIBUTE];
            }
        }
    }

    fn bounding_box(&self, id: TriangleId) -> Rect {
        let d = self.data(id);
        let xs = d.vertices.iter().map(|v| v.attributes[0][0] as f64);
        let ys = d.vertices.iter().map(|v| v.attributes[0][1] as f64);
        let min_x = xs.clone().fold(f64::INFINITY, f64::min);
        let max_x = xs.fold(f64::NEG_INFINITY, f64::max);
        let min_y = ys.clone().fold(f64::INFINITY, f64::min);
        let max_y = ys.fold(f64::NEG_INFINITY, f64::max);
        let raw = Rect {
            x0: min_x.floor() as i32,
            y0: min_y.floor() as i32,
            x1: max_x.ceil() as i32,
            y1: max_y.ceil() as i32,
        };
        let clipped = raw.intersect(&self.viewport);
        if clipped.is_empty() {
            return Rect {
                x0: 0,
                y0: 0,
                x1: 0,
                y1: 0,
            };
        }
        Rect {
            x0: clipped.x0 - clipped.x0.rem_euclid(2),
            y0: clipped.y0 - clipped.y0.rem_euclid(2),
            x1: clipped.x1 + clipped.x1.rem_euclid(2),
            y1: clipped.y1 + clipped.y1.rem_euclid(2),
        }
    }

    fn tile_may_cover(&self, id: TriangleId, x: i32, y: i32, size: i32) -> bool {
        let bbox = self.bounding_box(id);
        let tile = Rect {
            x0: x,
            y0: y,
            x1: x + size,
            y1: y + size,
        };
        if bbox.intersect(&tile).is_empty() {
            return false;
        }
        let d = self.data(id);
        if d.area2 == 0.0 {
            return false;
        }
        let s = d.area2.signum();
        let (fx0, fy0, fx1, fy1) = (x as f64, y as f64, (x + size) as f64, (y + size) as f64);
        let corners = [(fx0, fy0), (fx1, fy0), (fx0, fy1), (fx1, fy1)];
        (0..3).all(|i| {
            corners
                .iter()
                .map(|&(cx, cy)| s * d.eval(i, cx, cy))
                .fold(f64::NEG_INFINITY, f64::max)
                >= 0.0
        })
    }

    fn generate_stamp(&self, id: TriangleId, x: i32, y: i32, msaa_samples: usize) -> Stamp {
        let d = self.data(id);
        let mut stamp = Stamp::new(id, x, y);
        for f in stamp.fragments.iter_mut() {
            let (px, py) = (f.x as f64, f.y as f64);
            f.z = self.convert_z(d.depth(px + 0.5, py + 0.5) as f32);
            if msaa_samples > 1 {
                for (s, &(ox, oy)) in sample_positions(msaa_samples).iter().enumerate() {
                    f.samples[s] = self.convert_z(d.depth(px + ox, py + oy) as f32);
                    if d.covers(px + ox, py + oy) {
                        f.coverage |= 1 << s;
                    }
                }
                f.inside = f.coverage != 0;
            } else {
                f.inside = d.covers(px + 0.5, py + 0.5);
                f.samples[0] = f.z;
                f.coverage = u8::from(f.inside);
            }
            f.culled = !f.inside;
        }
        stamp
    }

    fn interpolate(&self, stamp: &mut Stamp, attributes: &AttributeSet) {
        if stamp.marker {
            return;
        }
        let Some(d) = self.triangles.get(&stamp.triangle) else {
            return;
        };
        let max_z = self.max_depth() as f32;
        for (k, f) in stamp.fragments.iter().enumerate() {
            let l = d.barycentric(f.x as f64 + 0.5, f.y as f64 + 0.5);
            for a in 0..MAX_FRAGMENT_ATTRIBUTES {
                if !attributes.active[a] {
                    continue;
                }
                stamp.attributes[k][a] = if a == POSITION_ATTRIBUTE {
                    [f.x as f32, f.y as f32, f.z as f32 / max_z, 1.0]
                } else if !attributes.interpolated[a] {
                    d.vertices[2].attributes[a]
                } else {
                    let mut out = [0.0f32; 4];
                    for (c, o) in out.iter_mut().enumerate() {
                        *o = (0..3)
                            .map(|i| l[i] * d.vertices[i].attributes[a][c] as f64)
                            .sum::<f64>() as f32;
                    }
                    out
                };
            }
        }
    }

    fn convert_z(&self, z: f32) -> u32 {
        (z.clamp(0.0, 1.0) as f64 * self.max_depth()).round() as u32
    }

    fn destroy_triangle(&mut self, id: TriangleId) {
        self.triangles.remove(&id);
    }

    fn clear(&mut self) {
        self.triangles.clear();
    }

    fn live_triangles(&self) -> usize {
        self.triangles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tri(p: [(f32, f32); 3], z: f32) -> [Vertex; 3] {
        [
            Vertex::at(p[0].0, p[0].1, z),
            Vertex::at(p[1].0, p[1].1, z),
            Vertex::at(p[2].0, p[2].1, z),
        ]
    }

    #[test]
    fn area_sign_follows_winding() {
        let mut emu = EdgeEmulator::new(64, 64);
        let ccw = emu.setup_triangle(&tri([(0.0, 0.0), (8.0, 0.0), (0.0, 8.0)], 0.5));
        let cw = emu.setup_triangle(&tri([(0.0, 0.0), (0.0, 8.0), (8.0, 0.0)], 0.5));
        assert_eq!(emu.triangle_area(ccw), 32.0);
        assert_eq!(emu.triangle_area(cw), -32.0);
        emu.invert_triangle(cw);
        assert_eq!(emu.triangle_area(cw), 32.0);
    }

    #[test]
    fn inversion_does_not_change_coverage() {
        let mut emu = EdgeEmulator::new(64, 64);
        let id = emu.setup_triangle(&tri([(0.0, 0.0), (0.0, 6.0), (6.0, 0.0)], 0.25));
        let before = emu.generate_stamp(id, 2, 2, 1);
        emu.invert_triangle(id);
        let after = emu.generate_stamp(id, 2, 2, 1);
        assert_eq!(before.fragments, after.fragments);
    }

    #[test]
    fn square_stamp_is_fully_covered() {
        let mut emu = EdgeEmulator::new(16, 16);
        // Two triangles forming the 2x2 square at the origin.
        let a = emu.setup_triangle(&tri([(0.0, 0.0), (2.0, 0.0), (2.0, 2.0)], 0.5));
        let b = emu.setup_triangle(&tri([(0.0, 0.0), (2.0, 2.0), (0.0, 2.0)], 0.5));
        let sa = emu.generate_stamp(a, 0, 0, 1);
        let sb = emu.generate_stamp(b, 0, 0, 1);
        for k in 0..4 {
            // Shared diagonal: exactly one of the two triangles owns each centre.
            assert!(sa.fragments[k].inside ^ sb.fragments[k].inside, "fragment {k}");
        }
    }

    #[test]
    fn depth_converts_to_precision() {
        let mut emu = EdgeEmulator::new(16, 16);
        assert_eq!(emu.convert_z(1.0), 0x00ff_ffff);
        assert_eq!(emu.convert_z(-3.0), 0);
        emu.set_depth_precision(16);
        assert_eq!(emu.convert_z(1.0), 0xffff);
    }

    #[test]
    fn bounding_box_is_stamp_aligned_and_clipped() {
        let mut emu = EdgeEmulator::new(10, 10);
        let id = emu.setup_triangle(&tri([(1.2, 1.5), (20.0, 3.0), (3.0, 7.3)], 0.1));
        let bb = emu.bounding_box(id);
        assert_eq!((bb.x0, bb.y0, bb.x1, bb.y1), (0, 0, 10, 8));
    }

    #[test]
    fn interpolation_blends_attributes() {
        let mut emu = EdgeEmulator::new(16, 16);
        let v = [
            Vertex::at(0.0, 0.0, 0.0).with_attribute(COLOR_ATTRIBUTE, [1.0, 0.0, 0.0, 1.0]),
            Vertex::at(8.0, 0.0, 0.0).with_attribute(COLOR_ATTRIBUTE, [1.0, 0.0, 0.0, 1.0]),
            Vertex::at(0.0, 8.0, 0.0).with_attribute(COLOR_ATTRIBUTE, [1.0, 0.0, 0.0, 1.0]),
        ];
        let id = emu.setup_triangle(&v);
        let mut s = emu.generate_stamp(id, 0, 0, 1);
        emu.interpolate(&mut s, &AttributeSet::default());
        for k in 0..4 {
            let c = s.attributes[k][COLOR_ATTRIBUTE];
            assert!((c[0] - 1.0).abs() < 1e-5 && c[1].abs() < 1e-5);
        }
        assert_eq!(s.attributes[3][POSITION_ATTRIBUTE][0], 1.0);
    }

    #[test]
    fn msaa_coverage_marks_samples() {
        let mut emu = EdgeEmulator::new(16, 16);
        let id = emu.setup_triangle(&tri([(0.0, 0.0), (16.0, 0.0), (0.0, 16.0)], 0.5));
        let s = emu.generate_stamp(id, 0, 0, 4);
        assert_eq!(s.fragments[0].coverage, 0b1111);
        assert!(s.fragments[0].inside);
    }

    #[test]
    fn two_sided_lighting_swaps_color() {
        let mut emu = EdgeEmulator::new(16, 16);
        let v = tri([(0.0, 0.0), (8.0, 0.0), (0.0, 8.0)], 0.5)
            .map(|v| v.with_attribute(BACK_COLOR_ATTRIBUTE, [0.0, 0.0, 1.0, 1.0]));
        let id = emu.setup_triangle(&v);
        emu.select_back_color(id);
        let mut s = emu.generate_stamp(id, 0, 0, 1);
        emu.interpolate(&mut s, &AttributeSet::default());
        assert!((s.attributes[0][COLOR_ATTRIBUTE][2] - 1.0).abs() < 1e-5);
    }

    proptest! {
        #[test]
        fn tile_test_never_rejects_covered_stamps(
            ax in 0.0f32..32.0, ay in 0.0f32..32.0,
            bx in 0.0f32..32.0, by in 0.0f32..32.0,
            cx in 0.0f32..32.0, cy in 0.0f32..32.0,
        ) {
            let mut emu = EdgeEmulator::new(32, 32);
            let id = emu.setup_triangle(&tri([(ax, ay), (bx, by), (cx, cy)], 0.5));
            for ty in (0..32).step_by(8) {
                for tx in (0..32).step_by(8) {
                    if emu.tile_may_cover(id, tx, ty, 8) {
                        continue;
                    }
                    for sy in (ty..ty + 8).step_by(2) {
                        for sx in (tx..tx + 8).step_by(2) {
                            let s = emu.generate_stamp(id, sx, sy, 1);
                            prop_assert_eq!(s.live_fragments(), 0);
                        }
                    }
                }
            }
        }
    }
}
