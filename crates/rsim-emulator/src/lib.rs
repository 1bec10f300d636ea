//! Rasterization math used by the pipeline boxes.
//!
//! The boxes model timing; this crate computes what they carry. Triangles
//! are set up once and referenced by [`TriangleId`] for the rest of the
//! draw, so every box that touches a triangle sees the same edge
//! equations.

use std::cell::RefCell;
use std::rc::Rc;

use rsim_core::primitive::Vertex;
use rsim_core::stamp::{Stamp, TriangleId, MAX_FRAGMENT_ATTRIBUTES};

/// Edge-equation reference implementation.
pub mod edge;
/// Multisample positions.
pub mod msaa;

pub use edge::EdgeEmulator;

/// Emulator shared by the boxes of one rasterizer.
pub type SharedEmulator = Rc<RefCell<dyn RasterizerEmulator>>;

/// Window-space rectangle, `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x0: x,
            y0: y,
            x1: x + width as i32,
            y1: y + height as i32,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.x0 >= self.x1 || self.y0 >= self.y1
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        Rect {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        }
    }
}

/// Which fragment attributes are live and how they are interpolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeSet {
    pub active: [bool; MAX_FRAGMENT_ATTRIBUTES],
    /// `false` selects flat shading from the provoking (last) vertex.
    pub interpolated: [bool; MAX_FRAGMENT_ATTRIBUTES],
}

impl Default for AttributeSet {
    fn default() -> Self {
        let mut active = [false; MAX_FRAGMENT_ATTRIBUTES];
        active[rsim_core::stamp::POSITION_ATTRIBUTE] = true;
        active[rsim_core::stamp::COLOR_ATTRIBUTE] = true;
        Self {
            active,
            interpolated: [true; MAX_FRAGMENT_ATTRIBUTES],
        }
    }
}

impl AttributeSet {
    pub fn active_count(&self) -> u32 {
        self.active.iter().filter(|a| **a).count() as u32
    }
}

/// Rasterization math requested by triangle and stamp identifiers.
pub trait RasterizerEmulator {
    fn set_viewport(&mut self, viewport: Rect);

    fn viewport(&self) -> Rect;

    fn set_depth_precision(&mut self, bits: u32);

    /// Compute edge equations and the depth plane.
    fn setup_triangle(&mut self, vertices: &[Vertex; 3]) -> TriangleId;

    /// Signed area in pixels; negative for clockwise winding in window space.
    fn triangle_area(&self, id: TriangleId) -> f64;

    /// Negate the edge equations so the interior tests positive.
    fn invert_triangle(&mut self, id: TriangleId);

    /// Use the back color as the primary color (two-sided lighting).
    fn select_back_color(&mut self, id: TriangleId);

    /// Pixel bounding box clipped to the viewport, stamp aligned.
    fn bounding_box(&self, id: TriangleId) -> Rect;

    /// Conservative: `false` only when no sample of the tile is covered.
    fn tile_may_cover(&self, id: TriangleId, x: i32, y: i32, size: i32) -> bool;

    /// Evaluate coverage and depth for the 2x2 stamp at `(x, y)`.
    fn generate_stamp(&self, id: TriangleId, x: i32, y: i32, msaa_samples: usize) -> Stamp;

    /// Fill the attribute slots of a stamp.
    fn interpolate(&self, stamp: &mut Stamp, attributes: &AttributeSet);

    /// Normalized depth to integer depth at the current precision.
    fn convert_z(&self, z: f32) -> u32;

    fn destroy_triangle(&mut self, id: TriangleId);

    /// Drop every triangle; called once a draw has fully drained.
    fn clear(&mut self);

    /// Triangles set up and not yet destroyed.
    fn live_triangles(&self) -> usize;
}
