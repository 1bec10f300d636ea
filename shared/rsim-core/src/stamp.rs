//! Fragment stamps: the unit of work from traversal to the ROPs.
//!
//! A stamp is a 2x2 quad of fragments. Culled fragments stay in the stamp
//! (their slot is kept so that quad derivatives and addresses remain
//! aligned) with `culled` set.

/// Fragments per stamp.
pub const STAMP_FRAGMENTS: usize = 4;
/// Stamp edge length in pixels.
pub const STAMP_WIDTH: i32 = 2;
/// Attribute slots carried per fragment.
pub const MAX_FRAGMENT_ATTRIBUTES: usize = 8;
/// Slot of the window position attribute.
pub const POSITION_ATTRIBUTE: usize = 0;
/// Slot of the front (primary) color attribute.
pub const COLOR_ATTRIBUTE: usize = 1;
/// Slot of the back color attribute used by two-sided lighting.
pub const BACK_COLOR_ATTRIBUTE: usize = 2;
/// Depth samples kept per fragment when multisampling.
pub const MAX_MSAA_SAMPLES: usize = 8;

pub type Quad = [f32; 4];

/// Identifier the rasterizer emulator hands out for a set-up triangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TriangleId(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub x: i32,
    pub y: i32,
    /// Depth at the fragment centre, in the configured integer precision.
    pub z: u32,
    /// Centre covered by the triangle.
    pub inside: bool,
    /// Removed by some pipeline stage.
    pub culled: bool,
    /// Per-sample depth when multisampling.
    pub samples: [u32; MAX_MSAA_SAMPLES],
    /// Per-sample coverage bits when multisampling.
    pub coverage: u8,
}

impl Fragment {
    pub fn new(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            z: 0,
            inside: false,
            culled: true,
            samples: [0; MAX_MSAA_SAMPLES],
            coverage: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.culled
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stamp {
    pub triangle: TriangleId,
    /// Stamp unit (ROP lane) the stamp belongs to.
    pub unit: usize,
    /// Top-left pixel.
    pub x: i32,
    pub y: i32,
    pub fragments: [Fragment; STAMP_FRAGMENTS],
    pub attributes: [[Quad; MAX_FRAGMENT_ATTRIBUTES]; STAMP_FRAGMENTS],
    /// Last stamp of the batch in this stamp unit's lane.
    pub last: bool,
    /// Carries no fragments; only signals the end of the batch.
    pub marker: bool,
    /// Order of generation, for ordering checks.
    pub sequence: u64,
}

impl Stamp {
    /// Empty stamp at `(x, y)` with every fragment culled.
    pub fn new(triangle: TriangleId, x: i32, y: i32) -> Self {
        Self {
            triangle,
            unit: 0,
            x,
            y,
            fragments: [
                Fragment::new(x, y),
                Fragment::new(x + 1, y),
                Fragment::new(x, y + 1),
                Fragment::new(x + 1, y + 1),
            ],
            attributes: [[[0.0; 4]; MAX_FRAGMENT_ATTRIBUTES]; STAMP_FRAGMENTS],
            last: false,
            marker: false,
            sequence: 0,
        }
    }

    /// Empty end-of-batch marker for one stamp unit lane.
    pub fn end_marker(unit: usize, sequence: u64) -> Self {
        let mut s = Self::new(TriangleId::default(), 0, 0);
        s.unit = unit;
        s.last = true;
        s.marker = true;
        s.sequence = sequence;
        s
    }

    pub fn live_fragments(&self) -> usize {
        self.fragments.iter().filter(|f| f.is_live()).count()
    }

    pub fn all_culled(&self) -> bool {
        self.fragments.iter().all(|f| f.culled)
    }

    /// Turn a stamp whose fragments were all removed into the end marker it
    /// still has to deliver downstream.
    pub fn into_marker(mut self) -> Self {
        for f in &mut self.fragments {
            f.culled = true;
        }
        self.marker = true;
        self
    }

    /// Minimum depth among live fragments (or live samples when
    /// `msaa_samples > 1`).
    pub fn minimum_depth(&self, msaa_samples: usize) -> Option<u32> {
        let mut min: Option<u32> = None;
        for f in self.fragments.iter().filter(|f| f.is_live()) {
            if msaa_samples > 1 {
                for s in 0..msaa_samples.min(MAX_MSAA_SAMPLES) {
                    if f.coverage & (1 << s) != 0 {
                        min = Some(min.map_or(f.samples[s], |m| m.min(f.samples[s])));
                    }
                }
            } else {
                min = Some(min.map_or(f.z, |m| m.min(f.z)));
            }
        }
        min
    }
}
