//! Screen tiling shared by traversal, Hierarchical Z and the Z/Stencil test.
//!
//! The screen is cut into square blocks of `block_size` pixels. A block is
//! the HZ granularity, the Z cache line granularity and the unit of
//! ownership between stamp units.

use crate::stamp::STAMP_WIDTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub width: u32,
    pub height: u32,
    /// Block edge in pixels, a power of two >= 2.
    pub block_size: u32,
}

impl BlockLayout {
    pub fn new(width: u32, height: u32, block_size: u32) -> Self {
        assert!(
            block_size >= STAMP_WIDTH as u32 && block_size.is_power_of_two(),
            "block size {block_size} must be a power of two >= {STAMP_WIDTH}"
        );
        Self {
            width,
            height,
            block_size,
        }
    }

    pub fn blocks_x(&self) -> u32 {
        self.width.div_ceil(self.block_size)
    }

    pub fn blocks_y(&self) -> u32 {
        self.height.div_ceil(self.block_size)
    }

    pub fn block_count(&self) -> usize {
        (self.blocks_x() * self.blocks_y()) as usize
    }

    pub fn fragments_per_block(&self) -> usize {
        (self.block_size * self.block_size) as usize
    }

    pub fn stamps_per_block(&self) -> usize {
        self.fragments_per_block() / 4
    }

    /// Block holding pixel `(x, y)`. Pixels outside the screen are clamped
    /// to the border blocks; callers cull them before touching memory.
    pub fn block_of(&self, x: i32, y: i32) -> u32 {
        let bx = (x.max(0) as u32 / self.block_size).min(self.blocks_x().saturating_sub(1));
        let by = (y.max(0) as u32 / self.block_size).min(self.blocks_y().saturating_sub(1));
        by * self.blocks_x() + bx
    }

    /// Pixel offset of `(x, y)` inside its block, row major.
    pub fn offset_in_block(&self, x: i32, y: i32) -> usize {
        let bs = self.block_size as i32;
        (y.rem_euclid(bs) * bs + x.rem_euclid(bs)) as usize
    }

    pub fn block_origin(&self, block: u32) -> (i32, i32) {
        let bx = block % self.blocks_x();
        let by = block / self.blocks_x();
        ((bx * self.block_size) as i32, (by * self.block_size) as i32)
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.width && (y as u32) < self.height
    }
}

/// Assigns stamps to stamp units by block, so every block (and therefore
/// every HZ entry and Z cache line) is owned by exactly one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelMapper {
    pub layout: BlockLayout,
    pub units: usize,
}

impl PixelMapper {
    pub fn new(layout: BlockLayout, units: usize) -> Self {
        assert!(units > 0, "pixel mapper needs at least one stamp unit");
        Self { layout, units }
    }

    pub fn map_to_unit(&self, x: i32, y: i32) -> usize {
        let bs = self.layout.block_size as i32;
        let bx = x.div_euclid(bs) as i64;
        let by = y.div_euclid(bs) as i64;
        (bx + by).rem_euclid(self.units as i64) as usize
    }

    /// Word address of a pixel sample in a per-unit buffer of
    /// `samples` words per pixel.
    pub fn address(&self, x: i32, y: i32, samples: usize) -> usize {
        let block = self.layout.block_of(x, y) as usize;
        (block * self.layout.fragments_per_block() + self.layout.offset_in_block(x, y)) * samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_cover_screen() {
        let l = BlockLayout::new(400, 300, 8);
        assert_eq!(l.blocks_x(), 50);
        assert_eq!(l.blocks_y(), 38);
        assert_eq!(l.block_count(), 1900);
        assert_eq!(l.stamps_per_block(), 16);
        assert_eq!(l.block_of(0, 0), 0);
        assert_eq!(l.block_of(8, 0), 1);
        assert_eq!(l.block_of(0, 8), 50);
        assert_eq!(l.block_origin(51), (8, 8));
    }

    #[test]
    fn stamp_stays_in_one_block() {
        let l = BlockLayout::new(64, 64, 4);
        for y in (0..64).step_by(2) {
            for x in (0..64).step_by(2) {
                let b = l.block_of(x, y);
                assert_eq!(l.block_of(x + 1, y + 1), b);
            }
        }
    }

    #[test]
    fn units_own_whole_blocks() {
        let m = PixelMapper::new(BlockLayout::new(64, 64, 8), 4);
        assert_eq!(m.map_to_unit(0, 0), m.map_to_unit(7, 7));
        assert_ne!(m.map_to_unit(0, 0), m.map_to_unit(8, 0));
        assert!((0..64).all(|x| m.map_to_unit(x, 3) < 4));
    }

    #[test]
    fn addresses_are_unique() {
        let m = PixelMapper::new(BlockLayout::new(16, 16, 4), 1);
        let mut seen = std::collections::HashSet::new();
        for y in 0..16 {
            for x in 0..16 {
                assert!(seen.insert(m.address(x, y, 1)));
            }
        }
        assert_eq!(seen.len(), 256);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn odd_block_size_panics() {
        BlockLayout::new(10, 10, 6);
    }
}
