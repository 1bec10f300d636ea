//! Stamp walkers.
//!
//! A walker turns a batch of set-up triangles into the stamps they cover.
//! Both walkers emit only stamps with at least one covered fragment, so for
//! the same triangles they produce the same set of stamps; only the order
//! differs.

use std::collections::VecDeque;

use rsim_core::config::TraversalStrategy;
use rsim_core::stamp::{STAMP_WIDTH, Stamp, TriangleId};
use rsim_emulator::{RasterizerEmulator, Rect};

pub trait Walker {
    /// Largest batch the walker takes at once.
    fn batch_limit(&self) -> usize;

    /// Begin walking a new batch. The previous batch must be finished.
    fn start(&mut self, emu: &dyn RasterizerEmulator, batch: Vec<TriangleId>);

    /// Next covered stamp of the batch, or `None` once the batch is done.
    fn next_stamp(&mut self, emu: &dyn RasterizerEmulator, msaa_samples: usize) -> Option<Stamp>;

    fn is_done(&self) -> bool;
}

/// Build the walker selected by the configuration.
pub fn walker_for(strategy: TraversalStrategy, triangle_batch: usize) -> Box<dyn Walker> {
    match strategy {
        TraversalStrategy::Recursive => Box::new(RecursiveWalker::new(triangle_batch)),
        TraversalStrategy::Scanline => Box::new(ScanlineWalker::default()),
    }
}

fn covers_any(stamp: &Stamp) -> bool {
    stamp.live_fragments() > 0
}

#[derive(Debug, Clone)]
struct Tile {
    x: i32,
    y: i32,
    size: i32,
    /// Indices into the batch of the triangles that may cover the tile.
    triangles: Vec<usize>,
}

/// Quad-tree walk over the union of the batch's bounding boxes. At each
/// stamp the batch triangles are evaluated in submission order.
#[derive(Debug, Default)]
pub struct RecursiveWalker {
    limit: usize,
    batch: Vec<TriangleId>,
    stack: Vec<Tile>,
    leaf: VecDeque<Stamp>,
}

impl RecursiveWalker {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            ..Self::default()
        }
    }

    fn filter(&self, emu: &dyn RasterizerEmulator, x: i32, y: i32, size: i32, from: &[usize]) -> Vec<usize> {
        from.iter()
            .copied()
            .filter(|&t| emu.tile_may_cover(self.batch[t], x, y, size))
            .collect()
    }
}

impl Walker for RecursiveWalker {
    fn batch_limit(&self) -> usize {
        self.limit
    }

    fn start(&mut self, emu: &dyn RasterizerEmulator, batch: Vec<TriangleId>) {
        self.batch = batch;
        self.stack.clear();
        self.leaf.clear();

        let bbox = self
            .batch
            .iter()
            .map(|&id| emu.bounding_box(id))
            .filter(|b| !b.is_empty())
            .reduce(|a, b| Rect {
                x0: a.x0.min(b.x0),
                y0: a.y0.min(b.y0),
                x1: a.x1.max(b.x1),
                y1: a.y1.max(b.y1),
            });
        let Some(bbox) = bbox else {
            return;
        };
        let extent = (bbox.x1 - bbox.x0).max(bbox.y1 - bbox.y0).max(STAMP_WIDTH) as u32;
        let size = extent.next_power_of_two() as i32;
        let all: Vec<usize> = (0..self.batch.len()).collect();
        let triangles = self.filter(emu, bbox.x0, bbox.y0, size, &all);
        if !triangles.is_empty() {
            self.stack.push(Tile {
                x: bbox.x0,
                y: bbox.y0,
                size,
                triangles,
            });
        }
    }

    fn next_stamp(&mut self, emu: &dyn RasterizerEmulator, msaa_samples: usize) -> Option<Stamp> {
        loop {
            if let Some(stamp) = self.leaf.pop_front() {
                return Some(stamp);
            }
            let tile = self.stack.pop()?;
            if tile.size <= STAMP_WIDTH {
                for &t in &tile.triangles {
                    let stamp = emu.generate_stamp(self.batch[t], tile.x, tile.y, msaa_samples);
                    if covers_any(&stamp) {
                        self.leaf.push_back(stamp);
                    }
                }
                continue;
            }
            let half = tile.size / 2;
            // Pushed in reverse so the top-left quadrant is walked first.
            for (dx, dy) in [(half, half), (0, half), (half, 0), (0, 0)] {
                let (x, y) = (tile.x + dx, tile.y + dy);
                let triangles = self.filter(emu, x, y, half, &tile.triangles);
                if !triangles.is_empty() {
                    self.stack.push(Tile {
                        x,
                        y,
                        size: half,
                        triangles,
                    });
                }
            }
        }
    }

    fn is_done(&self) -> bool {
        self.stack.is_empty() && self.leaf.is_empty()
    }
}

/// Row-by-row walk of one triangle's bounding box at a time.
#[derive(Debug, Default)]
pub struct ScanlineWalker {
    pending: VecDeque<TriangleId>,
    current: Option<(TriangleId, Rect)>,
    x: i32,
    y: i32,
}

impl Walker for ScanlineWalker {
    fn batch_limit(&self) -> usize {
        1
    }

    fn start(&mut self, _emu: &dyn RasterizerEmulator, batch: Vec<TriangleId>) {
        self.pending = batch.into();
        self.current = None;
    }

    fn next_stamp(&mut self, emu: &dyn RasterizerEmulator, msaa_samples: usize) -> Option<Stamp> {
        loop {
            let Some((id, bbox)) = self.current else {
                let id = self.pending.pop_front()?;
                let bbox = emu.bounding_box(id);
                if !bbox.is_empty() {
                    self.current = Some((id, bbox));
                    self.x = bbox.x0;
                    self.y = bbox.y0;
                }
                continue;
            };
            if self.y >= bbox.y1 {
                self.current = None;
                continue;
            }
            let (x, y) = (self.x, self.y);
            self.x += STAMP_WIDTH;
            if self.x >= bbox.x1 {
                self.x = bbox.x0;
                self.y += STAMP_WIDTH;
            }
            let stamp = emu.generate_stamp(id, x, y, msaa_samples);
            if covers_any(&stamp) {
                return Some(stamp);
            }
        }
    }

    fn is_done(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rsim_core::primitive::Vertex;
    use rsim_emulator::EdgeEmulator;

    fn drain(walker: &mut dyn Walker, emu: &EdgeEmulator) -> Vec<(u32, i32, i32, usize)> {
        let mut out = Vec::new();
        while let Some(s) = walker.next_stamp(emu, 1) {
            out.push((s.triangle.0, s.x, s.y, s.live_fragments()));
        }
        assert!(walker.is_done());
        out
    }

    fn walk_both(emu: &EdgeEmulator, ids: &[TriangleId]) -> (Vec<(u32, i32, i32, usize)>, Vec<(u32, i32, i32, usize)>) {
        let mut rec = RecursiveWalker::new(ids.len());
        rec.start(emu, ids.to_vec());
        let mut a = drain(&mut rec, emu);
        let mut b = Vec::new();
        for &id in ids {
            let mut scan = ScanlineWalker::default();
            scan.start(emu, vec![id]);
            b.extend(drain(&mut scan, emu));
        }
        a.sort();
        b.sort();
        (a, b)
    }

    #[test]
    fn single_stamp_triangle() {
        let mut emu = EdgeEmulator::new(32, 32);
        let id = emu.setup_triangle(&[
            Vertex::at(4.0, 4.0, 0.5),
            Vertex::at(6.0, 4.0, 0.5),
            Vertex::at(4.0, 6.0, 0.5),
        ]);
        let (rec, scan) = walk_both(&emu, &[id]);
        assert_eq!(rec, vec![(id.0, 4, 4, 1)]);
        assert_eq!(rec, scan);
    }

    #[test]
    fn recursive_visits_stamps_tile_major() {
        let mut emu = EdgeEmulator::new(32, 32);
        let a = emu.setup_triangle(&[Vertex::at(0.0, 0.0, 0.5), Vertex::at(8.0, 0.0, 0.5), Vertex::at(0.0, 8.0, 0.5)]);
        let b = emu.setup_triangle(&[Vertex::at(0.0, 0.0, 0.4), Vertex::at(8.0, 0.0, 0.4), Vertex::at(0.0, 8.0, 0.4)]);
        let mut rec = RecursiveWalker::new(2);
        rec.start(&emu, vec![a, b]);
        let order = drain(&mut rec, &emu);
        // Both triangles at a stamp before moving on.
        assert_eq!((order[0].1, order[0].2), (order[1].1, order[1].2));
        assert_eq!((order[0].0, order[1].0), (a.0, b.0));
    }

    #[test]
    fn offscreen_triangle_yields_nothing() {
        let mut emu = EdgeEmulator::new(16, 16);
        let id = emu.setup_triangle(&[Vertex::at(40.0, 40.0, 0.5), Vertex::at(48.0, 40.0, 0.5), Vertex::at(40.0, 48.0, 0.5)]);
        let (rec, scan) = walk_both(&emu, &[id]);
        assert!(rec.is_empty() && scan.is_empty());
    }

    proptest! {
        #[test]
        fn strategies_agree_on_coverage(
            pts in proptest::collection::vec((0.0f32..48.0, 0.0f32..48.0), 6),
        ) {
            let mut emu = EdgeEmulator::new(40, 40);
            let ids: Vec<TriangleId> = pts
                .chunks(3)
                .map(|p| {
                    let v = [
                        Vertex::at(p[0].0, p[0].1, 0.5),
                        Vertex::at(p[1].0, p[1].1, 0.5),
                        Vertex::at(p[2].0, p[2].1, 0.5),
                    ];
                    emu.setup_triangle(&v)
                })
                .collect();
            let (rec, scan) = walk_both(&emu, &ids);
            prop_assert_eq!(rec, scan);
        }
    }
}
