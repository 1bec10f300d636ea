//! Set associative Z cache. A line holds one whole block.
//!
//! Lines in use by a stamp between fetch and write are reserved and never
//! evicted. Replacement is LRU among unreserved lines of the set.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineId {
    set: usize,
    way: usize,
}

#[derive(Debug, Clone)]
struct Line {
    block: u32,
    allocated: bool,
    dirty: bool,
    reserves: u32,
    /// Cycle the fill data is usable.
    ready: u64,
    last_use: u64,
    data: Vec<u32>,
}

/// Outcome of [`ZCache::allocate`].
#[derive(Debug, Clone, PartialEq)]
pub enum Allocation {
    Hit(LineId),
    /// The line must be filled. A dirty victim is handed back for write-back.
    Miss {
        line: LineId,
        evicted: Option<(u32, Vec<u32>)>,
    },
}

#[derive(Debug, Clone)]
pub struct ZCache {
    sets: usize,
    ways: usize,
    lines: Vec<Line>,
}

impl ZCache {
    pub fn new(ways: usize, sets: usize, block_words: usize) -> Self {
        assert!(ways > 0 && sets > 0, "Z cache geometry must be non-zero");
        let line = Line {
            block: 0,
            allocated: false,
            dirty: false,
            reserves: 0,
            ready: 0,
            last_use: 0,
            data: vec![0; block_words],
        };
        Self {
            sets,
            ways,
            lines: vec![line; ways * sets],
        }
    }

    fn index(&self, id: LineId) -> usize {
        id.set * self.ways + id.way
    }

    fn line(&self, id: LineId) -> &Line {
        &self.lines[self.index(id)]
    }

    fn line_mut(&mut self, id: LineId) -> &mut Line {
        let i = self.index(id);
        &mut self.lines[i]
    }

    pub fn capacity(&self) -> usize {
        self.lines.len()
    }

    pub fn lookup(&self, block: u32) -> Option<LineId> {
        let set = block as usize % self.sets;
        (0..self.ways)
            .map(|way| LineId { set, way })
            .find(|&id| {
                let l = self.line(id);
                l.allocated && l.block == block
            })
    }

    /// Find or make room for `block`. `None` when every line of the set is
    /// reserved.
    pub fn allocate(&mut self, block: u32, cycle: u64) -> Option<Allocation> {
        if let Some(id) = self.lookup(block) {
            self.line_mut(id).last_use = cycle;
            return Some(Allocation::Hit(id));
        }
        let set = block as usize % self.sets;
        let ids = (0..self.ways).map(|way| LineId { set, way });
        let victim = ids
            .clone()
            .find(|&id| !self.line(id).allocated)
            .or_else(|| {
                ids.filter(|&id| self.line(id).reserves == 0)
                    .min_by_key(|&id| self.line(id).last_use)
            })?;
        let l = self.line_mut(victim);
        let evicted = (l.allocated && l.dirty).then(|| (l.block, l.data.clone()));
        l.block = block;
        l.allocated = true;
        l.dirty = false;
        l.ready = u64::MAX;
        l.last_use = cycle;
        Some(Allocation::Miss { line: victim, evicted })
    }

    pub fn fill(&mut self, id: LineId, data: Vec<u32>, ready: u64) {
        let l = self.line_mut(id);
        assert_eq!(l.data.len(), data.len(), "Z cache: fill of the wrong size");
        l.data = data;
        l.ready = ready;
    }

    pub fn is_ready(&self, id: LineId, cycle: u64) -> bool {
        self.line(id).ready <= cycle
    }

    pub fn block(&self, id: LineId) -> u32 {
        self.line(id).block
    }

    pub fn reserve(&mut self, id: LineId) {
        self.line_mut(id).reserves += 1;
    }

    pub fn release(&mut self, id: LineId) {
        let l = self.line_mut(id);
        assert!(l.reserves > 0, "Z cache: release of an unreserved line");
        l.reserves -= 1;
    }

    pub fn word(&self, id: LineId, index: usize) -> u32 {
        self.line(id).data[index]
    }

    pub fn set_word(&mut self, id: LineId, index: usize, word: u32) {
        let l = self.line_mut(id);
        if l.data[index] != word {
            l.data[index] = word;
            l.dirty = true;
        }
    }

    /// Contents of a resident copy of `block`.
    pub fn resident(&self, block: u32) -> Option<&[u32]> {
        self.lookup(block).map(|id| self.line(id).data.as_slice())
    }

    /// An unreserved dirty line, if any.
    pub fn next_dirty(&self) -> Option<LineId> {
        (0..self.sets)
            .flat_map(|set| (0..self.ways).map(move |way| LineId { set, way }))
            .find(|&id| {
                let l = self.line(id);
                l.allocated && l.dirty && l.reserves == 0
            })
    }

    /// Mark a line clean, returning its block and data for write-back.
    pub fn clean(&mut self, id: LineId) -> (u32, Vec<u32>) {
        let l = self.line_mut(id);
        l.dirty = false;
        (l.block, l.data.clone())
    }

    pub fn dirty(&self) -> usize {
        self.lines.iter().filter(|l| l.allocated && l.dirty).count()
    }

    pub fn reserved(&self) -> usize {
        self.lines.iter().filter(|l| l.reserves > 0).count()
    }

    /// Drop every line without write-back.
    pub fn invalidate(&mut self) {
        for l in &mut self.lines {
            assert!(l.reserves == 0, "Z cache: invalidate with reserved lines");
            l.allocated = false;
            l.dirty = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn miss_then_hit() {
        let mut c = ZCache::new(2, 4, 4);
        let Some(Allocation::Miss { line, evicted: None }) = c.allocate(5, 0) else {
            panic!("expected a clean miss");
        };
        c.fill(line, vec![1, 2, 3, 4], 10);
        assert!(!c.is_ready(line, 9));
        assert!(c.is_ready(line, 10));
        assert_eq!(c.allocate(5, 1), Some(Allocation::Hit(line)));
        assert_eq!(c.block(line), 5);
    }

    #[test]
    fn lru_victim_is_written_back_when_dirty() {
        let mut c = ZCache::new(2, 1, 2);
        let a = match c.allocate(0, 0) {
            Some(Allocation::Miss { line, .. }) => line,
            other => panic!("{other:?}"),
        };
        c.fill(a, vec![0, 0], 0);
        c.set_word(a, 1, 9);
        let b = match c.allocate(1, 1) {
            Some(Allocation::Miss { line, .. }) => line,
            other => panic!("{other:?}"),
        };
        c.fill(b, vec![0, 0], 1);
        // Block 0 is the least recently used.
        match c.allocate(2, 2) {
            Some(Allocation::Miss { line, evicted }) => {
                assert_eq!(line, a);
                assert_eq!(evicted, Some((0, vec![0, 9])));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn reserved_set_refuses_allocation() {
        let mut c = ZCache::new(1, 1, 1);
        let Some(Allocation::Miss { line, .. }) = c.allocate(0, 0) else {
            panic!("expected a miss");
        };
        c.reserve(line);
        assert_eq!(c.allocate(1, 1), None);
        c.release(line);
        assert!(matches!(c.allocate(1, 2), Some(Allocation::Miss { .. })));
    }

    #[test]
    fn unchanged_writes_keep_line_clean() {
        let mut c = ZCache::new(1, 1, 2);
        let Some(Allocation::Miss { line, .. }) = c.allocate(0, 0) else {
            panic!("expected a miss");
        };
        c.fill(line, vec![4, 4], 0);
        c.set_word(line, 0, 4);
        assert_eq!(c.next_dirty(), None);
        c.set_word(line, 0, 5);
        assert_eq!(c.next_dirty(), Some(line));
        assert_eq!(c.clean(line), (0, vec![5, 4]));
        assert_eq!(c.dirty(), 0);
    }

    proptest! {
        #[test]
        fn dirty_data_is_never_lost(blocks in proptest::collection::vec(0u32..16, 1..100)) {
            let mut c = ZCache::new(2, 2, 1);
            let mut memory = vec![0u32; 16];
            for (cycle, &block) in blocks.iter().enumerate() {
                let line = match c.allocate(block, cycle as u64) {
                    Some(Allocation::Hit(line)) => line,
                    Some(Allocation::Miss { line, evicted }) => {
                        if let Some((b, data)) = evicted {
                            memory[b as usize] = data[0];
                        }
                        c.fill(line, vec![memory[block as usize]], 0);
                        line
                    }
                    None => unreachable!("nothing is reserved"),
                };
                let v = c.word(line, 0) + 1;
                c.set_word(line, 0, v);
            }
            while let Some(line) = c.next_dirty() {
                let (b, data) = c.clean(line);
                memory[b as usize] = data[0];
            }
            for b in 0..16u32 {
                let touched = blocks.iter().filter(|&&x| x == b).count() as u32;
                prop_assert_eq!(memory[b as usize], touched);
            }
        }
    }
}
