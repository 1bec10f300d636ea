//! Fully associative HZ cache. A line holds `line_size` consecutive blocks
//! and is tagged by `block / line_size`. Lines in use by a queued stamp are
//! reserved and never replaced.

#[derive(Debug, Clone, Default)]
struct Line {
    tag: u32,
    allocated: bool,
    /// Block values have arrived from the buffer.
    valid: bool,
    reserves: u32,
    values: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct HzCache {
    lines: Vec<Line>,
    line_size: usize,
    /// Next candidate for replacement.
    victim: usize,
}

impl HzCache {
    pub fn new(lines: usize, line_size: usize) -> Self {
        assert!(lines > 0 && line_size > 0, "HZ cache geometry must be non-zero");
        Self {
            lines: vec![
                Line {
                    values: vec![0; line_size],
                    ..Line::default()
                };
                lines
            ],
            line_size,
            victim: 0,
        }
    }

    pub fn line_size(&self) -> usize {
        self.line_size
    }

    pub fn tag_of(&self, block: u32) -> u32 {
        block / self.line_size as u32
    }

    /// First block covered by the line.
    pub fn first_block(&self, line: usize) -> u32 {
        self.lines[line].tag * self.line_size as u32
    }

    /// Line holding (or fetching) `block`.
    pub fn search(&self, block: u32) -> Option<usize> {
        let tag = self.tag_of(block);
        self.lines.iter().position(|l| l.allocated && l.tag == tag)
    }

    /// Allocate a line for `block`, replacing an unreserved one if needed.
    /// `None` when every line is reserved. The line is not valid until
    /// [`fill`](Self::fill) delivers its values.
    pub fn insert(&mut self, block: u32) -> Option<usize> {
        let line = match self.lines.iter().position(|l| !l.allocated) {
            Some(free) => free,
            None => {
                let n = self.lines.len();
                let found = (0..n)
                    .map(|i| (self.victim + i) % n)
                    .find(|&i| self.lines[i].reserves == 0)?;
                self.victim = (found + 1) % n;
                found
            }
        };
        let tag = self.tag_of(block);
        let l = &mut self.lines[line];
        l.tag = tag;
        l.allocated = true;
        l.valid = false;
        Some(line)
    }

    pub fn reserve(&mut self, line: usize) {
        self.lines[line].reserves += 1;
    }

    pub fn release(&mut self, line: usize) {
        let l = &mut self.lines[line];
        assert!(l.reserves > 0, "HZ cache: release of unreserved line {line}");
        l.reserves -= 1;
    }

    pub fn reserves(&self, line: usize) -> u32 {
        self.lines[line].reserves
    }

    pub fn fill(&mut self, line: usize, values: &[u32]) {
        let l = &mut self.lines[line];
        l.values.copy_from_slice(values);
        l.valid = true;
    }

    pub fn is_valid(&self, line: usize) -> bool {
        self.lines[line].valid
    }

    pub fn value(&self, line: usize, block: u32) -> u32 {
        self.lines[line].values[block as usize % self.line_size]
    }

    /// Refresh a resident copy of `block`.
    pub fn update(&mut self, block: u32, z: u32) {
        if let Some(line) = self.search(block) {
            let slot = block as usize % self.line_size;
            let l = &mut self.lines[line];
            if l.valid {
                l.values[slot] = z;
            }
        }
    }

    pub fn resident(&self) -> usize {
        self.lines.iter().filter(|l| l.allocated).count()
    }

    pub fn capacity(&self) -> usize {
        self.lines.len()
    }

    pub fn reserved(&self) -> usize {
        self.lines.iter().filter(|l| l.reserves > 0).count()
    }

    /// Drop every line. Reserved lines may not be invalidated.
    pub fn invalidate(&mut self) {
        for l in &mut self.lines {
            assert!(l.reserves == 0, "HZ cache: invalidate with reserved lines");
            l.allocated = false;
            l.valid = false;
        }
        self.victim = 0;
    }
}
