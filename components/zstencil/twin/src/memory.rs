//! Depth/stencil memory of one stamp unit and its block state table.
//!
//! Words pack the stencil value in the top byte and a 24-bit depth below
//! it, one word per pixel sample. Memory is laid out block by block so a
//! cache line (one block) is a contiguous range.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use rsim_core::persist::{read_header, write_header, ReadLeExt, WriteLeExt};
use rsim_core::{BlockLayout, Result, SimError};

pub const BLOCK_STATE_MAGIC: &[u8; 8] = b"RSIMZBS\0";
pub const DEPTH_MASK: u32 = 0x00ff_ffff;

pub fn pack(depth: u32, stencil: u8) -> u32 {
    ((stencil as u32) << 24) | (depth & DEPTH_MASK)
}

pub fn depth_of(word: u32) -> u32 {
    word & DEPTH_MASK
}

pub fn stencil_of(word: u32) -> u8 {
    (word >> 24) as u8
}

/// How a block is stored in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockState {
    /// Never written since the last clear; reads return the clear value.
    Clear,
    Uncompressed,
    /// Compressed at level 0 (best) or 1.
    Compressed(u8),
}

impl BlockState {
    /// Compression achievable for a block holding `words`.
    pub fn for_words(words: &[u32]) -> Self {
        let (min, max) = words
            .iter()
            .map(|&w| depth_of(w))
            .fold((u32::MAX, 0), |(lo, hi), z| (lo.min(z), hi.max(z)));
        let range = max.saturating_sub(min);
        if range < 1 << 8 {
            Self::Compressed(0)
        } else if range < 1 << 16 {
            Self::Compressed(1)
        } else {
            Self::Uncompressed
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Clear => 0,
            Self::Uncompressed => 1,
            Self::Compressed(level) => 2 + level,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Clear),
            1 => Some(Self::Uncompressed),
            2 | 3 => Some(Self::Compressed(b - 2)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DepthMemory {
    layout: BlockLayout,
    samples: usize,
    words: Vec<u32>,
    states: Vec<BlockState>,
}

impl DepthMemory {
    pub fn new(layout: BlockLayout, samples: usize) -> Self {
        let blocks = layout.block_count();
        Self {
            words: vec![0; blocks * layout.fragments_per_block() * samples],
            states: vec![BlockState::Clear; blocks],
            layout,
            samples,
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn blocks(&self) -> usize {
        self.states.len()
    }

    /// Words in one block (one cache line).
    pub fn block_words(&self) -> usize {
        self.layout.fragments_per_block() * self.samples
    }

    pub fn state(&self, block: u32) -> BlockState {
        self.states[block as usize]
    }

    pub fn states(&self) -> &[BlockState] {
        &self.states
    }

    pub fn read_block(&self, block: u32, clear_word: u32) -> Vec<u32> {
        let n = self.block_words();
        match self.states[block as usize] {
            BlockState::Clear => vec![clear_word; n],
            _ => {
                let base = block as usize * n;
                self.words[base..base + n].to_vec()
            }
        }
    }

    /// Word `index` of `block`.
    pub fn word(&self, block: u32, index: usize, clear_word: u32) -> u32 {
        match self.states[block as usize] {
            BlockState::Clear => clear_word,
            _ => self.words[block as usize * self.block_words() + index],
        }
    }

    pub fn write_block(&mut self, block: u32, data: &[u32], state: BlockState) {
        let n = self.block_words();
        let base = block as usize * n;
        self.words[base..base + n].copy_from_slice(data);
        self.states[block as usize] = state;
    }

    pub fn clear(&mut self) {
        self.states.fill(BlockState::Clear);
    }

    /// Cycles to bring `block` into the cache. Clear blocks need no memory
    /// access; compressed blocks move fewer bytes.
    pub fn read_latency(&self, block: u32, memory_latency: u64) -> u64 {
        match self.states[block as usize] {
            BlockState::Clear => 1,
            BlockState::Compressed(0) => (memory_latency / 4).max(1),
            BlockState::Compressed(_) => (memory_latency / 2).max(1),
            BlockState::Uncompressed => memory_latency.max(1),
        }
    }

    pub fn write_states_to<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        write_header(w, BLOCK_STATE_MAGIC, self.states.len())?;
        for s in &self.states {
            w.write_u8(s.to_byte())?;
        }
        Ok(())
    }

    /// Restore a saved block state table. On error the table is unchanged.
    pub fn read_states_from<R: Read + ?Sized>(&mut self, r: &mut R) -> Result<()> {
        let count = read_header(r, BLOCK_STATE_MAGIC, "block state memory", self.states.len())?;
        let mut states = Vec::with_capacity(count);
        for _ in 0..count {
            let b = r.read_u8()?;
            states.push(BlockState::from_byte(b).ok_or(SimError::Corrupt("unknown block state"))?);
        }
        self.states = states;
        Ok(())
    }

    pub fn save_block_states(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write_states_to(&mut w)?;
        w.flush()?;
        Ok(())
    }

    pub fn load_block_states(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let mut r = BufReader::new(File::open(path)?);
        self.read_states_from(&mut r)
    }
}
