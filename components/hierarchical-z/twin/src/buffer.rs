//! The HZ buffer: one conservative (maximum) depth per block.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use rsim_core::persist::{read_header, write_header, ReadLeExt, WriteLeExt};
use rsim_core::Result;

pub const HZ_BUFFER_MAGIC: &[u8; 8] = b"RSIMHZB\0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HzBuffer {
    blocks: Vec<u32>,
}

impl HzBuffer {
    pub fn new(blocks: usize, clear_depth: u32) -> Self {
        Self {
            blocks: vec![clear_depth; blocks],
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, block: u32) -> u32 {
        self.blocks[block as usize]
    }

    pub fn set(&mut self, block: u32, z: u32) {
        self.blocks[block as usize] = z;
    }

    pub fn fill(&mut self, z: u32) {
        self.blocks.fill(z);
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.blocks
    }

    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        write_header(w, HZ_BUFFER_MAGIC, self.blocks.len())?;
        for &z in &self.blocks {
            w.write_u32_le(z)?;
        }
        Ok(())
    }

    /// Replace the contents with a previously written buffer of the same size.
    /// On error the buffer is left unchanged.
    pub fn read_from<R: Read + ?Sized>(&mut self, r: &mut R) -> Result<()> {
        let count = read_header(r, HZ_BUFFER_MAGIC, "HZ buffer", self.blocks.len())?;
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            blocks.push(r.read_u32_le()?);
        }
        self.blocks = blocks;
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write_to(&mut w)?;
        w.flush()?;
        Ok(())
    }

    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let mut r = BufReader::new(File::open(path)?);
        self.read_from(&mut r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsim_core::SimError;

    #[test]
    fn file_round_trip_restores_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hz.bin");
        let mut hz = HzBuffer::new(100, 0x00ff_ffff);
        for b in 0..100u32 {
            hz.set(b, b.wrapping_mul(0x1234_5677) & 0x00ff_ffff);
        }
        hz.save(&path).unwrap();

        let mut restored = HzBuffer::new(100, 0);
        restored.load(&path).unwrap();
        assert_eq!(restored, hz);
    }

    #[test]
    fn size_mismatch_leaves_buffer_alone() {
        let mut bytes = Vec::new();
        HzBuffer::new(4, 7).write_to(&mut bytes).unwrap();
        let mut other = HzBuffer::new(5, 1);
        let err = other.read_from(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, SimError::SizeMismatch { expected: 5, found: 4, .. }));
        assert_eq!(other.as_slice(), &[1; 5]);
    }

    #[test]
    fn truncated_file_is_an_io_error() {
        let mut bytes = Vec::new();
        HzBuffer::new(4, 7).write_to(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 2);
        let err = HzBuffer::new(4, 0).read_from(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, SimError::Io(_)));
    }
}
