//! Little-endian framing for the HZ buffer and block-state files.
//!
//! File layout: 8-byte magic, `u16` version, `u32` element count, then the
//! elements. See [`write_header`] / [`read_header`].

use std::io::{Read, Write};

use crate::error::{Result, SimError};

pub const FORMAT_VERSION: u16 = 1;

pub trait WriteLeExt: Write {
    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_u16_le(&mut self, v: u16) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u32_le(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

pub trait ReadLeExt: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

impl<T: Read + ?Sized> ReadLeExt for T {}

pub fn write_header<W: Write + ?Sized>(w: &mut W, magic: &[u8; 8], count: usize) -> Result<()> {
    let count: u32 = count
        .try_into()
        .map_err(|_| SimError::Corrupt("element count does not fit in u32"))?;
    w.write_all(magic)?;
    w.write_u16_le(FORMAT_VERSION)?;
    w.write_u32_le(count)?;
    log::debug!("writing {count} elements, magic {:?}", std::str::from_utf8(&magic[..7]));
    Ok(())
}

/// Validate magic and version, check the element count against the live
/// structure and return it.
pub fn read_header<R: Read + ?Sized>(
    r: &mut R,
    magic: &'static [u8; 8],
    what: &'static str,
    expected_count: usize,
) -> Result<usize> {
    let mut got = [0u8; 8];
    r.read_exact(&mut got)?;
    if &got != magic {
        return Err(SimError::InvalidMagic {
            expected: std::str::from_utf8(&magic[..7]).unwrap_or("?"),
        });
    }
    let version = r.read_u16_le()?;
    if version != FORMAT_VERSION {
        return Err(SimError::UnsupportedVersion(version));
    }
    let count = r.read_u32_le()? as usize;
    if count != expected_count {
        log::warn!("{what}: file holds {count} elements, expected {expected_count}");
        return Err(SimError::SizeMismatch {
            what,
            expected: expected_count as u64,
            found: count as u64,
        });
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: &[u8; 8] = b"RSIMTST\0";

    #[test]
    fn header_round_trip() {
        let mut buf = Vec::new();
        write_header(&mut buf, MAGIC, 12).unwrap();
        assert_eq!(buf.len(), 14);
        let n = read_header(&mut buf.as_slice(), MAGIC, "test", 12).unwrap();
        assert_eq!(n, 12);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut buf = Vec::new();
        write_header(&mut buf, b"RSIMXXX\0", 1).unwrap();
        let err = read_header(&mut buf.as_slice(), MAGIC, "test", 1).unwrap_err();
        assert!(matches!(err, SimError::InvalidMagic { .. }));
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let mut buf = Vec::new();
        write_header(&mut buf, MAGIC, 3).unwrap();
        let err = read_header(&mut buf.as_slice(), MAGIC, "test", 4).unwrap_err();
        assert!(matches!(err, SimError::SizeMismatch { expected: 4, found: 3, .. }));
    }

    #[test]
    fn future_version_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.write_u16_le(9).unwrap();
        buf.write_u32_le(0).unwrap();
        let err = read_header(&mut buf.as_slice(), MAGIC, "test", 0).unwrap_err();
        assert!(matches!(err, SimError::UnsupportedVersion(9)));
    }
}
