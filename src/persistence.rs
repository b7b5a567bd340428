//! Shared little-endian binary I/O helpers for the sidecar formats (spec §6):
//! the vector index, text store and metadata store each prefix their
//! variable-length fields with an `int32` length, host byte order.

use crate::error::{Error, Result};
use std::io::{Read, Write};

pub fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub fn write_i32<W: Write>(w: &mut W, v: i32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn read_f32<R: Read>(r: &mut R) -> Result<f32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

pub fn write_f32<W: Write>(w: &mut W, v: f32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

/// Length-prefixed byte string, length 0 permitted.
pub fn read_lp_string<R: Read>(r: &mut R) -> Result<String> {
    let len = read_i32(r)?;
    if len < 0 {
        return Err(Error::InvalidModel("negative string length".into()));
    }
    let mut bytes = vec![0u8; len as usize];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| Error::InvalidModel("malformed UTF-8 string".into()))
}

pub fn write_lp_string<W: Write>(w: &mut W, s: &str) -> Result<()> {
    write_i32(w, s.len() as i32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}
