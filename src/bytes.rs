use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Checked little-endian loads and stores into a script blob. The tables are
/// random-access by offset, so unlike a sequential reader every helper takes
/// the absolute offset.

pub fn read_u8(data: &[u8], off: usize) -> Result<u8> {
    match data.get(off) {
        Some(&b) => Ok(b),
        None => bail!("read u8 out of range: {:#x}/{:#x}", off, data.len()),
    }
}

pub fn read_u16(data: &[u8], off: usize) -> Result<u16> {
    check(data, off, 2)?;
    Ok(LittleEndian::read_u16(&data[off..off + 2]))
}

pub fn read_u32(data: &[u8], off: usize) -> Result<u32> {
    check(data, off, 4)?;
    Ok(LittleEndian::read_u32(&data[off..off + 4]))
}

pub fn read_u64(data: &[u8], off: usize) -> Result<u64> {
    check(data, off, 8)?;
    Ok(LittleEndian::read_u64(&data[off..off + 8]))
}

pub fn read_i16(data: &[u8], off: usize) -> Result<i16> {
    Ok(read_u16(data, off)? as i16)
}

pub fn read_i32(data: &[u8], off: usize) -> Result<i32> {
    Ok(read_u32(data, off)? as i32)
}

pub fn read_i64(data: &[u8], off: usize) -> Result<i64> {
    Ok(read_u64(data, off)? as i64)
}

pub fn read_f32(data: &[u8], off: usize) -> Result<f32> {
    Ok(f32::from_bits(read_u32(data, off)?))
}

pub fn write_u8(data: &mut [u8], off: usize, value: u8) -> Result<()> {
    check(data, off, 1)?;
    data[off] = value;
    Ok(())
}

pub fn write_u16(data: &mut [u8], off: usize, value: u16) -> Result<()> {
    check(data, off, 2)?;
    LittleEndian::write_u16(&mut data[off..off + 2], value);
    Ok(())
}

pub fn write_u32(data: &mut [u8], off: usize, value: u32) -> Result<()> {
    check(data, off, 4)?;
    LittleEndian::write_u32(&mut data[off..off + 4], value);
    Ok(())
}

/// NUL-terminated string starting at `off`.
pub fn read_cstr(data: &[u8], off: usize) -> Result<&str> {
    if off >= data.len() {
        bail!("read string out of range: {:#x}/{:#x}", off, data.len());
    }
    let tail = &data[off..];
    let end = match tail.iter().position(|&b| b == 0) {
        Some(end) => end,
        None => bail!("unterminated string at {:#x}", off),
    };
    match std::str::from_utf8(&tail[..end]) {
        Ok(s) => Ok(s),
        Err(_) => bail!("non-utf8 string at {:#x}", off),
    }
}

/// Advance `off` to the next multiple of `align`.
pub fn align_to(off: usize, align: usize) -> usize {
    (off + align - 1) & !(align - 1)
}

fn check(data: &[u8], off: usize, len: usize) -> Result<()> {
    let end = match off.checked_add(len) {
        Some(end) => end,
        None => bail!("offset overflow at {:#x}", off),
    };
    if end > data.len() {
        bail!("access out of range: {:#x}+{}/{:#x}", off, len, data.len());
    }
    Ok(())
}
