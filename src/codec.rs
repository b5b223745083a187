//! Bounds-checked integer codecs for on-disk structures.
//!
//! Readers return [`ImageError::Format`] when a structure is truncated, so a
//! short or corrupt image never panics. Writers index into buffers the caller
//! sized itself.

use crate::error::{ImageError, Result};

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| ImageError::format("structure offset overflows"))?;
    if end > data.len() {
        return Err(ImageError::format(format!(
            "truncated structure: need {len} bytes at offset {offset}, have {}",
            data.len().saturating_sub(offset)
        )));
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N]> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn le_u16(data: &[u8], offset: usize) -> Result<u16> {
    Ok(u16::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn le_u32(data: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn le_u64(data: &[u8], offset: usize) -> Result<u64> {
    Ok(u64::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn be_u16(data: &[u8], offset: usize) -> Result<u16> {
    Ok(u16::from_be_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn be_u32(data: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_be_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn be_u64(data: &[u8], offset: usize) -> Result<u64> {
    Ok(u64::from_be_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn put_le_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_le_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_le_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_be_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn put_be_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn put_be_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

/// Round `value` up to the next multiple of `align` (`align` > 0).
#[inline]
#[must_use]
pub fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Narrow a `u64` to `u32`, reporting which field overflowed.
pub fn narrow_u32(value: u64, field: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| ImageError::internal(format!("{field} value {value} does not fit in 32 bits")))
}

/// Narrow a `u64` to `usize` for in-memory indexing.
pub fn to_usize(value: u64, field: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| ImageError::format(format!("{field} value {value} is out of range")))
}

#[must_use]
pub fn is_zero(buf: &[u8]) -> bool {
    buf.iter().all(|b| *b == 0)
}

/// NUL-terminated, NUL-padded byte string to `String` (lossy).
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
