//! Variable length unsigned integers, as used for numeric TLV values.
//!
//! Values are little endian and occupy 1, 2, 4 or 8 bytes. Encoding picks the width, decoding accepts any of the four
//! widths and zero-extends.

use crate::tlv::TLVError;

/// The widths an integer may be encoded in.
pub const WIDTHS: [usize; 4] = [1, 2, 4, 8];

/// Smallest width that holds the value without loss.
pub fn minimal_width(value: u64) -> usize {
    if value <= u8::MAX as u64 {
        1
    } else if value <= u16::MAX as u64 {
        2
    } else if value <= u32::MAX as u64 {
        4
    } else {
        8
    }
}

/// Encode `value` into exactly `width` bytes.
///
/// Fails with [`TLVError::UnexpectedValue`] if the width is not one of [`WIDTHS`] or the value does not survive a
/// round trip through that width, and with [`TLVError::BufferOverrun`] if `out` is too short.
pub fn encode(value: u64, width: usize, out: &mut [u8]) -> Result<usize, TLVError> {
    if !WIDTHS.contains(&width) {
        return Err(TLVError::UnexpectedValue);
    }
    if out.len() < width {
        return Err(TLVError::BufferOverrun);
    }
    let bytes = value.to_le_bytes();
    out[0..width].copy_from_slice(&bytes[0..width]);
    if decode(&out[0..width])? != value {
        return Err(TLVError::UnexpectedValue);
    }
    Ok(width)
}

/// Encode using [`minimal_width`].
pub fn encode_minimal(value: u64, out: &mut [u8]) -> Result<usize, TLVError> {
    encode(value, minimal_width(value), out)
}

/// Decode 1, 2, 4 or 8 little endian bytes.
pub fn decode(bytes: &[u8]) -> Result<u64, TLVError> {
    if !WIDTHS.contains(&bytes.len()) {
        return Err(TLVError::UnexpectedValue);
    }
    let mut full = [0u8; 8];
    full[0..bytes.len()].copy_from_slice(bytes);
    Ok(u64::from_le_bytes(full))
}
