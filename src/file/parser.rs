//! Cursor-based byte stream parser for DEX structure decoding.
//!
//! This module provides the [`crate::file::parser::Parser`] type, a bounds-checked
//! cursor over a byte slice. Beyond the primitive little-endian reads shared with
//! ELF parsing, it implements the variable-length encodings the DEX format is built
//! on: ULEB128, SLEB128, ULEB128p1, and MUTF-8 string data.
//!
//! # Key Components
//!
//! - [`crate::file::parser::Parser`] - Main cursor struct
//! - [`crate::file::parser::Parser::read_uleb128`] / [`Parser::read_sleb128`] /
//!   [`Parser::read_uleb128p1`] - DEX variable-length integers
//! - [`crate::file::parser::Parser::read_mutf8`] - NUL-terminated modified-UTF-8 strings
//! - [`crate::file::parser::encode_uleb128`] / [`encode_uleb128_padded`] - Encoders used
//!   when rewriting fields in place
//!
//! # Usage
//!
//! ```rust,ignore
//! let data = [0x80, 0x7f];       // ULEB128 for 16256
//! let mut parser = Parser::new(&data);
//! assert_eq!(parser.read_uleb128()?, 16256);
//! ```

use crate::{file::io::BinIO, Result};

/// Maximum number of bytes a ULEB128-encoded `u32` may occupy.
pub const MAX_ULEB128_LEN: usize = 5;

/// A bounds-checked cursor over binary data.
///
/// `Parser` maintains a position within a byte slice and provides typed read
/// operations that validate availability before touching the buffer. It is the
/// substrate under the DEX container model; every table and item decoder is written
/// against it.
pub struct Parser<'a> {
    /// The binary data being parsed
    data: &'a [u8],
    /// Current position within the data buffer
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new [`crate::file::parser::Parser`] from a byte slice.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Returns the length of the underlying data buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the parser has no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` if there is more data available to parse.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Move the current position to the specified index.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `pos` is beyond the data length.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos >= self.data.len() {
            return Err(crate::Error::OutOfBounds);
        }

        self.position = pos;
        Ok(())
    }

    /// Move the position forward by `step` bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the new position exceeds the data length.
    pub fn advance_by(&mut self, step: usize) -> Result<()> {
        let new_pos = self
            .position
            .checked_add(step)
            .ok_or(crate::Error::OutOfBounds)?;
        if new_pos > self.data.len() {
            return Err(crate::Error::OutOfBounds);
        }

        self.position = new_pos;
        Ok(())
    }

    /// Get the current cursor position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Align the cursor forward to the next multiple of `alignment`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the aligned position exceeds the data.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        if alignment == 0 {
            return Ok(());
        }

        let rem = self.position % alignment;
        if rem != 0 {
            self.advance_by(alignment - rem)?;
        }
        Ok(())
    }

    /// Read a primitive value in little-endian format, advancing the cursor.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if insufficient data remains.
    pub fn read_le<T: BinIO>(&mut self) -> Result<T> {
        crate::file::io::read_le_at(self.data, &mut self.position)
    }

    /// Read an unsigned LEB128 value (at most five bytes for a `u32`).
    ///
    /// Non-minimal encodings are accepted, matching the permissiveness of the
    /// Dalvik/ART readers this library must stay byte-compatible with.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncated input and
    /// [`crate::Error::Malformed`] if the encoding exceeds five bytes.
    pub fn read_uleb128(&mut self) -> Result<u32> {
        let mut result: u32 = 0;
        for i in 0..MAX_ULEB128_LEN {
            let byte = self.read_le::<u8>()?;
            result |= u32::from(byte & 0x7f) << (i * 7);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }

        Err(malformed_error!(
            "ULEB128 value exceeds 5 bytes at offset {}",
            self.position
        ))
    }

    /// Read a ULEB128p1 value: the encoded value minus one, so `0` encodes `-1`.
    ///
    /// Used by class_data_item for optional indices such as `source_file_idx`.
    ///
    /// # Errors
    /// Propagates the errors of [`Parser::read_uleb128`].
    pub fn read_uleb128p1(&mut self) -> Result<i64> {
        Ok(i64::from(self.read_uleb128()?) - 1)
    }

    /// Read a signed LEB128 value.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncated input and
    /// [`crate::Error::Malformed`] if the encoding exceeds five bytes.
    pub fn read_sleb128(&mut self) -> Result<i32> {
        let mut result: i32 = 0;
        let mut shift = 0;
        for _ in 0..MAX_ULEB128_LEN {
            let byte = self.read_le::<u8>()?;
            result |= i32::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 32 && (byte & 0x40) != 0 {
                    // Sign-extend
                    result |= -1i32 << shift;
                }
                return Ok(result);
            }
        }

        Err(malformed_error!(
            "SLEB128 value exceeds 5 bytes at offset {}",
            self.position
        ))
    }

    /// Read a NUL-terminated MUTF-8 string, advancing past the terminator.
    ///
    /// DEX string data uses modified UTF-8: embedded NULs are encoded as the two-byte
    /// sequence `C0 80`, and supplementary characters as CESU-8 surrogate pairs. Only
    /// the encodings that survive a lossless round trip to `String` are decoded; the
    /// surrogate-pair forms are rare in descriptors and rejected as unsupported.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if no terminator is found and
    /// [`crate::Error::Malformed`] for invalid byte sequences.
    pub fn read_mutf8(&mut self) -> Result<String> {
        let start = self.position;
        let mut end = start;
        while end < self.data.len() && self.data[end] != 0 {
            end += 1;
        }
        if end >= self.data.len() {
            return Err(crate::Error::OutOfBounds);
        }

        let raw = &self.data[start..end];
        self.position = end + 1;
        decode_mutf8(raw)
    }
}

/// Decode a modified-UTF-8 byte sequence (without terminator) into a `String`.
///
/// `C0 80` decodes to an embedded NUL; everything else must be valid standard UTF-8.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] on byte sequences that are neither.
pub fn decode_mutf8(raw: &[u8]) -> Result<String> {
    if !raw.contains(&0xC0) {
        return match std::str::from_utf8(raw) {
            Ok(s) => Ok(s.to_string()),
            Err(_) => Err(malformed_error!("invalid MUTF-8 string data")),
        };
    }

    // Slow path: rewrite C0 80 pairs to real NULs, then validate.
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == 0xC0 && i + 1 < raw.len() && raw[i + 1] == 0x80 {
            bytes.push(0);
            i += 2;
        } else {
            bytes.push(raw[i]);
            i += 1;
        }
    }

    String::from_utf8(bytes).map_err(|_| malformed_error!("invalid MUTF-8 string data"))
}

/// Encode `value` as a minimal ULEB128 byte sequence.
#[must_use]
pub fn encode_uleb128(mut value: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_ULEB128_LEN);
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            break;
        }
    }
    out
}

/// Encode `value` as a ULEB128 sequence padded with redundant continuation bytes to
/// exactly `width` bytes.
///
/// The in-place method stub relies on this: rewriting `code_off` to zero must not
/// change the encoded width of the surrounding class_data_item, and LEB128 readers
/// accept non-minimal encodings up to five bytes.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if `value` does not fit in `width` bytes or
/// `width` exceeds five.
pub fn encode_uleb128_padded(value: u32, width: usize) -> Result<Vec<u8>> {
    let minimal = encode_uleb128(value);
    if width < minimal.len() || width > MAX_ULEB128_LEN {
        return Err(malformed_error!(
            "cannot encode {value} as a {width}-byte ULEB128"
        ));
    }

    let mut out = minimal;
    while out.len() < width {
        let last = out.len() - 1;
        out[last] |= 0x80;
        out.push(0);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uleb128_single_and_multi_byte() {
        let data = [0x00, 0x7f, 0x80, 0x01, 0xb4, 0x07];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_uleb128().unwrap(), 0);
        assert_eq!(parser.read_uleb128().unwrap(), 127);
        assert_eq!(parser.read_uleb128().unwrap(), 128);
        assert_eq!(parser.read_uleb128().unwrap(), 948);
    }

    #[test]
    fn uleb128_accepts_non_minimal_encoding() {
        let data = [0x80, 0x80, 0x00];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_uleb128().unwrap(), 0);
        assert_eq!(parser.pos(), 3);
    }

    #[test]
    fn uleb128_rejects_overlong() {
        let data = [0x80, 0x80, 0x80, 0x80, 0x80, 0x80];
        let mut parser = Parser::new(&data);
        assert!(parser.read_uleb128().is_err());
    }

    #[test]
    fn sleb128_signed_values() {
        // -1 encodes as 0x7f, -128 as 0x80 0x7f
        let data = [0x7f, 0x80, 0x7f, 0x00];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_sleb128().unwrap(), -1);
        assert_eq!(parser.read_sleb128().unwrap(), -128);
        assert_eq!(parser.read_sleb128().unwrap(), 0);
    }

    #[test]
    fn uleb128p1_offsets_by_one() {
        let data = [0x00, 0x01];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_uleb128p1().unwrap(), -1);
        assert_eq!(parser.read_uleb128p1().unwrap(), 0);
    }

    #[test]
    fn mutf8_plain_and_embedded_nul() {
        let data = b"Lcom/example/Foo;\0";
        let mut parser = Parser::new(data);
        assert_eq!(parser.read_mutf8().unwrap(), "Lcom/example/Foo;");

        let data = [0x41, 0xC0, 0x80, 0x42, 0x00];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_mutf8().unwrap(), "A\0B");
    }

    #[test]
    fn encode_round_trips() {
        for value in [0u32, 1, 127, 128, 948, 65535, u32::MAX] {
            let bytes = encode_uleb128(value);
            let mut parser = Parser::new(&bytes);
            assert_eq!(parser.read_uleb128().unwrap(), value);
        }
    }

    #[test]
    fn encode_padded_keeps_width_and_value() {
        let bytes = encode_uleb128_padded(0, 3).unwrap();
        assert_eq!(bytes, vec![0x80, 0x80, 0x00]);
        let mut parser = Parser::new(&bytes);
        assert_eq!(parser.read_uleb128().unwrap(), 0);

        let bytes = encode_uleb128_padded(300, 4).unwrap();
        assert_eq!(bytes.len(), 4);
        let mut parser = Parser::new(&bytes);
        assert_eq!(parser.read_uleb128().unwrap(), 300);

        assert!(encode_uleb128_padded(u32::MAX, 2).is_err());
        assert!(encode_uleb128_padded(0, 6).is_err());
    }

    #[test]
    fn align_advances_to_boundary() {
        let data = [0u8; 16];
        let mut parser = Parser::new(&data);
        parser.advance_by(3).unwrap();
        parser.align(4).unwrap();
        assert_eq!(parser.pos(), 4);
        parser.align(4).unwrap();
        assert_eq!(parser.pos(), 4);
    }
}
