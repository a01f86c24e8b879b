//! Low-level byte order and safe reading/writing utilities for DEX and ELF parsing.
//!
//! This module provides bounds-checked binary data reading and writing for the
//! little-endian structures that make up DEX containers and ELF modules. All operations
//! validate data availability before touching the buffer, so malformed or truncated
//! inputs surface as [`crate::Error::OutOfBounds`] instead of panics.
//!
//! # Key Components
//!
//! - [`crate::file::io::BinIO`] - Trait defining endian-aware conversion for primitive types
//! - [`crate::file::io::read_le`] / [`crate::file::io::read_le_at`] - Bounds-checked reads
//! - [`crate::file::io::write_le`] / [`crate::file::io::write_le_at`] - Bounds-checked writes
//!
//! Both DEX and the ELF objects produced by the Android NDK are little-endian; the
//! byte-swapped DEX variant is rejected at header validation, so no big-endian
//! accessors are provided here.

use crate::Result;

/// Trait for primitive types that can be read from and written to little-endian buffers.
///
/// Implemented for the unsigned and signed integer types used by the DEX and ELF
/// structure definitions. All implementations are pure conversions without shared
/// state, and therefore thread-safe.
pub trait BinIO: Sized {
    /// Associated type representing the byte array type for this numeric type.
    type Bytes: Sized + for<'a> TryFrom<&'a [u8]>;

    /// Read `Self` from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Write `Self` to a byte buffer in little-endian
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_bin_io {
    ($($t:ty),*) => {
        $(
            impl BinIO for $t {
                type Bytes = [u8; std::mem::size_of::<$t>()];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$t>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$t>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_bin_io!(u8, u16, u32, u64, i8, i16, i32, i64);

/// Read a value of type `T` from the start of `data` in little-endian format.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than `size_of::<T>()`.
///
/// # Examples
///
/// ```rust,ignore
/// let data = [0x01, 0x00, 0x00, 0x00];
/// let value: u32 = read_le(&data)?;
/// assert_eq!(value, 1);
/// ```
pub fn read_le<T: BinIO>(data: &[u8]) -> Result<T> {
    let size = std::mem::size_of::<T>();
    if data.len() < size {
        return Err(crate::Error::OutOfBounds);
    }

    match T::Bytes::try_from(&data[0..size]) {
        Ok(bytes) => Ok(T::from_le_bytes(bytes)),
        Err(_) => Err(crate::Error::OutOfBounds),
    }
}

/// Read a value of type `T` at `offset`, advancing `offset` past the value on success.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the read would extend past the end of `data`.
pub fn read_le_at<T: BinIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let size = std::mem::size_of::<T>();
    let end = offset
        .checked_add(size)
        .ok_or(crate::Error::OutOfBounds)?;
    if end > data.len() {
        return Err(crate::Error::OutOfBounds);
    }

    match T::Bytes::try_from(&data[*offset..end]) {
        Ok(bytes) => {
            *offset = end;
            Ok(T::from_le_bytes(bytes))
        }
        Err(_) => Err(crate::Error::OutOfBounds),
    }
}

/// Write `value` to the start of `data` in little-endian format.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than `size_of::<T>()`.
pub fn write_le<T: BinIO>(data: &mut [u8], value: T) -> Result<()>
where
    T::Bytes: AsRef<[u8]>,
{
    let size = std::mem::size_of::<T>();
    if data.len() < size {
        return Err(crate::Error::OutOfBounds);
    }

    data[0..size].copy_from_slice(value.to_le_bytes().as_ref());
    Ok(())
}

/// Write `value` at `offset` in little-endian format, advancing `offset` past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the write would extend past the end of `data`.
pub fn write_le_at<T: BinIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()>
where
    T::Bytes: AsRef<[u8]>,
{
    let size = std::mem::size_of::<T>();
    let end = offset
        .checked_add(size)
        .ok_or(crate::Error::OutOfBounds)?;
    if end > data.len() {
        return Err(crate::Error::OutOfBounds);
    }

    data[*offset..end].copy_from_slice(value.to_le_bytes().as_ref());
    *offset = end;
    Ok(())
}
