//! Memory-mapped file backend.
//!
//! [`crate::file::physical::Physical`] maps a file on disk read-only into the process
//! address space via `memmap2`, so large APK payloads and native modules can be
//! inspected without reading them into an owned buffer first. Mutating stages copy
//! the mapped bytes into an owned image before editing; the mapping itself is never
//! written through.

use super::Backend;
use crate::{
    Error::{Error, FileError},
    Result,
};

use memmap2::Mmap;
use std::{fs, path::Path};

/// A file backend that uses memory-mapped I/O for efficient access to files on disk.
///
/// The mapping is read-only and shared. All access operations are bounds-checked;
/// the handle is released when the backend is dropped, on every exit path including
/// validation failure.
#[derive(Debug)]
pub struct Physical {
    /// Memory-mapped file data
    data: Mmap,
}

impl Physical {
    /// Create a new physical file backend by memory-mapping the specified file.
    ///
    /// # Arguments
    /// * `path` - Path to the file on disk
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or
    /// [`crate::Error::Error`] if memory mapping fails.
    pub fn new(path: impl AsRef<Path>) -> Result<Physical> {
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(error) => return Err(FileError(error)),
        };

        let mmap = match unsafe { Mmap::map(&file) } {
            Ok(mmap) => mmap,
            Err(error) => return Err(Error(error.to_string())),
        };

        Ok(Physical { data: mmap })
    }
}

impl Backend for Physical {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len).ok_or(crate::Error::OutOfBounds)?;
        if end > self.data.len() {
            return Err(crate::Error::OutOfBounds);
        }

        Ok(&self.data[offset..end])
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}
