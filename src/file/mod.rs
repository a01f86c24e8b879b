//! Binary file abstraction shared by the DEX and ELF models.
//!
//! This module provides the substrate every structural model in the crate is parsed
//! from: pluggable data sources behind the [`crate::file::Backend`] trait, a
//! bounds-checked [`crate::file::File`] facade, endian-aware primitive I/O in
//! [`crate::file::io`], and the cursor [`crate::file::parser::Parser`] with the
//! LEB128/MUTF-8 decoders the DEX format requires.
//!
//! # Key Components
//!
//! - [`crate::file::File`] - Read-only view over a loaded binary
//! - [`crate::file::Backend`] - Trait for data sources (disk files, memory buffers)
//! - [`crate::file::physical::Physical`] - Memory-mapped file backend
//! - [`crate::file::memory::Memory`] - Owned-buffer backend
//!
//! # Usage
//!
//! ```rust,no_run
//! use dexfuse::File;
//! use std::path::Path;
//!
//! let file = File::from_file(Path::new("classes.dex"))?;
//! let magic = file.data_slice(0, 8)?;
//! # Ok::<(), dexfuse::Error>(())
//! ```
//!
//! Loading is the only responsibility here; the structural models in
//! [`crate::dex`] and [`crate::elf`] copy what they need into owned buffers and
//! perform all mutation there, so a `File` never observes partial edits.

pub mod io;
pub mod parser;

mod memory;
mod physical;

use std::path::Path;

use crate::{Error::Empty, Result};
use memory::Memory;
use physical::Physical;

/// Backend trait for file data sources.
///
/// Abstracts over the source of binary data, allowing both on-disk and in-memory
/// representations. All implementations must be thread-safe.
pub trait Backend: Send + Sync {
    /// Returns a slice of the data at the given offset and length.
    ///
    /// # Arguments
    ///
    /// * `offset` - The starting offset within the data.
    /// * `len` - The length of the slice in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the requested range is out of bounds.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize;
}

/// A loaded binary file.
///
/// `File` is the read-only entry point for bytes on their way into a structural
/// model. It validates nothing about the format; the DEX and ELF loaders own their
/// respective sanity checks.
pub struct File {
    /// The underlying data source (memory or file).
    data: Box<dyn Backend>,
}

impl File {
    /// Loads a file from the given path using a memory-mapped backend.
    ///
    /// # Arguments
    ///
    /// * `file` - Path to the file on disk.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FileError`] if the file cannot be opened and
    /// [`crate::Error::Empty`] if it contains no data.
    pub fn from_file(file: &Path) -> Result<File> {
        let input = Physical::new(file)?;
        Self::load(Box::new(input))
    }

    /// Loads a file from a memory buffer.
    ///
    /// # Arguments
    ///
    /// * `data` - The raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Empty`] if the buffer contains no data.
    pub fn from_mem(data: Vec<u8>) -> Result<File> {
        Self::load(Box::new(Memory::new(data)))
    }

    fn load(data: Box<dyn Backend>) -> Result<File> {
        if data.len() == 0 {
            return Err(Empty);
        }

        Ok(File { data })
    }

    /// Returns a bounds-checked slice of the file data.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the requested range is out of bounds.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.data.data_slice(offset, len)
    }

    /// Returns the entire file data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    /// Returns the file length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the file holds no data. Loading rejects empty inputs, so
    /// this is always `false` for a constructed `File`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }
}
