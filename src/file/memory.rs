//! Owned in-memory buffer backend, used for data that is already loaded or generated.

use super::Backend;
use crate::Result;

/// A backend over an owned byte buffer.
///
/// Used when container bytes arrive from somewhere other than a file on disk, such
/// as a zip entry extracted by the repackaging collaborator or a unit test fixture.
#[derive(Debug)]
pub struct Memory {
    data: Vec<u8>,
}

impl Memory {
    /// Create a new memory backend taking ownership of `data`.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Memory {
        Memory { data }
    }
}

impl Backend for Memory {
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
