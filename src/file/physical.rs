//! Memory-mapped file backend.
//!
//! Images supplied by path are mapped read-only instead of being read into a buffer; the
//! section copy into the staging buffer is the only pass over the file contents, so there is
//! no reason to hold a second heap copy for the duration of a mapping attempt.

use std::{fs, path::Path};

use memmap2::Mmap;

use super::Backend;
use crate::Result;

/// A read-only memory mapping of an image file.
///
/// The mapping stays valid for as long as the backend lives; [`crate::file::Image`] owns it
/// for the lifetime of the loaded image.
#[derive(Debug)]
pub struct Physical {
    data: Mmap,
}

impl Physical {
    /// Map the file at `path` into memory.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or mapped.
    pub fn new(path: impl AsRef<Path>) -> Result<Physical> {
        let file = fs::File::open(path)?;
        // SAFETY: the mapping is read-only and never outlives `Physical`; a concurrent writer
        // truncating the file is outside what a loader can defend against.
        let data = unsafe { Mmap::map(&file) }?;

        Ok(Physical { data })
    }
}

impl Backend for Physical {
    fn data(&self) -> &[u8] {
        &self.data
    }
}
