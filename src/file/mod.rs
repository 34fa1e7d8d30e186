//! Source image abstraction.
//!
//! A mapping attempt starts from an immutable PE file, which may live on disk, in an owned
//! buffer, or inside the mapper's own binary. This module abstracts over those sources and
//! validates the headers once, up front, so that every later stage can rely on a PE32+ image
//! with a decoded section table.
//!
//! # Key Components
//!
//! - [`crate::file::Image`] - Validated source image with cached headers and sections
//! - [`crate::file::Backend`] - Trait for the different data sources
//! - [`crate::file::parser::Parser`] - Cursor used by the table decoders
//! - [`crate::file::io`] - Little-endian read/write helpers
//!
//! # Data Sources
//!
//! - [`crate::file::Physical`] - Memory-mapped file on disk
//! - [`crate::file::Memory`] - Owned in-memory buffer
//! - [`crate::file::Embedded`] - `&'static [u8]` compiled into the binary
//!
//! # Examples
//!
//! ```rust,no_run
//! use pemap::file::Image;
//!
//! let image = Image::from_file("driver.sys")?;
//! println!("Image base: 0x{:x}", image.image_base());
//! for section in image.sections() {
//!     println!("{:<8} RVA 0x{:x} raw 0x{:x}", section.name(), section.virtual_address,
//!              section.size_of_raw_data);
//! }
//! # Ok::<(), pemap::Error>(())
//! ```

pub mod io;
pub mod parser;

mod memory;
mod physical;

use std::path::Path;

use crate::{
    pe::{NtHeaders, Section},
    Error::{Empty, OutOfBounds},
    Result,
};

pub use memory::{Embedded, Memory};
pub use physical::Physical;

/// Backend trait for image data sources.
///
/// This trait abstracts over the source of PE data, allowing for on-disk, owned and static
/// representations behind one interface.
pub trait Backend {
    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize {
        self.data().len()
    }

    /// Returns `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the range does not lie within the data.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.data().get(offset..end))
            .ok_or(OutOfBounds)
    }
}

/// A validated PE32+ source image.
///
/// Construction parses and validates the NT headers and section table; an `Image` that exists
/// is always a 64-bit PE with a consistent `SizeOfHeaders <= SizeOfImage`. The bytes are never
/// modified: all fixups happen on a staging copy.
pub struct Image {
    /// The underlying data source
    data: Box<dyn Backend>,
    /// Validated headers
    headers: NtHeaders,
    /// Decoded section table
    sections: Vec<Section>,
}

impl Image {
    /// Loads an image from the given path.
    ///
    /// The file is memory-mapped for the lifetime of the `Image`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read or opened
    /// - The file is empty
    /// - The headers do not parse, or the image is not PE32+ ([`crate::Error::NotSupported`])
    pub fn from_file(path: impl AsRef<Path>) -> Result<Image> {
        let input = Physical::new(path)?;

        Self::load(input)
    }

    /// Loads an image from an owned buffer.
    ///
    /// # Errors
    ///
    /// See [`Image::from_file`].
    pub fn from_mem(data: Vec<u8>) -> Result<Image> {
        let input = Memory::new(data);

        Self::load(input)
    }

    /// Loads an image compiled into the binary.
    ///
    /// # Errors
    ///
    /// See [`Image::from_file`].
    pub fn from_static(data: &'static [u8]) -> Result<Image> {
        let input = Embedded::new(data);

        Self::load(input)
    }

    fn load<T: Backend + 'static>(data: T) -> Result<Image> {
        if data.len() == 0 {
            return Err(Empty);
        }

        let headers = NtHeaders::parse(data.data())?;
        let sections = Section::parse_table(data.data(), &headers)?;

        Ok(Image {
            data: Box::new(data),
            headers,
            sections,
        })
    }

    /// Returns the total size of the source in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the source has a length of zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the raw source bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    /// Returns a bounds-checked slice of the source bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the range exceeds the source.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.data.data_slice(offset, len)
    }

    /// Returns the validated NT headers.
    #[must_use]
    pub fn headers(&self) -> &NtHeaders {
        &self.headers
    }

    /// Returns the decoded section table.
    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Preferred load address from the optional header.
    #[must_use]
    pub fn image_base(&self) -> u64 {
        self.headers.image_base
    }

    /// Size of the image once mapped (`SizeOfImage`).
    #[must_use]
    pub fn size_of_image(&self) -> usize {
        self.headers.size_of_image
    }

    /// Size of the header region (`SizeOfHeaders`).
    #[must_use]
    pub fn size_of_headers(&self) -> usize {
        self.headers.size_of_headers
    }

    /// Converts a preferred-base VA into an RVA.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if `va` is below the image base or beyond the
    /// mapped size.
    pub fn va_to_rva(&self, va: u64) -> Result<usize> {
        let Some(rva) = va.checked_sub(self.image_base()) else {
            return Err(crate::Error::OutOfBounds);
        };

        match usize::try_from(rva) {
            Ok(rva) if rva < self.size_of_image() => Ok(rva),
            _ => Err(crate::Error::OutOfBounds),
        }
    }
}
