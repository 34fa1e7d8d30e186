use log::debug;
use strum::Display;

use super::StagingBuffer;
use crate::{file::Image, pe::Section, Result};

/// Which sections [`copy_layout`] transfers from the file into the staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SectionFilter {
    /// Every section in the table
    All,
    /// Only sections that are readable, writable or executable and have file backing
    Mapped,
}

impl SectionFilter {
    /// Returns `true` if `section` is copied under this filter.
    #[must_use]
    pub fn admits(self, section: &Section) -> bool {
        match self {
            SectionFilter::All => true,
            SectionFilter::Mapped => {
                section.has_memory_access() && section.pointer_to_raw_data != 0
            }
        }
    }
}

/// Lay `image` out in memory order inside a fresh staging buffer.
///
/// See [`copy_layout_into`] for the copy rules.
///
/// # Errors
///
/// [`crate::Error::StagingAllocation`] if the buffer cannot be allocated, otherwise as
/// [`copy_layout_into`].
pub fn copy_layout(image: &Image, filter: SectionFilter) -> Result<StagingBuffer> {
    let mut staging = StagingBuffer::new(image.size_of_image())?;
    copy_layout_into(image, filter, &mut staging)?;
    Ok(staging)
}

/// Copy the headers and admitted sections of `image` into `staging`.
///
/// The first `SizeOfHeaders` bytes of the file are copied verbatim, then each admitted
/// section's `SizeOfRawData` bytes from `PointerToRawData` land at its `VirtualAddress`.
/// Everything else is left as it was (zero, for a fresh buffer).
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] if the headers or a section's raw data lie outside the
/// file, or a section does not fit the staging buffer.
pub fn copy_layout_into(
    image: &Image,
    filter: SectionFilter,
    staging: &mut StagingBuffer,
) -> Result<()> {
    let headers = image
        .data_slice(0, image.size_of_headers())
        .map_err(|_| {
            malformed_error!(
                "SizeOfHeaders {:#x} exceeds the file size {:#x}",
                image.size_of_headers(),
                image.len()
            )
        })?;
    staging.copy_in(0, headers).map_err(|_| {
        malformed_error!(
            "SizeOfHeaders {:#x} exceeds the staging buffer {:#x}",
            image.size_of_headers(),
            staging.len()
        )
    })?;

    for section in image.sections() {
        if !filter.admits(section) {
            debug!("Skipping section {} ({})", section.name(), filter);
            continue;
        }
        if section.size_of_raw_data == 0 {
            continue;
        }

        let raw = image
            .data_slice(
                section.pointer_to_raw_data as usize,
                section.size_of_raw_data as usize,
            )
            .map_err(|_| {
                malformed_error!(
                    "Section {} raw data {:#x}+{:#x} lies outside the file",
                    section.name(),
                    section.pointer_to_raw_data,
                    section.size_of_raw_data
                )
            })?;
        staging
            .copy_in(section.virtual_address as usize, raw)
            .map_err(|_| {
                malformed_error!(
                    "Section {} at {:#x}+{:#x} exceeds the staging buffer {:#x}",
                    section.name(),
                    section.virtual_address,
                    section.size_of_raw_data,
                    staging.len()
                )
            })?;

        debug!(
            "Copied section {} ({:#x} bytes) to RVA {:#x}",
            section.name(),
            raw.len(),
            section.virtual_address
        );
    }

    Ok(())
}
