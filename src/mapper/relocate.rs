use super::StagingBuffer;
use crate::{
    pe::{RelocationBlock, RelocationType},
    Result,
};

/// Add `delta` to every `DIR64` site named by `blocks`.
///
/// The addition wraps, so a negative delta (target below the preferred base) is expressed as
/// its two's complement. Entries of any other type are left untouched. Returns the number of
/// sites patched.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] if a `DIR64` site does not fit the staging buffer.
pub fn relocate_image_by_delta(
    staging: &mut StagingBuffer,
    blocks: &[RelocationBlock],
    delta: u64,
) -> Result<usize> {
    let mut patched = 0;
    for block in blocks {
        for entry in &block.entries {
            if entry.kind != RelocationType::Dir64 {
                continue;
            }

            let site = block.site(entry) as usize;
            let value = staging.read_u64(site).map_err(|_| {
                malformed_error!("Relocation site {:#x} lies outside the image", site)
            })?;
            staging.write_u64(site, value.wrapping_add(delta))?;
            patched += 1;
        }
    }

    Ok(patched)
}
