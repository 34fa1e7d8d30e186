//! Load configuration directory (`IMAGE_LOAD_CONFIG_DIRECTORY64`).
//!
//! Only the leading `Size` field and the `SecurityCookie` pointer are decoded. The cookie field
//! sits at a fixed offset; older or trimmed directories may be too short to contain it, in
//! which case the image simply has no cookie to initialize.

use crate::{file::io::read_le_at, pe::NtHeaders, Result};

/// Offset of `SecurityCookie` inside `IMAGE_LOAD_CONFIG_DIRECTORY64`.
pub const SECURITY_COOKIE_OFFSET: usize = 0x58;

/// The decoded parts of the load configuration directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadConfig {
    /// RVA of the directory
    pub rva: u32,
    /// Structure size as declared in its own `Size` field
    pub size: u32,
    /// Preferred-base VA of the `/GS` cookie, zero if absent
    pub security_cookie: u64,
}

/// Decode the load configuration directory of a mapped image.
///
/// Returns `Ok(None)` when the image has no load-config directory.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the directory lies outside `image`.
pub fn load_config(image: &[u8], headers: &NtHeaders) -> Result<Option<LoadConfig>> {
    let Some(directory) = headers.load_config else {
        return Ok(None);
    };

    let rva = directory.rva as usize;
    let mut offset = rva;
    let size = read_le_at::<u32>(image, &mut offset)?;

    let security_cookie = if (size as usize) >= SECURITY_COOKIE_OFFSET + 8 {
        let mut offset = rva
            .checked_add(SECURITY_COOKIE_OFFSET)
            .ok_or(crate::Error::OutOfBounds)?;
        read_le_at::<u64>(image, &mut offset)?
    } else {
        0
    };

    Ok(Some(LoadConfig {
        rva: directory.rva,
        size,
        security_cookie,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::ImageBuilder,
        pe::{Directory, SectionFlags},
        Error,
    };

    fn headers() -> NtHeaders {
        let image = ImageBuilder::new()
            .section(".data", SectionFlags::MEM_READ, 0x1000, vec![0; 8])
            .build();
        NtHeaders::parse(&image.bytes).unwrap()
    }

    #[test]
    fn decode_cookie() {
        let mut image = vec![0_u8; 0x200];
        image[0x100..0x104].copy_from_slice(&0x108_u32.to_le_bytes());
        image[0x158..0x160].copy_from_slice(&0x1_4000_3000_u64.to_le_bytes());

        let mut headers = headers();
        headers.load_config = Some(Directory {
            rva: 0x100,
            size: 0x108,
        });

        let config = load_config(&image, &headers).unwrap().unwrap();
        assert_eq!(config.size, 0x108);
        assert_eq!(config.security_cookie, 0x1_4000_3000);
    }

    #[test]
    fn short_directory_has_no_cookie() {
        let mut image = vec![0_u8; 0x200];
        image[0x100..0x104].copy_from_slice(&0x40_u32.to_le_bytes());
        image[0x158..0x160].copy_from_slice(&0x1_4000_3000_u64.to_le_bytes());

        let mut headers = headers();
        headers.load_config = Some(Directory {
            rva: 0x100,
            size: 0x40,
        });

        let config = load_config(&image, &headers).unwrap().unwrap();
        assert_eq!(config.security_cookie, 0);
    }

    #[test]
    fn absent_and_out_of_range() {
        let mut headers = headers();
        assert!(load_config(&[], &headers).unwrap().is_none());

        headers.load_config = Some(Directory {
            rva: 0x1FE,
            size: 0x70,
        });
        assert!(matches!(
            load_config(&[0_u8; 0x200], &headers),
            Err(Error::OutOfBounds)
        ));
    }
}
