//! `/GS` security cookie initialization.
//!
//! Images compiled with `/GS` read their stack-guard value from a global whose address the load
//! configuration directory records. The platform loader seeds that global before the entry
//! point runs; a manually mapped image has to be seeded here, or every guarded function would
//! compare against the compile-time placeholder.

use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use super::StagingBuffer;
use crate::{
    pe::{load_config, NtHeaders},
    Result,
};

/// The compile-time placeholder value of a 64-bit `/GS` cookie.
pub const DEFAULT_SECURITY_COOKIE: u64 = 0x0000_2B99_2DDF_A232;

/// Cookies are restricted to the low 48 bits.
const COOKIE_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// 100 ns intervals between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

/// Source of the low half of the system time, in 100 ns units since 1601.
pub trait SystemClock {
    /// Low 32 bits of the current system time.
    fn low_system_time(&self) -> u32;
}

/// [`SystemClock`] backed by the host's wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostClock;

impl SystemClock for HostClock {
    fn low_system_time(&self) -> u32 {
        let since_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let ticks = (since_unix.as_nanos() / 100) as u64 + FILETIME_UNIX_EPOCH;

        ticks as u32
    }
}

/// [`SystemClock`] that always reports the same time.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedClock(pub u32);

impl SystemClock for FixedClock {
    fn low_system_time(&self) -> u32 {
        self.0
    }
}

/// What [`init_stack_cookie`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieOutcome {
    /// The image has no (or an empty) load configuration directory
    NoLoadConfig,
    /// The directory has no `SecurityCookie`
    NoCookie,
    /// A fresh cookie was written
    Initialized {
        /// The value written
        cookie: u64,
        /// RVA of the complement slot, if one was found next to the cookie
        complement: Option<usize>,
    },
}

fn derive_cookie(low_system_time: u32, local_address: u64) -> u64 {
    let cookie = (u64::from(low_system_time) ^ local_address) & COOKIE_MASK;
    if cookie == DEFAULT_SECURITY_COOKIE {
        cookie + 1
    } else {
        cookie
    }
}

/// Seed the image's `/GS` cookie in the staging buffer.
///
/// The new value is the low system time XOR the cookie's local address, masked to 48 bits and
/// bumped by one if it happens to equal [`DEFAULT_SECURITY_COOKIE`]. MSVC places the cookie
/// complement in the adjacent 8-byte slot; the slot after the cookie is probed first, then the
/// one before, and whichever still holds `!DEFAULT_SECURITY_COOKIE` receives `!cookie`. Finding
/// no complement is not an error.
///
/// # Errors
///
/// - [`crate::Error::OutOfBounds`] if the directory itself lies outside the image
/// - [`crate::Error::Malformed`] if the cookie address does not translate into the image
pub fn init_stack_cookie(
    staging: &mut StagingBuffer,
    headers: &NtHeaders,
    clock: &dyn SystemClock,
) -> Result<CookieOutcome> {
    let Some(config) = load_config(staging.as_slice(), headers)? else {
        return Ok(CookieOutcome::NoLoadConfig);
    };
    if config.size == 0 {
        return Ok(CookieOutcome::NoLoadConfig);
    }
    if config.security_cookie == 0 {
        return Ok(CookieOutcome::NoCookie);
    }

    let rva = staging
        .rva_of(config.security_cookie, headers.image_base)
        .map_err(|_| {
            malformed_error!(
                "SecurityCookie {:#x} lies outside the image",
                config.security_cookie
            )
        })?;

    let cookie = derive_cookie(clock.low_system_time(), staging.local_address(rva));

    let complement = [rva.checked_add(8), rva.checked_sub(8)]
        .into_iter()
        .flatten()
        .find(|&slot| {
            staging
                .read_u64(slot)
                .is_ok_and(|value| value == !DEFAULT_SECURITY_COOKIE)
        });

    staging.write_u64(rva, cookie).map_err(|_| {
        malformed_error!("SecurityCookie at RVA {:#x} is truncated", rva)
    })?;
    match complement {
        Some(slot) => staging.write_u64(slot, !cookie)?,
        None => warn!("No cookie complement next to RVA {:#x}", rva),
    }

    debug!("Security cookie at RVA {:#x} set to {:#x}", rva, cookie);
    Ok(CookieOutcome::Initialized { cookie, complement })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::ImageBuilder,
        file::Image,
        mapper::{copy_layout, SectionFilter},
        pe::SectionFlags,
    };

    const BASE: u64 = 0x1_4000_0000;

    /// `.data` at 0x2000 holding the placeholder cookie at +0x10, flanked by `before` and
    /// `after`.
    fn staged(before: u64, after: u64, cookie_va: Option<u64>) -> (StagingBuffer, NtHeaders) {
        let mut data = vec![0_u8; 0x40];
        data[0x08..0x10].copy_from_slice(&before.to_le_bytes());
        data[0x10..0x18].copy_from_slice(&DEFAULT_SECURITY_COOKIE.to_le_bytes());
        data[0x18..0x20].copy_from_slice(&after.to_le_bytes());

        let mut builder = ImageBuilder::new()
            .image_base(BASE)
            .section(".text", SectionFlags::MEM_EXECUTE, 0x1000, vec![0xC3])
            .section(".data", SectionFlags::MEM_READ | SectionFlags::MEM_WRITE, 0x2000, data);
        if let Some(cookie_va) = cookie_va {
            builder = builder.load_config(cookie_va);
        }

        let image = Image::from_mem(builder.build().bytes).unwrap();
        let staging = copy_layout(&image, SectionFilter::All).unwrap();
        (staging, image.headers().clone())
    }

    #[test]
    fn complement_after_cookie() {
        let (mut staging, headers) = staged(0, !DEFAULT_SECURITY_COOKIE, Some(BASE + 0x2010));

        let outcome = init_stack_cookie(&mut staging, &headers, &FixedClock(0x1234_5678)).unwrap();
        let CookieOutcome::Initialized { cookie, complement } = outcome else {
            panic!("cookie not initialized: {outcome:?}");
        };

        assert_ne!(cookie, DEFAULT_SECURITY_COOKIE);
        assert_eq!(cookie & !COOKIE_MASK, 0);
        assert_eq!(
            cookie,
            (0x1234_5678 ^ staging.local_address(0x2010)) & COOKIE_MASK
        );
        assert_eq!(complement, Some(0x2018));
        assert_eq!(staging.read_u64(0x2010).unwrap(), cookie);
        assert_eq!(staging.read_u64(0x2018).unwrap(), !cookie);
        assert_eq!(staging.read_u64(0x2008).unwrap(), 0);
    }

    #[test]
    fn complement_before_cookie() {
        let (mut staging, headers) = staged(!DEFAULT_SECURITY_COOKIE, 0, Some(BASE + 0x2010));

        let outcome = init_stack_cookie(&mut staging, &headers, &HostClock).unwrap();
        let CookieOutcome::Initialized { cookie, complement } = outcome else {
            panic!("cookie not initialized: {outcome:?}");
        };
        assert_eq!(complement, Some(0x2008));
        assert_eq!(staging.read_u64(0x2008).unwrap(), !cookie);
        assert_eq!(staging.read_u64(0x2018).unwrap(), 0);
    }

    #[test]
    fn complement_not_found() {
        let (mut staging, headers) = staged(0, 0, Some(BASE + 0x2010));

        let outcome = init_stack_cookie(&mut staging, &headers, &FixedClock(7)).unwrap();
        assert!(matches!(
            outcome,
            CookieOutcome::Initialized {
                complement: None,
                ..
            }
        ));
        assert_eq!(staging.read_u64(0x2008).unwrap(), 0);
        assert_eq!(staging.read_u64(0x2018).unwrap(), 0);
        assert_ne!(staging.read_u64(0x2010).unwrap(), DEFAULT_SECURITY_COOKIE);
    }

    #[test]
    fn derivation() {
        assert_eq!(derive_cookie(0, DEFAULT_SECURITY_COOKIE), DEFAULT_SECURITY_COOKIE + 1);
        assert_eq!(
            derive_cookie(0xFFFF_FFFF, 0xFFFF_8000_0000_0000),
            0x0000_8000_FFFF_FFFF
        );
    }

    #[test]
    fn no_load_config_leaves_staging_untouched() {
        let (mut staging, headers) = staged(0, !DEFAULT_SECURITY_COOKIE, None);
        let before = staging.as_slice().to_vec();

        let outcome = init_stack_cookie(&mut staging, &headers, &HostClock).unwrap();
        assert_eq!(outcome, CookieOutcome::NoLoadConfig);
        assert_eq!(staging.as_slice(), before.as_slice());
    }

    #[test]
    fn zero_cookie_address() {
        let (mut staging, headers) = staged(0, 0, Some(0));
        let before = staging.as_slice().to_vec();

        let outcome = init_stack_cookie(&mut staging, &headers, &HostClock).unwrap();
        assert_eq!(outcome, CookieOutcome::NoCookie);
        assert_eq!(staging.as_slice(), before.as_slice());
    }

    #[test]
    fn cookie_outside_image() {
        let (mut staging, headers) = staged(0, 0, Some(BASE - 0x10));
        assert!(matches!(
            init_stack_cookie(&mut staging, &headers, &HostClock),
            Err(crate::Error::Malformed { .. })
        ));
    }
}
