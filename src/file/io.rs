//! Low-level little-endian reading and writing utilities for PE structures.
//!
//! Every PE structure this crate touches is little-endian, so only little-endian helpers are
//! provided. All operations are bounds-checked and report [`crate::Error::OutOfBounds`] instead
//! of panicking, which matters because relocation and import tables are attacker-shaped input:
//! an offset inside a relocation block may point anywhere.
//!
//! # Key Components
//!
//! - [`crate::file::io::ImageIO`] - Trait implemented by the primitive integer types used in
//!   PE structures
//! - [`crate::file::io::read_le`] / [`crate::file::io::read_le_at`] - Reading helpers
//! - [`crate::file::io::write_le`] / [`crate::file::io::write_le_at`] - Writing helpers
//!
//! # Usage Examples
//!
//! ```rust,ignore
//! use pemap::file::io::{read_le_at, write_le_at};
//!
//! let mut data = [0u8; 8];
//! let mut offset = 0;
//! write_le_at(&mut data, &mut offset, 0x1234_u16)?;
//! write_le_at(&mut data, &mut offset, 0xDEAD_BEEF_u32)?;
//!
//! let mut offset = 0;
//! let first: u16 = read_le_at(&data, &mut offset)?;
//! let second: u32 = read_le_at(&data, &mut offset)?;
//! assert_eq!((first, second, offset), (0x1234, 0xDEAD_BEEF, 6));
//! # Ok::<(), pemap::Error>(())
//! ```

use crate::{Error::OutOfBounds, Result};

/// Trait for type-specific safe binary data reading and writing.
///
/// Each implementation defines a `Bytes` associated type that represents the fixed-size byte
/// array required for that particular type (e.g., `[u8; 4]` for `u32`).
pub trait ImageIO: Sized {
    /// Associated type representing the byte array type for this numeric type.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Read T from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in little-endian
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_image_io {
    ($($ty:ty),*) => {$(
        impl ImageIO for $ty {
            type Bytes = [u8; std::mem::size_of::<$ty>()];

            fn from_le_bytes(bytes: Self::Bytes) -> Self {
                <$ty>::from_le_bytes(bytes)
            }

            fn to_le_bytes(self) -> Self::Bytes {
                <$ty>::to_le_bytes(self)
            }
        }
    )*};
}

impl_image_io!(u8, u16, u32, u64);

/// Safely reads a value of type `T` in little-endian byte order from the start of `data`.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le<T: ImageIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Safely reads a value of type `T` in little-endian byte order at `offset`, advancing the
/// offset by the number of bytes read.
///
/// # Arguments
///
/// * `data` - The byte buffer to read from
/// * `offset` - Mutable reference to the offset position (will be advanced after reading)
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes, including when
/// `offset + size_of::<T>()` overflows.
pub fn read_le_at<T: ImageIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let end = offset
        .checked_add(std::mem::size_of::<T>())
        .ok_or(OutOfBounds)?;
    let bytes = data.get(*offset..end).ok_or(OutOfBounds)?;
    let Ok(value) = bytes.try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;
    Ok(T::from_le_bytes(value))
}

/// Safely writes a value of type `T` in little-endian byte order to the start of `data`.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too small.
pub fn write_le<T: ImageIO>(data: &mut [u8], value: T) -> Result<()> {
    let mut offset = 0_usize;
    write_le_at(data, &mut offset, value)
}

/// Safely writes a value of type `T` in little-endian byte order at `offset`, advancing the
/// offset by the number of bytes written.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too small.
pub fn write_le_at<T: ImageIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let end = offset
        .checked_add(std::mem::size_of::<T>())
        .ok_or(OutOfBounds)?;
    data.get_mut(*offset..end)
        .ok_or(OutOfBounds)?
        .copy_from_slice(value.to_le_bytes().as_ref());

    *offset = end;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    const TEST_BUFFER: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    #[test]
    fn read_le_u16() {
        let result = read_le::<u16>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x0201);
    }

    #[test]
    fn read_le_u32() {
        let result = read_le::<u32>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x0403_0201);
    }

    #[test]
    fn read_le_u64() {
        let result = read_le::<u64>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x0807_0605_0403_0201);
    }

    #[test]
    fn read_le_at_advances() {
        let mut offset = 2;
        let result = read_le_at::<u16>(&TEST_BUFFER, &mut offset).unwrap();
        assert_eq!(result, 0x0403);
        assert_eq!(offset, 4);
    }

    #[test]
    fn read_errors() {
        let buffer = [0xFF, 0xFF, 0xFF, 0xFF];
        assert!(matches!(read_le::<u64>(&buffer), Err(Error::OutOfBounds)));

        let mut offset = usize::MAX;
        assert!(matches!(
            read_le_at::<u8>(&buffer, &mut offset),
            Err(Error::OutOfBounds)
        ));
        assert_eq!(offset, usize::MAX);
    }

    #[test]
    fn write_le_at_sequence() {
        let mut data = [0u8; 8];
        let mut offset = 0;

        write_le_at(&mut data, &mut offset, 0x0201_u16).unwrap();
        write_le_at(&mut data, &mut offset, 0x0605_0403_u32).unwrap();
        write_le_at(&mut data, &mut offset, 0x07_u8).unwrap();

        assert_eq!(offset, 7);
        assert_eq!(data, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x00]);
    }

    #[test]
    fn write_errors_leave_buffer_untouched() {
        let mut data = [0xAA_u8; 6];
        let mut offset = 0;
        assert!(matches!(
            write_le_at(&mut data, &mut offset, 0_u64),
            Err(Error::OutOfBounds)
        ));
        assert_eq!(offset, 0);
        assert_eq!(data, [0xAA; 6]);
    }
}
