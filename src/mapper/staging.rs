use crate::{
    file::io::{read_le_at, write_le_at},
    Error, Result,
};

/// Local working copy of an image, laid out in memory order.
///
/// The buffer is `SizeOfImage` bytes, zero-filled, and addressed by RVA: offset `n` holds the
/// byte that will end up at `target_base + n`. Every fixup happens here before the single bulk
/// transfer into the target space.
#[derive(Debug)]
pub struct StagingBuffer {
    data: Vec<u8>,
}

impl StagingBuffer {
    /// Allocate a zero-filled buffer of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::StagingAllocation`] if the host cannot provide the memory.
    pub fn new(size: usize) -> Result<StagingBuffer> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| Error::StagingAllocation(size))?;
        data.resize(size, 0);

        Ok(StagingBuffer { data })
    }

    /// Size of the buffer in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the buffer has a length of zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The staged image.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// The staged image, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Host address of the byte at `rva`.
    ///
    /// Only meaningful as a value (the cookie derivation mixes it in); it is never dereferenced.
    #[must_use]
    pub fn local_address(&self, rva: usize) -> u64 {
        (self.data.as_ptr() as u64).wrapping_add(rva as u64)
    }

    /// Translate a preferred-base VA into an RVA inside the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if `va` is below `image_base` or past the buffer.
    pub fn rva_of(&self, va: u64, image_base: u64) -> Result<usize> {
        let rva = va.checked_sub(image_base).ok_or(Error::OutOfBounds)?;
        match usize::try_from(rva) {
            Ok(rva) if rva < self.data.len() => Ok(rva),
            _ => Err(Error::OutOfBounds),
        }
    }

    /// Copy `bytes` to `rva`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the range does not fit the buffer.
    pub fn copy_in(&mut self, rva: usize, bytes: &[u8]) -> Result<()> {
        let end = rva.checked_add(bytes.len()).ok_or(Error::OutOfBounds)?;
        let Some(destination) = self.data.get_mut(rva..end) else {
            return Err(Error::OutOfBounds);
        };

        destination.copy_from_slice(bytes);
        Ok(())
    }

    /// Read the little-endian `u64` at `rva`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the value does not fit the buffer.
    pub fn read_u64(&self, rva: usize) -> Result<u64> {
        let mut offset = rva;
        read_le_at::<u64>(&self.data, &mut offset)
    }

    /// Write `value` as a little-endian `u64` at `rva`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the value does not fit the buffer.
    pub fn write_u64(&mut self, rva: usize, value: u64) -> Result<()> {
        let mut offset = rva;
        write_le_at(&mut self.data, &mut offset, value)
    }
}
