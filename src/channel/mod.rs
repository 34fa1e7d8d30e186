//! Privileged-memory channel.
//!
//! The mapper never touches target memory directly. Every interaction with the target address
//! space is one blocking request through a [`KernelChannel`]: allocate a pool block, copy bytes
//! into it, zero a range, free it, call a function inside it, or look up an export of a module
//! that is already resident there.
//!
//! Channel requests are strictly request/response with no interleaving, which is why every
//! method takes `&mut self`: holding the channel mutably for the duration of a mapping attempt
//! rules out a second attempt on the same channel at compile time.
//!
//! [`SimulatedChannel`] implements the trait entirely in process. It backs the test-suite and
//! the CLI's dry-run staging command.

mod simulated;

use std::fmt;

use strum::{Display, EnumIter};

use crate::Result;

pub use simulated::{ChannelCall, SimulatedChannel, DEFAULT_POOL_BASE};

/// Pool the target allocation is carved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum PoolType {
    /// Non-paged, executable pool (`NonPagedPool`)
    NonPaged,
    /// Paged pool (`PagedPool`)
    Paged,
    /// Non-paged, non-executable pool (`NonPagedPoolNx`)
    NonPagedNx,
}

impl PoolType {
    /// The native `POOL_TYPE` value.
    #[must_use]
    pub fn raw(self) -> u32 {
        match self {
            PoolType::NonPaged => 0,
            PoolType::Paged => 1,
            PoolType::NonPagedNx => 512,
        }
    }
}

/// Status code returned by an invoked function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NtStatus(pub u32);

impl NtStatus {
    /// `STATUS_SUCCESS`
    pub const SUCCESS: NtStatus = NtStatus(0);
    /// `STATUS_UNSUCCESSFUL`
    pub const UNSUCCESSFUL: NtStatus = NtStatus(0xC000_0001);

    /// Success and informational codes (severity bit clear).
    #[must_use]
    pub fn is_success(self) -> bool {
        self.0 & 0x8000_0000 == 0
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Request/response access to the target address space.
///
/// Addresses are target-space addresses; a zero address is never valid. Implementations are
/// expected to block until the target side has completed each request.
pub trait KernelChannel {
    /// Allocate `size` bytes from `pool`.
    ///
    /// Returns `None` (or `Some(0)`, which callers treat the same) on failure.
    fn allocate(&mut self, pool: PoolType, size: usize) -> Option<u64>;

    /// Copy `data` to `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the target refused or only partially completed the write.
    fn write(&mut self, address: u64, data: &[u8]) -> Result<()>;

    /// Fill `size` bytes at `address` with zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the target refused the request.
    fn zero(&mut self, address: u64, size: usize) -> Result<()>;

    /// Release an allocation previously returned by [`KernelChannel::allocate`].
    fn free(&mut self, address: u64);

    /// Call the function at `address` with up to a handful of scalar arguments and return its
    /// status.
    ///
    /// # Errors
    ///
    /// Returns an error if the call could not be performed; a call that ran and returned a
    /// failure status is *not* an error.
    fn invoke(&mut self, address: u64, args: &[u64]) -> Result<NtStatus>;

    /// Look up `name` in the export directory of the resident module at `module_base`.
    fn resolve_export(&mut self, module_base: u64, name: &str) -> Option<u64>;
}

impl<C: KernelChannel + ?Sized> KernelChannel for &mut C {
    fn allocate(&mut self, pool: PoolType, size: usize) -> Option<u64> {
        (**self).allocate(pool, size)
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        (**self).write(address, data)
    }

    fn zero(&mut self, address: u64, size: usize) -> Result<()> {
        (**self).zero(address, size)
    }

    fn free(&mut self, address: u64) {
        (**self).free(address);
    }

    fn invoke(&mut self, address: u64, args: &[u64]) -> Result<NtStatus> {
        (**self).invoke(address, args)
    }

    fn resolve_export(&mut self, module_base: u64, name: &str) -> Option<u64> {
        (**self).resolve_export(module_base, name)
    }
}
