use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};

use super::{KernelChannel, NtStatus, PoolType};
use crate::{Error, Result};

/// First address handed out by [`SimulatedChannel::new`].
pub const DEFAULT_POOL_BASE: u64 = 0xFFFF_A000_0000_0000;

const PAGE_SIZE: u64 = 0x1000;

/// One request observed by a [`SimulatedChannel`], in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCall {
    /// `allocate`, with the address handed out (if any)
    Allocate {
        /// Requested pool
        pool: PoolType,
        /// Requested size
        size: usize,
        /// Returned address
        address: Option<u64>,
    },
    /// `write`
    Write {
        /// Destination
        address: u64,
        /// Bytes written
        size: usize,
    },
    /// `zero`
    Zero {
        /// Destination
        address: u64,
        /// Bytes zeroed
        size: usize,
    },
    /// `free`
    Free {
        /// Released allocation
        address: u64,
    },
    /// `invoke`
    Invoke {
        /// Called function
        address: u64,
        /// Scalar arguments
        args: Vec<u64>,
    },
    /// `resolve_export`
    ResolveExport {
        /// Module searched
        module_base: u64,
        /// Export name
        name: String,
    },
}

/// An in-process stand-in for a privileged-memory channel.
///
/// Allocations are backed by heap buffers at fake target addresses handed out by a bump
/// allocator, so everything written through the channel can be inspected afterwards with
/// [`SimulatedChannel::memory`]. Exports are served from a table filled with
/// [`SimulatedChannel::with_export`]. Individual requests can be made to fail to exercise error
/// paths.
///
/// # Examples
///
/// ```rust,no_run
/// use pemap::{KernelChannel, PoolType, SimulatedChannel};
///
/// let mut channel = SimulatedChannel::new();
/// let address = channel.allocate(PoolType::NonPaged, 0x2000).unwrap();
/// channel.write(address + 0x10, &[1, 2, 3])?;
/// assert_eq!(&channel.memory(address).unwrap()[0x10..0x13], &[1, 2, 3]);
/// # Ok::<(), pemap::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct SimulatedChannel {
    next_address: u64,
    allocations: BTreeMap<u64, Vec<u8>>,
    exports: HashMap<(u64, String), u64>,
    calls: Vec<ChannelCall>,
    entry_status: NtStatus,
    fail_allocate: bool,
    fail_write: bool,
    fail_zero: bool,
    fail_invoke: bool,
}

impl Default for SimulatedChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedChannel {
    /// Create a channel handing out addresses from [`DEFAULT_POOL_BASE`].
    #[must_use]
    pub fn new() -> SimulatedChannel {
        Self::with_base(DEFAULT_POOL_BASE)
    }

    /// Create a channel handing out addresses starting at `base` (rounded up to a page).
    #[must_use]
    pub fn with_base(base: u64) -> SimulatedChannel {
        SimulatedChannel {
            next_address: base.max(PAGE_SIZE).next_multiple_of(PAGE_SIZE),
            allocations: BTreeMap::new(),
            exports: HashMap::new(),
            calls: Vec::new(),
            entry_status: NtStatus::SUCCESS,
            fail_allocate: false,
            fail_write: false,
            fail_zero: false,
            fail_invoke: false,
        }
    }

    /// Register `name` as exported at `address` by the module loaded at `module_base`.
    #[must_use]
    pub fn with_export(mut self, module_base: u64, name: &str, address: u64) -> Self {
        self.exports.insert((module_base, name.to_string()), address);
        self
    }

    /// Status every invoked function returns.
    #[must_use]
    pub fn with_entry_status(mut self, status: NtStatus) -> Self {
        self.entry_status = status;
        self
    }

    /// Make every `allocate` request fail.
    #[must_use]
    pub fn fail_allocate(mut self, fail: bool) -> Self {
        self.fail_allocate = fail;
        self
    }

    /// Make every `write` request fail.
    #[must_use]
    pub fn fail_write(mut self, fail: bool) -> Self {
        self.fail_write = fail;
        self
    }

    /// Make every `zero` request fail.
    #[must_use]
    pub fn fail_zero(mut self, fail: bool) -> Self {
        self.fail_zero = fail;
        self
    }

    /// Make every `invoke` request fail.
    #[must_use]
    pub fn fail_invoke(mut self, fail: bool) -> Self {
        self.fail_invoke = fail;
        self
    }

    /// Every request issued so far, oldest first.
    #[must_use]
    pub fn calls(&self) -> &[ChannelCall] {
        &self.calls
    }

    /// Contents of the live allocation starting at `address`.
    #[must_use]
    pub fn memory(&self, address: u64) -> Option<&[u8]> {
        self.allocations.get(&address).map(Vec::as_slice)
    }

    /// Number of allocations that have not been freed.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    /// Number of successful `allocate` requests.
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, ChannelCall::Allocate { address: Some(_), .. }))
            .count()
    }

    /// Number of `free` requests.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, ChannelCall::Free { .. }))
            .count()
    }

    /// Number of `write` requests.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, ChannelCall::Write { .. }))
            .count()
    }

    /// Locate the allocation containing `[address, address + size)`.
    fn region_mut(&mut self, address: u64, size: usize) -> Result<&mut [u8]> {
        let Some((&base, memory)) = self.allocations.range_mut(..=address).next_back() else {
            return Err(Error::Channel(format!(
                "{address:#x} is not inside any allocation"
            )));
        };

        let start = usize::try_from(address - base).map_err(|_| Error::OutOfBounds)?;
        match start.checked_add(size) {
            Some(end) if end <= memory.len() => Ok(&mut memory[start..end]),
            _ => Err(Error::Channel(format!(
                "{size:#x} bytes at {address:#x} overrun the allocation at {base:#x}"
            ))),
        }
    }

    fn contains(&self, address: u64) -> bool {
        self.allocations
            .range(..=address)
            .next_back()
            .is_some_and(|(&base, memory)| address - base < memory.len() as u64)
    }
}

impl KernelChannel for SimulatedChannel {
    fn allocate(&mut self, pool: PoolType, size: usize) -> Option<u64> {
        let address = if self.fail_allocate || size == 0 {
            None
        } else {
            let address = self.next_address;
            let span = (size as u64).next_multiple_of(PAGE_SIZE) + PAGE_SIZE;
            self.next_address = address.checked_add(span)?;
            self.allocations.insert(address, vec![0_u8; size]);
            Some(address)
        };

        debug!("simulated allocate({pool}, {size:#x}) -> {address:x?}");
        self.calls.push(ChannelCall::Allocate {
            pool,
            size,
            address,
        });
        address
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.calls.push(ChannelCall::Write {
            address,
            size: data.len(),
        });
        if self.fail_write {
            return Err(Error::Channel("write rejected".to_string()));
        }

        self.region_mut(address, data.len())?.copy_from_slice(data);
        Ok(())
    }

    fn zero(&mut self, address: u64, size: usize) -> Result<()> {
        self.calls.push(ChannelCall::Zero { address, size });
        if self.fail_zero {
            return Err(Error::Channel("zero rejected".to_string()));
        }

        self.region_mut(address, size)?.fill(0);
        Ok(())
    }

    fn free(&mut self, address: u64) {
        self.calls.push(ChannelCall::Free { address });
        if self.allocations.remove(&address).is_none() {
            warn!("simulated free of unknown allocation {address:#x}");
        }
    }

    fn invoke(&mut self, address: u64, args: &[u64]) -> Result<NtStatus> {
        self.calls.push(ChannelCall::Invoke {
            address,
            args: args.to_vec(),
        });
        if self.fail_invoke {
            return Err(Error::Channel("call rejected".to_string()));
        }
        if !self.contains(address) {
            return Err(Error::Channel(format!(
                "{address:#x} is not inside any allocation"
            )));
        }

        Ok(self.entry_status)
    }

    fn resolve_export(&mut self, module_base: u64, name: &str) -> Option<u64> {
        self.calls.push(ChannelCall::ResolveExport {
            module_base,
            name: name.to_string(),
        });
        self.exports.get(&(module_base, name.to_string())).copied()
    }
}
