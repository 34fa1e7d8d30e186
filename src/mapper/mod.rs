//! Manual mapping engine.
//!
//! A mapping attempt takes a validated [`crate::file::Image`] from its on-disk layout to a
//! running image in the target address space. Every structural decision is made on a local
//! [`StagingBuffer`]; the target space only sees one allocation, one bulk write, one call, and
//! a final zeroing of the headers.
//!
//! # Stages
//!
//! 1. [`MapStage::Validate`] - the source parses as a PE32+ image
//! 2. [`MapStage::Allocate`] - staging buffer and [`TargetAllocation`] of `SizeOfImage` bytes
//! 3. [`MapStage::CopyLayout`] - headers and sections into the staging buffer ([`copy_layout`])
//! 4. [`MapStage::CheckRelocations`] - reject images whose relocations were stripped
//! 5. [`MapStage::InitCookie`] - seed the `/GS` cookie, if the profile asks for it
//! 6. [`MapStage::Relocate`] - apply the base delta ([`relocate_image_by_delta`])
//! 7. [`MapStage::ResolveImports`] - bind the IAT ([`resolve_imports`])
//! 8. [`MapStage::Transfer`] - write the staging buffer to the target
//! 9. [`MapStage::Invoke`] - call the entry point
//! 10. [`MapStage::EraseHeaders`] - zero the first `SizeOfHeaders` bytes of the target
//!
//! A failure at any stage before the invocation returns succeeds releases the target
//! allocation exactly once, through the [`TargetAllocation`] guard. Header erasure happens after
//! the image already runs, so its failure is only reported.
//!
//! # Examples
//!
//! ```rust,no_run
//! use pemap::{Mapper, MapOptions, PoolType, SimulatedChannel, StaticRegistry};
//!
//! let registry = StaticRegistry::new().with_module("ntoskrnl.exe", 0xFFFF_F800_0000_0000);
//! let mut mapper = Mapper::new(SimulatedChannel::new(), registry)
//!     .with_options(MapOptions::default().pool(PoolType::NonPagedNx));
//!
//! let mapped = mapper.map_file("driver.sys")?;
//! println!("entry point returned {}", mapped.status);
//! # Ok::<(), pemap::Error>(())
//! ```

mod cookie;
mod imports;
mod layout;
mod relocate;
mod staging;

use std::path::Path;

use log::{debug, error, info, warn};
use strum::{Display, EnumIter};

use crate::{
    channel::{KernelChannel, NtStatus, PoolType},
    file::Image,
    pe::{self, relocation_blocks},
    registry::ModuleRegistry,
    Error, Result,
};

pub use cookie::{
    init_stack_cookie, CookieOutcome, FixedClock, HostClock, SystemClock,
    DEFAULT_SECURITY_COOKIE,
};
pub use imports::resolve_imports;
pub use layout::{copy_layout, copy_layout_into, SectionFilter};
pub use relocate::relocate_image_by_delta;
pub use staging::StagingBuffer;

/// The step a mapping attempt was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum MapStage {
    /// Parsing and validating the source image
    Validate,
    /// Allocating the staging buffer or the target memory
    Allocate,
    /// Copying headers and sections into the staging buffer
    CopyLayout,
    /// Decoding relocations and rejecting stripped images
    CheckRelocations,
    /// Seeding the security cookie
    InitCookie,
    /// Applying the base delta
    Relocate,
    /// Binding imports
    ResolveImports,
    /// Writing the staged image to the target
    Transfer,
    /// Calling the entry point
    Invoke,
    /// Zeroing the target headers
    EraseHeaders,
}

/// How a source image is laid out and prepared.
///
/// The two source kinds historically differ: file-sourced images copy every section and keep
/// the compiled-in cookie, embedded images copy only accessible, file-backed sections and get
/// a fresh cookie. Both profiles are available as constructors and can be mixed freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapProfile {
    /// Which sections are copied into the staging buffer
    pub sections: SectionFilter,
    /// Seed the `/GS` cookie before relocation
    pub init_cookie: bool,
    /// Fail images that have no relocations and are flagged `RELOCS_STRIPPED`
    pub reject_stripped_relocations: bool,
    /// Report validation failures at debug level instead of error level
    pub quiet_validation: bool,
}

impl MapProfile {
    /// Profile for images read from a file.
    #[must_use]
    pub fn file() -> MapProfile {
        MapProfile {
            sections: SectionFilter::All,
            init_cookie: false,
            reject_stripped_relocations: true,
            quiet_validation: false,
        }
    }

    /// Profile for images compiled into the mapper.
    #[must_use]
    pub fn embedded() -> MapProfile {
        MapProfile {
            sections: SectionFilter::Mapped,
            init_cookie: true,
            reject_stripped_relocations: true,
            quiet_validation: true,
        }
    }
}

impl Default for MapProfile {
    fn default() -> Self {
        Self::file()
    }
}

/// Target-side knobs of a mapping attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapOptions {
    /// Pool the image is allocated from
    pub pool: PoolType,
    /// Scalar arguments passed to the entry point
    pub entry_args: Vec<u64>,
    /// Zero the target headers after the entry point returned
    pub erase_headers: bool,
}

impl Default for MapOptions {
    fn default() -> Self {
        MapOptions {
            pool: PoolType::NonPaged,
            entry_args: Vec::new(),
            erase_headers: true,
        }
    }
}

impl MapOptions {
    /// Set the allocation pool.
    #[must_use]
    pub fn pool(mut self, pool: PoolType) -> Self {
        self.pool = pool;
        self
    }

    /// Set the entry point arguments.
    #[must_use]
    pub fn entry_args(mut self, args: &[u64]) -> Self {
        self.entry_args = args.to_vec();
        self
    }

    /// Enable or disable header erasure.
    #[must_use]
    pub fn erase_headers(mut self, erase: bool) -> Self {
        self.erase_headers = erase;
        self
    }
}

/// A successfully mapped and started image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedImage {
    /// Target address of the image
    pub base: u64,
    /// Size of the allocation (`SizeOfImage`)
    pub size: usize,
    /// Target address of the entry point that was called
    pub entry_point: u64,
    /// Status the entry point returned
    pub status: NtStatus,
}

/// Scoped ownership of a target-space allocation.
///
/// The allocation is freed when the guard drops, unless [`TargetAllocation::commit`] was called
/// first. Committing hands the memory over to the mapped image.
pub struct TargetAllocation<'c, C: KernelChannel + ?Sized> {
    channel: &'c mut C,
    address: u64,
    size: usize,
    committed: bool,
}

impl<'c, C: KernelChannel + ?Sized> TargetAllocation<'c, C> {
    /// Allocate `size` bytes from `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::AllocationFailed`] if the channel returns no address or zero.
    pub fn allocate(channel: &'c mut C, pool: PoolType, size: usize) -> Result<Self> {
        let Some(address) = channel.allocate(pool, size).filter(|&address| address != 0) else {
            return Err(Error::AllocationFailed(size));
        };

        Ok(TargetAllocation {
            channel,
            address,
            size,
            committed: false,
        })
    }

    /// Target address of the allocation.
    #[must_use]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Size of the allocation.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The channel the allocation lives behind.
    pub fn channel(&mut self) -> &mut C {
        self.channel
    }

    /// Keep the allocation alive past the guard.
    pub fn commit(&mut self) {
        self.committed = true;
    }
}

impl<C: KernelChannel + ?Sized> Drop for TargetAllocation<'_, C> {
    fn drop(&mut self) {
        if !self.committed {
            debug!("Releasing target allocation {:#x}", self.address);
            self.channel.free(self.address);
        }
    }
}

type Staged<T> = std::result::Result<T, (MapStage, Error)>;

trait AtStage<T> {
    fn at(self, stage: MapStage) -> Staged<T>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: MapStage) -> Staged<T> {
        self.map_err(|error| (stage, error))
    }
}

fn report_failure(stage: MapStage, error: &Error, profile: &MapProfile) {
    if stage == MapStage::Validate && profile.quiet_validation {
        debug!("{} failed: {}", stage, error);
    } else {
        error!("{} failed: {}", stage, error);
    }
}

/// Maps images through a [`KernelChannel`], binding imports against a [`ModuleRegistry`].
///
/// The mapper owns its channel, and every mapping method takes `&mut self`, so two attempts
/// can never interleave on the same channel.
pub struct Mapper<C: KernelChannel, R: ModuleRegistry> {
    channel: C,
    registry: R,
    options: MapOptions,
    clock: Box<dyn SystemClock>,
}

impl<C: KernelChannel, R: ModuleRegistry> Mapper<C, R> {
    /// Create a mapper with default [`MapOptions`] and the host clock.
    pub fn new(channel: C, registry: R) -> Self {
        Mapper {
            channel,
            registry,
            options: MapOptions::default(),
            clock: Box::new(HostClock),
        }
    }

    /// Replace the mapping options.
    #[must_use]
    pub fn with_options(mut self, options: MapOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the clock the cookie is derived from.
    #[must_use]
    pub fn with_clock(mut self, clock: impl SystemClock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// The current options.
    pub fn options(&self) -> &MapOptions {
        &self.options
    }

    /// The channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// The channel, mutably.
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// The module registry.
    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Give back the channel and the registry.
    pub fn into_parts(self) -> (C, R) {
        (self.channel, self.registry)
    }

    /// Map the image stored at `path` with [`MapProfile::file`].
    ///
    /// # Errors
    ///
    /// Any [`crate::Error`] from the stage that failed; see [`Mapper::map_image`].
    pub fn map_file(&mut self, path: impl AsRef<Path>) -> Result<MappedImage> {
        let path = path.as_ref();
        let profile = MapProfile::file();
        info!("Mapping {}", path.display());

        let image = Image::from_file(path).inspect_err(|error| {
            report_failure(MapStage::Validate, error, &profile);
        })?;
        self.map_image(&image, &profile)
    }

    /// Map an image compiled into the binary with [`MapProfile::embedded`].
    ///
    /// # Errors
    ///
    /// Any [`crate::Error`] from the stage that failed; see [`Mapper::map_image`].
    pub fn map_embedded(&mut self, data: &'static [u8]) -> Result<MappedImage> {
        let profile = MapProfile::embedded();
        info!("Mapping embedded image ({:#x} bytes)", data.len());

        let image = Image::from_static(data).inspect_err(|error| {
            report_failure(MapStage::Validate, error, &profile);
        })?;
        self.map_image(&image, &profile)
    }

    /// Map `image` according to `profile` and call its entry point.
    ///
    /// Either the image ends up running and `Ok` describes it, or the target allocation (if
    /// any was made) has been freed again. A failure status returned by the entry point is
    /// reported in [`MappedImage::status`], not as an error.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::NotSupported`] for a non-PE32+ image
    /// - [`crate::Error::StagingAllocation`] / [`crate::Error::AllocationFailed`]
    /// - [`crate::Error::Malformed`] / [`crate::Error::OutOfBounds`] for inconsistent tables
    /// - [`crate::Error::RelocationsStripped`]
    /// - [`crate::Error::ModuleNotFound`] / [`crate::Error::ExportNotFound`]
    /// - [`crate::Error::TransferFailed`] / [`crate::Error::InvocationFailed`]
    pub fn map_image(&mut self, image: &Image, profile: &MapProfile) -> Result<MappedImage> {
        self.run(image, profile).map_err(|(stage, error)| {
            report_failure(stage, &error, profile);
            error
        })
    }

    fn run(&mut self, image: &Image, profile: &MapProfile) -> Staged<MappedImage> {
        let headers = image.headers();
        if headers.magic != goblin::pe::optional_header::MAGIC_64 {
            return Err((MapStage::Validate, Error::NotSupported));
        }

        let size = image.size_of_image();
        let mut staging = StagingBuffer::new(size).at(MapStage::Allocate)?;
        let mut target = TargetAllocation::allocate(&mut self.channel, self.options.pool, size)
            .at(MapStage::Allocate)?;
        let base = target.address();
        info!(
            "Allocated {:#x} bytes at {:#x} ({} pool)",
            size, base, self.options.pool
        );

        copy_layout_into(image, profile.sections, &mut staging).at(MapStage::CopyLayout)?;

        let blocks =
            relocation_blocks(staging.as_slice(), headers).at(MapStage::CheckRelocations)?;
        if blocks.is_empty() && headers.relocs_stripped() && profile.reject_stripped_relocations
        {
            return Err((MapStage::CheckRelocations, Error::RelocationsStripped));
        }

        if profile.init_cookie {
            let outcome = init_stack_cookie(&mut staging, headers, self.clock.as_ref())
                .at(MapStage::InitCookie)?;
            debug!("Security cookie: {:?}", outcome);
        }

        let delta = base.wrapping_sub(headers.image_base);
        let patched =
            relocate_image_by_delta(&mut staging, &blocks, delta).at(MapStage::Relocate)?;
        debug!("Relocated {} sites by {:#x}", patched, delta);

        let modules = pe::imports(staging.as_slice(), headers).at(MapStage::ResolveImports)?;
        let resolved = resolve_imports(&mut staging, &modules, target.channel(), &self.registry)
            .at(MapStage::ResolveImports)?;
        debug!("Resolved {} imports from {} modules", resolved, modules.len());

        target
            .channel()
            .write(base, staging.as_slice())
            .map_err(|error| {
                debug!("Channel rejected the transfer: {}", error);
                (MapStage::Transfer, Error::TransferFailed { address: base, size })
            })?;
        drop(staging);

        let entry_point = base.wrapping_add(headers.address_of_entry_point);
        info!("Calling entry point at {:#x}", entry_point);
        let status = target
            .channel()
            .invoke(entry_point, &self.options.entry_args)
            .map_err(|error| {
                debug!("Channel rejected the call: {}", error);
                (MapStage::Invoke, Error::InvocationFailed(entry_point))
            })?;
        target.commit();

        if status.is_success() {
            info!("Entry point returned {}", status);
        } else {
            warn!("Entry point returned {}", status);
        }

        if self.options.erase_headers {
            if let Err(error) = target.channel().zero(base, image.size_of_headers()) {
                warn!("{} failed: {}", MapStage::EraseHeaders, error);
            }
        }

        Ok(MappedImage {
            base,
            size,
            entry_point,
            status,
        })
    }
}
