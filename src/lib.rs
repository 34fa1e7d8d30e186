// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![warn(missing_docs)]
#![allow(clippy::too_many_arguments)]
//#![deny(unsafe_code)]
// - 'file/physical.rs' uses mmap to map a file into memory

//! # pemap
//!
//! A manual mapping engine for 64-bit PE images. `pemap` takes a driver-style PE32+ file, lays
//! it out the way the platform loader would, and starts it inside a privileged address space
//! that is only reachable through a narrow request/response channel, without going through
//! the operating system's module loader.
//!
//! ## Features
//!
//! - **Staged mapping** - every fixup happens in a local staging copy; the target space sees a
//!   single bulk write of a fully linked image
//! - **Loader duties** - section layout, `DIR64` base relocations, import binding against
//!   resident modules, `/GS` cookie seeding, entry point invocation and header erasure
//! - **All-or-nothing** - a failing stage releases the target allocation exactly once, through
//!   a scope guard
//! - **Pluggable channel** - the target space is abstracted by [`KernelChannel`]; the crate
//!   ships [`SimulatedChannel`], an in-process implementation used for tests and dry runs
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! pemap = "0.1"
//! ```
//!
//! ```rust,no_run
//! use pemap::{Mapper, SimulatedChannel, StaticRegistry};
//!
//! let registry = StaticRegistry::new()
//!     .with_module("ntoskrnl.exe", 0xFFFF_F800_0000_0000)
//!     .with_module("hal.dll", 0xFFFF_F800_0080_0000);
//! let channel = SimulatedChannel::new()
//!     .with_export(0xFFFF_F800_0000_0000, "DbgPrint", 0xFFFF_F800_0012_3450);
//!
//! let mut mapper = Mapper::new(channel, registry);
//! let mapped = mapper.map_file("driver.sys")?;
//! println!("mapped at {:#x}, DriverEntry returned {}", mapped.base, mapped.status);
//! # Ok::<(), pemap::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`file`] - source images (memory-mapped file, owned buffer, static data)
//! - [`pe`] - PE32+ header, relocation, import and load-config decoding
//! - [`channel`] - the privileged-memory channel trait and its simulated implementation
//! - [`registry`] - resident module lookup
//! - [`mapper`] - staging, relocation, import binding, cookie seeding and the orchestrator
//! - [`builder`] - synthesis of minimal PE32+ images
//!
//! ## Logging
//!
//! The crate logs through the [`log`] facade: allocation, entry call and status at `info`,
//! per-stage detail at `debug`, non-fatal conditions at `warn`, and the failing stage at
//! `error`. Install any `log` backend to see it.
#[macro_use]
pub(crate) mod error;

/// Source image abstraction
pub mod file;

/// PE32+ structure decoding
pub mod pe;

/// Privileged-memory channel
pub mod channel;

/// Resident module registry
pub mod registry;

/// Manual mapping engine
pub mod mapper;

/// Synthetic PE32+ images
pub mod builder;

/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
/// This is used consistently throughout the crate for all fallible operations.
///
/// # Examples
///
/// ```rust,no_run
/// use pemap::{file::Image, Result};
///
/// fn load_driver(path: &str) -> Result<Image> {
///     Image::from_file(path)
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `pemap` Error type
///
/// The main error type for all operations in this crate. Each variant names the cause of a
/// failed mapping attempt precisely enough to tell a malformed image from a missing dependency
/// or a refusing channel.
///
/// # Examples
///
/// ```rust,no_run
/// use pemap::{Error, Mapper, SimulatedChannel, StaticRegistry};
///
/// let mut mapper = Mapper::new(SimulatedChannel::new(), StaticRegistry::new());
/// match mapper.map_file("driver.sys") {
///     Ok(mapped) => println!("mapped at {:#x}", mapped.base),
///     Err(Error::NotSupported) => println!("not a 64-bit image"),
///     Err(Error::Malformed { message, .. }) => println!("Malformed: {}", message),
///     Err(e) => println!("Error: {}", e),
/// }
/// ```
pub use error::Error;

/// Cursor over little-endian binary data, used by the table decoders.
///
/// # Example
///
/// ```rust
/// use pemap::Parser;
/// let data = [0x4D, 0x5A, 0x90, 0x00];
/// let mut parser = Parser::new(&data);
/// assert_eq!(parser.read_le::<u16>()?, 0x5A4D);
/// # Ok::<(), pemap::Error>(())
/// ```
pub use file::{parser::Parser, Image};

pub use builder::{BuiltImage, ImageBuilder, ImportSpec};
pub use channel::{KernelChannel, NtStatus, PoolType, SimulatedChannel};
pub use mapper::{MapOptions, MapProfile, MapStage, MappedImage, Mapper};
pub use registry::{ModuleRegistry, StaticRegistry};
