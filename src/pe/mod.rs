//! PE32+ structure decoding.
//!
//! This module is the format parser the mapper consumes. Header validation goes through goblin;
//! the tables that the mapper patches (relocations, imports, load config) are decoded here
//! against the *staging* buffer, i.e. an image already laid out in memory order where an RVA is
//! a plain offset.
//!
//! # Key Components
//!
//! - [`NtHeaders`] / [`Section`] - validated headers and section table of a source image
//! - [`relocation_blocks`] - base relocation table as [`RelocationBlock`]s
//! - [`imports`] - import directory as [`ImportModule`]s with IAT slot RVAs
//! - [`load_config`] - the `/GS` security cookie location

mod headers;
mod imports;
mod loadconfig;
mod relocations;

pub use headers::{
    Directory, FileCharacteristics, NtHeaders, Section, SectionFlags, SECTION_HEADER_SIZE,
};
pub use imports::{imports, ImportFunction, ImportModule};
pub use loadconfig::{load_config, LoadConfig, SECURITY_COOKIE_OFFSET};
pub use relocations::{relocation_blocks, RelocationBlock, RelocationEntry, RelocationType};
