//! Import directory decoding.
//!
//! Each `IMAGE_IMPORT_DESCRIPTOR` names a module and points at two parallel thunk arrays: the
//! lookup table (names) and the address table (slots the loader overwrites). Only the slot
//! RVAs are recorded, so resolution can later patch the staging buffer in place.

use crate::{file::parser::Parser, pe::NtHeaders, Result};

const DESCRIPTOR_SIZE: usize = 20;
const THUNK_SIZE: u32 = 8;
const ORDINAL_FLAG64: u64 = 1 << 63;

/// A function imported by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportFunction {
    /// Exported name to resolve
    pub name: String,
    /// RVA of the pointer-sized IAT slot receiving the resolved address
    pub slot_rva: u32,
}

/// A module together with the functions imported from it, in table order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportModule {
    /// Module file name as written by the linker, e.g. `ntoskrnl.exe`
    pub name: String,
    /// Functions imported from the module
    pub functions: Vec<ImportFunction>,
}

/// Decode the import directory of a mapped image.
///
/// `image` must be laid out in memory order (RVA == offset). The descriptor list ends at the
/// first descriptor whose `FirstThunk` is zero.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if any descriptor, thunk or name lies outside
/// `image`, and [`crate::Error::Malformed`] for imports by ordinal, which cannot be resolved
/// through a name-based export lookup.
pub fn imports(image: &[u8], headers: &NtHeaders) -> Result<Vec<ImportModule>> {
    let Some(directory) = headers.imports else {
        return Ok(Vec::new());
    };

    let mut descriptors = Parser::new(image);
    descriptors.seek(directory.rva as usize)?;

    let mut modules = Vec::new();
    loop {
        let descriptor = descriptors.read_bytes(DESCRIPTOR_SIZE)?;
        let mut fields = Parser::new(descriptor);
        let original_first_thunk = fields.read_le::<u32>()?;
        // TimeDateStamp, ForwarderChain
        fields.advance_by(8)?;
        let name_rva = fields.read_le::<u32>()?;
        let first_thunk = fields.read_le::<u32>()?;

        if first_thunk == 0 {
            break;
        }

        let name = read_name(image, name_rva)?;
        let lookup = if original_first_thunk != 0 {
            original_first_thunk
        } else {
            first_thunk
        };

        let mut functions = Vec::new();
        let mut thunks = Parser::new(image);
        thunks.seek(lookup as usize)?;
        let mut slot_rva = first_thunk;
        loop {
            let thunk = thunks.read_le::<u64>()?;
            if thunk == 0 {
                break;
            }
            if thunk & ORDINAL_FLAG64 != 0 {
                return Err(malformed_error!(
                    "{} is imported by ordinal #{}",
                    name,
                    thunk & 0xFFFF
                ));
            }

            // IMAGE_IMPORT_BY_NAME: u16 hint followed by the name
            let by_name = u32::try_from(thunk & 0x7FFF_FFFF)
                .map_err(|_| malformed_error!("Import name RVA out of range"))?;
            let hint_skipped = by_name.checked_add(2).ok_or(crate::Error::OutOfBounds)?;
            let function = read_name(image, hint_skipped)?;

            functions.push(ImportFunction {
                name: function,
                slot_rva,
            });
            slot_rva = slot_rva
                .checked_add(THUNK_SIZE)
                .ok_or(crate::Error::OutOfBounds)?;
        }

        modules.push(ImportModule { name, functions });
    }

    Ok(modules)
}

fn read_name(image: &[u8], rva: u32) -> Result<String> {
    let mut parser = Parser::new(image);
    parser.seek(rva as usize)?;
    parser.read_string_utf8()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::{ImageBuilder, ImportSpec},
        file::Image,
        mapper::{copy_layout, SectionFilter},
        pe::SectionFlags,
        Error,
    };

    fn staged(builder: ImageBuilder) -> (Vec<u8>, NtHeaders, crate::builder::BuiltImage) {
        let built = builder.build();
        let image = Image::from_mem(built.bytes.clone()).unwrap();
        let staging = copy_layout(&image, SectionFilter::All).unwrap();
        (staging.as_slice().to_vec(), image.headers().clone(), built)
    }

    #[test]
    fn decode_two_modules() {
        let (staging, headers, built) = staged(
            ImageBuilder::new()
                .section(".text", SectionFlags::MEM_EXECUTE, 0x1000, vec![0xC3; 4])
                .import(ImportSpec::new(
                    "ntoskrnl.exe",
                    &["ExAllocatePoolWithTag", "ExFreePoolWithTag"],
                ))
                .import(ImportSpec::new("HAL.dll", &["KeQueryPerformanceCounter"])),
        );

        let modules = imports(&staging, &headers).unwrap();
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].name, "ntoskrnl.exe");
        assert_eq!(modules[0].functions.len(), 2);
        assert_eq!(modules[0].functions[1].name, "ExFreePoolWithTag");
        assert_eq!(
            Some(modules[0].functions[1].slot_rva),
            built.slot("ntoskrnl.exe", "ExFreePoolWithTag")
        );
        assert_eq!(
            modules[0].functions[0].slot_rva + 8,
            modules[0].functions[1].slot_rva
        );
        assert_eq!(modules[1].name, "HAL.dll");
        assert_eq!(modules[1].functions[0].name, "KeQueryPerformanceCounter");
    }

    #[test]
    fn no_imports() {
        let (staging, headers, _) = staged(ImageBuilder::new().section(
            ".text",
            SectionFlags::MEM_EXECUTE,
            0x1000,
            vec![0xC3],
        ));
        assert!(imports(&staging, &headers).unwrap().is_empty());
    }

    #[test]
    fn ordinal_import_rejected() {
        let (mut staging, headers, built) = staged(
            ImageBuilder::new()
                .section(".text", SectionFlags::MEM_EXECUTE, 0x1000, vec![0xC3])
                .import(ImportSpec::new("ntoskrnl.exe", &["KeBugCheckEx"])),
        );

        // Rewrite the lookup thunk as an ordinal import
        let lookup = built.lookup("ntoskrnl.exe", "KeBugCheckEx").unwrap() as usize;
        staging[lookup..lookup + 8].copy_from_slice(&(ORDINAL_FLAG64 | 42).to_le_bytes());

        assert!(matches!(
            imports(&staging, &headers),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn truncated_descriptor() {
        let (staging, mut headers, _) = staged(
            ImageBuilder::new()
                .section(".text", SectionFlags::MEM_EXECUTE, 0x1000, vec![0xC3])
                .import(ImportSpec::new("ntoskrnl.exe", &["KeBugCheckEx"])),
        );

        headers.imports = Some(crate::pe::Directory {
            rva: (staging.len() - 4) as u32,
            size: 20,
        });
        assert!(matches!(
            imports(&staging, &headers),
            Err(Error::OutOfBounds)
        ));
    }
}
