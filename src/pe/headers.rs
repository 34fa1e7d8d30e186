//! NT headers and section table.
//!
//! The DOS, COFF and optional headers are parsed with goblin; the fields the mapper needs are
//! copied into [`NtHeaders`] so that no borrow of the source bytes outlives the parse. The
//! section table is decoded directly with [`crate::file::parser::Parser`].

use bitflags::bitflags;
use goblin::pe::{
    data_directories::{DataDirectory, DataDirectoryType},
    header::Header,
    optional_header::MAGIC_64,
};

use crate::{file::parser::Parser, Error::NotSupported, Result};

/// Size of one `IMAGE_SECTION_HEADER` record.
pub const SECTION_HEADER_SIZE: usize = 40;

/// Size of the `PE\0\0` signature plus the COFF file header.
const NT_SIGNATURE_AND_COFF_SIZE: usize = 4 + 20;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// COFF file header characteristics
    pub struct FileCharacteristics: u16 {
        /// Relocation information was stripped from the file
        const RELOCS_STRIPPED = 0x0001;
        /// The file is executable
        const EXECUTABLE_IMAGE = 0x0002;
        /// The application can handle addresses above 2 GB
        const LARGE_ADDRESS_AWARE = 0x0020;
        /// The image is a system file
        const SYSTEM = 0x1000;
        /// The image is a DLL
        const DLL = 0x2000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Section header characteristics
    pub struct SectionFlags: u32 {
        /// The section contains executable code
        const CNT_CODE = 0x0000_0020;
        /// The section contains initialized data
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        /// The section contains uninitialized data
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        /// The section can be discarded as needed
        const MEM_DISCARDABLE = 0x0200_0000;
        /// The section is not pageable
        const MEM_NOT_PAGED = 0x0800_0000;
        /// The section can be executed as code
        const MEM_EXECUTE = 0x2000_0000;
        /// The section can be read
        const MEM_READ = 0x4000_0000;
        /// The section can be written to
        const MEM_WRITE = 0x8000_0000;
    }
}

impl SectionFlags {
    /// Any of the three memory access bits
    pub const MEM_ACCESS: SectionFlags = SectionFlags::MEM_READ
        .union(SectionFlags::MEM_WRITE)
        .union(SectionFlags::MEM_EXECUTE);
}

/// Location of a data directory inside the image, as an RVA and a size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directory {
    /// Relative virtual address of the directory
    pub rva: u32,
    /// Size of the directory in bytes
    pub size: u32,
}

/// The subset of the NT headers that drives mapping.
#[derive(Debug, Clone)]
pub struct NtHeaders {
    /// File offset of the `PE\0\0` signature (`e_lfanew`)
    pub pe_pointer: usize,
    /// COFF machine type
    pub machine: u16,
    /// COFF characteristics
    pub characteristics: FileCharacteristics,
    /// Number of entries in the section table
    pub number_of_sections: u16,
    /// Declared size of the optional header
    pub size_of_optional_header: u16,
    /// Optional header magic, always `MAGIC_64` once parsed
    pub magic: u16,
    /// Preferred load address
    pub image_base: u64,
    /// Total virtual size of the mapped image
    pub size_of_image: usize,
    /// Size of all headers, rounded up to the file alignment
    pub size_of_headers: usize,
    /// RVA of the entry point
    pub address_of_entry_point: u64,
    /// Base relocation directory, if present
    pub base_relocations: Option<Directory>,
    /// Import directory, if present
    pub imports: Option<Directory>,
    /// Load configuration directory, if present
    pub load_config: Option<Directory>,
}

impl NtHeaders {
    /// Parse and validate the headers of a PE32+ image.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::GoblinErr`] if the DOS/COFF/optional headers do not parse
    /// - [`crate::Error::Malformed`] if there is no optional header
    /// - [`crate::Error::NotSupported`] if the optional header is not PE32+
    pub fn parse(data: &[u8]) -> Result<NtHeaders> {
        let header = Header::parse(data)?;

        let Some(optional_header) = header.optional_header else {
            return Err(malformed_error!("Image does not have an OptionalHeader"));
        };

        if optional_header.standard_fields.magic != MAGIC_64 {
            return Err(NotSupported);
        }

        let directories: Vec<(DataDirectoryType, DataDirectory)> =
            optional_header.data_directories.dirs().collect();
        let find = |dir_type: DataDirectoryType| {
            directories
                .iter()
                .find(|(directory_type, directory)| {
                    *directory_type == dir_type
                        && directory.virtual_address != 0
                        && directory.size != 0
                })
                .map(|(_, directory)| Directory {
                    rva: directory.virtual_address,
                    size: directory.size,
                })
        };

        let windows = &optional_header.windows_fields;
        let size_of_image = usize::try_from(windows.size_of_image)
            .map_err(|_| malformed_error!("SizeOfImage does not fit the host"))?;
        let size_of_headers = usize::try_from(windows.size_of_headers)
            .map_err(|_| malformed_error!("SizeOfHeaders does not fit the host"))?;

        if size_of_image == 0 {
            return Err(malformed_error!("SizeOfImage is zero"));
        }
        if size_of_headers > size_of_image {
            return Err(malformed_error!(
                "SizeOfHeaders {:#x} exceeds SizeOfImage {:#x}",
                size_of_headers,
                size_of_image
            ));
        }

        Ok(NtHeaders {
            pe_pointer: header.dos_header.pe_pointer as usize,
            machine: header.coff_header.machine,
            characteristics: FileCharacteristics::from_bits_retain(
                header.coff_header.characteristics,
            ),
            number_of_sections: header.coff_header.number_of_sections,
            size_of_optional_header: header.coff_header.size_of_optional_header,
            magic: optional_header.standard_fields.magic,
            image_base: windows.image_base,
            size_of_image,
            size_of_headers,
            address_of_entry_point: u64::from(
                optional_header.standard_fields.address_of_entry_point,
            ),
            base_relocations: find(DataDirectoryType::BaseRelocationTable),
            imports: find(DataDirectoryType::ImportTable),
            load_config: find(DataDirectoryType::LoadConfigTable),
        })
    }

    /// File offset of the first section header.
    #[must_use]
    pub fn section_table_offset(&self) -> usize {
        self.pe_pointer + NT_SIGNATURE_AND_COFF_SIZE + usize::from(self.size_of_optional_header)
    }

    /// Returns `true` if the linker stripped relocation information.
    #[must_use]
    pub fn relocs_stripped(&self) -> bool {
        self.characteristics
            .contains(FileCharacteristics::RELOCS_STRIPPED)
    }
}

/// One decoded `IMAGE_SECTION_HEADER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Raw, null-padded section name
    pub name: [u8; 8],
    /// Size of the section once mapped
    pub virtual_size: u32,
    /// RVA the section is mapped at
    pub virtual_address: u32,
    /// Size of the section data on disk
    pub size_of_raw_data: u32,
    /// File offset of the section data, zero for uninitialized sections
    pub pointer_to_raw_data: u32,
    /// Section characteristics
    pub characteristics: SectionFlags,
}

impl Section {
    /// Decode the section table described by `headers`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the table runs past the end of `data`.
    pub fn parse_table(data: &[u8], headers: &NtHeaders) -> Result<Vec<Section>> {
        let mut parser = Parser::new(data);
        parser.seek(headers.section_table_offset())?;

        let mut sections = Vec::with_capacity(usize::from(headers.number_of_sections));
        for _ in 0..headers.number_of_sections {
            let mut name = [0_u8; 8];
            name.copy_from_slice(parser.read_bytes(8)?);
            let virtual_size = parser.read_le::<u32>()?;
            let virtual_address = parser.read_le::<u32>()?;
            let size_of_raw_data = parser.read_le::<u32>()?;
            let pointer_to_raw_data = parser.read_le::<u32>()?;
            // PointerToRelocations, PointerToLinenumbers, NumberOfRelocations,
            // NumberOfLinenumbers
            parser.advance_by(12)?;
            let characteristics = SectionFlags::from_bits_retain(parser.read_le::<u32>()?);

            sections.push(Section {
                name,
                virtual_size,
                virtual_address,
                size_of_raw_data,
                pointer_to_raw_data,
                characteristics,
            });
        }

        Ok(sections)
    }

    /// The section name with trailing padding removed.
    #[must_use]
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.name)
            .trim_end_matches('\0')
            .to_string()
    }

    /// Returns `true` if the section is readable, writable or executable.
    #[must_use]
    pub fn has_memory_access(&self) -> bool {
        self.characteristics.intersects(SectionFlags::MEM_ACCESS)
    }
}
