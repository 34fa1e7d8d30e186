//! Synthesis of minimal PE32+ images.
//!
//! [`ImageBuilder`] lays out a 64-bit image the way a linker would: DOS header, NT headers,
//! section table, then section data at file-aligned offsets. Import, base relocation and load
//! configuration tables are generated into their own trailing sections (`.rdata`, `.idata`,
//! `.reloc`) and wired into the data directories.
//!
//! It exists so that the mapper can be exercised without shipping real drivers: the tests and
//! the benchmark build their input images through it.
//!
//! # Examples
//!
//! ```rust
//! use pemap::builder::{ImageBuilder, ImportSpec};
//! use pemap::pe::{RelocationType, SectionFlags};
//!
//! let built = ImageBuilder::new()
//!     .image_base(0x1_4000_0000)
//!     .section(".text", SectionFlags::CNT_CODE | SectionFlags::MEM_EXECUTE, 0x1000, vec![0xC3])
//!     .section(".data", SectionFlags::MEM_READ | SectionFlags::MEM_WRITE, 0x2000, vec![0; 16])
//!     .relocations(0x2000, &[(RelocationType::Dir64, 0x8)])
//!     .import(ImportSpec::new("ntoskrnl.exe", &["DbgPrint"]))
//!     .build();
//!
//! assert!(built.slot("ntoskrnl.exe", "DbgPrint").is_some());
//! let image = pemap::file::Image::from_mem(built.bytes)?;
//! assert_eq!(image.sections().len(), 4);
//! # Ok::<(), pemap::Error>(())
//! ```

use std::collections::HashMap;

use crate::pe::{
    FileCharacteristics, RelocationEntry, RelocationType, SectionFlags, SECTION_HEADER_SIZE,
    SECURITY_COOKIE_OFFSET,
};

const PE_POINTER: usize = 0x80;
const COFF_OFFSET: usize = PE_POINTER + 4;
const OPTIONAL_HEADER_OFFSET: usize = COFF_OFFSET + 20;
const OPTIONAL_HEADER_SIZE: usize = 240;
const DIRECTORIES_OFFSET: usize = OPTIONAL_HEADER_OFFSET + 112;
const SECTION_TABLE_OFFSET: usize = OPTIONAL_HEADER_OFFSET + OPTIONAL_HEADER_SIZE;

const FILE_ALIGNMENT: usize = 0x200;
const SECTION_ALIGNMENT: usize = 0x1000;

const MACHINE_AMD64: u16 = 0x8664;
const MAGIC_PE32_PLUS: u16 = 0x20B;
const SUBSYSTEM_NATIVE: u16 = 1;
// HIGH_ENTROPY_VA | DYNAMIC_BASE | NX_COMPAT
const DLL_CHARACTERISTICS: u16 = 0x0160;
const NUMBER_OF_DIRECTORIES: usize = 16;

const DIRECTORY_IMPORT: usize = 1;
const DIRECTORY_BASERELOC: usize = 5;
const DIRECTORY_LOAD_CONFIG: usize = 10;

const DESCRIPTOR_SIZE: usize = 20;
const LOAD_CONFIG_SIZE: usize = 0x140;

fn align(value: usize, alignment: usize) -> usize {
    value.next_multiple_of(alignment)
}

fn put(buffer: &mut [u8], offset: usize, bytes: &[u8]) {
    buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// One module entry of the generated import directory.
#[derive(Debug, Clone)]
pub struct ImportSpec {
    module: String,
    functions: Vec<String>,
}

impl ImportSpec {
    /// Import `functions`, by name, from `module`.
    #[must_use]
    pub fn new(module: &str, functions: &[&str]) -> ImportSpec {
        ImportSpec {
            module: module.to_string(),
            functions: functions.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone)]
enum Raw {
    /// Initialized data stored in the file
    Data(Vec<u8>),
    /// `SizeOfRawData` without file backing; `PointerToRawData` stays zero
    Unbacked(u32),
}

#[derive(Debug, Clone)]
struct SectionSpec {
    name: [u8; 8],
    flags: SectionFlags,
    virtual_address: u32,
    virtual_size: u32,
    raw: Raw,
}

impl SectionSpec {
    fn new(name: &str, flags: SectionFlags, virtual_address: u32, raw: Raw) -> SectionSpec {
        let mut packed = [0_u8; 8];
        let bytes = name.as_bytes();
        let len = bytes.len().min(8);
        packed[..len].copy_from_slice(&bytes[..len]);

        let virtual_size = match &raw {
            Raw::Data(data) => data.len() as u32,
            Raw::Unbacked(size) => *size,
        };

        SectionSpec {
            name: packed,
            flags,
            virtual_address,
            virtual_size,
            raw,
        }
    }

    fn raw_size(&self) -> usize {
        match &self.raw {
            Raw::Data(data) => align(data.len(), FILE_ALIGNMENT),
            Raw::Unbacked(size) => *size as usize,
        }
    }

    fn end(&self) -> usize {
        self.virtual_address as usize + (self.virtual_size as usize).max(self.raw_size())
    }
}

/// An image produced by [`ImageBuilder::build`].
#[derive(Debug, Clone)]
pub struct BuiltImage {
    /// The complete file contents
    pub bytes: Vec<u8>,
    slots: HashMap<(String, String), u32>,
    lookups: HashMap<(String, String), u32>,
}

impl BuiltImage {
    /// RVA of the IAT slot for `function` imported from `module`.
    #[must_use]
    pub fn slot(&self, module: &str, function: &str) -> Option<u32> {
        self.slots
            .get(&(module.to_string(), function.to_string()))
            .copied()
    }

    /// RVA of the import lookup table entry for `function` imported from `module`.
    #[must_use]
    pub fn lookup(&self, module: &str, function: &str) -> Option<u32> {
        self.lookups
            .get(&(module.to_string(), function.to_string()))
            .copied()
    }
}

/// Builder for synthetic PE32+ images.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    image_base: u64,
    entry_point: Option<u32>,
    magic: u16,
    characteristics: FileCharacteristics,
    sections: Vec<SectionSpec>,
    imports: Vec<ImportSpec>,
    relocations: Vec<(u32, Vec<RelocationEntry>)>,
    security_cookie: Option<u64>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    /// A driver-like image: base `0x1_4000_0000`, executable, no sections.
    #[must_use]
    pub fn new() -> ImageBuilder {
        ImageBuilder {
            image_base: 0x1_4000_0000,
            entry_point: None,
            magic: MAGIC_PE32_PLUS,
            characteristics: FileCharacteristics::EXECUTABLE_IMAGE
                | FileCharacteristics::LARGE_ADDRESS_AWARE,
            sections: Vec::new(),
            imports: Vec::new(),
            relocations: Vec::new(),
            security_cookie: None,
        }
    }

    /// Preferred load address.
    #[must_use]
    pub fn image_base(mut self, image_base: u64) -> Self {
        self.image_base = image_base;
        self
    }

    /// Entry point RVA. Defaults to the first section.
    #[must_use]
    pub fn entry_point(mut self, rva: u32) -> Self {
        self.entry_point = Some(rva);
        self
    }

    /// Optional header magic; anything but `0x20B` yields an unsupported image.
    #[must_use]
    pub fn magic(mut self, magic: u16) -> Self {
        self.magic = magic;
        self
    }

    /// COFF characteristics.
    #[must_use]
    pub fn characteristics(mut self, characteristics: FileCharacteristics) -> Self {
        self.characteristics = characteristics;
        self
    }

    /// Add a section backed by `data` in the file.
    #[must_use]
    pub fn section(mut self, name: &str, flags: SectionFlags, rva: u32, data: Vec<u8>) -> Self {
        self.sections
            .push(SectionSpec::new(name, flags, rva, Raw::Data(data)));
        self
    }

    /// Add a file-backed section whose mapped size exceeds its data.
    #[must_use]
    pub fn section_sized(
        mut self,
        name: &str,
        flags: SectionFlags,
        rva: u32,
        virtual_size: u32,
        data: Vec<u8>,
    ) -> Self {
        let mut section = SectionSpec::new(name, flags, rva, Raw::Data(data));
        section.virtual_size = section.virtual_size.max(virtual_size);
        self.sections.push(section);
        self
    }

    /// Add a section that declares `raw_size` bytes of raw data but a zero `PointerToRawData`.
    ///
    /// With `raw_size == 0` this is a plain uninitialized section.
    #[must_use]
    pub fn unbacked_section(
        mut self,
        name: &str,
        flags: SectionFlags,
        rva: u32,
        raw_size: u32,
    ) -> Self {
        self.sections
            .push(SectionSpec::new(name, flags, rva, Raw::Unbacked(raw_size)));
        self
    }

    /// Add one module to the import directory.
    #[must_use]
    pub fn import(mut self, spec: ImportSpec) -> Self {
        self.imports.push(spec);
        self
    }

    /// Add one base relocation block for the page at `page_rva`.
    ///
    /// Blocks with an odd number of entries are padded with an `Absolute` entry.
    #[must_use]
    pub fn relocations(mut self, page_rva: u32, entries: &[(RelocationType, u16)]) -> Self {
        let entries = entries
            .iter()
            .map(|&(kind, offset)| RelocationEntry { kind, offset })
            .collect();
        self.relocations.push((page_rva, entries));
        self
    }

    /// Emit a load configuration directory whose `SecurityCookie` points at `cookie_va`.
    #[must_use]
    pub fn load_config(mut self, cookie_va: u64) -> Self {
        self.security_cookie = Some(cookie_va);
        self
    }

    /// Lay out and serialize the image.
    #[must_use]
    pub fn build(self) -> BuiltImage {
        let mut sections = self.sections;
        let mut directories = [(0_u32, 0_u32); NUMBER_OF_DIRECTORIES];
        let mut slots = HashMap::new();
        let mut lookups = HashMap::new();

        let mut next_rva = align(
            sections
                .iter()
                .map(SectionSpec::end)
                .max()
                .unwrap_or(0)
                .max(SECTION_ALIGNMENT),
            SECTION_ALIGNMENT,
        );
        if let Some(cookie_va) = self.security_cookie {
            let mut data = vec![0_u8; LOAD_CONFIG_SIZE];
            put(&mut data, 0, &(LOAD_CONFIG_SIZE as u32).to_le_bytes());
            put(&mut data, SECURITY_COOKIE_OFFSET, &cookie_va.to_le_bytes());

            let rva = append(
                &mut sections,
                &mut next_rva,
                ".rdata",
                SectionFlags::CNT_INITIALIZED_DATA | SectionFlags::MEM_READ,
                data,
            );
            directories[DIRECTORY_LOAD_CONFIG] = (rva, LOAD_CONFIG_SIZE as u32);
        }

        if !self.imports.is_empty() {
            // Table contents embed absolute RVAs, so the section RVA is fixed up front
            let rva = next_rva as u32;
            let data = import_table(&self.imports, rva, &mut slots, &mut lookups);
            append(
                &mut sections,
                &mut next_rva,
                ".idata",
                SectionFlags::CNT_INITIALIZED_DATA | SectionFlags::MEM_READ | SectionFlags::MEM_WRITE,
                data,
            );
            directories[DIRECTORY_IMPORT] =
                (rva, ((self.imports.len() + 1) * DESCRIPTOR_SIZE) as u32);
        }

        if !self.relocations.is_empty() {
            let data = relocation_table(&self.relocations);
            let size = data.len() as u32;
            let rva = append(
                &mut sections,
                &mut next_rva,
                ".reloc",
                SectionFlags::CNT_INITIALIZED_DATA
                    | SectionFlags::MEM_READ
                    | SectionFlags::MEM_DISCARDABLE,
                data,
            );
            directories[DIRECTORY_BASERELOC] = (rva, size);
        }

        let size_of_headers = align(
            SECTION_TABLE_OFFSET + SECTION_HEADER_SIZE * sections.len(),
            FILE_ALIGNMENT,
        );

        let mut file_offset = size_of_headers;
        let mut raw_pointers = Vec::with_capacity(sections.len());
        for section in &sections {
            match &section.raw {
                Raw::Data(data) if !data.is_empty() => {
                    raw_pointers.push(file_offset as u32);
                    file_offset += section.raw_size();
                }
                _ => raw_pointers.push(0),
            }
        }

        let size_of_image = align(
            sections
                .iter()
                .map(SectionSpec::end)
                .max()
                .unwrap_or(0)
                .max(size_of_headers),
            SECTION_ALIGNMENT,
        );
        let entry_point = self
            .entry_point
            .or_else(|| sections.first().map(|section| section.virtual_address))
            .unwrap_or(0);

        let mut bytes = vec![0_u8; file_offset];

        // DOS header
        put(&mut bytes, 0, b"MZ");
        put(&mut bytes, 0x3C, &(PE_POINTER as u32).to_le_bytes());

        // Signature and COFF header
        put(&mut bytes, PE_POINTER, b"PE\0\0");
        put(&mut bytes, COFF_OFFSET, &MACHINE_AMD64.to_le_bytes());
        put(&mut bytes, COFF_OFFSET + 2, &(sections.len() as u16).to_le_bytes());
        put(
            &mut bytes,
            COFF_OFFSET + 16,
            &(OPTIONAL_HEADER_SIZE as u16).to_le_bytes(),
        );
        put(&mut bytes, COFF_OFFSET + 18, &self.characteristics.bits().to_le_bytes());

        // Optional header
        let opt = OPTIONAL_HEADER_OFFSET;
        put(&mut bytes, opt, &self.magic.to_le_bytes());
        put(&mut bytes, opt + 2, &[14, 0]);
        put(&mut bytes, opt + 16, &entry_point.to_le_bytes());
        put(&mut bytes, opt + 24, &self.image_base.to_le_bytes());
        put(&mut bytes, opt + 32, &(SECTION_ALIGNMENT as u32).to_le_bytes());
        put(&mut bytes, opt + 36, &(FILE_ALIGNMENT as u32).to_le_bytes());
        put(&mut bytes, opt + 40, &10_u16.to_le_bytes());
        put(&mut bytes, opt + 48, &10_u16.to_le_bytes());
        put(&mut bytes, opt + 56, &(size_of_image as u32).to_le_bytes());
        put(&mut bytes, opt + 60, &(size_of_headers as u32).to_le_bytes());
        put(&mut bytes, opt + 68, &SUBSYSTEM_NATIVE.to_le_bytes());
        put(&mut bytes, opt + 70, &DLL_CHARACTERISTICS.to_le_bytes());
        put(&mut bytes, opt + 72, &0x4_0000_u64.to_le_bytes());
        put(&mut bytes, opt + 80, &0x1000_u64.to_le_bytes());
        put(&mut bytes, opt + 88, &0x10_0000_u64.to_le_bytes());
        put(&mut bytes, opt + 96, &0x1000_u64.to_le_bytes());
        put(&mut bytes, opt + 108, &(NUMBER_OF_DIRECTORIES as u32).to_le_bytes());
        for (index, (rva, size)) in directories.iter().enumerate() {
            put(&mut bytes, DIRECTORIES_OFFSET + index * 8, &rva.to_le_bytes());
            put(&mut bytes, DIRECTORIES_OFFSET + index * 8 + 4, &size.to_le_bytes());
        }

        // Section table and section data
        for (index, section) in sections.iter().enumerate() {
            let header = SECTION_TABLE_OFFSET + index * SECTION_HEADER_SIZE;
            put(&mut bytes, header, &section.name);
            put(&mut bytes, header + 8, &section.virtual_size.to_le_bytes());
            put(&mut bytes, header + 12, &section.virtual_address.to_le_bytes());
            put(&mut bytes, header + 16, &(section.raw_size() as u32).to_le_bytes());
            put(&mut bytes, header + 20, &raw_pointers[index].to_le_bytes());
            put(&mut bytes, header + 36, &section.flags.bits().to_le_bytes());

            if let Raw::Data(data) = &section.raw {
                if !data.is_empty() {
                    put(&mut bytes, raw_pointers[index] as usize, data);
                }
            }
        }

        BuiltImage {
            bytes,
            slots,
            lookups,
        }
    }
}

/// Place `data` in a new section at `next_rva` and advance past it.
fn append(
    sections: &mut Vec<SectionSpec>,
    next_rva: &mut usize,
    name: &str,
    flags: SectionFlags,
    data: Vec<u8>,
) -> u32 {
    let rva = *next_rva as u32;
    *next_rva = align(*next_rva + data.len().max(1), SECTION_ALIGNMENT);
    sections.push(SectionSpec::new(name, flags, rva, Raw::Data(data)));
    rva
}

/// Serialize an import directory located at `base_rva`.
///
/// Layout: descriptors, lookup tables, address tables, hint/name entries, module names.
fn import_table(
    imports: &[ImportSpec],
    base_rva: u32,
    slots: &mut HashMap<(String, String), u32>,
    lookups: &mut HashMap<(String, String), u32>,
) -> Vec<u8> {
    let mut offset = align((imports.len() + 1) * DESCRIPTOR_SIZE, 8);

    let mut lookup_tables = Vec::with_capacity(imports.len());
    for spec in imports {
        lookup_tables.push(offset);
        offset += (spec.functions.len() + 1) * 8;
    }
    let mut address_tables = Vec::with_capacity(imports.len());
    for spec in imports {
        address_tables.push(offset);
        offset += (spec.functions.len() + 1) * 8;
    }

    let mut hint_names = Vec::with_capacity(imports.len());
    for spec in imports {
        let mut entries = Vec::with_capacity(spec.functions.len());
        for function in &spec.functions {
            entries.push(offset);
            offset = align(offset + 2 + function.len() + 1, 2);
        }
        hint_names.push(entries);
    }

    let mut module_names = Vec::with_capacity(imports.len());
    for spec in imports {
        module_names.push(offset);
        offset += spec.module.len() + 1;
    }

    let mut data = vec![0_u8; offset];
    let rva = |offset: usize| base_rva + offset as u32;

    for (index, spec) in imports.iter().enumerate() {
        let descriptor = index * DESCRIPTOR_SIZE;
        put(&mut data, descriptor, &rva(lookup_tables[index]).to_le_bytes());
        put(&mut data, descriptor + 12, &rva(module_names[index]).to_le_bytes());
        put(&mut data, descriptor + 16, &rva(address_tables[index]).to_le_bytes());
        put(&mut data, module_names[index], spec.module.as_bytes());

        for (slot, function) in spec.functions.iter().enumerate() {
            let hint_name = hint_names[index][slot];
            put(&mut data, hint_name + 2, function.as_bytes());

            let thunk = u64::from(rva(hint_name)).to_le_bytes();
            let lookup = lookup_tables[index] + slot * 8;
            let address = address_tables[index] + slot * 8;
            put(&mut data, lookup, &thunk);
            put(&mut data, address, &thunk);

            let key = (spec.module.clone(), function.clone());
            lookups.insert(key.clone(), rva(lookup));
            slots.insert(key, rva(address));
        }
    }

    data
}

/// Serialize a base relocation table.
fn relocation_table(blocks: &[(u32, Vec<RelocationEntry>)]) -> Vec<u8> {
    let mut data = Vec::new();
    for (page, entries) in blocks {
        let padded = entries.len() + entries.len() % 2;
        let size = (8 + padded * 2) as u32;

        data.extend_from_slice(&page.to_le_bytes());
        data.extend_from_slice(&size.to_le_bytes());
        for entry in entries {
            data.extend_from_slice(&entry.to_raw().to_le_bytes());
        }
        if padded != entries.len() {
            let pad = RelocationEntry {
                kind: RelocationType::Absolute,
                offset: 0,
            };
            data.extend_from_slice(&pad.to_raw().to_le_bytes());
        }
    }
    data
}
