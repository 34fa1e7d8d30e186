//! Base relocation table decoding.
//!
//! The table is a sequence of blocks, each covering one 4 KiB page:
//!
//! ```text
//! u32 VirtualAddress   page RVA
//! u32 SizeOfBlock      header + entries, in bytes
//! u16 Entry[n]         type in the high 4 bits, page offset in the low 12
//! ```

use crate::{file::parser::Parser, pe::NtHeaders, Result};

const BLOCK_HEADER_SIZE: u32 = 8;

/// Base relocation entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocationType {
    /// Padding entry, skipped by loaders
    Absolute,
    /// High 16 bits of a 32-bit address
    High,
    /// Low 16 bits of a 32-bit address
    Low,
    /// Full 32-bit address
    HighLow,
    /// High 16 bits with adjustment in the following entry
    HighAdj,
    /// Full 64-bit address
    Dir64,
    /// Any other architecture-specific type
    Other(u8),
}

impl RelocationType {
    /// Decode the 4-bit type field.
    #[must_use]
    pub fn from_raw(raw: u8) -> RelocationType {
        match raw {
            0 => RelocationType::Absolute,
            1 => RelocationType::High,
            2 => RelocationType::Low,
            3 => RelocationType::HighLow,
            4 => RelocationType::HighAdj,
            10 => RelocationType::Dir64,
            other => RelocationType::Other(other),
        }
    }

    /// Encode back into the 4-bit type field.
    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            RelocationType::Absolute => 0,
            RelocationType::High => 1,
            RelocationType::Low => 2,
            RelocationType::HighLow => 3,
            RelocationType::HighAdj => 4,
            RelocationType::Dir64 => 10,
            RelocationType::Other(other) => other & 0x0F,
        }
    }
}

/// One fixup inside a [`RelocationBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry {
    /// Kind of fixup
    pub kind: RelocationType,
    /// Offset of the site within the block's page
    pub offset: u16,
}

impl RelocationEntry {
    /// Decode a packed 16-bit entry.
    #[must_use]
    pub fn from_raw(raw: u16) -> RelocationEntry {
        RelocationEntry {
            kind: RelocationType::from_raw((raw >> 12) as u8),
            offset: raw & 0x0FFF,
        }
    }

    /// Pack into the 16-bit on-disk form.
    #[must_use]
    pub fn to_raw(self) -> u16 {
        (u16::from(self.kind.to_raw()) << 12) | (self.offset & 0x0FFF)
    }
}

/// A decoded base relocation block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationBlock {
    /// RVA of the page the entries are relative to
    pub virtual_address: u32,
    /// Entries in table order
    pub entries: Vec<RelocationEntry>,
}

impl RelocationBlock {
    /// RVA of the site an entry patches.
    #[must_use]
    pub fn site(&self, entry: &RelocationEntry) -> u64 {
        u64::from(self.virtual_address) + u64::from(entry.offset)
    }
}

/// Decode the base relocation table of a mapped image.
///
/// `image` must be laid out in memory order (RVA == offset), i.e. the staging buffer. A block
/// with `SizeOfBlock == 0` terminates the table early, matching the platform loader.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the directory or a block runs past `image`, and
/// [`crate::Error::Malformed`] for a block shorter than its own header.
pub fn relocation_blocks(image: &[u8], headers: &NtHeaders) -> Result<Vec<RelocationBlock>> {
    let Some(directory) = headers.base_relocations else {
        return Ok(Vec::new());
    };

    let start = directory.rva as usize;
    let end = start
        .checked_add(directory.size as usize)
        .ok_or(crate::Error::OutOfBounds)?;
    if end > image.len() {
        return Err(crate::Error::OutOfBounds);
    }

    let table = &image[..end];
    let mut parser = Parser::new(table);
    parser.seek(start)?;

    let mut blocks = Vec::new();
    while end - parser.pos() >= BLOCK_HEADER_SIZE as usize {
        let virtual_address = parser.read_le::<u32>()?;
        let size_of_block = parser.read_le::<u32>()?;
        if size_of_block == 0 {
            break;
        }
        if size_of_block < BLOCK_HEADER_SIZE {
            return Err(malformed_error!(
                "Relocation block at page {:#x} declares size {:#x}",
                virtual_address,
                size_of_block
            ));
        }

        let count = ((size_of_block - BLOCK_HEADER_SIZE) / 2) as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(RelocationEntry::from_raw(parser.read_le::<u16>()?));
        }

        blocks.push(RelocationBlock {
            virtual_address,
            entries,
        });

        if parser.pos() >= end {
            break;
        }
    }

    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::ImageBuilder,
        pe::{Directory, SectionFlags},
        Error,
    };

    fn headers_with(directory: Option<Directory>) -> NtHeaders {
        let image = ImageBuilder::new()
            .section(".text", SectionFlags::MEM_READ, 0x1000, vec![0; 0x10])
            .build();
        let mut headers = NtHeaders::parse(&image.bytes).unwrap();
        headers.base_relocations = directory;
        headers
    }

    #[test]
    fn entry_packing() {
        let entry = RelocationEntry::from_raw(0xA123);
        assert_eq!(entry.kind, RelocationType::Dir64);
        assert_eq!(entry.offset, 0x123);
        assert_eq!(entry.to_raw(), 0xA123);

        let entry = RelocationEntry::from_raw(0x3FFF);
        assert_eq!(entry.kind, RelocationType::HighLow);
        assert_eq!(entry.offset, 0xFFF);

        assert_eq!(RelocationType::from_raw(7), RelocationType::Other(7));
    }

    #[test]
    fn decode_blocks() {
        let mut image = vec![0_u8; 0x100];
        let table: [u8; 24] = [
            0x00, 0x10, 0x00, 0x00, // page 0x1000
            0x0C, 0x00, 0x00, 0x00, // 12 bytes
            0x08, 0xA0, 0x00, 0x30, // DIR64 +0x8, HIGHLOW +0x0
            0x00, 0x20, 0x00, 0x00, // page 0x2000
            0x0C, 0x00, 0x00, 0x00, // 12 bytes
            0x10, 0xA0, 0x00, 0x00, // DIR64 +0x10, ABSOLUTE padding
        ];
        image[0x40..0x58].copy_from_slice(&table);

        let headers = headers_with(Some(Directory {
            rva: 0x40,
            size: 24,
        }));
        let blocks = relocation_blocks(&image, &headers).unwrap();

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].virtual_address, 0x1000);
        assert_eq!(blocks[0].entries.len(), 2);
        assert_eq!(blocks[0].site(&blocks[0].entries[0]), 0x1008);
        assert_eq!(blocks[0].entries[1].kind, RelocationType::HighLow);
        assert_eq!(blocks[1].entries[1].kind, RelocationType::Absolute);
    }

    #[test]
    fn zero_sized_block_terminates() {
        let mut image = vec![0_u8; 0x40];
        image[0x10..0x14].copy_from_slice(&0x1000_u32.to_le_bytes());

        let headers = headers_with(Some(Directory {
            rva: 0x10,
            size: 0x20,
        }));
        assert!(relocation_blocks(&image, &headers).unwrap().is_empty());
    }

    #[test]
    fn malformed_tables() {
        let mut image = vec![0_u8; 0x40];
        image[0x10..0x14].copy_from_slice(&0x1000_u32.to_le_bytes());
        image[0x14..0x18].copy_from_slice(&4_u32.to_le_bytes());

        let headers = headers_with(Some(Directory {
            rva: 0x10,
            size: 0x10,
        }));
        assert!(matches!(
            relocation_blocks(&image, &headers),
            Err(Error::Malformed { .. })
        ));

        let headers = headers_with(Some(Directory {
            rva: 0x30,
            size: 0x20,
        }));
        assert!(matches!(
            relocation_blocks(&image, &headers),
            Err(Error::OutOfBounds)
        ));
    }

    #[test]
    fn no_directory() {
        let headers = headers_with(None);
        assert!(relocation_blocks(&[], &headers).unwrap().is_empty());
    }
}
