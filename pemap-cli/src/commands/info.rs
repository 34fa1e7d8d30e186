use std::path::Path;

use pemap::{
    mapper::{copy_layout, SectionFilter},
    pe::{imports, load_config, relocation_blocks, RelocationType},
};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::{hex, load_image},
    output::{print_output, Align, TabWriter},
};

#[derive(Debug, Serialize)]
pub struct ImageInfo {
    pub machine: String,
    pub characteristics: String,
    pub image_base: String,
    pub size_of_image: String,
    pub size_of_headers: String,
    pub entry_point: String,
    pub relocs_stripped: bool,
    pub relocation_blocks: usize,
    pub relocation_sites: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_cookie: Option<String>,
    pub sections: Vec<SectionInfo>,
    pub imports: Vec<ImportInfo>,
}

#[derive(Debug, Serialize)]
pub struct SectionInfo {
    pub name: String,
    pub virtual_address: String,
    pub virtual_size: String,
    pub raw_offset: String,
    pub raw_size: String,
    pub flags: String,
    pub mapped: bool,
}

#[derive(Debug, Serialize)]
pub struct ImportInfo {
    pub module: String,
    pub symbol: String,
    pub slot: String,
}

pub fn run(path: &Path, opts: &GlobalOptions) -> anyhow::Result<()> {
    let image = load_image(path)?;
    let headers = image.headers();

    // The directories are RVA-addressed, so decode them from the memory layout
    let staging = copy_layout(&image, SectionFilter::All)?;
    let blocks = relocation_blocks(staging.as_slice(), headers)?;
    let modules = imports(staging.as_slice(), headers)?;
    let cookie = load_config(staging.as_slice(), headers)?
        .filter(|config| config.security_cookie != 0)
        .map(|config| hex(config.security_cookie));

    let info = ImageInfo {
        machine: format!("{:#06x}", headers.machine),
        characteristics: format!("{:?}", headers.characteristics),
        image_base: hex(headers.image_base),
        size_of_image: format!("{:#x}", headers.size_of_image),
        size_of_headers: format!("{:#x}", headers.size_of_headers),
        entry_point: format!("{:#x}", headers.address_of_entry_point),
        relocs_stripped: headers.relocs_stripped(),
        relocation_blocks: blocks.len(),
        relocation_sites: blocks
            .iter()
            .flat_map(|block| &block.entries)
            .filter(|entry| entry.kind == RelocationType::Dir64)
            .count(),
        security_cookie: cookie,
        sections: image
            .sections()
            .iter()
            .map(|section| SectionInfo {
                name: section.name(),
                virtual_address: format!("{:#x}", section.virtual_address),
                virtual_size: format!("{:#x}", section.virtual_size),
                raw_offset: format!("{:#x}", section.pointer_to_raw_data),
                raw_size: format!("{:#x}", section.size_of_raw_data),
                flags: format!("{:#010x}", section.characteristics.bits()),
                mapped: SectionFilter::Mapped.admits(section),
            })
            .collect(),
        imports: modules
            .iter()
            .flat_map(|module| {
                module.functions.iter().map(|function| ImportInfo {
                    module: module.name.clone(),
                    symbol: function.name.clone(),
                    slot: format!("{:#x}", function.slot_rva),
                })
            })
            .collect(),
    };

    print_output(&info, opts, |info| {
        println!("Machine:          {}", info.machine);
        println!("Characteristics:  {}", info.characteristics);
        println!("Image base:       {}", info.image_base);
        println!("Size of image:    {}", info.size_of_image);
        println!("Size of headers:  {}", info.size_of_headers);
        println!("Entry point RVA:  {}", info.entry_point);
        println!(
            "Relocations:      {} sites in {} blocks{}",
            info.relocation_sites,
            info.relocation_blocks,
            if info.relocs_stripped { " (stripped)" } else { "" }
        );
        println!(
            "Security cookie:  {}",
            info.security_cookie.as_deref().unwrap_or("-")
        );

        println!();
        println!("Sections ({}):", info.sections.len());
        let mut tw = TabWriter::new(&[
            ("Name", Align::Left),
            ("VA", Align::Right),
            ("VSize", Align::Right),
            ("Raw", Align::Right),
            ("RawSize", Align::Right),
            ("Flags", Align::Right),
            ("Embedded", Align::Left),
        ])
        .indent("  ");
        for section in &info.sections {
            tw.row(vec![
                section.name.clone(),
                section.virtual_address.clone(),
                section.virtual_size.clone(),
                section.raw_offset.clone(),
                section.raw_size.clone(),
                section.flags.clone(),
                if section.mapped { "yes" } else { "no" }.to_string(),
            ]);
        }
        tw.print();

        if !info.imports.is_empty() {
            println!();
            println!("Imports ({}):", info.imports.len());
            let mut tw = TabWriter::new(&[
                ("Module", Align::Left),
                ("Symbol", Align::Left),
                ("Slot", Align::Right),
            ])
            .indent("  ");
            for import in &info.imports {
                tw.row(vec![
                    import.module.clone(),
                    import.symbol.clone(),
                    import.slot.clone(),
                ]);
            }
            tw.print();
        }
    })
}
