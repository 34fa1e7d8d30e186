//! End-to-end mapping through the public API.
//!
//! Images are synthesized with [`ImageBuilder`] and mapped into a [`SimulatedChannel`], then the
//! target memory is inspected to check that relocations, imports and the security cookie landed
//! where a loader would have put them.

use pemap::{
    builder::{ImageBuilder, ImportSpec},
    channel::ChannelCall,
    mapper::{FixedClock, DEFAULT_SECURITY_COOKIE},
    pe::{RelocationType, SectionFlags},
    Error, Image, MapOptions, MapProfile, MapStage, Mapper, NtStatus, PoolType, Result,
    SimulatedChannel, StaticRegistry,
};

const PREFERRED: u64 = 0x1_4000_0000;
const NTOS: u64 = 0xFFFF_F800_0000_0000;
const HAL: u64 = 0xFFFF_F800_1000_0000;
const TARGET: u64 = 0xFFFF_C000_0000_0000;

fn read_u64(memory: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(memory[offset..offset + 8].try_into().unwrap())
}

/// A small driver: `.text` with the entry point, `.data` holding two absolute pointers and a
/// `/GS` cookie pair, an `INIT` section without access bits, imports from two modules.
fn driver() -> ImageBuilder {
    let mut data = vec![0_u8; 0x40];
    data[0x00..0x08].copy_from_slice(&(PREFERRED + 0x1000).to_le_bytes());
    data[0x08..0x10].copy_from_slice(&(PREFERRED + 0x2030).to_le_bytes());
    data[0x20..0x28].copy_from_slice(&DEFAULT_SECURITY_COOKIE.to_le_bytes());
    data[0x28..0x30].copy_from_slice(&(!DEFAULT_SECURITY_COOKIE).to_le_bytes());

    ImageBuilder::new()
        .image_base(PREFERRED)
        .entry_point(0x1000)
        .section(
            ".text",
            SectionFlags::CNT_CODE | SectionFlags::MEM_EXECUTE | SectionFlags::MEM_READ,
            0x1000,
            vec![0x90, 0x90, 0xC3],
        )
        .section(
            ".data",
            SectionFlags::CNT_INITIALIZED_DATA | SectionFlags::MEM_READ | SectionFlags::MEM_WRITE,
            0x2000,
            data,
        )
        .section("INIT", SectionFlags::CNT_INITIALIZED_DATA, 0x3000, vec![0xAB; 0x20])
        .relocations(
            0x2000,
            &[(RelocationType::Dir64, 0x0), (RelocationType::Dir64, 0x8)],
        )
        .import(ImportSpec::new("ntoskrnl.exe", &["DbgPrint", "IoCreateDevice"]))
        .import(ImportSpec::new("HAL.dll", &["KeStallExecutionProcessor"]))
        .load_config(PREFERRED + 0x2020)
}

fn registry() -> StaticRegistry {
    StaticRegistry::new()
        .with_module("ntoskrnl.exe", NTOS)
        .with_module("hal.dll", HAL)
}

fn channel() -> SimulatedChannel {
    SimulatedChannel::with_base(TARGET)
        .with_export(NTOS, "DbgPrint", NTOS + 0x100)
        .with_export(NTOS, "IoCreateDevice", NTOS + 0x200)
        .with_export(HAL, "KeStallExecutionProcessor", HAL + 0x300)
}

#[test]
fn file_image_is_fully_bound() -> Result<()> {
    let built = driver().build();
    let image = Image::from_mem(built.bytes.clone())?;
    let registry = registry();

    let mut mapper = Mapper::new(channel(), &registry)
        .with_options(MapOptions::default().entry_args(&[0x1111, 0x2222]));
    let mapped = mapper.map_image(&image, &MapProfile::file())?;

    assert_eq!(mapped.base, TARGET);
    assert_eq!(mapped.size, image.size_of_image());
    assert_eq!(mapped.entry_point, TARGET + 0x1000);
    assert_eq!(mapped.status, NtStatus::SUCCESS);

    let channel = mapper.channel();
    let memory = channel.memory(TARGET).unwrap();

    // Headers erased after the entry point returned
    assert!(memory[..image.size_of_headers()].iter().all(|&b| b == 0));
    assert_eq!(&memory[0x1000..0x1003], &[0x90, 0x90, 0xC3]);
    assert_eq!(read_u64(memory, 0x2000), TARGET + 0x1000);
    assert_eq!(read_u64(memory, 0x2008), TARGET + 0x2030);

    // File profile copies every section and leaves the cookie alone
    assert_eq!(&memory[0x3000..0x3020], &[0xAB; 0x20]);
    assert_eq!(read_u64(memory, 0x2020), DEFAULT_SECURITY_COOKIE);

    let slot = |module: &str, function: &str| built.slot(module, function).unwrap() as usize;
    assert_eq!(read_u64(memory, slot("ntoskrnl.exe", "DbgPrint")), NTOS + 0x100);
    assert_eq!(read_u64(memory, slot("ntoskrnl.exe", "IoCreateDevice")), NTOS + 0x200);
    assert_eq!(
        read_u64(memory, slot("HAL.dll", "KeStallExecutionProcessor")),
        HAL + 0x300
    );

    assert_eq!(channel.live_allocations(), 1);
    assert_eq!(channel.free_count(), 0);
    assert!(channel.calls().contains(&ChannelCall::Invoke {
        address: TARGET + 0x1000,
        args: vec![0x1111, 0x2222],
    }));
    Ok(())
}

#[test]
fn embedded_image_gets_fresh_cookie() -> Result<()> {
    let built = driver().build();
    let bytes: &'static [u8] = Box::leak(built.bytes.into_boxed_slice());
    let registry = registry();

    let mut mapper = Mapper::new(channel(), &registry)
        .with_clock(FixedClock(0x0BAD_F00D))
        .with_options(MapOptions::default().pool(PoolType::NonPagedNx).erase_headers(false));
    let mapped = mapper.map_embedded(bytes)?;

    let channel = mapper.channel();
    assert!(matches!(
        channel.calls().first(),
        Some(ChannelCall::Allocate {
            pool: PoolType::NonPagedNx,
            ..
        })
    ));

    let memory = channel.memory(mapped.base).unwrap();
    assert_eq!(&memory[..2], b"MZ");

    // INIT has no access bits, so the embedded profile leaves it zero
    assert!(memory[0x3000..0x3020].iter().all(|&b| b == 0));

    let cookie = read_u64(memory, 0x2020);
    assert_ne!(cookie, DEFAULT_SECURITY_COOKIE);
    assert_eq!(cookie >> 48, 0);
    assert_eq!(read_u64(memory, 0x2028), !cookie);
    Ok(())
}

#[test]
fn unresolved_import_never_reaches_the_target() {
    let image = Image::from_mem(driver().build().bytes).unwrap();
    let registry = StaticRegistry::new().with_module("ntoskrnl.exe", NTOS);

    let mut mapper = Mapper::new(channel(), &registry);
    let result = mapper.map_image(&image, &MapProfile::file());

    assert!(matches!(result, Err(Error::ModuleNotFound(name)) if name == "HAL.dll"));
    let channel = mapper.channel();
    assert_eq!(channel.write_count(), 0);
    assert_eq!(channel.allocation_count(), 1);
    assert_eq!(channel.free_count(), 1);
    assert_eq!(channel.live_allocations(), 0);
}

#[test]
fn failing_status_is_reported_not_raised() -> Result<()> {
    let image = Image::from_mem(driver().build().bytes)?;
    let registry = registry();

    let mut mapper = Mapper::new(
        channel().with_entry_status(NtStatus::UNSUCCESSFUL),
        &registry,
    );
    let mapped = mapper.map_image(&image, &MapProfile::file())?;

    assert!(!mapped.status.is_success());
    assert_eq!(mapper.channel().live_allocations(), 1);
    Ok(())
}

#[test]
fn consecutive_mappings_use_distinct_allocations() -> Result<()> {
    let image = Image::from_mem(driver().build().bytes)?;
    let registry = registry();

    let mut mapper = Mapper::new(channel(), &registry);
    let first = mapper.map_image(&image, &MapProfile::file())?;
    let second = mapper.map_image(&image, &MapProfile::file())?;

    assert_ne!(first.base, second.base);
    assert!(second.base >= first.base + first.size as u64);

    let (channel, _) = mapper.into_parts();
    assert_eq!(channel.live_allocations(), 2);
    Ok(())
}

#[test]
fn non_pe32_plus_is_rejected_up_front() {
    let bytes = driver().magic(0x10B).build().bytes;
    assert!(matches!(
        Image::from_mem(bytes),
        Err(Error::NotSupported) | Err(Error::GoblinErr(_))
    ));

    let registry = registry();
    let mut mapper = Mapper::new(channel(), &registry);
    assert!(mapper.map_file("/nonexistent/driver.sys").is_err());
    assert!(mapper.channel().calls().is_empty());
}

#[test]
fn stages_are_named_for_logs() {
    assert_eq!(MapStage::ResolveImports.to_string(), "ResolveImports");
}
