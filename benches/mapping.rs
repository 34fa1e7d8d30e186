extern crate pemap;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use pemap::{
    builder::{ImageBuilder, ImportSpec},
    mapper::{copy_layout, relocate_image_by_delta, SectionFilter},
    pe::{relocation_blocks, RelocationType, SectionFlags},
    Image, MapProfile, Mapper, SimulatedChannel, StaticRegistry,
};
use std::hint::black_box;

const NTOS: u64 = 0xFFFF_F800_0000_0000;
const FUNCTIONS: [&str; 8] = [
    "DbgPrint",
    "ExAllocatePool2",
    "ExFreePoolWithTag",
    "IoCreateDevice",
    "IoDeleteDevice",
    "KeBugCheckEx",
    "MmGetSystemRoutineAddress",
    "RtlInitUnicodeString",
];

/// A driver-shaped image: 1 MiB of code, 256 KiB of data with a pointer every 64 bytes.
fn driver_image() -> Image {
    let data_len = 0x4_0000;
    let mut data = vec![0_u8; data_len];
    for offset in (0..data_len).step_by(64) {
        data[offset..offset + 8].copy_from_slice(&(0x1_4000_1000_u64 + offset as u64).to_le_bytes());
    }

    let mut builder = ImageBuilder::new()
        .section(
            ".text",
            SectionFlags::CNT_CODE | SectionFlags::MEM_EXECUTE | SectionFlags::MEM_READ,
            0x1000,
            vec![0xCC; 0x10_0000],
        )
        .section(
            ".data",
            SectionFlags::MEM_READ | SectionFlags::MEM_WRITE,
            0x10_1000,
            data,
        )
        .import(ImportSpec::new("ntoskrnl.exe", &FUNCTIONS));
    for page in 0..(data_len / 0x1000) {
        let entries: Vec<(RelocationType, u16)> = (0..0x1000_u16)
            .step_by(64)
            .map(|offset| (RelocationType::Dir64, offset))
            .collect();
        builder = builder.relocations(0x10_1000 + (page * 0x1000) as u32, &entries);
    }

    Image::from_mem(builder.build().bytes).unwrap()
}

fn bench_layout(c: &mut Criterion) {
    let image = driver_image();
    let blocks = {
        let staging = copy_layout(&image, SectionFilter::All).unwrap();
        relocation_blocks(staging.as_slice(), image.headers()).unwrap()
    };

    let mut group = c.benchmark_group("layout");
    group.throughput(Throughput::Bytes(image.size_of_image() as u64));
    group.bench_function("copy_layout", |b| {
        b.iter(|| black_box(copy_layout(black_box(&image), SectionFilter::All).unwrap()));
    });
    group.bench_function("relocate", |b| {
        b.iter_batched(
            || copy_layout(&image, SectionFilter::All).unwrap(),
            |mut staging| {
                black_box(
                    relocate_image_by_delta(&mut staging, &blocks, 0xFFFF_A000_0000_0000).unwrap(),
                )
            },
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

fn bench_map(c: &mut Criterion) {
    let image = driver_image();
    let registry = StaticRegistry::new().with_module("ntoskrnl.exe", NTOS);
    let channel = FUNCTIONS
        .iter()
        .enumerate()
        .fold(SimulatedChannel::new(), |channel, (i, name)| {
            channel.with_export(NTOS, name, NTOS + 0x1000 * (i as u64 + 1))
        });

    let mut group = c.benchmark_group("map");
    group.throughput(Throughput::Bytes(image.size_of_image() as u64));
    for (name, profile) in [("file", MapProfile::file()), ("embedded", MapProfile::embedded())] {
        group.bench_function(name, |b| {
            b.iter_batched(
                || Mapper::new(channel.clone(), &registry),
                |mut mapper| black_box(mapper.map_image(&image, &profile).unwrap()),
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_layout, bench_map);
criterion_main!(benches);
