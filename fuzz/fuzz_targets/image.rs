#![no_main]

use libfuzzer_sys::fuzz_target;
use pemap::{Image, MapProfile, Mapper, SimulatedChannel, StaticRegistry};

fuzz_target!(|data: &[u8]| {
    let Ok(image) = Image::from_mem(data.to_vec()) else {
        return;
    };
    if image.size_of_image() > 0x0100_0000 {
        return;
    }

    // Every well-formed failure must come back as an error and leave nothing allocated
    let registry = StaticRegistry::new().with_module("ntoskrnl.exe", 0xFFFF_F800_0000_0000);
    for profile in [MapProfile::file(), MapProfile::embedded()] {
        let mut mapper = Mapper::new(SimulatedChannel::new(), &registry);
        if mapper.map_image(&image, &profile).is_err() {
            assert_eq!(mapper.channel().live_allocations(), 0);
        }
    }
});
