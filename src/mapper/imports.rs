use log::debug;

use super::StagingBuffer;
use crate::{
    channel::KernelChannel, pe::ImportModule, registry::ModuleRegistry, Error, Result,
};

/// Bind every import of the staged image to its target-space address.
///
/// Each module is looked up in `registry`; each function is resolved through the channel's
/// export lookup against that module's base, and the result is written into the function's
/// IAT slot. Resolution stops at the first failure, so a partially bound staging buffer is
/// never transferred. Returns the number of slots written.
///
/// # Errors
///
/// - [`crate::Error::ModuleNotFound`] if a module is not resident
/// - [`crate::Error::ExportNotFound`] if a function resolves to nothing or to zero
/// - [`crate::Error::Malformed`] if a slot lies outside the staging buffer
pub fn resolve_imports<C, R>(
    staging: &mut StagingBuffer,
    modules: &[ImportModule],
    channel: &mut C,
    registry: &R,
) -> Result<usize>
where
    C: KernelChannel + ?Sized,
    R: ModuleRegistry + ?Sized,
{
    let mut resolved = 0;
    for module in modules {
        let Some(base) = registry.module_base(&module.name).filter(|&base| base != 0) else {
            return Err(Error::ModuleNotFound(module.name.clone()));
        };
        debug!("Module {} resident at {:#x}", module.name, base);

        for function in &module.functions {
            let Some(address) = channel
                .resolve_export(base, &function.name)
                .filter(|&address| address != 0)
            else {
                return Err(Error::ExportNotFound {
                    module: module.name.clone(),
                    symbol: function.name.clone(),
                });
            };

            staging
                .write_u64(function.slot_rva as usize, address)
                .map_err(|_| {
                    malformed_error!(
                        "IAT slot {:#x} for {} lies outside the image",
                        function.slot_rva,
                        function.name
                    )
                })?;
            debug!("{}!{} -> {:#x}", module.name, function.name, address);
            resolved += 1;
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{ChannelCall, SimulatedChannel},
        pe::ImportFunction,
        registry::StaticRegistry,
    };

    const NTOS: u64 = 0xFFFF_F800_0000_0000;

    fn modules() -> Vec<ImportModule> {
        vec![ImportModule {
            name: "ntoskrnl.exe".to_string(),
            functions: vec![
                ImportFunction {
                    name: "IoCreateDevice".to_string(),
                    slot_rva: 0x100,
                },
                ImportFunction {
                    name: "IoDeleteDevice".to_string(),
                    slot_rva: 0x108,
                },
            ],
        }]
    }

    #[test]
    fn slots_receive_exports() {
        let mut staging = StagingBuffer::new(0x1000).unwrap();
        let mut channel = SimulatedChannel::new()
            .with_export(NTOS, "IoCreateDevice", NTOS + 0x10)
            .with_export(NTOS, "IoDeleteDevice", NTOS + 0x20);
        let registry = StaticRegistry::new().with_module("NTOSKRNL.EXE", NTOS);

        let count = resolve_imports(&mut staging, &modules(), &mut channel, &registry).unwrap();
        assert_eq!(count, 2);
        assert_eq!(staging.read_u64(0x100).unwrap(), NTOS + 0x10);
        assert_eq!(staging.read_u64(0x108).unwrap(), NTOS + 0x20);
    }

    #[test]
    fn missing_module() {
        let mut staging = StagingBuffer::new(0x1000).unwrap();
        let mut channel = SimulatedChannel::new();
        let registry = StaticRegistry::new();

        let result = resolve_imports(&mut staging, &modules(), &mut channel, &registry);
        assert!(matches!(result, Err(Error::ModuleNotFound(name)) if name == "ntoskrnl.exe"));
        assert!(channel.calls().is_empty());
    }

    #[test]
    fn missing_symbol() {
        let mut staging = StagingBuffer::new(0x1000).unwrap();
        let mut channel = SimulatedChannel::new()
            .with_export(NTOS, "IoCreateDevice", NTOS + 0x10)
            .with_export(NTOS, "IoDeleteDevice", 0);
        let registry = StaticRegistry::new().with_module("ntoskrnl.exe", NTOS);

        let result = resolve_imports(&mut staging, &modules(), &mut channel, &registry);
        assert!(matches!(
            result,
            Err(Error::ExportNotFound { module, symbol })
                if module == "ntoskrnl.exe" && symbol == "IoDeleteDevice"
        ));
        assert_eq!(
            channel.calls().last(),
            Some(&ChannelCall::ResolveExport {
                module_base: NTOS,
                name: "IoDeleteDevice".to_string()
            })
        );
    }

    #[test]
    fn slot_out_of_range() {
        let mut staging = StagingBuffer::new(0x104).unwrap();
        let mut channel = SimulatedChannel::new()
            .with_export(NTOS, "IoCreateDevice", NTOS + 0x10);
        let registry = StaticRegistry::new().with_module("ntoskrnl.exe", NTOS);

        assert!(matches!(
            resolve_imports(&mut staging, &modules(), &mut channel, &registry),
            Err(Error::Malformed { .. })
        ));
    }
}
