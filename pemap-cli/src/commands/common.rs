use std::path::Path;

use anyhow::{bail, Context};
use pemap::{Image, ModuleRegistry, PoolType, SimulatedChannel, StaticRegistry};

/// Load and validate a PE32+ image from disk.
pub fn load_image(path: &Path) -> anyhow::Result<Image> {
    Image::from_file(path).with_context(|| format!("failed to load image: {}", path.display()))
}

/// Parse an address given as `0x`-prefixed hex or plain decimal.
pub fn parse_address(text: &str) -> anyhow::Result<u64> {
    let text = text.trim().replace('_', "");
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    };
    parsed.with_context(|| format!("invalid address: {text}"))
}

/// Parse a pool name as accepted by `--pool`.
pub fn parse_pool(text: &str) -> anyhow::Result<PoolType> {
    match text.to_ascii_lowercase().as_str() {
        "nonpaged" => Ok(PoolType::NonPaged),
        "paged" => Ok(PoolType::Paged),
        "nonpaged-nx" | "nonpagednx" => Ok(PoolType::NonPagedNx),
        _ => bail!("unknown pool '{text}', expected nonpaged, paged or nonpaged-nx"),
    }
}

/// Build a registry from `NAME=ADDR` entries.
pub fn parse_modules(entries: &[String]) -> anyhow::Result<StaticRegistry> {
    let mut registry = StaticRegistry::new();
    for entry in entries {
        let Some((name, address)) = entry.split_once('=') else {
            bail!("expected NAME=ADDR, got '{entry}'");
        };
        if name.is_empty() {
            bail!("module name missing in '{entry}'");
        }
        registry.insert(name, parse_address(address)?);
    }
    Ok(registry)
}

/// Register `MODULE!SYMBOL=ADDR` entries on `channel`.
///
/// The module must already be in `registry`; its base is the key the channel resolves against.
pub fn parse_exports(
    entries: &[String],
    registry: &StaticRegistry,
    mut channel: SimulatedChannel,
) -> anyhow::Result<SimulatedChannel> {
    for entry in entries {
        let Some((symbol_path, address)) = entry.split_once('=') else {
            bail!("expected MODULE!SYMBOL=ADDR, got '{entry}'");
        };
        let Some((module, symbol)) = symbol_path.split_once('!') else {
            bail!("expected MODULE!SYMBOL=ADDR, got '{entry}'");
        };
        let Some(base) = registry.module_base(module) else {
            bail!("export '{entry}' names module '{module}', which has no --module entry");
        };
        channel = channel.with_export(base, symbol, parse_address(address)?);
    }
    Ok(channel)
}

/// Format an address the way the rest of the output does.
pub fn hex(value: u64) -> String {
    format!("{value:#x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses() {
        assert_eq!(parse_address("0xFFFF_F800_0000_0000").unwrap(), 0xFFFF_F800_0000_0000);
        assert_eq!(parse_address("4096").unwrap(), 4096);
        assert!(parse_address("0xZZ").is_err());
        assert!(parse_address("").is_err());
    }

    #[test]
    fn pools() {
        assert_eq!(parse_pool("NonPaged").unwrap(), PoolType::NonPaged);
        assert_eq!(parse_pool("nonpaged-nx").unwrap(), PoolType::NonPagedNx);
        assert!(parse_pool("session").is_err());
    }

    #[test]
    fn modules_and_exports() {
        let registry =
            parse_modules(&["ntoskrnl.exe=0xfffff80000000000".to_string()]).unwrap();
        assert_eq!(registry.module_base("NTOSKRNL.EXE"), Some(0xFFFF_F800_0000_0000));

        let channel = parse_exports(
            &["ntoskrnl.exe!DbgPrint=0xfffff80000001000".to_string()],
            &registry,
            SimulatedChannel::new(),
        );
        assert!(channel.is_ok());

        assert!(parse_modules(&["ntoskrnl.exe".to_string()]).is_err());
        assert!(parse_exports(
            &["hal.dll!HalDispatch=0x10".to_string()],
            &registry,
            SimulatedChannel::new()
        )
        .is_err());
    }
}
