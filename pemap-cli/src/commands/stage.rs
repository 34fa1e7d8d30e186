use std::path::Path;

use anyhow::Context;
use pemap::{channel::ChannelCall, MapOptions, MapProfile, Mapper, SimulatedChannel};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::{hex, load_image, parse_address, parse_exports, parse_modules, parse_pool},
    output::{print_output, Align, TabWriter},
};

pub struct StageOptions<'a> {
    pub modules: &'a [String],
    pub exports: &'a [String],
    pub embedded: bool,
    pub base: Option<&'a str>,
    pub pool: &'a str,
    pub args: &'a [String],
    pub keep_headers: bool,
    pub out: Option<&'a Path>,
    pub global: &'a GlobalOptions,
}

#[derive(Debug, Serialize)]
pub struct StageResult {
    pub profile: &'static str,
    pub pool: String,
    pub base: String,
    pub size: String,
    pub entry_point: String,
    pub status: String,
    pub succeeded: bool,
    pub calls: Vec<CallInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written_to: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CallInfo {
    pub operation: &'static str,
    pub detail: String,
}

impl From<&ChannelCall> for CallInfo {
    fn from(call: &ChannelCall) -> Self {
        match call {
            ChannelCall::Allocate {
                pool,
                size,
                address,
            } => CallInfo {
                operation: "allocate",
                detail: match address {
                    Some(address) => format!("{size:#x} bytes of {pool} pool -> {address:#x}"),
                    None => format!("{size:#x} bytes of {pool} pool -> refused"),
                },
            },
            ChannelCall::Write { address, size } => CallInfo {
                operation: "write",
                detail: format!("{size:#x} bytes to {address:#x}"),
            },
            ChannelCall::Zero { address, size } => CallInfo {
                operation: "zero",
                detail: format!("{size:#x} bytes at {address:#x}"),
            },
            ChannelCall::Free { address } => CallInfo {
                operation: "free",
                detail: format!("{address:#x}"),
            },
            ChannelCall::Invoke { address, args } => CallInfo {
                operation: "invoke",
                detail: format!(
                    "{address:#x}({})",
                    args.iter()
                        .map(|arg| format!("{arg:#x}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            },
            ChannelCall::ResolveExport { module_base, name } => CallInfo {
                operation: "resolve",
                detail: format!("{name} in module at {module_base:#x}"),
            },
        }
    }
}

pub fn run(path: &Path, options: &StageOptions<'_>) -> anyhow::Result<()> {
    let image = load_image(path)?;

    let registry = parse_modules(options.modules)?;
    let channel = match options.base {
        Some(base) => SimulatedChannel::with_base(parse_address(base)?),
        None => SimulatedChannel::new(),
    };
    let channel = parse_exports(options.exports, &registry, channel)?;
    let entry_args = options
        .args
        .iter()
        .map(|arg| parse_address(arg))
        .collect::<anyhow::Result<Vec<u64>>>()?;

    let (profile, profile_name) = if options.embedded {
        (MapProfile::embedded(), "embedded")
    } else {
        (MapProfile::file(), "file")
    };

    let mut mapper = Mapper::new(channel, &registry).with_options(
        MapOptions::default()
            .pool(parse_pool(options.pool)?)
            .entry_args(&entry_args)
            .erase_headers(!options.keep_headers),
    );
    let mapped = mapper
        .map_image(&image, &profile)
        .with_context(|| format!("failed to map image: {}", path.display()))?;

    let written_to = match options.out {
        Some(out) => {
            let memory = mapper
                .channel()
                .memory(mapped.base)
                .context("mapped allocation is not present in the simulated target")?;
            std::fs::write(out, memory)
                .with_context(|| format!("failed to write {}", out.display()))?;
            Some(out.display().to_string())
        }
        None => None,
    };

    let result = StageResult {
        profile: profile_name,
        pool: mapper.options().pool.to_string(),
        base: hex(mapped.base),
        size: format!("{:#x}", mapped.size),
        entry_point: hex(mapped.entry_point),
        status: mapped.status.to_string(),
        succeeded: mapped.status.is_success(),
        calls: mapper.channel().calls().iter().map(CallInfo::from).collect(),
        written_to,
    };

    print_output(&result, options.global, |result| {
        println!("Profile:      {}", result.profile);
        println!("Pool:         {}", result.pool);
        println!("Base:         {}", result.base);
        println!("Size:         {}", result.size);
        println!("Entry point:  {}", result.entry_point);
        println!(
            "Status:       {}{}",
            result.status,
            if result.succeeded { "" } else { " (failure)" }
        );
        if let Some(out) = &result.written_to {
            println!("Written to:   {out}");
        }

        println!();
        println!("Channel calls ({}):", result.calls.len());
        let mut tw = TabWriter::new(&[("Operation", Align::Left), ("Detail", Align::Left)])
            .indent("  ");
        for call in &result.calls {
            tw.row(vec![call.operation.to_string(), call.detail.clone()]);
        }
        tw.print();
    })
}
