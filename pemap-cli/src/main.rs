mod app;
mod commands;
mod output;

use clap::Parser;

use crate::app::{Cli, Command};

fn main() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        eprintln!("\nCancelled.");
        std::process::exit(130);
    })?;

    let cli = Cli::parse();

    // Show pemap info+ on stderr unless --json; --verbose enables debug; RUST_LOG overrides
    if !cli.global.json {
        let level = if cli.global.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        env_logger::Builder::new()
            .filter_module("pemap", level)
            .parse_default_env()
            .target(env_logger::Target::Stderr)
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .init();
    }

    match &cli.command {
        Command::Info { path } => commands::info::run(path, &cli.global),
        Command::Stage {
            path,
            modules,
            exports,
            embedded,
            base,
            pool,
            args,
            keep_headers,
            out,
        } => commands::stage::run(
            path,
            &commands::stage::StageOptions {
                modules,
                exports,
                embedded: *embedded,
                base: base.as_deref(),
                pool,
                args,
                keep_headers: *keep_headers,
                out: out.as_deref(),
                global: &cli.global,
            },
        ),
    }
}
