use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// pemap - inspect 64-bit PE images and dry-run manual mappings
#[derive(Debug, Parser)]
#[command(name = "pemap", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared across all subcommands.
#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Emit output as JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Display image overview: headers, sections, relocations, imports and security cookie.
    Info {
        /// Path to the PE32+ image.
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    /// Map an image into a simulated target space and report the result.
    Stage {
        /// Path to the PE32+ image.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Resident module and its base, e.g. ntoskrnl.exe=0xfffff80000000000. Repeatable.
        #[arg(long = "module", value_name = "NAME=ADDR")]
        modules: Vec<String>,

        /// Export of a resident module, e.g. ntoskrnl.exe!DbgPrint=0xfffff80000123450.
        /// Repeatable.
        #[arg(long = "export", value_name = "MODULE!SYMBOL=ADDR")]
        exports: Vec<String>,

        /// Use the embedded-image profile (accessible sections only, fresh security cookie).
        #[arg(long)]
        embedded: bool,

        /// First address the simulated pool hands out.
        #[arg(long, value_name = "ADDR")]
        base: Option<String>,

        /// Pool to allocate the image from: nonpaged, paged or nonpaged-nx.
        #[arg(long, value_name = "POOL", default_value = "nonpaged")]
        pool: String,

        /// Scalar argument passed to the entry point. Repeatable.
        #[arg(long = "arg", value_name = "VALUE")]
        args: Vec<String>,

        /// Leave the image headers in place after the entry point returned.
        #[arg(long)]
        keep_headers: bool,

        /// Write the mapped target memory to this file.
        #[arg(short, long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
}
