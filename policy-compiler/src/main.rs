use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod compile_cmd;
mod export_cmd;
mod path_guard;
mod report;
mod trace_cmd;

use cli::{Cli, Command};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Compile(args) => compile_cmd::run_compile(args),
        Command::Export(args) => export_cmd::run_export(args),
        Command::Trace(args) => trace_cmd::run_trace(args),
    }
}
