use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, ValueEnum};
use policy_core::{load_config, Config, IpMode};

#[derive(Parser, Debug)]
#[command(name = "policy-compiler")]
#[command(about = "Compile a network security policy into per-device access lists")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Check a policy and generate access lists for all managed devices.
    Compile(CompileArgs),
    /// Write NAT sets per owner and addresses of all objects.
    Export(ExportArgs),
    /// Show the routers passed by traffic between two objects.
    Trace(TraceArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
pub enum IpModeArg {
    Ipv4,
    Ipv6,
    Dual,
}

impl From<IpModeArg> for IpMode {
    fn from(mode: IpModeArg) -> Self {
        match mode {
            IpModeArg::Ipv4 => IpMode::Ipv4,
            IpModeArg::Ipv6 => IpMode::Ipv6,
            IpModeArg::Dual => IpMode::Dual,
        }
    }
}

/// Options shared by all subcommands.
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Policy file (JSON, or TOML for `*.toml`).
    pub input: PathBuf,
    /// Configuration file overriding the built-in defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Show info and progress messages.
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,
    /// Only show warnings and errors.
    #[arg(short, long)]
    pub quiet: bool,
    /// Prefix progress messages with elapsed seconds.
    #[arg(long)]
    pub time_stamps: bool,
    /// Abort after this many errors; 0 disables the limit.
    #[arg(long)]
    pub max_errors: Option<usize>,
    #[arg(long, value_enum)]
    pub ip_mode: Option<IpModeArg>,
    /// Emit messages ordered by severity and text.
    #[arg(long)]
    pub sort_messages: bool,
}

impl CommonArgs {
    /// Built-in defaults, overlaid by the config file, overlaid by flags.
    pub fn config(&self) -> Result<Config> {
        let mut config = load_config(self.config.as_deref()).with_context(|| match &self.config {
            Some(path) => format!("failed to load config {}", path.display()),
            None => "failed to load built-in config".to_string(),
        })?;
        if self.verbose {
            config.verbose = true;
        }
        if self.quiet {
            config.verbose = false;
        }
        if self.time_stamps {
            config.time_stamps = true;
        }
        if let Some(max) = self.max_errors {
            config.max_errors = max;
        }
        if let Some(mode) = self.ip_mode {
            config.ip_mode = mode.into();
        }
        if self.sort_messages {
            config.sort_messages = true;
        }
        Ok(config)
    }
}

#[derive(Parser, Debug)]
pub struct CompileArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    /// Directory receiving one code file per device.
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct ExportArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    /// Directory receiving `objects` and `owner/<owner>/nat_set`.
    #[arg(long)]
    pub out: PathBuf,
}

#[derive(Parser, Debug)]
pub struct TraceArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    /// Source object, e.g. `network:a` or `host:h1`.
    pub from: String,
    /// Destination object.
    pub to: String,
}
