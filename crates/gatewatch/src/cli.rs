//! Clap derive structures for the `gatewatch` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// gatewatch -- monitor ISAPI access-control devices
#[derive(Debug, Parser)]
#[command(
    name = "gatewatch",
    version,
    about = "Authenticate, probe, and stream events from ISAPI access-control devices",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "GATEWATCH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "json", global = true)]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Authenticate against a device and print its identity
    Probe(DeviceArgs),

    /// Authenticate, then report device health
    Health(DeviceArgs),

    /// Stream canonical events until Ctrl-C
    #[command(alias = "w")]
    Watch(WatchArgs),

    /// Serve the device callback endpoint
    Serve(ServeArgs),

    /// Inspect configuration
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct DeviceArgs {
    /// Device id from the config file
    pub device: String,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Device ids from the config file
    #[arg(required = true)]
    pub devices: Vec<String>,

    /// Poll over HTTP instead of the WebSocket alert stream
    #[arg(long)]
    pub polling: bool,

    /// Event types to deliver (comma-separated, e.g. DOOR_OPEN,ALARM)
    #[arg(long, value_delimiter = ',')]
    pub types: Option<Vec<String>>,

    /// Polling interval in milliseconds
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Consecutive failures before a device is given up on
    #[arg(long)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Listen address (overrides [server].listen)
    #[arg(long)]
    pub listen: Option<String>,

    /// Prometheus exporter address (overrides [server].metrics_addr)
    #[arg(long)]
    pub metrics_addr: Option<String>,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file path
    Path,
    /// Print the effective configuration with secrets masked
    Show,
}
