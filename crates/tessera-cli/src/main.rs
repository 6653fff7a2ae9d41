//! `tessera` command-line front end
//!
//! A thin wrapper around tessera-install that:
//! 1. Parses command-line arguments
//! 2. Initializes logging
//! 3. Runs one subcommand against the state directory
//!
//! Any error is reported on stderr and exits with status 1.

mod commands;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::output::OutputFormat;

#[derive(Parser)]
#[command(
    name = "tessera",
    about = "Install, update, verify and repair chunked game builds",
    version
)]
struct Cli {
    /// Log filter, e.g. `info` or `tessera_install=debug`; `RUST_LOG` wins when set
    #[arg(long, global = true, env = "TESSERA_LOG", default_value = "info")]
    log_level: String,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Output format for command results
    #[arg(short = 'o', long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Configuration root holding installed.json, manifests and resume files
    #[arg(long, global = true, env = "TESSERA_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Show metadata and sizes of a manifest
    Info(commands::InfoArgs),
    /// Compare two manifests file by file
    Diff(commands::DiffArgs),
    /// Install or update from a manifest
    Install(commands::InstallArgs),
    /// Hash installed files and write a repair file
    Verify(commands::AppArgs),
    /// Redownload files that failed verification
    Repair(commands::RepairArgs),
    /// Build a manifest and chunks from a savegame directory
    Pack(commands::PackArgs),
    /// Remove an installed application
    Uninstall(commands::UninstallArgs),
    /// List installed applications
    ListInstalled,
}

fn init_logging(filter: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format);

    let ctx = commands::Context::new(cli.state_dir, cli.format)?;
    match cli.command {
        Command::Info(args) => commands::info(&ctx, &args).await,
        Command::Diff(args) => commands::diff(&ctx, &args).await,
        Command::Install(args) => commands::install(&ctx, &args).await,
        Command::Verify(args) => commands::verify(&ctx, &args),
        Command::Repair(args) => commands::repair(&ctx, &args).await,
        Command::Pack(args) => commands::pack(&ctx, &args),
        Command::Uninstall(args) => commands::uninstall(&ctx, &args),
        Command::ListInstalled => commands::list_installed(&ctx),
    }
}
