//! camerabridge CLI
//!
//! Keeps a laptop camera available on a stable virtual capture device.
//!
//! # Usage
//!
//! ```bash
//! # Run the bridge daemon and enable the camera right away
//! camerabridge run --enable
//!
//! # Control a running daemon
//! camerabridge toggle
//! camerabridge set-resolution 1920 1080
//! camerabridge status --json
//! ```

mod commands;

use anyhow::Result;
use camerabridge_core::BridgeError;
use camerabridge_core::error::EXIT_INVALID_CONFIG;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use commands::GlobalArgs;

/// camerabridge - virtual camera bridge for vendor camera pipelines
#[derive(Parser)]
#[command(name = "camerabridge")]
#[command(version)]
#[command(about = "Keeps a laptop camera available on a stable virtual capture device", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Control socket of the daemon
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge daemon
    Run(commands::RunArgs),

    /// Start the camera bridge
    #[command(alias = "on")]
    Enable,

    /// Stop the camera bridge
    #[command(alias = "off")]
    Disable,

    /// Enable the bridge if it is off, disable it otherwise
    Toggle,

    /// Show bridge status
    Status(commands::StatusArgs),

    /// Restart the pipeline at another resolution
    SetResolution(commands::ResolutionArgs),

    /// Manage the configuration file
    Config(commands::ConfigArgs),

    /// Check the system for everything the bridge needs
    Info,

    /// Print a systemd user unit for the daemon
    Unit,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["camerabridge", "camerabridge_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let global = GlobalArgs {
        config: cli.config,
        socket: cli.socket,
    };

    match run(cli.command, &global).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            let bridge_error = err.chain().find_map(|e| e.downcast_ref::<BridgeError>());
            if let Some(hint) = bridge_error.and_then(|e| e.user_hint()) {
                eprintln!("Hint: {}", hint);
            }
            ExitCode::from(bridge_error.map_or(EXIT_INVALID_CONFIG, |e| e.exit_code()))
        }
    }
}

async fn run(command: Commands, global: &GlobalArgs) -> Result<u8> {
    match command {
        Commands::Run(args) => commands::run(args, global).await,
        Commands::Enable => commands::enable(global).await,
        Commands::Disable => commands::disable(global).await,
        Commands::Toggle => commands::toggle(global).await,
        Commands::Status(args) => commands::status(args, global).await,
        Commands::SetResolution(args) => commands::set_resolution(args, global).await,
        Commands::Config(args) => commands::config(args, global),
        Commands::Info => commands::info(global).await,
        Commands::Unit => commands::unit(global),
    }
}
