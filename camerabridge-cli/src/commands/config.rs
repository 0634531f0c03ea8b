//! Config command - manage configuration files

use anyhow::{Context, Result};
use camerabridge_core::config::sample_config;
use clap::{Args, Subcommand};

use super::GlobalArgs;

/// Arguments for the config command
#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the path to the config file
    Path,

    /// Show the effective configuration
    Show,

    /// Generate a default config file
    Init {
        /// Force overwrite if file exists
        #[arg(short, long)]
        force: bool,
    },

    /// Print a sample configuration to stdout
    Sample,
}

/// Run config subcommand
pub fn config(args: ConfigArgs, global: &GlobalArgs) -> Result<u8> {
    let path = global.config_path();

    match args.command {
        ConfigCommand::Path => {
            println!("{}", path.display());
            if path.exists() {
                println!("(file exists)");
            } else {
                println!("(file does not exist)");
            }
        }
        ConfigCommand::Show => {
            let config = global.load_config()?;
            if path.exists() {
                println!("# Configuration file: {}\n", path.display());
            } else {
                println!("# No configuration file at {}; showing defaults\n", path.display());
            }
            print!("{}", config.to_toml()?);

            let warnings = config.warnings();
            if !warnings.is_empty() {
                println!();
                for warning in warnings {
                    println!("# warning: {}", warning);
                }
            }
        }
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                println!("Configuration file already exists: {}", path.display());
                println!();
                println!("Use --force to overwrite, or edit the existing file.");
                return Ok(0);
            }

            if let Some(parent) = path.parent() {
                if !parent.exists() {
                    std::fs::create_dir_all(parent).context("Failed to create config directory")?;
                }
            }

            std::fs::write(&path, sample_config()).context("Failed to write config file")?;

            println!("Created configuration file: {}", path.display());
            println!();
            println!("Edit this file to customize the virtual camera.");
        }
        ConfigCommand::Sample => {
            print!("{}", sample_config());
        }
    }

    Ok(0)
}
