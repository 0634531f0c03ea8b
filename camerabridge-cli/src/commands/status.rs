//! Status command - show the state of the bridge

use anyhow::{Context, Result};
use camerabridge_core::BridgeStatus;
use clap::Args;
use std::time::Duration;

/// Arguments for the status command
#[derive(Args)]
pub struct StatusArgs {
    /// Print status as JSON
    #[arg(long)]
    pub json: bool,
}

/// Show status of the running bridge
///
/// Exits with code 3 when the pipeline failed permanently.
pub async fn status(args: StatusArgs, global: &super::GlobalArgs) -> Result<u8> {
    let mut client = global.connect().await?;
    let status = client.status().await.context("Failed to query status")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }

    Ok(status.exit_code())
}

/// Print a status report
pub fn print_status(status: &BridgeStatus) {
    println!("camerabridge - Status\n");
    println!("  State:       {}", status.state);
    println!(
        "  Device:      /dev/video{} \"{}\"{}",
        status.device_index,
        status.device_label,
        if status.node.is_some() { "" } else { " (not created)" }
    );
    println!(
        "  Output:      {} {}x{} @ {} fps",
        status.encoding, status.width, status.height, status.framerate
    );
    if let Some(pid) = status.pid {
        println!("  Pipeline:    pid {}", pid);
    }
    println!(
        "  Restarts:    {} launch(es), {} consecutive failure(s)",
        status.launches, status.failures
    );
    println!(
        "  Published:   {}",
        if status.published { "yes" } else { "no" }
    );
    println!("  Uptime:      {}", format_uptime(status.uptime_secs));
    if let Some(error) = &status.last_error {
        println!("  Last error:  {}", error);
    }
}

fn format_uptime(secs: u64) -> String {
    humantime::format_duration(Duration::from_secs(secs)).to_string()
}
