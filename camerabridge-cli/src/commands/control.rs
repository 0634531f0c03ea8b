//! Control commands - enable, disable, toggle and resolution changes
//!
//! Thin clients of the daemon's control surface; the daemon's state is
//! authoritative.

use anyhow::{Context, Result};
use camerabridge_core::PipelineState;
use clap::Args;

use super::GlobalArgs;
use super::status::print_status;

/// Arguments for the set-resolution command
#[derive(Args)]
pub struct ResolutionArgs {
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
}

/// Start the bridge
pub async fn enable(global: &GlobalArgs) -> Result<u8> {
    let mut client = global.connect().await?;
    let status = client.enable().await.context("Failed to enable the bridge")?;
    print_status(&status);
    Ok(status.exit_code())
}

/// Stop the bridge
pub async fn disable(global: &GlobalArgs) -> Result<u8> {
    let mut client = global.connect().await?;
    let status = client.disable().await.context("Failed to disable the bridge")?;
    print_status(&status);
    Ok(status.exit_code())
}

/// Flip the bridge between enabled and disabled
pub async fn toggle(global: &GlobalArgs) -> Result<u8> {
    let mut client = global.connect().await?;
    let current = client.status().await.context("Failed to query status")?;

    let status = if current.state.is_active() {
        client.disable().await.context("Failed to disable the bridge")?
    } else {
        client.enable().await.context("Failed to enable the bridge")?
    };

    match status.state {
        PipelineState::Stopped => println!("Camera bridge off"),
        state => println!("Camera bridge on ({})", state),
    }
    Ok(status.exit_code())
}

/// Restart the pipeline at another resolution
pub async fn set_resolution(args: ResolutionArgs, global: &GlobalArgs) -> Result<u8> {
    let mut client = global.connect().await?;
    let status = client
        .set_resolution(args.width, args.height)
        .await
        .with_context(|| format!("Failed to switch to {}x{}", args.width, args.height))?;
    print_status(&status);
    Ok(status.exit_code())
}
