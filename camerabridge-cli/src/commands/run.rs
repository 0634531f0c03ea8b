//! Run command - host the bridge and serve the control socket

use anyhow::{Context, Result};
use camerabridge_core::error::{EXIT_FACILITY_UNAVAILABLE, EXIT_OK};
use camerabridge_core::ipc::{IpcServer, resolve_socket_path};
use camerabridge_core::{BridgeError, BridgeService, PipelineState};
use clap::Args;
use std::sync::Arc;
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tracing::{error, info, warn};

use super::GlobalArgs;

/// Arguments for the run command
#[derive(Args)]
pub struct RunArgs {
    /// Enable the bridge immediately (also set by `autostart` in the config)
    #[arg(long)]
    pub enable: bool,
}

/// Run the daemon until interrupted or asked to shut down
pub async fn run(args: RunArgs, global: &GlobalArgs) -> Result<u8> {
    let config = global.load_config()?;
    for warning in config.warnings() {
        warn!("{}", warning);
    }

    let socket = global
        .socket
        .clone()
        .unwrap_or_else(|| resolve_socket_path(config.ipc.socket.as_deref()));
    let socket_mode = config.ipc.socket_mode;
    let enable_now = args.enable || config.autostart;

    let service = Arc::new(BridgeService::system(config).context("Failed to create bridge")?);

    let mut server = IpcServer::new(service.clone(), socket, socket_mode);
    server.start().await.context("Failed to start control socket")?;

    spawn_state_logger(&service);

    if enable_now {
        match service.enable().await {
            Ok(status) => info!("Bridge enabled ({})", status.state),
            Err(e) if matches!(e.root(), BridgeError::DeviceCreateFailed(_)) => {
                error!("{}", e);
                server.cleanup();
                return Err(e).context("Virtual device facility unavailable");
            }
            Err(e) => warn!("Could not enable bridge: {}", e),
        }
    }

    println!(
        "camerabridge running, control socket at {}",
        server.socket_path().display()
    );

    let mut sigterm =
        unix_signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;

    let code = tokio::select! {
        result = server.serve() => match result {
            Ok(()) => {
                info!("Shutdown requested over IPC");
                EXIT_OK
            }
            Err(e) => {
                error!("Control socket failed: {}", e);
                EXIT_FACILITY_UNAVAILABLE
            }
        },
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Received interrupt signal");
            EXIT_OK
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
            EXIT_OK
        }
    };

    println!("Shutting down...");
    if let Err(e) = service.shutdown().await {
        warn!("Shutdown incomplete: {}", e);
    }
    server.cleanup();

    Ok(code)
}

/// Log every controller state change
fn spawn_state_logger(service: &BridgeService) {
    let mut status = service.subscribe();
    tokio::spawn(async move {
        let mut last = status.borrow().state;
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            if current.state == last {
                continue;
            }
            match current.state {
                PipelineState::FailedPermanently => error!(
                    "Pipeline failed permanently: {}",
                    current.last_error.as_deref().unwrap_or("unknown error")
                ),
                PipelineState::Degraded => warn!(
                    "Pipeline degraded: {}",
                    current.last_error.as_deref().unwrap_or("unknown error")
                ),
                state => info!("Pipeline {}", state),
            }
            last = current.state;
        }
    });
}
