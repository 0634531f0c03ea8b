//! CLI command implementations

mod config;
mod control;
mod info;
mod run;
mod status;
mod unit;

pub use config::{ConfigArgs, config};
pub use control::{ResolutionArgs, disable, enable, set_resolution, toggle};
pub use info::info;
pub use run::{RunArgs, run};
pub use status::{StatusArgs, status};
pub use unit::unit;

use anyhow::{Context, Result};
use camerabridge_core::ServiceConfig;
use camerabridge_core::config::default_path;
use camerabridge_core::ipc::{IpcClient, resolve_socket_path};
use std::path::PathBuf;
use tracing::warn;

/// Options shared by all commands
pub struct GlobalArgs {
    pub config: Option<PathBuf>,
    pub socket: Option<PathBuf>,
}

impl GlobalArgs {
    /// Configuration file in use
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_path)
    }

    /// Load and validate the configuration
    pub fn load_config(&self) -> Result<ServiceConfig> {
        let path = self.config_path();
        ServiceConfig::load_from(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    }

    /// Control socket of the daemon
    pub fn socket_path(&self) -> PathBuf {
        if let Some(socket) = &self.socket {
            return socket.clone();
        }
        match self.load_config() {
            Ok(config) => resolve_socket_path(config.ipc.socket.as_deref()),
            Err(e) => {
                warn!("{:#}; using the default socket", e);
                resolve_socket_path(None)
            }
        }
    }

    /// Connect to the running daemon
    pub async fn connect(&self) -> Result<IpcClient> {
        let path = self.socket_path();
        IpcClient::connect_to(&path)
            .await
            .with_context(|| format!("Cannot reach the daemon at {}", path.display()))
    }
}
