//! IPC server for daemon mode
//!
//! Listens on a Unix socket and relays control requests to the bridge.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::protocol::{IpcMessage, IpcResponse};
use crate::error::{BridgeError, EXIT_INVALID_CONFIG, Result};
use crate::service::BridgeService;

/// IPC server that handles client connections
pub struct IpcServer {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// Socket file permissions
    socket_mode: u32,
    /// Listener for incoming connections
    listener: Option<UnixListener>,
    /// Bridge being controlled
    service: Arc<BridgeService>,
    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(service: Arc<BridgeService>, socket_path: impl Into<PathBuf>, socket_mode: u32) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            socket_path: socket_path.into(),
            socket_mode,
            listener: None,
            service,
            shutdown_tx,
        }
    }

    /// Socket path
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Start listening for connections
    pub async fn start(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            if super::daemon_running(&self.socket_path).await {
                return Err(BridgeError::ipc(format!(
                    "Another daemon is already listening on {:?}",
                    self.socket_path
                )));
            }
            std::fs::remove_file(&self.socket_path)
                .map_err(|e| BridgeError::ipc(format!("Failed to remove stale socket: {}", e)))?;
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BridgeError::ipc(format!("Failed to create socket directory: {}", e))
                })?;
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            BridgeError::ipc(format!(
                "Failed to bind socket at {:?}: {}",
                self.socket_path, e
            ))
        })?;

        let permissions = std::fs::Permissions::from_mode(self.socket_mode);
        std::fs::set_permissions(&self.socket_path, permissions)
            .map_err(|e| BridgeError::ipc(format!("Failed to set socket permissions: {}", e)))?;

        info!("IPC server listening on {:?}", self.socket_path);
        self.listener = Some(listener);
        Ok(())
    }

    /// Get a receiver for shutdown requests
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Accept one connection and serve it in the background
    pub async fn accept_one(&self) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| BridgeError::ipc("Server not started"))?;

        let stream = match listener.accept().await {
            Ok((stream, _addr)) => stream,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                return Ok(());
            }
        };

        debug!("IPC client connected");
        let service = self.service.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(handle_connection(stream, service, shutdown_tx));
        Ok(())
    }

    /// Accept connections until a shutdown is requested
    pub async fn serve(&self) -> Result<()> {
        let mut shutdown = self.shutdown_receiver();
        loop {
            tokio::select! {
                result = self.accept_one() => result?,
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }

    /// Clean up the socket file
    pub fn cleanup(&self) {
        if self.listener.is_none() || !self.socket_path.exists() {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            warn!("Failed to remove socket file: {}", e);
        } else {
            debug!("Removed socket file {:?}", self.socket_path);
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

async fn handle_connection(
    stream: UnixStream,
    service: Arc<BridgeService>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("IPC client disconnected");
                return;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let (response, should_stop) = match IpcMessage::from_bytes(trimmed.as_bytes()) {
                    Ok(msg) => handle_message(&service, msg).await,
                    Err(e) => {
                        warn!("Invalid IPC message: {}", e);
                        (
                            IpcResponse::error(EXIT_INVALID_CONFIG, format!("Invalid message: {}", e)),
                            false,
                        )
                    }
                };

                if let Err(e) = writer.write_all(&response.to_bytes()).await {
                    error!("Failed to send IPC response: {}", e);
                    return;
                }

                if should_stop {
                    let _ = shutdown_tx.send(());
                    return;
                }
            }
            Err(e) => {
                error!("Error reading from IPC client: {}", e);
                return;
            }
        }
    }
}

/// Handle an IPC message
///
/// Returns (response, should_stop)
async fn handle_message(service: &BridgeService, msg: IpcMessage) -> (IpcResponse, bool) {
    debug!("IPC request: {:?}", msg);
    let result = match msg {
        IpcMessage::Ping => return (IpcResponse::Pong, false),
        IpcMessage::Status => Ok(service.status()),
        IpcMessage::Enable => service.enable().await,
        IpcMessage::Disable => service.disable().await,
        IpcMessage::SetResolution { width, height } => service.set_resolution(width, height).await,
        IpcMessage::Shutdown => {
            info!("Received shutdown request via IPC");
            return (IpcResponse::Stopping, true);
        }
    };

    match result {
        Ok(status) => (IpcResponse::Status(status), false),
        Err(e) => {
            warn!("IPC request failed: {}", e);
            (IpcResponse::from(&e), false)
        }
    }
}
