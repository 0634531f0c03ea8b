//! IPC client for CLI commands
//!
//! Connects to the running daemon to send commands and receive responses.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use super::protocol::{IpcMessage, IpcResponse};
use crate::error::{BridgeError, Result};
use crate::service::BridgeStatus;

/// Default connection timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default read/write timeout
///
/// Disabling waits for the pipeline to terminate, which can take twice the
/// stop timeout.
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// IPC client for communicating with the daemon
pub struct IpcClient {
    stream: UnixStream,
}

impl IpcClient {
    /// Connect to the daemon at a specific socket path
    pub async fn connect_to(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BridgeError::NotRunning);
        }

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(path))
            .await
            .map_err(|_| BridgeError::ipc("Connection timed out"))?
            .map_err(|e| match e.kind() {
                ErrorKind::ConnectionRefused | ErrorKind::NotFound => BridgeError::NotRunning,
                _ => BridgeError::ipc(format!("Failed to connect to daemon: {}", e)),
            })?;

        debug!("Connected to daemon at {:?}", path);
        Ok(Self { stream })
    }

    /// Send a message and receive a response with timeout
    async fn send(&mut self, msg: IpcMessage) -> Result<IpcResponse> {
        let (reader, mut writer) = self.stream.split();

        tokio::time::timeout(IO_TIMEOUT, writer.write_all(&msg.to_bytes()))
            .await
            .map_err(|_| BridgeError::ipc("Write timed out"))?
            .map_err(|e| BridgeError::ipc(format!("Failed to send message: {}", e)))?;

        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let read = tokio::time::timeout(IO_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| BridgeError::ipc("Read timed out"))?
            .map_err(|e| BridgeError::ipc(format!("Failed to read response: {}", e)))?;
        if read == 0 {
            return Err(BridgeError::ipc("Daemon closed the connection"));
        }

        let response = IpcResponse::from_bytes(line.trim().as_bytes())
            .map_err(|e| BridgeError::ipc(format!("Invalid response: {}", e)))?;

        match response {
            IpcResponse::Error { code, message } => Err(BridgeError::Remote { code, message }),
            other => Ok(other),
        }
    }

    async fn send_for_status(&mut self, msg: IpcMessage) -> Result<BridgeStatus> {
        match self.send(msg).await? {
            IpcResponse::Status(status) => Ok(status),
            other => Err(BridgeError::ipc(format!("Unexpected response: {:?}", other))),
        }
    }

    /// Ping the daemon to check if it's alive
    pub async fn ping(&mut self) -> Result<bool> {
        match self.send(IpcMessage::Ping).await {
            Ok(IpcResponse::Pong) => Ok(true),
            Ok(_) => Ok(false),
            Err(_) => Ok(false),
        }
    }

    /// Get the current status
    pub async fn status(&mut self) -> Result<BridgeStatus> {
        self.send_for_status(IpcMessage::Status).await
    }

    /// Start the bridge
    pub async fn enable(&mut self) -> Result<BridgeStatus> {
        self.send_for_status(IpcMessage::Enable).await
    }

    /// Stop the bridge
    pub async fn disable(&mut self) -> Result<BridgeStatus> {
        self.send_for_status(IpcMessage::Disable).await
    }

    /// Switch to another resolution
    pub async fn set_resolution(&mut self, width: u32, height: u32) -> Result<BridgeStatus> {
        self.send_for_status(IpcMessage::SetResolution { width, height })
            .await
    }

    /// Request the daemon to shut down
    pub async fn shutdown(&mut self) -> Result<()> {
        match self.send(IpcMessage::Shutdown).await? {
            IpcResponse::Stopping => Ok(()),
            other => Err(BridgeError::ipc(format!("Unexpected response: {:?}", other))),
        }
    }
}
