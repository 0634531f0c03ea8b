//! IPC protocol definitions
//!
//! Newline-delimited JSON messages between the daemon and the CLI.

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::service::BridgeStatus;

/// Messages that can be sent to the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IpcMessage {
    /// Check if daemon is alive
    Ping,
    /// Request current status
    Status,
    /// Start the bridge
    Enable,
    /// Stop the bridge
    Disable,
    /// Restart the pipeline at another resolution
    SetResolution { width: u32, height: u32 },
    /// Stop the daemon gracefully
    Shutdown,
}

/// Responses from the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IpcResponse {
    /// Pong response to ping
    Pong,
    /// Error response carrying the process exit code for the failure
    Error { code: u8, message: String },
    /// Status after handling the request
    Status(BridgeStatus),
    /// Shutdown acknowledgment
    Stopping,
}

impl IpcMessage {
    /// Serialize message to JSON bytes with newline terminator
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = serde_json::to_vec(self).unwrap_or_default();
        bytes.push(b'\n');
        bytes
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl IpcResponse {
    /// Serialize response to JSON bytes with newline terminator
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = serde_json::to_vec(self).unwrap_or_default();
        bytes.push(b'\n');
        bytes
    }

    /// Deserialize response from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Create an error response
    pub fn error(code: u8, message: impl Into<String>) -> Self {
        IpcResponse::Error {
            code,
            message: message.into(),
        }
    }
}

impl From<&BridgeError> for IpcResponse {
    fn from(err: &BridgeError) -> Self {
        IpcResponse::error(err.exit_code(), err.to_string())
    }
}
