//! IPC for daemon mode
//!
//! The daemon serves the bridge's control surface on a Unix socket. CLI
//! commands such as `enable`, `disable` and `status` are thin clients.

mod client;
mod protocol;
mod server;

pub use client::IpcClient;
pub use protocol::{IpcMessage, IpcResponse};
pub use server::IpcServer;

use std::path::{Path, PathBuf};

/// Environment variable overriding the socket path
pub const SOCKET_ENV: &str = "CAMERABRIDGE_SOCKET";

/// Get the IPC socket path
///
/// `$CAMERABRIDGE_SOCKET` wins, then a configured path, then
/// `$XDG_RUNTIME_DIR/camerabridge.sock`, then a per-user file in /tmp.
pub fn resolve_socket_path(configured: Option<&Path>) -> PathBuf {
    if let Some(path) = std::env::var_os(SOCKET_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    if let Some(path) = configured {
        return path.to_path_buf();
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("camerabridge.sock")
    } else {
        // SAFETY: getuid() has no preconditions and cannot fail.
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/camerabridge-{}.sock", uid))
    }
}

/// Check if a daemon answers on the socket
pub async fn daemon_running(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }

    match IpcClient::connect_to(path).await {
        Ok(mut client) => matches!(client.ping().await, Ok(true)),
        Err(_) => false,
    }
}
