//! Configuration file loading and saving
//!
//! Loads the service configuration from `~/.config/camerabridge/config.toml`

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::ServiceConfig;
use crate::error::{BridgeError, Result};

/// Get the default config file path
pub fn default_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        config_dir.join("camerabridge").join("config.toml")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home)
            .join(".config")
            .join("camerabridge")
            .join("config.toml")
    } else {
        PathBuf::from("/etc/camerabridge/config.toml")
    }
}

impl ServiceConfig {
    /// Load configuration from a specific path
    ///
    /// A missing file yields the defaults. The loaded config is validated.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::config(format!("Failed to read config file: {}", e)))?;

        let config: ServiceConfig = toml::from_str(&content)
            .map_err(|e| BridgeError::config(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;
        for warning in config.warnings() {
            warn!("{}", warning);
        }

        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| BridgeError::config(format!("Failed to serialize config: {}", e)))
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BridgeError::config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = self.to_toml()?;
        std::fs::write(path, content)
            .map_err(|e| BridgeError::config(format!("Failed to write config file: {}", e)))?;

        info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn sample_config() -> String {
    r#"# camerabridge configuration

# Enable the bridge as soon as the daemon starts
autostart = true

[device]
# The virtual camera appears as /dev/video<index>.
# Pick an index no physical camera uses (see `camerabridge info`).
index = 99
# Name shown by applications (at most 31 bytes)
label = "Integrated Camera"
# Only advertise capture caps while frames are flowing.
# Required for Chromium-based browsers to list the device.
exclusive = true

[pipeline.source_params]
# Properties passed to the vendor source element
buffer-count = "7"

[pipeline.input]
# Format requested from the vendor camera HAL
encoding = "NV12"
width = 1280
height = 720

[pipeline.output]
# Format written to the virtual camera: YUY2, UYVY, I420 or NV12
# Supported resolutions: 640x360, 640x480, 1280x720, 1920x1080
encoding = "YUY2"
width = 1280
height = 720
framerate = 30

[tools]
loopback_ctl = "v4l2loopback-ctl"
gst_launch = "gst-launch-1.0"
source_element = "icamerasrc"

[restart]
# Give up after this many consecutive failures
max_failures = 5
# Restart delay doubles from initial_backoff_ms up to max_backoff_secs
initial_backoff_ms = 500
max_backoff_secs = 30
# Running this long without failures clears the failure counter
reset_window_secs = 60
# A starting pipeline without errors counts as running after this long
grace_period_ms = 3000
# No frames for this long counts as a stall
stall_timeout_ms = 5000
# Graceful shutdown budget before the pipeline is killed
stop_timeout_ms = 3000

[session]
# Publish the camera to the desktop portal permission store
enabled = true
# Applications granted camera access
grant_apps = ["org.mozilla.firefox"]
attempts = 3
retry_delay_ms = 250

[ipc]
# socket = "/run/user/1000/camerabridge.sock"
socket_mode = 384
"#
    .to_string()
}
