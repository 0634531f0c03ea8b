//! Configuration types for camerabridge
//!
//! A [`ServiceConfig`] is immutable once a service instance starts. Changing
//! it goes through a full stop/reconfigure/start cycle.

mod file;

pub use file::{default_path, sample_config};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::types::{
    PipelineSpec, SUPPORTED_RESOLUTIONS, VirtualDeviceSpec, is_supported_resolution,
};

/// Longest card label v4l2 can report (32 bytes including the terminator)
pub const MAX_LABEL_LEN: usize = 31;

/// Highest framerate accepted for the virtual device
pub const MAX_FRAMERATE: u32 = 60;

/// Longest accepted restart delay or reset window, in seconds
pub const MAX_RESTART_WINDOW_SECS: u64 = 86_400;

/// Longest accepted grace, stall or stop timeout, in milliseconds
pub const MAX_TIMEOUT_MS: u64 = 600_000;

/// Full service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    /// Enable the bridge as soon as the daemon starts
    #[serde(default)]
    pub autostart: bool,

    /// Virtual capture endpoint
    #[serde(default)]
    pub device: VirtualDeviceSpec,

    /// Capture pipeline
    #[serde(default)]
    pub pipeline: PipelineSpec,

    /// External programs used by the bridge
    #[serde(default)]
    pub tools: ToolSettings,

    /// Pipeline restart policy
    #[serde(default)]
    pub restart: RestartPolicy,

    /// Session portal integration
    #[serde(default)]
    pub session: SessionSettings,

    /// Control socket
    #[serde(default)]
    pub ipc: IpcSettings,
}

/// External programs used to manage the device and run the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSettings {
    /// v4l2loopback control utility
    #[serde(default = "default_loopback_ctl")]
    pub loopback_ctl: String,

    /// GStreamer launcher
    #[serde(default = "default_gst_launch")]
    pub gst_launch: String,

    /// Vendor camera source element
    #[serde(default = "default_source_element")]
    pub source_element: String,
}

fn default_loopback_ctl() -> String {
    "v4l2loopback-ctl".to_string()
}

fn default_gst_launch() -> String {
    "gst-launch-1.0".to_string()
}

fn default_source_element() -> String {
    "icamerasrc".to_string()
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            loopback_ctl: default_loopback_ctl(),
            gst_launch: default_gst_launch(),
            source_element: default_source_element(),
        }
    }
}

/// Restart and health-check policy for the pipeline controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Consecutive failures within the reset window before giving up
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Delay before the first restart in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound for the restart delay in seconds
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Sustained running time that clears the failure counter, in seconds
    #[serde(default = "default_reset_window_secs")]
    pub reset_window_secs: u64,

    /// Time without reported errors after which a starting pipeline counts as running
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Time without frames after which the pipeline counts as stalled
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    /// Time allowed for graceful termination before the child is killed
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_max_failures() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_secs() -> u64 {
    30
}

fn default_reset_window_secs() -> u64 {
    60
}

fn default_grace_period_ms() -> u64 {
    3000
}

fn default_stall_timeout_ms() -> u64 {
    5000
}

fn default_stop_timeout_ms() -> u64 {
    3000
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            reset_window_secs: default_reset_window_secs(),
            grace_period_ms: default_grace_period_ms(),
            stall_timeout_ms: default_stall_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl RestartPolicy {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn reset_window(&self) -> Duration {
        Duration::from_secs(self.reset_window_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Delay before the restart that follows the given failure count
    ///
    /// Doubles from `initial_backoff` for every failure after the first and
    /// never exceeds `max_backoff`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.initial_backoff()
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_backoff())
    }
}

/// Session portal integration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Publish the endpoint to the session permission store
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Applications granted camera access when the endpoint is published
    #[serde(default = "default_grant_apps")]
    pub grant_apps: Vec<String>,

    /// Attempts per broker call
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_grant_apps() -> Vec<String> {
    vec!["org.mozilla.firefox".to_string()]
}

fn default_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    250
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            grant_apps: default_grant_apps(),
            attempts: default_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl SessionSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Control socket settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcSettings {
    /// Socket path override
    #[serde(default)]
    pub socket: Option<PathBuf>,

    /// Socket file permissions
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,
}

fn default_socket_mode() -> u32 {
    0o600
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            socket: None,
            socket_mode: default_socket_mode(),
        }
    }
}

impl ServiceConfig {
    /// Create a config for a device and pipeline with default policies
    pub fn new(device: VirtualDeviceSpec, pipeline: PipelineSpec) -> Self {
        Self {
            device,
            pipeline,
            ..Self::default()
        }
    }

    /// Set the restart policy
    pub fn with_restart_policy(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Set the session settings
    pub fn with_session(mut self, session: SessionSettings) -> Self {
        self.session = session;
        self
    }

    /// Copy of this config running at a different resolution
    pub fn with_resolution(&self, width: u32, height: u32) -> Result<Self> {
        let config = Self {
            pipeline: self.pipeline.with_resolution(width, height),
            ..self.clone()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate and return an error if the configuration cannot work
    pub fn validate(&self) -> Result<()> {
        let label = &self.device.label;
        if label.trim().is_empty() {
            return Err(BridgeError::config("Device label cannot be empty"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(BridgeError::config(format!(
                "Device label '{}' is longer than {} bytes",
                label, MAX_LABEL_LEN
            )));
        }

        let input = &self.pipeline.input;
        if !is_supported_resolution(input.width, input.height) {
            return Err(BridgeError::config(format!(
                "Input resolution {}x{} is not supported (supported: {})",
                input.width,
                input.height,
                supported_list()
            )));
        }

        let output = &self.pipeline.output;
        if !is_supported_resolution(output.width, output.height) {
            return Err(BridgeError::config(format!(
                "Output resolution {}x{} is not supported (supported: {})",
                output.width,
                output.height,
                supported_list()
            )));
        }
        if !output.encoding.loopback_compatible() {
            return Err(BridgeError::config(format!(
                "Output encoding {} is not accepted by the virtual device",
                output.encoding
            )));
        }
        if output.framerate == 0 || output.framerate > MAX_FRAMERATE {
            return Err(BridgeError::config(format!(
                "Framerate {} is outside 1..={}",
                output.framerate, MAX_FRAMERATE
            )));
        }

        for (key, value) in &self.pipeline.source_params {
            if key.is_empty() || key.contains(char::is_whitespace) || key.contains('!') {
                return Err(BridgeError::config(format!("Invalid source parameter name '{}'", key)));
            }
            if value.is_empty() || value.contains(char::is_whitespace) || value.contains('!') {
                return Err(BridgeError::config(format!(
                    "Invalid value '{}' for source parameter '{}'",
                    value, key
                )));
            }
        }

        if self.tools.source_element.trim().is_empty() {
            return Err(BridgeError::config("Source element cannot be empty"));
        }

        let restart = &self.restart;
        if restart.max_failures == 0 {
            return Err(BridgeError::config("restart.max_failures must be at least 1"));
        }
        let timeouts = [
            ("grace_period_ms", restart.grace_period_ms),
            ("stall_timeout_ms", restart.stall_timeout_ms),
            ("stop_timeout_ms", restart.stop_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 || value > MAX_TIMEOUT_MS {
                return Err(BridgeError::config(format!(
                    "restart.{} must be within 1..={}",
                    name, MAX_TIMEOUT_MS
                )));
            }
        }
        let windows = [
            ("max_backoff_secs", restart.max_backoff_secs),
            ("reset_window_secs", restart.reset_window_secs),
        ];
        for (name, value) in windows {
            if value > MAX_RESTART_WINDOW_SECS {
                return Err(BridgeError::config(format!(
                    "restart.{} must not exceed {}",
                    name, MAX_RESTART_WINDOW_SECS
                )));
            }
        }
        if restart.initial_backoff_ms > MAX_RESTART_WINDOW_SECS * 1000 {
            return Err(BridgeError::config(format!(
                "restart.initial_backoff_ms must not exceed {}",
                MAX_RESTART_WINDOW_SECS * 1000
            )));
        }

        if self.session.attempts == 0 {
            return Err(BridgeError::config("session.attempts must be at least 1"));
        }

        Ok(())
    }

    /// Return warnings for settings that are valid but likely unintended
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let input = &self.pipeline.input;
        let output = &self.pipeline.output;

        if (input.width, input.height) != (output.width, output.height) {
            warnings.push(format!(
                "Input {}x{} differs from output {}x{}; frames will be scaled in software.",
                input.width, input.height, output.width, output.height
            ));
        }

        if !self.device.exclusive {
            warnings.push(
                "Non-exclusive devices are not listed as cameras by Chromium-based browsers."
                    .to_string(),
            );
        }

        if self.restart.grace_period_ms >= self.restart.stall_timeout_ms {
            warnings.push(format!(
                "Grace period ({} ms) is not shorter than the stall timeout ({} ms); silent pipelines will be restarted before they count as running.",
                self.restart.grace_period_ms, self.restart.stall_timeout_ms
            ));
        }

        if self.session.enabled && self.session.grant_apps.is_empty() {
            warnings.push("Session publishing is enabled but no applications are granted access.".to_string());
        }

        warnings
    }
}

fn supported_list() -> String {
    SUPPORTED_RESOLUTIONS
        .iter()
        .map(|(w, h)| format!("{}x{}", w, h))
        .collect::<Vec<_>>()
        .join(", ")
}
