//! Error types for camerabridge

use std::time::Duration;
use thiserror::Error;

/// Result type alias using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Exit code: success
pub const EXIT_OK: u8 = 0;
/// Exit code: invalid configuration
pub const EXIT_INVALID_CONFIG: u8 = 1;
/// Exit code: underlying facility unavailable
pub const EXIT_FACILITY_UNAVAILABLE: u8 = 2;
/// Exit code: pipeline failed permanently after exhausting restarts
pub const EXIT_FAILED_PERMANENTLY: u8 = 3;

/// Main error type for camerabridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Bad resolution, format or other setting; rejected before start
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The virtual device facility is missing or refused to create the device
    #[error("Failed to create virtual device: {0}")]
    DeviceCreateFailed(String),

    /// A producer is attached to the virtual device
    #[error("Virtual device /dev/video{0} is busy")]
    DeviceBusy(u32),

    /// Handle does not refer to a device managed by this service
    #[error("Virtual device /dev/video{0} is not managed by this service")]
    UnknownDevice(u32),

    /// The pipeline process exited or failed to launch
    #[error("Pipeline crashed: {0}")]
    PipelineCrash(String),

    /// No frames were observed within the stall timeout
    #[error("Pipeline stalled: no frames for {0:?}")]
    PipelineStalled(Duration),

    /// Session message bus or permission store could not be reached
    #[error("Session broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Restart budget exhausted
    #[error("Pipeline failed permanently after {failures} consecutive failures")]
    PermanentFailure { failures: u32 },

    /// A pipeline is already attached to the controller
    #[error("Pipeline already running")]
    AlreadyRunning,

    /// The bridge daemon is not running
    #[error("camerabridge daemon is not running")]
    NotRunning,

    /// IPC transport error
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Error reported by the daemon over IPC
    #[error("{message}")]
    Remote { code: u8, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<BridgeError>,
    },
}

impl BridgeError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a device creation error
    pub fn device_create(msg: impl Into<String>) -> Self {
        Self::DeviceCreateFailed(msg.into())
    }

    /// Create a pipeline crash error
    pub fn crash(msg: impl Into<String>) -> Self {
        Self::PipelineCrash(msg.into())
    }

    /// Create a broker error
    pub fn broker(msg: impl Into<String>) -> Self {
        Self::BrokerUnavailable(msg.into())
    }

    /// Create an IPC error
    pub fn ipc(msg: impl Into<String>) -> Self {
        Self::Ipc(msg.into())
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context wrappers
    pub fn root(&self) -> &BridgeError {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self.root() {
            Self::Configuration(_) => EXIT_INVALID_CONFIG,
            Self::DeviceCreateFailed(_) | Self::NotRunning | Self::Ipc(_) => {
                EXIT_FACILITY_UNAVAILABLE
            }
            Self::PermanentFailure { .. } => EXIT_FAILED_PERMANENTLY,
            Self::Remote { code, .. } => *code,
            _ => EXIT_INVALID_CONFIG,
        }
    }

    /// Whether the operation may succeed if simply tried again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::DeviceBusy(_)
                | Self::PipelineCrash(_)
                | Self::PipelineStalled(_)
                | Self::BrokerUnavailable(_)
        )
    }

    /// A short hint for the user on how to resolve the error
    pub fn user_hint(&self) -> Option<&'static str> {
        match self.root() {
            Self::Configuration(_) => {
                Some("Check ~/.config/camerabridge/config.toml (see `camerabridge config sample`)")
            }
            Self::DeviceCreateFailed(_) => {
                Some("Make sure the v4l2loopback module is installed and loaded (modprobe v4l2loopback)")
            }
            Self::DeviceBusy(_) => Some("Close applications using the virtual camera and retry"),
            Self::BrokerUnavailable(_) => {
                Some("Make sure xdg-desktop-portal is running in your session")
            }
            Self::PermanentFailure { .. } => {
                Some("Inspect the service log, then run `camerabridge enable` to retry")
            }
            Self::NotRunning => Some("Start the service with `camerabridge run` or systemctl --user start camerabridge"),
            _ => None,
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

// Conversions from external error types

impl From<ashpd::Error> for BridgeError {
    fn from(err: ashpd::Error) -> Self {
        Self::BrokerUnavailable(err.to_string())
    }
}

impl From<zbus::Error> for BridgeError {
    fn from(err: zbus::Error) -> Self {
        Self::BrokerUnavailable(format!("D-Bus error: {}", err))
    }
}
