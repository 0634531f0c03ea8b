//! Core types for camerabridge
//!
//! These types describe the virtual endpoint, the capture pipeline and the
//! permission entries shared between the bridge components.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Global handle counter for unique device handles
static HANDLE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Resolutions supported by the vendor camera HAL
pub const SUPPORTED_RESOLUTIONS: &[(u32, u32)] =
    &[(640, 360), (640, 480), (1280, 720), (1920, 1080)];

/// Check whether a width/height pair is on the HAL allow-list
pub fn is_supported_resolution(width: u32, height: u32) -> bool {
    SUPPORTED_RESOLUTIONS.contains(&(width, height))
}

/// Opaque handle for a virtual device owned by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle(u64);

impl Handle {
    /// Create a new unique handle
    pub fn new() -> Self {
        Self(HANDLE_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({})", self.0)
    }
}

/// Identity of the virtual capture endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VirtualDeviceSpec {
    /// Device number, the endpoint appears as /dev/video{index}
    pub index: u32,
    /// Human-readable card label shown by applications
    pub label: String,
    /// Only advertise capture caps once a producer is attached
    #[serde(default = "default_true")]
    pub exclusive: bool,
}

fn default_true() -> bool {
    true
}

impl VirtualDeviceSpec {
    /// Create a new device spec
    pub fn new(index: u32, label: impl Into<String>, exclusive: bool) -> Self {
        Self {
            index,
            label: label.into(),
            exclusive,
        }
    }

    /// Device node path for this index
    pub fn node(&self) -> PathBuf {
        PathBuf::from(format!("/dev/video{}", self.index))
    }
}

impl Default for VirtualDeviceSpec {
    fn default() -> Self {
        Self::new(99, "Integrated Camera", true)
    }
}

impl std::fmt::Display for VirtualDeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "/dev/video{} \"{}\"{}",
            self.index,
            self.label,
            if self.exclusive { " (exclusive)" } else { "" }
        )
    }
}

/// Handle to a virtual device created or adopted by the device manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Unique handle id
    pub id: Handle,
    /// Parameters the device was created with
    pub spec: VirtualDeviceSpec,
    /// Device node
    pub node: PathBuf,
}

impl DeviceHandle {
    /// Device index
    pub fn index(&self) -> u32 {
        self.spec.index
    }
}

/// Raw pixel encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelEncoding {
    /// 4:2:0 semi-planar
    Nv12,
    /// 4:2:2 packed, Y0 U Y1 V
    Yuy2,
    /// 4:2:2 packed, U Y0 V Y1
    Uyvy,
    /// 4:2:0 planar
    I420,
    /// 24-bit RGB
    Rgb,
    /// 32-bit BGRx
    Bgrx,
}

impl PixelEncoding {
    /// Encodings the loopback device accepts from a producer and that
    /// common consumers (browsers, conferencing apps) can read
    pub const LOOPBACK_COMPATIBLE: [PixelEncoding; 4] = [
        PixelEncoding::Yuy2,
        PixelEncoding::Uyvy,
        PixelEncoding::I420,
        PixelEncoding::Nv12,
    ];

    /// GStreamer caps format name
    pub fn gst_name(&self) -> &'static str {
        match self {
            Self::Nv12 => "NV12",
            Self::Yuy2 => "YUY2",
            Self::Uyvy => "UYVY",
            Self::I420 => "I420",
            Self::Rgb => "RGB",
            Self::Bgrx => "BGRx",
        }
    }

    /// Whether the virtual device can accept this encoding
    pub fn loopback_compatible(&self) -> bool {
        Self::LOOPBACK_COMPATIBLE.contains(self)
    }
}

impl std::fmt::Display for PixelEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.gst_name())
    }
}

impl std::str::FromStr for PixelEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NV12" => Ok(Self::Nv12),
            "YUY2" | "YUYV" => Ok(Self::Yuy2),
            "UYVY" => Ok(Self::Uyvy),
            "I420" | "YU12" => Ok(Self::I420),
            "RGB" | "RGB3" => Ok(Self::Rgb),
            "BGRX" => Ok(Self::Bgrx),
            _ => Err(format!("Unknown pixel encoding: {}", s)),
        }
    }
}

/// Format produced by the vendor camera source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputFormat {
    pub encoding: PixelEncoding,
    pub width: u32,
    pub height: u32,
}

/// Format written to the virtual device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputFormat {
    pub encoding: PixelEncoding,
    pub width: u32,
    pub height: u32,
    /// Frames per second
    pub framerate: u32,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}x{}@{}fps",
            self.encoding, self.width, self.height, self.framerate
        )
    }
}

/// Description of the frame-producing pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Source-specific tuning, passed to the source element as properties
    #[serde(default)]
    pub source_params: BTreeMap<String, String>,
    /// Format requested from the source
    pub input: InputFormat,
    /// Format delivered to the virtual device
    pub output: OutputFormat,
}

impl Default for PipelineSpec {
    fn default() -> Self {
        let mut source_params = BTreeMap::new();
        source_params.insert("buffer-count".to_string(), "7".to_string());
        Self {
            source_params,
            input: InputFormat {
                encoding: PixelEncoding::Nv12,
                width: 1280,
                height: 720,
            },
            output: OutputFormat {
                encoding: PixelEncoding::Yuy2,
                width: 1280,
                height: 720,
                framerate: 30,
            },
        }
    }
}

impl PipelineSpec {
    /// Copy of this spec with both input and output set to a new resolution
    pub fn with_resolution(&self, width: u32, height: u32) -> Self {
        let mut spec = self.clone();
        spec.input.width = width;
        spec.input.height = height;
        spec.output.width = width;
        spec.output.height = height;
        spec
    }
}

/// Lifecycle state of the capture pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PipelineState {
    /// No pipeline process
    #[default]
    Stopped,
    /// Process launched, waiting for frames
    Starting,
    /// Frames are flowing to the virtual device
    Running,
    /// Stalled or reporting errors; a restart is pending
    Degraded,
    /// Restart budget exhausted, needs an explicit enable
    FailedPermanently,
}

impl PipelineState {
    /// Whether a pipeline is attached (or about to be re-attached)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Degraded)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Degraded => write!(f, "degraded"),
            Self::FailedPermanently => write!(f, "failed"),
        }
    }
}

/// Endpoint description published to the session broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub index: u32,
    pub label: String,
    pub node: PathBuf,
    pub format: OutputFormat,
    /// Whether frames are currently flowing
    pub active: bool,
}

impl DeviceDescriptor {
    /// Build a descriptor for a device handle and output format
    pub fn new(handle: &DeviceHandle, format: OutputFormat) -> Self {
        Self {
            index: handle.index(),
            label: handle.spec.label.clone(),
            node: handle.node.clone(),
            format,
            active: true,
        }
    }
}

/// Camera access granted to an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    /// Portal application id (e.g. "org.mozilla.firefox")
    pub subject_app: String,
    pub device_index: u32,
    pub granted_at: SystemTime,
}
