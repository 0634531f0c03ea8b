//! v4l2loopback device facility
//!
//! Devices are created and removed with `v4l2loopback-ctl` and inspected
//! through sysfs. Loopback devices live under `/sys/devices/virtual`, which
//! is how they are told apart from physically backed cameras.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::{DeviceFacility, DeviceProbe};
use crate::error::{BridgeError, Result};
use crate::types::VirtualDeviceSpec;

/// Capture device found in sysfs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDeviceInfo {
    pub index: u32,
    pub label: String,
    pub is_virtual: bool,
}

/// Default limit for a single `v4l2loopback-ctl` invocation
const CTL_TIMEOUT: Duration = Duration::from_secs(10);

const CTL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Device facility backed by the v4l2loopback kernel module
pub struct LoopbackFacility {
    /// Path or name of `v4l2loopback-ctl`
    ctl: String,
    /// sysfs mount point
    sysfs: PathBuf,
    ctl_timeout: Duration,
}

struct CtlOutput {
    status: ExitStatus,
    stderr: String,
}

impl LoopbackFacility {
    /// Create a facility using the given control utility
    pub fn new(ctl: impl Into<String>) -> Self {
        Self::with_sysfs(ctl, "/sys")
    }

    /// Create a facility reading from an alternative sysfs root
    pub fn with_sysfs(ctl: impl Into<String>, sysfs: impl Into<PathBuf>) -> Self {
        Self {
            ctl: ctl.into(),
            sysfs: sysfs.into(),
            ctl_timeout: CTL_TIMEOUT,
        }
    }

    /// Override how long the control utility may run before it is killed
    pub fn with_ctl_timeout(mut self, timeout: Duration) -> Self {
        self.ctl_timeout = timeout;
        self
    }

    /// Whether the v4l2loopback module is loaded
    pub fn module_loaded(&self) -> bool {
        self.sysfs.join("module").join("v4l2loopback").exists()
    }

    fn class_dir(&self) -> PathBuf {
        self.sysfs.join("class").join("video4linux")
    }

    fn device_dir(&self, index: u32) -> PathBuf {
        self.class_dir().join(format!("video{}", index))
    }

    fn read_probe(&self, dir: &Path) -> Result<DeviceProbe> {
        let label = std::fs::read_to_string(dir.join("name"))?.trim().to_string();
        let resolved = std::fs::canonicalize(dir)?;
        let is_virtual = resolved
            .components()
            .any(|c| c.as_os_str() == "virtual");
        Ok(DeviceProbe {
            label,
            // v4l2loopback does not expose exclusive_caps per device
            exclusive: None,
            is_virtual,
        })
    }

    /// List all video4linux capture nodes
    pub fn list(&self) -> Vec<CaptureDeviceInfo> {
        let Ok(entries) = std::fs::read_dir(self.class_dir()) else {
            return Vec::new();
        };

        let mut devices: Vec<_> = entries
            .filter_map(|e| e.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let index = name.to_string_lossy().strip_prefix("video")?.parse().ok()?;
                let probe = self.read_probe(&entry.path()).ok()?;
                Some(CaptureDeviceInfo {
                    index,
                    label: probe.label,
                    is_virtual: probe.is_virtual,
                })
            })
            .collect();
        devices.sort_by_key(|d| d.index);
        devices
    }

    /// Run the control utility, killing it once the timeout passes
    ///
    /// Called from blocking threads only.
    fn run_ctl(&self, args: &[&str]) -> Result<CtlOutput> {
        let command = format!("{} {}", self.ctl, args.join(" "));
        debug!("Running {}", command);

        let mut child = Command::new(&self.ctl)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                BridgeError::device_create(format!("Failed to run {}: {}", self.ctl, e))
            })?;

        let deadline = Instant::now() + self.ctl_timeout;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    warn!("{} did not finish within {:?}, killing it", command, self.ctl_timeout);
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(BridgeError::device_create(format!(
                        "{} timed out after {:?}",
                        command, self.ctl_timeout
                    )));
                }
                None => std::thread::sleep(CTL_POLL_INTERVAL),
            }
        };

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            pipe.read_to_string(&mut stderr)?;
        }
        Ok(CtlOutput { status, stderr })
    }
}

impl DeviceFacility for LoopbackFacility {
    fn check_available(&self) -> Result<()> {
        if self.module_loaded() {
            Ok(())
        } else {
            Err(BridgeError::device_create(
                "v4l2loopback kernel module is not loaded",
            ))
        }
    }

    fn probe(&self, index: u32) -> Result<Option<DeviceProbe>> {
        let dir = self.device_dir(index);
        if !dir.exists() {
            trace!("No device node for index {}", index);
            return Ok(None);
        }
        self.read_probe(&dir).map(Some)
    }

    fn create(&self, spec: &VirtualDeviceSpec) -> Result<PathBuf> {
        let node = spec.node();
        let node_str = node.to_string_lossy();
        let exclusive = if spec.exclusive { "1" } else { "0" };

        let output = self.run_ctl(&["add", "-n", &spec.label, "-x", exclusive, &node_str])?;

        if !output.status.success() {
            return Err(BridgeError::device_create(format!(
                "{} add failed: {}",
                self.ctl,
                output.stderr.trim()
            )));
        }

        Ok(node)
    }

    fn remove(&self, index: u32) -> Result<()> {
        let node = format!("/dev/video{}", index);
        let output = self.run_ctl(&["delete", &node])?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = output.stderr;
        if stderr.to_lowercase().contains("busy") {
            Err(BridgeError::DeviceBusy(index))
        } else {
            Err(BridgeError::device_create(format!(
                "{} delete failed: {}",
                self.ctl,
                stderr.trim()
            )))
        }
    }
}
