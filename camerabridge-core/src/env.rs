//! Environment detection for camerabridge
//!
//! Checks the pieces the bridge relies on:
//! - v4l2loopback kernel module and its control utility
//! - GStreamer launcher and the vendor source element
//! - Session bus and desktop for the permission portal
//! - Existing capture devices, so the virtual index does not collide

use std::env;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

use crate::config::ToolSettings;
use crate::device::{CaptureDeviceInfo, LoopbackFacility};

/// What the bridge found on this system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentReport {
    /// v4l2loopback module loaded
    pub loopback_module: bool,
    /// Resolved `v4l2loopback-ctl`
    pub loopback_ctl: Option<PathBuf>,
    /// Resolved `gst-launch-1.0`
    pub gst_launch: Option<PathBuf>,
    /// Vendor source element name
    pub source_element: String,
    /// Whether GStreamer knows the source element
    pub source_element_installed: bool,
    /// Session bus address
    pub session_bus: Option<String>,
    /// Desktop name
    pub desktop: String,
    /// All video4linux devices
    pub capture_devices: Vec<CaptureDeviceInfo>,
}

impl EnvironmentReport {
    /// Problems that prevent the bridge from working
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.loopback_module {
            problems.push("v4l2loopback module is not loaded (modprobe v4l2loopback)".to_string());
        }
        if self.loopback_ctl.is_none() {
            problems.push("v4l2loopback-ctl not found in PATH".to_string());
        }
        if self.gst_launch.is_none() {
            problems.push("gst-launch-1.0 not found in PATH".to_string());
        }
        if !self.source_element_installed {
            problems.push(format!(
                "GStreamer element '{}' is not installed",
                self.source_element
            ));
        }
        if self.session_bus.is_none() {
            problems.push("No session bus; portal permissions cannot be published".to_string());
        }
        problems
    }

    /// Physically backed device at an index, if any
    pub fn physical_device_at(&self, index: u32) -> Option<&CaptureDeviceInfo> {
        self.capture_devices
            .iter()
            .find(|d| d.index == index && !d.is_virtual)
    }
}

/// Inspect the current system
pub fn detect(tools: &ToolSettings) -> EnvironmentReport {
    let loopback = LoopbackFacility::new(tools.loopback_ctl.clone());
    let gst_launch = find_program(&tools.gst_launch);

    let source_element_installed = gst_launch.is_some() && element_installed(&tools.source_element);

    EnvironmentReport {
        loopback_module: loopback.module_loaded(),
        loopback_ctl: find_program(&tools.loopback_ctl),
        gst_launch,
        source_element: tools.source_element.clone(),
        source_element_installed,
        session_bus: env::var("DBUS_SESSION_BUS_ADDRESS").ok(),
        desktop: detect_desktop(),
        capture_devices: loopback.list(),
    }
}

/// Resolve a program name against PATH
///
/// Names containing a slash are checked as paths.
pub fn find_program(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

/// Check whether GStreamer can instantiate an element
fn element_installed(element: &str) -> bool {
    let installed = Command::new("gst-inspect-1.0")
        .args(["--exists", element])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    debug!("GStreamer element {} installed: {}", element, installed);
    installed
}

/// Detect the desktop environment
fn detect_desktop() -> String {
    if let Ok(desktop) = env::var("XDG_CURRENT_DESKTOP") {
        let desktop_lower = desktop.to_lowercase();

        if desktop_lower.contains("kde") || desktop_lower.contains("plasma") {
            return "KDE Plasma".to_string();
        }
        if desktop_lower.contains("gnome") {
            return "GNOME".to_string();
        }
        if desktop_lower.contains("hyprland") {
            return "Hyprland".to_string();
        }
        if desktop_lower.contains("sway") {
            return "Sway".to_string();
        }
        if desktop_lower.contains("cosmic") {
            return "COSMIC".to_string();
        }

        return desktop;
    }

    if let Ok(session) = env::var("XDG_SESSION_DESKTOP") {
        return session;
    }

    if let Ok(session) = env::var("DESKTOP_SESSION") {
        return session;
    }

    "Unknown".to_string()
}
