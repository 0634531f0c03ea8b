//! Virtual device management
//!
//! Makes sure the virtual capture endpoint exists with the configured
//! identity before a pipeline starts, and enforces single-owner access to it.
//!
//! Devices cannot be changed in place: a device whose parameters differ from
//! the requested spec is torn down and recreated.

mod loopback;

pub use loopback::{CaptureDeviceInfo, LoopbackFacility};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::types::{DeviceHandle, Handle, VirtualDeviceSpec};

/// What the system reports about an existing device node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProbe {
    /// Card label
    pub label: String,
    /// Exclusive caps setting, if the facility can report it
    pub exclusive: Option<bool>,
    /// Whether the node belongs to a virtual (not physically backed) device
    pub is_virtual: bool,
}

impl DeviceProbe {
    /// Whether this device can be reused for a spec as-is
    pub fn matches(&self, spec: &VirtualDeviceSpec) -> bool {
        self.is_virtual && self.label == spec.label && self.exclusive == Some(spec.exclusive)
    }
}

/// OS facility that creates and removes virtual capture devices
pub trait DeviceFacility: Send + Sync {
    /// Check that the facility is usable at all
    ///
    /// Fails with [`BridgeError::DeviceCreateFailed`] when the backing kernel
    /// module is absent.
    fn check_available(&self) -> Result<()>;

    /// Inspect the device node for an index, if one exists
    fn probe(&self, index: u32) -> Result<Option<DeviceProbe>>;

    /// Create a device and return its node path
    fn create(&self, spec: &VirtualDeviceSpec) -> Result<PathBuf>;

    /// Remove the device at an index
    fn remove(&self, index: u32) -> Result<()>;
}

struct ManagedDevice {
    handle: DeviceHandle,
    attached: bool,
}

/// Tracks the virtual devices owned by the service
pub struct DeviceManager {
    facility: Box<dyn DeviceFacility>,
    devices: Mutex<HashMap<u32, ManagedDevice>>,
}

impl DeviceManager {
    /// Create a manager on top of a device facility
    pub fn new(facility: Box<dyn DeviceFacility>) -> Self {
        Self {
            facility,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure a device matching `spec` exists and return its handle
    ///
    /// Calling this again with an identical spec returns the same handle
    /// without touching the system.
    pub fn ensure(&self, spec: &VirtualDeviceSpec) -> Result<DeviceHandle> {
        let mut devices = self.devices.lock();

        if let Some(existing) = devices.get(&spec.index) {
            if existing.handle.spec == *spec {
                debug!("Reusing virtual device {}", spec);
                return Ok(existing.handle.clone());
            }
            if existing.attached {
                return Err(BridgeError::DeviceBusy(spec.index));
            }
            info!(
                "Virtual device /dev/video{} parameters changed, recreating",
                spec.index
            );
            self.facility.remove(spec.index)?;
            devices.remove(&spec.index);
        }

        self.facility.check_available()?;

        let node = match self.facility.probe(spec.index)? {
            Some(probe) if !probe.is_virtual => {
                return Err(BridgeError::config(format!(
                    "/dev/video{} is a physical capture device ({}); choose another index",
                    spec.index, probe.label
                )));
            }
            Some(probe) if probe.matches(spec) => {
                info!("Adopting existing virtual device {}", spec);
                spec.node()
            }
            Some(probe) => {
                info!(
                    "Existing virtual device /dev/video{} (\"{}\") does not match, recreating",
                    spec.index, probe.label
                );
                self.facility.remove(spec.index)?;
                self.create(spec)?
            }
            None => self.create(spec)?,
        };

        let handle = DeviceHandle {
            id: Handle::new(),
            spec: spec.clone(),
            node,
        };
        devices.insert(
            spec.index,
            ManagedDevice {
                handle: handle.clone(),
                attached: false,
            },
        );
        Ok(handle)
    }

    fn create(&self, spec: &VirtualDeviceSpec) -> Result<PathBuf> {
        let node = self.facility.create(spec).map_err(|e| match e {
            BridgeError::DeviceCreateFailed(_) => e,
            other => BridgeError::device_create(other.to_string()),
        })?;
        info!("Created virtual device {} at {:?}", spec, node);
        Ok(node)
    }

    /// Remove a device unless a pipeline holds it
    pub fn release(&self, handle: &DeviceHandle) -> Result<()> {
        let mut devices = self.devices.lock();

        let Some(device) = devices.get(&handle.index()) else {
            debug!("Virtual device {} already released", handle.node.display());
            return Ok(());
        };
        if device.handle.id != handle.id {
            return Err(BridgeError::UnknownDevice(handle.index()));
        }
        if device.attached {
            return Err(BridgeError::DeviceBusy(handle.index()));
        }

        self.facility.remove(handle.index())?;
        devices.remove(&handle.index());
        info!("Released virtual device {}", handle.node.display());
        Ok(())
    }

    /// Claim a device for a producer
    pub fn attach(&self, handle: &DeviceHandle) -> Result<()> {
        let mut devices = self.devices.lock();
        let device = devices
            .get_mut(&handle.index())
            .filter(|d| d.handle.id == handle.id)
            .ok_or(BridgeError::UnknownDevice(handle.index()))?;

        if device.attached {
            return Err(BridgeError::DeviceBusy(handle.index()));
        }
        device.attached = true;
        debug!("Producer attached to {}", handle.node.display());
        Ok(())
    }

    /// Return a device claimed with [`attach`](Self::attach)
    pub fn detach(&self, handle: &DeviceHandle) {
        let mut devices = self.devices.lock();
        match devices.get_mut(&handle.index()) {
            Some(device) if device.handle.id == handle.id => {
                device.attached = false;
                debug!("Producer detached from {}", handle.node.display());
            }
            _ => warn!("Detach of unmanaged device {}", handle.node.display()),
        }
    }

    /// Whether a producer holds the device at an index
    pub fn is_attached(&self, index: u32) -> bool {
        self.devices
            .lock()
            .get(&index)
            .map(|d| d.attached)
            .unwrap_or(false)
    }

    /// Handle of the managed device at an index
    pub fn handle(&self, index: u32) -> Option<DeviceHandle> {
        self.devices.lock().get(&index).map(|d| d.handle.clone())
    }
}
