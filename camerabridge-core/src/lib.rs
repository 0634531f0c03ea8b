//! camerabridge Core Library
//!
//! Keeps a laptop camera that only works through a vendor image-processing
//! pipeline available on a stable v4l2loopback device.
//!
//! This library provides:
//! - Virtual device management on top of v4l2loopback
//! - A supervised capture pipeline with bounded restarts
//! - Publishing the endpoint to the xdg-desktop-portal permission store
//! - A control surface served over a Unix socket
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │ Vendor Source   │───▶│ gst-launch child │───▶│ /dev/videoN     │
//! │ (icamerasrc)    │    │ (supervised)     │    │ (v4l2loopback)  │
//! └─────────────────┘    └──────────────────┘    └─────────────────┘
//!                                 │ running
//!                                 ▼
//!                        ┌──────────────────┐
//!                        │ Portal Permission│
//!                        │ Store            │
//!                        └──────────────────┘
//! ```

pub mod config;
pub mod controller;
pub mod device;
pub mod env;
pub mod error;
pub mod ipc;
pub mod service;
pub mod session;
pub mod types;

pub use config::{RestartPolicy, ServiceConfig};
pub use controller::{ControllerStatus, PipelineController};
pub use device::DeviceManager;
pub use error::{BridgeError, Result};
pub use service::{BridgeService, BridgeStatus};
pub use session::SessionBridge;
pub use types::{
    DeviceDescriptor, DeviceHandle, Handle, PipelineSpec, PipelineState, VirtualDeviceSpec,
};
