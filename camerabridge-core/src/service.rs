//! Bridge service
//!
//! The control surface of the bridge. Wires the device manager, pipeline
//! controller and session bridge together and exposes the high-level
//! enable/disable/status operations used by the daemon and the CLI.

use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::controller::{ControllerStatus, GstLauncher, PipelineController, PipelineLauncher};
use crate::device::{DeviceFacility, DeviceManager, LoopbackFacility};
use crate::error::{BridgeError, EXIT_FAILED_PERMANENTLY, EXIT_OK, Result};
use crate::session::{PortalBroker, SessionBridge, SessionBroker};
use crate::types::{DeviceHandle, PixelEncoding, PipelineState, VirtualDeviceSpec};

/// Status reported to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub state: PipelineState,
    pub last_error: Option<String>,
    pub device_index: u32,
    pub device_label: String,
    /// Device node while the bridge holds the device
    pub node: Option<PathBuf>,
    pub encoding: PixelEncoding,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// Consecutive pipeline failures
    pub failures: u32,
    /// Total pipeline launches
    pub launches: u64,
    pub pid: Option<u32>,
    /// Whether the endpoint is published to the session broker
    pub published: bool,
    pub uptime_secs: u64,
}

impl BridgeStatus {
    /// Process exit code matching this status
    pub fn exit_code(&self) -> u8 {
        if self.state == PipelineState::FailedPermanently {
            EXIT_FAILED_PERMANENTLY
        } else {
            EXIT_OK
        }
    }
}

/// The camera bridge
pub struct BridgeService {
    config: RwLock<ServiceConfig>,
    devices: Arc<DeviceManager>,
    controller: PipelineController,
    session: SessionBridge,
    /// Device held while enabled
    sink: SyncMutex<Option<DeviceHandle>>,
    /// Serializes enable/disable/reconfigure
    transition: Mutex<()>,
    /// Latest requested configuration not yet applied
    pending: SyncMutex<Option<ServiceConfig>>,
    started_at: Instant,
}

impl BridgeService {
    /// Create a service from its collaborators
    ///
    /// Fails with a configuration error if `config` is invalid. Must be
    /// called from within a tokio runtime.
    pub fn new(
        config: ServiceConfig,
        facility: Box<dyn DeviceFacility>,
        launcher: Arc<dyn PipelineLauncher>,
        broker: Arc<dyn SessionBroker>,
    ) -> Result<Self> {
        config.validate()?;

        let devices = Arc::new(DeviceManager::new(facility));
        let session = SessionBridge::new(broker, config.session.clone());
        let notifier = Arc::new(session.spawn_listener());
        let controller = PipelineController::new(devices.clone(), config.restart, launcher, notifier);

        Ok(Self {
            config: RwLock::new(config),
            devices,
            controller,
            session,
            sink: SyncMutex::new(None),
            transition: Mutex::new(()),
            pending: SyncMutex::new(None),
            started_at: Instant::now(),
        })
    }

    /// Create a service using v4l2loopback, gst-launch and the desktop portal
    pub fn system(config: ServiceConfig) -> Result<Self> {
        let facility = Box::new(LoopbackFacility::new(config.tools.loopback_ctl.clone()));
        let launcher = Arc::new(GstLauncher::new(&config.tools));
        let broker = Arc::new(PortalBroker::new());
        Self::new(config, facility, launcher, broker)
    }

    /// Start the bridge
    ///
    /// Returns once the pipeline has been accepted into `Starting`. A no-op
    /// while the bridge is already active.
    pub async fn enable(&self) -> Result<BridgeStatus> {
        let _transition = self.transition.lock().await;
        self.enable_locked().await?;
        Ok(self.status())
    }

    /// Stop the bridge and remove the virtual device
    ///
    /// A no-op while the bridge is disabled.
    pub async fn disable(&self) -> Result<BridgeStatus> {
        let _transition = self.transition.lock().await;
        self.disable_locked(true).await;
        Ok(self.status())
    }

    /// Current status snapshot
    pub fn status(&self) -> BridgeStatus {
        let ControllerStatus {
            state,
            last_error,
            failures,
            launches,
            pid,
        } = self.controller.status();
        let config = self.config.read();
        let output = config.pipeline.output;
        let node = self.sink.lock().as_ref().map(|h| h.node.clone());

        BridgeStatus {
            state,
            last_error,
            device_index: config.device.index,
            device_label: config.device.label.clone(),
            node,
            encoding: output.encoding,
            width: output.width,
            height: output.height,
            framerate: output.framerate,
            failures,
            launches,
            pid,
            published: self.session.is_published(config.device.index),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Watch controller status changes
    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.controller.subscribe()
    }

    /// Switch the pipeline to another allow-listed resolution
    pub async fn set_resolution(&self, width: u32, height: u32) -> Result<BridgeStatus> {
        let config = self.config.read().with_resolution(width, height)?;
        self.reconfigure(config).await
    }

    /// Apply a new configuration with a full stop/reconfigure/start cycle
    ///
    /// Concurrent requests are serialized and only the most recent one is
    /// applied; superseded callers get the status after the newer request.
    pub async fn reconfigure(&self, config: ServiceConfig) -> Result<BridgeStatus> {
        config.validate()?;
        *self.pending.lock() = Some(config);

        let _transition = self.transition.lock().await;
        let next = self.pending.lock().take();
        let Some(config) = next else {
            debug!("Reconfiguration superseded by a newer request");
            return Ok(self.status());
        };

        let was_active = self.controller.health_check().is_active();
        let device_changed = config.device != self.config.read().device;

        // Only a bridge that comes back up keeps its device
        self.disable_locked(device_changed || !was_active).await;
        self.controller.set_policy(config.restart);
        info!(
            "Configuration applied: {} ({})",
            config.device, config.pipeline.output
        );
        *self.config.write() = config;

        if was_active {
            self.enable_locked().await?;
        }
        Ok(self.status())
    }

    /// Stop the bridge and withdraw everything published to the session
    pub async fn shutdown(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        let index = self.config.read().device.index;

        self.disable_locked(true).await;
        match self.session.revoke_all(index).await {
            Ok(count) => debug!("Removed {} session grant(s)", count),
            Err(e) => warn!("Session cleanup incomplete: {}", e),
        }
        info!("Bridge shut down");
        Ok(())
    }

    /// Active configuration
    pub fn config(&self) -> ServiceConfig {
        self.config.read().clone()
    }

    /// Session bridge
    pub fn session(&self) -> &SessionBridge {
        &self.session
    }

    /// Device manager
    pub fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    async fn enable_locked(&self) -> Result<()> {
        let state = self.controller.health_check();
        if state.is_active() {
            debug!("Bridge already enabled ({})", state);
            return Ok(());
        }

        let config = self.config.read().clone();
        let handle = self.ensure_device(config.device.clone()).await?;
        self.controller.start(config.pipeline, handle.clone()).await?;
        *self.sink.lock() = Some(handle);
        info!("Bridge enabled");
        Ok(())
    }

    async fn disable_locked(&self, release: bool) {
        let sink = self.sink.lock().clone();
        if sink.is_none() && self.controller.health_check() == PipelineState::Stopped {
            debug!("Bridge already disabled");
            return;
        }

        self.controller.stop().await;

        if let Some(handle) = sink {
            if release {
                if let Err(e) = self.release_device(handle).await {
                    warn!("Virtual device left in place: {}", e);
                }
                *self.sink.lock() = None;
            }
        }
        info!("Bridge disabled");
    }

    async fn ensure_device(&self, spec: VirtualDeviceSpec) -> Result<DeviceHandle> {
        let devices = self.devices.clone();
        tokio::task::spawn_blocking(move || devices.ensure(&spec))
            .await
            .map_err(|e| BridgeError::device_create(format!("Device task failed: {}", e)))?
    }

    async fn release_device(&self, handle: DeviceHandle) -> Result<()> {
        let devices = self.devices.clone();
        tokio::task::spawn_blocking(move || devices.release(&handle))
            .await
            .map_err(|e| BridgeError::device_create(format!("Device task failed: {}", e)))?
    }
}
