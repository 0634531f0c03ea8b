//! xdg-desktop-portal permission store broker
//!
//! Camera permissions for sandboxed and portal-aware applications live in
//! the `devices` table of the portal permission store under the `camera`
//! id. Endpoint descriptions are stored as JSON in a table of our own so
//! other session components can discover the virtual camera.

use ashpd::desktop::camera::Camera;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use zbus::zvariant::Value;

use super::{BrokerFuture, SessionBroker};
use crate::error::{BridgeError, Result};
use crate::types::DeviceDescriptor;

const STORE_SERVICE: &str = "org.freedesktop.impl.portal.PermissionStore";
const STORE_PATH: &str = "/org/freedesktop/impl/portal/PermissionStore";
const STORE_INTERFACE: &str = "org.freedesktop.impl.portal.PermissionStore";

/// Permission table used by the camera portal
const DEVICES_TABLE: &str = "devices";
/// Permission id for camera access
const CAMERA_ID: &str = "camera";
/// Table holding published endpoint descriptions
const ENDPOINT_TABLE: &str = "camerabridge";

/// Broker backed by the session bus permission store
pub struct PortalBroker {
    connection: OnceCell<zbus::Connection>,
}

impl PortalBroker {
    /// Create a broker; the session bus is connected on first use
    pub fn new() -> Self {
        Self {
            connection: OnceCell::new(),
        }
    }

    async fn store(&self) -> Result<zbus::Proxy<'static>> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                debug!("Connecting to session bus");
                zbus::Connection::session().await
            })
            .await?;

        let proxy = zbus::Proxy::new(connection, STORE_SERVICE, STORE_PATH, STORE_INTERFACE).await?;
        Ok(proxy)
    }

    async fn publish_descriptor(&self, descriptor: &DeviceDescriptor) -> Result<()> {
        let json = serde_json::to_string(descriptor)
            .map_err(|e| BridgeError::broker(format!("Failed to encode descriptor: {}", e)))?;
        let id = endpoint_id(descriptor.index);

        let store = self.store().await?;
        let _: () = store
            .call("SetValue", &(ENDPOINT_TABLE, true, id.as_str(), Value::from(json)))
            .await?;

        if descriptor.active {
            self.check_camera_portal().await;
        }
        Ok(())
    }

    async fn check_camera_portal(&self) {
        let present = async {
            let camera = Camera::new().await?;
            camera.is_present().await
        }
        .await;

        match present {
            Ok(true) => debug!("Camera portal reports a camera"),
            Ok(false) => warn!("Camera portal does not see any camera yet"),
            Err(e) => warn!("Camera portal unavailable: {}", e),
        }
    }
}

impl Default for PortalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBroker for PortalBroker {
    fn publish<'a>(&'a self, descriptor: &'a DeviceDescriptor) -> BrokerFuture<'a, ()> {
        Box::pin(self.publish_descriptor(descriptor))
    }

    fn unpublish(&self, index: u32) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let id = endpoint_id(index);
            let store = self.store().await?;
            let _: () = store.call("Delete", &(ENDPOINT_TABLE, id.as_str())).await?;
            Ok(())
        })
    }

    fn grant<'a>(&'a self, app: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let store = self.store().await?;
            let _: () = store
                .call(
                    "SetPermission",
                    &(DEVICES_TABLE, true, CAMERA_ID, app, vec!["yes"]),
                )
                .await?;
            info!("Permission store: camera allowed for {}", app);
            Ok(())
        })
    }

    fn revoke<'a>(&'a self, app: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let store = self.store().await?;
            let _: () = store
                .call("DeletePermission", &(DEVICES_TABLE, CAMERA_ID, app))
                .await?;
            info!("Permission store: camera permission removed for {}", app);
            Ok(())
        })
    }
}

fn endpoint_id(index: u32) -> String {
    format!("video{}", index)
}
