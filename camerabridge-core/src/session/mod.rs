//! Session bridge
//!
//! Advertises the virtual endpoint to the desktop session's permission
//! broker and keeps camera grants for portal-mediated applications.
//!
//! Broker calls are retried a fixed number of times with a fixed delay.
//! Exhausting the attempts yields [`BridgeError::BrokerUnavailable`], which
//! callers treat as a warning: the pipeline keeps running regardless.

mod portal;

pub use portal::PortalBroker;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SessionSettings;
use crate::controller::SessionNotifier;
use crate::error::{BridgeError, Result};
use crate::types::{DeviceDescriptor, DeviceHandle, PermissionGrant};

/// Future returned by [`SessionBroker`] calls
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Session-level permission broker
pub trait SessionBroker: Send + Sync {
    /// Register (or update) an endpoint description
    fn publish<'a>(&'a self, descriptor: &'a DeviceDescriptor) -> BrokerFuture<'a, ()>;

    /// Remove an endpoint description
    fn unpublish(&self, index: u32) -> BrokerFuture<'_, ()>;

    /// Allow an application to use the camera
    fn grant<'a>(&'a self, app: &'a str) -> BrokerFuture<'a, ()>;

    /// Withdraw an application's camera permission
    fn revoke<'a>(&'a self, app: &'a str) -> BrokerFuture<'a, ()>;
}

struct BridgeInner {
    broker: Arc<dyn SessionBroker>,
    settings: SessionSettings,
    grants: Mutex<HashMap<(String, u32), PermissionGrant>>,
    published: Mutex<HashMap<u32, DeviceDescriptor>>,
}

/// Publishes endpoints and tracks permission grants
#[derive(Clone)]
pub struct SessionBridge {
    inner: Arc<BridgeInner>,
}

impl SessionBridge {
    /// Create a bridge on top of a broker
    pub fn new(broker: Arc<dyn SessionBroker>, settings: SessionSettings) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                broker,
                settings,
                grants: Mutex::new(HashMap::new()),
                published: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register the endpoint as a session media source
    pub async fn publish(&self, handle: &DeviceHandle, descriptor: DeviceDescriptor) -> Result<()> {
        if descriptor.index != handle.index() {
            return Err(BridgeError::UnknownDevice(descriptor.index));
        }

        let broker = self.inner.broker.as_ref();
        let d = &descriptor;
        self.retry("publish", move || broker.publish(d)).await?;

        info!(
            "Published {} as \"{}\" ({})",
            descriptor.node.display(),
            descriptor.label,
            descriptor.format
        );
        self.inner.published.lock().insert(descriptor.index, descriptor);
        Ok(())
    }

    /// Grant an application access to a device
    ///
    /// Repeated grants return the original entry without contacting the
    /// broker again.
    pub async fn grant(&self, subject_app: &str, device_index: u32) -> Result<PermissionGrant> {
        let key = (subject_app.to_string(), device_index);
        let existing = self.inner.grants.lock().get(&key).cloned();
        if let Some(existing) = existing {
            debug!("{} already granted /dev/video{}", subject_app, device_index);
            return Ok(existing);
        }

        let broker = self.inner.broker.as_ref();
        self.retry("grant", move || broker.grant(subject_app)).await?;

        let grant = PermissionGrant {
            subject_app: subject_app.to_string(),
            device_index,
            granted_at: SystemTime::now(),
        };
        info!("Granted camera access to {}", subject_app);

        // A concurrent grant for the same key may have won the race
        let mut grants = self.inner.grants.lock();
        Ok(grants.entry(key).or_insert(grant).clone())
    }

    /// Mark a published endpoint as not currently producing frames
    ///
    /// Grants are kept.
    pub async fn mark_inactive(&self, index: u32) -> Result<()> {
        let descriptor = {
            let mut published = self.inner.published.lock();
            match published.get_mut(&index) {
                Some(d) if d.active => {
                    d.active = false;
                    d.clone()
                }
                _ => return Ok(()),
            }
        };

        let broker = self.inner.broker.as_ref();
        let d = &descriptor;
        self.retry("update", move || broker.publish(d)).await?;
        debug!("Marked /dev/video{} inactive", index);
        Ok(())
    }

    /// Withdraw every grant for a device and unpublish it
    ///
    /// Local state is always cleared. Returns the number of grants removed,
    /// or the last broker error if the broker could not be updated.
    pub async fn revoke_all(&self, device_index: u32) -> Result<usize> {
        let (removed, still_granted) = {
            let mut grants = self.inner.grants.lock();
            let removed: Vec<String> = grants
                .keys()
                .filter(|(_, index)| *index == device_index)
                .map(|(app, _)| app.clone())
                .collect();
            for app in &removed {
                grants.remove(&(app.clone(), device_index));
            }
            let still_granted: Vec<String> = grants.keys().map(|(app, _)| app.clone()).collect();
            (removed, still_granted)
        };
        let was_published = self.inner.published.lock().remove(&device_index).is_some();

        let broker = self.inner.broker.as_ref();
        let mut last_error = None;

        for app in removed.iter().filter(|app| !still_granted.contains(app)) {
            let app = app.as_str();
            if let Err(e) = self.retry("revoke", move || broker.revoke(app)).await {
                warn!("Failed to revoke camera access for {}: {}", app, e);
                last_error = Some(e);
            }
        }

        if was_published {
            if let Err(e) = self.retry("unpublish", move || broker.unpublish(device_index)).await {
                warn!("Failed to unpublish /dev/video{}: {}", device_index, e);
                last_error = Some(e);
            }
        }

        info!(
            "Revoked {} grant(s) for /dev/video{}",
            removed.len(),
            device_index
        );
        match last_error {
            Some(e) => Err(e),
            None => Ok(removed.len()),
        }
    }

    /// Grants held for a device
    pub fn grants(&self, device_index: u32) -> Vec<PermissionGrant> {
        let mut grants: Vec<_> = self
            .inner
            .grants
            .lock()
            .values()
            .filter(|g| g.device_index == device_index)
            .cloned()
            .collect();
        grants.sort_by(|a, b| a.subject_app.cmp(&b.subject_app));
        grants
    }

    /// Published descriptor for a device
    pub fn descriptor(&self, index: u32) -> Option<DeviceDescriptor> {
        self.inner.published.lock().get(&index).cloned()
    }

    /// Whether a device is currently published
    pub fn is_published(&self, index: u32) -> bool {
        self.inner.published.lock().contains_key(&index)
    }

    /// Start a worker that applies controller notifications in order
    ///
    /// Publishes the endpoint and grants the configured applications when
    /// frames start flowing. The worker ends once the returned notifier is
    /// dropped. Must be called from within a tokio runtime.
    pub fn spawn_listener(&self) -> SessionEvents {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = self.clone();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                bridge.handle_event(event).await;
            }
            debug!("Session listener finished");
        });

        SessionEvents { tx }
    }

    async fn handle_event(&self, event: SessionEvent) {
        if !self.inner.settings.enabled {
            debug!("Session publishing disabled, ignoring {:?}", event);
            return;
        }

        match event {
            SessionEvent::Active(handle, descriptor) => {
                if let Err(e) = self.publish(&handle, descriptor).await {
                    warn!("{}", e);
                }
                for app in &self.inner.settings.grant_apps {
                    if let Err(e) = self.grant(app, handle.index()).await {
                        warn!("{}", e);
                    }
                }
            }
            SessionEvent::Inactive(index) => {
                if let Err(e) = self.mark_inactive(index).await {
                    warn!("{}", e);
                }
            }
        }
    }

    async fn retry<'a, T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> BrokerFuture<'a, T>,
    ) -> Result<T> {
        let settings = &self.inner.settings;
        let attempts = settings.attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    warn!(
                        "Session broker {} failed (attempt {}/{}): {}",
                        what, attempt, attempts, e
                    );
                    attempt += 1;
                    tokio::time::sleep(settings.retry_delay()).await;
                }
                Err(e) => {
                    let detail = match e.root() {
                        BridgeError::BrokerUnavailable(msg) => msg.clone(),
                        other => other.to_string(),
                    };
                    return Err(BridgeError::broker(format!(
                        "{} failed after {} attempt(s): {}",
                        what, attempts, detail
                    )));
                }
            }
        }
    }
}

#[derive(Debug)]
enum SessionEvent {
    Active(DeviceHandle, DeviceDescriptor),
    Inactive(u32),
}

/// Controller notifier feeding a session listener
pub struct SessionEvents {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionNotifier for SessionEvents {
    fn endpoint_active(&self, handle: &DeviceHandle, descriptor: DeviceDescriptor) {
        if self
            .tx
            .send(SessionEvent::Active(handle.clone(), descriptor))
            .is_err()
        {
            debug!("Session listener gone, dropping activation");
        }
    }

    fn endpoint_inactive(&self, index: u32) {
        if self.tx.send(SessionEvent::Inactive(index)).is_err() {
            debug!("Session listener gone, dropping deactivation");
        }
    }
}
