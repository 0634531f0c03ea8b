//! Mock infrastructure for testing
//!
//! Provides an in-memory device facility, a scripted pipeline launcher and a
//! session broker that can be switched off, plus helpers for waiting on
//! controller state.

#![allow(dead_code)]

use camerabridge_core::config::{RestartPolicy, ServiceConfig};
use camerabridge_core::controller::{
    ControllerStatus, PipelineChild, PipelineEvent, PipelineLauncher, ProcessControl,
    SessionNotifier,
};
use camerabridge_core::device::{DeviceFacility, DeviceProbe};
use camerabridge_core::error::{BridgeError, Result};
use camerabridge_core::session::{BrokerFuture, SessionBroker};
use camerabridge_core::types::{
    DeviceDescriptor, DeviceHandle, PipelineSpec, PipelineState, VirtualDeviceSpec,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, interval, sleep_until};

/// Interval between mock frame heartbeats
pub const FRAME_INTERVAL: Duration = Duration::from_millis(100);

/// Policy with short timers for tests
pub fn fast_policy() -> RestartPolicy {
    RestartPolicy {
        max_failures: 3,
        initial_backoff_ms: 100,
        max_backoff_secs: 1,
        reset_window_secs: 10,
        grace_period_ms: 1000,
        stall_timeout_ms: 2000,
        stop_timeout_ms: 500,
    }
}

/// Default config with the fast policy
pub fn test_config() -> ServiceConfig {
    ServiceConfig::default().with_restart_policy(fast_policy())
}

/// Wait until the controller reports a state
pub async fn wait_for_state(
    mut status: watch::Receiver<ControllerStatus>,
    state: PipelineState,
    timeout: Duration,
) -> ControllerStatus {
    tokio::time::timeout(timeout, status.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", state))
        .expect("status channel closed")
        .clone()
}

// ---------------------------------------------------------------------------
// Device facility
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FacilityState {
    module_loaded: bool,
    devices: HashMap<u32, DeviceProbe>,
    created: Vec<VirtualDeviceSpec>,
    removed: Vec<u32>,
}

/// In-memory stand-in for v4l2loopback
#[derive(Clone)]
pub struct MockFacility {
    state: Arc<Mutex<FacilityState>>,
}

impl MockFacility {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FacilityState {
                module_loaded: true,
                ..Default::default()
            })),
        }
    }

    /// Facility whose kernel module is absent
    pub fn unloaded() -> Self {
        let facility = Self::new();
        facility.state.lock().module_loaded = false;
        facility
    }

    /// Add a physically backed camera
    pub fn with_physical(self, index: u32, label: &str) -> Self {
        self.state.lock().devices.insert(
            index,
            DeviceProbe {
                label: label.to_string(),
                exclusive: None,
                is_virtual: false,
            },
        );
        self
    }

    /// Add a pre-existing virtual device
    pub fn with_virtual(self, index: u32, label: &str, exclusive: Option<bool>) -> Self {
        self.state.lock().devices.insert(
            index,
            DeviceProbe {
                label: label.to_string(),
                exclusive,
                is_virtual: true,
            },
        );
        self
    }

    pub fn created(&self) -> Vec<VirtualDeviceSpec> {
        self.state.lock().created.clone()
    }

    pub fn removed(&self) -> Vec<u32> {
        self.state.lock().removed.clone()
    }

    pub fn exists(&self, index: u32) -> bool {
        self.state.lock().devices.contains_key(&index)
    }

    pub fn boxed(&self) -> Box<dyn DeviceFacility> {
        Box::new(self.clone())
    }
}

impl DeviceFacility for MockFacility {
    fn check_available(&self) -> Result<()> {
        if self.state.lock().module_loaded {
            Ok(())
        } else {
            Err(BridgeError::device_create("v4l2loopback kernel module is not loaded"))
        }
    }

    fn probe(&self, index: u32) -> Result<Option<DeviceProbe>> {
        Ok(self.state.lock().devices.get(&index).cloned())
    }

    fn create(&self, spec: &VirtualDeviceSpec) -> Result<PathBuf> {
        let mut state = self.state.lock();
        state.devices.insert(
            spec.index,
            DeviceProbe {
                label: spec.label.clone(),
                exclusive: Some(spec.exclusive),
                is_virtual: true,
            },
        );
        state.created.push(spec.clone());
        Ok(spec.node())
    }

    fn remove(&self, index: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.devices.remove(&index);
        state.removed.push(index);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipeline launcher
// ---------------------------------------------------------------------------

/// Scripted behavior of one mock pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Frames until terminated
    Healthy,
    /// Frames, then exits with code 1 after the given time
    CrashAfter(Duration),
    /// The process cannot be started
    FailToLaunch,
    /// Alive but never produces frames
    Silent,
    /// Never produces frames, ignores graceful termination and only exits
    /// when killed
    Hung,
    /// Reports an error, then produces frames
    ErrorThenHealthy,
}

enum Signal {
    Terminate,
    Kill,
}

#[derive(Default)]
struct LauncherState {
    script: VecDeque<Behavior>,
    launched: Vec<PipelineSpec>,
}

/// Launcher that runs scripted fake pipelines
pub struct MockLauncher {
    state: Mutex<LauncherState>,
    fallback: Behavior,
    attempts: AtomicUsize,
    terminates: Arc<AtomicUsize>,
    kills: Arc<AtomicUsize>,
    next_pid: AtomicU32,
}

impl MockLauncher {
    /// Launcher playing `script` in order, repeating the last entry
    pub fn new(script: Vec<Behavior>) -> Arc<Self> {
        let fallback = script.last().copied().unwrap_or(Behavior::Healthy);
        Arc::new(Self {
            state: Mutex::new(LauncherState {
                script: script.into(),
                launched: Vec::new(),
            }),
            fallback,
            attempts: AtomicUsize::new(0),
            terminates: Arc::new(AtomicUsize::new(0)),
            kills: Arc::new(AtomicUsize::new(0)),
            next_pid: AtomicU32::new(4000),
        })
    }

    pub fn healthy() -> Arc<Self> {
        Self::new(vec![Behavior::Healthy])
    }

    /// Launch attempts, including ones that failed to start
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Specs of pipelines that actually started
    pub fn launched(&self) -> Vec<PipelineSpec> {
        self.state.lock().launched.clone()
    }

    pub fn terminates(&self) -> usize {
        self.terminates.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

impl PipelineLauncher for MockLauncher {
    fn launch(&self, spec: &PipelineSpec, _sink: &DeviceHandle) -> Result<PipelineChild> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let behavior = {
            let mut state = self.state.lock();
            state.script.pop_front().unwrap_or(self.fallback)
        };

        if behavior == Behavior::FailToLaunch {
            return Err(BridgeError::crash("Failed to start gst-launch-1.0: not found"));
        }
        self.state.lock().launched.push(spec.clone());

        let (event_tx, events) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_fake_pipeline(behavior, event_tx, signal_rx));

        Ok(PipelineChild {
            events,
            control: Box::new(MockControl {
                pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
                signals: signal_tx,
                terminates: self.terminates.clone(),
                kills: self.kills.clone(),
            }),
        })
    }
}

async fn run_fake_pipeline(
    behavior: Behavior,
    events: mpsc::UnboundedSender<PipelineEvent>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
) {
    let started = Instant::now();
    let crash_at = match behavior {
        Behavior::CrashAfter(after) => Some(started + after),
        _ => None,
    };
    let produces_frames = !matches!(behavior, Behavior::Silent | Behavior::Hung);

    if behavior == Behavior::ErrorThenHealthy {
        let _ = events.send(PipelineEvent::Error(
            "ERROR: from element icamerasrc0: Internal data stream error.".to_string(),
        ));
    }

    let mut frames = interval(FRAME_INTERVAL);
    loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                Some(Signal::Terminate) if behavior == Behavior::Hung => continue,
                Some(Signal::Terminate) => {
                    let _ = events.send(PipelineEvent::Exited(Some(0)));
                    return;
                }
                Some(Signal::Kill) | None => {
                    let _ = events.send(PipelineEvent::Exited(None));
                    return;
                }
            },
            _ = sleep_until(crash_at.unwrap_or(started)), if crash_at.is_some() => {
                let _ = events.send(PipelineEvent::Exited(Some(1)));
                return;
            }
            _ = frames.tick(), if produces_frames => {
                let _ = events.send(PipelineEvent::Frame);
            }
        }
    }
}

struct MockControl {
    pid: u32,
    signals: mpsc::UnboundedSender<Signal>,
    terminates: Arc<AtomicUsize>,
    kills: Arc<AtomicUsize>,
}

impl ProcessControl for MockControl {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn terminate(&mut self) -> Result<()> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        let _ = self.signals.send(Signal::Terminate);
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        let _ = self.signals.send(Signal::Kill);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session broker
// ---------------------------------------------------------------------------

/// Successful broker call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Publish { index: u32, active: bool },
    Unpublish(u32),
    Grant(String),
    Revoke(String),
}

/// Broker that records calls and can be taken offline
pub struct MockBroker {
    available: AtomicBool,
    fail_next: AtomicUsize,
    attempts: AtomicUsize,
    calls: Mutex<Vec<BrokerCall>>,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            available: AtomicBool::new(true),
            fail_next: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Broker that rejects every call
    pub fn offline() -> Arc<Self> {
        let broker = Self::new();
        broker.set_available(false);
        broker
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `n` calls
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Calls made, including failed ones
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Calls that succeeded
    pub fn calls(&self) -> Vec<BrokerCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: BrokerCall) -> BrokerFuture<'_, ()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = !self.available.load(Ordering::SeqCst)
            || self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

        let result = if failing {
            Err(BridgeError::broker("org.freedesktop.DBus.Error.ServiceUnknown"))
        } else {
            self.calls.lock().push(call);
            Ok(())
        };
        Box::pin(async move { result })
    }
}

impl SessionBroker for MockBroker {
    fn publish<'a>(&'a self, descriptor: &'a DeviceDescriptor) -> BrokerFuture<'a, ()> {
        self.record(BrokerCall::Publish {
            index: descriptor.index,
            active: descriptor.active,
        })
    }

    fn unpublish(&self, index: u32) -> BrokerFuture<'_, ()> {
        self.record(BrokerCall::Unpublish(index))
    }

    fn grant<'a>(&'a self, app: &'a str) -> BrokerFuture<'a, ()> {
        self.record(BrokerCall::Grant(app.to_string()))
    }

    fn revoke<'a>(&'a self, app: &'a str) -> BrokerFuture<'a, ()> {
        self.record(BrokerCall::Revoke(app.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Session notifier
// ---------------------------------------------------------------------------

/// Endpoint notification seen by [`RecordingNotifier`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Active(u32),
    Inactive(u32),
}

/// Notifier that remembers what the controller told it
#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seen(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }
}

impl SessionNotifier for RecordingNotifier {
    fn endpoint_active(&self, handle: &DeviceHandle, _descriptor: DeviceDescriptor) {
        self.seen.lock().push(Notification::Active(handle.index()));
    }

    fn endpoint_inactive(&self, index: u32) {
        self.seen.lock().push(Notification::Inactive(index));
    }
}
