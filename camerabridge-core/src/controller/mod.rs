//! Capture pipeline controller
//!
//! Owns the lifecycle of the frame-producing pipeline. A supervisor task
//! launches the pipeline, watches its events, and restarts it with
//! exponential backoff until the restart budget is exhausted.
//!
//! State transitions:
//!
//! ```text
//! Stopped -> Starting -> Running <-> Degraded
//!               ^           |          |
//!               +-- restart-+----------+--> FailedPermanently
//! ```
//!
//! The composite [`ControllerStatus`] lives in a single watch channel, so
//! readers always see a consistent snapshot.

mod process;

pub use process::{
    GstLauncher, PipelineChild, PipelineEvent, PipelineLauncher, ProcessControl, classify_line,
};

use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, error, info, warn};

use crate::config::RestartPolicy;
use crate::device::DeviceManager;
use crate::error::{BridgeError, Result};
use crate::types::{DeviceDescriptor, DeviceHandle, PipelineSpec, PipelineState};

/// Extra time granted to the supervisor on top of the termination budget
const STOP_MARGIN: Duration = Duration::from_secs(1);

/// Stand-in for deadlines that do not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `from + after`, saturating to [`FAR_FUTURE`] on overflow
fn deadline(from: Instant, after: Duration) -> Instant {
    from.checked_add(after).unwrap_or_else(|| from + FAR_FUTURE)
}

/// Receives endpoint activity changes from the controller
///
/// Calls are made from the supervisor task and must not block.
pub trait SessionNotifier: Send + Sync {
    /// Frames are flowing into the endpoint
    fn endpoint_active(&self, handle: &DeviceHandle, descriptor: DeviceDescriptor);

    /// The endpoint stopped receiving frames
    fn endpoint_inactive(&self, index: u32);
}

/// Snapshot of the controller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerStatus {
    pub state: PipelineState,
    /// Most recent pipeline error, kept after recovery
    pub last_error: Option<String>,
    /// Consecutive failures in the current reset window
    pub failures: u32,
    /// Pipeline launches since the controller was created
    pub launches: u64,
    /// Process id of the running pipeline
    pub pid: Option<u32>,
}

struct ActiveRun {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    sink: DeviceHandle,
}

/// Starts, stops and supervises the capture pipeline
pub struct PipelineController {
    devices: Arc<DeviceManager>,
    policy: SyncMutex<RestartPolicy>,
    launcher: Arc<dyn PipelineLauncher>,
    notifier: Arc<dyn SessionNotifier>,
    status: Arc<watch::Sender<ControllerStatus>>,
    run: Mutex<Option<ActiveRun>>,
}

impl PipelineController {
    /// Create a stopped controller
    pub fn new(
        devices: Arc<DeviceManager>,
        policy: RestartPolicy,
        launcher: Arc<dyn PipelineLauncher>,
        notifier: Arc<dyn SessionNotifier>,
    ) -> Self {
        let (status, _) = watch::channel(ControllerStatus::default());
        Self {
            devices,
            policy: SyncMutex::new(policy),
            launcher,
            notifier,
            status: Arc::new(status),
            run: Mutex::new(None),
        }
    }

    /// Replace the restart policy used by the next [`start`](Self::start)
    pub fn set_policy(&self, policy: RestartPolicy) {
        *self.policy.lock() = policy;
    }

    /// Current restart policy
    pub fn policy(&self) -> RestartPolicy {
        *self.policy.lock()
    }

    /// Attach to `sink` and launch the pipeline
    ///
    /// Returns once the transition to `Starting` is accepted. Fails with
    /// [`BridgeError::AlreadyRunning`] while a supervisor is active and with
    /// [`BridgeError::DeviceBusy`] if another producer holds the sink.
    pub async fn start(&self, pipeline: PipelineSpec, sink: DeviceHandle) -> Result<()> {
        let mut run = self.run.lock().await;

        if let Some(active) = run.as_ref() {
            if !active.task.is_finished() {
                return Err(BridgeError::AlreadyRunning);
            }
        }
        if let Some(finished) = run.take() {
            // Supervisor gave up; it has already detached its sink
            let _ = finished.task.await;
        }

        self.devices.attach(&sink)?;

        self.status.send_modify(|s| {
            s.state = PipelineState::Starting;
            s.last_error = None;
            s.failures = 0;
            s.pid = None;
        });
        info!(
            "Starting pipeline into {} ({})",
            sink.node.display(),
            pipeline.output
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let supervisor = Supervisor {
            spec: pipeline,
            sink: sink.clone(),
            policy: self.policy(),
            devices: self.devices.clone(),
            launcher: self.launcher.clone(),
            notifier: self.notifier.clone(),
            status: self.status.clone(),
            stop: stop_rx,
        };
        let task = tokio::spawn(supervisor.run());

        *run = Some(ActiveRun {
            stop_tx,
            task,
            sink,
        });
        Ok(())
    }

    /// Stop the pipeline and detach from the sink
    ///
    /// The child gets the stop timeout to exit after a graceful request and
    /// is then killed. Returns once the controller is `Stopped`.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        let Some(active) = run.take() else {
            debug!("Stop requested with no pipeline");
            return;
        };

        let _ = active.stop_tx.send(true);
        let budget = self.policy().stop_timeout().saturating_mul(2).saturating_add(STOP_MARGIN);
        let mut task = active.task;
        if tokio::time::timeout(budget, &mut task).await.is_err() {
            error!("Pipeline supervisor did not finish within {:?}, aborting", budget);
            task.abort();
        }

        self.devices.detach(&active.sink);
        self.status.send_modify(|s| {
            s.state = PipelineState::Stopped;
            s.pid = None;
        });
        info!("Pipeline stopped");
    }

    /// Current pipeline state
    pub fn health_check(&self) -> PipelineState {
        self.status.borrow().state
    }

    /// Snapshot of the full controller status
    pub fn status(&self) -> ControllerStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.status.subscribe()
    }
}

/// Why a single pipeline run ended
enum RunOutcome {
    Stopped,
    Failed(BridgeError),
}

struct Supervisor {
    spec: PipelineSpec,
    sink: DeviceHandle,
    policy: RestartPolicy,
    devices: Arc<DeviceManager>,
    launcher: Arc<dyn PipelineLauncher>,
    notifier: Arc<dyn SessionNotifier>,
    status: Arc<watch::Sender<ControllerStatus>>,
    stop: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self) {
        let gave_up = self.supervise().await;
        self.devices.detach(&self.sink);

        if let Some((failures, cause)) = gave_up {
            let err = BridgeError::PermanentFailure { failures };
            error!("{} (last error: {})", err, cause);
            self.status.send_modify(|s| {
                s.state = PipelineState::FailedPermanently;
                s.failures = failures;
                s.pid = None;
                s.last_error = Some(format!("{} (last error: {})", err, cause));
            });
        }
    }

    /// Run and restart the pipeline until stopped or out of restarts
    ///
    /// Returns the failure count and last error when giving up.
    async fn supervise(&mut self) -> Option<(u32, BridgeError)> {
        let mut failures = 0u32;

        loop {
            let outcome = self.run_once(&mut failures).await;
            self.status.send_modify(|s| s.pid = None);

            let err = match outcome {
                RunOutcome::Stopped => return None,
                RunOutcome::Failed(err) => err,
            };

            failures += 1;
            if failures >= self.policy.max_failures {
                return Some((failures, err));
            }

            let delay = self.policy.backoff(failures);
            warn!(
                "{}; restarting in {:?} (failure {}/{})",
                err, delay, failures, self.policy.max_failures
            );
            self.status.send_modify(|s| {
                s.state = PipelineState::Degraded;
                s.failures = failures;
                s.last_error = Some(err.to_string());
            });

            tokio::select! {
                _ = sleep(delay) => {}
                _ = stop_requested(&mut self.stop) => return None,
            }
        }
    }

    async fn run_once(&mut self, failures: &mut u32) -> RunOutcome {
        if *self.stop.borrow() {
            return RunOutcome::Stopped;
        }

        let mut child = match self.launcher.launch(&self.spec, &self.sink) {
            Ok(child) => child,
            Err(e) => return RunOutcome::Failed(e),
        };

        let pid = child.control.pid();
        self.status.send_modify(|s| {
            s.state = PipelineState::Starting;
            s.launches += 1;
            s.pid = pid;
        });

        let started = Instant::now();
        let grace_deadline = deadline(started, self.policy.grace_period());
        let mut last_frame = started;
        let mut state = PipelineState::Starting;
        let mut reset_deadline: Option<Instant> = None;

        loop {
            let stall_deadline = deadline(last_frame, self.policy.stall_timeout());

            tokio::select! {
                _ = stop_requested(&mut self.stop) => {
                    self.leave_running(state);
                    self.shutdown_child(&mut child).await;
                    return RunOutcome::Stopped;
                }
                event = child.events.recv() => match event {
                    Some(PipelineEvent::Frame) => {
                        last_frame = Instant::now();
                        if state != PipelineState::Running {
                            state = self.enter_running(&mut reset_deadline, "frames flowing");
                        }
                    }
                    Some(PipelineEvent::Error(message)) => {
                        warn!("Pipeline reported an error: {}", message);
                        self.leave_running(state);
                        state = PipelineState::Degraded;
                        reset_deadline = None;
                        self.status.send_modify(|s| {
                            s.state = PipelineState::Degraded;
                            s.last_error = Some(message);
                        });
                    }
                    Some(PipelineEvent::Exited(code)) => {
                        self.leave_running(state);
                        let how = match code {
                            Some(code) => format!("pipeline exited with code {}", code),
                            None => "pipeline was terminated by a signal".to_string(),
                        };
                        return RunOutcome::Failed(BridgeError::crash(how));
                    }
                    None => {
                        self.leave_running(state);
                        return RunOutcome::Failed(BridgeError::crash("pipeline event stream closed"));
                    }
                },
                _ = sleep_until(grace_deadline), if state == PipelineState::Starting => {
                    state = self.enter_running(&mut reset_deadline, "grace period elapsed without errors");
                }
                _ = sleep_until(stall_deadline) => {
                    let timeout = self.policy.stall_timeout();
                    self.leave_running(state);
                    self.shutdown_child(&mut child).await;
                    return RunOutcome::Failed(BridgeError::PipelineStalled(timeout));
                }
                _ = sleep_until(reset_deadline.unwrap_or(started)), if reset_deadline.is_some() => {
                    reset_deadline = None;
                    if *failures > 0 {
                        info!(
                            "Pipeline ran for {:?}, clearing {} failure(s)",
                            self.policy.reset_window(),
                            failures
                        );
                        *failures = 0;
                        self.status.send_modify(|s| s.failures = 0);
                    }
                }
            }
        }
    }

    fn enter_running(&self, reset_deadline: &mut Option<Instant>, reason: &str) -> PipelineState {
        info!("Pipeline running ({})", reason);
        *reset_deadline = Some(deadline(Instant::now(), self.policy.reset_window()));
        self.status.send_modify(|s| s.state = PipelineState::Running);
        self.notifier
            .endpoint_active(&self.sink, DeviceDescriptor::new(&self.sink, self.spec.output));
        PipelineState::Running
    }

    fn leave_running(&self, state: PipelineState) {
        if state == PipelineState::Running {
            self.notifier.endpoint_inactive(self.sink.index());
        }
    }

    /// Terminate the child, escalating to a kill after the stop timeout
    async fn shutdown_child(&self, child: &mut PipelineChild) {
        let timeout = self.policy.stop_timeout();

        if let Err(e) = child.control.terminate() {
            warn!("Failed to signal pipeline: {}", e);
        }
        if wait_for_exit(child, timeout).await {
            debug!("Pipeline exited after termination request");
            return;
        }

        warn!("Pipeline ignored termination for {:?}, killing it", timeout);
        if let Err(e) = child.control.kill() {
            warn!("Failed to kill pipeline: {}", e);
        }
        if !wait_for_exit(child, timeout).await {
            error!("Pipeline did not exit after being killed");
        }
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    // A dropped sender also counts as a stop request
    let _ = stop.wait_for(|stop| *stop).await;
}

async fn wait_for_exit(child: &mut PipelineChild, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, async {
        while let Some(event) = child.events.recv().await {
            if let PipelineEvent::Exited(_) = event {
                break;
            }
        }
    })
    .await
    .is_ok()
}
