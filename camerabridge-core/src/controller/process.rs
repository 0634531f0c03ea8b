//! Pipeline child processes
//!
//! The vendor camera pipeline runs as a `gst-launch-1.0` child process. Its
//! output is watched for a per-buffer heartbeat from an `identity` element
//! and for error messages; those become [`PipelineEvent`]s for the controller.

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::ToolSettings;
use crate::error::{BridgeError, Result};
use crate::types::{DeviceHandle, PipelineSpec};

/// Name of the identity element that reports buffers
const PROBE_NAME: &str = "bridgeprobe";

/// Minimum spacing between forwarded frame heartbeats
const FRAME_EVENT_INTERVAL: Duration = Duration::from_millis(250);

/// Time allowed for output readers to drain after the child exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Something observed about a running pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Frames are flowing
    Frame,
    /// The pipeline reported an error but may still be alive
    Error(String),
    /// The process exited (exit code, if it exited normally)
    Exited(Option<i32>),
}

/// Termination control over a launched pipeline
pub trait ProcessControl: Send {
    /// OS process id, if known
    fn pid(&self) -> Option<u32>;

    /// Ask the pipeline to shut down gracefully
    fn terminate(&mut self) -> Result<()>;

    /// Force the pipeline to stop
    fn kill(&mut self) -> Result<()>;
}

/// A launched pipeline
pub struct PipelineChild {
    /// Events from the pipeline; `Exited` is always the last event
    pub events: mpsc::UnboundedReceiver<PipelineEvent>,
    /// Termination control
    pub control: Box<dyn ProcessControl>,
}

/// Launches frame-producing pipelines into a virtual device
pub trait PipelineLauncher: Send + Sync {
    /// Start a pipeline writing into `sink`
    ///
    /// Must be called from within a tokio runtime.
    fn launch(&self, spec: &PipelineSpec, sink: &DeviceHandle) -> Result<PipelineChild>;
}

/// Launches pipelines with `gst-launch-1.0`
pub struct GstLauncher {
    program: String,
    source_element: String,
}

impl GstLauncher {
    /// Create a launcher from tool settings
    pub fn new(tools: &ToolSettings) -> Self {
        Self {
            program: tools.gst_launch.clone(),
            source_element: tools.source_element.clone(),
        }
    }

    /// Build the gst-launch argument list for a pipeline
    pub fn arguments(&self, spec: &PipelineSpec, sink: &DeviceHandle) -> Vec<String> {
        let input = &spec.input;
        let output = &spec.output;

        let mut args = vec!["-e".to_string(), "-v".to_string(), self.source_element.clone()];
        args.extend(spec.source_params.iter().map(|(k, v)| format!("{}={}", k, v)));
        args.push("!".into());
        args.push(format!(
            "video/x-raw,format={},width={},height={}",
            input.encoding.gst_name(),
            input.width,
            input.height
        ));
        for element in ["videoconvert", "videoscale", "videorate"] {
            args.push("!".into());
            args.push(element.into());
        }
        args.push("!".into());
        args.push(format!(
            "video/x-raw,format={},width={},height={},framerate={}/1",
            output.encoding.gst_name(),
            output.width,
            output.height,
            output.framerate
        ));
        args.push("!".into());
        args.extend([
            "identity".to_string(),
            format!("name={}", PROBE_NAME),
            "silent=false".to_string(),
        ]);
        args.push("!".into());
        args.extend([
            "v4l2sink".to_string(),
            format!("device={}", sink.node.display()),
            "sync=false".to_string(),
        ]);
        args
    }
}

impl PipelineLauncher for GstLauncher {
    fn launch(&self, spec: &PipelineSpec, sink: &DeviceHandle) -> Result<PipelineChild> {
        let args = self.arguments(spec, sink);
        debug!("Launching {} {}", self.program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::crash(format!("Failed to start {}: {}", self.program, e)))?;

        let pid = child.id();
        info!("Pipeline started (pid {:?}) into {}", pid, sink.node.display());

        let (event_tx, events) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, event_tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, event_tx.clone())));
        }

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill pipeline: {}", e);
                    }
                    child.wait().await
                }
            };

            for reader in readers {
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader).await;
            }

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed to wait for pipeline: {}", e);
                    None
                }
            };
            debug!("Pipeline exited with code {:?}", code);
            let _ = event_tx.send(PipelineEvent::Exited(code));
        });

        Ok(PipelineChild {
            events,
            control: Box::new(GstProcess {
                pid,
                kill_tx: Some(kill_tx),
            }),
        })
    }
}

struct GstProcess {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessControl for GstProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&mut self) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        // gst-launch -e turns SIGINT into an end-of-stream and exits cleanly
        // SAFETY: kill() has no memory-safety preconditions; a stale pid only
        // yields ESRCH.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}

async fn forward_lines<R>(stream: R, tx: mpsc::UnboundedSender<PipelineEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    let mut last_frame: Option<Instant> = None;

    while let Ok(Some(line)) = lines.next_line().await {
        trace!("pipeline: {}", line);
        let Some(event) = classify_line(&line) else {
            continue;
        };
        if event == PipelineEvent::Frame {
            let now = Instant::now();
            if last_frame.is_some_and(|t| now.duration_since(t) < FRAME_EVENT_INTERVAL) {
                continue;
            }
            last_frame = Some(now);
        }
        if tx.send(event).is_err() {
            break;
        }
    }
}

/// Turn a line of gst-launch output into an event
pub fn classify_line(line: &str) -> Option<PipelineEvent> {
    let line = line.trim();
    if line.contains(PROBE_NAME) && line.contains("last-message") {
        Some(PipelineEvent::Frame)
    } else if line.starts_with("ERROR:") {
        Some(PipelineEvent::Error(line.to_string()))
    } else {
        if line.starts_with("WARNING:") {
            debug!("Pipeline warning: {}", line);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Handle, VirtualDeviceSpec};

    fn sink() -> DeviceHandle {
        let spec = VirtualDeviceSpec::new(99, "Integrated Camera", true);
        DeviceHandle {
            id: Handle::new(),
            node: spec.node(),
            spec,
        }
    }

    #[test]
    fn test_arguments_describe_full_pipeline() {
        let launcher = GstLauncher::new(&ToolSettings::default());
        let args = launcher.arguments(&PipelineSpec::default(), &sink());
        let joined = args.join(" ");

        assert!(joined.starts_with("-e -v icamerasrc buffer-count=7 !"));
        assert!(joined.contains("video/x-raw,format=NV12,width=1280,height=720"));
        assert!(joined.contains("video/x-raw,format=YUY2,width=1280,height=720,framerate=30/1"));
        assert!(joined.contains("identity name=bridgeprobe silent=false"));
        assert!(joined.ends_with("v4l2sink device=/dev/video99 sync=false"));
    }

    #[test]
    fn test_classify_heartbeat() {
        let line = "/GstPipeline:pipeline0/GstIdentity:bridgeprobe: last-message = chain   ******* (bridgeprobe:sink) (1843200 bytes, dts: none, pts: 0:00:01.2)";
        assert_eq!(classify_line(line), Some(PipelineEvent::Frame));
    }

    #[test]
    fn test_classify_error() {
        let line = "ERROR: from element /GstPipeline:pipeline0/GstICameraSrc:icamerasrc0: Internal data stream error.";
        assert!(matches!(classify_line(line), Some(PipelineEvent::Error(_))));
    }

    #[test]
    fn test_classify_ignores_noise() {
        assert_eq!(classify_line("Setting pipeline to PLAYING ..."), None);
        assert_eq!(classify_line("WARNING: erroneous pipeline"), None);
    }
}
