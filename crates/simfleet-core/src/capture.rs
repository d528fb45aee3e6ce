//! Supervised long-running capture processes (logs, video).
//!
//! A [`CaptureSupervisor`] owns at most one capture session for one device and
//! one [`CaptureKind`]. A session is a child process started through the
//! device's [`RemoteExecutor`] plus two writer tasks draining its stdout and
//! stderr into local files. All three hang off one [`CancellationToken`]:
//! cancelling the session interrupts and destroys the child, lets the writers
//! drain what the child already wrote, and cancels any writer still running
//! after a short grace period. No writer can outlive its process.
//!
//! # Start/stop policy
//!
//! The kinds deliberately disagree on idempotency:
//!
//! | kind                    | start while running | stop while idle |
//! |-------------------------|---------------------|-----------------|
//! | `SystemLog`/`DeviceLog` | restarts            | no-op           |
//! | `Video`                 | `AlreadyRunning`    | `NotRunning`    |
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use simfleet_core::capture::{CaptureKind, CaptureSpec, CaptureSupervisor};
//! use simfleet_core::device::DeviceRef;
//! use simfleet_core::remote::HostExecutor;
//!
//! # async fn example() -> Result<(), simfleet_core::capture::CaptureError> {
//! let supervisor = CaptureSupervisor::new(
//!     Arc::new(HostExecutor::local()),
//!     DeviceRef::new("SIM-1"),
//!     CaptureKind::SystemLog,
//! );
//! let spec = CaptureSpec::new(
//!     ["xcrun", "simctl", "spawn", "SIM-1", "log", "stream"],
//!     "/tmp/captures/SIM-1.log",
//!     "/tmp/captures/SIM-1.err",
//! );
//! supervisor.start(spec).await?;
//! tokio::time::sleep(Duration::from_secs(5)).await;
//! supervisor.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::device::DeviceRef;
use crate::remote::{shell_quote, ExecError, ProcessHandle, RemoteExecutor};

/// How long writers may keep draining after their process is gone.
const WRITER_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Default wait between interrupting a child and destroying it.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Kinds and errors
// ---------------------------------------------------------------------------

/// What a capture session records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    /// Simulator system log (`log stream` inside the simulator).
    SystemLog,
    /// Physical device syslog relay.
    DeviceLog,
    /// Screen recording.
    Video,
}

impl CaptureKind {
    /// Starting while a session runs replaces it (`true`) or fails (`false`).
    pub fn restarts_on_start(self) -> bool {
        !matches!(self, CaptureKind::Video)
    }

    /// Stopping with no session is an error.
    pub fn stop_requires_session(self) -> bool {
        matches!(self, CaptureKind::Video)
    }

    pub fn label(self) -> &'static str {
        match self {
            CaptureKind::SystemLog => "syslog",
            CaptureKind::DeviceLog => "devicelog",
            CaptureKind::Video => "video",
        }
    }
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors from capture sessions.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// A session is already running and this kind does not restart.
    #[error("{kind} capture already running for {device}")]
    AlreadyRunning { device: DeviceRef, kind: CaptureKind },

    /// No session is running and this kind requires one.
    #[error("{kind} capture not running for {device}")]
    NotRunning { device: DeviceRef, kind: CaptureKind },

    /// The capture process could not be started.
    #[error("failed to start {kind} capture for {device}: {source}")]
    Start {
        device: DeviceRef,
        kind: CaptureKind,
        #[source]
        source: ExecError,
    },

    /// Captured output could not be read back.
    #[error("cannot read {kind} capture for {device}: {stderr}")]
    Unreadable {
        device: DeviceRef,
        kind: CaptureKind,
        stderr: String,
    },

    /// The executor failed outside of process start.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Local output files could not be prepared.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// CaptureSpec
// ---------------------------------------------------------------------------

/// Everything needed to launch one capture session.
#[derive(Debug, Clone)]
pub struct CaptureSpec {
    /// Argument vector run on the device host.
    pub command: Vec<String>,
    /// Extra environment for the command.
    pub env: Vec<(String, String)>,
    /// Local file receiving the child's stdout. Overwritten on start.
    pub stdout_path: PathBuf,
    /// Local file receiving the child's stderr. Overwritten on start.
    pub stderr_path: PathBuf,
    /// Files on the device host removed before the child starts.
    pub host_outputs: Vec<PathBuf>,
    /// `pkill -INT -f` pattern sent before the child is destroyed, so tools
    /// that finalize output on SIGINT get the chance to.
    pub interrupt_pattern: Option<String>,
    /// Wait after the interrupt before destroying the child.
    pub stop_grace: Duration,
}

impl CaptureSpec {
    pub fn new<I, S>(command: I, stdout_path: impl Into<PathBuf>, stderr_path: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            stdout_path: stdout_path.into(),
            stderr_path: stderr_path.into(),
            host_outputs: Vec::new(),
            interrupt_pattern: None,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_host_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_outputs.push(path.into());
        self
    }

    pub fn with_interrupt(mut self, pattern: impl Into<String>, grace: Duration) -> Self {
        self.interrupt_pattern = Some(pattern.into());
        self.stop_grace = grace;
        self
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// A running session: the token that ends it and the task supervising it.
struct ActiveSession {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
}

impl ActiveSession {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Lifecycle of one device's capture process of one kind.
pub struct CaptureSupervisor {
    executor: Arc<dyn RemoteExecutor>,
    device: DeviceRef,
    kind: CaptureKind,
    session: Mutex<Option<ActiveSession>>,
}

impl CaptureSupervisor {
    pub fn new(executor: Arc<dyn RemoteExecutor>, device: DeviceRef, kind: CaptureKind) -> Self {
        Self {
            executor,
            device,
            kind,
            session: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> CaptureKind {
        self.kind
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn executor(&self) -> &Arc<dyn RemoteExecutor> {
        &self.executor
    }

    /// `true` while a session's process is running.
    pub async fn is_active(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(ActiveSession::is_running)
    }

    /// Process id of the current session's child.
    pub async fn pid(&self) -> Option<u32> {
        self.session.lock().await.as_ref().and_then(|s| s.pid)
    }

    /// When the current session started.
    pub async fn started_at(&self) -> Option<DateTime<Utc>> {
        self.session.lock().await.as_ref().map(|s| s.started_at)
    }

    /// Local stdout/stderr files of the current session.
    pub async fn output_paths(&self) -> Option<(PathBuf, PathBuf)> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| (s.stdout_path.clone(), s.stderr_path.clone()))
    }

    /// Starts a session.
    ///
    /// If a session is running, log kinds stop it first; [`CaptureKind::Video`]
    /// fails with [`CaptureError::AlreadyRunning`]. Previous output files are
    /// removed before the process is spawned.
    pub async fn start(&self, spec: CaptureSpec) -> Result<(), CaptureError> {
        let mut slot = self.session.lock().await;

        if let Some(active) = slot.take() {
            if active.is_running() {
                if !self.kind.restarts_on_start() {
                    *slot = Some(active);
                    return Err(CaptureError::AlreadyRunning {
                        device: self.device.clone(),
                        kind: self.kind,
                    });
                }
                debug!(device = %self.device, kind = %self.kind, "restarting capture");
                Self::shut_down(active).await;
            }
        }

        self.clear_outputs(&spec).await?;

        let stdout_file = tokio::fs::File::create(&spec.stdout_path).await?;
        let stderr_file = tokio::fs::File::create(&spec.stderr_path).await?;

        let args: Vec<&str> = spec.command.iter().map(String::as_str).collect();
        let env: Vec<(&str, &str)> = spec
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let mut process = self
            .executor
            .start_process(&args, &env)
            .await
            .map_err(|source| CaptureError::Start {
                device: self.device.clone(),
                kind: self.kind,
                source,
            })?;

        let cancel = CancellationToken::new();
        // Separate from `cancel`: writers drain until EOF after the child dies.
        let writer_cancel = CancellationToken::new();
        let mut writers = JoinSet::new();
        if let Some(stdout) = process.take_stdout() {
            writers.spawn(drain(stdout, stdout_file, spec.stdout_path.clone(), writer_cancel.clone()));
        }
        if let Some(stderr) = process.take_stderr() {
            writers.spawn(drain(stderr, stderr_file, spec.stderr_path.clone(), writer_cancel.clone()));
        }

        let pid = process.pid();
        let span = info_span!("capture", device = %self.device, kind = %self.kind);
        let task = tokio::spawn(
            supervise(
                process,
                writers,
                cancel.clone(),
                writer_cancel,
                self.executor.clone(),
                spec.interrupt_pattern.clone(),
                spec.stop_grace,
            )
            .instrument(span),
        );

        info!(device = %self.device, kind = %self.kind, pid = ?pid, "capture started");
        *slot = Some(ActiveSession {
            cancel,
            task,
            pid,
            started_at: Utc::now(),
            stdout_path: spec.stdout_path,
            stderr_path: spec.stderr_path,
        });
        Ok(())
    }

    /// Stops the current session and waits until its process and writers
    /// are gone.
    ///
    /// With no session this is a no-op for log kinds and
    /// [`CaptureError::NotRunning`] for [`CaptureKind::Video`].
    pub async fn stop(&self) -> Result<(), CaptureError> {
        let active = self.session.lock().await.take();
        match active {
            Some(active) => {
                Self::shut_down(active).await;
                info!(device = %self.device, kind = %self.kind, "capture stopped");
                Ok(())
            }
            None if self.kind.stop_requires_session() => Err(CaptureError::NotRunning {
                device: self.device.clone(),
                kind: self.kind,
            }),
            None => Ok(()),
        }
    }

    async fn shut_down(mut active: ActiveSession) {
        active.cancel.cancel();
        if let Err(e) = (&mut active.task).await {
            warn!(error = %e, "capture supervisor task failed");
        }
    }

    async fn clear_outputs(&self, spec: &CaptureSpec) -> Result<(), CaptureError> {
        for local in [&spec.stdout_path, &spec.stderr_path] {
            match tokio::fs::remove_file(local).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        for remote in &spec.host_outputs {
            let path = remote.to_string_lossy();
            self.executor.run_checked(&["rm", "-f", &*path]).await?;
        }
        Ok(())
    }
}

/// Copies one output stream into its file until EOF or cancellation.
async fn drain<R>(
    mut stream: R,
    mut file: tokio::fs::File,
    path: PathBuf,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let copied = tokio::select! {
        result = tokio::io::copy(&mut stream, &mut file) => result,
        _ = cancel.cancelled() => Ok(0),
    };
    if let Err(e) = copied {
        warn!(path = %path.display(), error = %e, "capture writer failed");
    }
    if let Err(e) = file.flush().await {
        warn!(path = %path.display(), error = %e, "capture writer flush failed");
    }
}

/// Owns the child for the lifetime of a session.
async fn supervise(
    mut process: ProcessHandle,
    mut writers: JoinSet<()>,
    cancel: CancellationToken,
    writer_cancel: CancellationToken,
    executor: Arc<dyn RemoteExecutor>,
    interrupt_pattern: Option<String>,
    stop_grace: Duration,
) {
    let exited = tokio::select! {
        _ = cancel.cancelled() => false,
        status = process.wait() => {
            debug!(status = ?status, "capture process exited on its own");
            true
        }
    };

    if !exited {
        if let Some(pattern) = interrupt_pattern {
            let line = format!("pkill -INT -f {}", shell_quote(&pattern));
            if let Err(e) = executor.shell(&line, true).await {
                warn!(error = %e, "failed to interrupt capture process");
            }
            let _ = tokio::time::timeout(stop_grace, process.wait()).await;
        }
        if let Err(e) = process.kill().await {
            warn!(error = %e, "failed to kill capture process");
        }
    }

    let drained = tokio::time::timeout(WRITER_DRAIN_GRACE, async {
        while writers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        writer_cancel.cancel();
        while writers.join_next().await.is_some() {}
    }
}

/// Removes a local capture file, ignoring a missing file.
pub(crate) async fn remove_local(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
