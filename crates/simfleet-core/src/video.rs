//! Simulator screen recording.
//!
//! Unlike log capture, recording is strict: starting twice fails with
//! [`CaptureError::AlreadyRunning`] and stopping an idle recorder fails with
//! [`CaptureError::NotRunning`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::capture::{remove_local, CaptureError, CaptureKind, CaptureSpec, CaptureSupervisor};
use crate::device::DeviceRef;
use crate::remote::RemoteExecutor;

/// Time `recordVideo` gets to finalize the movie after SIGINT.
pub const FINALIZE_GRACE: Duration = Duration::from_secs(10);

/// Records one simulator's screen into a movie on the device host.
pub struct VideoRecorder {
    supervisor: CaptureSupervisor,
    video_dir: PathBuf,
    log_dir: PathBuf,
    finalize_grace: Duration,
}

impl VideoRecorder {
    /// `video_dir` is on the device host; `log_dir` is local and receives the
    /// recorder's own output.
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        device: DeviceRef,
        video_dir: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            supervisor: CaptureSupervisor::new(executor, device, CaptureKind::Video),
            video_dir: video_dir.into(),
            log_dir: log_dir.into(),
            finalize_grace: FINALIZE_GRACE,
        }
    }

    pub fn with_finalize_grace(mut self, grace: Duration) -> Self {
        self.finalize_grace = grace;
        self
    }

    pub fn device(&self) -> &DeviceRef {
        self.supervisor.device()
    }

    /// Movie path on the device host.
    pub fn video_path(&self) -> PathBuf {
        self.video_dir.join(format!("{}.mp4", self.device()))
    }

    fn log_path(&self, ext: &str) -> PathBuf {
        self.log_dir.join(format!("{}_video.{ext}", self.device()))
    }

    pub async fn is_recording(&self) -> bool {
        self.supervisor.is_active().await
    }

    fn spec(&self) -> CaptureSpec {
        let udid = self.device().as_str();
        let video = self.video_path();
        let video_str = video.to_string_lossy();
        CaptureSpec::new(
            [
                "xcrun",
                "simctl",
                "io",
                udid,
                "recordVideo",
                "--codec=h264",
                "--force",
                &*video_str,
            ],
            self.log_path("log"),
            self.log_path("err"),
        )
        .with_host_output(video.clone())
        .with_interrupt(format!("recordVideo.*{}", video_str), self.finalize_grace)
    }

    /// Starts recording.
    ///
    /// # Errors
    ///
    /// [`CaptureError::AlreadyRunning`] while a recording is in progress.
    pub async fn start(&self) -> Result<(), CaptureError> {
        if self.is_recording().await {
            return Err(CaptureError::AlreadyRunning {
                device: self.device().clone(),
                kind: CaptureKind::Video,
            });
        }
        let dir = self.video_dir.to_string_lossy();
        self.supervisor
            .executor()
            .run_checked(&["mkdir", "-p", &*dir])
            .await?;
        self.supervisor.start(self.spec()).await
    }

    /// Stops recording and waits for the movie to be finalized.
    ///
    /// # Errors
    ///
    /// [`CaptureError::NotRunning`] when nothing is recording.
    pub async fn stop(&self) -> Result<(), CaptureError> {
        self.supervisor.stop().await
    }

    /// Bytes of the last finished recording.
    pub async fn content(&self) -> Result<Vec<u8>, CaptureError> {
        self.supervisor
            .executor()
            .capture_file(&self.video_path())
            .await
            .map_err(|e| CaptureError::Unreadable {
                device: self.device().clone(),
                kind: CaptureKind::Video,
                stderr: e.to_string(),
            })
    }

    /// Removes the recording and the recorder's logs.
    ///
    /// # Errors
    ///
    /// [`CaptureError::AlreadyRunning`] while recording.
    pub async fn delete(&self) -> Result<(), CaptureError> {
        if self.is_recording().await {
            return Err(CaptureError::AlreadyRunning {
                device: self.device().clone(),
                kind: CaptureKind::Video,
            });
        }
        let video = self.video_path();
        let video_str = video.to_string_lossy();
        self.supervisor
            .executor()
            .run_checked(&["rm", "-f", &*video_str])
            .await?;
        for log in [self.log_path("log"), self.log_path("err")] {
            remove_local(&log).await?;
        }
        info!(device = %self.device(), "video deleted");
        Ok(())
    }
}
