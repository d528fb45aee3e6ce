//! Device identity and per-device facilities.
//!
//! [`DeviceRef`] is the opaque key used for pool lookups, backup paths and
//! capture bookkeeping. [`DeviceHandle`] bundles everything a client may do
//! with one acquired device: its app and shared data containers, its backup
//! store, log capture and screen recording. Each facility is created on first
//! use and they all share the executor bound to the device's host.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::backup::{BackupStore, DEFAULT_COPY_TIMEOUT};
use crate::config::FleetConfig;
use crate::container::FilesystemContainer;
use crate::remote::RemoteExecutor;
use crate::simctl::{Simctl, SimctlError};
use crate::syslog::LogCapture;
use crate::video::VideoRecorder;

/// Stable identifier of a simulator or physical device (its UDID).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceRef(String);

impl DeviceRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceRef {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceRef {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for DeviceRef {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Simulator or physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Simulator,
    Physical,
}

/// Errors from creating a device facility.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The data directory or app container could not be located.
    #[error("cannot locate data for {device}: {source}")]
    Locate {
        device: DeviceRef,
        #[source]
        source: SimctlError,
    },

    /// The facility does not exist for this kind of device.
    #[error("{facility} is not available on physical device {device}")]
    Unsupported {
        device: DeviceRef,
        facility: &'static str,
    },
}

/// Where a device's facilities keep their files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLayout {
    /// Backups, on the device host.
    pub backup_root: PathBuf,
    /// Recordings, on the device host.
    pub video_dir: PathBuf,
    /// Capture output, on this machine.
    pub capture_dir: PathBuf,
    pub backup_timeout: Duration,
}

impl Default for DeviceLayout {
    fn default() -> Self {
        Self::from(&FleetConfig::default())
    }
}

impl From<&FleetConfig> for DeviceLayout {
    fn from(config: &FleetConfig) -> Self {
        Self {
            backup_root: config.backup_root.clone(),
            video_dir: config.video_dir.clone(),
            capture_dir: config.capture_dir.clone(),
            backup_timeout: config.backup_timeout(),
        }
    }
}

/// One acquired device and its lazily created facilities.
pub struct DeviceHandle {
    device: DeviceRef,
    kind: DeviceKind,
    executor: Arc<dyn RemoteExecutor>,
    layout: DeviceLayout,
    data_dir: OnceCell<PathBuf>,
    shared: OnceCell<FilesystemContainer>,
    apps: Mutex<HashMap<String, Arc<FilesystemContainer>>>,
    backup: OnceCell<BackupStore>,
    system_log: OnceCell<LogCapture>,
    device_log: OnceCell<LogCapture>,
    video: OnceCell<VideoRecorder>,
}

impl DeviceHandle {
    pub fn new(
        device: DeviceRef,
        kind: DeviceKind,
        executor: Arc<dyn RemoteExecutor>,
        layout: DeviceLayout,
    ) -> Self {
        Self {
            device,
            kind,
            executor,
            layout,
            data_dir: OnceCell::new(),
            shared: OnceCell::new(),
            apps: Mutex::new(HashMap::new()),
            backup: OnceCell::new(),
            system_log: OnceCell::new(),
            device_log: OnceCell::new(),
            video: OnceCell::new(),
        }
    }

    /// Uses `dir` as the device data directory instead of asking simctl.
    pub fn with_data_dir(self, dir: impl Into<PathBuf>) -> Self {
        let data_dir = OnceCell::new_with(Some(dir.into()));
        Self { data_dir, ..self }
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn executor(&self) -> &Arc<dyn RemoteExecutor> {
        &self.executor
    }

    fn simctl(&self) -> Simctl {
        Simctl::new(Arc::clone(&self.executor))
    }

    fn simulator_only(&self, facility: &'static str) -> Result<(), DeviceError> {
        match self.kind {
            DeviceKind::Simulator => Ok(()),
            DeviceKind::Physical => Err(DeviceError::Unsupported {
                device: self.device.clone(),
                facility,
            }),
        }
    }

    /// The simulator's data directory on its host.
    pub async fn data_dir(&self) -> Result<&PathBuf, DeviceError> {
        self.simulator_only("data directory")?;
        self.data_dir
            .get_or_try_init(|| async {
                let dir = self
                    .simctl()
                    .device_data_dir(self.device.as_str())
                    .await
                    .map_err(|source| DeviceError::Locate {
                        device: self.device.clone(),
                        source,
                    })?;
                debug!(device = %self.device, dir = %dir.display(), "located data directory");
                Ok::<_, DeviceError>(dir)
            })
            .await
    }

    /// Container over the whole simulator data directory.
    pub async fn shared_container(&self) -> Result<&FilesystemContainer, DeviceError> {
        self.shared
            .get_or_try_init(|| async {
                let base = self.data_dir().await?;
                Ok::<_, DeviceError>(FilesystemContainer::new(Arc::clone(&self.executor), base))
            })
            .await
    }

    /// Container over one app's data directory.
    pub async fn app_container(
        &self,
        bundle_id: &str,
    ) -> Result<Arc<FilesystemContainer>, DeviceError> {
        self.simulator_only("app container")?;
        let mut apps = self.apps.lock().await;
        if let Some(container) = apps.get(bundle_id) {
            return Ok(Arc::clone(container));
        }
        let base = self
            .simctl()
            .app_data_container(self.device.as_str(), bundle_id)
            .await
            .map_err(|source| DeviceError::Locate {
                device: self.device.clone(),
                source,
            })?;
        let container = Arc::new(FilesystemContainer::new(Arc::clone(&self.executor), base));
        apps.insert(bundle_id.to_string(), Arc::clone(&container));
        Ok(container)
    }

    /// Backup of the simulator data directory under the backup root.
    pub async fn backup(&self) -> Result<&BackupStore, DeviceError> {
        self.backup
            .get_or_try_init(|| async {
                let live = self.data_dir().await?;
                let store = BackupStore::new(
                    Arc::clone(&self.executor),
                    self.device.clone(),
                    live.clone(),
                    self.layout.backup_root.join(self.device.as_str()),
                );
                let timeout = if self.layout.backup_timeout.is_zero() {
                    DEFAULT_COPY_TIMEOUT
                } else {
                    self.layout.backup_timeout
                };
                Ok::<_, DeviceError>(store.with_copy_timeout(timeout))
            })
            .await
    }

    /// Log capture matching the device kind.
    pub async fn log(&self) -> &LogCapture {
        match self.kind {
            DeviceKind::Simulator => self.system_log().await,
            DeviceKind::Physical => self.device_log().await,
        }
    }

    /// Simulator system log capture.
    pub async fn system_log(&self) -> &LogCapture {
        self.system_log
            .get_or_init(|| async {
                LogCapture::simulator(
                    Arc::clone(&self.executor),
                    self.device.clone(),
                    &self.layout.capture_dir,
                )
            })
            .await
    }

    /// Physical device syslog relay capture.
    pub async fn device_log(&self) -> &LogCapture {
        self.device_log
            .get_or_init(|| async {
                LogCapture::real_device(
                    Arc::clone(&self.executor),
                    self.device.clone(),
                    &self.layout.capture_dir,
                )
            })
            .await
    }

    /// Screen recorder.
    pub async fn video(&self) -> Result<&VideoRecorder, DeviceError> {
        self.simulator_only("video recording")?;
        Ok(self
            .video
            .get_or_init(|| async {
                VideoRecorder::new(
                    Arc::clone(&self.executor),
                    self.device.clone(),
                    &self.layout.video_dir,
                    &self.layout.capture_dir,
                )
            })
            .await)
    }

    /// Stops every capture that was started through this handle.
    pub async fn stop_captures(&self) {
        for log in [self.system_log.get(), self.device_log.get()].into_iter().flatten() {
            if let Err(e) = log.stop().await {
                warn!(device = %self.device, error = %e, "failed to stop log capture");
            }
        }
        if let Some(video) = self.video.get() {
            if video.is_recording().await {
                if let Err(e) = video.stop().await {
                    warn!(device = %self.device, error = %e, "failed to stop recording");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::HostExecutor;
    use crate::syslog::LogSource;

    fn handle(kind: DeviceKind, dir: &std::path::Path) -> DeviceHandle {
        let layout = DeviceLayout {
            backup_root: dir.join("backups"),
            video_dir: dir.join("videos"),
            capture_dir: dir.join("captures"),
            backup_timeout: Duration::from_secs(5),
        };
        DeviceHandle::new(
            DeviceRef::new("DEV-1"),
            kind,
            Arc::new(HostExecutor::local()),
            layout,
        )
    }

    #[test]
    fn device_ref_is_transparent() {
        let device = DeviceRef::new("A1B2");
        assert_eq!(device.to_string(), "A1B2");
        assert_eq!(serde_json::to_string(&device).unwrap(), "\"A1B2\"");
        let back: DeviceRef = serde_json::from_str("\"A1B2\"").unwrap();
        assert_eq!(back, device);
    }

    #[tokio::test]
    async fn facilities_are_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("data");
        let device = handle(DeviceKind::Simulator, dir.path()).with_data_dir(&live);

        let shared = device.shared_container().await.unwrap();
        assert_eq!(shared.base(), live.as_path());
        let again = device.shared_container().await.unwrap();
        assert!(std::ptr::eq(shared, again));

        let backup = device.backup().await.unwrap();
        assert_eq!(backup.live_path(), live.as_path());
        assert_eq!(backup.backup_path(), dir.path().join("backups/DEV-1"));

        let log = device.log().await;
        assert_eq!(log.source(), LogSource::Simulator);
        assert!(std::ptr::eq(log, device.system_log().await));
    }

    #[tokio::test]
    async fn physical_devices_have_no_simulator_facilities() {
        let dir = tempfile::tempdir().unwrap();
        let device = handle(DeviceKind::Physical, dir.path());

        assert!(matches!(
            device.video().await,
            Err(DeviceError::Unsupported { facility: "video recording", .. })
        ));
        assert!(matches!(
            device.app_container("com.example").await,
            Err(DeviceError::Unsupported { .. })
        ));
        assert_eq!(device.log().await.source(), LogSource::RealDevice);
    }

    #[tokio::test]
    async fn stop_captures_with_nothing_started() {
        let dir = tempfile::tempdir().unwrap();
        let device = handle(DeviceKind::Simulator, dir.path());
        device.stop_captures().await;
        device.video().await.unwrap();
        // Idle recorder is skipped rather than reported as NotRunning.
        device.stop_captures().await;
    }
}
