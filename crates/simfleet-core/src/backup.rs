//! Versioned snapshot and restore of a device's on-disk state.
//!
//! A backup lives at `<backup_path>/` and holds two things: a full copy of the
//! device directory under `data/`, and a small [`BackupMeta`] JSON document.
//! The metadata file is the only thing that decides whether a usable backup
//! exists: it is written last on [`BackupStore::create`], and a backup whose
//! schema version differs from [`BACKUP_SCHEMA_VERSION`] counts as absent.
//!
//! Copies over slow or flaky transports are the common failure, so
//! [`BackupStore::restore`] retries its delete and copy steps once each before
//! giving up. Two consecutive failures are always reported.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use simfleet_core::backup::BackupStore;
//! use simfleet_core::device::DeviceRef;
//! use simfleet_core::remote::HostExecutor;
//!
//! # async fn example() -> Result<(), simfleet_core::backup::BackupError> {
//! let store = BackupStore::new(
//!     Arc::new(HostExecutor::local()),
//!     DeviceRef::new("A1B2C3D4-E5F6-7890-ABCD-EF1234567890"),
//!     "/Users/ci/Library/Developer/CoreSimulator/Devices/A1B2C3D4-E5F6-7890-ABCD-EF1234567890",
//!     "/var/simfleet/backups/A1B2C3D4-E5F6-7890-ABCD-EF1234567890",
//! );
//!
//! if !store.exists().await {
//!     store.create().await?;
//! }
//! store.restore().await?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::container::{ContainerError, FilesystemContainer};
use crate::device::DeviceRef;
use crate::remote::{shell_quote, CommandResult, ExecError, RemoteExecutor};

/// Layout version written into every backup. Bump when the on-disk layout of
/// backups changes; older backups then read as absent.
pub const BACKUP_SCHEMA_VERSION: u32 = 2;

/// Default bound on the recursive copy in `create` and `restore`.
pub const DEFAULT_COPY_TIMEOUT: Duration = Duration::from_secs(120);

const META_FILE: &str = "backup_meta.json";
const DATA_DIR: &str = "data";

/// Errors from backup operations.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Copying the live device directory into the backup failed.
    #[error("backup of {device} to {} failed: {reason}", path.display())]
    Create {
        device: DeviceRef,
        path: PathBuf,
        reason: String,
    },

    /// Copying the backup back over the live directory failed twice.
    #[error("restore of {device} from {} failed: {reason}", path.display())]
    Restore {
        device: DeviceRef,
        path: PathBuf,
        reason: String,
    },

    /// Removing the backup tree failed.
    #[error("deleting backup {} of {device} failed: {reason}", path.display())]
    Delete {
        device: DeviceRef,
        path: PathBuf,
        reason: String,
    },

    /// The metadata document could not be written.
    #[error("writing backup metadata for {device}: {source}")]
    Metadata {
        device: DeviceRef,
        #[source]
        source: ContainerError,
    },

    /// The executor failed before the command ran.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Metadata stored alongside each backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMeta {
    /// Layout version the backup was written with.
    pub version: u32,
    /// When the backup finished, in whole seconds.
    pub created: DateTime<Utc>,
}

impl BackupMeta {
    /// Metadata for a backup finishing now.
    pub fn current() -> Self {
        Self {
            version: BACKUP_SCHEMA_VERSION,
            created: Utc::now().trunc_subsecs(0),
        }
    }

    /// `true` when this backup was written by the current layout version.
    pub fn is_current(&self) -> bool {
        self.version == BACKUP_SCHEMA_VERSION
    }
}

/// Snapshot/restore for one device directory.
pub struct BackupStore {
    executor: Arc<dyn RemoteExecutor>,
    device: DeviceRef,
    live_path: PathBuf,
    backup_path: PathBuf,
    tree: FilesystemContainer,
    copy_timeout: Duration,
}

impl BackupStore {
    /// Creates a store copying `live_path` to and from `backup_path`.
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        device: DeviceRef,
        live_path: impl Into<PathBuf>,
        backup_path: impl Into<PathBuf>,
    ) -> Self {
        let backup_path = backup_path.into();
        let tree = FilesystemContainer::new(executor.clone(), &backup_path);
        Self {
            executor,
            device,
            live_path: live_path.into(),
            backup_path,
            tree,
            copy_timeout: DEFAULT_COPY_TIMEOUT,
        }
    }

    pub fn with_copy_timeout(mut self, timeout: Duration) -> Self {
        self.copy_timeout = timeout;
        self
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn live_path(&self) -> &Path {
        &self.live_path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Where the copy of the live directory sits inside the backup.
    pub fn data_path(&self) -> PathBuf {
        self.backup_path.join(DATA_DIR)
    }

    /// Reads the stored metadata, if there is a parseable document.
    pub async fn meta(&self) -> Option<BackupMeta> {
        let bytes = self.tree.read(META_FILE).await.ok()?;
        match serde_json::from_slice::<BackupMeta>(&bytes) {
            Ok(meta) => Some(meta),
            Err(e) => {
                debug!(device = %self.device, error = %e, "unparseable backup metadata");
                None
            }
        }
    }

    /// `true` only when the backup directory exists, its metadata parses, and
    /// the metadata version matches [`BACKUP_SCHEMA_VERSION`].
    pub async fn exists(&self) -> bool {
        match self.tree.exists("").await {
            Ok(true) => {}
            _ => return false,
        }
        match self.meta().await {
            Some(meta) if meta.is_current() => true,
            Some(meta) => {
                info!(
                    device = %self.device,
                    found = meta.version,
                    expected = BACKUP_SCHEMA_VERSION,
                    "ignoring backup with stale schema version"
                );
                false
            }
            None => false,
        }
    }

    /// Snapshots the live directory.
    ///
    /// Any previous backup is removed first. Metadata is written only after
    /// the copy succeeds, so a failed create never leaves a backup that
    /// [`exists`](Self::exists) accepts.
    pub async fn create(&self) -> Result<(), BackupError> {
        let backup = self.backup_path.to_string_lossy().into_owned();
        let data = self.data_path().to_string_lossy().into_owned();
        let live = self.live_path.to_string_lossy().into_owned();

        let create_error = |reason: String| BackupError::Create {
            device: self.device.clone(),
            path: self.backup_path.clone(),
            reason,
        };

        let removed = self.executor.run(&["rm", "-rf", &backup]).await?;
        if !removed.is_success() {
            return Err(create_error(removed.stderr.trim().to_string()));
        }
        let made = self.executor.run(&["mkdir", "-p", &backup]).await?;
        if !made.is_success() {
            return Err(create_error(made.stderr.trim().to_string()));
        }

        let copied = self
            .executor
            .execute(&["cp", "-R", &live, &data], &[], Some(self.copy_timeout))
            .await
            .map_err(|e| create_error(e.to_string()))?;
        if !copied.is_success() {
            return Err(create_error(copied.stderr.trim().to_string()));
        }

        let meta = BackupMeta::current();
        let json = serde_json::to_vec_pretty(&meta).map_err(|e| create_error(e.to_string()))?;
        self.tree
            .write(&json, META_FILE)
            .await
            .map_err(|source| BackupError::Metadata {
                device: self.device.clone(),
                source,
            })?;

        info!(device = %self.device, path = %self.backup_path.display(), "backup created");
        Ok(())
    }

    /// Replaces the live directory with the backed-up copy.
    ///
    /// Deleting the live directory is best-effort: a failed delete is retried
    /// once, and if files still remain they are logged and the restore
    /// proceeds. The backup's contents are then copied into the live
    /// directory, so a directory the delete left behind is overwritten in
    /// place rather than receiving a nested copy. The copy is retried once
    /// through the shell; a second failure is reported. Both attempts are
    /// bounded by the copy timeout.
    pub async fn restore(&self) -> Result<(), BackupError> {
        let live = self.live_path.to_string_lossy().into_owned();
        let data = self.data_path().to_string_lossy().into_owned();
        let contents = format!("{data}/.");

        self.clear_live(&live).await;

        if let Some(reason) = self.copy_into_live(&live, &contents).await {
            warn!(device = %self.device, %reason, "restore copy failed, retrying");
            let retry_line = format!(
                "mkdir -p {live} && cp -R {contents} {live}/",
                live = shell_quote(&live),
                contents = shell_quote(&contents),
            );
            let second = self
                .executor
                .execute(&["sh", "-c", &retry_line], &[], Some(self.copy_timeout))
                .await;
            if let Some(reason) = Self::failure_reason(&second) {
                return Err(BackupError::Restore {
                    device: self.device.clone(),
                    path: self.backup_path.clone(),
                    reason,
                });
            }
        }

        info!(device = %self.device, path = %self.live_path.display(), "backup restored");
        Ok(())
    }

    /// Creates the live directory and copies `contents` into it. Returns the
    /// failure reason, if any.
    async fn copy_into_live(&self, live: &str, contents: &str) -> Option<String> {
        let made = self.executor.run(&["mkdir", "-p", live]).await;
        if let Some(reason) = Self::failure_reason(&made) {
            return Some(reason);
        }
        let copied = self
            .executor
            .execute(&["cp", "-R", contents, live], &[], Some(self.copy_timeout))
            .await;
        Self::failure_reason(&copied)
    }

    /// Removes the live directory, tolerating failure.
    async fn clear_live(&self, live: &str) {
        for attempt in 1..=2 {
            let outcome = self.executor.run(&["rm", "-rf", live]).await;
            match Self::failure_reason(&outcome) {
                None => return,
                Some(reason) => {
                    warn!(device = %self.device, attempt, %reason, "failed to delete live directory")
                }
            }
        }

        match self.executor.run(&["find", live]).await {
            Ok(listing) => {
                let remaining = listing.lines();
                warn!(
                    device = %self.device,
                    count = remaining.len(),
                    files = ?remaining,
                    "files left behind before restore"
                );
            }
            Err(e) => warn!(device = %self.device, error = %e, "could not list remaining files"),
        }
    }

    fn failure_reason(outcome: &Result<CommandResult, ExecError>) -> Option<String> {
        match outcome {
            Ok(result) if result.is_success() => None,
            Ok(result) => Some(format!(
                "exit status {}: {}",
                result.status,
                result.stderr.trim()
            )),
            Err(e) => Some(e.to_string()),
        }
    }

    /// Removes the backup tree.
    pub async fn delete(&self) -> Result<(), BackupError> {
        let backup = self.backup_path.to_string_lossy().into_owned();
        let outcome = self.executor.run(&["rm", "-rf", &backup]).await;
        if let Some(reason) = Self::failure_reason(&outcome) {
            return Err(BackupError::Delete {
                device: self.device.clone(),
                path: self.backup_path.clone(),
                reason,
            });
        }
        info!(device = %self.device, "backup deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::HostExecutor;

    fn store(root: &Path) -> BackupStore {
        BackupStore::new(
            Arc::new(HostExecutor::local()),
            DeviceRef::new("SIM-1"),
            root.join("device"),
            root.join("backups/SIM-1"),
        )
    }

    fn seed(root: &Path) {
        let device = root.join("device");
        std::fs::create_dir_all(device.join("data/Library")).unwrap();
        std::fs::write(device.join("device.plist"), b"plist").unwrap();
        std::fs::write(device.join("data/Library/prefs.json"), b"{\"a\":1}").unwrap();
    }

    #[test]
    fn current_meta_has_whole_seconds() {
        let meta = BackupMeta::current();
        assert_eq!(meta.version, BACKUP_SCHEMA_VERSION);
        assert_eq!(meta.created.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn meta_json_shape() {
        let meta: BackupMeta =
            serde_json::from_str(r#"{"version":2,"created":"2026-01-02T03:04:05Z"}"#).unwrap();
        assert!(meta.is_current());
        assert_eq!(meta.created.to_rfc3339(), "2026-01-02T03:04:05+00:00");
    }

    #[tokio::test]
    async fn missing_backup_does_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!store(dir.path()).exists().await);
    }

    #[tokio::test]
    async fn create_then_exists() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let store = store(dir.path());

        store.create().await.unwrap();

        assert!(store.exists().await);
        let meta = store.meta().await.unwrap();
        assert_eq!(meta.version, BACKUP_SCHEMA_VERSION);
        assert_eq!(
            std::fs::read(store.data_path().join("data/Library/prefs.json")).unwrap(),
            b"{\"a\":1}"
        );
    }

    #[tokio::test]
    async fn bumped_version_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let store = store(dir.path());
        store.create().await.unwrap();

        let meta_path = store.backup_path().join(META_FILE);
        let mut meta: BackupMeta =
            serde_json::from_slice(&std::fs::read(&meta_path).unwrap()).unwrap();
        meta.version += 1;
        std::fs::write(&meta_path, serde_json::to_vec(&meta).unwrap()).unwrap();

        assert!(!store.exists().await);
    }

    #[tokio::test]
    async fn garbage_meta_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let store = store(dir.path());
        store.create().await.unwrap();
        std::fs::write(store.backup_path().join(META_FILE), b"not json").unwrap();
        assert!(!store.exists().await);
    }

    #[tokio::test]
    async fn failed_copy_leaves_no_valid_backup() {
        let dir = tempfile::tempdir().unwrap();
        // No device directory seeded, so cp fails.
        let store = store(dir.path());
        let err = store.create().await.unwrap_err();
        match err {
            BackupError::Create { path, .. } => assert_eq!(path, store.backup_path()),
            other => panic!("Expected Create error, got: {:?}", other),
        }
        assert!(!store.exists().await);
    }

    #[tokio::test]
    async fn restore_replaces_live_contents() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let store = store(dir.path());
        store.create().await.unwrap();

        let live = dir.path().join("device");
        std::fs::write(live.join("data/Library/prefs.json"), b"changed").unwrap();
        std::fs::write(live.join("junk.tmp"), b"junk").unwrap();

        store.restore().await.unwrap();

        assert_eq!(std::fs::read(live.join("data/Library/prefs.json")).unwrap(), b"{\"a\":1}");
        assert_eq!(std::fs::read(live.join("device.plist")).unwrap(), b"plist");
        assert!(!live.join("junk.tmp").exists());
        assert!(!live.join(META_FILE).exists());
    }

    #[tokio::test]
    async fn delete_removes_tree() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let store = store(dir.path());
        store.create().await.unwrap();
        store.delete().await.unwrap();
        assert!(!store.backup_path().exists());
        assert!(!store.exists().await);
    }
}
