//! Sandboxed filesystem access on a device host.
//!
//! A [`FilesystemContainer`] exposes a directory tree (an app's data
//! container, a simulator's shared data area, a backup tree) through
//! relative paths only. Every operation first resolves its argument with
//! [`FilesystemContainer::resolve`], which normalizes `.` and `..` lexically
//! and refuses anything that lands outside the base directory.
//!
//! Containers differ only in data: the base directory and a
//! [`WriteStrategy`]. Reads, listings and deletes always go through the
//! shared [`RemoteExecutor`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use simfleet_core::container::FilesystemContainer;
//! use simfleet_core::remote::HostExecutor;
//!
//! # async fn example() -> Result<(), simfleet_core::container::ContainerError> {
//! let executor = Arc::new(HostExecutor::local());
//! let container = FilesystemContainer::new(executor, "/tmp/app-data");
//!
//! container.write(b"{\"onboarded\":true}", "Documents/state.json").await?;
//! for entry in container.list("Documents").await? {
//!     println!("{entry}");
//! }
//! assert!(container.resolve("../../etc/passwd").is_err());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::remote::{ExecError, RemoteExecutor};

/// Errors raised by container operations.
#[derive(Error, Debug)]
pub enum ContainerError {
    /// The requested path normalizes to somewhere outside the base directory.
    #[error("path {requested:?} escapes container {}", base.display())]
    Containment { requested: String, base: PathBuf },

    /// A file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: ExecError,
    },

    /// A file could not be written or transferred.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: ExecError,
    },

    /// A listing or removal command failed.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// How bytes reach the host on [`FilesystemContainer::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Write straight to the local filesystem.
    Direct,
    /// Write a local temporary file, transfer it, then remove the temporary.
    Staged,
}

impl WriteStrategy {
    /// The strategy matching where `executor` runs commands.
    pub fn for_executor(executor: &dyn RemoteExecutor) -> Self {
        if executor.is_local_host() {
            WriteStrategy::Direct
        } else {
            WriteStrategy::Staged
        }
    }
}

/// A path proven to lie inside a container's base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPath(PathBuf);

impl ContainerPath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    fn lossy(&self) -> String {
        self.0.to_string_lossy().into_owned()
    }
}

impl AsRef<Path> for ContainerPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ContainerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Lexically normalizes `path`, collapsing `.` and `..`.
///
/// Returns `None` when `..` would climb above the root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}

/// Bounded access to one directory tree on a device host.
#[derive(Clone)]
pub struct FilesystemContainer {
    executor: Arc<dyn RemoteExecutor>,
    base: PathBuf,
    write_strategy: WriteStrategy,
}

impl fmt::Debug for FilesystemContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilesystemContainer")
            .field("host", self.executor.host())
            .field("base", &self.base)
            .field("write_strategy", &self.write_strategy)
            .finish()
    }
}

impl FilesystemContainer {
    /// Creates a container rooted at `base`, picking the write strategy from
    /// the executor's locality.
    pub fn new(executor: Arc<dyn RemoteExecutor>, base: impl AsRef<Path>) -> Self {
        let write_strategy = WriteStrategy::for_executor(executor.as_ref());
        let base = normalize(base.as_ref()).unwrap_or_else(|| base.as_ref().to_path_buf());
        Self {
            executor,
            base,
            write_strategy,
        }
    }

    /// Overrides the write strategy chosen at construction.
    pub fn with_write_strategy(mut self, strategy: WriteStrategy) -> Self {
        self.write_strategy = strategy;
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn write_strategy(&self) -> WriteStrategy {
        self.write_strategy
    }

    /// Joins `relative` onto the base directory and normalizes it.
    ///
    /// Leading `/` is ignored, so `"/Documents"` and `"Documents"` are the
    /// same path. The base itself resolves successfully.
    ///
    /// # Errors
    ///
    /// [`ContainerError::Containment`] if the normalized path is not the base
    /// directory or a descendant of it.
    pub fn resolve(&self, relative: &str) -> Result<ContainerPath, ContainerError> {
        let trimmed = relative.trim_start_matches('/');
        let joined = self.base.join(trimmed);
        match normalize(&joined) {
            Some(path) if path.starts_with(&self.base) => Ok(ContainerPath(path)),
            _ => Err(ContainerError::Containment {
                requested: relative.to_string(),
                base: self.base.clone(),
            }),
        }
    }

    /// Lists the entries of a directory, one name per element, in the
    /// order `ls` reports them. An empty directory yields an empty list.
    pub async fn list(&self, relative: &str) -> Result<Vec<String>, ContainerError> {
        let path = self.resolve(relative)?;
        let path_str = path.lossy();
        let result = self
            .executor
            .run_checked(&["ls", "-1A", &path_str])
            .await?;
        Ok(result.lines())
    }

    /// Reads a file's bytes.
    pub async fn read(&self, relative: &str) -> Result<Vec<u8>, ContainerError> {
        let path = self.resolve(relative)?;
        self.executor
            .capture_file(path.as_path())
            .await
            .map_err(|source| ContainerError::Read {
                path: path.into_path_buf(),
                source,
            })
    }

    /// Returns `true` if anything exists at `relative`.
    pub async fn exists(&self, relative: &str) -> Result<bool, ContainerError> {
        let path = self.resolve(relative)?;
        let path_str = path.lossy();
        let result = self.executor.run(&["test", "-e", &path_str]).await?;
        Ok(result.is_success())
    }

    /// Writes `bytes` to `relative`, creating parent directories.
    pub async fn write(&self, bytes: &[u8], relative: &str) -> Result<(), ContainerError> {
        let path = self.resolve(relative)?;
        debug!(path = %path, strategy = ?self.write_strategy, len = bytes.len(), "writing file");
        let result = match self.write_strategy {
            WriteStrategy::Direct => Self::write_direct(bytes, path.as_path()).await,
            WriteStrategy::Staged => self.write_staged(bytes, path.as_path()).await,
        };
        result.map_err(|source| ContainerError::Write {
            path: path.into_path_buf(),
            source,
        })
    }

    async fn write_direct(bytes: &[u8], path: &Path) -> Result<(), ExecError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn write_staged(&self, bytes: &[u8], path: &Path) -> Result<(), ExecError> {
        if let Some(parent) = path.parent() {
            let parent_str = parent.to_string_lossy();
            self.executor.run_checked(&["mkdir", "-p", &parent_str]).await?;
        }
        // Removed when `staged` drops, on every path out of this function.
        let staged = tempfile::NamedTempFile::new()?;
        let mut file = tokio::fs::File::create(staged.path()).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);
        self.executor.copy_file_to(staged.path(), path).await
    }

    /// Recursively removes `relative`.
    pub async fn delete(&self, relative: &str) -> Result<(), ContainerError> {
        let path = self.resolve(relative)?;
        let path_str = path.lossy();
        debug!(path = %path, "deleting");
        self.executor.run_checked(&["rm", "-rf", &path_str]).await?;
        Ok(())
    }
}
