//! Uniform command execution against local and SSH-reachable hosts.
//!
//! Every higher-level component (filesystem containers, backups, capture
//! processes) talks to a device host through the [`RemoteExecutor`] trait and
//! never asks *where* the host is. [`HostExecutor`] is the concrete
//! implementation and the single place that branches on
//! [`Host::is_local`]: local commands are spawned directly, remote ones are
//! funneled through the system `ssh`/`scp` binaries with every argument
//! quoted for the remote shell.
//!
//! # Failure model
//!
//! A command that runs and exits non-zero is *not* an error for
//! [`RemoteExecutor::execute`]: the caller gets a [`CommandResult`] and
//! decides. Errors are reserved for infrastructure failures (spawn failure,
//! unreachable host, expired timeout). [`RemoteExecutor::shell`] can escalate
//! non-zero exits into [`ExecError::ToolFailed`] on request.
//!
//! # Example
//!
//! ```no_run
//! use simfleet_core::host::Host;
//! use simfleet_core::remote::{HostExecutor, RemoteExecutor};
//!
//! # async fn example() -> Result<(), simfleet_core::remote::ExecError> {
//! let executor = HostExecutor::new(Host::remote("mac-mini-03.lab").with_user("ci"));
//! let result = executor.run(&["xcrun", "simctl", "list", "devices", "-j"]).await?;
//! if result.is_success() {
//!     println!("{}", result.stdout);
//! }
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::debug;

use crate::host::Host;

/// Default bound on a single non-streaming command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit status ssh reserves for its own connection failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Environment variables passed to a command.
pub type Env<'a> = &'a [(&'a str, &'a str)];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by the execution layer.
#[derive(Error, Debug)]
pub enum ExecError {
    /// A required external command exited non-zero.
    #[error("`{command}` exited with status {status}: {stderr}")]
    ToolFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// The host could not be reached (ssh connection failure).
    #[error("host {host} unreachable: {message}")]
    Unreachable { host: String, message: String },

    /// The command did not finish within its time budget.
    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// A file could not be read from the host.
    #[error("cannot read {}: {stderr}", path.display())]
    Unreadable { path: PathBuf, stderr: String },

    /// The process could not be started at all.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// An empty argument vector was passed.
    #[error("empty command")]
    EmptyCommand,

    /// A local I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Returns `true` for failures of the transport rather than the tool.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            ExecError::Unreachable { .. } | ExecError::Timeout { .. } | ExecError::Spawn { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// CommandResult
// ---------------------------------------------------------------------------

/// The outcome of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard output as raw bytes.
    pub stdout_bytes: Vec<u8>,
    /// Standard error, lossily decoded.
    pub stderr: String,
    /// Exit status. Processes killed by a signal report `-1`.
    pub status: i32,
    /// Process id of the spawned child, when known.
    pub pid: Option<u32>,
}

impl CommandResult {
    /// Builds a result from raw process output.
    pub fn from_parts(stdout: Vec<u8>, stderr: &[u8], status: i32, pid: Option<u32>) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stdout_bytes: stdout,
            stderr: String::from_utf8_lossy(stderr).into_owned(),
            status,
            pid,
        }
    }

    /// A successful result carrying the given standard output.
    pub fn ok(stdout: impl Into<String>) -> Self {
        let stdout: String = stdout.into();
        Self::from_parts(stdout.into_bytes(), b"", 0, None)
    }

    /// A failed result with the given status and standard error.
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        let stderr: String = stderr.into();
        Self::from_parts(Vec::new(), stderr.as_bytes(), status, None)
    }

    /// `true` when the exit status is zero.
    pub fn is_success(&self) -> bool {
        self.status == 0
    }

    /// Standard output split into non-empty lines. Only the line terminator
    /// is removed; trailing spaces belong to the line.
    pub fn lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()
    }

    /// Converts a non-zero exit into [`ExecError::ToolFailed`].
    pub fn check(self, command: &str) -> Result<Self, ExecError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ExecError::ToolFailed {
                command: command.to_string(),
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessHandle
// ---------------------------------------------------------------------------

/// A long-running child process with its output streams.
///
/// The streams are handed out once via [`take_stdout`](Self::take_stdout) and
/// [`take_stderr`](Self::take_stderr). The child is killed if the handle is
/// dropped while it is still running.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    pid: Option<u32>,
}

impl ProcessHandle {
    /// Wraps an already spawned child. Piped streams are taken from it.
    pub fn from_child(mut child: Child) -> Self {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let pid = child.id();
        Self {
            child,
            stdout,
            stderr,
            pid,
        }
    }

    /// The OS process id recorded at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// `true` while the child has not exited.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Waits for the child to exit.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Kills the child and reaps it. Killing an exited child is not an error.
    pub async fn kill(&mut self) -> std::io::Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        match self.child.kill().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Shell quoting
// ---------------------------------------------------------------------------

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c)
}

/// Quotes a single argument for a POSIX shell.
///
/// Arguments made only of safe characters are returned unchanged; anything
/// else is wrapped in single quotes with embedded quotes escaped.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(is_shell_safe) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Quotes and joins an argument vector into one shell command line.
pub fn shell_join(args: &[&str]) -> String {
    args.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// RemoteExecutor trait
// ---------------------------------------------------------------------------

/// Command execution bound to one host.
///
/// Implementations must be cheap to share (`Arc<dyn RemoteExecutor>`) and
/// safe to call concurrently.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// The host this executor is bound to.
    fn host(&self) -> &Host;

    /// `true` when commands run on the local machine.
    fn is_local_host(&self) -> bool;

    /// Runs an argument vector to completion.
    ///
    /// Non-zero exits are returned as a [`CommandResult`], never as an error.
    /// `timeout` of `None` uses the executor's default.
    async fn execute(
        &self,
        command: &[&str],
        env: Env<'_>,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, ExecError>;

    /// Runs a shell-interpreted command line.
    ///
    /// When `return_on_failure` is `false`, a non-zero exit becomes
    /// [`ExecError::ToolFailed`].
    async fn shell(
        &self,
        command_line: &str,
        return_on_failure: bool,
    ) -> Result<CommandResult, ExecError>;

    /// Reads a file on the host as raw bytes.
    async fn capture_file(&self, path: &Path) -> Result<Vec<u8>, ExecError>;

    /// Pushes a local file to `remote_path` on the host.
    async fn copy_file_to(&self, local_path: &Path, remote_path: &Path) -> Result<(), ExecError>;

    /// Spawns a long-running process with piped stdout and stderr.
    async fn start_process(
        &self,
        command: &[&str],
        env: Env<'_>,
    ) -> Result<ProcessHandle, ExecError>;

    /// Shorthand for [`execute`](Self::execute) without env or timeout.
    async fn run(&self, command: &[&str]) -> Result<CommandResult, ExecError> {
        self.execute(command, &[], None).await
    }

    /// Like [`run`](Self::run) but escalates non-zero exits.
    async fn run_checked(&self, command: &[&str]) -> Result<CommandResult, ExecError> {
        let result = self.execute(command, &[], None).await?;
        result.check(&command.join(" "))
    }
}

// ---------------------------------------------------------------------------
// HostExecutor
// ---------------------------------------------------------------------------

/// The production [`RemoteExecutor`]: direct process spawning for the local
/// machine, `ssh`/`scp` for everything else.
#[derive(Debug, Clone)]
pub struct HostExecutor {
    host: Host,
    local: bool,
    default_timeout: Duration,
}

impl HostExecutor {
    pub fn new(host: Host) -> Self {
        let local = host.is_local();
        Self {
            host,
            local,
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// An executor for the local machine.
    pub fn local() -> Self {
        Self::new(Host::local())
    }

    /// Overrides the timeout applied when callers pass `None`.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Common ssh/scp options. `port_flag` differs between the two tools.
    fn transport_options(&self, port_flag: &str) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ];
        if let Some(port) = self.host.port {
            opts.push(port_flag.to_string());
            opts.push(port.to_string());
        }
        if let Some(identity) = &self.host.identity_file {
            opts.push("-i".to_string());
            opts.push(identity.to_string_lossy().into_owned());
        }
        opts
    }

    /// `ssh <options> <target> -- <line>`; the remote shell interprets `line`.
    fn ssh_command(&self, remote_line: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.transport_options("-p"))
            .arg(self.host.ssh_target())
            .arg("--")
            .arg(remote_line);
        cmd
    }

    /// Builds the process for an argument vector, local or over ssh.
    fn build_command(&self, command: &[&str], env: Env<'_>) -> Result<Command, ExecError> {
        let (program, args) = command.split_first().ok_or(ExecError::EmptyCommand)?;
        if self.local {
            let mut cmd = Command::new(program);
            cmd.args(args);
            for (key, value) in env {
                cmd.env(key, value);
            }
            Ok(cmd)
        } else {
            let assignments: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
            let mut words: Vec<&str> = Vec::with_capacity(command.len() + env.len() + 1);
            if !assignments.is_empty() {
                words.push("env");
                words.extend(assignments.iter().map(String::as_str));
            }
            words.extend_from_slice(command);
            Ok(self.ssh_command(&shell_join(&words)))
        }
    }

    /// Runs `cmd` to completion, applying the timeout and classifying
    /// ssh connection failures.
    async fn complete(
        &self,
        mut cmd: Command,
        shown: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        debug!(host = %self.host, command = %shown, "executing");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| ExecError::Spawn {
            command: shown.to_string(),
            source,
        })?;
        let pid = child.id();

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(ExecError::Timeout {
                    command: shown.to_string(),
                    timeout,
                })
            }
        };

        let status = output.status.code().unwrap_or(-1);
        if !self.local && status == SSH_CONNECTION_FAILURE {
            return Err(ExecError::Unreachable {
                host: self.host.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(CommandResult::from_parts(output.stdout, &output.stderr, status, pid))
    }
}

#[async_trait]
impl RemoteExecutor for HostExecutor {
    fn host(&self) -> &Host {
        &self.host
    }

    fn is_local_host(&self) -> bool {
        self.local
    }

    async fn execute(
        &self,
        command: &[&str],
        env: Env<'_>,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, ExecError> {
        let cmd = self.build_command(command, env)?;
        self.complete(cmd, &command.join(" "), timeout.unwrap_or(self.default_timeout))
            .await
    }

    async fn shell(
        &self,
        command_line: &str,
        return_on_failure: bool,
    ) -> Result<CommandResult, ExecError> {
        let cmd = if self.local {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command_line);
            cmd
        } else {
            self.ssh_command(command_line)
        };
        let result = self.complete(cmd, command_line, self.default_timeout).await?;
        if return_on_failure {
            Ok(result)
        } else {
            result.check(command_line)
        }
    }

    async fn capture_file(&self, path: &Path) -> Result<Vec<u8>, ExecError> {
        if self.local {
            return tokio::fs::read(path)
                .await
                .map_err(|e| ExecError::Unreadable {
                    path: path.to_path_buf(),
                    stderr: e.to_string(),
                });
        }
        let path_str = path.to_string_lossy();
        let result = self.execute(&["cat", &*path_str], &[], None).await?;
        if result.is_success() {
            Ok(result.stdout_bytes)
        } else {
            Err(ExecError::Unreadable {
                path: path.to_path_buf(),
                stderr: result.stderr.trim().to_string(),
            })
        }
    }

    async fn copy_file_to(&self, local_path: &Path, remote_path: &Path) -> Result<(), ExecError> {
        if self.local {
            if local_path != remote_path {
                tokio::fs::copy(local_path, remote_path).await?;
            }
            return Ok(());
        }
        let destination = format!(
            "{}:{}",
            self.host.ssh_target(),
            shell_quote(&remote_path.to_string_lossy())
        );
        let mut cmd = Command::new("scp");
        cmd.args(self.transport_options("-P"))
            .arg("-q")
            .arg(local_path)
            .arg(&destination);
        let shown = format!("scp {} {}", local_path.display(), destination);
        self.complete(cmd, &shown, self.default_timeout)
            .await?
            .check(&shown)
            .map(|_| ())
    }

    async fn start_process(
        &self,
        command: &[&str],
        env: Env<'_>,
    ) -> Result<ProcessHandle, ExecError> {
        let shown = command.join(" ");
        let mut cmd = self.build_command(command, env)?;
        debug!(host = %self.host, command = %shown, "starting process");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd.spawn().map_err(|source| ExecError::Spawn {
            command: shown,
            source,
        })?;
        Ok(ProcessHandle::from_child(child))
    }
}
