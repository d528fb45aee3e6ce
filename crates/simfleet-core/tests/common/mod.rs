//! Shared test helpers for simfleet-core integration tests.
//!
//! This module provides test doubles for the two seams of the core: a
//! scripted [`RemoteExecutor`] that records every command and answers with
//! programmed results, a loopback executor that runs locally but claims to be
//! remote, and a programmable in-memory [`DevicePool`].

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use simfleet_core::autorelease::{Clock, DevicePool, PoolError, ReleaseReason};
use simfleet_core::device::DeviceRef;
use simfleet_core::host::Host;
use simfleet_core::remote::{CommandResult, Env, ExecError, HostExecutor, ProcessHandle, RemoteExecutor};

// ---------------------------------------------------------------------------
// ScriptedExecutor
// ---------------------------------------------------------------------------

/// What a scripted command answers.
#[derive(Debug, Clone)]
pub enum Reply {
    /// The command ran and produced this result.
    Done(CommandResult),
    /// The host could not be reached.
    Unreachable,
}

impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Reply::Done(CommandResult::ok(stdout))
    }

    pub fn fail(status: i32, stderr: &str) -> Self {
        Reply::Done(CommandResult::failed(status, stderr))
    }
}

struct Rule {
    prefix: String,
    replies: VecDeque<Reply>,
}

/// Executor that never runs anything.
///
/// Each command is flattened to one line (`argv.join(" ")` for argument
/// vectors, the line itself for shell commands, `cat <path>` for file reads,
/// `scp <local> <remote>` for copies) and recorded. The first rule whose
/// prefix matches answers; its replies are consumed in order and the last
/// one repeats. Unmatched commands succeed with empty output.
pub struct ScriptedExecutor {
    host: Host,
    local: bool,
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    timeouts: Mutex<Vec<(String, Option<Duration>)>>,
}

impl ScriptedExecutor {
    /// A scripted remote host.
    pub fn remote() -> Self {
        Self {
            host: Host::remote("scripted.test"),
            local: false,
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            timeouts: Mutex::new(Vec::new()),
        }
    }

    /// A scripted local host.
    pub fn local() -> Self {
        Self {
            host: Host::local(),
            local: true,
            ..Self::remote()
        }
    }

    pub fn on(&self, prefix: &str, replies: impl IntoIterator<Item = Reply>) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            replies: replies.into_iter().collect(),
        });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Timeout passed to the first `execute` call matching `prefix`.
    pub fn timeout_of(&self, prefix: &str) -> Option<Option<Duration>> {
        self.timeouts
            .lock()
            .unwrap()
            .iter()
            .find(|(line, _)| line.starts_with(prefix))
            .map(|(_, timeout)| *timeout)
    }

    fn answer(&self, line: String) -> Result<CommandResult, ExecError> {
        let reply = {
            let mut rules = self.rules.lock().unwrap();
            rules
                .iter_mut()
                .find(|r| line.starts_with(&r.prefix))
                .and_then(|r| {
                    if r.replies.len() > 1 {
                        r.replies.pop_front()
                    } else {
                        r.replies.front().cloned()
                    }
                })
        };
        self.calls.lock().unwrap().push(line.clone());
        match reply.unwrap_or_else(|| Reply::ok("")) {
            Reply::Done(result) => Ok(result),
            Reply::Unreachable => Err(ExecError::Unreachable {
                host: self.host.to_string(),
                message: "connection refused".to_string(),
            }),
        }
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    fn host(&self) -> &Host {
        &self.host
    }

    fn is_local_host(&self) -> bool {
        self.local
    }

    async fn execute(
        &self,
        command: &[&str],
        _env: Env<'_>,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, ExecError> {
        let line = command.join(" ");
        self.timeouts.lock().unwrap().push((line.clone(), timeout));
        self.answer(line)
    }

    async fn shell(&self, command_line: &str, return_on_failure: bool) -> Result<CommandResult, ExecError> {
        let result = self.answer(command_line.to_string())?;
        if return_on_failure {
            Ok(result)
        } else {
            result.check(command_line)
        }
    }

    async fn capture_file(&self, path: &Path) -> Result<Vec<u8>, ExecError> {
        let result = self.answer(format!("cat {}", path.display()))?;
        if result.is_success() {
            Ok(result.stdout_bytes)
        } else {
            Err(ExecError::Unreadable {
                path: path.to_path_buf(),
                stderr: result.stderr,
            })
        }
    }

    async fn copy_file_to(&self, local_path: &Path, remote_path: &Path) -> Result<(), ExecError> {
        let line = format!("scp {} {}", local_path.display(), remote_path.display());
        self.answer(line.clone())?.check(&line).map(|_| ())
    }

    async fn start_process(&self, command: &[&str], _env: Env<'_>) -> Result<ProcessHandle, ExecError> {
        self.answer(command.join(" "))?;
        Err(ExecError::Spawn {
            command: command.join(" "),
            source: std::io::Error::new(std::io::ErrorKind::Unsupported, "scripted executor"),
        })
    }
}

// ---------------------------------------------------------------------------
// LoopbackRemote
// ---------------------------------------------------------------------------

/// Runs everything on this machine but reports itself as remote, so callers
/// take their remote code paths (staged writes, shell-side copies).
pub struct LoopbackRemote {
    inner: HostExecutor,
    host: Host,
    copies: AtomicUsize,
    refused: Mutex<Vec<String>>,
}

impl LoopbackRemote {
    pub fn new() -> Self {
        Self {
            inner: HostExecutor::local(),
            host: Host::remote("loopback.test"),
            copies: AtomicUsize::new(0),
            refused: Mutex::new(Vec::new()),
        }
    }

    /// Commands starting with `prefix` fail with "Operation not permitted"
    /// without running.
    pub fn refuse(&self, prefix: &str) {
        self.refused.lock().unwrap().push(prefix.to_string());
    }

    /// Number of `copy_file_to` transfers so far.
    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteExecutor for LoopbackRemote {
    fn host(&self) -> &Host {
        &self.host
    }

    fn is_local_host(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        command: &[&str],
        env: Env<'_>,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, ExecError> {
        let line = command.join(" ");
        if self.refused.lock().unwrap().iter().any(|p| line.starts_with(p)) {
            return Ok(CommandResult::failed(1, "Operation not permitted"));
        }
        self.inner.execute(command, env, timeout).await
    }

    async fn shell(&self, command_line: &str, return_on_failure: bool) -> Result<CommandResult, ExecError> {
        self.inner.shell(command_line, return_on_failure).await
    }

    async fn capture_file(&self, path: &Path) -> Result<Vec<u8>, ExecError> {
        self.inner.capture_file(path).await
    }

    async fn copy_file_to(&self, local_path: &Path, remote_path: &Path) -> Result<(), ExecError> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        self.inner.copy_file_to(local_path, remote_path).await
    }

    async fn start_process(&self, command: &[&str], env: Env<'_>) -> Result<ProcessHandle, ExecError> {
        self.inner.start_process(command, env).await
    }
}

// ---------------------------------------------------------------------------
// MockPool
// ---------------------------------------------------------------------------

/// How [`MockPool::release`] behaves for one device.
#[derive(Debug, Clone, Copy)]
pub enum ReleaseBehavior {
    Succeed,
    Fail,
    Panic,
    /// Succeeds after the delay.
    Delay(Duration),
}

/// In-memory pool whose eligible set, deadline and per-device release
/// behavior are set by the test.
pub struct MockPool {
    ready: Mutex<Vec<DeviceRef>>,
    deadline: Mutex<DateTime<Utc>>,
    behaviors: Mutex<HashMap<DeviceRef, ReleaseBehavior>>,
    failing_ready_calls: AtomicUsize,
    ready_calls: AtomicUsize,
    release_calls: AtomicUsize,
    released: Mutex<Vec<DeviceRef>>,
}

impl MockPool {
    pub fn new(deadline: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            ready: Mutex::new(Vec::new()),
            deadline: Mutex::new(deadline),
            behaviors: Mutex::new(HashMap::new()),
            failing_ready_calls: AtomicUsize::new(0),
            ready_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
            released: Mutex::new(Vec::new()),
        })
    }

    /// Makes `device` eligible with the given release behavior.
    pub fn add(&self, device: &str, behavior: ReleaseBehavior) {
        let device = DeviceRef::new(device);
        self.behaviors.lock().unwrap().insert(device.clone(), behavior);
        self.ready.lock().unwrap().push(device);
    }

    pub fn set_deadline(&self, deadline: DateTime<Utc>) {
        *self.deadline.lock().unwrap() = deadline;
    }

    /// The next `n` eligibility queries fail.
    pub fn fail_ready_calls(&self, n: usize) {
        self.failing_ready_calls.store(n, Ordering::SeqCst);
    }

    pub fn ready_calls(&self) -> usize {
        self.ready_calls.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    /// Devices whose release completed, in completion order.
    pub fn released(&self) -> Vec<DeviceRef> {
        self.released.lock().unwrap().clone()
    }

    fn finish(&self, device: &DeviceRef) {
        self.ready.lock().unwrap().retain(|d| d != device);
        self.released.lock().unwrap().push(device.clone());
    }
}

#[async_trait]
impl DevicePool for MockPool {
    async fn ready_for_release(&self) -> Result<Vec<DeviceRef>, PoolError> {
        self.ready_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_ready_calls.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_ready_calls.store(failing - 1, Ordering::SeqCst);
            return Err(PoolError::Unavailable("pool offline".to_string()));
        }
        Ok(self.ready.lock().unwrap().clone())
    }

    async fn next_release_deadline(&self) -> Result<DateTime<Utc>, PoolError> {
        Ok(*self.deadline.lock().unwrap())
    }

    async fn release(&self, device: &DeviceRef, reason: ReleaseReason) -> Result<(), PoolError> {
        assert_eq!(reason, ReleaseReason::Autorelease);
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(device)
            .copied()
            .unwrap_or(ReleaseBehavior::Succeed);
        match behavior {
            ReleaseBehavior::Succeed => {
                self.finish(device);
                Ok(())
            }
            ReleaseBehavior::Fail => Err(PoolError::Release {
                device: device.clone(),
                message: "device wedged".to_string(),
            }),
            ReleaseBehavior::Panic => panic!("release of {device} blew up"),
            ReleaseBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                self.finish(device);
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self { now: Mutex::new(now) })
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// A fixed instant used as "now" by scheduler tests.
pub fn epoch() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-10-19T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}
