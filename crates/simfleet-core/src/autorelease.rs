//! Background reclamation of idle devices.
//!
//! The [`AutoreleaseScheduler`] runs ticks in a loop. Each tick asks the
//! [`DevicePool`] which devices sat idle past their budget, releases all of
//! them concurrently, and waits for every release before the tick ends. One
//! slow or failing device never holds up the others: each release runs in its
//! own task with its own timeout, and its failure is logged and reported
//! without touching its siblings.
//!
//! Between ticks the loop sleeps until the pool's next release deadline, but
//! never less than [`AutoreleaseConfig::min_sleep`]. A tick that fails as a
//! whole (pool unreachable, a panic) is logged and the loop carries on.
//!
//! A release that times out is abandoned, not killed: the tick stops waiting
//! for it, but the release task keeps running and its side effects may still
//! land after the tick has ended.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use simfleet_core::autorelease::{AutoreleaseConfig, AutoreleaseScheduler, DevicePool};
//!
//! # async fn example(pool: Arc<dyn DevicePool>) {
//! let handle = AutoreleaseScheduler::new(pool, AutoreleaseConfig::default()).spawn();
//!
//! // A device just became idle with an earlier deadline.
//! handle.wake();
//!
//! // Later, stop the scheduler
//! handle.stop().await;
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, info, info_span, warn, Instrument};

use crate::device::DeviceRef;
use crate::remote::ExecError;

/// Errors reported by a [`DevicePool`].
#[derive(Error, Debug)]
pub enum PoolError {
    /// The pool does not know the device.
    #[error("unknown device {0}")]
    UnknownDevice(DeviceRef),

    /// Releasing the device failed.
    #[error("failed to release {device}: {message}")]
    Release { device: DeviceRef, message: String },

    /// The pool itself could not answer.
    #[error("device pool unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Why a device is being released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// Idle past its budget.
    Autorelease,
    /// The client gave it back.
    ClientRequest,
    /// The fleet is shutting down.
    Shutdown,
}

impl ReleaseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseReason::Autorelease => "autorelease",
            ReleaseReason::ClientRequest => "client_request",
            ReleaseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The allocation side of the fleet, as seen by the scheduler.
///
/// Queries may run concurrently with releases from the same tick, so
/// implementations must tolerate concurrent calls.
#[async_trait]
pub trait DevicePool: Send + Sync {
    /// Devices idle past their budget.
    async fn ready_for_release(&self) -> Result<Vec<DeviceRef>, PoolError>;

    /// When the next device becomes eligible for release.
    async fn next_release_deadline(&self) -> Result<DateTime<Utc>, PoolError>;

    /// Releases a device. Releasing an already released device succeeds.
    async fn release(&self, device: &DeviceRef, reason: ReleaseReason) -> Result<(), PoolError>;
}

/// Source of "now" for deadline arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoreleaseConfig {
    /// Budget for one device's release (default: 2 minutes).
    pub release_timeout: Duration,
    /// Shortest sleep between ticks (default: 1 second).
    pub min_sleep: Duration,
}

impl Default for AutoreleaseConfig {
    fn default() -> Self {
        Self {
            release_timeout: Duration::from_secs(120),
            min_sleep: Duration::from_secs(1),
        }
    }
}

/// Time to sleep before the next tick: until `deadline`, but at least
/// `min_sleep`. Deadlines at or before `now` give exactly `min_sleep`.
pub fn sleep_interval(deadline: DateTime<Utc>, now: DateTime<Utc>, min_sleep: Duration) -> Duration {
    match (deadline - now).to_std() {
        Ok(until) if until > min_sleep => until,
        _ => min_sleep,
    }
}

/// How one release in a tick went wrong.
#[derive(Error, Debug)]
pub enum ReleaseFailure {
    #[error("release timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Failed(#[from] PoolError),

    #[error("release task panicked: {0}")]
    Panicked(String),
}

/// Outcome of one tick.
#[derive(Debug, Default)]
pub struct TickReport {
    pub released: Vec<DeviceRef>,
    pub failed: Vec<(DeviceRef, ReleaseFailure)>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty() && self.failed.is_empty()
    }
}

/// Handle for controlling a running scheduler.
///
/// The scheduler keeps running until `stop()` or `cancel()` is called.
pub struct AutoreleaseHandle {
    cancel_token: CancellationToken,
    wake: Arc<Notify>,
    join_handle: JoinHandle<()>,
}

impl AutoreleaseHandle {
    /// Stops the scheduler and waits for it to finish.
    ///
    /// A tick in progress is abandoned; releases it already started keep
    /// running.
    pub async fn stop(self) {
        self.cancel_token.cancel();
        let _ = self.join_handle.await;
    }

    /// Cancels the scheduler without waiting.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Ends the current sleep early. A wake-up during a tick makes the next
    /// sleep return immediately.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Returns whether the scheduler is still running.
    pub fn is_running(&self) -> bool {
        !self.join_handle.is_finished()
    }
}

/// Releases idle devices from a [`DevicePool`].
pub struct AutoreleaseScheduler {
    pool: Arc<dyn DevicePool>,
    clock: Arc<dyn Clock>,
    config: AutoreleaseConfig,
}

impl AutoreleaseScheduler {
    pub fn new(pool: Arc<dyn DevicePool>, config: AutoreleaseConfig) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> AutoreleaseConfig {
        self.config
    }

    /// Spawns the scheduler loop onto the current runtime.
    pub fn spawn(self) -> AutoreleaseHandle {
        let cancel_token = CancellationToken::new();
        let wake = Arc::new(Notify::new());

        let scheduler = Arc::new(self);
        let join_handle = tokio::spawn(scheduler.run_loop(cancel_token.clone(), wake.clone()));

        AutoreleaseHandle {
            cancel_token,
            wake,
            join_handle,
        }
    }

    async fn run_loop(self: Arc<Self>, cancel_token: CancellationToken, wake: Arc<Notify>) {
        info!(
            release_timeout = ?self.config.release_timeout,
            min_sleep = ?self.config.min_sleep,
            "autorelease scheduler started"
        );
        loop {
            // Each cycle runs in its own task so a panic ends the cycle, not
            // the loop.
            let mut cycle = tokio::spawn(Arc::clone(&self).cycle());
            let interval = tokio::select! {
                _ = cancel_token.cancelled() => {
                    cycle.abort();
                    break;
                }
                joined = &mut cycle => match joined {
                    Ok(interval) => interval,
                    Err(e) => {
                        error!(error = %e, "autorelease tick panicked");
                        self.config.min_sleep
                    }
                },
            };

            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = wake.notified() => debug!("autorelease woken early"),
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("autorelease scheduler stopped");
    }

    /// One tick followed by the sleep computation.
    async fn cycle(self: Arc<Self>) -> Duration {
        match self.run_tick().await {
            Ok(report) if report.is_empty() => {}
            Ok(report) => debug!(
                released = report.released.len(),
                failed = report.failed.len(),
                "autorelease tick finished"
            ),
            Err(e) => error!(error = %e, "autorelease tick failed"),
        }
        self.next_sleep().await
    }

    async fn next_sleep(&self) -> Duration {
        match self.pool.next_release_deadline().await {
            Ok(deadline) => sleep_interval(deadline, self.clock.now(), self.config.min_sleep),
            Err(e) => {
                warn!(error = %e, "cannot read next release deadline");
                self.config.min_sleep
            }
        }
    }

    /// Runs a single tick: releases every eligible device concurrently and
    /// returns once each release has finished, failed or timed out.
    ///
    /// Only a failure to list eligible devices is an error; per-device
    /// failures are logged and collected in the report.
    pub async fn run_tick(&self) -> Result<TickReport, PoolError> {
        self.tick().instrument(debug_span!("autorelease_tick")).await
    }

    async fn tick(&self) -> Result<TickReport, PoolError> {
        let devices = self.pool.ready_for_release().await?;
        if !devices.is_empty() {
            debug!(count = devices.len(), "devices ready for release");
        }

        let mut jobs = JoinSet::new();
        for device in devices {
            jobs.spawn(Self::release_job(
                Arc::clone(&self.pool),
                device,
                self.config.release_timeout,
            ));
        }

        let mut report = TickReport::default();
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok((device, Ok(()))) => {
                    info!(device = %device, "device autoreleased");
                    report.released.push(device);
                }
                Ok((device, Err(failure))) => {
                    warn!(device = %device, error = %failure, "autorelease failed");
                    report.failed.push((device, failure));
                }
                Err(e) => error!(error = %e, "release job lost"),
            }
        }
        Ok(report)
    }

    /// Releases one device. The release itself runs detached so that a
    /// timeout abandons it without cancelling it.
    async fn release_job(
        pool: Arc<dyn DevicePool>,
        device: DeviceRef,
        timeout: Duration,
    ) -> (DeviceRef, Result<(), ReleaseFailure>) {
        let span = info_span!("release", device = %device);
        let target = device.clone();
        let release = tokio::spawn(
            async move { pool.release(&target, ReleaseReason::Autorelease).await }.instrument(span),
        );

        let outcome = match tokio::time::timeout(timeout, release).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(ReleaseFailure::Failed(e)),
            Ok(Err(e)) => Err(ReleaseFailure::Panicked(e.to_string())),
            Err(_) => Err(ReleaseFailure::TimedOut(timeout)),
        };
        (device, outcome)
    }
}
