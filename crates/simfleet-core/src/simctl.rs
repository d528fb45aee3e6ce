//! Interface to Apple's `xcrun simctl` command-line tool.
//!
//! [`Simctl`] is bound to a [`RemoteExecutor`], so every query runs on the
//! host that owns the simulators, whether that is this machine or a remote
//! one reached over ssh.
//!
//! # Requirements
//!
//! Xcode must be installed on the device host for `xcrun simctl` to be
//! available.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use simfleet_core::remote::HostExecutor;
//! use simfleet_core::simctl::Simctl;
//!
//! # async fn example() -> Result<(), simfleet_core::simctl::SimctlError> {
//! let simctl = Simctl::new(Arc::new(HostExecutor::local()));
//!
//! for device in simctl.list_devices().await? {
//!     println!("{}: {} ({})", device.name, device.udid, device.state);
//! }
//!
//! let udid = simctl.get_booted_udid().await?;
//! let home = simctl.device_data_dir(&udid).await?;
//! println!("data lives in {}", home.display());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::remote::{CommandResult, ExecError, RemoteExecutor};

/// Errors that can occur when interacting with simctl.
#[derive(Error, Debug)]
pub enum SimctlError {
    /// A simctl command failed to execute successfully.
    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    /// No simulator is currently in the "Booted" state.
    #[error("No booted simulator found")]
    NoBootedSimulator,

    /// Failed to parse JSON output from simctl.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// The host could not run the command at all.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Represents an iOS Simulator device.
///
/// This struct contains information about a simulator device as reported
/// by `xcrun simctl list devices -j`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorDevice {
    /// The unique device identifier (UDID) for this simulator.
    pub udid: String,

    /// The human-readable name of the device (e.g., "iPhone 15 Pro").
    pub name: String,

    /// The current state of the device (e.g., "Booted", "Shutdown").
    pub state: String,

    /// The device type identifier (e.g., "com.apple.CoreSimulator.SimDeviceType.iPhone-15-Pro").
    #[serde(rename = "deviceTypeIdentifier")]
    pub device_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    devices: std::collections::HashMap<String, Vec<SimulatorDevice>>,
}

/// Wrapper for `xcrun simctl` commands on one host.
#[derive(Clone)]
pub struct Simctl {
    executor: Arc<dyn RemoteExecutor>,
}

impl Simctl {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }

    async fn simctl(&self, args: &[&str]) -> Result<CommandResult, SimctlError> {
        let mut argv = vec!["xcrun", "simctl"];
        argv.extend_from_slice(args);
        debug!(host = %self.executor.host(), ?args, "simctl");
        Ok(self.executor.run(&argv).await?)
    }

    async fn simctl_checked(&self, args: &[&str]) -> Result<CommandResult, SimctlError> {
        let result = self.simctl(args).await?;
        if !result.is_success() {
            return Err(SimctlError::CommandFailed(result.stderr.trim().to_string()));
        }
        Ok(result)
    }

    /// Lists all simulators on the host, across all runtime versions.
    ///
    /// # Errors
    ///
    /// - [`SimctlError::Exec`] if the command cannot be run
    /// - [`SimctlError::CommandFailed`] if simctl returns a non-zero exit code
    /// - [`SimctlError::JsonParse`] if the output cannot be parsed as JSON
    pub async fn list_devices(&self) -> Result<Vec<SimulatorDevice>, SimctlError> {
        let result = self.simctl_checked(&["list", "devices", "-j"]).await?;
        Self::parse_device_list(&result.stdout_bytes)
    }

    /// Returns the UDID of the first booted simulator.
    ///
    /// # Errors
    ///
    /// - [`SimctlError::NoBootedSimulator`] if no simulator is currently booted
    /// - Any errors from [`Self::list_devices`]
    pub async fn get_booted_udid(&self) -> Result<String, SimctlError> {
        let devices = self.list_devices().await?;
        Self::find_booted_device(&devices)
            .map(|d| d.udid.clone())
            .ok_or(SimctlError::NoBootedSimulator)
    }

    /// Boots a simulator. An already booted simulator is not an error.
    pub async fn boot(&self, udid: &str) -> Result<(), SimctlError> {
        let result = self.simctl(&["boot", udid]).await?;
        if !result.is_success() && !result.stderr.contains("current state: Booted") {
            return Err(SimctlError::CommandFailed(result.stderr.trim().to_string()));
        }
        Ok(())
    }

    /// Shuts a simulator down. An already shut down simulator is not an error.
    pub async fn shutdown(&self, udid: &str) -> Result<(), SimctlError> {
        let result = self.simctl(&["shutdown", udid]).await?;
        if !result.is_success() && !result.stderr.contains("current state: Shutdown") {
            return Err(SimctlError::CommandFailed(result.stderr.trim().to_string()));
        }
        Ok(())
    }

    /// Home directory of the simulator's data area, used as the base of the
    /// shared data container and as the live path for backups.
    pub async fn device_data_dir(&self, udid: &str) -> Result<PathBuf, SimctlError> {
        let result = self.simctl_checked(&["getenv", udid, "HOME"]).await?;
        Self::single_path(result)
    }

    /// Data container of an installed app.
    pub async fn app_data_container(
        &self,
        udid: &str,
        bundle_id: &str,
    ) -> Result<PathBuf, SimctlError> {
        let result = self
            .simctl_checked(&["get_app_container", udid, bundle_id, "data"])
            .await?;
        Self::single_path(result)
    }

    fn single_path(result: CommandResult) -> Result<PathBuf, SimctlError> {
        let path = result.stdout.trim();
        if path.is_empty() {
            return Err(SimctlError::CommandFailed("simctl returned no path".to_string()));
        }
        Ok(PathBuf::from(path))
    }

    /// Parses device list JSON into a flat vector of devices.
    ///
    /// Takes raw JSON bytes (as returned by `simctl list devices -j`).
    pub fn parse_device_list(json: &[u8]) -> Result<Vec<SimulatorDevice>, SimctlError> {
        let device_list: DeviceList = serde_json::from_slice(json)?;
        let devices: Vec<SimulatorDevice> = device_list.devices
            .into_values()
            .flatten()
            .collect();
        Ok(devices)
    }

    /// Finds the first booted device in a list.
    pub fn find_booted_device(devices: &[SimulatorDevice]) -> Option<&SimulatorDevice> {
        devices.iter().find(|d| d.state == "Booted")
    }
}
