//! # simfleet-core
//!
//! Device lifecycle and resource-reclamation engine for fleets of iOS
//! simulators and physical devices spread over local and ssh-reachable hosts.
//!
//! Everything that touches a device goes through a [`remote::RemoteExecutor`]
//! bound to that device's host. Only the executor knows whether a command
//! runs here or over ssh, so the filesystem, backup and capture code is the
//! same for both.
//!
//! ## Modules
//!
//! - [`host`] - Host identity and the local-machine predicate
//! - [`remote`] - Command execution on local and remote hosts
//! - [`container`] - Sandboxed file access bounded to a base directory
//! - [`backup`] - Versioned snapshot and restore of device data
//! - [`capture`] - Supervised capture processes with drained output
//! - [`syslog`] - Simulator and device log capture
//! - [`video`] - Simulator screen recording
//! - [`autorelease`] - Background release of idle devices
//! - [`device`] - Device references and lazily built per-device facilities
//! - [`simctl`] - Wrapper around `xcrun simctl`, run through an executor
//! - [`config`] - Persistent fleet configuration
//!
//! ## External Dependencies
//!
//! Device hosts need:
//!
//! - **Xcode** (for `xcrun simctl`) - simulator control, logs and recording
//! - **libimobiledevice** (for `idevicesyslog`) - physical device logs
//! - **OpenSSH** on this machine (`ssh`, `scp`) when any host is remote
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use simfleet_core::device::{DeviceHandle, DeviceKind, DeviceLayout, DeviceRef};
//! use simfleet_core::host::Host;
//! use simfleet_core::remote::HostExecutor;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = Arc::new(HostExecutor::new(Host::remote("mac-mini.lan").with_user("ci")));
//! let device = DeviceHandle::new(
//!     DeviceRef::new("A1B2C3D4-E5F6-7890-ABCD-EF1234567890"),
//!     DeviceKind::Simulator,
//!     executor,
//!     DeviceLayout::default(),
//! );
//!
//! let prefs = device
//!     .app_container("com.example.app")
//!     .await?
//!     .read("Library/Preferences/com.example.app.plist")
//!     .await?;
//! println!("{} bytes", prefs.len());
//!
//! device.backup().await?.create().await?;
//! # Ok(())
//! # }
//! ```

pub mod autorelease;
pub mod backup;
pub mod capture;
pub mod config;
pub mod container;
pub mod device;
pub mod host;
pub mod remote;
pub mod simctl;
pub mod syslog;
pub mod video;
