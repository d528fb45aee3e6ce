//! Host identity for device machines.
//!
//! A [`Host`] names the machine a device lives on together with the
//! credentials needed to reach it over SSH. Whether a host is the local
//! machine decides how [`HostExecutor`](crate::remote::HostExecutor)
//! dispatches commands; nothing else in the crate looks at it.
//!
//! # Example
//!
//! ```
//! use simfleet_core::host::Host;
//!
//! let local = Host::local();
//! assert!(local.is_local());
//!
//! let mac = Host::remote("mac-mini-03.lab").with_user("ci").with_port(2222);
//! assert!(!mac.is_local());
//! assert_eq!(mac.ssh_target(), "ci@mac-mini-03.lab");
//! ```

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Hostnames that always refer to the machine we are running on.
const LOOPBACK_NAMES: &[&str] = &["", "localhost", "127.0.0.1", "::1"];

/// A machine capable of running device-control commands.
///
/// Hosts are immutable once built and shared (behind an `Arc`) by every
/// component touching devices on that machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Host {
    /// DNS name or address of the machine.
    pub hostname: String,

    /// SSH login user. `None` lets ssh pick its configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// SSH port. `None` uses the ssh default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Private key passed to ssh/scp with `-i`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
}

impl Host {
    /// The machine this process runs on.
    pub fn local() -> Self {
        Self::remote("localhost")
    }

    /// A host reached by name. Loopback names still resolve as local.
    pub fn remote(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            user: None,
            port: None,
            identity_file: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Returns `true` when this host is the local machine.
    ///
    /// Loopback names always match. The machine's own hostname (from the
    /// `HOSTNAME` environment variable) matches too, case-insensitively.
    pub fn is_local(&self) -> bool {
        let name = self.hostname.trim();
        if LOOPBACK_NAMES.contains(&name) {
            return true;
        }
        std::env::var("HOSTNAME")
            .map(|own| !own.is_empty() && own.eq_ignore_ascii_case(name))
            .unwrap_or(false)
    }

    /// The `[user@]host` destination understood by ssh and scp.
    pub fn ssh_target(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.hostname),
            None => self.hostname.clone(),
        }
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::local()
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.ssh_target(), port),
            None => write!(f, "{}", self.ssh_target()),
        }
    }
}
