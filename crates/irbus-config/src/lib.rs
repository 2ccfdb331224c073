//! Configuration shared by the irbus dispatcher and its tooling.
//!
//! Holds the socket path scheme (client socket plus the derived backend,
//! control and per-backend data-pipe paths), filesystem permissions, the
//! pidfile location and log settings. The daemon's CLI layer converts parsed
//! options into [`Config`]; everything downstream consumes this crate.

mod defaults;
mod logging;
mod socket;

pub use defaults::{DEFAULT_PERMISSIONS, default_pidfile_path, default_socket_path};
pub use logging::{LogLevel, LogLevelParseError};
pub use socket::SocketPaths;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Complete daemon configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Config {
    /// Stay attached to the terminal instead of forking.
    pub nodaemon: bool,
    /// The well-known socket paths.
    pub sockets: SocketPaths,
    /// Permissions applied to a freshly created client socket.
    pub permission: u32,
    /// Pidfile location.
    pub pidfile: Utf8PathBuf,
    /// Log file; `None` logs to stderr.
    pub logfile: Option<Utf8PathBuf>,
    /// Log verbosity.
    pub loglevel: LogLevel,
    /// Whether the SIMULATE control command is accepted.
    pub allow_simulate: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodaemon: false,
            sockets: SocketPaths::new(default_socket_path()),
            permission: DEFAULT_PERMISSIONS,
            pidfile: default_pidfile_path(),
            logfile: None,
            loglevel: LogLevel::default(),
            allow_simulate: false,
        }
    }
}

/// Parses an octal permission string such as `666`.
///
/// # Errors
///
/// Returns [`PermissionParseError`] when the string is empty or contains a
/// non-octal digit.
pub fn parse_permission(input: &str) -> Result<u32, PermissionParseError> {
    if input.is_empty() {
        return Err(PermissionParseError(input.to_owned()));
    }
    u32::from_str_radix(input, 8).map_err(|_| PermissionParseError(input.to_owned()))
}

/// Error raised for malformed octal permission strings.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid octal mode '{0}'")]
pub struct PermissionParseError(pub String);
