//! Errors surfaced while launching the daemon.

use std::io;

use thiserror::Error;

use crate::event_loop::RuntimeError;
use crate::transport::TransportError;

use super::pidfile::PidfileError;

/// Errors surfaced while launching or supervising the daemon process.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The pidfile could not be created or locked.
    #[error(transparent)]
    Pidfile(#[from] PidfileError),
    /// A listen socket could not be set up.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Signal handlers could not be installed.
    #[error("failed to install signal handlers: {source}")]
    Signals {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Forking into the background failed.
    #[error("daemon() failed: {0}")]
    Daemonize(#[from] daemonize_me::DaemonError),
    /// The pid could not be re-written after forking.
    #[error("cannot update pidfile: {source}")]
    PidUpdate {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The main loop failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
