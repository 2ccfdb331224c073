//! Error types for socket and pipe setup.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while setting up listen sockets and event pipes.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not inspect a pre-existing socket file.
    #[error("could not get file information for '{path}': {source}")]
    Stat {
        /// Path being inspected.
        path: PathBuf,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },
    /// Could not delete a stale socket file.
    #[error("could not delete '{path}': {source}")]
    RemoveStale {
        /// Path being removed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Could not create or bind the listen socket.
    #[error("could not assign address to socket '{path}': {source}")]
    Bind {
        /// Socket path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Could not apply permissions to the socket file.
    #[error("could not set file permissions on '{path}': {source}")]
    Permissions {
        /// Socket path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Could not restore prior ownership of the socket file.
    #[error("could not restore ownership of '{path}': {source}")]
    Ownership {
        /// Socket path.
        path: PathBuf,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },
    /// Could not start listening.
    #[error("listen() failed: {source}")]
    Listen {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Could not switch a descriptor to non-blocking mode.
    #[error("could not set descriptor non-blocking: {source}")]
    NonBlocking {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Could not create the backend event pipe.
    #[error("cannot set up backend fifo '{path}': {source}")]
    Fifo {
        /// Pipe path.
        path: PathBuf,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },
    /// Could not open the backend event pipe.
    #[error("cannot open backend fifo '{path}': {source}")]
    FifoOpen {
        /// Pipe path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// More than one descriptor was inherited through socket activation.
    #[error("too many file descriptors received: {count}")]
    TooManyInheritedFds {
        /// Number of descriptors announced by the activation environment.
        count: u32,
    },
}
