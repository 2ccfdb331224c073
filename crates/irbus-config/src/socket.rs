//! The well-known socket path scheme.

use std::os::fd::RawFd;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// Paths of the three listen sockets and the per-backend data pipes.
///
/// Everything derives from the client socket path: backends connect on
/// `<client>.backend`, control applications on `<client>.control`, and each
/// registered backend gets a named pipe at `<client>-data-<fd>`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SocketPaths {
    client: Utf8PathBuf,
}

impl SocketPaths {
    /// Builds the path scheme from the client socket path.
    #[must_use]
    pub fn new(client: impl Into<Utf8PathBuf>) -> Self {
        Self {
            client: client.into(),
        }
    }

    /// The client socket path.
    #[must_use]
    pub fn client(&self) -> &Utf8Path {
        &self.client
    }

    /// The backend socket path, `<client>.backend`.
    #[must_use]
    pub fn backend(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.backend", self.client))
    }

    /// The control socket path, `<client>.control`.
    #[must_use]
    pub fn control(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.control", self.client))
    }

    /// The data pipe path for the backend with the given command fd.
    #[must_use]
    pub fn data_pipe(&self, fd: RawFd) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}-data-{fd}", self.client))
    }
}
