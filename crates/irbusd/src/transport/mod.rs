//! Listen sockets, accepted connections and backend event pipes.
//!
//! Socket files left over from a previous run are unlinked and recreated;
//! a pre-existing file donates its mode and ownership to the new socket so
//! restarting the daemon does not widen or narrow access. Accepted
//! connections are switched to non-blocking and have `SO_LINGER` zeroed so
//! closing them never stalls the loop.

mod errors;

pub use errors::TransportError;

use std::env;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::Duration;

use nix::libc;
use nix::sys::stat::{Mode, stat};
use nix::unistd::{Gid, Uid, chown, mkfifo};
use socket2::{Domain, SockAddr, Socket, Type};
use tracing::{info, warn};

/// Tracing target for transport operations.
pub(crate) const TRANSPORT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");

const LISTEN_BACKLOG: i32 = 3;
const LISTEN_FDS_START: RawFd = 3;

/// Binds a listen socket at `path`, replacing any stale file.
///
/// A pre-existing file donates its mode, owner and group to the new socket;
/// a fresh path gets `permission`.
///
/// # Errors
///
/// Returns [`TransportError`] when the stale file cannot be replaced, the
/// bind fails, or permissions cannot be applied.
pub fn bind_listen_socket(path: &Path, permission: u32) -> Result<UnixListener, TransportError> {
    let prior = match stat(path) {
        Ok(status) => Some(status),
        Err(nix::Error::ENOENT) => None,
        Err(source) => {
            return Err(TransportError::Stat {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if prior.is_some() {
        fs::remove_file(path).map_err(|source| TransportError::RemoveStale {
            path: path.to_path_buf(),
            source,
        })?;
    }

    let socket = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(|source| {
        TransportError::Bind {
            path: path.to_path_buf(),
            source,
        }
    })?;
    let address = SockAddr::unix(path).map_err(|source| TransportError::Bind {
        path: path.to_path_buf(),
        source,
    })?;
    socket.bind(&address).map_err(|source| TransportError::Bind {
        path: path.to_path_buf(),
        source,
    })?;

    match prior {
        Some(status) => {
            let mode = status.st_mode & 0o777;
            fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| {
                TransportError::Permissions {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            chown(
                path,
                Some(Uid::from_raw(status.st_uid)),
                Some(Gid::from_raw(status.st_gid)),
            )
            .map_err(|source| TransportError::Ownership {
                path: path.to_path_buf(),
                source,
            })?;
        }
        None => {
            fs::set_permissions(path, fs::Permissions::from_mode(permission)).map_err(
                |source| TransportError::Permissions {
                    path: path.to_path_buf(),
                    source,
                },
            )?;
        }
    }

    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|source| TransportError::Listen { source })?;
    socket
        .set_nonblocking(true)
        .map_err(|source| TransportError::NonBlocking { source })?;
    info!(target: TRANSPORT_TARGET, path = %path.display(), "listen socket ready");
    Ok(std::os::fd::OwnedFd::from(socket).into())
}

/// Accepts one pending connection, prepared for the poll loop. Returns
/// `None` when no connection is waiting.
///
/// # Errors
///
/// Returns the accept or setup error; the caller treats it as fatal for the
/// pending connection only.
pub fn accept_on(listener: &UnixListener) -> io::Result<Option<UnixStream>> {
    match listener.accept() {
        Ok((stream, _addr)) => {
            // Zero linger so close() never waits for the peer.
            socket2::SockRef::from(&stream).set_linger(Some(Duration::ZERO))?;
            stream.set_nonblocking(true)?;
            Ok(Some(stream))
        }
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(error) => Err(error),
    }
}

/// Creates the named event pipe for a backend and opens its read end
/// non-blocking. Any stale file at the path is replaced.
///
/// # Errors
///
/// Returns [`TransportError`] when the fifo cannot be created or opened.
pub fn create_event_pipe(path: &camino::Utf8Path) -> Result<File, TransportError> {
    let std_path = path.as_std_path();
    if let Err(error) = fs::remove_file(std_path)
        && error.kind() != io::ErrorKind::NotFound
    {
        return Err(TransportError::RemoveStale {
            path: std_path.to_path_buf(),
            source: error,
        });
    }
    mkfifo(std_path, Mode::from_bits_truncate(0o666)).map_err(|source| TransportError::Fifo {
        path: std_path.to_path_buf(),
        source,
    })?;
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(std_path)
        .map_err(|source| TransportError::FifoOpen {
            path: std_path.to_path_buf(),
            source,
        })
}

/// Adopts a single listen socket inherited through socket activation.
/// Returns `None` when the activation environment is absent or addressed to
/// another process.
///
/// # Errors
///
/// Returns [`TransportError::TooManyInheritedFds`] when more than one
/// descriptor was handed over.
pub fn activated_listener() -> Result<Option<UnixListener>, TransportError> {
    let pid_matches = env::var("LISTEN_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .is_some_and(|pid| pid == std::process::id());
    if !pid_matches {
        return Ok(None);
    }
    let count = env::var("LISTEN_FDS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(0);
    match count {
        0 => Ok(None),
        1 => {
            // SAFETY: the activation protocol guarantees fd 3 is ours once
            // LISTEN_PID names this process.
            let listener = unsafe { UnixListener::from_raw_fd(LISTEN_FDS_START) };
            listener
                .set_nonblocking(true)
                .map_err(|source| TransportError::NonBlocking { source })?;
            info!(target: TRANSPORT_TARGET, "adopted activated listen socket");
            Ok(Some(listener))
        }
        count => Err(TransportError::TooManyInheritedFds { count }),
    }
}

/// Removes a socket's directory entry at shutdown; missing files are fine.
pub fn unlink_socket(path: &Path) {
    if let Err(error) = fs::remove_file(path)
        && error.kind() != io::ErrorKind::NotFound
    {
        warn!(
            target: TRANSPORT_TARGET,
            path = %path.display(),
            %error,
            "failed to remove socket file"
        );
    }
}
