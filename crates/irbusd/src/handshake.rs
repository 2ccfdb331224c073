//! Backend registration: the GET_BACKEND_INFO / SET_DATA_SOCKET handshake.
//!
//! A freshly accepted backend owns nothing but its command socket. The
//! dispatcher creates a named pipe for decoded events, registers the pair,
//! marks the command side as locally connected and asks the backend to
//! identify itself. Once the backend confirms the data pipe, it is promoted
//! to default backend and the pipe's directory entry is removed (the open
//! descriptor survives).

use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use thiserror::Error;
use tracing::{debug, warn};

use irbus_config::SocketPaths;
use irbus_proto::ReplyOutcome;

use crate::registry::Originator;
use crate::router::Router;
use crate::transport::{self, TransportError};

/// Tracing target for handshake operations.
pub(crate) const HANDSHAKE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::handshake");

const GET_BACKEND_INFO: &str = "GET_BACKEND_INFO";
const SET_DATA_SOCKET: &str = "SET_DATA_SOCKET";

/// Errors aborting a backend registration.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The event pipe could not be created or opened.
    #[error("cannot set up backend event pipe: {source}")]
    Pipe {
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },
    /// The identification command could not be written.
    #[error("cannot write {GET_BACKEND_INFO} to backend: {source}")]
    CommandWrite {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Registers a freshly accepted backend command socket and initiates the
/// handshake. Returns the backend's command fd.
///
/// # Errors
///
/// Returns [`HandshakeError`] when the event pipe cannot be set up or the
/// identification command cannot be sent; the connection is dropped and any
/// pipe remnants are cleaned up.
pub fn register_backend(
    router: &mut Router,
    cmd: UnixStream,
    sockets: &SocketPaths,
) -> Result<RawFd, HandshakeError> {
    let cmd_fd = cmd.as_raw_fd();
    let pipe_path = sockets.data_pipe(cmd_fd);

    let data = transport::create_event_pipe(&pipe_path)
        .map_err(|source| HandshakeError::Pipe { source })?;
    debug!(target: HANDSHAKE_TARGET, %pipe_path, "waiting for event input");

    router.registry_mut().add_backend(cmd, data);
    router.connect(Originator::Local, cmd_fd);

    let write_result = router
        .registry_mut()
        .find_mut(cmd_fd)
        .map(|record| record.channel.write_all(format!("{GET_BACKEND_INFO}\n").as_bytes()))
        .unwrap_or_else(|| Err(io::Error::from(io::ErrorKind::NotFound)));
    if let Err(source) = write_result {
        abort_registration(router, cmd_fd, sockets, "identification write failed");
        return Err(HandshakeError::CommandWrite { source });
    }
    Ok(cmd_fd)
}

/// Consumes one reply line from a backend whose command conversation is
/// locally connected, advancing the handshake when the frame completes.
pub fn handle_local_reply(router: &mut Router, fd: RawFd, line: &str, sockets: &SocketPaths) {
    let Some(record) = router.registry_mut().find_mut(fd) else {
        return;
    };
    record.reply_parser.feed(line);
    if !record.reply_parser.is_completed() {
        return;
    }
    let outcome = record.reply_parser.outcome();
    let command = record.reply_parser.command().to_owned();
    let payload = record.reply_parser.data().first().cloned();
    let last_line = record.reply_parser.last_line().to_owned();
    record.reply_parser.reset();

    if outcome != ReplyOutcome::Ok {
        warn!(
            target: HANDSHAKE_TARGET,
            fd,
            ?outcome,
            last_line,
            "cannot handle backend reply"
        );
        abort_registration(router, fd, sockets, "handshake reply failed");
        return;
    }
    match command.as_str() {
        GET_BACKEND_INFO => complete_identification(router, fd, payload, sockets),
        SET_DATA_SOCKET => complete_registration(router, fd, sockets),
        other => warn!(target: HANDSHAKE_TARGET, fd, reply = other, "unknown backend reply"),
    }
}

/// Parses the `<type> <pid> <driver> <device>` identification payload and
/// asks the backend to attach to its event pipe.
fn complete_identification(
    router: &mut Router,
    fd: RawFd,
    payload: Option<String>,
    sockets: &SocketPaths,
) {
    let Some(info) = payload.as_deref().and_then(BackendInfo::parse) else {
        warn!(
            target: HANDSHAKE_TARGET,
            fd,
            payload = payload.as_deref().unwrap_or(""),
            "cannot register backend"
        );
        abort_registration(router, fd, sockets, "malformed identification");
        return;
    };
    if let Some(record) = router.registry_mut().find_mut(fd) {
        record.backend_id = info.id();
        record.backend_pid = Some(info.pid);
    }
    let pipe_path = sockets.data_pipe(fd);
    let command = format!("{SET_DATA_SOCKET} {pipe_path}\n");
    if !router.write_raw(fd, command.as_bytes()) {
        abort_registration(router, fd, sockets, "data socket command write failed");
    }
}

/// Finishes the registration: promote to default backend, drop the pipe's
/// directory entry and return the conversation to idle.
fn complete_registration(router: &mut Router, fd: RawFd, sockets: &SocketPaths) {
    router.set_default_backend(Some(fd));
    let pipe_path = sockets.data_pipe(fd);
    remove_pipe_entry(pipe_path.as_std_path());
    let id = router
        .registry()
        .find(fd)
        .map(|record| record.backend_id().to_owned())
        .unwrap_or_default();
    debug!(
        target: HANDSHAKE_TARGET,
        fd,
        id,
        %pipe_path,
        "final backend registration"
    );
    router.disconnect(fd);
}

fn abort_registration(router: &mut Router, fd: RawFd, sockets: &SocketPaths, why: &str) {
    warn!(target: HANDSHAKE_TARGET, fd, why, "backend registration aborted");
    remove_pipe_entry(sockets.data_pipe(fd).as_std_path());
    router.remove_connection(fd, why);
}

fn remove_pipe_entry(path: &std::path::Path) {
    if let Err(error) = std::fs::remove_file(path)
        && error.kind() != io::ErrorKind::NotFound
    {
        warn!(
            target: HANDSHAKE_TARGET,
            path = %path.display(),
            %error,
            "failed to remove event pipe entry"
        );
    }
}

/// The identification payload: `<type> <pid> <driver> <device>`.
struct BackendInfo {
    pid: u32,
    driver: String,
    device: String,
}

impl BackendInfo {
    fn parse(payload: &str) -> Option<Self> {
        let mut tokens = payload.split_ascii_whitespace();
        let _backend_type = tokens.next()?;
        let pid = tokens.next()?.parse().ok()?;
        let driver = tokens.next()?.to_owned();
        let device = tokens.next()?.to_owned();
        Some(Self {
            pid,
            driver,
            device,
        })
    }

    fn id(&self) -> String {
        format!("{}@{}", self.driver, self.device)
    }
}
