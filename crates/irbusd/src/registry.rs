//! Book-keeping for every open file descriptor.
//!
//! The registry is an arena of [`ConnectionRecord`]s keyed by raw fd. The
//! first three slots always hold the well-known listen sockets (client,
//! backend, control) and live for the daemon's lifetime; everything after
//! them is a dynamically accepted connection. Cross-references between
//! records (`peer_fd`, `connected_to`) are stored as fd values, never as
//! indices or references, so adds and removes cannot invalidate them.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::warn;

use irbus_proto::{LineBuffer, ReplyParser};

/// Tracing target for registry operations.
pub(crate) const REGISTRY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::registry");

/// What a registered descriptor is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Listen socket where clients connect.
    ClientListen,
    /// Listen socket where backends connect.
    BackendListen,
    /// Listen socket where control applications connect.
    ControlListen,
    /// Backend command channel (bidirectional text protocol).
    BackendCmd,
    /// Backend data pipe (decoded events, backend to dispatcher).
    BackendData,
    /// Accepted client connection.
    ClientStream,
    /// Accepted control connection.
    ControlStream,
}

impl Role {
    /// Whether this role is one of the three immortal listen sockets.
    #[must_use]
    pub fn is_listener(self) -> bool {
        matches!(
            self,
            Self::ClientListen | Self::BackendListen | Self::ControlListen
        )
    }
}

/// The other end of an in-flight command conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Originator {
    /// A connected socket, identified by its descriptor.
    Peer(RawFd),
    /// The dispatcher itself; used for the registration handshake.
    Local,
}

/// The IO object owned by a record.
#[derive(Debug)]
pub enum Channel {
    /// A listen socket.
    Listener(UnixListener),
    /// An accepted stream connection.
    Stream(UnixStream),
    /// A named-pipe read end.
    Pipe(File),
}

impl Channel {
    fn as_borrowed_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Listener(listener) => listener.as_fd(),
            Self::Stream(stream) => stream.as_fd(),
            Self::Pipe(file) => file.as_fd(),
        }
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.as_borrowed_fd().as_raw_fd()
    }
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Stream(stream) => stream.read(buf),
            Self::Pipe(file) => file.read(buf),
            Self::Listener(_) => Err(io::Error::from(io::ErrorKind::Unsupported)),
        }
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Stream(stream) => stream.write(buf),
            Self::Pipe(_) | Self::Listener(_) => {
                Err(io::Error::from(io::ErrorKind::Unsupported))
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Stream(stream) => stream.flush(),
            Self::Pipe(_) | Self::Listener(_) => Ok(()),
        }
    }
}

/// Housekeeping data for one open descriptor.
///
/// Client and backend records are related two ways: a backend's command and
/// data descriptors reference each other through `peer_fd`, and a client is
/// connected to a backend through `connected_to` on both sides while a
/// command is in flight. The timeout counter is armed when routing starts
/// and disarmed when the reply completes.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub(crate) channel: Channel,
    pub(crate) role: Role,
    pub(crate) backend_pid: Option<u32>,
    pub(crate) backend_id: String,
    pub(crate) peer_fd: Option<RawFd>,
    pub(crate) connected_to: Option<Originator>,
    pub(crate) expected: String,
    pub(crate) ticks: Option<u32>,
    pub(crate) line_buffer: LineBuffer,
    pub(crate) reply_parser: ReplyParser,
}

impl ConnectionRecord {
    fn new(channel: Channel, role: Role) -> Self {
        Self {
            channel,
            role,
            backend_pid: None,
            backend_id: String::new(),
            peer_fd: None,
            connected_to: None,
            expected: String::new(),
            ticks: None,
            line_buffer: LineBuffer::new(),
            reply_parser: ReplyParser::new(),
        }
    }

    /// The descriptor this record tracks.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.channel.as_raw_fd()
    }

    /// The record's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// The backend id (`driver@device`), empty until the handshake completes.
    #[must_use]
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// The other end of the in-flight conversation, if any.
    #[must_use]
    pub fn connected_to(&self) -> Option<Originator> {
        self.connected_to
    }

    /// Whether the timeout countdown is armed.
    #[must_use]
    pub fn ticks_armed(&self) -> bool {
        self.ticks.is_some()
    }
}

/// Readiness reported for one registered descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    /// The descriptor that became ready.
    pub fd: RawFd,
    /// The poll revents flags.
    pub flags: PollFlags,
}

/// The socket arena. The first three slots are the well-known listen
/// sockets; the layout favours a fast poll snapshot, other lookups walk the
/// vector.
#[derive(Debug)]
pub struct FdRegistry {
    records: Vec<ConnectionRecord>,
}

impl FdRegistry {
    /// Builds the registry around the three listen sockets.
    #[must_use]
    pub fn new(client: UnixListener, backend: UnixListener, control: UnixListener) -> Self {
        Self {
            records: vec![
                ConnectionRecord::new(Channel::Listener(client), Role::ClientListen),
                ConnectionRecord::new(Channel::Listener(backend), Role::BackendListen),
                ConnectionRecord::new(Channel::Listener(control), Role::ControlListen),
            ],
        }
    }

    /// Appends an accepted client connection and returns its fd.
    pub fn add_client(&mut self, stream: UnixStream) -> RawFd {
        let fd = stream.as_raw_fd();
        self.records
            .push(ConnectionRecord::new(Channel::Stream(stream), Role::ClientStream));
        fd
    }

    /// Appends an accepted control connection and returns its fd.
    pub fn add_control_client(&mut self, stream: UnixStream) -> RawFd {
        let fd = stream.as_raw_fd();
        self.records
            .push(ConnectionRecord::new(Channel::Stream(stream), Role::ControlStream));
        fd
    }

    /// Appends a backend command/data pair, cross-linked through `peer_fd`.
    /// Returns the command fd.
    pub fn add_backend(&mut self, cmd: UnixStream, data: File) -> RawFd {
        let cmd_fd = cmd.as_raw_fd();
        let data_fd = data.as_raw_fd();

        let mut data_record = ConnectionRecord::new(Channel::Pipe(data), Role::BackendData);
        data_record.peer_fd = Some(cmd_fd);
        self.records.push(data_record);

        let mut cmd_record = ConnectionRecord::new(Channel::Stream(cmd), Role::BackendCmd);
        cmd_record.peer_fd = Some(data_fd);
        self.records.push(cmd_record);
        cmd_fd
    }

    /// Removes the record for `fd`, and its peer when the record is half of
    /// a backend pair. Dropping the returned record closes the descriptor.
    ///
    /// # Panics
    ///
    /// Panics when `fd` names one of the three listen sockets; those are
    /// immortal and removing one is a programming error.
    pub fn remove(&mut self, fd: RawFd) -> Option<ConnectionRecord> {
        let index = self.records.iter().position(|record| record.fd() == fd)?;
        assert!(
            !self.records[index].role.is_listener(),
            "attempt to remove listen socket {fd}"
        );
        let record = self.records.remove(index);
        if let Some(peer_fd) = record.peer_fd {
            if let Some(peer_index) =
                self.records.iter().position(|peer| peer.fd() == peer_fd)
            {
                let peer = self.records.remove(peer_index);
                shutdown_stream(&peer);
            } else {
                warn!(
                    target: REGISTRY_TARGET,
                    fd,
                    peer_fd,
                    "backend peer already gone"
                );
            }
        }
        shutdown_stream(&record);
        Some(record)
    }

    /// Looks up a record by fd.
    #[must_use]
    pub fn find(&self, fd: RawFd) -> Option<&ConnectionRecord> {
        self.records.iter().find(|record| record.fd() == fd)
    }

    /// Looks up a record by fd, mutably.
    pub fn find_mut(&mut self, fd: RawFd) -> Option<&mut ConnectionRecord> {
        self.records.iter_mut().find(|record| record.fd() == fd)
    }

    /// Looks up a registered backend command record by its id.
    #[must_use]
    pub fn find_by_backend_id(&self, id: &str) -> Option<&ConnectionRecord> {
        self.records
            .iter()
            .find(|record| record.role == Role::BackendCmd && record.backend_id == id)
    }

    /// Iterates over all records.
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.records.iter()
    }

    /// Iterates over all records, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectionRecord> {
        self.records.iter_mut()
    }

    /// Iterates over records with the given role.
    pub fn iter_by_role(&self, role: Role) -> impl Iterator<Item = &ConnectionRecord> {
        self.records.iter().filter(move |record| record.role == role)
    }

    /// Number of tracked descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the registry holds no records (never true in practice; the
    /// listen sockets are always present).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The client listen socket.
    #[must_use]
    pub fn client_listener(&self) -> &UnixListener {
        self.listener_at(0)
    }

    /// The backend listen socket.
    #[must_use]
    pub fn backend_listener(&self) -> &UnixListener {
        self.listener_at(1)
    }

    /// The control listen socket.
    #[must_use]
    pub fn control_listener(&self) -> &UnixListener {
        self.listener_at(2)
    }

    fn listener_at(&self, slot: usize) -> &UnixListener {
        match &self.records[slot].channel {
            Channel::Listener(listener) => listener,
            _ => unreachable!("well-known slot {slot} must hold a listener"),
        }
    }

    /// Polls every registered descriptor for input readiness and returns a
    /// snapshot of those with pending events. A snapshot (rather than
    /// iterators into the arena) keeps the caller free to add and remove
    /// records while acting on it.
    ///
    /// # Errors
    ///
    /// Returns the `poll(2)` error; `EINTR` is the caller's to retry.
    pub fn poll_ready(&self, timeout: PollTimeout) -> nix::Result<Vec<Readiness>> {
        let mut pollfds: Vec<PollFd<'_>> = self
            .records
            .iter()
            .map(|record| PollFd::new(record.channel.as_borrowed_fd(), PollFlags::POLLIN))
            .collect();
        let ready = poll(&mut pollfds, timeout)?;
        if ready == 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .records
            .iter()
            .zip(&pollfds)
            .filter_map(|(record, pollfd)| {
                let flags = pollfd.revents().unwrap_or(PollFlags::empty());
                (!flags.is_empty()).then_some(Readiness {
                    fd: record.fd(),
                    flags,
                })
            })
            .collect())
    }
}

fn shutdown_stream(record: &ConnectionRecord) {
    if let Channel::Stream(stream) = &record.channel {
        let _ = stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use tempfile::tempdir;

    use super::*;

    fn listener_in(dir: &std::path::Path, name: &str) -> UnixListener {
        UnixListener::bind(dir.join(name)).expect("bind listener")
    }

    fn registry() -> (FdRegistry, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let registry = FdRegistry::new(
            listener_in(dir.path(), "client"),
            listener_in(dir.path(), "backend"),
            listener_in(dir.path(), "control"),
        );
        (registry, dir)
    }

    fn pipe_file() -> File {
        tempfile::tempfile().expect("tempfile")
    }

    #[test]
    fn listen_sockets_occupy_the_first_slots() {
        let (registry, _dir) = registry();
        let roles: Vec<Role> = registry.iter().map(ConnectionRecord::role).collect();
        assert_eq!(
            roles,
            [Role::ClientListen, Role::BackendListen, Role::ControlListen]
        );
    }

    #[test]
    fn add_and_remove_client() {
        let (mut registry, _dir) = registry();
        let (local, _remote) = UnixStream::pair().expect("socketpair");
        let fd = registry.add_client(local);
        assert_eq!(registry.find(fd).map(ConnectionRecord::role), Some(Role::ClientStream));

        let removed = registry.remove(fd).expect("removed");
        assert_eq!(removed.fd(), fd);
        assert!(registry.find(fd).is_none());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn backend_pair_is_cross_linked_and_removed_together() {
        let (mut registry, _dir) = registry();
        let (cmd, _remote) = UnixStream::pair().expect("socketpair");
        let data = pipe_file();
        let data_fd = data.as_raw_fd();
        let cmd_fd = registry.add_backend(cmd, data);

        assert_eq!(registry.find(cmd_fd).and_then(|r| r.peer_fd), Some(data_fd));
        assert_eq!(registry.find(data_fd).and_then(|r| r.peer_fd), Some(cmd_fd));

        registry.remove(data_fd).expect("removed");
        assert!(registry.find(cmd_fd).is_none());
        assert!(registry.find(data_fd).is_none());
    }

    #[test]
    fn finds_backend_by_id() {
        let (mut registry, _dir) = registry();
        let (cmd, _remote) = UnixStream::pair().expect("socketpair");
        let cmd_fd = registry.add_backend(cmd, pipe_file());
        registry.find_mut(cmd_fd).expect("record").backend_id = "acme@/dev/ir0".into();

        let found = registry.find_by_backend_id("acme@/dev/ir0").expect("found");
        assert_eq!(found.fd(), cmd_fd);
        assert!(registry.find_by_backend_id("other@/dev/ir1").is_none());
    }

    #[test]
    fn remove_of_unknown_fd_is_none() {
        let (mut registry, _dir) = registry();
        assert!(registry.remove(9999).is_none());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    #[should_panic(expected = "listen socket")]
    fn removing_a_listener_panics() {
        let (mut registry, _dir) = registry();
        let fd = registry.client_listener().as_raw_fd();
        let _ = registry.remove(fd);
    }

    #[test]
    fn poll_reports_readable_stream() {
        use std::io::Write as _;

        let (mut registry, _dir) = registry();
        let (local, mut remote) = UnixStream::pair().expect("socketpair");
        let fd = registry.add_client(local);
        remote.write_all(b"VERSION\n").expect("write");

        let ready = registry
            .poll_ready(PollTimeout::from(100u16))
            .expect("poll");
        assert!(ready.iter().any(|r| r.fd == fd && r.flags.contains(PollFlags::POLLIN)));
    }
}
