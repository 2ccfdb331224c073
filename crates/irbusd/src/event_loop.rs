//! The single-threaded readiness loop.
//!
//! One poll over every registered descriptor is the only place the daemon
//! blocks, bounded by the 50 ms heartbeat. Signals deposit a token in a
//! single-slot pending field and are drained at loop head, so handler code
//! never touches shared state. A poll timeout advances the heartbeat and
//! with it the per-command timeout counters.

use std::io::Read;
use std::os::fd::RawFd;
use std::time::Duration;

use nix::poll::{PollFlags, PollTimeout};
use thiserror::Error;
use tracing::{debug, error, warn};

use irbus_config::Config;
use irbus_proto::PACKET_SIZE;

use crate::dispatch::{self, Scope};
use crate::handshake;
use crate::process::signals::{PendingSignal, SignalToken};
use crate::registry::{ConnectionRecord, Role};
use crate::router::Router;
use crate::telemetry::LogHandle;
use crate::transport;

/// Tracing target for the main loop.
pub(crate) const LOOP_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::event_loop");

const HEARTBEAT_MS: u16 = 50;

/// Heartbeat period; one timer tick.
pub const HEARTBEAT: Duration = Duration::from_millis(HEARTBEAT_MS as u64);

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// SIGTERM or SIGINT: shut down.
    Term,
    /// SIGUSR1: clean exit with status 0.
    Usr1,
}

/// Errors that end the loop.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The readiness wait itself failed.
    #[error("poll() failed: {source}")]
    Poll {
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },
}

/// Outcome of reading one chunk from a stream record.
enum Fill {
    /// Bytes (possibly none) were appended to the record's line buffer.
    Filled,
    /// The peer is gone: EOF or a hard read error.
    Closed,
}

/// The daemon main loop over a [`Router`].
#[derive(Debug)]
pub struct EventLoop {
    router: Router,
    config: Config,
    pending: PendingSignal,
    log: LogHandle,
    heartbeats: u64,
}

impl EventLoop {
    /// Assembles the loop from its collaborators.
    #[must_use]
    pub fn new(router: Router, config: Config, pending: PendingSignal, log: LogHandle) -> Self {
        Self {
            router,
            config,
            pending,
            log,
            heartbeats: 0,
        }
    }

    /// The routing state, for inspection.
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The routing state, mutably.
    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    /// Heartbeats elapsed so far.
    #[must_use]
    pub fn heartbeats(&self) -> u64 {
        self.heartbeats
    }

    /// Runs until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when the readiness wait fails.
    pub fn run(&mut self) -> Result<Shutdown, RuntimeError> {
        loop {
            if let Some(shutdown) = self.drain_signal() {
                return Ok(shutdown);
            }
            self.poll_cycle(HEARTBEAT_MS)?;
        }
    }

    /// Consumes a pending signal token, if any. Returns the shutdown reason
    /// when the token asks for one.
    pub fn drain_signal(&mut self) -> Option<Shutdown> {
        match self.pending.take()? {
            SignalToken::Term => Some(Shutdown::Term),
            SignalToken::Usr1 => Some(Shutdown::Usr1),
            SignalToken::Alrm => {
                self.router.tick();
                None
            }
            SignalToken::Hup => {
                if let Err(log_error) = self.log.reopen() {
                    error!(target: LOOP_TARGET, %log_error, "cannot reopen log, shutting down");
                    return Some(Shutdown::Term);
                }
                self.router.broadcast_sighup();
                None
            }
        }
    }

    /// One poll pass: wait for readiness, dispatch every ready descriptor,
    /// then give idle connections a chance to drain buffered commands.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when the readiness wait fails. An
    /// interrupted wait returns normally so pending signals get drained.
    pub fn poll_cycle(&mut self, timeout_ms: u16) -> Result<(), RuntimeError> {
        let ready = match self.router.registry().poll_ready(PollTimeout::from(timeout_ms)) {
            Ok(ready) => ready,
            Err(nix::Error::EINTR) => return Ok(()),
            Err(source) => return Err(RuntimeError::Poll { source }),
        };
        if ready.is_empty() {
            self.heartbeats += 1;
            self.router.tick();
            return Ok(());
        }
        for item in ready {
            // Records can disappear while earlier entries are handled.
            if self.router.registry().find(item.fd).is_none() {
                continue;
            }
            if item
                .flags
                .intersects(PollFlags::POLLERR | PollFlags::POLLNVAL)
            {
                self.remove_non_listener(item.fd, "poll error");
                continue;
            }
            if item.flags.contains(PollFlags::POLLIN) {
                self.handle_input(item.fd);
            }
            if item.flags.contains(PollFlags::POLLHUP)
                && self.router.registry().find(item.fd).is_some()
            {
                self.remove_non_listener(item.fd, "POLLHUP");
            }
        }
        self.drain_idle_buffers();
        Ok(())
    }

    fn remove_non_listener(&mut self, fd: RawFd, why: &str) {
        let is_listener = self
            .router
            .registry()
            .find(fd)
            .is_some_and(|record| record.role().is_listener());
        if is_listener {
            error!(target: LOOP_TARGET, fd, why, "listen socket failed");
            return;
        }
        self.router.remove_connection(fd, why);
    }

    /// Invokes the proper action for one readable descriptor.
    fn handle_input(&mut self, fd: RawFd) {
        let Some(role) = self.router.registry().find(fd).map(ConnectionRecord::role) else {
            return;
        };
        match role {
            Role::ClientListen => {
                debug!(target: LOOP_TARGET, "registering client");
                self.accept_client(Role::ClientListen);
            }
            Role::ControlListen => {
                debug!(target: LOOP_TARGET, "registering control client");
                self.accept_client(Role::ControlListen);
            }
            Role::BackendListen => {
                debug!(target: LOOP_TARGET, "registering backend");
                self.accept_backend();
            }
            Role::BackendData => match self.fill_buffer(fd) {
                Fill::Closed => self.router.remove_connection(fd, "backend data channel closed"),
                Fill::Filled => {
                    for line in self.drain_lines(fd) {
                        self.router.broadcast_event(&line);
                    }
                }
            },
            Role::BackendCmd => match self.fill_buffer(fd) {
                Fill::Closed => self.router.remove_connection(fd, "backend command channel closed"),
                Fill::Filled => {
                    for line in self.drain_lines(fd) {
                        dispatch::handle_backend_line(&mut self.router, fd, &line, &self.config);
                    }
                }
            },
            Role::ClientStream => match self.fill_buffer(fd) {
                Fill::Closed => self.router.remove_connection(fd, "client hung up"),
                Fill::Filled => {
                    dispatch::pump_stream(&mut self.router, fd, Scope::Client, &self.config);
                }
            },
            Role::ControlStream => match self.fill_buffer(fd) {
                Fill::Closed => self.router.remove_connection(fd, "control client hung up"),
                Fill::Filled => {
                    dispatch::pump_stream(&mut self.router, fd, Scope::Control, &self.config);
                }
            },
        }
    }

    fn accept_client(&mut self, listener_role: Role) {
        let accepted = {
            let registry = self.router.registry();
            let listener = if listener_role == Role::ClientListen {
                registry.client_listener()
            } else {
                registry.control_listener()
            };
            transport::accept_on(listener)
        };
        match accepted {
            Ok(Some(stream)) => {
                let fd = if listener_role == Role::ClientListen {
                    self.router.registry_mut().add_client(stream)
                } else {
                    self.router.registry_mut().add_control_client(stream)
                };
                debug!(target: LOOP_TARGET, fd, "added new client");
            }
            Ok(None) => {}
            Err(error) => warn!(target: LOOP_TARGET, %error, "accept() failed for new client"),
        }
    }

    fn accept_backend(&mut self) {
        match transport::accept_on(self.router.registry().backend_listener()) {
            Ok(Some(stream)) => {
                if let Err(error) =
                    handshake::register_backend(&mut self.router, stream, &self.config.sockets)
                {
                    warn!(target: LOOP_TARGET, %error, "backend registration failed");
                }
            }
            Ok(None) => {}
            Err(error) => warn!(target: LOOP_TARGET, %error, "accept() failed for new backend"),
        }
    }

    /// Reads one chunk into the record's line buffer.
    fn fill_buffer(&mut self, fd: RawFd) -> Fill {
        let Some(record) = self.router.registry_mut().find_mut(fd) else {
            return Fill::Filled;
        };
        let mut buffer = [0_u8; PACKET_SIZE];
        match record.channel.read(&mut buffer) {
            Ok(0) => Fill::Closed,
            Ok(n) => {
                record.line_buffer.append(&buffer[..n]);
                Fill::Filled
            }
            Err(error)
                if matches!(
                    error.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                ) =>
            {
                Fill::Filled
            }
            Err(error) => {
                debug!(target: LOOP_TARGET, fd, %error, "read failed");
                Fill::Closed
            }
        }
    }

    /// Removes and returns every complete line buffered on `fd`.
    fn drain_lines(&mut self, fd: RawFd) -> Vec<String> {
        let Some(record) = self.router.registry_mut().find_mut(fd) else {
            return Vec::new();
        };
        let mut lines = Vec::new();
        while let Some(line) = record.line_buffer.next_line() {
            lines.push(line);
        }
        lines
    }

    /// Commands buffered behind an in-flight conversation are dispatched
    /// once the connection returns to idle; no new bytes need to arrive for
    /// that, so sweep after every pass.
    fn drain_idle_buffers(&mut self) {
        let pending: Vec<(RawFd, Scope)> = self
            .router
            .registry()
            .iter()
            .filter(|record| {
                record.connected_to().is_none() && record.line_buffer.has_lines()
            })
            .filter_map(|record| match record.role() {
                Role::ClientStream => Some((record.fd(), Scope::Client)),
                Role::ControlStream => Some((record.fd(), Scope::Control)),
                _ => None,
            })
            .collect();
        for (fd, scope) in pending {
            dispatch::pump_stream(&mut self.router, fd, scope, &self.config);
        }
    }
}
