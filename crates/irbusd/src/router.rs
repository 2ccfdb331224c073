//! Client/backend routing: connect, disconnect, broadcast and timeouts.
//!
//! The router owns the registry and the routing state stored in its records.
//! A client and a backend become connected while a command is in flight;
//! connected clients receive no event broadcasts and their timeout counter
//! runs. The relation is dissolved by the terminating `END` line from the
//! backend, by a timeout, or by either peer disappearing.

use std::fs::File;
use std::io::Write;
use std::os::fd::RawFd;

use tracing::{debug, info, warn};

use irbus_proto::{Reply, send_error, send_sighup};

use crate::registry::{ConnectionRecord, FdRegistry, Originator, Role};

/// Tracing target for routing operations.
pub(crate) const ROUTER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::router");

/// Heartbeat ticks before an unanswered command times out.
pub const COMMAND_TIMEOUT_TICKS: u32 = 20;

/// Routing engine over the fd registry.
#[derive(Debug)]
pub struct Router {
    registry: FdRegistry,
    default_backend: Option<RawFd>,
    event_log: Option<File>,
}

impl Router {
    /// Wraps a registry with empty routing state.
    #[must_use]
    pub fn new(registry: FdRegistry) -> Self {
        Self {
            registry,
            default_backend: None,
            event_log: None,
        }
    }

    /// The underlying registry.
    #[must_use]
    pub fn registry(&self) -> &FdRegistry {
        &self.registry
    }

    /// The underlying registry, mutably.
    pub fn registry_mut(&mut self) -> &mut FdRegistry {
        &mut self.registry
    }

    /// The backend receiving unqualified client commands, if any.
    #[must_use]
    pub fn default_backend(&self) -> Option<RawFd> {
        self.default_backend
    }

    /// Selects the default backend.
    pub fn set_default_backend(&mut self, fd: Option<RawFd>) {
        self.default_backend = fd;
    }

    /// Replaces the decoded-event log sink; `None` disables logging.
    pub fn set_event_log(&mut self, sink: Option<File>) {
        self.event_log = sink;
    }

    /// Marks `backend_fd` as answering to `origin`. A [`Originator::Local`]
    /// origin marks the backend side only; a peer origin also marks the
    /// client side and arms its timeout counter. Returns `false` when an
    /// involved record is missing or the backend is already routing; a
    /// busy backend is never stolen from its current originator.
    pub fn connect(&mut self, origin: Originator, backend_fd: RawFd) -> bool {
        debug!(target: ROUTER_TARGET, ?origin, backend_fd, "connecting");
        let Some(backend) = self.registry.find_mut(backend_fd) else {
            return false;
        };
        if backend.connected_to.is_some() {
            debug!(target: ROUTER_TARGET, backend_fd, "backend already routing");
            return false;
        }
        backend.connected_to = Some(origin);
        let Originator::Peer(client_fd) = origin else {
            return true;
        };
        let Some(client) = self.registry.find_mut(client_fd) else {
            return false;
        };
        client.connected_to = Some(Originator::Peer(backend_fd));
        client.ticks = Some(COMMAND_TIMEOUT_TICKS);
        true
    }

    /// Dissolves the routing relation given either of its two parties, and
    /// disarms the timeout counter. A no-op on idle records. Returns whether
    /// a relation existed.
    pub fn disconnect(&mut self, fd: RawFd) -> bool {
        let Some(record) = self.registry.find_mut(fd) else {
            return false;
        };
        record.ticks = None;
        match record.connected_to.take() {
            None => false,
            // The local dispatcher client has no record of its own.
            Some(Originator::Local) => true,
            Some(Originator::Peer(other_fd)) => {
                if let Some(other) = self.registry.find_mut(other_fd) {
                    other.connected_to = None;
                    other.ticks = None;
                }
                true
            }
        }
    }

    /// Writes a decoded event line to every idle client. Clients whose write
    /// fails are removed; clients in command mode are skipped entirely.
    pub fn broadcast_event(&mut self, line: &str) {
        self.log_event(line);
        let idle: Vec<RawFd> = self
            .registry
            .iter_by_role(Role::ClientStream)
            .filter(|record| record.connected_to.is_none())
            .map(ConnectionRecord::fd)
            .collect();
        for fd in idle {
            if !self.write_raw(fd, format!("{line}\n").as_bytes()) {
                self.remove_connection(fd, "event write failed");
            }
        }
    }

    /// Broadcasts the SIGHUP frame to every idle client; clients whose write
    /// fails are removed.
    pub fn broadcast_sighup(&mut self) {
        let idle: Vec<RawFd> = self
            .registry
            .iter_by_role(Role::ClientStream)
            .filter(|record| record.connected_to.is_none())
            .map(ConnectionRecord::fd)
            .collect();
        for fd in idle {
            let ok = self
                .registry
                .find_mut(fd)
                .is_some_and(|record| send_sighup(&mut record.channel).is_ok());
            if !ok {
                self.remove_connection(fd, "sighup write failed");
            }
        }
    }

    /// Advances the heartbeat: decrements every armed counter and times out
    /// those reaching zero with a synthetic `ERROR ... TIMEOUT` reply.
    pub fn tick(&mut self) {
        let mut expired: Vec<(RawFd, String)> = Vec::new();
        for record in self.registry.iter_mut() {
            if !matches!(record.role(), Role::ClientStream | Role::ControlStream) {
                continue;
            }
            let fd = record.fd();
            let Some(ticks) = record.ticks.as_mut() else {
                continue;
            };
            *ticks -= 1;
            if *ticks == 0 {
                expired.push((fd, record.expected.clone()));
            }
        }
        for (fd, expected) in expired {
            debug!(target: ROUTER_TARGET, fd, "command timeout");
            self.disconnect(fd);
            self.send_error_to(fd, &expected, "TIMEOUT");
        }
    }

    /// Sends an error reply to `fd`, removing the connection when the write
    /// fails.
    pub fn send_error_to(&mut self, fd: RawFd, message: &str, text: &str) {
        let ok = self
            .registry
            .find_mut(fd)
            .is_some_and(|record| send_error(&mut record.channel, message, text).is_ok());
        if !ok {
            self.remove_connection(fd, "error reply write failed");
        }
    }

    /// Sends an encoded reply to `fd`, removing the connection when the
    /// write fails.
    pub fn send_reply_to(&mut self, fd: RawFd, reply: &Reply) {
        if !self.write_raw(fd, reply.encode().as_bytes()) {
            self.remove_connection(fd, "reply write failed");
        }
    }

    /// Writes raw bytes to `fd`; returns whether the whole buffer went out.
    pub fn write_raw(&mut self, fd: RawFd, bytes: &[u8]) -> bool {
        self.registry
            .find_mut(fd)
            .is_some_and(|record| record.channel.write_all(bytes).is_ok())
    }

    /// Removes a connection after a peer failure, cleaning up the routing
    /// state it participated in. Removing half of a backend pair removes the
    /// other half, tells a waiting client the backend is gone, and picks a
    /// replacement default backend.
    pub fn remove_connection(&mut self, fd: RawFd, why: &str) {
        let Some(record) = self.registry.find(fd) else {
            return;
        };
        debug!(target: ROUTER_TARGET, fd, why, "removing connection");
        match record.role() {
            Role::BackendCmd | Role::BackendData => {
                let cmd_fd = if record.role() == Role::BackendCmd {
                    fd
                } else {
                    record.peer_fd.unwrap_or(fd)
                };
                let waiting = match self.registry.find(cmd_fd).and_then(|r| r.connected_to) {
                    Some(Originator::Peer(client_fd)) => Some(client_fd),
                    _ => None,
                };
                if let Some(client_fd) = waiting {
                    let expected = self
                        .registry
                        .find(client_fd)
                        .map(|client| client.expected.clone())
                        .unwrap_or_default();
                    self.disconnect(cmd_fd);
                    self.send_error_to(client_fd, &expected, "backend closed connection");
                }
                self.registry.remove(fd);
                if self.default_backend == Some(cmd_fd) {
                    self.choose_new_default();
                }
            }
            Role::ClientStream | Role::ControlStream => {
                self.disconnect(fd);
                self.registry.remove(fd);
                info!(target: ROUTER_TARGET, fd, why, "removed client");
            }
            role => {
                warn!(target: ROUTER_TARGET, fd, ?role, "refusing to remove listen socket");
            }
        }
    }

    /// Picks a replacement default backend: the first remaining registered
    /// backend, or none.
    pub fn choose_new_default(&mut self) {
        self.default_backend = self
            .registry
            .iter_by_role(Role::BackendCmd)
            .find(|record| !record.backend_id.is_empty())
            .map(ConnectionRecord::fd);
        debug!(
            target: ROUTER_TARGET,
            default = ?self.default_backend,
            "new default backend"
        );
    }

    fn log_event(&mut self, line: &str) {
        let Some(log) = self.event_log.as_mut() else {
            return;
        };
        if writeln!(log, "{line}").is_err() {
            warn!(target: ROUTER_TARGET, "event log write failed, disabling");
            self.event_log = None;
        }
    }
}

#[cfg(test)]
mod tests;
