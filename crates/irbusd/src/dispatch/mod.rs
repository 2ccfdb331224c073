//! Command dispatch: one directive table, client and control surfaces.
//!
//! Incoming lines are split into a directive and an argument tail and matched
//! case-insensitively against a single static table. Handlers are total:
//! they either reply themselves (success or error) and return, or they
//! initiate routing towards a backend and leave the reply to the pump that
//! forwards backend lines back to the originating connection.

use std::fs::File;
use std::os::fd::RawFd;

use tracing::{debug, error};

use irbus_config::Config;
use irbus_proto::{Reply, split_directive};

use crate::handshake;
use crate::registry::Originator;
use crate::router::Router;

/// Tracing target for dispatch operations.
pub(crate) const DISPATCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatch");

/// Which listen surface a connection came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The client socket: commands for the default backend.
    Client,
    /// The control socket: administrative, cross-backend commands.
    Control,
}

/// One parsed command line under dispatch.
struct Request<'a> {
    fd: RawFd,
    line: &'a str,
    tail: Option<&'a str>,
    config: &'a Config,
}

struct Directive {
    name: &'static str,
    scopes: &'static [Scope],
    handler: fn(&mut Router, &Request<'_>),
}

const CLIENT: &[Scope] = &[Scope::Client];
const CONTROL: &[Scope] = &[Scope::Control];
const BOTH: &[Scope] = &[Scope::Client, Scope::Control];

static DIRECTIVES: &[Directive] = &[
    Directive { name: "SEND_ONCE", scopes: CLIENT, handler: route_to_default },
    Directive { name: "SEND_START", scopes: CLIENT, handler: route_to_default },
    Directive { name: "SEND_STOP", scopes: CLIENT, handler: route_to_default },
    Directive { name: "LIST", scopes: CLIENT, handler: route_to_default },
    Directive { name: "VERSION", scopes: BOTH, handler: version_cmd },
    Directive { name: "LIST_BACKENDS", scopes: CONTROL, handler: list_backends_cmd },
    Directive { name: "GET_DEFAULT_BACKEND", scopes: CONTROL, handler: get_default_backend_cmd },
    Directive { name: "SET_DEFAULT_BACKEND", scopes: CONTROL, handler: set_default_backend_cmd },
    Directive { name: "STOP_BACKEND", scopes: CONTROL, handler: stop_backend_cmd },
    Directive { name: "LIST_REMOTES", scopes: CONTROL, handler: list_remotes_cmd },
    Directive { name: "LIST_CODES", scopes: CONTROL, handler: list_codes_cmd },
    Directive { name: "SIMULATE", scopes: CONTROL, handler: simulate_cmd },
    Directive { name: "SET_TRANSMITTERS", scopes: CONTROL, handler: set_transmitters_cmd },
    Directive { name: "SET_INPUTLOG", scopes: CONTROL, handler: set_inputlog_cmd },
];

/// Dispatches one command line from a client or control connection.
pub fn handle_line(router: &mut Router, fd: RawFd, line: &str, scope: Scope, config: &Config) {
    let Some((directive, tail)) = split_directive(line) else {
        debug!(target: DISPATCH_TARGET, fd, "empty command line");
        return;
    };
    let entry = DIRECTIVES.iter().find(|candidate| {
        candidate.name.eq_ignore_ascii_case(directive) && candidate.scopes.contains(&scope)
    });
    let Some(entry) = entry else {
        debug!(target: DISPATCH_TARGET, fd, directive, "unknown directive");
        router.send_error_to(fd, line, &format!("unknown directive: {directive}"));
        return;
    };
    let request = Request {
        fd,
        line,
        tail,
        config,
    };
    (entry.handler)(router, &request);
}

/// Drains buffered command lines from a client or control connection.
/// Dispatch pauses while a command is in flight; the buffer keeps whatever
/// arrives until the reply completes or times out.
pub fn pump_stream(router: &mut Router, fd: RawFd, scope: Scope, config: &Config) {
    loop {
        let line = {
            let Some(record) = router.registry_mut().find_mut(fd) else {
                return;
            };
            if record.connected_to.is_some() {
                return;
            }
            match record.line_buffer.next_line() {
                Some(line) => line,
                None => return,
            }
        };
        handle_line(router, fd, &line, scope, config);
    }
}

/// Routes one reply line from a backend command socket. Lines belonging to a
/// client conversation are forwarded verbatim; locally connected lines feed
/// the handshake; anything else is noise from an idle backend.
pub fn handle_backend_line(router: &mut Router, fd: RawFd, line: &str, config: &Config) {
    let Some(record) = router.registry().find(fd) else {
        return;
    };
    match record.connected_to() {
        None => {
            error!(target: DISPATCH_TARGET, fd, line, "unexpected reply from backend");
        }
        Some(Originator::Local) => {
            handshake::handle_local_reply(router, fd, line, &config.sockets);
        }
        Some(Originator::Peer(client_fd)) => {
            if !router.write_raw(client_fd, format!("{line}\n").as_bytes()) {
                router.remove_connection(client_fd, "reply forward failed");
            }
            if line.starts_with("END") {
                router.disconnect(fd);
            }
        }
    }
}

/// Connects `client_fd` to a backend and forwards the command, leaving the
/// reply to the pump. A backend already serving another conversation is
/// reported busy; the in-flight routing stays untouched.
fn forward_to_backend(router: &mut Router, request: &Request<'_>, backend_fd: RawFd, forwarded: String) {
    let busy = router
        .registry()
        .find(backend_fd)
        .is_some_and(|backend| backend.connected_to().is_some());
    if busy {
        debug!(target: DISPATCH_TARGET, fd = request.fd, backend_fd, "backend busy");
        router.send_error_to(request.fd, request.line, "backend busy");
        return;
    }
    if let Some(client) = router.registry_mut().find_mut(request.fd) {
        client.expected = request.line.to_owned();
    }
    if let Some(backend) = router.registry_mut().find_mut(backend_fd) {
        backend.reply_parser.reset();
    }
    if !router.connect(Originator::Peer(request.fd), backend_fd) {
        router.send_error_to(request.fd, request.line, "internal error: lost routing peer");
        return;
    }
    debug!(
        target: DISPATCH_TARGET,
        backend_fd,
        command = forwarded.trim_end(),
        "forwarding command"
    );
    if !router.write_raw(backend_fd, forwarded.as_bytes()) {
        // Removal notifies the waiting client that the backend is gone.
        router.remove_connection(backend_fd, "command write failed");
    }
}

/// SEND_ONCE, SEND_START, SEND_STOP and LIST: forwarded verbatim to the
/// default backend.
fn route_to_default(router: &mut Router, request: &Request<'_>) {
    let Some(backend_fd) = router.default_backend() else {
        debug!(target: DISPATCH_TARGET, fd = request.fd, "no backend available");
        router.send_error_to(request.fd, request.line, "backend unavailable");
        return;
    };
    forward_to_backend(router, request, backend_fd, format!("{}\n", request.line));
}

/// Looks up a named backend and forwards a rewritten command line to it.
fn route_to_named(router: &mut Router, request: &Request<'_>, id: &str, forwarded: String) {
    let Some(backend_fd) = router
        .registry()
        .find_by_backend_id(id)
        .map(|record| record.fd())
    else {
        router.send_error_to(request.fd, request.line, &format!("no such backend: {id}"));
        return;
    };
    forward_to_backend(router, request, backend_fd, forwarded);
}

/// Splits a control argument tail into the backend id and the remainder,
/// replying with an error when the id is missing.
fn require_backend_id<'a>(
    router: &mut Router,
    request: &'a Request<'_>,
) -> Option<(&'a str, Option<&'a str>)> {
    match request.tail.and_then(split_directive) {
        Some((id, rest)) => Some((id, rest)),
        None => {
            router.send_error_to(request.fd, request.line, "missing backend id");
            None
        }
    }
}

/// As [`require_backend_id`], additionally rejecting trailing arguments.
fn require_sole_backend_id<'a>(router: &mut Router, request: &'a Request<'_>) -> Option<&'a str> {
    let (id, rest) = require_backend_id(router, request)?;
    if rest.is_some() {
        router.send_error_to(request.fd, request.line, "bad arguments");
        return None;
    }
    Some(id)
}

fn version_cmd(router: &mut Router, request: &Request<'_>) {
    let reply = Reply::success_with(
        request.line,
        vec![env!("CARGO_PKG_VERSION").to_owned()],
    );
    router.send_reply_to(request.fd, &reply);
}

fn list_backends_cmd(router: &mut Router, request: &Request<'_>) {
    let backends: Vec<String> = router
        .registry()
        .iter_by_role(crate::registry::Role::BackendCmd)
        .filter(|record| !record.backend_id().is_empty())
        .map(|record| record.backend_id().to_owned())
        .collect();
    router.send_reply_to(request.fd, &Reply::success_with(request.line, backends));
}

fn get_default_backend_cmd(router: &mut Router, request: &Request<'_>) {
    let Some(backend_fd) = router.default_backend() else {
        router.send_error_to(request.fd, request.line, "None");
        return;
    };
    let Some(id) = router
        .registry()
        .find(backend_fd)
        .map(|record| record.backend_id().to_owned())
    else {
        error!(target: DISPATCH_TARGET, backend_fd, "cannot look up default backend");
        router.send_error_to(request.fd, request.line, "internal error: stale default backend");
        return;
    };
    router.send_reply_to(request.fd, &Reply::success_with(request.line, vec![id]));
}

fn set_default_backend_cmd(router: &mut Router, request: &Request<'_>) {
    let Some(id) = require_sole_backend_id(router, request) else {
        return;
    };
    let Some(backend_fd) = router
        .registry()
        .find_by_backend_id(id)
        .map(|record| record.fd())
    else {
        router.send_error_to(request.fd, request.line, &format!("no such backend: {id}"));
        return;
    };
    router.set_default_backend(Some(backend_fd));
    router.send_reply_to(request.fd, &Reply::success(request.line));
}

fn stop_backend_cmd(router: &mut Router, request: &Request<'_>) {
    let Some(id) = require_sole_backend_id(router, request) else {
        return;
    };
    route_to_named(router, request, id, "STOP_BACKEND\n".to_owned());
}

fn list_remotes_cmd(router: &mut Router, request: &Request<'_>) {
    let Some(id) = require_sole_backend_id(router, request) else {
        return;
    };
    route_to_named(router, request, id, "LIST_REMOTES\n".to_owned());
}

fn list_codes_cmd(router: &mut Router, request: &Request<'_>) {
    let Some((id, rest)) = require_backend_id(router, request) else {
        return;
    };
    let Some(remote) = rest else {
        router.send_error_to(request.fd, request.line, "missing remote name");
        return;
    };
    route_to_named(router, request, id, format!("LIST_CODES {remote}\n"));
}

fn set_transmitters_cmd(router: &mut Router, request: &Request<'_>) {
    let Some((id, rest)) = require_backend_id(router, request) else {
        return;
    };
    let Some(mask) = rest else {
        router.send_error_to(request.fd, request.line, "missing transmitter mask");
        return;
    };
    route_to_named(router, request, id, format!("SET_TRANSMITTERS {mask}\n"));
}

fn simulate_cmd(router: &mut Router, request: &Request<'_>) {
    if !request.config.allow_simulate {
        router.send_error_to(
            request.fd,
            request.line,
            "SIMULATE command is disabled",
        );
        return;
    }
    let Some((id, rest)) = require_backend_id(router, request) else {
        return;
    };
    let Some(values) = rest.and_then(SimValues::parse) else {
        router.send_error_to(
            request.fd,
            request.line,
            &format!("cannot parse input: {}", rest.unwrap_or("")),
        );
        return;
    };
    route_to_named(router, request, id, format!("SIMULATE {values}\n"));
}

fn set_inputlog_cmd(router: &mut Router, request: &Request<'_>) {
    let Some((path, None)) = request.tail.and_then(split_directive) else {
        router.send_error_to(request.fd, request.line, "illegal argument (protocol error)");
        return;
    };
    if path.eq_ignore_ascii_case("null") {
        router.set_event_log(None);
        router.send_reply_to(request.fd, &Reply::success(request.line));
        return;
    }
    match File::create(path) {
        Ok(file) => {
            router.set_event_log(Some(file));
            router.send_reply_to(request.fd, &Reply::success(request.line));
        }
        Err(error) => {
            router.send_error_to(
                request.fd,
                request.line,
                &format!("cannot open input logfile: {path} ({error})"),
            );
        }
    }
}

/// The odd SIMULATE argument format: parsed as
/// `<remote> <keysym> <reps> <scancode>`, re-emitted in decoded-event order.
struct SimValues {
    scancode: u64,
    repeat: u32,
    keysym: String,
    remote: String,
}

impl SimValues {
    fn parse(input: &str) -> Option<Self> {
        let mut tokens = input.split_ascii_whitespace();
        let remote = tokens.next()?.to_owned();
        let keysym = tokens.next()?.to_owned();
        let repeat = tokens.next()?.parse().ok()?;
        let scancode = u64::from_str_radix(tokens.next()?, 16).ok()?;
        if tokens.next().is_some() {
            return None;
        }
        Some(Self {
            scancode,
            repeat,
            keysym,
            remote,
        })
    }
}

impl std::fmt::Display for SimValues {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "{:016x} {:02x} {} {}",
            self.scancode, self.repeat, self.keysym, self.remote
        )
    }
}
