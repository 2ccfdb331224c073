//! The daemon launch sequence.
//!
//! Order matters: the pidfile lock is taken first so a second instance
//! fails before touching any socket; the listen sockets come next so an
//! activation supervisor sees them ready; the fork happens last, after
//! which the child re-writes the pidfile with its own pid.

use std::ffi::OsStr;

use daemonize_me::Daemon;
use tracing::info;

use irbus_config::Config;

use crate::event_loop::{EventLoop, Shutdown};
use crate::registry::FdRegistry;
use crate::router::Router;
use crate::telemetry::LogHandle;
use crate::transport;

use super::PROCESS_TARGET;
use super::errors::LaunchError;
use super::pidfile::Pidfile;
use super::signals;

/// Runs the daemon to completion.
///
/// # Errors
///
/// Returns [`LaunchError`] when a startup resource cannot be acquired or
/// the main loop fails; per-connection errors never reach this level.
pub fn run(config: &Config, log: LogHandle) -> Result<Shutdown, LaunchError> {
    let mut pidfile = Pidfile::lock(config.pidfile.as_std_path())?;

    let client_listener = match transport::activated_listener()? {
        Some(listener) => listener,
        None => transport::bind_listen_socket(
            config.sockets.client().as_std_path(),
            config.permission,
        )?,
    };
    let backend_listener =
        transport::bind_listen_socket(config.sockets.backend().as_std_path(), 0o666)?;
    let control_listener =
        transport::bind_listen_socket(config.sockets.control().as_std_path(), 0o666)?;
    let registry = FdRegistry::new(client_listener, backend_listener, control_listener);

    let pending = signals::install().map_err(|source| LaunchError::Signals { source })?;

    if !config.nodaemon {
        daemonize()?;
        pidfile
            .update(std::process::id())
            .map_err(|source| LaunchError::PidUpdate { source })?;
    }
    info!(
        target: PROCESS_TARGET,
        socket = %config.sockets.client(),
        "irbusd ready"
    );

    let mut event_loop = EventLoop::new(Router::new(registry), config.clone(), pending, log);
    let shutdown = event_loop.run()?;
    info!(target: PROCESS_TARGET, ?shutdown, "shutting down");

    // Registry drop closes every descriptor; the socket files need explicit
    // removal.
    drop(event_loop);
    transport::unlink_socket(config.sockets.client().as_std_path());
    transport::unlink_socket(config.sockets.backend().as_std_path());
    transport::unlink_socket(config.sockets.control().as_std_path());
    drop(pidfile);
    Ok(shutdown)
}

fn daemonize() -> Result<(), LaunchError> {
    info!(target: PROCESS_TARGET, "forking into background");
    let daemon = Daemon::new()
        .work_dir("/")
        .name(OsStr::new(env!("CARGO_PKG_NAME")));
    daemon.start()?;
    Ok(())
}
