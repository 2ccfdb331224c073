//! Process lifecycle: pidfile lock, signal tokens, daemonisation, launch.

mod errors;
mod launch;
pub mod pidfile;
pub mod signals;

pub use errors::LaunchError;
pub use launch::run;
pub use pidfile::{Pidfile, PidfileError};

pub(crate) const PROCESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::process");
