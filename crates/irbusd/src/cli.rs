//! CLI argument definitions for the dispatcher daemon.

use camino::Utf8PathBuf;
use clap::Parser;

use irbus_config::{Config, LogLevel, SocketPaths, parse_permission};

/// Command-line interface for the irbus dispatcher daemon.
#[derive(Parser, Debug)]
#[command(name = "irbusd", version, about = "IR remote-control dispatcher daemon")]
pub struct Cli {
    /// Don't fork to background.
    #[arg(short = 'n', long)]
    pub nodaemon: bool,
    /// Client socket path; backend and control sockets derive from it.
    #[arg(short = 'o', long, value_name = "SOCKET")]
    pub output: Option<Utf8PathBuf>,
    /// File permissions for the client socket, octal.
    #[arg(short = 'p', long, value_name = "MODE")]
    pub permission: Option<String>,
    /// Daemon pid file.
    #[arg(short = 'P', long, value_name = "FILE")]
    pub pidfile: Option<Utf8PathBuf>,
    /// Log file path (default: stderr).
    #[arg(short = 'L', long, value_name = "FILE")]
    pub logfile: Option<Utf8PathBuf>,
    /// Log level: 'info', 'warning', 'notice', etc., or 3..10.
    #[arg(short = 'D', long, value_name = "LEVEL", value_parser = LogLevel::parse)]
    pub loglevel: Option<LogLevel>,
    /// Accept the SIMULATE command.
    #[arg(short = 'a', long)]
    pub allow_simulate: bool,
}

impl Cli {
    /// Converts parsed options into the daemon configuration.
    #[must_use]
    pub fn into_config(self) -> Config {
        let mut config = Config::default();
        config.nodaemon = self.nodaemon;
        if let Some(output) = self.output {
            config.sockets = SocketPaths::new(output);
        }
        if let Some(mode) = self.permission {
            match parse_permission(&mode) {
                Ok(permission) => config.permission = permission,
                Err(error) => {
                    // Logging is not up yet at option-parsing time.
                    eprintln!("irbusd: {error}");
                    eprintln!("irbusd: falling back to 666");
                }
            }
        }
        if let Some(pidfile) = self.pidfile {
            config.pidfile = pidfile;
        }
        config.logfile = self.logfile;
        if let Some(loglevel) = self.loglevel {
            config.loglevel = loglevel;
        }
        config.allow_simulate = self.allow_simulate;
        config
    }
}
