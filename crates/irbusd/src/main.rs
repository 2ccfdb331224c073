use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use irbusd::{Cli, Shutdown};

fn main() -> ExitCode {
    let config = Cli::parse().into_config();
    let log = match irbusd::telemetry::init(&config) {
        Ok(handle) => handle,
        Err(telemetry_error) => {
            eprintln!("irbusd: failed to initialise logging: {telemetry_error}");
            return ExitCode::FAILURE;
        }
    };
    match irbusd::run(&config, log) {
        // USR1 is the sanctioned clean-exit path; TERM/INT report failure
        // like the process being killed would.
        Ok(Shutdown::Usr1) => ExitCode::SUCCESS,
        Ok(Shutdown::Term) => ExitCode::FAILURE,
        Err(launch_error) => {
            error!(%launch_error, "irbusd failed");
            eprintln!("irbusd: {launch_error}");
            ExitCode::FAILURE
        }
    }
}
