use std::process::ExitCode;

use clap::Parser;
use qbouncer::cli::Cli;
use qbouncer::config::{Config, ConfigError};
use qbouncer::supervisor::Supervisor;
use qbouncer::{logging, Error};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    logging::init(cli.initial_log_level());
    info!(version = %env!("CARGO_PKG_VERSION"), "starting qbouncer");

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return exit_code_for_config_error(&e);
        }
    };

    // The config file's log level only applies if the user didn't pin one
    // on the command line.
    if !cli.verbose && !cli.log_level_explicit() {
        logging::init(&config.service.log_level);
    }

    let mut supervisor = match Supervisor::new(config) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!(error = %e, "failed to initialize supervisor");
            return ExitCode::FAILURE;
        }
    };

    // SIGTERM/SIGINT are handled inside the supervisor so shutdown can run
    // the killswitch teardown and persist final state; a Ctrl-C that lands
    // before that handler is installed falls through to the OS default and
    // the shell reports it as killed by signal (130), same as it would for
    // any other async Rust CLI.
    match supervisor.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "service error");
            exit_code_for_error(&e)
        }
    }
}

fn exit_code_for_config_error(_error: &ConfigError) -> ExitCode {
    ExitCode::FAILURE
}

fn exit_code_for_error(_error: &Error) -> ExitCode {
    ExitCode::FAILURE
}
