//! copydb binary.
//!
//! Loads the layered configuration, applies the command line overrides, initializes tracing
//! and runs one command of the copy engine on a multi-threaded runtime.

use std::process::ExitCode;

use clap::Parser;
use copydb_telemetry::tracing::init_tracing;

use crate::args::Cli;
use crate::config::load_copydb_config;
use crate::core::run_command;
use crate::error::{CliError, CliResult};

mod args;
mod config;
mod core;
mod error;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprint!("{}", err.render_report());
            err.exit_code()
        }
    }
}

fn run(cli: Cli) -> CliResult<()> {
    let config = load_copydb_config(&cli.run)?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"), config.run.log_dir.as_deref())
        .map_err(CliError::config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run_command(cli.command, config))
}
