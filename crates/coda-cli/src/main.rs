mod bootstrap_helpers;
mod cli_args;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use coda_core::CodaError;

use crate::{bootstrap_helpers::init_tracing, cli_args::Cli, commands::run_cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());
    match run_cli(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            report_error(&error);
            ExitCode::from(1)
        }
    }
}

fn report_error(error: &anyhow::Error) {
    match error.downcast_ref::<CodaError>() {
        Some(coda_error) => {
            eprintln!("error: {coda_error}");
            if let Some(suggestion) = coda_error.suggestion() {
                eprintln!("hint: {suggestion}");
            }
        }
        None => eprintln!("error: {error:#}"),
    }
}
