use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cli;

use cli::{run_command, Cli};

/// Log directive for the run. `--debug` raises this crate to debug and wins
/// over `RUST_LOG`; otherwise `RUST_LOG` applies when set.
fn log_directive(debug: bool, env: Option<&str>) -> String {
    match env.map(str::trim).filter(|d| !d.is_empty()) {
        _ if debug => "info,flowsplit=debug".to_string(),
        Some(directive) => directive.to_string(),
        None => "info".to_string(),
    }
}

fn init_tracing(debug: bool) {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directive = log_directive(debug, env.as_deref());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|e| {
        eprintln!("Ignoring log directive {:?}: {}", directive, e);
        EnvFilter::new("info")
    });

    // Logs go to stderr; stdout carries --json and --print-config output
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
