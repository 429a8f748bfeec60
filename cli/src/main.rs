//! `catalog` entry point.

use std::process::ExitCode;

use catalog_cli::{CatalogCli, EXIT_HARD_FAIL};
use clap::Parser;

fn main() -> ExitCode {
    // Logs go to stderr so `--json` output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = CatalogCli::parse();
    let code = cli.run();
    ExitCode::from(u8::try_from(code).unwrap_or(EXIT_HARD_FAIL as u8))
}
