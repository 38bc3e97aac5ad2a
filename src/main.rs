//! Pkgbulk CLI - dependency-driven parallel package build orchestrator
//!
//! Entry point for the pkgbulk command-line application.

use anyhow::Result;
use clap::Parser;

use pkgbulk::cli::{output::status, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing subscriber; RUST_LOG overrides the verbosity flags
    let default_level = if cli.quiet {
        tracing::Level::ERROR
    } else {
        match cli.verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            _ => tracing::Level::DEBUG,
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.into()),
        )
        .init();

    // Run the command and handle errors
    match cli.run().await {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("{} {e:#}", status::ERROR);
            std::process::exit(1);
        }
    }
}
