//! Binary crate for the `weather-server` process.
//!
//! This crate focuses on:
//! - Parsing CLI arguments
//! - Resolving configuration and building the logger
//! - Reporting startup failures with a non-zero exit status

use clap::Parser;

mod cli;

fn main() -> anyhow::Result<()> {
    let cmd = cli::Cli::parse();
    cmd.run()
}
