//! hvctl - operator CLI for VM orchestration
//!
//! Reconciles the VMs declared in a topology file with what each hypervisor
//! reports, then creates, drives or deletes them and keeps DNS in step.
//! Mutating commands preview their work unless `--apply` is given.

use anyhow::Result;
use clap::Parser;

mod commands;
mod config;
mod error;
mod logging;
mod output;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
