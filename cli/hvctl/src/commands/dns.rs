//! DNS commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::output::{print_single, print_success, OutputFormat};

use super::CommandContext;

/// DNS commands.
#[derive(Debug, Args)]
pub struct DnsCommand {
    #[command(subcommand)]
    command: DnsSubcommand,
}

#[derive(Debug, Subcommand)]
enum DnsSubcommand {
    /// Publish records of existing VMs and unmanaged nodes.
    Add,

    /// Withdraw records of VMs missing from their hypervisor.
    Remove,
}

#[derive(Debug, Serialize)]
struct SyncSummary<'a> {
    environment: &'a str,
    action: &'static str,
    mode: String,
    records: usize,
}

impl DnsCommand {
    pub async fn run(self, ctx: &CommandContext) -> Result<()> {
        let (action, records) = match self.command {
            DnsSubcommand::Add => ("add", ctx.orchestrator.dns_add().await?),
            DnsSubcommand::Remove => ("remove", ctx.orchestrator.dns_remove().await?),
        };

        match ctx.format {
            OutputFormat::Table => {
                if ctx.mode().is_apply() {
                    print_success(&format!("dns {action}: {records} record(s) synchronized"));
                }
                ctx.note_plan();
            }
            OutputFormat::Json => print_single(&SyncSummary {
                environment: ctx.orchestrator.environment_name(),
                action,
                mode: ctx.mode().to_string(),
                records,
            }),
        }
        Ok(())
    }
}
