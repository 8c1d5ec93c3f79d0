//! VM commands.

use anyhow::Result;
use hvctl_orchestrator::{VmInfo, VmOperation, VmPartition};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{display_option, print_output, print_single, print_success, OutputFormat};

use super::CommandContext;

#[derive(Debug, Serialize, Tabled)]
struct HypervisorRow {
    #[tabled(rename = "Name")]
    name: String,

    #[tabled(rename = "Type")]
    kind: String,

    #[tabled(rename = "Host", display = "display_option")]
    host: Option<String>,
}

#[derive(Debug, Serialize, Tabled)]
struct VmRow {
    #[tabled(rename = "Hypervisor")]
    hypervisor: String,

    #[tabled(rename = "VM")]
    vm: String,

    #[tabled(rename = "Node")]
    node: String,

    #[tabled(rename = "Exists")]
    exists: bool,
}

#[derive(Debug, Serialize, Tabled)]
struct InfoRow {
    #[tabled(rename = "VM")]
    name: String,

    #[tabled(rename = "State")]
    state: String,

    #[tabled(rename = "Details")]
    details: String,
}

impl From<VmInfo> for InfoRow {
    fn from(info: VmInfo) -> Self {
        let details = info
            .details
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            name: info.name,
            state: info.state,
            details,
        }
    }
}

fn vm_rows(partition: VmPartition) -> Vec<VmRow> {
    let (existing, missing) = partition.into_parts();
    let mut rows = Vec::new();
    for (groups, exists) in [(existing, true), (missing, false)] {
        for (hypervisor, vms) in groups {
            rows.extend(vms.into_iter().map(|vm| VmRow {
                hypervisor: hypervisor.clone(),
                vm: vm.name,
                node: vm.node,
                exists,
            }));
        }
    }
    rows.sort_by(|a, b| (&a.hypervisor, &a.vm).cmp(&(&b.hypervisor, &b.vm)));
    rows
}

/// List hypervisors referenced by managed nodes.
pub fn hypervisors(ctx: &CommandContext) -> Result<()> {
    let env = ctx.orchestrator.environment();
    let rows: Vec<HypervisorRow> = ctx
        .orchestrator
        .hypervisor_names()?
        .into_iter()
        .map(|name| {
            let spec = env.hypervisors.get(&name);
            HypervisorRow {
                kind: spec.map(|s| s.kind.clone()).unwrap_or_default(),
                host: spec
                    .and_then(|s| s.params.get("lxc_host"))
                    .and_then(|host| host.as_str())
                    .map(str::to_string),
                name,
            }
        })
        .collect();

    print_output(&rows, ctx.format);
    Ok(())
}

/// Show declared VMs and whether their hypervisor lists them.
pub async fn list(ctx: &CommandContext) -> Result<()> {
    let partition = ctx.orchestrator.list_vms().await?;
    print_output(&vm_rows(partition), ctx.format);
    Ok(())
}

/// Print effective VM configuration, grouped by hypervisor.
pub async fn dump_config(ctx: &CommandContext) -> Result<()> {
    let configs = ctx.orchestrator.vm_configs().await?;
    print_single(&configs);
    Ok(())
}

/// Run a lifecycle operation over its usual target set.
pub async fn lifecycle(ctx: &CommandContext, operation: VmOperation) -> Result<()> {
    ctx.orchestrator.run(operation).await?;

    match ctx.format {
        OutputFormat::Table => {
            if ctx.mode().is_apply() {
                print_success(&format!(
                    "{operation} completed in {}",
                    ctx.orchestrator.environment_name()
                ));
            }
            ctx.note_plan();
        }
        OutputFormat::Json => print_single(&serde_json::json!({
            "environment": ctx.orchestrator.environment_name(),
            "operation": operation.as_str(),
            "mode": ctx.mode(),
            "status": "ok",
        })),
    }
    Ok(())
}

/// Show backend-reported state of existing VMs.
pub async fn info(ctx: &CommandContext) -> Result<()> {
    let rows: Vec<InfoRow> = ctx
        .orchestrator
        .info()
        .await?
        .into_iter()
        .map(InfoRow::from)
        .collect();

    print_output(&rows, ctx.format);
    ctx.note_plan();
    Ok(())
}
