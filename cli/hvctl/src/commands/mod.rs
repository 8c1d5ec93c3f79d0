//! CLI commands.

mod dns;
mod vm;

use std::num::NonZeroUsize;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use hvctl_orchestrator::{
    ApplyMode, DnsRegistry, HypervisorRegistry, Orchestrator, RunOptions, Settings, VmOperation,
};
use hvctl_topology::Topology;
use tracing::debug;

use crate::output::{print_info, OutputFormat};

/// hvctl - Reconcile and drive the VMs of a topology.
#[derive(Debug, Parser)]
#[command(name = "hvctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Topology file (.toml or .json).
    #[arg(long, global = true, env = "HVCTL_TOPOLOGY")]
    topology: Option<PathBuf>,

    /// Environment to operate on.
    ///
    /// May be omitted when the topology has a single environment.
    #[arg(long, global = true, env = "HVCTL_ENV")]
    env: Option<String>,

    /// Perform side effects. Without it every command only previews.
    #[arg(long, global = true)]
    apply: bool,

    /// Maximum VMs handed to one backend call.
    #[arg(long, global = true)]
    batch_size: Option<NonZeroUsize>,

    /// Maximum hypervisor groups processed at once.
    #[arg(long, global = true)]
    max_parallel: Option<NonZeroUsize>,

    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the hypervisors used by the environment.
    Hypervisors,

    /// Show which declared VMs exist on their hypervisor.
    List,

    /// Print the effective configuration of every VM.
    DumpConfig,

    /// Create VMs missing from their hypervisor, then publish DNS.
    Create,

    /// Delete existing VMs, then withdraw DNS.
    Delete,

    /// Start existing VMs.
    Start,

    /// Stop existing VMs.
    Stop,

    /// Reboot existing VMs.
    Reboot,

    /// Apply resource limits to running VMs.
    Update,

    /// Show backend state of existing VMs.
    Info,

    /// Attach to VM consoles.
    Console,

    /// Synchronize DNS with VM existence.
    Dns(dns::DnsCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        if matches!(self.command, Commands::Version) {
            println!("hvctl {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }

        let mut settings = Settings::from_env()?;
        crate::logging::init(&settings.log_level, self.log_json);

        if self.batch_size.is_some() {
            settings.batch_size = self.batch_size;
        }
        if self.max_parallel.is_some() {
            settings.max_parallel = self.max_parallel;
        }

        let topology = crate::config::load_topology(self.topology)?;
        let env_name = resolve_env(&topology, self.env)?;
        let options = RunOptions::from_settings(&settings, ApplyMode::from_apply(self.apply));
        debug!(environment = %env_name, mode = %options.mode, "Loaded topology");

        let orchestrator = Orchestrator::new(
            &topology,
            &env_name,
            HypervisorRegistry::builtin(),
            &DnsRegistry::builtin(),
            settings,
            options,
        )?;

        let ctx = CommandContext {
            orchestrator,
            format: self.format,
        };

        match self.command {
            Commands::Hypervisors => vm::hypervisors(&ctx),
            Commands::List => vm::list(&ctx).await,
            Commands::DumpConfig => vm::dump_config(&ctx).await,
            Commands::Create => vm::lifecycle(&ctx, VmOperation::Create).await,
            Commands::Delete => vm::lifecycle(&ctx, VmOperation::Delete).await,
            Commands::Start => vm::lifecycle(&ctx, VmOperation::Start).await,
            Commands::Stop => vm::lifecycle(&ctx, VmOperation::Stop).await,
            Commands::Reboot => vm::lifecycle(&ctx, VmOperation::Reboot).await,
            Commands::Update => vm::lifecycle(&ctx, VmOperation::Update).await,
            Commands::Console => vm::lifecycle(&ctx, VmOperation::Console).await,
            Commands::Info => vm::info(&ctx).await,
            Commands::Dns(cmd) => cmd.run(&ctx).await,
            Commands::Version => Ok(()),
        }
    }
}

/// Pick the environment: the flag, else the topology's only one.
fn resolve_env(topology: &Topology, flag: Option<String>) -> Result<String> {
    if let Some(env) = flag {
        return Ok(env);
    }
    let names: Vec<&str> = topology.environment_names().collect();
    match names.as_slice() {
        [only] => Ok(only.to_string()),
        [] => Err(anyhow::anyhow!("The topology declares no environment.")),
        _ => Err(anyhow::anyhow!(
            "No environment specified. Use --env or set HVCTL_ENV (one of: {}).",
            names.join(", ")
        )),
    }
}

/// Shared command context.
pub struct CommandContext {
    pub orchestrator: Orchestrator,
    pub format: OutputFormat,
}

impl CommandContext {
    pub fn mode(&self) -> ApplyMode {
        self.orchestrator.options().mode
    }

    /// Remind the operator that nothing was changed.
    pub fn note_plan(&self) {
        if !self.mode().is_apply() && self.format == OutputFormat::Table {
            print_info("Plan only, nothing was changed. Rerun with --apply to execute.");
        }
    }
}
