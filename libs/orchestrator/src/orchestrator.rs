//! Operator-facing flows over one environment.

use std::collections::BTreeMap;

use hvctl_topology::{Environment, Topology, VmSpec};
use tracing::{info, warn};

use crate::config::Settings;
use crate::dns::{DnsRegistry, DnsSynchronizer};
use crate::error::Result;
use crate::executor::{run_over, RunOptions};
use crate::hypervisor::{HypervisorCache, HypervisorRegistry, VmInfo, VmOperation};
use crate::reconciler::{reconcile, VmPartition};

/// One orchestration run bound to an environment.
///
/// Owns the hypervisor instance cache for the run; every flow reconciles
/// first and then fans out over the relevant side of the partition.
#[derive(Debug)]
pub struct Orchestrator {
    env_name: String,
    env: Environment,
    cache: HypervisorCache,
    dns: DnsSynchronizer,
    options: RunOptions,
}

impl Orchestrator {
    /// Bind `env_name` of `topology`, validating backends and DNS providers
    /// before anything runs.
    pub fn new(
        topology: &Topology,
        env_name: &str,
        registry: HypervisorRegistry,
        dns_registry: &DnsRegistry,
        settings: Settings,
        options: RunOptions,
    ) -> Result<Self> {
        let env = topology.environment(env_name)?.clone();
        registry.validate(env_name, &env)?;
        let dns = DnsSynchronizer::new(&env, dns_registry)?;

        Ok(Self {
            env_name: env_name.to_string(),
            env,
            cache: HypervisorCache::new(registry, settings),
            dns,
            options,
        })
    }

    /// Replace the DNS synchronizer.
    pub fn with_dns(mut self, dns: DnsSynchronizer) -> Self {
        self.dns = dns;
        self
    }

    pub fn environment_name(&self) -> &str {
        &self.env_name
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn cache(&self) -> &HypervisorCache {
        &self.cache
    }

    /// Distinct hypervisors referenced by managed nodes, sorted.
    pub fn hypervisor_names(&self) -> Result<Vec<String>> {
        Ok(self.env.hypervisor_names(&self.env_name)?)
    }

    pub async fn list_vms(&self) -> Result<VmPartition> {
        reconcile(&self.env_name, &self.env, &self.cache).await
    }

    /// Effective configuration of every managed VM, by hypervisor.
    pub async fn vm_configs(&self) -> Result<BTreeMap<String, Vec<VmSpec>>> {
        Ok(self.list_vms().await?.all())
    }

    /// Run a lifecycle operation with its usual target set.
    pub async fn run(&self, operation: VmOperation) -> Result<()> {
        match operation {
            VmOperation::Create => self.create().await,
            VmOperation::Delete => self.delete().await,
            VmOperation::Start => self.start().await,
            VmOperation::Stop => self.stop().await,
            VmOperation::Reboot => self.reboot().await,
            VmOperation::Update => self.update().await,
            VmOperation::Console => self.console().await,
        }
    }

    /// Create every VM its hypervisor does not list, then publish DNS.
    pub async fn create(&self) -> Result<()> {
        let outcome = self.for_not_existing(VmOperation::Create, true).await;
        self.sync_dns_after(outcome, true).await
    }

    /// Delete every VM its hypervisor lists, then withdraw DNS.
    pub async fn delete(&self) -> Result<()> {
        let outcome = self.for_existing(VmOperation::Delete, true).await;
        self.sync_dns_after(outcome, false).await
    }

    pub async fn start(&self) -> Result<()> {
        self.for_existing(VmOperation::Start, false).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.for_existing(VmOperation::Stop, false).await
    }

    pub async fn reboot(&self) -> Result<()> {
        self.for_existing(VmOperation::Reboot, false).await
    }

    /// Apply resource limits of existing VMs live.
    pub async fn update(&self) -> Result<()> {
        self.for_existing(VmOperation::Update, true).await
    }

    pub async fn console(&self) -> Result<()> {
        self.for_existing(VmOperation::Console, false).await
    }

    /// Backend-reported state of every existing VM.
    pub async fn info(&self) -> Result<Vec<VmInfo>> {
        let partition = self.list_vms().await?;
        self.report_skipped(&partition, "info", false);
        let (existing, _) = partition.into_parts();

        let results = run_over(
            &self.cache,
            &self.env_name,
            &self.env,
            existing,
            &self.options,
            false,
            |hypervisor, vms, mode| async move { hypervisor.info_vms(&vms, mode).await },
        )
        .await?;

        Ok(results.into_values().flatten().flatten().collect())
    }

    pub async fn dns_add(&self) -> Result<usize> {
        self.dns
            .sync_add(&self.env_name, &self.env, &self.cache, self.options.mode)
            .await
    }

    pub async fn dns_remove(&self) -> Result<usize> {
        self.dns
            .sync_remove(&self.env_name, &self.env, &self.cache, self.options.mode)
            .await
    }

    async fn for_existing(&self, operation: VmOperation, post_clear_caches: bool) -> Result<()> {
        let partition = self.list_vms().await?;
        self.report_skipped(&partition, operation.as_str(), false);
        let (existing, _) = partition.into_parts();
        self.dispatch(operation, existing, post_clear_caches).await
    }

    async fn for_not_existing(
        &self,
        operation: VmOperation,
        post_clear_caches: bool,
    ) -> Result<()> {
        let partition = self.list_vms().await?;
        self.report_skipped(&partition, operation.as_str(), true);
        let (_, missing) = partition.into_parts();
        self.dispatch(operation, missing, post_clear_caches).await
    }

    async fn dispatch(
        &self,
        operation: VmOperation,
        groups: BTreeMap<String, Vec<VmSpec>>,
        post_clear_caches: bool,
    ) -> Result<()> {
        info!(
            environment = %self.env_name,
            operation = %operation,
            vms = groups.values().map(Vec::len).sum::<usize>(),
            mode = %self.options.mode,
            "Starting operation"
        );
        run_over(
            &self.cache,
            &self.env_name,
            &self.env,
            groups,
            &self.options,
            post_clear_caches,
            move |hypervisor, vms, mode| async move {
                operation.dispatch(hypervisor.as_ref(), &vms, mode).await
            },
        )
        .await?;
        Ok(())
    }

    /// Log VMs left out because they are on the other side of the partition.
    fn report_skipped(&self, partition: &VmPartition, operation: &str, targets_missing: bool) {
        let (skipped, state) = if targets_missing {
            (partition.existing(), "already exists")
        } else {
            (partition.missing(), "does not exist")
        };
        for (hypervisor, vms) in skipped {
            for vm in vms {
                warn!(hypervisor = %hypervisor, vm = %vm.name, operation, "Vm {state}, skipping");
            }
        }
    }

    /// Sync DNS after a mutating flow.
    ///
    /// Runs even when some groups failed; configuration errors skip it. The
    /// flow's own error wins over a DNS error.
    async fn sync_dns_after(&self, outcome: Result<()>, add: bool) -> Result<()> {
        if let Err(e) = &outcome {
            if !e.is_aggregate() {
                return outcome;
            }
        }

        let synced = if add {
            self.dns_add().await
        } else {
            self.dns_remove().await
        };

        match (outcome, synced) {
            (Ok(()), Ok(_)) => Ok(()),
            (Ok(()), Err(dns_error)) => Err(dns_error),
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(dns_error)) => {
                warn!(environment = %self.env_name, error = %dns_error, "Dns sync failed after partial failure");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_unknown_environment_rejected() {
        let err = Orchestrator::new(
            &Topology::default(),
            "prod",
            HypervisorRegistry::builtin(),
            &DnsRegistry::builtin(),
            Settings::default(),
            RunOptions::default(),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Topology(_)));
    }
}
