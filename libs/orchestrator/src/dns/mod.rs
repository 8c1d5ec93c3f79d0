//! DNS synchronization.
//!
//! Keeps every configured provider of an environment consistent with VM
//! existence: records of existing VMs (and of nodes outside hypervisor
//! management) are ensured present, records of missing VMs absent.

pub mod hosts_file;
pub mod memory;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use hvctl_topology::{DnsProviderSpec, Environment, VmSpec};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::hypervisor::{default_dns_records, ApplyMode, DnsRecord, HypervisorCache, RecordSource};
use crate::reconciler::{reconcile, VmPartition};

pub use hosts_file::HostsFileProvider;
pub use memory::MemoryDnsProvider;

/// A DNS backend with idempotent upsert and delete.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Provider name in the environment.
    fn name(&self) -> &str;

    async fn ensure_exists(&self, records: &[DnsRecord], mode: ApplyMode) -> Result<()>;

    async fn ensure_not_exists(&self, records: &[DnsRecord], mode: ApplyMode) -> Result<()>;
}

/// Builds a provider from its name and topology entry.
pub type DnsProviderFactory =
    Arc<dyn Fn(&str, &DnsProviderSpec) -> Result<Arc<dyn DnsProvider>> + Send + Sync>;

/// Provider type tag to constructor.
#[derive(Clone, Default)]
pub struct DnsRegistry {
    factories: BTreeMap<String, DnsProviderFactory>,
}

impl fmt::Debug for DnsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl DnsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every provider shipped in this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            HostsFileProvider::KIND,
            Arc::new(
                |name: &str, spec: &DnsProviderSpec| -> Result<Arc<dyn DnsProvider>> {
                    Ok(Arc::new(HostsFileProvider::from_spec(name, spec)?))
                },
            ),
        );
        registry
    }

    pub fn register(&mut self, kind: &str, factory: DnsProviderFactory) -> &mut Self {
        self.factories.insert(kind.to_string(), factory);
        self
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn build(&self, name: &str, spec: &DnsProviderSpec) -> Result<Arc<dyn DnsProvider>> {
        let factory = self.factories.get(&spec.kind).ok_or_else(|| {
            Error::Config(format!(
                "dns provider {name} has unknown type {} (known: {})",
                spec.kind,
                self.kinds().join(", ")
            ))
        })?;
        factory(name, spec)
    }
}

/// Publishes VM existence to the DNS providers of one environment.
pub struct DnsSynchronizer {
    providers: Vec<Arc<dyn DnsProvider>>,
}

impl fmt::Debug for DnsSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.providers.iter().map(|p| p.name()).collect();
        f.debug_struct("DnsSynchronizer")
            .field("providers", &names)
            .finish()
    }
}

impl DnsSynchronizer {
    /// Build the environment's providers, in provider name order.
    pub fn new(env: &Environment, registry: &DnsRegistry) -> Result<Self> {
        let providers = env
            .dns_providers()
            .iter()
            .map(|(name, spec)| registry.build(name, spec))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { providers })
    }

    /// Synchronizer over explicit providers, used in that order.
    pub fn with_providers(providers: Vec<Arc<dyn DnsProvider>>) -> Self {
        Self { providers }
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Ensure records of existing VMs and unmanaged nodes are published.
    ///
    /// Returns the number of distinct records handed to each provider.
    pub async fn sync_add(
        &self,
        env_name: &str,
        env: &Environment,
        cache: &HypervisorCache,
        mode: ApplyMode,
    ) -> Result<usize> {
        if self.skip(env_name) {
            return Ok(0);
        }
        let partition = reconcile(env_name, env, cache).await?;
        let records = existing_records(env_name, env, cache, &partition)?;

        info!(environment = %env_name, records = records.len(), mode = %mode, "Publishing dns records");
        for provider in &self.providers {
            provider.ensure_exists(&records, mode).await?;
        }
        Ok(records.len())
    }

    /// Ensure records of VMs missing from their hypervisor are withdrawn.
    pub async fn sync_remove(
        &self,
        env_name: &str,
        env: &Environment,
        cache: &HypervisorCache,
        mode: ApplyMode,
    ) -> Result<usize> {
        if self.skip(env_name) {
            return Ok(0);
        }
        let partition = reconcile(env_name, env, cache).await?;
        let records = missing_records(env_name, env, cache, &partition)?;

        info!(environment = %env_name, records = records.len(), mode = %mode, "Withdrawing dns records");
        for provider in &self.providers {
            provider.ensure_not_exists(&records, mode).await?;
        }
        Ok(records.len())
    }

    fn skip(&self, env_name: &str) -> bool {
        if self.providers.is_empty() {
            warn!(environment = %env_name, "No dns provider configured, skipping dns sync");
            return true;
        }
        false
    }
}

/// Records of existing VMs plus records of nodes outside hypervisor management.
pub fn existing_records(
    env_name: &str,
    env: &Environment,
    cache: &HypervisorCache,
    partition: &VmPartition,
) -> Result<Vec<DnsRecord>> {
    let unmanaged: Vec<VmSpec> = env
        .unmanaged_nodes()
        .map(|(name, node)| env.node_spec(name, node))
        .collect();

    let mut records = BTreeSet::new();
    for (hypervisor_name, vms) in partition.existing() {
        let hypervisor = cache.get(env_name, env, hypervisor_name)?;
        records.extend(hypervisor.dns_records(vms, RecordSource::Vm));
        records.extend(hypervisor.dns_records(&unmanaged, RecordSource::Node));
    }
    if partition.existing().is_empty() {
        records.extend(default_dns_records(&unmanaged, RecordSource::Node));
    }
    Ok(records.into_iter().collect())
}

/// Records of VMs their hypervisor does not list.
pub fn missing_records(
    env_name: &str,
    env: &Environment,
    cache: &HypervisorCache,
    partition: &VmPartition,
) -> Result<Vec<DnsRecord>> {
    let mut records = BTreeSet::new();
    for (hypervisor_name, vms) in partition.missing() {
        let hypervisor = cache.get(env_name, env, hypervisor_name)?;
        records.extend(hypervisor.dns_records(vms, RecordSource::Vm));
    }
    Ok(records.into_iter().collect())
}
