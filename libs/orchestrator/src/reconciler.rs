//! State reconciler.
//!
//! Splits the managed VMs of an environment into those each hypervisor
//! already reports and those it does not.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use hvctl_reconcile::{FanOut, Partition};
use hvctl_topology::{Environment, Node, VmSpec};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::hypervisor::{Hypervisor, HypervisorCache};

/// Effective VM specs keyed by hypervisor name, split by existence.
pub type VmPartition = Partition<String, VmSpec>;

/// Partition every managed node of `env` by whether its hypervisor lists it.
///
/// Each distinct hypervisor is listed once; listings run concurrently.
pub async fn reconcile(
    env_name: &str,
    env: &Environment,
    cache: &HypervisorCache,
) -> Result<VmPartition> {
    let mut assignments: Vec<(String, &str, &Node)> = Vec::new();
    for (node_name, node) in env.managed_nodes() {
        match env.hypervisor_for(env_name, node_name, node)? {
            Some(hypervisor) => assignments.push((hypervisor.to_string(), node_name, node)),
            None => debug!(node = %node_name, "Node opted out of hypervisor management"),
        }
    }

    let mut hypervisors: BTreeMap<String, Arc<dyn Hypervisor>> = BTreeMap::new();
    for (name, _, _) in &assignments {
        if !hypervisors.contains_key(name) {
            hypervisors.insert(name.clone(), cache.get(env_name, env, name)?);
        }
    }

    let listings = list_all(&hypervisors).await?;

    let mut partition = VmPartition::new();
    for (hypervisor_name, node_name, node) in assignments {
        let hypervisor = &hypervisors[&hypervisor_name];
        let spec = env.vm_spec(node_name, node, hypervisor.default_vm_config());
        let present = listings
            .get(&hypervisor_name)
            .is_some_and(|listed| listed.contains(&spec.name));
        partition.record(hypervisor_name, present, spec);
    }

    info!(
        environment = %env_name,
        hypervisors = hypervisors.len(),
        existing = partition.existing().values().map(Vec::len).sum::<usize>(),
        missing = partition.missing().values().map(Vec::len).sum::<usize>(),
        "Reconciled"
    );
    Ok(partition)
}

async fn list_all(
    hypervisors: &BTreeMap<String, Arc<dyn Hypervisor>>,
) -> Result<BTreeMap<String, BTreeSet<String>>> {
    let groups: BTreeMap<String, Vec<Arc<dyn Hypervisor>>> = hypervisors
        .iter()
        .map(|(name, hypervisor)| (name.clone(), vec![Arc::clone(hypervisor)]))
        .collect();

    let report = FanOut::new()
        .run(groups, |_name, group| async move {
            let mut names = BTreeSet::new();
            for hypervisor in group {
                names.extend(hypervisor.list().await?);
            }
            Ok::<_, Error>(names)
        })
        .await;

    Ok(report.into_result()?.into_iter().collect())
}
