//! In-memory hypervisor for tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hvctl_topology::{HypervisorSpec, VmConfig, VmSpec};

use super::registry::{BackendContext, HypervisorRegistry};
use super::{ApplyMode, Hypervisor, VmInfo, VmOperation};
use crate::error::{Error, Result};
use crate::lock_unpoisoned;

/// Mock hypervisor that records every call and tracks a VM set.
///
/// Applied creates add VMs and applied deletes remove them, so the next
/// `list` reflects the mutation.
#[derive(Debug, Default)]
pub struct MockHypervisor {
    id: String,
    vms: Mutex<BTreeSet<String>>,
    defaults: Option<VmConfig>,
    failing: Mutex<Vec<VmOperation>>,
    list_failure: Mutex<Option<String>>,
    calls: Mutex<Vec<(VmOperation, Vec<String>, ApplyMode)>>,
    list_calls: Mutex<usize>,
    cache_clears: Mutex<usize>,
}

impl MockHypervisor {
    pub fn new(id: &str, existing: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            vms: Mutex::new(existing.iter().map(|name| name.to_string()).collect()),
            ..Default::default()
        }
    }

    /// Registry whose `mock` backend hands out `mocks` by hypervisor name.
    pub fn registry(mocks: BTreeMap<String, Arc<MockHypervisor>>) -> HypervisorRegistry {
        let mut registry = HypervisorRegistry::new();
        registry.register(
            "mock",
            Arc::new(
                move |ctx: &BackendContext, _spec: &HypervisorSpec| -> Result<Arc<dyn Hypervisor>> {
                    let mock = mocks.get(&ctx.name).ok_or_else(|| {
                        Error::Config(format!("no mock for hypervisor {}", ctx.name))
                    })?;
                    Ok(Arc::clone(mock) as Arc<dyn Hypervisor>)
                },
            ),
        );
        registry
    }

    pub fn with_defaults(mut self, defaults: VmConfig) -> Self {
        self.defaults = Some(defaults);
        self
    }

    /// Make every call of `operation` fail after being recorded.
    pub fn fail_on(&self, operation: VmOperation) -> &Self {
        lock_unpoisoned(&self.failing).push(operation);
        self
    }

    /// Make `list` fail with `message`.
    pub fn fail_list(&self, message: &str) -> &Self {
        *lock_unpoisoned(&self.list_failure) = Some(message.to_string());
        self
    }

    /// Every operation call with the VM names it received.
    pub fn calls(&self) -> Vec<(VmOperation, Vec<String>, ApplyMode)> {
        lock_unpoisoned(&self.calls).clone()
    }

    /// VM name lists passed to `operation`, in call order.
    pub fn calls_of(&self, operation: VmOperation) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|(op, _, _)| *op == operation)
            .map(|(_, names, _)| names)
            .collect()
    }

    pub fn list_calls(&self) -> usize {
        *lock_unpoisoned(&self.list_calls)
    }

    pub fn cache_clears(&self) -> usize {
        *lock_unpoisoned(&self.cache_clears)
    }

    pub fn clear_calls(&self) {
        lock_unpoisoned(&self.calls).clear();
    }

    /// Current VM set.
    pub fn vms(&self) -> BTreeSet<String> {
        lock_unpoisoned(&self.vms).clone()
    }

    fn record(&self, operation: VmOperation, vms: &[VmSpec], mode: ApplyMode) -> Result<()> {
        let names: Vec<String> = vms.iter().map(|vm| vm.name.clone()).collect();
        lock_unpoisoned(&self.calls).push((operation, names, mode));

        if lock_unpoisoned(&self.failing).contains(&operation) {
            let vm = vms.first().map(|vm| vm.name.as_str()).unwrap_or_default();
            return Err(Error::in_vm(
                vm,
                operation.as_str(),
                Error::Remote {
                    host: self.id.clone(),
                    command: operation.as_str().to_string(),
                    message: "mock failure".to_string(),
                },
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "mock"
    }

    async fn list(&self) -> Result<Vec<String>> {
        *lock_unpoisoned(&self.list_calls) += 1;
        if let Some(message) = lock_unpoisoned(&self.list_failure).clone() {
            return Err(Error::Remote {
                host: self.id.clone(),
                command: "list".to_string(),
                message,
            });
        }
        Ok(self.vms().into_iter().collect())
    }

    async fn create_vms(&self, vms: &[VmSpec], mode: ApplyMode) -> Result<()> {
        self.record(VmOperation::Create, vms, mode)?;
        if mode.is_apply() {
            let mut known = lock_unpoisoned(&self.vms);
            known.extend(vms.iter().map(|vm| vm.name.clone()));
        }
        Ok(())
    }

    async fn start_vms(&self, vms: &[VmSpec], mode: ApplyMode) -> Result<()> {
        self.record(VmOperation::Start, vms, mode)
    }

    async fn stop_vms(&self, vms: &[VmSpec], mode: ApplyMode) -> Result<()> {
        self.record(VmOperation::Stop, vms, mode)
    }

    async fn reboot_vms(&self, vms: &[VmSpec], mode: ApplyMode) -> Result<()> {
        self.record(VmOperation::Reboot, vms, mode)
    }

    async fn update_vms(&self, vms: &[VmSpec], mode: ApplyMode) -> Result<()> {
        self.record(VmOperation::Update, vms, mode)
    }

    async fn delete_vms(&self, vms: &[VmSpec], mode: ApplyMode) -> Result<()> {
        self.record(VmOperation::Delete, vms, mode)?;
        if mode.is_apply() {
            let mut known = lock_unpoisoned(&self.vms);
            for vm in vms {
                known.remove(&vm.name);
            }
        }
        Ok(())
    }

    async fn info_vms(&self, vms: &[VmSpec], mode: ApplyMode) -> Result<Vec<VmInfo>> {
        if !mode.is_apply() {
            return Ok(Vec::new());
        }
        let known = self.vms();
        Ok(vms
            .iter()
            .map(|vm| VmInfo {
                name: vm.name.clone(),
                state: if known.contains(&vm.name) {
                    "RUNNING".to_string()
                } else {
                    "MISSING".to_string()
                },
                details: Default::default(),
            })
            .collect())
    }

    async fn clear_caches(&self) {
        *lock_unpoisoned(&self.cache_clears) += 1;
    }

    fn default_vm_config(&self) -> Option<&VmConfig> {
        self.defaults.as_ref()
    }
}
