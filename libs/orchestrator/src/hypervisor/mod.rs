//! Hypervisor capability.
//!
//! Every backend implements [`Hypervisor`]. Operations take the effective
//! [`VmSpec`]s of one hypervisor group and an [`ApplyMode`]; in
//! [`ApplyMode::Plan`] they must not touch the backend.
//!
//! - `lxc`: the reference container backend
//! - `registry`: backend tag to constructor map, and the per-run instance cache
//! - `mock`: in-memory backend for tests

pub mod lxc;
pub mod mock;
pub mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use hvctl_topology::{VmConfig, VmSpec, ADMIN_SCOPE};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use mock::MockHypervisor;
pub use registry::{BackendContext, HypervisorCache, HypervisorRegistry};

/// Whether an operation performs side effects or only previews them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyMode {
    /// Preview only.
    #[default]
    Plan,
    /// Perform the side effects.
    Apply,
}

impl ApplyMode {
    pub fn from_apply(apply: bool) -> Self {
        if apply {
            Self::Apply
        } else {
            Self::Plan
        }
    }

    pub fn is_apply(self) -> bool {
        self == Self::Apply
    }
}

impl fmt::Display for ApplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plan => f.write_str("plan"),
            Self::Apply => f.write_str("apply"),
        }
    }
}

/// Lifecycle operations dispatched over hypervisor groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmOperation {
    Create,
    Start,
    Stop,
    Reboot,
    Update,
    Delete,
    Console,
}

impl VmOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reboot => "reboot",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Console => "console",
        }
    }

    /// Invoke the matching backend call.
    pub async fn dispatch(
        self,
        hypervisor: &dyn Hypervisor,
        vms: &[VmSpec],
        mode: ApplyMode,
    ) -> Result<()> {
        match self {
            Self::Create => hypervisor.create_vms(vms, mode).await,
            Self::Start => hypervisor.start_vms(vms, mode).await,
            Self::Stop => hypervisor.stop_vms(vms, mode).await,
            Self::Reboot => hypervisor.reboot_vms(vms, mode).await,
            Self::Update => hypervisor.update_vms(vms, mode).await,
            Self::Delete => hypervisor.delete_vms(vms, mode).await,
            Self::Console => hypervisor.console_vms(vms, mode).await,
        }
    }
}

impl fmt::Display for VmOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the input of a DNS record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    /// A VM managed by a hypervisor.
    Vm,
    /// A node outside hypervisor management.
    Node,
}

/// One DNS record to publish or withdraw.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DnsRecord {
    pub name: String,
    pub ip: IpAddr,
    pub scope: String,
    pub source: RecordSource,
}

/// Backend-reported state of one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

/// Records for every host-IP scope that carries a DNS name.
///
/// The admin scope falls back to the node's admin hostname.
pub fn default_dns_records(vms: &[VmSpec], source: RecordSource) -> Vec<DnsRecord> {
    let mut records = Vec::new();
    for vm in vms {
        for (scope, host_ip) in &vm.host_ips {
            let name = host_ip.hostname.as_deref().or_else(|| {
                (scope == ADMIN_SCOPE)
                    .then_some(vm.admin_hostname.as_deref())
                    .flatten()
            });
            if let Some(name) = name {
                records.push(DnsRecord {
                    name: name.to_string(),
                    ip: host_ip.ip,
                    scope: scope.clone(),
                    source,
                });
            }
        }
    }
    records
}

/// A VM-hosting backend.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Identity of this instance, `<environment>_<hypervisor name>`.
    fn id(&self) -> &str;

    /// Backend type tag.
    fn kind(&self) -> &str;

    /// Names of the VMs currently known to the backend.
    ///
    /// May be memoized until [`Hypervisor::clear_caches`].
    async fn list(&self) -> Result<Vec<String>>;

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.list().await?.iter().any(|listed| listed == name))
    }

    async fn create_vms(&self, vms: &[VmSpec], mode: ApplyMode) -> Result<()>;

    async fn start_vms(&self, vms: &[VmSpec], mode: ApplyMode) -> Result<()>;

    async fn stop_vms(&self, vms: &[VmSpec], mode: ApplyMode) -> Result<()>;

    async fn reboot_vms(&self, _vms: &[VmSpec], mode: ApplyMode) -> Result<()> {
        self.unsupported(VmOperation::Reboot, mode)
    }

    async fn update_vms(&self, _vms: &[VmSpec], mode: ApplyMode) -> Result<()> {
        self.unsupported(VmOperation::Update, mode)
    }

    async fn delete_vms(&self, vms: &[VmSpec], mode: ApplyMode) -> Result<()>;

    async fn info_vms(&self, _vms: &[VmSpec], mode: ApplyMode) -> Result<Vec<VmInfo>> {
        if !mode.is_apply() {
            return Ok(Vec::new());
        }
        Err(Error::Unsupported {
            backend: self.kind().to_string(),
            operation: "info",
        })
    }

    async fn console_vms(&self, _vms: &[VmSpec], mode: ApplyMode) -> Result<()> {
        self.unsupported(VmOperation::Console, mode)
    }

    /// DNS records describing `vms`.
    fn dns_records(&self, vms: &[VmSpec], source: RecordSource) -> Vec<DnsRecord> {
        default_dns_records(vms, source)
    }

    /// Drop memoized backend state so the next query is fresh.
    async fn clear_caches(&self);

    /// Backend defaults layered beneath node configuration.
    fn default_vm_config(&self) -> Option<&VmConfig> {
        None
    }

    #[doc(hidden)]
    fn unsupported(&self, operation: VmOperation, mode: ApplyMode) -> Result<()> {
        if !mode.is_apply() {
            return Ok(());
        }
        Err(Error::Unsupported {
            backend: self.kind().to_string(),
            operation: operation.as_str(),
        })
    }
}

impl fmt::Debug for dyn Hypervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hypervisor")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .finish()
    }
}
