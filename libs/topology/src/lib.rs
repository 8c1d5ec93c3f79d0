//! Topology model for hvctl.
//!
//! A topology declares, per environment, which hypervisors exist, which
//! nodes should run as VMs on them and with which configuration. It is
//! read-only input to the orchestrator.
//!
//! - `types`: environments, nodes, hypervisor and DNS provider selections
//! - `vm`: VM configuration records, layering, and the effective [`VmSpec`]
//! - `load`: reading `.toml` / `.json` topology files

pub mod error;
pub mod load;
pub mod types;
pub mod vm;

pub use error::TopologyError;
pub use types::{
    DnsProviderSpec, Environment, HostIp, HypervisorSpec, Node, Topology, DEFAULT_DNS_PROVIDER,
    DEFAULT_MANAGED_ROLE, NO_HYPERVISOR,
};
pub use vm::{
    FsBacking, LvmConfig, MemoryLimit, VmConfig, VmConfigLayers, VmSpec, ADMIN_SCOPE,
    INTERNAL_SCOPE,
};
