//! hvctl orchestration engine.
//!
//! Converges the VMs declared in a topology with what each hypervisor
//! reports, one concurrent unit of work per hypervisor, and keeps DNS in line
//! with VM existence.
//!
//! ## Architecture
//!
//! ```text
//! Topology ──► reconciler ──► Partition {exists, not_exists} per hypervisor
//!                                   │
//!                                   ▼
//!                  executor::run_over (fan-out, batching, cache clear)
//!                                   │
//!                       ┌───────────┴───────────┐
//!                       ▼                       ▼
//!                 Hypervisor (lxc)        DnsSynchronizer
//!                       │                       │
//!                  RemoteExec (ssh)        DnsProvider (hosts_file)
//! ```
//!
//! ## Modules
//!
//! - `config`: settings loaded from the environment
//! - `error`: error taxonomy
//! - `remote`: remote command execution capability
//! - `reachability`: guest SSH polling
//! - `hypervisor`: backend capability, registry, instance cache, LXC backend
//! - `reconciler`: existence partition of managed VMs
//! - `executor`: fan-out of an operation over hypervisor groups
//! - `dns`: DNS providers and synchronizer
//! - `orchestrator`: operator-facing flows over one environment

pub mod config;
pub mod dns;
pub mod error;
pub mod executor;
pub mod hypervisor;
pub mod orchestrator;
pub mod reachability;
pub mod reconciler;
pub mod remote;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::Settings;
pub use dns::{DnsProvider, DnsRegistry, DnsSynchronizer};
pub use error::{Error, GroupFailures, Result};
pub use executor::RunOptions;
pub use hypervisor::{
    ApplyMode, DnsRecord, Hypervisor, HypervisorCache, HypervisorRegistry, RecordSource, VmInfo,
    VmOperation,
};
pub use orchestrator::Orchestrator;
pub use reconciler::VmPartition;

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
