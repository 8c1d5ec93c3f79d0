//! In-memory DNS provider for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hvctl_topology::DnsProviderSpec;

use super::{DnsProvider, DnsRegistry};
use crate::error::{Error, Result};
use crate::hypervisor::{ApplyMode, DnsRecord, RecordSource};
use crate::lock_unpoisoned;

/// Provider keeping `(name, ip)` pairs in memory.
#[derive(Debug, Default)]
pub struct MemoryDnsProvider {
    name: String,
    records: Mutex<BTreeSet<(String, String)>>,
    fail: Mutex<bool>,
}

impl MemoryDnsProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Registry whose `memory` provider hands out `providers` by name.
    pub fn registry(providers: BTreeMap<String, Arc<MemoryDnsProvider>>) -> DnsRegistry {
        let mut registry = DnsRegistry::new();
        registry.register(
            "memory",
            Arc::new(
                move |name: &str, _spec: &DnsProviderSpec| -> Result<Arc<dyn DnsProvider>> {
                    let provider = providers.get(name).ok_or_else(|| {
                        Error::Config(format!("no memory dns provider named {name}"))
                    })?;
                    Ok(Arc::clone(provider) as Arc<dyn DnsProvider>)
                },
            ),
        );
        registry
    }

    /// Preload `(name, ip)` pairs.
    pub fn seed(&self, entries: &[(&str, &str)]) {
        let mut records = lock_unpoisoned(&self.records);
        for (name, ip) in entries {
            records.insert((name.to_string(), ip.to_string()));
        }
    }

    /// Make every update fail.
    pub fn fail(&self) {
        *lock_unpoisoned(&self.fail) = true;
    }

    /// Published records, ordered by name.
    pub fn records(&self) -> Vec<DnsRecord> {
        lock_unpoisoned(&self.records)
            .iter()
            .filter_map(|(name, ip)| {
                Some(DnsRecord {
                    name: name.clone(),
                    ip: ip.parse().ok()?,
                    scope: String::new(),
                    source: RecordSource::Vm,
                })
            })
            .collect()
    }

    fn check(&self) -> Result<()> {
        if *lock_unpoisoned(&self.fail) {
            return Err(Error::Dns {
                provider: self.name.clone(),
                message: "mock failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for MemoryDnsProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_exists(&self, records: &[DnsRecord], mode: ApplyMode) -> Result<()> {
        self.check()?;
        if !mode.is_apply() {
            return Ok(());
        }
        let mut known = lock_unpoisoned(&self.records);
        for record in records {
            known.retain(|(name, _)| *name != record.name);
            known.insert((record.name.clone(), record.ip.to_string()));
        }
        Ok(())
    }

    async fn ensure_not_exists(&self, records: &[DnsRecord], mode: ApplyMode) -> Result<()> {
        self.check()?;
        if !mode.is_apply() {
            return Ok(());
        }
        let mut known = lock_unpoisoned(&self.records);
        for record in records {
            known.remove(&(record.name.clone(), record.ip.to_string()));
        }
        Ok(())
    }
}
