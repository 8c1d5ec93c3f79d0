//! Backend registry and per-run instance cache.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use hvctl_topology::{Environment, HypervisorSpec};
use tracing::debug;

use super::lxc::LxcHypervisor;
use super::Hypervisor;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::lock_unpoisoned;

/// What a backend constructor gets to know about the instance it builds.
#[derive(Debug, Clone)]
pub struct BackendContext {
    pub environment: String,
    pub name: String,
    pub settings: Settings,
}

impl BackendContext {
    /// Instance identity, `<environment>_<hypervisor name>`.
    pub fn hypervisor_id(&self) -> String {
        format!("{}_{}", self.environment, self.name)
    }
}

/// Builds a backend instance from its topology entry.
pub type HypervisorFactory =
    Arc<dyn Fn(&BackendContext, &HypervisorSpec) -> Result<Arc<dyn Hypervisor>> + Send + Sync>;

/// Backend type tag to constructor.
#[derive(Clone, Default)]
pub struct HypervisorRegistry {
    factories: BTreeMap<String, HypervisorFactory>,
}

impl fmt::Debug for HypervisorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HypervisorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl HypervisorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every backend shipped in this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            LxcHypervisor::KIND,
            Arc::new(
                |ctx: &BackendContext, spec: &HypervisorSpec| -> Result<Arc<dyn Hypervisor>> {
                    Ok(Arc::new(LxcHypervisor::from_spec(ctx, spec)?))
                },
            ),
        );
        registry
    }

    /// Register (or replace) the constructor for `kind`.
    pub fn register(&mut self, kind: &str, factory: HypervisorFactory) -> &mut Self {
        self.factories.insert(kind.to_string(), factory);
        self
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Check that every hypervisor of the environment has a known backend
    /// and every managed node resolves to a declared hypervisor.
    pub fn validate(&self, env_name: &str, env: &Environment) -> Result<()> {
        for (name, spec) in &env.hypervisors {
            if !self.factories.contains_key(&spec.kind) {
                return Err(Error::Config(format!(
                    "hypervisor {name} in environment {env_name} has unknown type {} (known: {})",
                    spec.kind,
                    self.kinds().join(", ")
                )));
            }
        }

        for name in env.hypervisor_names(env_name)? {
            if !env.hypervisors.contains_key(&name) {
                return Err(Error::Config(format!(
                    "hypervisor {name} is not declared in environment {env_name}"
                )));
            }
        }

        Ok(())
    }

    /// Construct the backend for one hypervisor entry.
    pub fn build(
        &self,
        ctx: &BackendContext,
        spec: &HypervisorSpec,
    ) -> Result<Arc<dyn Hypervisor>> {
        let factory = self.factories.get(&spec.kind).ok_or_else(|| {
            Error::Config(format!(
                "unknown hypervisor type {} for {}",
                spec.kind,
                ctx.hypervisor_id()
            ))
        })?;
        factory(ctx, spec)
    }
}

/// Backend instances of one run, keyed by `(environment, hypervisor name)`.
///
/// The first lookup constructs the instance; later lookups share it.
#[derive(Debug)]
pub struct HypervisorCache {
    registry: HypervisorRegistry,
    settings: Settings,
    instances: Mutex<HashMap<(String, String), Arc<dyn Hypervisor>>>,
}

impl HypervisorCache {
    pub fn new(registry: HypervisorRegistry, settings: Settings) -> Self {
        Self {
            registry,
            settings,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &HypervisorRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Instance for hypervisor `name` of environment `env_name`.
    pub fn get(
        &self,
        env_name: &str,
        env: &Environment,
        name: &str,
    ) -> Result<Arc<dyn Hypervisor>> {
        let key = (env_name.to_string(), name.to_string());
        let mut instances = lock_unpoisoned(&self.instances);
        if let Some(instance) = instances.get(&key) {
            return Ok(Arc::clone(instance));
        }

        let spec = env.hypervisors.get(name).ok_or_else(|| {
            Error::Config(format!(
                "hypervisor {name} is not declared in environment {env_name}"
            ))
        })?;

        let ctx = BackendContext {
            environment: env_name.to_string(),
            name: name.to_string(),
            settings: self.settings.clone(),
        };
        debug!(hypervisor = %ctx.hypervisor_id(), kind = %spec.kind, "Constructing hypervisor");
        let instance = self.registry.build(&ctx, spec)?;
        instances.insert(key, Arc::clone(&instance));
        Ok(instance)
    }

    /// Number of constructed instances.
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.instances).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
