//! Topology records: environments, nodes, hypervisors and DNS providers.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;
use crate::vm::{VmConfig, VmConfigLayers, VmSpec};

/// Hypervisor name that opts a node out of VM management.
pub const NO_HYPERVISOR: &str = "none";

/// Role tag of nodes managed by a hypervisor when the environment sets none.
pub const DEFAULT_MANAGED_ROLE: &str = "managed_vm";

/// Name given to a lone `dns_provider` entry.
pub const DEFAULT_DNS_PROVIDER: &str = "default";

/// All environments, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topology {
    pub environments: BTreeMap<String, Environment>,
}

impl Topology {
    /// Look up an environment by name.
    pub fn environment(&self, name: &str) -> Result<&Environment, TopologyError> {
        self.environments
            .get(name)
            .ok_or_else(|| TopologyError::UnknownEnvironment(name.to_string()))
    }

    pub fn environment_names(&self) -> impl Iterator<Item = &str> {
        self.environments.keys().map(String::as_str)
    }
}

/// Backend selection for one hypervisor: a type tag plus backend parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypervisorSpec {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// DNS provider selection: a type tag plus provider parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsProviderSpec {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// An address of a node in one network scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIp {
    pub ip: IpAddr,

    /// DNS name published for this address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// One server of the topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Role tag.
    #[serde(rename = "type")]
    pub role: String,

    #[serde(default)]
    pub vm: Option<VmConfig>,

    #[serde(default)]
    pub host_ips: BTreeMap<String, HostIp>,

    #[serde(default)]
    pub admin_hostname: Option<String>,

    /// Name of the VM on its hypervisor, when it differs from the node key.
    #[serde(default)]
    pub vm_name: Option<String>,
}

impl Node {
    /// VM name for a node stored under `key`.
    pub fn vm_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.vm_name.as_deref().unwrap_or(key)
    }
}

/// One environment of the topology.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub hypervisors: BTreeMap<String, HypervisorSpec>,

    #[serde(default)]
    pub default_vm: Option<VmConfig>,

    #[serde(default)]
    pub topology: BTreeMap<String, Node>,

    #[serde(default)]
    pub dns_provider: Option<DnsProviderSpec>,

    #[serde(default)]
    pub dns_providers: BTreeMap<String, DnsProviderSpec>,

    /// Role tag of nodes whose VMs are managed by a hypervisor.
    #[serde(default = "default_managed_role")]
    pub managed_role: String,
}

fn default_managed_role() -> String {
    DEFAULT_MANAGED_ROLE.to_string()
}

impl Environment {
    /// Returns true if the node's VM lifecycle is driven by a hypervisor.
    pub fn is_managed(&self, node: &Node) -> bool {
        node.role == self.managed_role
    }

    /// Nodes carrying the managed role, in name order.
    pub fn managed_nodes(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.topology
            .iter()
            .filter(|(_, node)| self.is_managed(node))
            .map(|(name, node)| (name.as_str(), node))
    }

    /// Nodes outside the managed role (always-on hosts and the like).
    pub fn unmanaged_nodes(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.topology
            .iter()
            .filter(|(_, node)| !self.is_managed(node))
            .map(|(name, node)| (name.as_str(), node))
    }

    /// Hypervisor assigned to a node, or `None` for the `none` sentinel.
    ///
    /// The node's own `vm.hypervisor` takes precedence over the environment
    /// default.
    pub fn hypervisor_for<'a>(
        &'a self,
        environment: &str,
        node_name: &str,
        node: &'a Node,
    ) -> Result<Option<&'a str>, TopologyError> {
        let node_level = node.vm.as_ref().and_then(|vm| vm.hypervisor.as_deref());
        let env_level = self
            .default_vm
            .as_ref()
            .and_then(|vm| vm.hypervisor.as_deref());

        match node_level.or(env_level) {
            Some(NO_HYPERVISOR) => Ok(None),
            Some(name) => Ok(Some(name)),
            None => Err(TopologyError::NoHypervisor {
                node: node_name.to_string(),
                environment: environment.to_string(),
            }),
        }
    }

    /// Sorted, distinct hypervisor names referenced by managed nodes.
    pub fn hypervisor_names(&self, environment: &str) -> Result<Vec<String>, TopologyError> {
        let mut names = Vec::new();
        for (node_name, node) in self.managed_nodes() {
            if let Some(name) = self.hypervisor_for(environment, node_name, node)? {
                if !names.iter().any(|known: &String| known == name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Effective VM spec of a managed node.
    ///
    /// Layers, lowest precedence first: environment `default_vm`, the
    /// hypervisor's default config, the node's `vm` block.
    pub fn vm_spec(
        &self,
        node_name: &str,
        node: &Node,
        hypervisor_defaults: Option<&VmConfig>,
    ) -> VmSpec {
        let config = VmConfigLayers::new()
            .with_layer(self.default_vm.as_ref())
            .with_layer(hypervisor_defaults)
            .with_layer(node.vm.as_ref())
            .resolve();

        self.spec_with_config(node_name, node, config)
    }

    /// Spec of a node outside hypervisor management, used for DNS records.
    pub fn node_spec(&self, node_name: &str, node: &Node) -> VmSpec {
        self.spec_with_config(node_name, node, node.vm.clone().unwrap_or_default())
    }

    fn spec_with_config(&self, node_name: &str, node: &Node, config: VmConfig) -> VmSpec {
        VmSpec {
            name: node.vm_name(node_name).to_string(),
            node: node_name.to_string(),
            role: node.role.clone(),
            admin_hostname: node.admin_hostname.clone(),
            host_ips: node.host_ips.clone(),
            config,
        }
    }

    /// Configured DNS providers by name.
    ///
    /// A lone `dns_provider` replaces the `dns_providers` map and is named
    /// `default`.
    pub fn dns_providers(&self) -> BTreeMap<String, DnsProviderSpec> {
        match &self.dns_provider {
            Some(single) => {
                BTreeMap::from([(DEFAULT_DNS_PROVIDER.to_string(), single.clone())])
            }
            None => self.dns_providers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::MemoryLimit;
    use rstest::rstest;

    fn node(role: &str, hypervisor: Option<&str>) -> Node {
        Node {
            role: role.to_string(),
            vm: hypervisor.map(|h| VmConfig {
                hypervisor: Some(h.to_string()),
                ..Default::default()
            }),
            host_ips: BTreeMap::new(),
            admin_hostname: None,
            vm_name: None,
        }
    }

    fn environment(default_hypervisor: Option<&str>) -> Environment {
        Environment {
            default_vm: Some(VmConfig {
                hypervisor: default_hypervisor.map(str::to_string),
                memory: Some(MemoryLimit::Text("1G".to_string())),
                ..Default::default()
            }),
            managed_role: DEFAULT_MANAGED_ROLE.to_string(),
            ..Default::default()
        }
    }

    #[rstest]
    #[case(Some("h1"), None, Some("h1"))]
    #[case(Some("h1"), Some("h2"), Some("h2"))]
    #[case(Some("h1"), Some("none"), None)]
    #[case(Some("none"), None, None)]
    #[case(None, Some("h2"), Some("h2"))]
    fn test_hypervisor_resolution(
        #[case] env_default: Option<&str>,
        #[case] node_override: Option<&str>,
        #[case] expected: Option<&str>,
    ) {
        let env = environment(env_default);
        let n = node(DEFAULT_MANAGED_ROLE, node_override);
        assert_eq!(env.hypervisor_for("prod", "n1", &n).unwrap(), expected);
    }

    #[test]
    fn test_missing_hypervisor_is_error() {
        let env = environment(None);
        let n = node(DEFAULT_MANAGED_ROLE, None);
        let err = env.hypervisor_for("prod", "n1", &n).unwrap_err();
        assert!(matches!(err, TopologyError::NoHypervisor { .. }));
    }

    #[test]
    fn test_hypervisor_names_sorted_and_distinct() {
        let mut env = environment(Some("h2"));
        env.topology.insert("a".into(), node(DEFAULT_MANAGED_ROLE, None));
        env.topology.insert("b".into(), node(DEFAULT_MANAGED_ROLE, Some("h1")));
        env.topology.insert("c".into(), node(DEFAULT_MANAGED_ROLE, Some("none")));
        env.topology.insert("d".into(), node(DEFAULT_MANAGED_ROLE, Some("h2")));
        env.topology.insert("e".into(), node("router", Some("h3")));

        assert_eq!(env.hypervisor_names("prod").unwrap(), vec!["h1", "h2"]);
    }

    #[test]
    fn test_vm_spec_layers_node_over_hypervisor_over_env() {
        let env = environment(Some("h1"));
        let mut n = node(DEFAULT_MANAGED_ROLE, None);
        n.vm = Some(VmConfig {
            memory: Some(MemoryLimit::Text("4G".to_string())),
            ..Default::default()
        });
        n.vm_name = Some("web-vm".to_string());
        let hyp_defaults = VmConfig {
            memory: Some(MemoryLimit::Text("2G".to_string())),
            template_name: Some("ubuntu".to_string()),
            ..Default::default()
        };

        let spec = env.vm_spec("web", &n, Some(&hyp_defaults));
        assert_eq!(spec.name, "web-vm");
        assert_eq!(spec.node, "web");
        assert_eq!(spec.config.memory, Some(MemoryLimit::Text("4G".to_string())));
        assert_eq!(spec.config.template_name.as_deref(), Some("ubuntu"));
        assert_eq!(spec.config.hypervisor.as_deref(), Some("h1"));
    }

    #[test]
    fn test_single_dns_provider_replaces_map() {
        let provider = DnsProviderSpec {
            kind: "hosts_file".to_string(),
            params: serde_json::Map::new(),
        };
        let mut env = environment(None);
        env.dns_providers.insert("zz".into(), provider.clone());
        assert_eq!(env.dns_providers().keys().collect::<Vec<_>>(), vec!["zz"]);

        env.dns_provider = Some(provider);
        assert_eq!(
            env.dns_providers().keys().collect::<Vec<_>>(),
            vec![DEFAULT_DNS_PROVIDER]
        );
    }
}
