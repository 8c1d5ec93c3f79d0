//! VM configuration records and their layering.
//!
//! Every field of [`VmConfig`] is optional so the same record can describe a
//! partial overlay (environment default, hypervisor default, node block) and
//! the effective configuration produced by stacking those overlays.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;
use crate::types::HostIp;

/// Host-IP scope preferred for the guest's primary interface.
pub const INTERNAL_SCOPE: &str = "internal";

/// Host-IP scope used for administration (SSH, DNS).
pub const ADMIN_SCOPE: &str = "admin";

/// Guest filesystem provisioning strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsBacking {
    #[default]
    Chroot,
    Lvm,
    Btrfs,
    Zfs,
}

impl FsBacking {
    /// Returns true for copy-on-write backings that clone from a template image.
    pub fn is_snapshot_capable(&self) -> bool {
        matches!(self, Self::Btrfs | Self::Zfs)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chroot => "chroot",
            Self::Lvm => "lvm",
            Self::Btrfs => "btrfs",
            Self::Zfs => "zfs",
        }
    }
}

impl fmt::Display for FsBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A memory quantity as written in the topology (`536870912` or `"512M"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemoryLimit {
    Bytes(u64),
    Text(String),
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "{bytes}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

/// LVM backing parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LvmConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vg_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_size: Option<String>,
}

impl LvmConfig {
    fn overlaid_with(mut self, overlay: &LvmConfig) -> Self {
        if overlay.vg_name.is_some() {
            self.vg_name = overlay.vg_name.clone();
        }
        if overlay.root_size.is_some() {
            self.root_size = overlay.root_size.clone();
        }
        self
    }
}

/// VM configuration, partial or effective.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Name of the hypervisor hosting the VM (`none` opts out).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hypervisor: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_backing: Option<FsBacking>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryLimit>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_swappiness: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_swap: Option<MemoryLimit>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_opts: Option<String>,

    /// Path prefix of template scripts on the hypervisor host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_prefix: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_keys: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lvm: Option<LvmConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended_lxc_config_lines: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_gateway: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_netmask: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_bridge: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_dns: Option<String>,
}

/// Copies every `Some` field of `$overlay` onto `$base`.
macro_rules! overlay_fields {
    ($base:ident, $overlay:ident, $($field:ident),+ $(,)?) => {
        $(
            if $overlay.$field.is_some() {
                $base.$field = $overlay.$field.clone();
            }
        )+
    };
}

impl VmConfig {
    /// Returns this config with every field set in `overlay` taking precedence.
    ///
    /// `lvm` is merged field by field; lists are replaced as a whole.
    pub fn overlaid_with(mut self, overlay: &VmConfig) -> Self {
        overlay_fields!(
            self,
            overlay,
            hypervisor,
            fs_backing,
            memory,
            memory_swappiness,
            memory_swap,
            cpu_shares,
            template_name,
            template_opts,
            template_prefix,
            ssh_keys,
            extended_lxc_config_lines,
            network_gateway,
            network_netmask,
            network_bridge,
            network_dns,
        );

        self.lvm = match (self.lvm.take(), overlay.lvm.as_ref()) {
            (Some(base), Some(top)) => Some(base.overlaid_with(top)),
            (base, None) => base,
            (None, Some(top)) => Some(top.clone()),
        };

        self
    }

    /// Backing store, defaulting to chroot.
    pub fn fs_backing(&self) -> FsBacking {
        self.fs_backing.unwrap_or_default()
    }
}

/// Ordered stack of partial VM configurations, lowest precedence first.
#[derive(Debug, Clone, Default)]
pub struct VmConfigLayers {
    layers: Vec<VmConfig>,
}

impl VmConfigLayers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a layer above every layer pushed so far.
    pub fn with_layer(mut self, layer: Option<&VmConfig>) -> Self {
        if let Some(layer) = layer {
            self.layers.push(layer.clone());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Fold the layers into the effective configuration.
    pub fn resolve(&self) -> VmConfig {
        self.layers
            .iter()
            .fold(VmConfig::default(), |acc, layer| acc.overlaid_with(layer))
    }
}

/// Effective description of one VM, as handed to a hypervisor backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    /// Name of the VM on its hypervisor.
    pub name: String,

    /// Key of the node in the topology.
    pub node: String,

    /// Role tag of the node.
    pub role: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_hostname: Option<String>,

    #[serde(default)]
    pub host_ips: BTreeMap<String, HostIp>,

    /// Effective configuration after layering.
    pub config: VmConfig,
}

impl VmSpec {
    /// Address for the guest's primary interface: internal scope, else admin.
    pub fn ip_config(&self) -> Result<&HostIp, TopologyError> {
        self.host_ips
            .get(INTERNAL_SCOPE)
            .or_else(|| self.host_ips.get(ADMIN_SCOPE))
            .ok_or_else(|| TopologyError::MissingAddress(self.name.clone()))
    }

    /// Address used to reach the guest over SSH.
    pub fn admin_ip(&self) -> Result<IpAddr, TopologyError> {
        match self.host_ips.get(ADMIN_SCOPE) {
            Some(admin) => Ok(admin.ip),
            None => self.ip_config().map(|host_ip| host_ip.ip),
        }
    }

    /// Admin hostname, falling back to the VM name.
    pub fn hostname(&self) -> &str {
        self.admin_hostname.as_deref().unwrap_or(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn with_memory(memory: &str) -> VmConfig {
        VmConfig {
            memory: Some(MemoryLimit::Text(memory.to_string())),
            ..Default::default()
        }
    }

    #[test]
    fn test_overlay_replaces_set_fields_only() {
        let base = VmConfig {
            template_name: Some("ubuntu".to_string()),
            memory: Some(MemoryLimit::Bytes(1024)),
            ..Default::default()
        };
        let merged = base.overlaid_with(&with_memory("2G"));

        assert_eq!(merged.template_name.as_deref(), Some("ubuntu"));
        assert_eq!(merged.memory, Some(MemoryLimit::Text("2G".to_string())));
    }

    #[test]
    fn test_lvm_merges_field_by_field() {
        let base = VmConfig {
            lvm: Some(LvmConfig {
                vg_name: Some("vg0".to_string()),
                root_size: Some("10G".to_string()),
            }),
            ..Default::default()
        };
        let node = VmConfig {
            lvm: Some(LvmConfig {
                vg_name: None,
                root_size: Some("20G".to_string()),
            }),
            ..Default::default()
        };

        let lvm = base.overlaid_with(&node).lvm.unwrap();
        assert_eq!(lvm.vg_name.as_deref(), Some("vg0"));
        assert_eq!(lvm.root_size.as_deref(), Some("20G"));
    }

    #[test]
    fn test_layers_most_specific_wins() {
        let env_default = with_memory("1G");
        let hypervisor_default = with_memory("2G");
        let node = with_memory("3G");

        let effective = VmConfigLayers::new()
            .with_layer(Some(&env_default))
            .with_layer(Some(&hypervisor_default))
            .with_layer(None)
            .with_layer(Some(&node))
            .resolve();

        assert_eq!(effective.memory, Some(MemoryLimit::Text("3G".to_string())));
    }

    #[test]
    fn test_fs_backing_parses_lowercase() {
        let config: VmConfig = serde_json::from_str(r#"{"fs_backing": "btrfs"}"#).unwrap();
        assert_eq!(config.fs_backing(), FsBacking::Btrfs);
        assert!(config.fs_backing().is_snapshot_capable());
        assert_eq!(VmConfig::default().fs_backing(), FsBacking::Chroot);
    }

    #[test]
    fn test_memory_limit_accepts_numbers_and_strings() {
        let config: VmConfig =
            serde_json::from_str(r#"{"memory": 536870912, "memory_swap": "1G"}"#).unwrap();
        assert_eq!(config.memory.unwrap().to_string(), "536870912");
        assert_eq!(config.memory_swap.unwrap().to_string(), "1G");
    }

    proptest! {
        #[test]
        fn prop_node_layer_always_wins(
            env in proptest::option::of(0u64..10_000),
            hyp in proptest::option::of(0u64..10_000),
            node in 0u64..10_000,
        ) {
            let layer = |shares: Option<u64>| VmConfig { cpu_shares: shares, ..Default::default() };

            let effective = VmConfigLayers::new()
                .with_layer(Some(&layer(env)))
                .with_layer(Some(&layer(hyp)))
                .with_layer(Some(&layer(Some(node))))
                .resolve();

            prop_assert_eq!(effective.cpu_shares, Some(node));
        }

        #[test]
        fn prop_unset_node_field_falls_through(
            env in proptest::option::of(0u32..100),
            hyp in proptest::option::of(0u32..100),
        ) {
            let layer = |swappiness: Option<u32>| VmConfig {
                memory_swappiness: swappiness,
                ..Default::default()
            };

            let effective = VmConfigLayers::new()
                .with_layer(Some(&layer(env)))
                .with_layer(Some(&layer(hyp)))
                .with_layer(Some(&VmConfig::default()))
                .resolve();

            prop_assert_eq!(effective.memory_swappiness, hyp.or(env));
        }
    }
}
