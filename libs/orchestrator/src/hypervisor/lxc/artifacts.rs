//! Files and names produced while provisioning an LXC guest.
//!
//! Everything here is pure so the exact bytes written to hosts and guests
//! can be tested without a remote.

use std::net::IpAddr;

use hvctl_reconcile::ContentHash;
use hvctl_topology::{FsBacking, MemoryLimit, VmConfig};
use serde::Serialize;

/// Template scripts live at `<prefix><template name>` on the host.
pub const DEFAULT_TEMPLATE_PREFIX: &str = "/usr/share/lxc/templates/lxc-";

/// Guest directory holding the resource override document.
pub const OHAI_OVERRIDE_DIR: &str = "/opt/master-chef/etc";

/// Guest path of the resource override document.
pub const OHAI_OVERRIDE_PATH: &str = "/opt/master-chef/etc/override_ohai.json";

const CPU_SHARES_PER_CPU: u64 = 1024;

pub fn rootfs(name: &str) -> String {
    format!("/var/lib/lxc/{name}/rootfs")
}

pub fn config_path(name: &str) -> String {
    format!("/var/lib/lxc/{name}/config")
}

/// Host-side staging location of the config fragment.
pub fn staged_config_path(name: &str) -> String {
    format!("/tmp/lxc_config_{name}")
}

/// Autostart registration used by 0.9 hosts.
pub fn autostart_link(name: &str) -> String {
    format!("/etc/lxc/auto/{name}.conf")
}

/// Name of the snapshot source image for a template.
pub fn template_image_name(backing: FsBacking, template: &str, hash: &ContentHash) -> String {
    format!("template-{backing}-{template}-{hash}")
}

/// Hash identifying a template image: script content plus creation options.
pub fn template_hash(script: &str, options: &str) -> ContentHash {
    ContentHash::of([script, options])
}

/// Resolved network parameters of one guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub address: IpAddr,
    pub netmask: String,
    pub gateway: String,
    pub bridge: String,
    pub dns: String,
}

/// `/etc/network/interfaces` with loopback and a static `eth0`.
pub fn interfaces_file(network: &NetworkSettings) -> String {
    format!(
        "auto lo\n\
         iface lo inet loopback\n\
         \n\
         auto eth0\n\
         iface eth0 inet static\n  \
         address {}\n  \
         netmask {}\n  \
         gateway {}\n",
        network.address, network.netmask, network.gateway
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryOverride {
    pub total: MemoryLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuOverride {
    pub total: u64,
}

/// Resource figures handed to configuration management inside the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryOverride>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuOverride>,
}

impl ResourceOverrides {
    pub fn is_empty(&self) -> bool {
        self.memory.is_none() && self.cpu.is_none()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// LXC config fragment of a guest, plus the overrides its limits imply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFragment {
    lines: Vec<String>,
    pub overrides: ResourceOverrides,
}

impl ConfigFragment {
    /// Build the fragment for `config` attached to `bridge`.
    ///
    /// `lxc.start.auto` is only understood by non-legacy hosts.
    pub fn build(config: &VmConfig, bridge: &str, legacy: bool) -> Self {
        let mut lines = vec![
            "lxc.network.type = veth".to_string(),
            format!("lxc.network.link = {bridge}"),
            "lxc.network.flags = up".to_string(),
            String::new(),
        ];
        let mut overrides = ResourceOverrides::default();

        if let Some(memory) = &config.memory {
            lines.push(format!("lxc.cgroup.memory.limit_in_bytes = {memory}"));
            overrides.memory = Some(MemoryOverride {
                total: memory.clone(),
            });
        }
        if let Some(swappiness) = config.memory_swappiness {
            lines.push(format!("lxc.cgroup.memory.swappiness = {swappiness}"));
        }
        if let Some(swap) = &config.memory_swap {
            lines.push(format!("lxc.cgroup.memory.memsw.limit_in_bytes = {swap}"));
        }
        if let Some(shares) = config.cpu_shares {
            lines.push(format!("lxc.cgroup.cpu.shares = {shares}"));
            overrides.cpu = Some(CpuOverride {
                total: shares / CPU_SHARES_PER_CPU,
            });
        }
        if let Some(extra) = &config.extended_lxc_config_lines {
            lines.extend(extra.iter().cloned());
        }
        if !legacy {
            lines.push("lxc.start.auto = 1".to_string());
        }
        lines.push(String::new());
        lines.push(String::new());

        Self { lines, overrides }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn render(&self) -> String {
        self.lines.join("\n")
    }
}

/// Live cgroup settings for `lxc-cgroup`, as `(key, value)` pairs.
pub fn cgroup_limits(config: &VmConfig) -> Vec<(&'static str, String)> {
    let mut limits = Vec::new();
    if let Some(memory) = &config.memory {
        limits.push(("memory.limit_in_bytes", memory.to_string()));
    }
    if let Some(swappiness) = config.memory_swappiness {
        limits.push(("memory.swappiness", swappiness.to_string()));
    }
    if let Some(swap) = &config.memory_swap {
        limits.push(("memory.memsw.limit_in_bytes", swap.to_string()));
    }
    if let Some(shares) = config.cpu_shares {
        limits.push(("cpu.shares", shares.to_string()));
    }
    limits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> NetworkSettings {
        NetworkSettings {
            address: "10.0.3.10".parse().unwrap(),
            netmask: "255.255.255.0".to_string(),
            gateway: "10.0.3.1".to_string(),
            bridge: "lxcbr0".to_string(),
            dns: "10.0.3.1".to_string(),
        }
    }

    #[test]
    fn test_interfaces_file_exact() {
        assert_eq!(
            interfaces_file(&network()),
            "auto lo\niface lo inet loopback\n\nauto eth0\niface eth0 inet static\n  address 10.0.3.10\n  netmask 255.255.255.0\n  gateway 10.0.3.1\n"
        );
    }

    #[test]
    fn test_minimal_fragment() {
        let fragment = ConfigFragment::build(&VmConfig::default(), "lxcbr0", false);
        assert_eq!(
            fragment.render(),
            "lxc.network.type = veth\nlxc.network.link = lxcbr0\nlxc.network.flags = up\n\nlxc.start.auto = 1\n\n"
        );
        assert!(fragment.overrides.is_empty());
    }

    #[test]
    fn test_fragment_limits_and_overrides() {
        let config = VmConfig {
            memory: Some(MemoryLimit::Text("512M".to_string())),
            memory_swappiness: Some(10),
            memory_swap: Some(MemoryLimit::Text("1G".to_string())),
            cpu_shares: Some(2048),
            extended_lxc_config_lines: Some(vec!["lxc.aa_profile = unconfined".to_string()]),
            ..Default::default()
        };
        let fragment = ConfigFragment::build(&config, "br0", true);

        assert_eq!(
            &fragment.lines()[4..],
            &[
                "lxc.cgroup.memory.limit_in_bytes = 512M",
                "lxc.cgroup.memory.swappiness = 10",
                "lxc.cgroup.memory.memsw.limit_in_bytes = 1G",
                "lxc.cgroup.cpu.shares = 2048",
                "lxc.aa_profile = unconfined",
                "",
                "",
            ]
        );
        assert_eq!(
            fragment.overrides.to_json().unwrap(),
            r#"{"memory":{"total":"512M"},"cpu":{"total":2}}"#
        );
    }

    #[test]
    fn test_template_image_name() {
        let hash = template_hash("#!/bin/sh\n", "--release jammy");
        let name = template_image_name(FsBacking::Btrfs, "ubuntu", &hash);
        assert_eq!(name, format!("template-btrfs-ubuntu-{hash}"));
        assert_ne!(hash, template_hash("#!/bin/sh\n", "--release focal"));
    }

    #[test]
    fn test_cgroup_limits() {
        let config = VmConfig {
            memory: Some(MemoryLimit::Bytes(1024)),
            cpu_shares: Some(512),
            ..Default::default()
        };
        assert_eq!(
            cgroup_limits(&config),
            vec![
                ("memory.limit_in_bytes", "1024".to_string()),
                ("cpu.shares", "512".to_string()),
            ]
        );
    }
}
