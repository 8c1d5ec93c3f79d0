//! LXC hypervisor backend.
//!
//! Drives one LXC host over a [`RemoteExec`]. Guests are provisioned with
//! the stock `lxc-*` tools, then bootstrapped from the host side by writing
//! into their root filesystem before first boot:
//!
//! 1. Resolve backing, address and template
//! 2. Resolve network settings (per-VM overrides, else `/etc/default/lxc`)
//! 3. Check LVM parameters
//! 4. Render the interfaces file
//! 5. Render the config fragment and resource overrides
//! 6. Stage the fragment on the host
//! 7. Create the root filesystem (lvm, snapshot clone, or chroot)
//! 8. Mount the logical volume (lvm)
//! 9. Regenerate SSH host keys
//! 10. Bind the admin hostname in `/etc/hosts`
//! 11. Install interfaces and resolver configuration
//! 12. Create the management user with its keys and sudo grant
//! 13. Install curl
//! 14. Write the resource override document
//! 15. Unmount, drop the staged fragment, start the guest
//! 16. Register autostart (0.9 hosts)
//! 17. Wait for SSH

pub mod artifacts;
pub mod version;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hvctl_topology::{FsBacking, HypervisorSpec, VmConfig, VmSpec};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use self::artifacts::{ConfigFragment, NetworkSettings};
use self::version::{LxcVersion, VERSION_QUERY};
use super::registry::BackendContext;
use super::{ApplyMode, Hypervisor, VmInfo, VmOperation};
use crate::error::{Error, Result};
use crate::lock_unpoisoned;
use crate::reachability::{wait_for_ssh, GuestProbe, SshProbe, WaitPolicy};
use crate::remote::{RemoteExec, SshRemote};

const STOP_TIMEOUT_SECS: u32 = 30;
const HOST_KEY_TYPES: [&str; 3] = ["rsa", "dsa", "ecdsa"];
const REQUIRED_PARAMS: [&str; 3] = ["lxc_host", "lxc_user", "lxc_sudo"];

/// `params` of an `lxc` hypervisor entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LxcParams {
    pub lxc_host: String,
    pub lxc_user: String,
    pub lxc_sudo: bool,

    /// Defaults layered beneath node configuration.
    #[serde(default)]
    pub default_vm: Option<VmConfig>,

    /// Skip writing the resource override document into guests.
    #[serde(default)]
    pub no_ohai_override: bool,

    /// Management user for guests on this host.
    #[serde(default)]
    pub user: Option<String>,
}

impl LxcParams {
    pub fn from_spec(hypervisor_id: &str, spec: &HypervisorSpec) -> Result<Self> {
        for key in REQUIRED_PARAMS {
            if !spec.params.contains_key(key) {
                return Err(Error::Config(format!(
                    "hypervisor {hypervisor_id}: missing param {key}"
                )));
            }
        }
        serde_json::from_value(serde_json::Value::Object(spec.params.clone()))
            .map_err(|e| Error::Config(format!("hypervisor {hypervisor_id}: {e}")))
    }
}

/// Settings of one guest resolved before anything touches the host.
struct Provisioning<'a> {
    backing: FsBacking,
    template: &'a str,
    template_opts: &'a str,
    ssh_keys: &'a [String],
    lvm: Option<(&'a str, &'a str)>,
}

/// An LXC host.
pub struct LxcHypervisor {
    id: String,
    params: LxcParams,
    user: String,
    remote: Arc<dyn RemoteExec>,
    probe: Arc<dyn GuestProbe>,
    wait: WaitPolicy,
    version: OnceCell<LxcVersion>,
    listing: Mutex<Option<Vec<String>>>,
    template_images: Mutex<BTreeSet<String>>,
}

impl LxcHypervisor {
    pub const KIND: &'static str = "lxc";

    /// Backend reaching its host over the system SSH client.
    pub fn from_spec(ctx: &BackendContext, spec: &HypervisorSpec) -> Result<Self> {
        let params = LxcParams::from_spec(&ctx.hypervisor_id(), spec)?;
        let remote = SshRemote::new(
            &ctx.settings.ssh_bin,
            &params.lxc_host,
            &params.lxc_user,
            params.lxc_sudo,
        );
        let probe = SshProbe::new(&ctx.settings.ssh_bin);
        Self::with_remote(ctx, spec, Arc::new(remote), Arc::new(probe))
    }

    /// Backend with explicit remote and guest probe.
    pub fn with_remote(
        ctx: &BackendContext,
        spec: &HypervisorSpec,
        remote: Arc<dyn RemoteExec>,
        probe: Arc<dyn GuestProbe>,
    ) -> Result<Self> {
        let id = ctx.hypervisor_id();
        let params = LxcParams::from_spec(&id, spec)?;
        let user = params
            .user
            .clone()
            .unwrap_or_else(|| ctx.settings.management_user.clone());

        Ok(Self {
            id,
            params,
            user,
            remote,
            probe,
            wait: WaitPolicy::from_settings(&ctx.settings),
            version: OnceCell::new(),
            listing: Mutex::new(None),
            template_images: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn params(&self) -> &LxcParams {
        &self.params
    }

    /// Management user created in guests.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Installed LXC version, queried once per instance.
    pub async fn version(&self) -> Result<&LxcVersion> {
        self.version
            .get_or_try_init(|| async {
                let raw = self.remote.capture(VERSION_QUERY).await?;
                let version = LxcVersion::parse(&raw);
                info!(
                    hypervisor = %self.id,
                    version = %version,
                    legacy = version.is_legacy(),
                    "Detected lxc version"
                );
                Ok::<_, Error>(version)
            })
            .await
    }

    async fn is_legacy(&self) -> Result<bool> {
        Ok(self.version().await?.is_legacy())
    }

    fn invalidate_listing(&self) {
        *lock_unpoisoned(&self.listing) = None;
    }

    async fn host_default(&self, variable: &str) -> Result<String> {
        let output = self
            .remote
            .capture(&format!(". /etc/default/lxc && echo ${variable}"))
            .await?;
        Ok(output.trim().to_string())
    }

    async fn network_settings(&self, vm: &VmSpec) -> Result<NetworkSettings> {
        let config = &vm.config;
        let address = vm.ip_config()?.ip;

        let gateway = match &config.network_gateway {
            Some(gateway) => gateway.clone(),
            None => self.host_default("LXC_ADDR").await?,
        };
        let netmask = match &config.network_netmask {
            Some(netmask) => netmask.clone(),
            None => self.host_default("LXC_NETMASK").await?,
        };
        let bridge = match &config.network_bridge {
            Some(bridge) => bridge.clone(),
            None => self.host_default("LXC_BRIDGE").await?,
        };
        let dns = config.network_dns.clone().unwrap_or_else(|| gateway.clone());

        Ok(NetworkSettings {
            address,
            netmask,
            gateway,
            bridge,
            dns,
        })
    }

    fn provisioning<'a>(&self, vm: &'a VmSpec) -> Result<Provisioning<'a>> {
        let config = &vm.config;
        let template = config
            .template_name
            .as_deref()
            .ok_or_else(|| Error::Config(format!("no template specified for vm {}", vm.name)))?;
        let ssh_keys = config
            .ssh_keys
            .as_deref()
            .ok_or_else(|| Error::Config(format!("no ssh_keys specified for vm {}", vm.name)))?;

        Ok(Provisioning {
            backing: config.fs_backing(),
            template,
            template_opts: config.template_opts.as_deref().unwrap_or_default(),
            ssh_keys,
            lvm: None,
        })
    }

    fn lvm_params<'a>(vm: &'a VmSpec) -> Result<(&'a str, &'a str)> {
        let lvm = vm.config.lvm.as_ref();
        let vg = lvm
            .and_then(|lvm| lvm.vg_name.as_deref())
            .ok_or_else(|| Error::Config(format!("no lvm.vg_name for vm {}", vm.name)))?;
        let size = lvm
            .and_then(|lvm| lvm.root_size.as_deref())
            .ok_or_else(|| Error::Config(format!("no lvm.root_size for vm {}", vm.name)))?;
        Ok((vg, size))
    }

    /// Make sure the snapshot source for a template exists on the host.
    async fn ensure_template_image(&self, vm: &VmSpec, plan: &Provisioning<'_>) -> Result<String> {
        let prefix = vm
            .config
            .template_prefix
            .as_deref()
            .unwrap_or(artifacts::DEFAULT_TEMPLATE_PREFIX);
        let script = self
            .remote
            .capture(&format!("cat {prefix}{}", plan.template))
            .await?;
        let hash = artifacts::template_hash(&script, plan.template_opts);
        let image = artifacts::template_image_name(plan.backing, plan.template, &hash);

        if lock_unpoisoned(&self.template_images).contains(&image) {
            debug!(hypervisor = %self.id, image = %image, "Template image already materialized");
            return Ok(image);
        }

        if !self.list().await?.contains(&image) {
            info!(hypervisor = %self.id, image = %image, template = %plan.template, "Creating template image");
            self.remote
                .run(&with_template_opts(
                    format!(
                        "lxc-create -t {} -n {image} -B {}",
                        plan.template, plan.backing
                    ),
                    plan.template_opts,
                ))
                .await?;
            self.invalidate_listing();
        }

        lock_unpoisoned(&self.template_images).insert(image.clone());
        Ok(image)
    }

    async fn create_vm(&self, vm: &VmSpec) -> Result<()> {
        let name = vm.name.as_str();

        // 1. Resolve
        let mut plan = self.provisioning(vm)?;
        info!(
            hypervisor = %self.id,
            vm = %name,
            template = %plan.template,
            options = %plan.template_opts,
            backing = %plan.backing,
            "Creating vm"
        );

        // 2. Network
        let network = self.network_settings(vm).await?;
        info!(
            vm = %name,
            address = %network.address,
            netmask = %network.netmask,
            gateway = %network.gateway,
            bridge = %network.bridge,
            dns = %network.dns,
            "Network config"
        );

        // 3. LVM
        if plan.backing == FsBacking::Lvm {
            plan.lvm = Some(Self::lvm_params(vm)?);
        }

        let legacy = self.is_legacy().await?;
        let rootfs = artifacts::rootfs(name);
        let config_path = artifacts::config_path(name);
        let staged = artifacts::staged_config_path(name);

        // 4-6. Render and stage
        let interfaces = artifacts::interfaces_file(&network);
        let fragment = ConfigFragment::build(&vm.config, &network.bridge, legacy);
        self.remote.copy(&staged, &fragment.render()).await?;

        // 7. Root filesystem
        match (plan.lvm, plan.backing) {
            (Some((vg, size)), _) => {
                self.remote
                    .run(&with_template_opts(
                        format!(
                            "lxc-create -t {} -n {name} -f {staged} -B lvm --vgname {vg} --fssize {size}",
                            plan.template
                        ),
                        plan.template_opts,
                    ))
                    .await?;
            }
            (None, FsBacking::Btrfs | FsBacking::Zfs) => {
                let image = self.ensure_template_image(vm, &plan).await?;
                self.remote
                    .run(&format!("lxc-clone -o {image} -n {name} -s"))
                    .await?;
                if !legacy {
                    self.remote
                        .run(&format!("sed -i '/^lxc.network/d' {config_path}"))
                        .await?;
                }
                self.remote
                    .run(&format!("cat {staged} >> {config_path}"))
                    .await?;
            }
            (None, _) => {
                self.remote
                    .run(&with_template_opts(
                        format!("lxc-create -t {} -n {name} -f {staged}", plan.template),
                        plan.template_opts,
                    ))
                    .await?;
            }
        }

        // 8. Mount
        if let Some((vg, _)) = plan.lvm {
            self.remote
                .run(&format!("mount /dev/{vg}/{name} {rootfs}"))
                .await?;
        }

        // 9. Host keys
        self.remote
            .run(&format!("rm -f {rootfs}/etc/ssh/ssh_host*key*"))
            .await?;
        for key_type in HOST_KEY_TYPES {
            self.remote
                .run(&format!(
                    "ssh-keygen -t {key_type} -f {rootfs}/etc/ssh/ssh_host_{key_type}_key -C root@{name} -N '' -q"
                ))
                .await?;
        }

        // 10. Hostname
        self.remote
            .run(&format!(
                "sed -i 's/^127.0.1.1.*$/127.0.1.1 {} {name}/' {rootfs}/etc/hosts",
                vm.hostname()
            ))
            .await?;

        // 11. Network files
        self.remote
            .copy(&format!("{rootfs}/etc/network/interfaces"), &interfaces)
            .await?;
        self.remote
            .run(&format!("rm -f {rootfs}/etc/resolv.conf"))
            .await?;
        self.remote
            .run(&format!(
                "echo nameserver {} > {rootfs}/etc/resolv.conf",
                network.dns
            ))
            .await?;

        // 12. Management user
        self.provision_user(name, &rootfs, plan.ssh_keys).await?;

        // 13. Baseline tooling
        self.ensure(
            &format!("chroot {rootfs} which curl"),
            &format!("chroot {rootfs} apt-get install curl -y"),
        )
        .await?;

        // 14. Resource overrides
        if !fragment.overrides.is_empty() && !self.params.no_ohai_override {
            let document = fragment
                .overrides
                .to_json()
                .map_err(|e| Error::Internal(format!("encoding resource overrides: {e}")))?;
            self.remote
                .run(&format!("mkdir -p {rootfs}{}", artifacts::OHAI_OVERRIDE_DIR))
                .await?;
            self.remote
                .copy(
                    &format!("{rootfs}{}", artifacts::OHAI_OVERRIDE_PATH),
                    &document,
                )
                .await?;
        }

        // 15. Boot
        if let Some((vg, _)) = plan.lvm {
            self.remote.run(&format!("umount /dev/{vg}/{name}")).await?;
        }
        self.remote.run(&format!("rm -f {staged}")).await?;
        self.remote.run(&format!("lxc-start -d -n {name}")).await?;

        // 16. Autostart
        if legacy {
            self.remote
                .run(&format!(
                    "ln -s {config_path} {}",
                    artifacts::autostart_link(name)
                ))
                .await?;
        }

        // 17. Reachability
        self.wait_for_guest(vm).await?;

        info!(hypervisor = %self.id, vm = %name, "Vm created");
        Ok(())
    }

    async fn provision_user(&self, name: &str, rootfs: &str, ssh_keys: &[String]) -> Result<()> {
        let user = self.user.as_str();
        debug!(vm = %name, user = %user, "Provisioning management user");

        self.ensure(
            &format!("grep -q '^{user}:' {rootfs}/etc/passwd"),
            &format!(
                "chroot {rootfs} useradd {user} --shell /bin/bash --create-home --home /home/{user}"
            ),
        )
        .await?;
        self.remote
            .run(&format!("chroot {rootfs} mkdir -p /home/{user}/.ssh"))
            .await?;

        let mut authorized_keys = ssh_keys.join("\n");
        authorized_keys.push('\n');
        self.remote
            .copy(
                &format!("{rootfs}/home/{user}/.ssh/authorized_keys"),
                &authorized_keys,
            )
            .await?;
        self.remote
            .run(&format!("chroot {rootfs} chown -R {user} /home/{user}/.ssh"))
            .await?;
        self.ensure(
            &format!("grep -q '^{user} ' {rootfs}/etc/sudoers"),
            &format!("echo '{user}   ALL=(ALL) NOPASSWD:ALL' >> {rootfs}/etc/sudoers"),
        )
        .await
    }

    /// Run `action` unless `check` already holds.
    async fn ensure(&self, check: &str, action: &str) -> Result<()> {
        if self.remote.check(check).await? {
            debug!(hypervisor = %self.id, check = %check, "Already satisfied");
            return Ok(());
        }
        self.remote.run(action).await
    }

    async fn wait_for_guest(&self, vm: &VmSpec) -> Result<()> {
        let ip = vm.admin_ip()?;
        wait_for_ssh(self.probe.as_ref(), &vm.name, ip, &self.user, self.wait).await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let command = if self.is_legacy().await? {
            format!("lxc-stop -n {name}")
        } else {
            format!("lxc-stop -n {name} -t {STOP_TIMEOUT_SECS}")
        };
        self.remote.run(&command).await
    }

    async fn start(&self, vm: &VmSpec) -> Result<()> {
        self.remote
            .run(&format!("lxc-start -d -n {}", vm.name))
            .await?;
        self.wait_for_guest(vm).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if let Err(e) = self.stop(name).await {
            debug!(hypervisor = %self.id, vm = %name, error = %e, "Stop before destroy failed");
        }
        self.remote.run(&format!("lxc-destroy -n {name}")).await?;
        self.remote
            .run(&format!("rm -f {}", artifacts::autostart_link(name)))
            .await
    }

    async fn update(&self, vm: &VmSpec) -> Result<()> {
        let limits = artifacts::cgroup_limits(&vm.config);
        if limits.is_empty() {
            debug!(hypervisor = %self.id, vm = %vm.name, "No resource limits to update");
            return Ok(());
        }
        for (key, value) in limits {
            self.remote
                .run(&format!("lxc-cgroup -n {} {key} {value}", vm.name))
                .await?;
        }
        Ok(())
    }

    async fn info(&self, name: &str) -> Result<VmInfo> {
        let output = self.remote.capture(&format!("lxc-info -n {name}")).await?;
        Ok(parse_info(name, &output))
    }

    /// Run `action` for each VM in order, tagging failures with the VM.
    async fn for_each<'a, F, Fut>(
        &self,
        operation: VmOperation,
        vms: &'a [VmSpec],
        mode: ApplyMode,
        action: F,
    ) -> Result<()>
    where
        F: Fn(&'a VmSpec) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        if !mode.is_apply() {
            for vm in vms {
                info!(hypervisor = %self.id, vm = %vm.name, operation = %operation, "Plan: would run");
            }
            return Ok(());
        }
        for vm in vms {
            info!(hypervisor = %self.id, vm = %vm.name, operation = %operation, "Running");
            action(vm)
                .await
                .map_err(|e| Error::in_vm(&vm.name, operation.as_str(), e))?;
        }
        Ok(())
    }
}

/// Append `-- <options>` for the template script when options are set.
fn with_template_opts(command: String, options: &str) -> String {
    if options.trim().is_empty() {
        command
    } else {
        format!("{command} -- {options}")
    }
}

/// Parse `lxc-info` output (`Key: value` lines).
fn parse_info(name: &str, output: &str) -> VmInfo {
    let mut details = BTreeMap::new();
    let mut state = None;
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().to_string();
        if key.eq_ignore_ascii_case("state") {
            state = Some(value.to_ascii_uppercase());
        } else if !key.is_empty() && !key.eq_ignore_ascii_case("name") {
            details.insert(key.to_string(), value);
        }
    }
    VmInfo {
        name: name.to_string(),
        state: state.unwrap_or_else(|| "UNKNOWN".to_string()),
        details,
    }
}

#[async_trait]
impl Hypervisor for LxcHypervisor {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn list(&self) -> Result<Vec<String>> {
        let cached = lock_unpoisoned(&self.listing).clone();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let output = self.remote.capture("lxc-ls -1").await?;
        let names: Vec<String> = output
            .split_whitespace()
            .map(str::to_string)
            .collect();
        debug!(hypervisor = %self.id, count = names.len(), "Listed containers");

        *lock_unpoisoned(&self.listing) = Some(names.clone());
        Ok(names)
    }

    async fn create_vms(&self, vms: &[VmSpec], mode: ApplyMode) -> Result<()> {
        let result = self
            .for_each(VmOperation::Create, vms, mode, move |vm| self.create_vm(vm))
            .await;
        if mode.is_apply() {
            self.invalidate_listing();
        }
        result
    }

    async fn start_vms(&self, vms: &[VmSpec], mode: ApplyMode) -> Result<()> {
        self.for_each(VmOperation::Start, vms, mode, move |vm| self.start(vm))
            .await
    }

    async fn stop_vms(&self, vms: &[VmSpec], mode: ApplyMode) -> Result<()> {
        self.for_each(VmOperation::Stop, vms, mode, move |vm| self.stop(&vm.name))
            .await
    }

    async fn reboot_vms(&self, vms: &[VmSpec], mode: ApplyMode) -> Result<()> {
        self.for_each(VmOperation::Reboot, vms, mode, move |vm| async move {
            self.stop(&vm.name).await?;
            self.start(vm).await
        })
        .await
    }

    async fn update_vms(&self, vms: &[VmSpec], mode: ApplyMode) -> Result<()> {
        self.for_each(VmOperation::Update, vms, mode, move |vm| self.update(vm))
            .await
    }

    async fn delete_vms(&self, vms: &[VmSpec], mode: ApplyMode) -> Result<()> {
        let result = self
            .for_each(VmOperation::Delete, vms, mode, move |vm| self.delete(&vm.name))
            .await;
        if mode.is_apply() {
            self.invalidate_listing();
        }
        result
    }

    async fn info_vms(&self, vms: &[VmSpec], mode: ApplyMode) -> Result<Vec<VmInfo>> {
        if !mode.is_apply() {
            return Ok(Vec::new());
        }
        let mut rows = Vec::with_capacity(vms.len());
        for vm in vms {
            let row = self
                .info(&vm.name)
                .await
                .map_err(|e| Error::in_vm(&vm.name, "info", e))?;
            rows.push(row);
        }
        Ok(rows)
    }

    async fn clear_caches(&self) {
        debug!(hypervisor = %self.id, "Clearing caches");
        self.invalidate_listing();
    }

    fn default_vm_config(&self) -> Option<&VmConfig> {
        self.params.default_vm.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_require_connection_keys() {
        let spec = HypervisorSpec {
            kind: "lxc".to_string(),
            params: serde_json::json!({"lxc_host": "10.0.0.1", "lxc_user": "ops"})
                .as_object()
                .unwrap()
                .clone(),
        };
        let err = LxcParams::from_spec("prod_h1", &spec).unwrap_err();
        assert!(err.to_string().contains("missing param lxc_sudo"));
    }

    #[test]
    fn test_params_parse_defaults() {
        let spec = HypervisorSpec {
            kind: "lxc".to_string(),
            params: serde_json::json!({
                "lxc_host": "10.0.0.1",
                "lxc_user": "ops",
                "lxc_sudo": true,
                "default_vm": {"template_name": "ubuntu", "fs_backing": "btrfs"}
            })
            .as_object()
            .unwrap()
            .clone(),
        };
        let params = LxcParams::from_spec("prod_h1", &spec).unwrap();
        assert!(params.lxc_sudo);
        assert!(!params.no_ohai_override);
        let defaults = params.default_vm.unwrap();
        assert_eq!(defaults.fs_backing(), FsBacking::Btrfs);
    }

    #[test]
    fn test_template_opts_appended_only_when_set() {
        assert_eq!(
            with_template_opts("lxc-create -t ubuntu -n a".to_string(), ""),
            "lxc-create -t ubuntu -n a"
        );
        assert_eq!(
            with_template_opts("lxc-create -t ubuntu -n a".to_string(), "-r jammy"),
            "lxc-create -t ubuntu -n a -- -r jammy"
        );
    }

    #[test]
    fn test_parse_info() {
        let info = parse_info(
            "web",
            "Name:           web\nState:          RUNNING\nPID:            4242\nIP:             10.0.3.10\n",
        );
        assert_eq!(info.state, "RUNNING");
        assert_eq!(info.details.get("PID").map(String::as_str), Some("4242"));
        assert!(!info.details.contains_key("Name"));

        let legacy = parse_info("web", "state:   STOPPED\npid:        -1\n");
        assert_eq!(legacy.state, "STOPPED");
        assert_eq!(parse_info("web", "").state, "UNKNOWN");
    }
}
