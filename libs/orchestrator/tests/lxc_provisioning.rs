//! Integration tests for the LXC backend.
//!
//! These drive `LxcHypervisor` against a recording remote and check the
//! host commands each lifecycle operation issues.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hvctl_orchestrator::hypervisor::lxc::artifacts::{self, OHAI_OVERRIDE_PATH};
use hvctl_orchestrator::hypervisor::lxc::LxcHypervisor;
use hvctl_orchestrator::hypervisor::BackendContext;
use hvctl_orchestrator::reachability::{GuestProbe, StaticProbe};
use hvctl_orchestrator::remote::{MockRemote, RemoteExec};
use hvctl_orchestrator::{ApplyMode, Error, Hypervisor, Settings};
use hvctl_topology::{FsBacking, HostIp, HypervisorSpec, LvmConfig, MemoryLimit, VmConfig, VmSpec};

const MODERN: &str = "1:2.0.8-0ubuntu1";
const LEGACY: &str = "0.9.0-0ubuntu3";

struct Host {
    lxc: LxcHypervisor,
    remote: Arc<MockRemote>,
    probe: Arc<StaticProbe>,
}

fn settings() -> Settings {
    Settings {
        ssh_wait_timeout: Duration::from_millis(30),
        ssh_wait_interval: Duration::from_millis(5),
        ..Settings::default()
    }
}

fn host_with(version: &str, extra_params: serde_json::Value, probe: StaticProbe) -> Host {
    let mut params = serde_json::json!({
        "lxc_host": "10.0.0.1",
        "lxc_user": "ops",
        "lxc_sudo": true,
    })
    .as_object()
    .unwrap()
    .clone();
    if let Some(extra) = extra_params.as_object() {
        params.extend(extra.clone());
    }
    let spec = HypervisorSpec {
        kind: "lxc".to_string(),
        params,
    };
    let ctx = BackendContext {
        environment: "prod".to_string(),
        name: "h1".to_string(),
        settings: settings(),
    };

    let remote = Arc::new(MockRemote::new("10.0.0.1"));
    remote.respond("dpkg-query", version);
    remote.respond("cat /usr/share/lxc/templates/lxc-ubuntu", "#!/bin/sh\necho ubuntu\n");
    let probe = Arc::new(probe);

    let lxc = LxcHypervisor::with_remote(
        &ctx,
        &spec,
        Arc::clone(&remote) as Arc<dyn RemoteExec>,
        Arc::clone(&probe) as Arc<dyn GuestProbe>,
    )
    .unwrap();

    Host { lxc, remote, probe }
}

fn host(version: &str) -> Host {
    host_with(version, serde_json::json!({}), StaticProbe::reachable())
}

fn config() -> VmConfig {
    VmConfig {
        template_name: Some("ubuntu".to_string()),
        ssh_keys: Some(vec!["ssh-ed25519 AAAAC3Nza ops@example".to_string()]),
        network_gateway: Some("10.0.3.1".to_string()),
        network_netmask: Some("255.255.255.0".to_string()),
        network_bridge: Some("lxcbr0".to_string()),
        ..Default::default()
    }
}

fn vm(name: &str, ip: &str, config: VmConfig) -> VmSpec {
    VmSpec {
        name: name.to_string(),
        node: name.to_string(),
        role: "managed_vm".to_string(),
        admin_hostname: Some(format!("{name}.prod.example")),
        host_ips: BTreeMap::from([(
            "admin".to_string(),
            HostIp {
                ip: ip.parse().unwrap(),
                hostname: None,
            },
        )]),
        config,
    }
}

fn position(commands: &[String], pattern: &str) -> usize {
    commands
        .iter()
        .position(|command| command.contains(pattern))
        .unwrap_or_else(|| panic!("no command containing {pattern:?} in {commands:#?}"))
}

#[tokio::test]
async fn test_chroot_create_on_modern_host() {
    let host = host(MODERN);
    let web = vm("web", "10.0.3.10", config());

    host.lxc
        .create_vms(std::slice::from_ref(&web), ApplyMode::Apply)
        .await
        .unwrap();

    let commands = host.remote.commands();
    let create = position(&commands, "lxc-create -t ubuntu -n web -f /tmp/lxc_config_web");
    let keygen = position(&commands, "ssh-keygen -t rsa");
    let start = position(&commands, "lxc-start -d -n web");
    let cleanup = position(&commands, "rm -f /tmp/lxc_config_web");
    assert!(create < keygen && keygen < cleanup && cleanup < start);

    assert_eq!(host.remote.count_matching("ssh-keygen"), 3);
    assert_eq!(host.remote.count_matching("ln -s"), 0);
    assert!(host.probe.attempts() >= 1);

    let fragment = host.remote.copied("/tmp/lxc_config_web").unwrap();
    assert!(fragment.contains("lxc.network.link = lxcbr0"));
    assert!(fragment.contains("lxc.start.auto = 1"));

    let interfaces = host
        .remote
        .copied("/var/lib/lxc/web/rootfs/etc/network/interfaces")
        .unwrap();
    assert!(interfaces.contains("address 10.0.3.10"));

    let keys = host
        .remote
        .copied("/var/lib/lxc/web/rootfs/home/chef/.ssh/authorized_keys")
        .unwrap();
    assert_eq!(keys, "ssh-ed25519 AAAAC3Nza ops@example\n");
}

#[tokio::test]
async fn test_legacy_host_registers_autostart_link() {
    let host = host(LEGACY);
    let web = vm("web", "10.0.3.10", config());

    host.lxc
        .create_vms(std::slice::from_ref(&web), ApplyMode::Apply)
        .await
        .unwrap();

    let commands = host.remote.commands();
    assert!(commands
        .iter()
        .any(|c| c == "ln -s /var/lib/lxc/web/config /etc/lxc/auto/web.conf"));
    let fragment = host.remote.copied("/tmp/lxc_config_web").unwrap();
    assert!(!fragment.contains("lxc.start.auto"));
}

#[tokio::test]
async fn test_stop_timeout_depends_on_version() {
    let web = vm("web", "10.0.3.10", config());

    let legacy = host(LEGACY);
    legacy
        .lxc
        .stop_vms(std::slice::from_ref(&web), ApplyMode::Apply)
        .await
        .unwrap();
    assert!(legacy.remote.commands().iter().any(|c| c == "lxc-stop -n web"));

    let modern = host(MODERN);
    modern
        .lxc
        .stop_vms(std::slice::from_ref(&web), ApplyMode::Apply)
        .await
        .unwrap();
    assert!(modern
        .remote
        .commands()
        .iter()
        .any(|c| c == "lxc-stop -n web -t 30"));
}

#[tokio::test]
async fn test_template_image_built_once_per_host() {
    let host = host(MODERN);
    let btrfs = VmConfig {
        fs_backing: Some(FsBacking::Btrfs),
        ..config()
    };
    let vms = vec![
        vm("web1", "10.0.3.11", btrfs.clone()),
        vm("web2", "10.0.3.12", btrfs),
    ];

    host.lxc.create_vms(&vms, ApplyMode::Apply).await.unwrap();

    assert_eq!(host.remote.count_matching("-B btrfs"), 1);
    assert_eq!(host.remote.count_matching("lxc-clone -o template-btrfs-ubuntu-"), 2);
    assert_eq!(host.remote.count_matching("sed -i '/^lxc.network/d'"), 2);
    assert_eq!(
        host.remote
            .count_matching("cat /tmp/lxc_config_web1 >> /var/lib/lxc/web1/config"),
        1
    );
}

#[tokio::test]
async fn test_template_image_reused_when_already_on_host() {
    let host = host(MODERN);
    let hash = artifacts::template_hash("#!/bin/sh\necho ubuntu\n", "");
    let image = artifacts::template_image_name(FsBacking::Zfs, "ubuntu", &hash);
    host.remote.respond("lxc-ls", &format!("db\n{image}\n"));

    let web = vm(
        "web",
        "10.0.3.10",
        VmConfig {
            fs_backing: Some(FsBacking::Zfs),
            ..config()
        },
    );
    host.lxc
        .create_vms(std::slice::from_ref(&web), ApplyMode::Apply)
        .await
        .unwrap();

    assert_eq!(host.remote.count_matching("lxc-create"), 0);
    assert_eq!(
        host.remote
            .count_matching(&format!("lxc-clone -o {image} -n web -s")),
        1
    );
}

#[tokio::test]
async fn test_fresh_guest_gets_user_sudoers_and_curl() {
    let host = host(MODERN);
    let web = vm("web", "10.0.3.10", config());

    host.lxc
        .create_vms(std::slice::from_ref(&web), ApplyMode::Apply)
        .await
        .unwrap();

    let commands = host.remote.commands();
    let passwd = position(&commands, "grep -q '^chef:' /var/lib/lxc/web/rootfs/etc/passwd");
    let useradd = position(&commands, "chroot /var/lib/lxc/web/rootfs useradd chef");
    let sudoers = position(&commands, "grep -q '^chef ' /var/lib/lxc/web/rootfs/etc/sudoers");
    let append = position(&commands, "NOPASSWD:ALL' >> /var/lib/lxc/web/rootfs/etc/sudoers");
    assert!(passwd < useradd && sudoers < append);
    assert_eq!(host.remote.count_matching("apt-get install curl -y"), 1);
}

#[tokio::test]
async fn test_reprovisioning_skips_existing_user_and_sudoers_line() {
    let host = host(MODERN);
    host.remote
        .pass("grep -q '^chef:'")
        .pass("grep -q '^chef '")
        .pass("which curl");
    let web = vm("web", "10.0.3.10", config());

    host.lxc
        .create_vms(std::slice::from_ref(&web), ApplyMode::Apply)
        .await
        .unwrap();

    assert_eq!(host.remote.count_matching("grep -q '^chef"), 2);
    assert_eq!(host.remote.count_matching("useradd"), 0);
    assert_eq!(host.remote.count_matching("NOPASSWD:ALL"), 0);
    assert_eq!(host.remote.count_matching("apt-get install curl"), 0);
    assert!(host
        .remote
        .copied("/var/lib/lxc/web/rootfs/home/chef/.ssh/authorized_keys")
        .is_some());
}

#[tokio::test]
async fn test_params_user_overrides_settings() {
    let host = host_with(
        MODERN,
        serde_json::json!({"user": "deploy"}),
        StaticProbe::reachable(),
    );
    assert_eq!(host.lxc.user(), "deploy");

    host.lxc
        .create_vms(&[vm("web", "10.0.3.10", config())], ApplyMode::Apply)
        .await
        .unwrap();
    assert!(host
        .remote
        .copied("/var/lib/lxc/web/rootfs/home/deploy/.ssh/authorized_keys")
        .is_some());
}

#[tokio::test]
async fn test_plan_mode_issues_no_commands() {
    let host = host(MODERN);
    let vms = vec![vm("web", "10.0.3.10", config())];

    host.lxc.create_vms(&vms, ApplyMode::Plan).await.unwrap();
    host.lxc.stop_vms(&vms, ApplyMode::Plan).await.unwrap();
    host.lxc.delete_vms(&vms, ApplyMode::Plan).await.unwrap();
    host.lxc.update_vms(&vms, ApplyMode::Plan).await.unwrap();

    assert!(host.remote.calls().is_empty());
    assert_eq!(host.probe.attempts(), 0);
}

#[tokio::test]
async fn test_missing_template_fails_before_any_command() {
    let host = host(MODERN);
    let bare = VmConfig {
        template_name: None,
        ..config()
    };

    let err = host
        .lxc
        .create_vms(&[vm("web", "10.0.3.10", bare)], ApplyMode::Apply)
        .await
        .unwrap_err();

    match err {
        Error::Vm { vm, source, .. } => {
            assert_eq!(vm, "web");
            assert!(source.is_config());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(host.remote.calls().is_empty());
}

#[tokio::test]
async fn test_lvm_without_volume_group_rejected() {
    let host = host(MODERN);
    let lvm = VmConfig {
        fs_backing: Some(FsBacking::Lvm),
        lvm: Some(LvmConfig {
            vg_name: None,
            root_size: Some("10G".to_string()),
        }),
        ..config()
    };

    let err = host
        .lxc
        .create_vms(&[vm("db", "10.0.3.20", lvm)], ApplyMode::Apply)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("lvm.vg_name"));
    assert_eq!(host.remote.count_matching("lxc-create"), 0);
}

#[tokio::test]
async fn test_lvm_create_mounts_and_unmounts_volume() {
    let host = host(MODERN);
    let lvm = VmConfig {
        fs_backing: Some(FsBacking::Lvm),
        lvm: Some(LvmConfig {
            vg_name: Some("vg0".to_string()),
            root_size: Some("10G".to_string()),
        }),
        ..config()
    };

    host.lxc
        .create_vms(&[vm("db", "10.0.3.20", lvm)], ApplyMode::Apply)
        .await
        .unwrap();

    let commands = host.remote.commands();
    let create = position(&commands, "-B lvm --vgname vg0 --fssize 10G");
    let mount = position(&commands, "mount /dev/vg0/db /var/lib/lxc/db/rootfs");
    let umount = position(&commands, "umount /dev/vg0/db");
    let start = position(&commands, "lxc-start -d -n db");
    assert!(create < mount && mount < umount && umount < start);
}

#[tokio::test]
async fn test_resource_overrides_written_unless_disabled() {
    let limited = VmConfig {
        memory: Some(MemoryLimit::Text("512M".to_string())),
        cpu_shares: Some(2048),
        ..config()
    };
    let target = format!("{}{OHAI_OVERRIDE_PATH}", artifacts::rootfs("web"));

    let host = host(MODERN);
    host.lxc
        .create_vms(&[vm("web", "10.0.3.10", limited.clone())], ApplyMode::Apply)
        .await
        .unwrap();
    let document: serde_json::Value =
        serde_json::from_str(&host.remote.copied(&target).unwrap()).unwrap();
    assert_eq!(document["memory"]["total"], "512M");
    assert_eq!(document["cpu"]["total"], 2);

    let suppressed = host_with(
        MODERN,
        serde_json::json!({"no_ohai_override": true}),
        StaticProbe::reachable(),
    );
    suppressed
        .lxc
        .create_vms(&[vm("web", "10.0.3.10", limited)], ApplyMode::Apply)
        .await
        .unwrap();
    assert!(suppressed.remote.copied(&target).is_none());
}

#[tokio::test]
async fn test_unreachable_guest_times_out() {
    let host = host_with(MODERN, serde_json::json!({}), StaticProbe::unreachable());

    let err = host
        .lxc
        .start_vms(&[vm("web", "10.0.3.10", config())], ApplyMode::Apply)
        .await
        .unwrap_err();

    match err {
        Error::Vm { source, .. } => {
            assert!(matches!(*source, Error::ReachabilityTimeout { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(host.probe.attempts() >= 2);
}

#[tokio::test]
async fn test_delete_tolerates_stop_failure() {
    let host = host(MODERN);
    host.remote.fail_on("lxc-stop");

    host.lxc
        .delete_vms(&[vm("web", "10.0.3.10", config())], ApplyMode::Apply)
        .await
        .unwrap();

    let commands = host.remote.commands();
    let destroy = position(&commands, "lxc-destroy -n web");
    let unlink = position(&commands, "rm -f /etc/lxc/auto/web.conf");
    assert!(destroy < unlink);
}

#[tokio::test]
async fn test_update_applies_cgroup_limits() {
    let host = host(MODERN);
    let limited = VmConfig {
        memory: Some(MemoryLimit::Bytes(536_870_912)),
        cpu_shares: Some(512),
        ..config()
    };

    host.lxc
        .update_vms(&[vm("web", "10.0.3.10", limited)], ApplyMode::Apply)
        .await
        .unwrap();

    let commands = host.remote.commands();
    assert!(commands
        .iter()
        .any(|c| c == "lxc-cgroup -n web memory.limit_in_bytes 536870912"));
    assert!(commands.iter().any(|c| c == "lxc-cgroup -n web cpu.shares 512"));
}

#[tokio::test]
async fn test_listing_cached_until_cleared() {
    let host = host(MODERN);
    host.remote.respond("lxc-ls", "web\ndb\n");

    assert_eq!(host.lxc.list().await.unwrap(), vec!["web", "db"]);
    assert!(host.lxc.exists("db").await.unwrap());
    assert_eq!(host.remote.count_matching("lxc-ls"), 1);

    host.lxc.clear_caches().await;
    host.lxc.list().await.unwrap();
    assert_eq!(host.remote.count_matching("lxc-ls"), 2);
}
