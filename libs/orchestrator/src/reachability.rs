//! Guest reachability polling.

use std::net::IpAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::{Error, Result};

/// Answers whether a guest accepts SSH logins.
#[async_trait]
pub trait GuestProbe: Send + Sync {
    async fn is_reachable(&self, ip: IpAddr, user: &str) -> bool;
}

/// Probe that attempts a non-interactive SSH login running `true`.
#[derive(Debug, Clone)]
pub struct SshProbe {
    ssh_bin: String,
}

impl SshProbe {
    pub fn new(ssh_bin: &str) -> Self {
        Self {
            ssh_bin: ssh_bin.to_string(),
        }
    }
}

#[async_trait]
impl GuestProbe for SshProbe {
    async fn is_reachable(&self, ip: IpAddr, user: &str) -> bool {
        let status = Command::new(&self.ssh_bin)
            .args([
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=5",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
            ])
            .arg(format!("{user}@{ip}"))
            .arg("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;

        matches!(status, Ok(status) if status.success())
    }
}

/// Probe with a fixed answer that counts how often it was asked.
#[derive(Debug, Default)]
pub struct StaticProbe {
    reachable: bool,
    attempts: AtomicUsize,
}

impl StaticProbe {
    pub fn reachable() -> Self {
        Self {
            reachable: true,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GuestProbe for StaticProbe {
    async fn is_reachable(&self, _ip: IpAddr, _user: &str) -> bool {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.reachable
    }
}

/// Bounds of a reachability wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            timeout: settings.ssh_wait_timeout,
            interval: settings.ssh_wait_interval,
        }
    }
}

/// Poll until the guest answers on SSH or the policy's timeout elapses.
pub async fn wait_for_ssh(
    probe: &dyn GuestProbe,
    vm: &str,
    ip: IpAddr,
    user: &str,
    policy: WaitPolicy,
) -> Result<()> {
    info!(vm = %vm, ip = %ip, user = %user, "Waiting for ssh");

    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if probe.is_reachable(ip, user).await {
            info!(vm = %vm, attempt, elapsed_ms = started.elapsed().as_millis() as u64, "Guest reachable");
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::ReachabilityTimeout {
                vm: vm.to_string(),
                ip,
                waited: now - started,
            });
        }

        debug!(vm = %vm, attempt, "Guest not reachable yet");
        tokio::time::sleep(policy.interval.min(deadline - now)).await;
    }
}
