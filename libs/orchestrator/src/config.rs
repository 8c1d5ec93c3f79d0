//! Orchestrator settings.

use std::num::NonZeroUsize;
use std::time::Duration;

use crate::error::{Error, Result};

/// Process-wide settings shared by every backend of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// User created inside guests and used to reach them over SSH.
    pub management_user: String,

    /// SSH client binary.
    pub ssh_bin: String,

    /// Upper bound on waiting for a guest's SSH service.
    pub ssh_wait_timeout: Duration,

    /// Delay between two reachability probes.
    pub ssh_wait_interval: Duration,

    /// Maximum VMs handed to one backend call.
    pub batch_size: Option<NonZeroUsize>,

    /// Maximum hypervisor groups processed at once.
    pub max_parallel: Option<NonZeroUsize>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            management_user: "chef".to_string(),
            ssh_bin: "ssh".to_string(),
            ssh_wait_timeout: Duration::from_secs(300),
            ssh_wait_interval: Duration::from_secs(5),
            batch_size: None,
            max_parallel: None,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let management_user =
            lookup("HVCTL_MANAGEMENT_USER").unwrap_or(defaults.management_user);

        let ssh_bin = lookup("HVCTL_SSH_BIN").unwrap_or(defaults.ssh_bin);

        let ssh_wait_timeout = parse_secs(&lookup, "HVCTL_SSH_WAIT_TIMEOUT_SECS")?
            .unwrap_or(defaults.ssh_wait_timeout);

        let ssh_wait_interval = parse_secs(&lookup, "HVCTL_SSH_WAIT_INTERVAL_SECS")?
            .unwrap_or(defaults.ssh_wait_interval);

        let batch_size = parse_positive(&lookup, "HVCTL_BATCH_SIZE")?;
        let max_parallel = parse_positive(&lookup, "HVCTL_MAX_PARALLEL")?;

        let log_level = lookup("HVCTL_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            management_user,
            ssh_bin,
            ssh_wait_timeout,
            ssh_wait_interval,
            batch_size,
            max_parallel,
            log_level,
        })
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| Error::Config(format!("{key}={raw}: {e}")))
        })
        .transpose()
}

fn parse_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<NonZeroUsize>> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<NonZeroUsize>()
                .map_err(|e| Error::Config(format!("{key}={raw}: {e}")))
        })
        .transpose()
}
