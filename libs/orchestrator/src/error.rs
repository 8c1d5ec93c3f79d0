//! Orchestrator error taxonomy.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use hvctl_reconcile::{AggregateError, GroupFailure};
use hvctl_topology::TopologyError;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the orchestration engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or incomplete configuration. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Topology could not be loaded or resolved.
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// A command failed on a remote host, or the host was unreachable.
    #[error("command failed on {host}: `{command}`: {message}")]
    Remote {
        host: String,
        command: String,
        message: String,
    },

    /// An operation failed for one VM.
    #[error("{operation} of vm {vm} failed: {source}")]
    Vm {
        vm: String,
        operation: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// The guest never answered on SSH within the wait bound.
    #[error("vm {vm} not reachable over ssh at {ip} after {waited:?}")]
    ReachabilityTimeout {
        vm: String,
        ip: IpAddr,
        waited: Duration,
    },

    /// The backend does not implement the operation.
    #[error("{backend} hypervisor does not support {operation}")]
    Unsupported {
        backend: String,
        operation: &'static str,
    },

    /// A DNS provider rejected an update.
    #[error("dns provider {provider}: {message}")]
    Dns { provider: String, message: String },

    /// One or more hypervisor groups failed; the others completed.
    #[error("{0}")]
    Aggregate(GroupFailures),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Attach the VM and operation to an error, unless already attached.
    pub fn in_vm(vm: &str, operation: &'static str, source: Error) -> Self {
        match source {
            already @ Error::Vm { .. } => already,
            other => Error::Vm {
                vm: vm.to_string(),
                operation,
                source: Box::new(other),
            },
        }
    }

    /// Returns true for configuration and topology errors.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Topology(_))
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::Aggregate(_))
    }

    /// Hypervisor groups that failed, if this is an aggregate error.
    pub fn failed_groups(&self) -> Vec<&str> {
        match self {
            Self::Aggregate(failures) => failures
                .failures
                .iter()
                .map(|(group, _)| group.as_str())
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl From<AggregateError<String, Error>> for Error {
    fn from(aggregate: AggregateError<String, Error>) -> Self {
        let failures = aggregate
            .failures
            .into_iter()
            .map(|(group, failure)| {
                let error = match failure {
                    GroupFailure::Failed(e) => e,
                    GroupFailure::Panicked(message) => Error::Internal(message),
                };
                (group, error)
            })
            .collect();

        Error::Aggregate(GroupFailures {
            succeeded: aggregate.succeeded,
            failures,
        })
    }
}

/// Failed hypervisor groups of one fan-out.
#[derive(Debug)]
pub struct GroupFailures {
    /// Number of groups that completed.
    pub succeeded: usize,

    /// Hypervisor name and error of every failed group.
    pub failures: Vec<(String, Error)>,
}

impl fmt::Display for GroupFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} hypervisor groups failed",
            self.failures.len(),
            self.failures.len() + self.succeeded
        )?;
        for (group, error) in &self.failures {
            write!(f, "\n  {group}: {error}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_error() -> Error {
        Error::Remote {
            host: "10.0.0.1".to_string(),
            command: "lxc-ls -1".to_string(),
            message: "connection refused".to_string(),
        }
    }

    #[test]
    fn test_in_vm_wraps_once() {
        let wrapped = Error::in_vm("vmA", "create", remote_error());
        let rewrapped = Error::in_vm("vmA", "start", wrapped);

        match rewrapped {
            Error::Vm { vm, operation, .. } => {
                assert_eq!(vm, "vmA");
                assert_eq!(operation, "create");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_aggregate_display_lists_groups() {
        let aggregate = AggregateError {
            succeeded: 1,
            failures: vec![("h1".to_string(), GroupFailure::Failed(remote_error()))],
        };
        let error = Error::from(aggregate);

        assert!(error.is_aggregate());
        assert_eq!(error.failed_groups(), vec!["h1"]);
        let text = error.to_string();
        assert!(text.starts_with("1 of 2 hypervisor groups failed"));
        assert!(text.contains("h1: command failed on 10.0.0.1"));
    }

    #[test]
    fn test_config_classification() {
        assert!(Error::Config("missing lxc_host".into()).is_config());
        assert!(Error::from(TopologyError::UnknownEnvironment("x".into())).is_config());
        assert!(!remote_error().is_config());
    }
}
