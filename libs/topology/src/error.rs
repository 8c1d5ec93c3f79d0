//! Error types for topology loading and resolution.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or interpreting a topology.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The topology file could not be read.
    #[error("failed to read topology from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The topology file could not be parsed.
    #[error("failed to parse topology from {path:?}: {message}")]
    Parse { path: PathBuf, message: String },

    /// The file extension does not map to a known format.
    #[error("unsupported topology format for {0:?} (expected .toml or .json)")]
    UnsupportedFormat(PathBuf),

    /// The requested environment is not declared.
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    /// Neither the node nor the environment default names a hypervisor.
    #[error("no hypervisor found for node {node} on {environment}")]
    NoHypervisor { node: String, environment: String },

    /// The VM has no internal or admin address to configure.
    #[error("no internal or admin address declared for vm {0}")]
    MissingAddress(String),
}

impl TopologyError {
    /// Returns true if the error comes from reading or parsing the file.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            Self::Read { .. } | Self::Parse { .. } | Self::UnsupportedFormat(_)
        )
    }
}
