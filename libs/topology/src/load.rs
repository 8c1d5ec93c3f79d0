//! Topology file loading.

use std::path::Path;

use crate::error::TopologyError;
use crate::types::Topology;

impl Topology {
    /// Load a topology from a `.toml` or `.json` file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| TopologyError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let parsed = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&contents),
            Some("json") => Self::from_json_str(&contents),
            _ => return Err(TopologyError::UnsupportedFormat(path.to_path_buf())),
        };

        parsed.map_err(|message| TopologyError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, String> {
        toml::from_str(contents).map_err(|e| e.to_string())
    }

    pub fn from_json_str(contents: &str) -> Result<Self, String> {
        serde_json::from_str(contents).map_err(|e| e.to_string())
    }
}
