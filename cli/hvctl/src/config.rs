//! Topology file discovery.

use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use hvctl_topology::Topology;

/// Topology file looked up in the config directory.
const TOPOLOGY_FILE: &str = "topology.toml";

/// Get the config directory path.
fn config_dir() -> Result<PathBuf> {
    ProjectDirs::from("com", "hvctl", "hvctl")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
}

/// Path of the topology to load: the explicit one, else the config directory's.
pub fn topology_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => Ok(config_dir()?.join(TOPOLOGY_FILE)),
    }
}

pub fn load_topology(explicit: Option<PathBuf>) -> Result<Topology> {
    let path = topology_path(explicit)?;
    Topology::from_path(&path)
        .with_context(|| format!("Failed to load topology from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_wins() {
        let path = topology_path(Some(PathBuf::from("/srv/topology.json"))).unwrap();
        assert_eq!(path, PathBuf::from("/srv/topology.json"));
    }
}
