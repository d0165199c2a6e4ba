//! Topology discovery from sysfs
//!
//! Reads `devices/system/node/node<N>/cpulist` for every NUMA node. Machines
//! without NUMA support expose no node directories; all online CPUs from
//! `devices/system/cpu/online` are then placed on node 0.

use super::{CpuSet, CpuTopology, TopologyProvider};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Topology provider backed by a sysfs mount
pub struct SysfsTopologyProvider {
    sysfs_root: PathBuf,
}

impl SysfsTopologyProvider {
    /// Create a provider reading from `sysfs_root` (normally `/sys`)
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
        }
    }

    fn node_dir(&self) -> PathBuf {
        self.sysfs_root.join("devices/system/node")
    }

    /// Parse a `node<N>` directory name
    pub fn parse_node_id(name: &str) -> Option<usize> {
        name.strip_prefix("node")?.parse().ok()
    }

    async fn read_cpulist(path: &Path) -> Result<CpuSet> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        CpuSet::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    async fn discover_numa_nodes(&self) -> Result<BTreeMap<usize, CpuSet>> {
        let mut nodes = BTreeMap::new();
        let node_dir = self.node_dir();

        let mut entries = match fs::read_dir(&node_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = %node_dir.display(), error = %e, "No NUMA node directory");
                return Ok(nodes);
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(numa) = name.to_str().and_then(Self::parse_node_id) else {
                continue;
            };
            let cpus = Self::read_cpulist(&entry.path().join("cpulist")).await?;
            nodes.insert(numa, cpus);
        }

        Ok(nodes)
    }
}

#[async_trait]
impl TopologyProvider for SysfsTopologyProvider {
    async fn topology(&self) -> Result<CpuTopology> {
        let nodes = self.discover_numa_nodes().await?;

        let pairs: Vec<(usize, usize)> = if nodes.is_empty() {
            let online = self.sysfs_root.join("devices/system/cpu/online");
            let cpus = Self::read_cpulist(&online).await?;
            cpus.iter().map(|cpu| (cpu, 0)).collect()
        } else {
            nodes
                .iter()
                .flat_map(|(&numa, cpus)| cpus.iter().map(move |cpu| (cpu, numa)))
                .collect()
        };

        if pairs.is_empty() {
            bail!("No CPUs found under {}", self.sysfs_root.display());
        }

        let topology = CpuTopology::new(pairs);
        info!(
            numa_nodes = topology.num_numa_nodes(),
            cpus = topology.num_cpus(),
            "Discovered CPU topology"
        );
        Ok(topology)
    }
}
