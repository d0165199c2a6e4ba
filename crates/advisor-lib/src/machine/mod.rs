//! Machine information: CPU sets and NUMA topology
//!
//! This module provides:
//! - `CpuSet`, the set primitive every allocation is expressed in
//! - `CpuTopology`, the CPU <-> NUMA node index
//! - Topology providers (sysfs discovery or a fixed layout)

mod cpuset;
mod sysfs;
mod topology;

pub use cpuset::{CpuSet, MAX_CPU_ID};
pub use sysfs::SysfsTopologyProvider;
pub use topology::{CpuTopology, NumaAssignments, NumaLayout};

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;

/// Source of the machine's CPU topology
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    /// Return the current CPU topology
    async fn topology(&self) -> Result<CpuTopology>;
}

/// Provider returning a fixed topology
pub struct StaticTopologyProvider {
    topology: CpuTopology,
}

impl StaticTopologyProvider {
    pub fn new(topology: CpuTopology) -> Self {
        Self { topology }
    }

    /// Load a JSON `NumaLayout` file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read topology file {}", path.display()))?;
        let topology: CpuTopology = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse topology file {}", path.display()))?;
        Ok(Self::new(topology))
    }
}

#[async_trait]
impl TopologyProvider for StaticTopologyProvider {
    async fn topology(&self) -> Result<CpuTopology> {
        Ok(self.topology.clone())
    }
}
