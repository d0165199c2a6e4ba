//! Allocation records and the node-local allocation table
//!
//! The table maps pod UID -> container name -> `AllocationInfo`. Pools are
//! stored in the same table as pseudo pods keyed by pool name, holding a
//! single record with an empty container name.

use super::pool::{EMPTY_OWNER_POOL_NAME, POOL_NAME_RECLAIM};
use crate::machine::{CpuSet, CpuTopology, NumaAssignments};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

/// Container name used by pool pseudo-entries
pub const FAKED_CONTAINER_NAME: &str = "";

/// QoS level of a container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QosLevel {
    #[default]
    SharedCores,
    DedicatedCores,
    ReclaimedCores,
    SystemCores,
}

/// Identity of a container in the allocation table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerKey {
    pub pod_uid: String,
    pub container_name: String,
}

impl ContainerKey {
    pub fn new(pod_uid: impl Into<String>, container_name: impl Into<String>) -> Self {
        Self {
            pod_uid: pod_uid.into(),
            container_name: container_name.into(),
        }
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pod_uid, self.container_name)
    }
}

/// One container's CPU assignment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationInfo {
    pub pod_uid: String,
    #[serde(default)]
    pub pod_namespace: String,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub container_name: String,

    #[serde(default)]
    pub owner_pool_name: String,

    /// Current assignment
    #[serde(default)]
    pub allocation_result: CpuSet,
    /// Assignment before any in-flight adjustment
    #[serde(default)]
    pub original_allocation_result: CpuSet,
    /// `allocation_result` partitioned by NUMA node
    #[serde(default)]
    pub topology_aware_assignments: NumaAssignments,
    /// `original_allocation_result` partitioned by NUMA node
    #[serde(default)]
    pub original_topology_aware_assignments: NumaAssignments,

    #[serde(default)]
    pub qos_level: QosLevel,
    #[serde(default)]
    pub numa_binding: bool,
    /// Requested cores; may be fractional
    #[serde(default)]
    pub request_quantity: f64,

    /// Whether the container is currently granted isolated cores
    #[serde(default)]
    pub isolated: bool,
}

impl AllocationInfo {
    /// Build the pseudo-entry describing a pool
    pub fn pool_entry(pool_name: &str, cpuset: CpuSet, topology: &CpuTopology) -> Self {
        AllocationInfo {
            pod_uid: pool_name.to_string(),
            owner_pool_name: pool_name.to_string(),
            allocation_result: cpuset.clone(),
            original_allocation_result: cpuset,
            ..Default::default()
        }
        .with_topology_assignments(topology)
    }

    /// Re-derive both topology-aware maps from the global assignments
    pub fn with_topology_assignments(mut self, topology: &CpuTopology) -> Self {
        self.topology_aware_assignments = topology.numa_aware_assignments(&self.allocation_result);
        self.original_topology_aware_assignments =
            topology.numa_aware_assignments(&self.original_allocation_result);
        self
    }

    pub fn key(&self) -> ContainerKey {
        ContainerKey::new(&self.pod_uid, &self.container_name)
    }

    /// Pool pseudo-entries carry no container name
    pub fn is_pool_entry(&self) -> bool {
        self.container_name == FAKED_CONTAINER_NAME
    }

    /// Owner pool, `None` when the record belongs to no pool
    pub fn owner_pool(&self) -> Option<&str> {
        (self.owner_pool_name != EMPTY_OWNER_POOL_NAME).then_some(self.owner_pool_name.as_str())
    }

    pub fn is_shared(&self) -> bool {
        self.qos_level == QosLevel::SharedCores
    }

    pub fn is_dedicated(&self) -> bool {
        self.qos_level == QosLevel::DedicatedCores
    }

    pub fn is_reclaimed(&self) -> bool {
        self.qos_level == QosLevel::ReclaimedCores
    }

    /// Dedicated containers pinned to NUMA nodes
    pub fn is_numa_binding(&self) -> bool {
        self.is_dedicated() && self.numa_binding
    }

    /// CPUs on `numa_node` in the current assignment
    pub fn cpus_on_numa(&self, numa_node: usize) -> CpuSet {
        self.topology_aware_assignments
            .get(&numa_node)
            .cloned()
            .unwrap_or_default()
    }

    /// CPUs on `numa_node` in the original assignment
    pub fn original_cpus_on_numa(&self, numa_node: usize) -> CpuSet {
        self.original_topology_aware_assignments
            .get(&numa_node)
            .cloned()
            .unwrap_or_default()
    }
}

/// Container name -> allocation record, for one pod (or one pool)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerEntries(BTreeMap<String, AllocationInfo>);

impl ContainerEntries {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when every record is a pool pseudo-entry rather than a container
    pub fn is_pool_entry(&self) -> bool {
        !self.0.is_empty() && self.0.keys().all(|name| name == FAKED_CONTAINER_NAME)
    }

    pub fn get(&self, container_name: &str) -> Option<&AllocationInfo> {
        self.0.get(container_name)
    }

    pub fn get_mut(&mut self, container_name: &str) -> Option<&mut AllocationInfo> {
        self.0.get_mut(container_name)
    }

    pub fn insert(&mut self, container_name: impl Into<String>, info: AllocationInfo) {
        self.0.insert(container_name.into(), info);
    }

    pub fn remove(&mut self, container_name: &str) -> Option<AllocationInfo> {
        self.0.remove(container_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AllocationInfo)> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut AllocationInfo)> {
        self.0.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The node-local allocation table: pod UID -> container entries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PodEntries(BTreeMap<String, ContainerEntries>);

impl PodEntries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pod_uid: &str) -> Option<&ContainerEntries> {
        self.0.get(pod_uid)
    }

    pub fn get_allocation_info(&self, pod_uid: &str, container_name: &str) -> Option<&AllocationInfo> {
        self.0.get(pod_uid)?.get(container_name)
    }

    pub fn get_allocation_info_mut(
        &mut self,
        pod_uid: &str,
        container_name: &str,
    ) -> Option<&mut AllocationInfo> {
        self.0.get_mut(pod_uid)?.get_mut(container_name)
    }

    /// Insert or replace the record for `pod_uid`/`container_name`
    pub fn set_allocation_info(
        &mut self,
        pod_uid: impl Into<String>,
        container_name: impl Into<String>,
        info: AllocationInfo,
    ) {
        self.0
            .entry(pod_uid.into())
            .or_default()
            .insert(container_name, info);
    }

    /// Remove one record, dropping the pod once it has no containers left
    pub fn remove_allocation_info(&mut self, pod_uid: &str, container_name: &str) -> Option<AllocationInfo> {
        let entries = self.0.get_mut(pod_uid)?;
        let removed = entries.remove(container_name);
        if entries.is_empty() {
            self.0.remove(pod_uid);
        }
        removed
    }

    /// Add a pool pseudo-entry keyed by the pool name
    pub fn set_pool(&mut self, pool_name: &str, cpuset: CpuSet, topology: &CpuTopology) {
        let info = AllocationInfo::pool_entry(pool_name, cpuset, topology);
        self.set_allocation_info(pool_name, FAKED_CONTAINER_NAME, info);
    }

    /// CPU set of a pool, `None` if the table holds no such pool
    pub fn pool_cpuset(&self, pool_name: &str) -> Option<&CpuSet> {
        let entries = self.0.get(pool_name)?;
        if !entries.is_pool_entry() {
            return None;
        }
        entries
            .get(FAKED_CONTAINER_NAME)
            .map(|info| &info.allocation_result)
    }

    /// Names of all pools in the table
    pub fn pool_names(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|(_, entries)| entries.is_pool_entry())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Union of every pool's CPUs except the excluded pools
    pub fn filtered_pools_cpuset(&self, exclude: &[&str]) -> CpuSet {
        self.0
            .iter()
            .filter(|(name, entries)| entries.is_pool_entry() && !exclude.contains(&name.as_str()))
            .filter_map(|(_, entries)| entries.get(FAKED_CONTAINER_NAME))
            .fold(CpuSet::new(), |acc, info| acc.union(&info.allocation_result))
    }

    /// CPUs of the virtual fallback pool: every non-reclaimed pool
    pub fn fallback_pool_cpuset(&self) -> CpuSet {
        self.filtered_pools_cpuset(&[POOL_NAME_RECLAIM])
    }

    /// Keys of all real container records
    pub fn container_keys(&self) -> BTreeSet<ContainerKey> {
        self.containers().map(|info| info.key()).collect()
    }

    /// All real container records, skipping pool entries
    pub fn containers(&self) -> impl Iterator<Item = &AllocationInfo> {
        self.0
            .values()
            .filter(|entries| !entries.is_pool_entry())
            .flat_map(|entries| entries.iter())
            .filter(|(name, _)| name.as_str() != FAKED_CONTAINER_NAME)
            .map(|(_, info)| info)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ContainerEntries)> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut ContainerEntries)> {
        self.0.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Load an allocation table snapshot written as JSON by the CPU plugin.
///
/// Topology-aware assignments are re-derived from the global CPU sets so the
/// loaded records always satisfy the partition invariant.
pub async fn load_pod_entries(path: &Path, topology: &CpuTopology) -> Result<PodEntries> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read allocation state {}", path.display()))?;
    let mut entries: PodEntries = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse allocation state {}", path.display()))?;

    for (_, containers) in entries.iter_mut() {
        for (_, info) in containers.iter_mut() {
            *info = std::mem::take(info).with_topology_assignments(topology);
        }
    }

    Ok(entries)
}
