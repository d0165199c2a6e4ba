//! Per-NUMA-node allocation state
//!
//! Machine state is always rebuilt wholesale from the allocation table; it
//! is never patched incrementally.

use super::allocation::{AllocationInfo, PodEntries};
use crate::error::{AdvisorError, Result};
use crate::machine::{CpuSet, CpuTopology};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Allocation state of a single NUMA node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumaNodeState {
    /// CPUs not claimed by NUMA-bound dedicated containers
    pub default_cpuset: CpuSet,
    /// CPUs claimed by NUMA-bound dedicated containers
    pub allocated_cpuset: CpuSet,
    /// Node-scoped copies of the records with CPUs on this node
    pub pod_entries: PodEntries,
}

impl NumaNodeState {
    pub fn set_allocation_info(&mut self, pod_uid: &str, container_name: &str, info: AllocationInfo) {
        self.pod_entries
            .set_allocation_info(pod_uid, container_name, info);
    }

    pub fn get_allocation_info(&self, pod_uid: &str, container_name: &str) -> Option<&AllocationInfo> {
        self.pod_entries.get_allocation_info(pod_uid, container_name)
    }

    /// Default CPUs minus the reserved CPUs
    pub fn available_cpuset(&self, reserved: &CpuSet) -> CpuSet {
        self.default_cpuset.difference(reserved)
    }
}

/// NUMA node id -> node state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineState(BTreeMap<usize, NumaNodeState>);

impl MachineState {
    pub fn node(&self, numa_node: usize) -> Option<&NumaNodeState> {
        self.0.get(&numa_node)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&usize, &NumaNodeState)> {
        self.0.iter()
    }

    pub fn numa_nodes(&self) -> Vec<usize> {
        self.0.keys().copied().collect()
    }

    /// Allocated CPUs across all nodes
    pub fn allocated_cpuset(&self) -> CpuSet {
        CpuSet::union_all(self.0.values().map(|state| &state.allocated_cpuset))
    }

    /// Default CPUs across all nodes
    pub fn default_cpuset(&self) -> CpuSet {
        CpuSet::union_all(self.0.values().map(|state| &state.default_cpuset))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Rebuild the per-NUMA machine state from the allocation table.
///
/// Allocated CPUs are taken from the *original* assignment of NUMA-bound
/// dedicated containers, so the allocated/default split reflects committed
/// NUMA reservations even while an adjustment is rewriting the current
/// assignment.
pub fn generate_machine_state_from_pod_entries(
    topology: Option<&CpuTopology>,
    pod_entries: &PodEntries,
) -> Result<MachineState> {
    let topology = topology.ok_or(AdvisorError::MissingTopology)?;

    let mut machine_state = BTreeMap::new();
    for numa_node in topology.numa_nodes() {
        let numa_node_all_cpus = topology.cpus_in_numa_node(numa_node);
        let mut numa_node_state = NumaNodeState::default();
        let mut allocated_cpus = CpuSet::new();

        for (pod_uid, container_entries) in pod_entries.iter() {
            if container_entries.is_pool_entry() {
                continue;
            }

            for (container_name, info) in container_entries.iter() {
                if info.is_pool_entry() {
                    continue;
                }

                // nothing assigned on this node
                if info.original_cpus_on_numa(numa_node).is_empty()
                    && info.cpus_on_numa(numa_node).is_empty()
                {
                    continue;
                }

                if info.is_numa_binding() {
                    allocated_cpus = allocated_cpus.union(&info.original_cpus_on_numa(numa_node));
                }

                let mut node_info = info.clone();
                node_info.allocation_result = info.allocation_result.intersection(&numa_node_all_cpus);
                node_info.original_allocation_result = info
                    .original_allocation_result
                    .intersection(&numa_node_all_cpus);
                let node_info = node_info.with_topology_assignments(topology);

                numa_node_state.set_allocation_info(pod_uid, container_name, node_info);
            }
        }

        // records carrying stale per-node maps must not leak foreign CPUs into this node
        let allocated_cpus = allocated_cpus.intersection(&numa_node_all_cpus);
        numa_node_state.default_cpuset = numa_node_all_cpus.difference(&allocated_cpus);
        numa_node_state.allocated_cpuset = allocated_cpus;

        debug!(
            numa_node,
            allocated = %numa_node_state.allocated_cpuset,
            default = %numa_node_state.default_cpuset,
            "Rebuilt NUMA node state"
        );
        machine_state.insert(numa_node, numa_node_state);
    }

    Ok(MachineState(machine_state))
}
