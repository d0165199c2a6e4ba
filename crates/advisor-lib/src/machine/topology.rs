//! CPU topology index
//!
//! Maps every logical CPU to its NUMA node and every NUMA node to the CPUs
//! physically on it. A topology is built once per machine configuration and
//! then only read.

use super::CpuSet;
use crate::error::AdvisorError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-NUMA-node breakdown of a CPU set: NUMA id -> CPUs on that node
pub type NumaAssignments = BTreeMap<usize, CpuSet>;

/// Serialized form of a topology: NUMA id -> cpu-list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumaLayout {
    pub numa_nodes: BTreeMap<usize, CpuSet>,
}

/// Immutable CPU topology of a machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "NumaLayout", into = "NumaLayout")]
pub struct CpuTopology {
    cpu_to_numa: BTreeMap<usize, usize>,
    numa_to_cpus: BTreeMap<usize, CpuSet>,
}

impl CpuTopology {
    /// Build a topology from `(cpu, numa_node)` pairs
    pub fn new(cpus: impl IntoIterator<Item = (usize, usize)>) -> Self {
        let cpu_to_numa: BTreeMap<usize, usize> = cpus.into_iter().collect();

        let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (&cpu, &numa) in &cpu_to_numa {
            members.entry(numa).or_default().push(cpu);
        }

        let numa_to_cpus = members
            .into_iter()
            .map(|(numa, cpus)| (numa, cpus.into_iter().collect()))
            .collect();

        Self {
            cpu_to_numa,
            numa_to_cpus,
        }
    }

    /// Build a topology with `numa_nodes` nodes of `cpus_per_node` consecutive CPUs each
    pub fn uniform(numa_nodes: usize, cpus_per_node: usize) -> Self {
        Self::new((0..numa_nodes * cpus_per_node).map(|cpu| (cpu, cpu / cpus_per_node)))
    }

    /// NUMA node ids in ascending order
    pub fn numa_nodes(&self) -> Vec<usize> {
        self.numa_to_cpus.keys().copied().collect()
    }

    pub fn num_numa_nodes(&self) -> usize {
        self.numa_to_cpus.len()
    }

    pub fn num_cpus(&self) -> usize {
        self.cpu_to_numa.len()
    }

    /// All CPUs of a NUMA node; empty for an unknown node
    pub fn cpus_in_numa_node(&self, numa_node: usize) -> CpuSet {
        self.numa_to_cpus
            .get(&numa_node)
            .cloned()
            .unwrap_or_default()
    }

    pub fn numa_node_of(&self, cpu: usize) -> Option<usize> {
        self.cpu_to_numa.get(&cpu).copied()
    }

    pub fn all_cpus(&self) -> CpuSet {
        self.cpu_to_numa.keys().copied().collect()
    }

    /// Partition `cpuset` by NUMA node.
    ///
    /// Nodes that share no CPU with `cpuset` are omitted, and CPUs unknown to
    /// the topology are dropped.
    pub fn numa_aware_assignments(&self, cpuset: &CpuSet) -> NumaAssignments {
        self.numa_to_cpus
            .iter()
            .filter_map(|(&numa, node_cpus)| {
                let cpus = cpuset.intersection(node_cpus);
                (!cpus.is_empty()).then_some((numa, cpus))
            })
            .collect()
    }
}

impl TryFrom<NumaLayout> for CpuTopology {
    type Error = AdvisorError;

    fn try_from(layout: NumaLayout) -> Result<Self, Self::Error> {
        let mut pairs = BTreeMap::new();
        for (numa, cpus) in &layout.numa_nodes {
            for cpu in cpus.iter() {
                if let Some(previous) = pairs.insert(cpu, *numa) {
                    return Err(AdvisorError::Topology(format!(
                        "cpu {} listed in numa nodes {} and {}",
                        cpu, previous, numa
                    )));
                }
            }
        }

        let mut topology = CpuTopology::new(pairs);
        // keep CPU-less nodes (e.g. memory-only NUMA nodes) addressable
        for numa in layout.numa_nodes.keys() {
            topology.numa_to_cpus.entry(*numa).or_default();
        }
        Ok(topology)
    }
}

impl From<CpuTopology> for NumaLayout {
    fn from(topology: CpuTopology) -> Self {
        NumaLayout {
            numa_nodes: topology.numa_to_cpus,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_topology() {
        let topology = CpuTopology::uniform(2, 4);

        assert_eq!(topology.numa_nodes(), vec![0, 1]);
        assert_eq!(topology.num_cpus(), 8);
        assert_eq!(topology.cpus_in_numa_node(1).to_string(), "4-7");
        assert_eq!(topology.numa_node_of(5), Some(1));
        assert_eq!(topology.numa_node_of(8), None);
        assert!(topology.cpus_in_numa_node(7).is_empty());
    }

    #[test]
    fn test_numa_aware_assignments_omits_empty_nodes() {
        let topology = CpuTopology::uniform(3, 2);
        let cpuset = CpuSet::parse("0,4-5,9").unwrap();

        let assignments = topology.numa_aware_assignments(&cpuset);

        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments[&0].to_string(), "0");
        assert_eq!(assignments[&2].to_string(), "4-5");
        assert!(!assignments.contains_key(&1));
    }

    #[test]
    fn test_interleaved_topology() {
        // even CPUs on node 0, odd CPUs on node 1
        let topology = CpuTopology::new((0..8).map(|cpu| (cpu, cpu % 2)));

        assert_eq!(topology.cpus_in_numa_node(0).to_string(), "0,2,4,6");
        assert_eq!(topology.cpus_in_numa_node(1).to_string(), "1,3,5,7");
    }

    #[test]
    fn test_layout_roundtrip_rejects_duplicates() {
        let json = r#"{"numa_nodes":{"0":"0-3","1":"4-7"}}"#;
        let topology: CpuTopology = serde_json::from_str(json).unwrap();
        assert_eq!(topology, CpuTopology::uniform(2, 4));

        let overlapping = r#"{"numa_nodes":{"0":"0-3","1":"3-7"}}"#;
        assert!(serde_json::from_str::<CpuTopology>(overlapping).is_err());
    }

    #[test]
    fn test_layout_keeps_cpuless_nodes() {
        let json = r#"{"numa_nodes":{"0":"0-1","1":""}}"#;
        let topology: CpuTopology = serde_json::from_str(json).unwrap();
        assert_eq!(topology.numa_nodes(), vec![0, 1]);
        assert!(topology.cpus_in_numa_node(1).is_empty());
    }
}
