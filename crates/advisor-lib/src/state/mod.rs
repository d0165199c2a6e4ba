//! CPU allocation state
//!
//! This module provides:
//! - Allocation records and the pod -> container allocation table
//! - The per-NUMA machine state and its reconciler
//! - Isolated/shared pool quantity aggregation

mod allocation;
mod machine_state;
pub mod pool;
mod quantity;


pub use allocation::{
    load_pod_entries, AllocationInfo, ContainerEntries, ContainerKey, PodEntries, QosLevel,
    FAKED_CONTAINER_NAME,
};
pub use machine_state::{generate_machine_state_from_pod_entries, MachineState, NumaNodeState};
pub use quantity::{
    exclusion_set, isolated_quantity_map, shared_quantity_map, ExclusionSet, IsolatedQuantities,
    RequestQuantitySizer, RequestedCores, SharedQuantities,
};
