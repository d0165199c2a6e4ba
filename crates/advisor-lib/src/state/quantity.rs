//! Pool quantity aggregation
//!
//! Derives, from the allocation table, how many cores each isolation
//! candidate should receive and how many cores each shared pool is claimed
//! for. Both queries skip pool entries and any record in the exclusion set.

use super::allocation::{AllocationInfo, ContainerKey, PodEntries};
use super::pool::POOL_NAME_DEDICATED;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// pod UID -> container name -> isolated cores
pub type IsolatedQuantities = BTreeMap<String, BTreeMap<String, usize>>;

/// pool name -> claimed cores
pub type SharedQuantities = BTreeMap<String, usize>;

/// Records skipped by the quantity queries, keyed by pod UID + container name
pub type ExclusionSet = BTreeSet<ContainerKey>;

/// Sizing strategy: maps a record to the number of cores it requests
pub trait RequestedCores: Send + Sync {
    fn requested_cores(&self, info: &AllocationInfo) -> usize;
}

impl<F> RequestedCores for F
where
    F: Fn(&AllocationInfo) -> usize + Send + Sync,
{
    fn requested_cores(&self, info: &AllocationInfo) -> usize {
        self(info)
    }
}

/// Sizes a record by its request quantity, rounded up to whole cores
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestQuantitySizer;

impl RequestedCores for RequestQuantitySizer {
    fn requested_cores(&self, info: &AllocationInfo) -> usize {
        if info.request_quantity <= 0.0 {
            return 0;
        }
        info.request_quantity.ceil() as usize
    }
}

/// Build an exclusion set from records
pub fn exclusion_set<'a>(records: impl IntoIterator<Item = &'a AllocationInfo>) -> ExclusionSet {
    records.into_iter().map(AllocationInfo::key).collect()
}

/// Isolated quantity per pod/container for dedicated containers without NUMA binding.
///
/// Containers already moved to the `dedicated` pool are accounted by their
/// actual grant; containers still parked in another pool by their request.
/// A candidate resolving to zero cores points at an upstream sizing bug: it
/// is logged and skipped.
pub fn isolated_quantity_map(
    pod_entries: &PodEntries,
    excluded: &ExclusionSet,
    sizer: &dyn RequestedCores,
) -> IsolatedQuantities {
    let mut ret = IsolatedQuantities::new();

    for (pod_uid, entries) in pod_entries.iter() {
        if entries.is_pool_entry() {
            continue;
        }

        for (container_name, info) in entries.iter() {
            if info.is_pool_entry() || info.is_numa_binding() || !info.is_dedicated() {
                continue;
            }
            if excluded.contains(&info.key()) {
                continue;
            }

            let quantity = if info.owner_pool_name == POOL_NAME_DEDICATED {
                info.allocation_result.size()
            } else {
                sizer.requested_cores(info)
            };

            if quantity == 0 {
                warn!(
                    event = "zero_isolation_quantity",
                    pod_namespace = %info.pod_namespace,
                    pod_name = %info.pod_name,
                    container = %info.container_name,
                    "Isolation candidate got zero quantity, skipping"
                );
                continue;
            }

            ret.entry(pod_uid.clone())
                .or_default()
                .insert(container_name.clone(), quantity);
        }
    }

    ret
}

/// Requested cores per shared pool, over shared containers with an owner pool
pub fn shared_quantity_map(
    pod_entries: &PodEntries,
    excluded: &ExclusionSet,
    sizer: &dyn RequestedCores,
) -> SharedQuantities {
    let mut ret = SharedQuantities::new();

    for (_, entries) in pod_entries.iter() {
        if entries.is_pool_entry() {
            continue;
        }

        for (_, info) in entries.iter() {
            if info.is_pool_entry() || !info.is_shared() {
                continue;
            }
            if excluded.contains(&info.key()) {
                continue;
            }

            if let Some(pool_name) = info.owner_pool() {
                *ret.entry(pool_name.to_string()).or_insert(0) += sizer.requested_cores(info);
            }
        }
    }

    ret
}
