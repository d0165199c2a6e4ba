//! Isolation hysteresis
//!
//! Tracks, per container, whether a dedicated container without NUMA binding
//! may currently hold isolated cores. Lock-in requires the isolation trigger
//! to hold for several consecutive periods; lock-out keeps a released
//! container from being isolated again for a cooling-off period.

use super::IsolationConfiguration;
use crate::state::{AllocationInfo, ContainerKey, ExclusionSet, IsolatedQuantities, PodEntries};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::debug;

/// Isolation state of one container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IsolationState {
    #[default]
    NotEligible,
    /// Trigger holds but lock-in has not completed
    Pending { qualified_periods: u32 },
    Isolated,
    /// Recently released; not eligible until the lock-out period elapses
    LockedOut,
}

impl IsolationState {
    pub fn is_isolated(&self) -> bool {
        matches!(self, IsolationState::Isolated)
    }
}

/// A state change observed during one `advance`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationTransition {
    pub key: ContainerKey,
    pub from: IsolationState,
    pub to: IsolationState,
}

/// Result of one control period
#[derive(Debug, Clone, Default)]
pub struct IsolationReport {
    /// State of every tracked container after this period
    pub states: BTreeMap<ContainerKey, IsolationState>,
    pub transitions: Vec<IsolationTransition>,
}

impl IsolationReport {
    /// Containers isolated after this period
    pub fn isolated(&self) -> impl Iterator<Item = &ContainerKey> {
        self.states
            .iter()
            .filter(|(_, state)| state.is_isolated())
            .map(|(key, _)| key)
    }
}

#[derive(Debug, Clone, Default)]
struct ContainerIsolation {
    state: IsolationState,
    /// When the container last left `Isolated`
    released_at: Option<Instant>,
}

impl ContainerIsolation {
    fn release(&mut self, now: Instant, to: IsolationState) {
        self.state = to;
        self.released_at = Some(now);
    }

    fn lock_out_elapsed(&self, config: &IsolationConfiguration, now: Instant) -> bool {
        match self.released_at {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= config.lock_out_period(),
        }
    }
}

/// Per-container isolation state machine.
///
/// `advance` must be called exactly once per control period, under the same
/// serialization as mutations of the allocation table.
#[derive(Debug, Clone, Default)]
pub struct IsolationController {
    containers: BTreeMap<ContainerKey, ContainerIsolation>,
}

/// Isolated cores charged against each pool during one period
struct PoolBudget<'a> {
    config: &'a IsolationConfiguration,
    pod_entries: &'a PodEntries,
    charged: BTreeMap<String, usize>,
}

impl<'a> PoolBudget<'a> {
    fn new(config: &'a IsolationConfiguration, pod_entries: &'a PodEntries) -> Self {
        Self {
            config,
            pod_entries,
            charged: BTreeMap::new(),
        }
    }

    /// Size of the pool a container is isolated from; containers whose owner
    /// pool has no entry are measured against the fallback pool.
    fn pool_size(&self, pool_name: &str) -> usize {
        match self.pod_entries.pool_cpuset(pool_name) {
            Some(cpuset) => cpuset.size(),
            None => self.pod_entries.fallback_pool_cpuset().size(),
        }
    }

    fn fits(&self, pool_name: &str, quantity: usize) -> bool {
        let pool_size = self.pool_size(pool_name);
        let limit = (self.config.max_ratio_for_pool(pool_name) as f64 * pool_size as f64).floor() as usize;
        let charged = self.charged.get(pool_name).copied().unwrap_or(0);
        charged + quantity <= limit
    }

    fn charge(&mut self, pool_name: &str, quantity: usize) {
        *self.charged.entry(pool_name.to_string()).or_insert(0) += quantity;
    }
}

fn lookup_quantity(quantities: &IsolatedQuantities, key: &ContainerKey) -> Option<usize> {
    quantities
        .get(&key.pod_uid)?
        .get(&key.container_name)
        .copied()
}

impl IsolationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a container; untracked containers are `NotEligible`
    pub fn state(&self, key: &ContainerKey) -> IsolationState {
        self.containers
            .get(key)
            .map(|c| c.state)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Advance every container by one control period.
    ///
    /// Containers missing from the table are forgotten; containers in
    /// `excluded` keep their state for this period. Already-isolated
    /// containers are charged against their pool's budget before any
    /// pending container is promoted.
    pub fn advance(
        &mut self,
        config: &IsolationConfiguration,
        pod_entries: &PodEntries,
        quantities: &IsolatedQuantities,
        excluded: &ExclusionSet,
        now: Instant,
    ) -> IsolationReport {
        let live = pod_entries.container_keys();
        self.containers.retain(|key, _| live.contains(key));

        let records: Vec<&AllocationInfo> = pod_entries.containers().collect();
        let previous: BTreeMap<ContainerKey, IsolationState> = records
            .iter()
            .map(|info| {
                let key = info.key();
                let state = self.state(&key);
                (key, state)
            })
            .collect();

        let mut budget = PoolBudget::new(config, pod_entries);

        // keep or release containers that are already isolated
        for info in &records {
            let key = info.key();
            let pool = info.owner_pool_name.as_str();
            let quantity = lookup_quantity(quantities, &key);
            let entry = self.containers.entry(key.clone()).or_default();
            if !entry.state.is_isolated() {
                continue;
            }

            if excluded.contains(&key) {
                budget.charge(pool, quantity.unwrap_or_else(|| info.allocation_result.size()));
                continue;
            }

            if config.is_pool_disabled(pool) {
                entry.release(now, IsolationState::NotEligible);
                continue;
            }

            match quantity {
                Some(q) if config.crosses_threshold(q, budget.pool_size(pool)) && budget.fits(pool, q) => {
                    budget.charge(pool, q);
                }
                _ => entry.release(now, IsolationState::LockedOut),
            }
        }

        for info in &records {
            let key = info.key();
            if excluded.contains(&key) {
                continue;
            }

            let pool = info.owner_pool_name.as_str();
            let quantity = lookup_quantity(quantities, &key);
            let entry = self.containers.entry(key).or_default();

            match entry.state {
                IsolationState::Isolated => {}
                IsolationState::LockedOut => {
                    // released_at is kept, so a disabled pool still honours the lock-out
                    if config.is_pool_disabled(pool) || entry.lock_out_elapsed(config, now) {
                        entry.state = IsolationState::NotEligible;
                    }
                }
                IsolationState::NotEligible | IsolationState::Pending { .. } => {
                    let qualified = !config.is_pool_disabled(pool)
                        && quantity.is_some_and(|q| config.crosses_threshold(q, budget.pool_size(pool)));
                    let Some(q) = quantity.filter(|_| qualified) else {
                        entry.state = IsolationState::NotEligible;
                        continue;
                    };

                    let qualified_periods = match entry.state {
                        IsolationState::Pending { qualified_periods } => qualified_periods + 1,
                        _ => 1,
                    };

                    if qualified_periods >= config.isolation_lock_in_threshold
                        && entry.lock_out_elapsed(config, now)
                        && budget.fits(pool, q)
                    {
                        budget.charge(pool, q);
                        entry.state = IsolationState::Isolated;
                    } else {
                        entry.state = IsolationState::Pending { qualified_periods };
                    }
                }
            }
        }

        let mut report = IsolationReport::default();
        for (key, entry) in &self.containers {
            let from = previous.get(key).copied().unwrap_or_default();
            if from != entry.state {
                debug!(container = %key, ?from, to = ?entry.state, "Isolation state changed");
                report.transitions.push(IsolationTransition {
                    key: key.clone(),
                    from,
                    to: entry.state,
                });
            }
            report.states.insert(key.clone(), entry.state);
        }
        report
    }

    /// Record the current verdicts in the allocation table's `isolated` flags
    pub fn write_back(&self, pod_entries: &mut PodEntries) {
        for (_, entries) in pod_entries.iter_mut() {
            if entries.is_pool_entry() {
                continue;
            }
            for (_, info) in entries.iter_mut() {
                info.isolated = self.state(&info.key()).is_isolated();
            }
        }
    }
}
