//! Advisor control loop
//!
//! Runs one control period at a fixed interval: rebuilds the machine state,
//! aggregates pool quantities, advances isolation hysteresis and recomputes
//! headroom. Results of the last successful period are published as an
//! `AdvisorSnapshot`; a failing period leaves the previous snapshot in place.

use crate::error::{AdvisorError, Result};
use crate::headroom::{
    ControlKnob, ControlKnobName, ControlKnobValue, HeadroomPolicy, PolicyCanonical,
};
use crate::health::{ControlStep, HealthRegistry};
use crate::isolation::{IsolationConfiguration, IsolationController, IsolationState};
use crate::machine::{CpuSet, CpuTopology};
use crate::observability::AdvisorLogger;
use crate::state::{
    generate_machine_state_from_pod_entries, isolated_quantity_map, pool::POOL_NAME_RESERVE,
    shared_quantity_map, ContainerKey, ExclusionSet, IsolatedQuantities, MachineState, PodEntries,
    RequestQuantitySizer, RequestedCores, SharedQuantities,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Default control period
pub const DEFAULT_CONTROL_PERIOD: Duration = Duration::from_secs(5);

/// Configuration for the advisor loop
#[derive(Debug, Clone)]
pub struct AdvisorLoopConfig {
    /// Interval between control periods
    pub control_period: Duration,
    /// CPUs never offered to workloads
    pub reserved_cpus: CpuSet,
}

impl Default for AdvisorLoopConfig {
    fn default() -> Self {
        Self {
            control_period: DEFAULT_CONTROL_PERIOD,
            reserved_cpus: CpuSet::new(),
        }
    }
}

/// Results of one successful control period
#[derive(Debug, Clone)]
pub struct AdvisorSnapshot {
    pub machine_state: MachineState,
    pub isolated_quantities: IsolatedQuantities,
    pub shared_quantities: SharedQuantities,
    pub isolation_states: BTreeMap<ContainerKey, IsolationState>,
    /// Spare allocatable cores
    pub headroom: f64,
    /// Allocatable cores the headroom was computed against
    pub total: usize,
    pub generated_at: i64,
}

/// Node-local CPU advisor
pub struct CpuAdvisor {
    topology: Option<Arc<CpuTopology>>,
    pod_entries: Arc<RwLock<PodEntries>>,
    isolation_config: Arc<RwLock<IsolationConfiguration>>,
    controller: Mutex<IsolationController>,
    headroom_policy: Mutex<Box<dyn HeadroomPolicy>>,
    sizer: Arc<dyn RequestedCores>,
    control_knob: RwLock<Option<ControlKnob>>,
    in_flight: RwLock<ExclusionSet>,
    snapshot: RwLock<Option<Arc<AdvisorSnapshot>>>,
    health: HealthRegistry,
    logger: AdvisorLogger,
    config: AdvisorLoopConfig,
}

impl CpuAdvisor {
    /// Shared handle to the allocation table
    pub fn pod_entries(&self) -> Arc<RwLock<PodEntries>> {
        self.pod_entries.clone()
    }

    /// Shared handle to the isolation configuration
    pub fn isolation_config(&self) -> Arc<RwLock<IsolationConfiguration>> {
        self.isolation_config.clone()
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Replace the whole allocation table.
    ///
    /// Current isolation verdicts are written into the new table, so its
    /// `isolated` flags stay valid between control periods.
    pub async fn replace_pod_entries(&self, mut entries: PodEntries) {
        let controller = self.controller.lock().await;
        controller.write_back(&mut entries);
        *self.pod_entries.write().await = entries;
    }

    /// Set the control knob computed by an external sizing component. Without
    /// one, the shared cpuset requirement is the sum of shared pool quantities.
    pub async fn set_control_knob(&self, knob: Option<ControlKnob>) {
        *self.control_knob.write().await = knob;
    }

    /// Mark a record as being moved by the adjustment loop
    pub async fn mark_in_flight(&self, key: ContainerKey) {
        self.in_flight.write().await.insert(key);
    }

    pub async fn clear_in_flight(&self, key: &ContainerKey) {
        self.in_flight.write().await.remove(key);
    }

    /// Snapshot of the last successful control period
    pub async fn latest_snapshot(&self) -> Option<Arc<AdvisorSnapshot>> {
        self.snapshot.read().await.clone()
    }

    /// Current isolation state of a container
    pub async fn isolation_state(&self, key: &ContainerKey) -> IsolationState {
        self.controller.lock().await.state(key)
    }

    /// Allocatable cores: every CPU outside the reserved set and reserve pool
    fn allocatable_cpus(&self, topology: &CpuTopology, entries: &PodEntries) -> usize {
        let mut reserved = self.config.reserved_cpus.clone();
        if let Some(reserve_pool) = entries.pool_cpuset(POOL_NAME_RESERVE) {
            reserved = reserved.union(reserve_pool);
        }
        topology.all_cpus().difference(&reserved).size()
    }

    /// Run a single control period.
    ///
    /// Hysteresis advances on a staged copy of the controller. The copy, the
    /// `isolated` flags and the snapshot are committed together once every
    /// step has succeeded; a failed period leaves all three untouched.
    pub async fn run_once(&self, now: Instant) -> Result<Arc<AdvisorSnapshot>> {
        // configuration refreshes become visible all at once, between periods
        let isolation_config = self.isolation_config.read().await.clone();
        if let Err(e) = isolation_config.validate() {
            self.fail(ControlStep::Configuration, &e).await;
            return Err(e);
        }

        let excluded = self.in_flight.read().await.clone();
        let mut controller = self.controller.lock().await;

        let entries = self.pod_entries.read().await;
        let machine_state = match generate_machine_state_from_pod_entries(self.topology.as_deref(), &entries) {
            Ok(state) => state,
            Err(e) => {
                drop(entries);
                self.fail(ControlStep::Reconciliation, &e).await;
                return Err(e);
            }
        };

        let isolated_quantities = isolated_quantity_map(&entries, &excluded, self.sizer.as_ref());
        let shared_quantities = shared_quantity_map(&entries, &excluded, self.sizer.as_ref());

        let mut staged = controller.clone();
        let report = staged.advance(&isolation_config, &entries, &isolated_quantities, &excluded, now);
        let total = self
            .topology
            .as_deref()
            .map(|topology| self.allocatable_cpus(topology, &entries))
            .unwrap_or(0);
        drop(entries);

        let knob = match self.control_knob.read().await.clone() {
            Some(knob) => knob,
            None => {
                let required: usize = shared_quantities.values().sum();
                let mut knob = ControlKnob::new();
                knob.insert(
                    ControlKnobName::SharedCpuSetSize,
                    ControlKnobValue {
                        value: required as f64,
                    },
                );
                knob
            }
        };

        let headroom = {
            let mut policy = self.headroom_policy.lock().await;
            policy.set_total(total);
            policy.set_control_knob_value(knob);
            match policy.update().and_then(|_| policy.get_headroom()) {
                Ok(headroom) => headroom,
                Err(e) => {
                    drop(policy);
                    self.fail(ControlStep::Headroom, &e).await;
                    return Err(e);
                }
            }
        };

        *controller = staged;
        controller.write_back(&mut *self.pod_entries.write().await);

        let snapshot = Arc::new(AdvisorSnapshot {
            machine_state,
            isolated_quantities,
            shared_quantities,
            isolation_states: report.states,
            headroom,
            total,
            generated_at: chrono::Utc::now().timestamp(),
        });
        *self.snapshot.write().await = Some(snapshot.clone());
        drop(controller);

        for transition in &report.transitions {
            self.logger.log_isolation_transition(transition);
        }
        self.logger.log_machine_state(&snapshot.machine_state);
        self.logger.log_headroom(headroom, total);
        self.health.record_period_completed(snapshot.generated_at).await;

        Ok(snapshot)
    }

    async fn fail(&self, step: ControlStep, error: &AdvisorError) {
        let error = error.to_string();
        let consecutive_failures = self.health.record_failure(step, error.as_str()).await;
        self.logger.log_cycle_failure(step, &error, consecutive_failures);
    }

    /// Run control periods until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            period_secs = self.config.control_period.as_secs(),
            "Starting advisor control loop"
        );

        let mut ticker = interval(self.config.control_period);
        let mut periods = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    periods += 1;
                    match self.run_once(Instant::now()).await {
                        Ok(snapshot) => debug!(
                            period = periods,
                            headroom = snapshot.headroom,
                            "Control period complete"
                        ),
                        Err(e) => warn!(period = periods, error = %e, "Control period failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down advisor control loop");
                    break;
                }
            }
        }
    }
}

/// Builder for `CpuAdvisor`
pub struct CpuAdvisorBuilder {
    topology: Option<Arc<CpuTopology>>,
    pod_entries: Option<Arc<RwLock<PodEntries>>>,
    isolation_config: Option<Arc<RwLock<IsolationConfiguration>>>,
    headroom_policy: Option<Box<dyn HeadroomPolicy>>,
    sizer: Option<Arc<dyn RequestedCores>>,
    health: Option<HealthRegistry>,
    logger: Option<AdvisorLogger>,
    config: AdvisorLoopConfig,
}

impl CpuAdvisorBuilder {
    pub fn new() -> Self {
        Self {
            topology: None,
            pod_entries: None,
            isolation_config: None,
            headroom_policy: None,
            sizer: None,
            health: None,
            logger: None,
            config: AdvisorLoopConfig::default(),
        }
    }

    /// Set the machine topology. An advisor built without one reports every
    /// control period as failed until restarted with a topology.
    pub fn topology(mut self, topology: Arc<CpuTopology>) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn pod_entries(mut self, pod_entries: Arc<RwLock<PodEntries>>) -> Self {
        self.pod_entries = Some(pod_entries);
        self
    }

    pub fn isolation_config(mut self, config: Arc<RwLock<IsolationConfiguration>>) -> Self {
        self.isolation_config = Some(config);
        self
    }

    /// Set the headroom policy (default: canonical)
    pub fn headroom_policy(mut self, policy: Box<dyn HeadroomPolicy>) -> Self {
        self.headroom_policy = Some(policy);
        self
    }

    /// Set the sizing strategy (default: request quantity rounded up)
    pub fn sizer(mut self, sizer: Arc<dyn RequestedCores>) -> Self {
        self.sizer = Some(sizer);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn logger(mut self, logger: AdvisorLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn control_period(mut self, period: Duration) -> Self {
        self.config.control_period = period;
        self
    }

    pub fn reserved_cpus(mut self, reserved: CpuSet) -> Self {
        self.config.reserved_cpus = reserved;
        self
    }

    pub fn build(self) -> anyhow::Result<CpuAdvisor> {
        if self.config.control_period.is_zero() {
            anyhow::bail!("Control period must be positive");
        }

        Ok(CpuAdvisor {
            topology: self.topology,
            pod_entries: self.pod_entries.unwrap_or_default(),
            isolation_config: self.isolation_config.unwrap_or_default(),
            controller: Mutex::new(IsolationController::new()),
            headroom_policy: Mutex::new(
                self.headroom_policy
                    .unwrap_or_else(|| Box::new(PolicyCanonical::new(0))),
            ),
            sizer: self.sizer.unwrap_or_else(|| Arc::new(RequestQuantitySizer)),
            control_knob: RwLock::new(None),
            in_flight: RwLock::new(ExclusionSet::new()),
            snapshot: RwLock::new(None),
            health: self.health.unwrap_or_default(),
            logger: self.logger.unwrap_or_else(|| AdvisorLogger::new("unknown")),
            config: self.config,
        })
    }
}

impl Default for CpuAdvisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headroom::HeadroomPolicyName;
    use crate::state::pool::{POOL_NAME_DEDICATED, POOL_NAME_RECLAIM, POOL_NAME_SHARE};
    use crate::state::{AllocationInfo, QosLevel};

    fn record(pod_uid: &str, qos_level: QosLevel, pool: &str, request: f64, cpus: &str) -> AllocationInfo {
        let cpuset = CpuSet::parse(cpus).unwrap();
        AllocationInfo {
            pod_uid: pod_uid.to_string(),
            pod_namespace: "default".to_string(),
            pod_name: pod_uid.to_string(),
            container_name: "main".to_string(),
            owner_pool_name: pool.to_string(),
            allocation_result: cpuset.clone(),
            original_allocation_result: cpuset,
            qos_level,
            numa_binding: qos_level == QosLevel::DedicatedCores && pool == POOL_NAME_DEDICATED,
            request_quantity: request,
            ..Default::default()
        }
    }

    /// 2 NUMA x 16 CPUs, reserve = CPU 0
    fn sample_entries(topology: &CpuTopology) -> PodEntries {
        let mut entries = PodEntries::new();
        entries.set_pool(POOL_NAME_RESERVE, CpuSet::parse("0").unwrap(), topology);
        entries.set_pool(POOL_NAME_SHARE, CpuSet::parse("1-11,16-27").unwrap(), topology);
        entries.set_pool(POOL_NAME_RECLAIM, CpuSet::parse("28-31").unwrap(), topology);
        for info in [
            record("pod-bound", QosLevel::DedicatedCores, POOL_NAME_DEDICATED, 4.0, "12-15"),
            record("pod-big", QosLevel::DedicatedCores, POOL_NAME_SHARE, 6.0, "1-11,16-27"),
            record("pod-web", QosLevel::SharedCores, POOL_NAME_SHARE, 3.0, "1-11,16-27"),
            record("pod-api", QosLevel::SharedCores, POOL_NAME_SHARE, 2.5, "1-11,16-27"),
        ] {
            let info = info.with_topology_assignments(topology);
            entries.set_allocation_info(info.pod_uid.clone(), "main", info);
        }
        entries
    }

    fn advisor(config: IsolationConfiguration) -> CpuAdvisor {
        let topology = Arc::new(CpuTopology::uniform(2, 16));
        let entries = sample_entries(&topology);
        CpuAdvisorBuilder::new()
            .topology(topology)
            .pod_entries(Arc::new(RwLock::new(entries)))
            .isolation_config(Arc::new(RwLock::new(config)))
            .build()
            .unwrap()
    }

    struct FailingPolicy;

    impl HeadroomPolicy for FailingPolicy {
        fn name(&self) -> HeadroomPolicyName {
            HeadroomPolicyName::Canonical
        }
        fn set_total(&mut self, _total: usize) {}
        fn set_control_knob_value(&mut self, _knob: ControlKnob) {}
        fn update(&mut self) -> Result<()> {
            Err(AdvisorError::MissingControlKnob("shared_cpuset_size".to_string()))
        }
        fn get_headroom(&self) -> Result<f64> {
            Ok(0.0)
        }
    }

    #[tokio::test]
    async fn test_run_once_publishes_snapshot() {
        let advisor = advisor(IsolationConfiguration::default());

        let snapshot = advisor.run_once(Instant::now()).await.unwrap();

        assert_eq!(snapshot.machine_state.len(), 2);
        assert_eq!(snapshot.machine_state.node(0).unwrap().allocated_cpuset.to_string(), "12-15");
        assert_eq!(snapshot.isolated_quantities["pod-big"]["main"], 6);
        assert_eq!(snapshot.shared_quantities[POOL_NAME_SHARE], 6);
        // 32 CPUs minus reserve CPU 0, minus 6 shared cores
        assert_eq!(snapshot.total, 31);
        assert_eq!(snapshot.headroom, 25.0);

        assert!(advisor.latest_snapshot().await.is_some());
        let health = advisor.health().report().await;
        assert!(health.is_ready());
        assert!(health.is_healthy());
    }

    #[tokio::test]
    async fn test_external_control_knob_wins() {
        let advisor = advisor(IsolationConfiguration::default());
        let mut knob = ControlKnob::new();
        knob.insert(ControlKnobName::SharedCpuSetSize, ControlKnobValue { value: 20.0 });
        advisor.set_control_knob(Some(knob)).await;

        let snapshot = advisor.run_once(Instant::now()).await.unwrap();

        assert_eq!(snapshot.headroom, 11.0);
    }

    #[tokio::test]
    async fn test_isolation_verdict_written_back() {
        let advisor = advisor(isolation_config());
        let start = Instant::now();
        let key = ContainerKey::new("pod-big", "main");

        advisor.run_once(start).await.unwrap();
        assert_eq!(
            advisor.isolation_state(&key).await,
            IsolationState::Pending { qualified_periods: 1 }
        );

        let snapshot = advisor.run_once(start + Duration::from_secs(5)).await.unwrap();
        assert_eq!(snapshot.isolation_states[&key], IsolationState::Isolated);

        let entries = advisor.pod_entries();
        let entries = entries.read().await;
        assert!(entries.get_allocation_info("pod-big", "main").unwrap().isolated);
        assert!(!entries.get_allocation_info("pod-web", "main").unwrap().isolated);
    }

    #[tokio::test]
    async fn test_in_flight_records_are_excluded() {
        let advisor = advisor(IsolationConfiguration::default());
        advisor.mark_in_flight(ContainerKey::new("pod-web", "main")).await;
        advisor.mark_in_flight(ContainerKey::new("pod-big", "main")).await;

        let snapshot = advisor.run_once(Instant::now()).await.unwrap();

        assert!(snapshot.isolated_quantities.is_empty());
        assert_eq!(snapshot.shared_quantities[POOL_NAME_SHARE], 3);

        advisor.clear_in_flight(&ContainerKey::new("pod-web", "main")).await;
        let snapshot = advisor.run_once(Instant::now()).await.unwrap();
        assert_eq!(snapshot.shared_quantities[POOL_NAME_SHARE], 6);
    }

    #[tokio::test]
    async fn test_failed_headroom_keeps_previous_snapshot() {
        let advisor = advisor(IsolationConfiguration::default());
        let first = advisor.run_once(Instant::now()).await.unwrap();

        *advisor.headroom_policy.lock().await = Box::new(FailingPolicy);
        let err = advisor.run_once(Instant::now()).await.unwrap_err();

        assert!(matches!(err, AdvisorError::MissingControlKnob(_)));
        let latest = advisor.latest_snapshot().await.unwrap();
        assert_eq!(latest.generated_at, first.generated_at);
        assert_eq!(latest.headroom, first.headroom);
        let health = advisor.health().report().await;
        assert_eq!(health.failing_steps(), vec![ControlStep::Headroom]);
        assert_eq!(health.completed_periods, 1);
    }

    fn isolation_config() -> IsolationConfiguration {
        IsolationConfiguration {
            isolation_cpu_size: 4,
            isolated_max_ratios: 0.5,
            isolation_lock_in_threshold: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_failed_period_leaves_isolation_untouched() {
        let advisor = advisor(isolation_config());
        let start = Instant::now();
        let key = ContainerKey::new("pod-big", "main");
        let pending = IsolationState::Pending { qualified_periods: 1 };

        advisor.run_once(start).await.unwrap();

        *advisor.headroom_policy.lock().await = Box::new(FailingPolicy);
        advisor.run_once(start + Duration::from_secs(5)).await.unwrap_err();

        assert_eq!(advisor.isolation_state(&key).await, pending);
        assert_eq!(advisor.latest_snapshot().await.unwrap().isolation_states[&key], pending);
        {
            let entries = advisor.pod_entries();
            let entries = entries.read().await;
            assert!(!entries.get_allocation_info("pod-big", "main").unwrap().isolated);
        }

        // the discarded period does not count towards lock-in
        *advisor.headroom_policy.lock().await = Box::new(PolicyCanonical::new(0));
        let snapshot = advisor.run_once(start + Duration::from_secs(10)).await.unwrap();
        assert_eq!(snapshot.isolation_states[&key], IsolationState::Isolated);
        assert_eq!(advisor.isolation_state(&key).await, IsolationState::Isolated);
    }

    #[tokio::test]
    async fn test_replaced_table_keeps_isolation_flags() {
        let advisor = advisor(isolation_config());
        let start = Instant::now();
        advisor.run_once(start).await.unwrap();
        advisor.run_once(start + Duration::from_secs(5)).await.unwrap();

        let topology = CpuTopology::uniform(2, 16);
        advisor.replace_pod_entries(sample_entries(&topology)).await;

        let entries = advisor.pod_entries();
        let entries = entries.read().await;
        assert!(entries.get_allocation_info("pod-big", "main").unwrap().isolated);
        assert!(!entries.get_allocation_info("pod-web", "main").unwrap().isolated);
    }

    #[tokio::test]
    async fn test_invalid_config_aborts_period() {
        let advisor = advisor(IsolationConfiguration {
            isolated_max_ratios: 2.0,
            ..Default::default()
        });

        let err = advisor.run_once(Instant::now()).await.unwrap_err();

        assert!(matches!(err, AdvisorError::InvalidConfig(_)));
        assert!(advisor.latest_snapshot().await.is_none());
        let health = advisor.health().report().await;
        assert!(!health.is_ready());
        assert_eq!(health.failing_steps(), vec![ControlStep::Configuration]);
    }

    #[tokio::test]
    async fn test_missing_topology_fails_reconciliation() {
        let advisor = CpuAdvisorBuilder::new().build().unwrap();

        let err = advisor.run_once(Instant::now()).await.unwrap_err();

        assert_eq!(err, AdvisorError::MissingTopology);
        let health = advisor.health().report().await;
        assert_eq!(health.steps[&ControlStep::Reconciliation].consecutive_failures, 1);
    }

    #[test]
    fn test_builder_rejects_zero_period() {
        let result = CpuAdvisorBuilder::new()
            .control_period(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let advisor = Arc::new(
            CpuAdvisorBuilder::new()
                .topology(Arc::new(CpuTopology::uniform(1, 4)))
                .control_period(Duration::from_millis(10))
                .build()
                .unwrap(),
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(advisor.clone().run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        let snapshot = advisor.latest_snapshot().await.unwrap();
        assert_eq!(snapshot.total, 4);
        assert_eq!(snapshot.headroom, 4.0);
    }
}
