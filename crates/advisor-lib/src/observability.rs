//! Structured event logging for the advisor
//!
//! Every significant engine event is logged through `tracing` with an
//! `event` field so the JSON output can be filtered by event type.

use crate::health::{ControlStep, HealthReport};
use crate::isolation::IsolationTransition;
use crate::state::MachineState;
use tracing::{info, warn};

/// Structured logger for advisor events
#[derive(Debug, Clone)]
pub struct AdvisorLogger {
    node_name: String,
}

impl AdvisorLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_startup(&self, version: &str, numa_nodes: usize, cpus: usize) {
        info!(
            event = "advisor_started",
            node = %self.node_name,
            advisor_version = %version,
            numa_nodes = numa_nodes,
            cpus = cpus,
            "CPU advisor started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "advisor_shutdown",
            node = %self.node_name,
            reason = %reason,
            "CPU advisor shutting down"
        );
    }

    pub fn log_machine_state(&self, state: &MachineState) {
        for (numa, node) in state.iter() {
            info!(
                event = "machine_state_reconciled",
                node = %self.node_name,
                numa_node = *numa,
                allocated = %node.allocated_cpuset,
                default = %node.default_cpuset,
                containers = node.pod_entries.containers().count(),
                "Reconciled NUMA node state"
            );
        }
    }

    pub fn log_isolation_transition(&self, transition: &IsolationTransition) {
        info!(
            event = "isolation_transition",
            node = %self.node_name,
            pod_uid = %transition.key.pod_uid,
            container = %transition.key.container_name,
            from = ?transition.from,
            to = ?transition.to,
            "Isolation state changed"
        );
    }

    pub fn log_headroom(&self, headroom: f64, total: usize) {
        info!(
            event = "headroom_updated",
            node = %self.node_name,
            headroom = headroom,
            total = total,
            "Updated CPU headroom"
        );
    }

    /// Log a failed step; the previous cycle's results stay in place
    pub fn log_cycle_failure(&self, step: ControlStep, error: &str, consecutive_failures: u32) {
        warn!(
            event = "cycle_failed",
            node = %self.node_name,
            step = %step,
            error = %error,
            consecutive_failures = consecutive_failures,
            "Control period step failed, keeping previous results"
        );
    }

    pub fn log_health(&self, report: &HealthReport) {
        let failing: Vec<String> = report.failing_steps().iter().map(ToString::to_string).collect();
        info!(
            event = "advisor_health",
            node = %self.node_name,
            healthy = report.is_healthy(),
            ready = report.is_ready(),
            completed_periods = report.completed_periods,
            last_success_timestamp = ?report.last_success_timestamp,
            failing_steps = ?failing,
            "CPU advisor health"
        );
    }
}
