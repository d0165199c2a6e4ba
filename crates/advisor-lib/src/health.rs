//! Health of the advisor control loop
//!
//! Tracks, per fallible step of a control period, whether the last attempt
//! succeeded and how many attempts have failed in a row. A failed step keeps
//! the previous period's results published, so the report distinguishes
//! "stale but serving" from "never produced anything".

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Steps of a control period that can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ControlStep {
    /// Isolation configuration validation
    Configuration,
    /// Machine-state reconciliation
    Reconciliation,
    /// Headroom policy update
    Headroom,
}

impl ControlStep {
    pub const ALL: [ControlStep; 3] = [
        ControlStep::Configuration,
        ControlStep::Reconciliation,
        ControlStep::Headroom,
    ];
}

impl fmt::Display for ControlStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlStep::Configuration => write!(f, "configuration"),
            ControlStep::Reconciliation => write!(f, "reconciliation"),
            ControlStep::Headroom => write!(f, "headroom"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepHealth {
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl StepHealth {
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures == 0
    }
}

/// Point-in-time view of the registry
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub steps: BTreeMap<ControlStep, StepHealth>,
    /// Periods that published a snapshot
    pub completed_periods: u64,
    /// Unix timestamp of the last published snapshot
    pub last_success_timestamp: Option<i64>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.steps.values().all(StepHealth::is_healthy)
    }

    /// Ready once a snapshot has been published
    pub fn is_ready(&self) -> bool {
        self.completed_periods > 0
    }

    /// Steps whose last attempt failed
    pub fn failing_steps(&self) -> Vec<ControlStep> {
        self.steps
            .iter()
            .filter(|(_, health)| !health.is_healthy())
            .map(|(step, _)| *step)
            .collect()
    }
}

/// Shared record of control-loop health
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    report: Arc<RwLock<HealthReport>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        let steps = ControlStep::ALL
            .iter()
            .map(|step| (*step, StepHealth::default()))
            .collect();
        Self {
            report: Arc::new(RwLock::new(HealthReport {
                steps,
                completed_periods: 0,
                last_success_timestamp: None,
            })),
        }
    }

    /// Record a failed step, returning its consecutive failure count
    pub async fn record_failure(&self, step: ControlStep, error: impl Into<String>) -> u32 {
        let mut report = self.report.write().await;
        let health = report.steps.entry(step).or_default();
        health.consecutive_failures += 1;
        health.last_error = Some(error.into());
        health.consecutive_failures
    }

    /// Record a period that published a snapshot; every step succeeded
    pub async fn record_period_completed(&self, timestamp: i64) {
        let mut report = self.report.write().await;
        for health in report.steps.values_mut() {
            *health = StepHealth::default();
        }
        report.completed_periods += 1;
        report.last_success_timestamp = Some(timestamp);
    }

    pub async fn report(&self) -> HealthReport {
        self.report.read().await.clone()
    }
}
