//! Headroom policies
//!
//! A headroom policy turns the control knobs produced by the sizing
//! computation into a single scalar of spare allocatable CPU capacity.
//! All policies share the two-step contract: `update` recomputes from the
//! current knob snapshot, `get_headroom` returns the cached result.

mod canonical;

pub use canonical::PolicyCanonical;

use crate::error::{AdvisorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Control knobs understood by headroom policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ControlKnobName {
    /// Cores required by the shared cpuset
    #[serde(rename = "shared_cpuset_size")]
    SharedCpuSetSize,
    /// Cores handed to reclaimed workloads
    #[serde(rename = "reclaimed_cpuset_size")]
    ReclaimedCpuSetSize,
}

impl fmt::Display for ControlKnobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlKnobName::SharedCpuSetSize => write!(f, "shared_cpuset_size"),
            ControlKnobName::ReclaimedCpuSetSize => write!(f, "reclaimed_cpuset_size"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlKnobValue {
    pub value: f64,
}

/// Snapshot of control knob values
pub type ControlKnob = BTreeMap<ControlKnobName, ControlKnobValue>;

/// Fields shared by every headroom policy
#[derive(Debug, Clone, Default)]
pub struct PolicyBase {
    /// Total allocatable cores
    pub total: usize,
    pub control_knob_value: ControlKnob,
}

impl PolicyBase {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            control_knob_value: ControlKnob::new(),
        }
    }

    pub fn set_total(&mut self, total: usize) {
        self.total = total;
    }

    pub fn set_control_knob_value(&mut self, knob: ControlKnob) {
        self.control_knob_value = knob;
    }

    /// Value of a knob in the current snapshot
    pub fn knob(&self, name: ControlKnobName) -> Result<f64> {
        self.control_knob_value
            .get(&name)
            .map(|knob| knob.value)
            .ok_or_else(|| AdvisorError::MissingControlKnob(name.to_string()))
    }
}

/// Strategy computing CPU headroom from control knobs
pub trait HeadroomPolicy: Send + Sync {
    fn name(&self) -> HeadroomPolicyName;

    fn set_total(&mut self, total: usize);

    /// Replace the knob snapshot used by the next `update`
    fn set_control_knob_value(&mut self, knob: ControlKnob);

    /// Recompute headroom; on error the previous value is kept
    fn update(&mut self) -> Result<()>;

    /// Last computed headroom.
    ///
    /// Before the first successful `update` this is `0.0`, which means "not
    /// yet computed" rather than "no spare capacity".
    fn get_headroom(&self) -> Result<f64>;
}

/// Registered headroom policies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadroomPolicyName {
    #[default]
    Canonical,
}

impl fmt::Display for HeadroomPolicyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeadroomPolicyName::Canonical => write!(f, "canonical"),
        }
    }
}

impl FromStr for HeadroomPolicyName {
    type Err = AdvisorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "canonical" => Ok(HeadroomPolicyName::Canonical),
            other => Err(AdvisorError::UnknownHeadroomPolicy(other.to_string())),
        }
    }
}

/// Build the policy registered under `name`
pub fn new_headroom_policy(name: &str, total: usize) -> Result<Box<dyn HeadroomPolicy>> {
    match name.parse::<HeadroomPolicyName>()? {
        HeadroomPolicyName::Canonical => Ok(Box::new(PolicyCanonical::new(total))),
    }
}
