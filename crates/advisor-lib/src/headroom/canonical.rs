//! Canonical headroom policy: total capacity minus the shared cpuset requirement

use super::{ControlKnob, ControlKnobName, HeadroomPolicy, HeadroomPolicyName, PolicyBase};
use crate::error::Result;

pub struct PolicyCanonical {
    base: PolicyBase,
    headroom_value: f64,
}

impl PolicyCanonical {
    pub fn new(total: usize) -> Self {
        Self {
            base: PolicyBase::new(total),
            headroom_value: 0.0,
        }
    }
}

impl HeadroomPolicy for PolicyCanonical {
    fn name(&self) -> HeadroomPolicyName {
        HeadroomPolicyName::Canonical
    }

    fn set_total(&mut self, total: usize) {
        self.base.set_total(total);
    }

    fn set_control_knob_value(&mut self, knob: ControlKnob) {
        self.base.set_control_knob_value(knob);
    }

    fn update(&mut self) -> Result<()> {
        let cpu_requirement = self.base.knob(ControlKnobName::SharedCpuSetSize)?;
        self.headroom_value = self.base.total as f64 - cpu_requirement;
        Ok(())
    }

    fn get_headroom(&self) -> Result<f64> {
        Ok(self.headroom_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdvisorError;
    use crate::headroom::ControlKnobValue;

    fn knob(value: f64) -> ControlKnob {
        let mut knob = ControlKnob::new();
        knob.insert(ControlKnobName::SharedCpuSetSize, ControlKnobValue { value });
        knob
    }

    #[test]
    fn test_headroom_is_total_minus_requirement() {
        let mut policy = PolicyCanonical::new(32);
        policy.set_control_knob_value(knob(20.0));

        policy.update().unwrap();

        assert_eq!(policy.get_headroom().unwrap(), 12.0);
    }

    #[test]
    fn test_headroom_before_update_is_zero() {
        let policy = PolicyCanonical::new(32);
        assert_eq!(policy.get_headroom().unwrap(), 0.0);
    }

    #[test]
    fn test_missing_knob_keeps_previous_value() {
        let mut policy = PolicyCanonical::new(32);
        policy.set_control_knob_value(knob(8.0));
        policy.update().unwrap();

        let mut other = ControlKnob::new();
        other.insert(ControlKnobName::ReclaimedCpuSetSize, ControlKnobValue { value: 4.0 });
        policy.set_control_knob_value(other);

        let err = policy.update().unwrap_err();
        assert!(matches!(err, AdvisorError::MissingControlKnob(_)));
        assert_eq!(policy.get_headroom().unwrap(), 24.0);
    }

    #[test]
    fn test_total_change_applies_on_next_update() {
        let mut policy = PolicyCanonical::new(32);
        policy.set_control_knob_value(knob(20.0));
        policy.update().unwrap();

        policy.set_total(48);
        assert_eq!(policy.get_headroom().unwrap(), 12.0);
        policy.update().unwrap();
        assert_eq!(policy.get_headroom().unwrap(), 28.0);
    }
}
