//! CPU isolation configuration

use crate::error::{AdvisorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Thresholds and hysteresis settings for CPU isolation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationConfiguration {
    /// Fraction of the owner pool a container's quantity must reach to
    /// qualify for isolation; 0 disables the ratio trigger
    #[serde(default)]
    pub isolation_cpu_ratio: f32,

    /// Absolute core count a container's quantity must reach to qualify;
    /// 0 disables the size trigger
    #[serde(default)]
    pub isolation_cpu_size: u32,

    /// Max fraction of a pool that may be isolated, for pools without an
    /// entry in `isolated_max_pool_ratios`
    #[serde(default = "default_isolated_max_ratios")]
    pub isolated_max_ratios: f32,

    /// Per-pool max isolated fraction
    #[serde(default)]
    pub isolated_max_pool_ratios: BTreeMap<String, f32>,

    /// Consecutive qualifying periods required before isolating
    #[serde(default = "default_lock_in_threshold")]
    pub isolation_lock_in_threshold: u32,

    /// Seconds a released container must wait before it may be isolated again
    #[serde(default = "default_lock_out_period_secs")]
    pub isolation_lock_out_period_secs: u64,

    #[serde(default)]
    pub isolation_disabled: bool,

    #[serde(default)]
    pub isolation_disabled_pools: BTreeSet<String>,
}

fn default_isolated_max_ratios() -> f32 {
    0.2
}

fn default_lock_in_threshold() -> u32 {
    3
}

fn default_lock_out_period_secs() -> u64 {
    120
}

impl Default for IsolationConfiguration {
    fn default() -> Self {
        Self {
            isolation_cpu_ratio: 0.0,
            isolation_cpu_size: 0,
            isolated_max_ratios: default_isolated_max_ratios(),
            isolated_max_pool_ratios: BTreeMap::new(),
            isolation_lock_in_threshold: default_lock_in_threshold(),
            isolation_lock_out_period_secs: default_lock_out_period_secs(),
            isolation_disabled: false,
            isolation_disabled_pools: BTreeSet::new(),
        }
    }
}

impl IsolationConfiguration {
    /// Check ratios are fractions and the lock-in threshold is positive
    pub fn validate(&self) -> Result<()> {
        check_ratio("isolation_cpu_ratio", self.isolation_cpu_ratio)?;
        check_ratio("isolated_max_ratios", self.isolated_max_ratios)?;
        for (pool, ratio) in &self.isolated_max_pool_ratios {
            check_ratio(&format!("isolated_max_pool_ratios[{}]", pool), *ratio)?;
        }

        if self.isolation_lock_in_threshold == 0 {
            return Err(AdvisorError::InvalidConfig(
                "isolation_lock_in_threshold must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Max isolated fraction for `pool_name`
    pub fn max_ratio_for_pool(&self, pool_name: &str) -> f32 {
        self.isolated_max_pool_ratios
            .get(pool_name)
            .copied()
            .unwrap_or(self.isolated_max_ratios)
    }

    /// Whether isolation is switched off for `pool_name`, globally or per pool
    pub fn is_pool_disabled(&self, pool_name: &str) -> bool {
        self.isolation_disabled || self.isolation_disabled_pools.contains(pool_name)
    }

    pub fn lock_out_period(&self) -> Duration {
        Duration::from_secs(self.isolation_lock_out_period_secs)
    }

    /// Whether `quantity` cores out of a `pool_size`-core pool crosses either trigger
    pub fn crosses_threshold(&self, quantity: usize, pool_size: usize) -> bool {
        if quantity == 0 {
            return false;
        }

        let size_crossed = self.isolation_cpu_size > 0 && quantity >= self.isolation_cpu_size as usize;
        let ratio_crossed = self.isolation_cpu_ratio > 0.0
            && pool_size > 0
            && quantity as f64 / pool_size as f64 >= self.isolation_cpu_ratio as f64;

        size_crossed || ratio_crossed
    }
}

fn check_ratio(field: &str, ratio: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&ratio) {
        return Err(AdvisorError::InvalidConfig(format!(
            "{} must be within [0, 1], got {}",
            field, ratio
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = IsolationConfiguration::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lock_out_period(), Duration::from_secs(120));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: IsolationConfiguration =
            serde_json::from_str(r#"{"isolation_cpu_size": 4, "isolation_disabled_pools": ["reclaim"]}"#)
                .unwrap();

        assert_eq!(config.isolation_cpu_size, 4);
        assert_eq!(config.isolation_lock_in_threshold, 3);
        assert!(config.is_pool_disabled("reclaim"));
        assert!(!config.is_pool_disabled("share"));
    }

    #[test]
    fn test_validate_rejects_bad_ratios() {
        let mut config = IsolationConfiguration {
            isolated_max_ratios: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AdvisorError::InvalidConfig(_))));

        config.isolated_max_ratios = 0.5;
        config.isolated_max_pool_ratios.insert("share".to_string(), -0.1);
        assert!(config.validate().is_err());

        config.isolated_max_pool_ratios.clear();
        config.isolation_lock_in_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_ratio_for_pool_falls_back_to_global() {
        let mut config = IsolationConfiguration::default();
        config.isolated_max_pool_ratios.insert("share".to_string(), 0.5);

        assert_eq!(config.max_ratio_for_pool("share"), 0.5);
        assert_eq!(config.max_ratio_for_pool("batch"), 0.2);
    }

    #[test]
    fn test_global_disable_covers_every_pool() {
        let config = IsolationConfiguration {
            isolation_disabled: true,
            ..Default::default()
        };
        assert!(config.is_pool_disabled("share"));
    }

    #[test]
    fn test_crosses_threshold() {
        let config = IsolationConfiguration {
            isolation_cpu_ratio: 0.25,
            isolation_cpu_size: 6,
            ..Default::default()
        };

        assert!(config.crosses_threshold(6, 100));
        assert!(config.crosses_threshold(4, 16));
        assert!(!config.crosses_threshold(3, 16));
        // the ratio trigger needs a known pool size
        assert!(!config.crosses_threshold(4, 0));
        assert!(!config.crosses_threshold(0, 16));

        let unset = IsolationConfiguration::default();
        assert!(!unset.crosses_threshold(64, 64));
    }
}
