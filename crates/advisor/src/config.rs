//! Advisor configuration

use advisor_lib::headroom::HeadroomPolicyName;
use advisor_lib::isolation::IsolationConfiguration;
use advisor_lib::CpuSet;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "ADVISOR_CONFIG_FILE";

/// Advisor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdvisorConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Control period in seconds
    #[serde(default = "default_control_period")]
    pub control_period_secs: u64,

    /// Root of the sysfs mount used for topology discovery
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    /// JSON topology overriding sysfs discovery
    #[serde(default)]
    pub topology_file: Option<PathBuf>,

    /// JSON allocation table written by the CPU plugin
    #[serde(default = "default_allocation_state_file")]
    pub allocation_state_file: PathBuf,

    #[serde(default = "default_headroom_policy")]
    pub headroom_policy: String,

    /// CPUs never offered to workloads, in cpu-list format
    #[serde(default)]
    pub reserved_cpus: String,

    #[serde(default)]
    pub isolation: IsolationConfiguration,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_control_period() -> u64 {
    5
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_allocation_state_file() -> PathBuf {
    PathBuf::from("/var/lib/cpu-advisor/allocation_state.json")
}

fn default_headroom_policy() -> String {
    HeadroomPolicyName::default().to_string()
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            control_period_secs: default_control_period(),
            sysfs_root: default_sysfs_root(),
            topology_file: None,
            allocation_state_file: default_allocation_state_file(),
            headroom_policy: default_headroom_policy(),
            reserved_cpus: String::new(),
            isolation: IsolationConfiguration::default(),
        }
    }
}

impl AdvisorConfig {
    /// Load configuration from environment and the optional config file.
    ///
    /// Variables are prefixed `ADVISOR_`; nested fields use `__`, e.g.
    /// `ADVISOR_ISOLATION__ISOLATION_CPU_SIZE=4`.
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
        Self::load_with_file(file.as_deref())
    }

    /// Load configuration from `file` (if any) overlaid with environment variables
    pub fn load_with_file(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("ADVISOR")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("Failed to read advisor configuration")?;

        let config: AdvisorConfig = config
            .try_deserialize()
            .context("Failed to parse advisor configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.control_period_secs == 0 {
            anyhow::bail!("control_period_secs must be positive");
        }
        self.reserved_cpuset()?;
        self.headroom_policy_name()?;
        self.isolation.validate()?;
        Ok(())
    }

    pub fn control_period(&self) -> Duration {
        Duration::from_secs(self.control_period_secs)
    }

    pub fn reserved_cpuset(&self) -> Result<CpuSet> {
        CpuSet::parse(&self.reserved_cpus)
            .with_context(|| format!("Invalid reserved_cpus {:?}", self.reserved_cpus))
    }

    pub fn headroom_policy_name(&self) -> Result<HeadroomPolicyName> {
        Ok(self.headroom_policy.parse()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    fn write_config(contents: serde_json::Value) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(contents.to_string().as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = AdvisorConfig::default();

        assert_eq!(config.control_period(), Duration::from_secs(5));
        assert_eq!(config.sysfs_root, PathBuf::from("/sys"));
        assert_eq!(config.headroom_policy, "canonical");
        assert!(config.reserved_cpuset().unwrap().is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(serde_json::json!({
            "node_name": "node-a",
            "control_period_secs": 10,
            "reserved_cpus": "0-1",
            "topology_file": "/etc/cpu-advisor/topology.json",
            "isolation": {
                "isolation_cpu_size": 4,
                "isolated_max_pool_ratios": { "batch": 0.5 }
            }
        }));

        let config = AdvisorConfig::load_with_file(Some(file.path())).unwrap();

        assert_eq!(config.node_name, "node-a");
        assert_eq!(config.control_period(), Duration::from_secs(10));
        assert_eq!(config.reserved_cpuset().unwrap().to_string(), "0-1");
        assert_eq!(
            config.topology_file,
            Some(PathBuf::from("/etc/cpu-advisor/topology.json"))
        );
        assert_eq!(config.isolation.isolation_cpu_size, 4);
        assert_eq!(config.isolation.max_ratio_for_pool("batch"), 0.5);
        assert_eq!(config.isolation.isolation_lock_in_threshold, 3);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let config = AdvisorConfig {
            control_period_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AdvisorConfig {
            reserved_cpus: "3-1".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AdvisorConfig {
            headroom_policy: "smoothed".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_isolation_ratio_fails_load() {
        let file = write_config(serde_json::json!({
            "isolation": { "isolated_max_ratios": 1.5 }
        }));

        assert!(AdvisorConfig::load_with_file(Some(file.path())).is_err());
    }
}
