//! CPU Advisor - node-local CPU allocation state and headroom engine
//!
//! This binary runs on each Kubernetes node, following the allocation table
//! written by the CPU plugin and publishing isolation verdicts and CPU
//! headroom every control period.

use advisor_lib::{
    headroom::new_headroom_policy,
    health::HealthRegistry,
    machine::{StaticTopologyProvider, SysfsTopologyProvider},
    observability::AdvisorLogger,
    state::{load_pod_entries, PodEntries},
    CpuAdvisor, CpuAdvisorBuilder, CpuTopology, TopologyProvider,
};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const ADVISOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting cpu-advisor");

    let config = config::AdvisorConfig::load()?;
    info!(node_name = %config.node_name, "Advisor configured");

    let topology = Arc::new(resolve_topology(&config).await?);

    let logger = AdvisorLogger::new(&config.node_name);
    logger.log_startup(ADVISOR_VERSION, topology.num_numa_nodes(), topology.num_cpus());

    let health_registry = HealthRegistry::new();

    let pod_entries = match load_pod_entries(&config.allocation_state_file, &topology).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "Starting with an empty allocation table");
            PodEntries::new()
        }
    };

    let advisor = Arc::new(
        CpuAdvisorBuilder::new()
            .topology(topology.clone())
            .pod_entries(Arc::new(RwLock::new(pod_entries)))
            .isolation_config(Arc::new(RwLock::new(config.isolation.clone())))
            // the allocatable total is set at the start of every period
            .headroom_policy(new_headroom_policy(&config.headroom_policy, 0)?)
            .reserved_cpus(config.reserved_cpuset()?)
            .control_period(config.control_period())
            .health(health_registry.clone())
            .logger(logger.clone())
            .build()?,
    );

    let (shutdown_tx, _) = broadcast::channel(1);

    let reload_handle = tokio::spawn(reload_allocation_state(
        advisor.clone(),
        topology,
        config.allocation_state_file.clone(),
        config.control_period(),
        shutdown_tx.subscribe(),
    ));
    let loop_handle = tokio::spawn(advisor.run(shutdown_tx.subscribe()));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    let _ = shutdown_tx.send(());
    let _ = tokio::join!(reload_handle, loop_handle);
    logger.log_health(&health_registry.report().await);

    info!("Shutting down");
    Ok(())
}

/// Topology from the configured JSON file, or discovered from sysfs
async fn resolve_topology(config: &config::AdvisorConfig) -> Result<CpuTopology> {
    let provider: Box<dyn TopologyProvider> = match &config.topology_file {
        Some(path) => Box::new(StaticTopologyProvider::from_file(path).await?),
        None => Box::new(SysfsTopologyProvider::new(config.sysfs_root.clone())),
    };
    provider.topology().await
}

/// Reload the allocation table written by the CPU plugin once per period.
///
/// A failed read keeps the previous table.
async fn reload_allocation_state(
    advisor: Arc<CpuAdvisor>,
    topology: Arc<CpuTopology>,
    path: PathBuf,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    // the initial load already happened at startup
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match load_pod_entries(&path, &topology).await {
                    Ok(entries) => advisor.replace_pod_entries(entries).await,
                    Err(e) => warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to reload allocation state"
                    ),
                }
            }
            _ = shutdown.recv() => {
                info!("Shutting down allocation state reload");
                break;
            }
        }
    }
}
